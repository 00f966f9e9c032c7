use std::collections::BTreeMap;

use super::Tensor;
use crate::{
    codegen::{Access, CExpr, EmissionContext, FieldShape, Vertex, VertexKind},
    error::{Error, Result},
    expr::Expression,
    ops::ReduceOp,
    runtime::{Binding, Runtime},
    shape::{DistributedShape, FirstDimDistribution},
    typing::Type,
};

// how many partial results one reduction stage leaves per tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    // one per worker, worker `w` takes every W-th element
    Worker,
    // one per tile
    Tile,
}

fn times(e: CExpr, n: usize) -> CExpr {
    if n == 1 { e } else { e * CExpr::uint(n) }
}

fn check_dim(t: &Tensor, dim: usize) -> Result<()> {
    if dim >= t.rank() {
        return Err(Error::InvalidDimension { dim, rank: t.rank() });
    }
    Ok(())
}

/// One reduction kernel. Every tile sees a block `[outer, extent, inner]`
/// of its own elements and folds the middle dimension down to 1 (per tile)
/// or W (per worker) partial results.
fn reduce_stage(rt: &Runtime, input: &Tensor, dim: usize, op: ReduceOp, stage: Stage) -> Result<Tensor> {
    check_dim(input, dim)?;
    let workers = rt.topology().workers_per_partition;
    let k = match stage {
        Stage::Worker => workers,
        Stage::Tile => 1,
    };
    let ty = op.result_type(input.ty());
    let shape = input.shape();
    let global = shape.global_shape();
    let out_shape = if dim == 0 {
        let dist: FirstDimDistribution = shape.tiles().map(|t| (t, k)).collect();
        DistributedShape::on_tiles(global.with_dim(0, k * dist.count())?, dist)?
    } else {
        shape.with_trailing(global.with_dim(dim, k)?)?
    };
    let out = Tensor::uninitialized(rt, ty, out_shape)?;

    let mut vertex = Vertex::new(match stage {
        Stage::Worker => VertexKind::MultiVertex,
        Stage::Tile => VertexKind::Vertex,
    });
    let src = vertex.add_field("in0", input.ty(), Access::Input, FieldShape::Vector);
    let dst = vertex.add_field("out", ty, Access::Output, FieldShape::Vector);
    let rows = vertex.add_field("numRows", Type::Uint32, Access::Input, FieldShape::Param);

    let inner = global.stride(dim);
    let middle: usize = global.dims()[1..dim.max(1)].iter().product();
    let args: &[Type] = match stage {
        Stage::Worker => &[Type::Uint32],
        Stage::Tile => &[],
    };
    let mut cx = EmissionContext::new();
    let compute = cx.compute(args, |cx, args| {
        let worker = args.first().map(|w| CExpr::from(*w)).unwrap_or_else(|| CExpr::uint(0));
        let (outer, extent) = if dim == 0 {
            (CExpr::uint(1), CExpr::Param(rows))
        } else {
            (times(CExpr::Param(rows), middle), CExpr::uint(global.dim(dim)))
        };
        let outer = cx.declare(Type::Uint32, outer);
        let extent = cx.declare(Type::Uint32, extent);
        cx.for_range(CExpr::uint(0), outer.into(), CExpr::uint(1), |cx, o| {
            cx.for_range(CExpr::uint(0), CExpr::uint(inner), CExpr::uint(1), |cx, i| {
                let acc = cx.declare(ty, CExpr::lit(op.identity(ty), ty));
                cx.for_range(worker.clone(), extent.into(), CExpr::uint(k), |cx, e| {
                    let at = times(CExpr::from(o) * CExpr::from(extent) + CExpr::from(e), inner) + CExpr::from(i);
                    let x = CExpr::load(src, at).cast(ty);
                    let x = match op {
                        ReduceOp::SquareAdd => x.clone() * x,
                        _ => x,
                    };
                    let folded = CExpr::Binary { op: op.combiner(), ty, lhs: Box::new(acc.into()), rhs: Box::new(x) };
                    cx.assign(acc, folded);
                    Ok(())
                })?;
                let at = times(times(CExpr::from(o), k) + worker.clone(), inner) + CExpr::from(i);
                cx.store(dst, at, acc.into());
                Ok(())
            })
        })
    })?;
    vertex.functions.push(compute);

    let kernel = rt.kernel(vertex)?;
    let rows_per_tile: BTreeMap<usize, f64> =
        input.shape().distribution().iter_nonzero().map(|(t, r)| (t, r as f64)).collect();
    let tiles: Vec<usize> = input.shape().tiles().collect();
    tracing::debug!(vertex = %kernel.name, dim, op = op.name(), ?stage, "reduction stage");
    rt.execute(&kernel, &[Binding::Sliced(input), Binding::Sliced(&out), Binding::PerTile(rows_per_tile)], &tiles)?;
    Ok(out)
}

impl Tensor {
    /// Reduce dimension `dim` down to extent 1.
    ///
    /// The rank is kept. Along the leading dimension the partial results
    /// are combined per worker, per tile, per unit and finally on tile 0.
    #[tracing::instrument(skip(self, rt))]
    pub fn reduce(&self, rt: &Runtime, dim: usize, op: ReduceOp) -> Result<Tensor> {
        check_dim(self, dim)?;
        if self.dim(dim) == 1 {
            return Ok(self.clone());
        }
        let topology = *rt.topology();
        let mut op = op;
        let mut t = self.clone();
        if dim != 0 {
            if t.dim(dim) > topology.workers_per_partition {
                t = t.reduce_per_worker(rt, dim, op)?;
                op = op.downgraded();
            }
            return t.reduce_per_tile(rt, dim, op);
        }

        if t.shape().distribution().max_value() > topology.workers_per_partition {
            t = t.reduce_per_worker(rt, 0, op)?;
            op = op.downgraded();
        }
        t = t.reduce_per_tile(rt, 0, op)?;
        op = op.downgraded();
        let unit_of = |tile: usize| tile / topology.partitions_per_unit;
        let dist = t.shape().distribution();
        if dist.min_key().map(unit_of) != dist.max_key().map(unit_of) {
            t = t.reduce_grouped(rt, topology.partitions_per_unit, op)?;
        }
        let on_tile_zero = t.dim(0) == 1 && t.shape().distribution().get(0) == 1;
        if !on_tile_zero {
            t = t.reduce_grouped(rt, topology.num_partitions(), op)?;
        }
        Ok(t)
    }

    /// Fold dimension `dim` into one partial result per worker.
    pub fn reduce_per_worker(&self, rt: &Runtime, dim: usize, op: ReduceOp) -> Result<Tensor> {
        reduce_stage(rt, self, dim, op, Stage::Worker)
    }

    /// Fold dimension `dim` into one result per tile.
    pub fn reduce_per_tile(&self, rt: &Runtime, dim: usize, op: ReduceOp) -> Result<Tensor> {
        reduce_stage(rt, self, dim, op, Stage::Tile)
    }

    /// Reduce the leading dimension within groups of `group_size`
    /// consecutive tiles, landing on the first tile of each group.
    pub fn reduce_grouped(&self, rt: &Runtime, group_size: usize, op: ReduceOp) -> Result<Tensor> {
        let mut op = op;
        let mut t = self.clone();
        if t.shape().distribution().max_value() > 1 {
            t = t.reduce_per_tile(rt, 0, op)?;
            op = op.downgraded();
        }
        let grouped = t.shape().group_first_dimension(group_size);
        t.rearrange(rt, grouped)?.reduce_per_tile(rt, 0, op)
    }
}

impl Expression {
    pub fn reduce(&self, rt: &Runtime, dim: usize, op: ReduceOp) -> Result<Tensor> {
        self.materialize_if_necessary(rt)?.reduce(rt, dim, op)
    }
    pub fn reduce_per_worker(&self, rt: &Runtime, dim: usize, op: ReduceOp) -> Result<Tensor> {
        self.materialize_if_necessary(rt)?.reduce_per_worker(rt, dim, op)
    }
    pub fn reduce_per_tile(&self, rt: &Runtime, dim: usize, op: ReduceOp) -> Result<Tensor> {
        self.materialize_if_necessary(rt)?.reduce_per_tile(rt, dim, op)
    }
    pub fn reduce_grouped(&self, rt: &Runtime, group_size: usize, op: ReduceOp) -> Result<Tensor> {
        self.materialize_if_necessary(rt)?.reduce_grouped(rt, group_size, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        shape::TensorShape,
        tensor::tests::{runtime, runtime_with, shape},
    };

    fn iota(n: usize) -> Vec<f32> {
        (0..n).map(|v| v as f32).collect()
    }

    #[test]
    fn sum_of_squares_along_rows() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let values: Vec<f32> = (0..4).flat_map(|i| [i as f32 + 1.0, i as f32 + 2.0, i as f32 + 3.0]).collect();
        let t = Tensor::from_values(&rt, shape(&[4, 3], 2), &values).unwrap();
        let r = t.reduce(&rt, 1, ReduceOp::SquareAdd).unwrap();
        assert_eq!(r.shape().global_shape().dims(), &[4, 1]);
        assert_eq!(r.shape().distribution(), t.shape().distribution());
        assert_eq!(r.to_vec::<f32>(&rt).unwrap(), vec![14.0, 29.0, 50.0, 77.0]);

        let r = (&t * &t).unwrap().reduce(&rt, 1, ReduceOp::Add).unwrap();
        assert_eq!(r.to_vec::<f32>(&rt).unwrap(), vec![14.0, 29.0, 50.0, 77.0]);
    }

    #[test]
    fn wide_rows_go_through_workers_first() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let t = Tensor::from_values(&rt, shape(&[8, 8], 4), &iota(64)).unwrap();
        let r = t.reduce(&rt, 1, ReduceOp::Add).unwrap();
        assert_eq!(r.shape(), &shape(&[8, 1], 4));
        assert_eq!(r.to_vec::<f32>(&rt).unwrap(), vec![28.0, 92.0, 156.0, 220.0, 284.0, 348.0, 412.0, 476.0]);
    }

    #[test]
    fn leading_dimension_lands_on_tile_zero() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let t = Tensor::from_values(&rt, shape(&[8, 2], 4), &iota(16)).unwrap();
        let r = t.reduce(&rt, 0, ReduceOp::Add).unwrap();
        let expected = DistributedShape::on_single_tile(TensorShape::new([1, 2]).unwrap(), 0);
        assert_eq!(r.shape(), &expected);
        assert_eq!(r.to_vec::<f32>(&rt).unwrap(), vec![56.0, 64.0]);
    }

    #[test]
    fn leading_dimension_across_units() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime_with(&dir, 2);
        let dist = [(0, 2), (1000, 2), (1472, 2), (2472, 2)].into();
        let s = DistributedShape::on_tiles(TensorShape::new([8, 2]).unwrap(), dist).unwrap();
        let t = Tensor::from_values(&rt, s, &iota(16)).unwrap();
        let r = t.reduce(&rt, 0, ReduceOp::Add).unwrap();
        assert_eq!(r.shape(), &DistributedShape::on_single_tile(TensorShape::new([1, 2]).unwrap(), 0));
        assert_eq!(r.to_vec::<f32>(&rt).unwrap(), vec![56.0, 64.0]);
    }

    #[test]
    fn sparse_distribution_across_units() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime_with(&dir, 2);
        // an empty entry and tiles in both units
        let dist = [(1472, 3), (1480, 9), (2000, 0), (2900, 20)].into();
        let s = DistributedShape::on_tiles(TensorShape::new([32]).unwrap(), dist).unwrap();
        let t = Tensor::from_values(&rt, s, &iota(32)).unwrap();
        let r = t.reduce(&rt, 0, ReduceOp::SquareAdd).unwrap();
        assert_eq!(r.shape(), &DistributedShape::on_single_tile(TensorShape::new([1]).unwrap(), 0));
        assert_eq!(r.to_scalar::<f32>(&rt).unwrap(), 10416.0);
    }

    #[test]
    fn every_dimension_of_a_rank_three_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        // element (i, j, k) holds 24i + 8j + k
        let t = Tensor::from_values(&rt, shape(&[2, 3, 8], 2), &iota(48)).unwrap();

        let r = t.reduce(&rt, 1, ReduceOp::Add).unwrap();
        assert_eq!(r.shape().global_shape().dims(), &[2, 1, 8]);
        assert_eq!(r.shape().distribution(), t.shape().distribution());
        let expected: Vec<f32> = (0..2).flat_map(|i| (0..8).map(move |k| (72 * i + 3 * k + 24) as f32)).collect();
        assert_eq!(r.to_vec::<f32>(&rt).unwrap(), expected);

        let r = t.reduce(&rt, 2, ReduceOp::Add).unwrap();
        assert_eq!(r.shape().global_shape().dims(), &[2, 3, 1]);
        assert_eq!(r.to_vec::<f32>(&rt).unwrap(), vec![28.0, 92.0, 156.0, 220.0, 284.0, 348.0]);

        let r = t.reduce(&rt, 0, ReduceOp::Add).unwrap();
        assert_eq!(r.shape(), &DistributedShape::on_single_tile(TensorShape::new([1, 3, 8]).unwrap(), 0));
        let expected: Vec<f32> = (0..3).flat_map(|j| (0..8).map(move |k| (16 * j + 2 * k + 24) as f32)).collect();
        assert_eq!(r.to_vec::<f32>(&rt).unwrap(), expected);
    }

    #[test]
    fn grouped_tiles_reduce_together() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let values: Vec<f32> = (1..=8).map(|v| v as f32).collect();
        let t = Tensor::from_values(&rt, shape(&[8], 4), &values).unwrap();
        let r = t.reduce_grouped(&rt, 2, ReduceOp::Add).unwrap();
        assert_eq!(r.to_vec::<f32>(&rt).unwrap(), vec![10.0, 26.0]);
    }

    #[test]
    fn idle_workers_contribute_the_identity() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let t = Tensor::from_values(&rt, shape(&[4], 1), &[7, -3, 12, 5i32]).unwrap();
        let partial = t.reduce_per_worker(&rt, 0, ReduceOp::Min).unwrap();
        assert_eq!(partial.to_vec::<i32>(&rt).unwrap(), vec![7, -3, 12, 5, i32::MAX, i32::MAX]);
        let r = partial.reduce_per_tile(&rt, 0, ReduceOp::Min).unwrap();
        assert_eq!(r.to_scalar::<i32>(&rt).unwrap(), -3);
    }

    #[test]
    fn long_tiles_and_other_operators() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let values: Vec<f32> = (0..20).map(|v| ((v * 7) % 20) as f32 - 4.0).collect();
        let t = Tensor::from_values(&rt, shape(&[20], 1), &values).unwrap();
        assert_eq!(t.reduce(&rt, 0, ReduceOp::Max).unwrap().to_scalar::<f32>(&rt).unwrap(), 15.0);
        assert_eq!(t.reduce(&rt, 0, ReduceOp::Min).unwrap().to_scalar::<f32>(&rt).unwrap(), -4.0);
        // squares only apply to the original elements
        let expected: f32 = values.iter().map(|v| v * v).sum();
        assert_eq!(t.reduce(&rt, 0, ReduceOp::SquareAdd).unwrap().to_scalar::<f32>(&rt).unwrap(), expected);

        let positive = t.expr().gt(-10.0f32).unwrap();
        let all = positive.reduce(&rt, 0, ReduceOp::LogicalAnd).unwrap();
        assert_eq!(all.ty(), Type::Bool);
        assert!(all.to_scalar::<bool>(&rt).unwrap());
    }

    #[test]
    fn extent_one_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let t = Tensor::from_values(&rt, shape(&[3, 1], 3), &[1.0f32, 2.0, 3.0]).unwrap();
        let r = t.reduce(&rt, 1, ReduceOp::Add).unwrap();
        assert_eq!(r.id(), t.id());
        assert!(t.reduce(&rt, 2, ReduceOp::Add).is_err());
    }
}
