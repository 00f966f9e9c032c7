use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::Tensor;
use crate::{
    codegen::{lower::Lowering, Access, CExpr, EmissionContext, FieldShape, Var, Vertex, VertexKind},
    error::Result,
    expr::Expression,
    runtime::{Binding, Runtime},
    typing::Type,
};

impl Expression {
    /// Evaluate into a freshly allocated tensor of this expression's shape.
    #[tracing::instrument(skip_all, fields(expr = %self))]
    pub fn materialize(&self, rt: &Runtime) -> Result<Tensor> {
        let out = Tensor::uninitialized(rt, self.ty(), self.shape().clone())?;
        run_kernel(rt, self, &out)?;
        Ok(out)
    }

    /// Evaluate into `dest`. A differing type or a smaller shape is cast or
    /// broadcast with a warning.
    pub fn materialize_into(&self, rt: &Runtime, dest: &Tensor) -> Result<()> {
        let mut expr = self.clone();
        if expr.ty() != dest.ty() {
            tracing::warn!(from = %expr.ty(), to = %dest.ty(), "implicit cast on assignment");
            expr = expr.cast(dest.ty());
        }
        if expr.shape() != dest.shape() {
            tracing::warn!(from = %expr.shape(), to = %dest.shape(), "implicit broadcast on assignment");
            expr = expr.broadcast(dest.shape())?;
        }
        if expr.inputs().iter().any(|t| t.id() == dest.id()) {
            // reading and writing the same buffer in one pass is only safe
            // element for element, evaluate aside and copy back
            let tmp = expr.materialize(rt)?;
            return dest.copy_from(rt, &tmp, &[crate::runtime::CopyBlock { src: 0, dst: 0, len: dest.num_elements() }]);
        }
        run_kernel(rt, &expr, dest)
    }

    /// The backing tensor of a bare input, otherwise a new tensor.
    pub fn materialize_if_necessary(&self, rt: &Runtime) -> Result<Tensor> {
        match self.as_tensor() {
            Some(t) => Ok(t.clone()),
            None => self.materialize(rt),
        }
    }
}

// the multi-index of tile-local element `q` in a block with extents `dims`
fn unflatten(cx: &mut EmissionContext, q: Var, dims: &[usize]) -> Vec<CExpr> {
    (0..dims.len())
        .map(|k| {
            if dims[k] == 1 {
                return CExpr::uint(0);
            }
            let stride: usize = dims[k + 1..].iter().product();
            let mut at = if stride == 1 { CExpr::from(q) } else { CExpr::from(q) / CExpr::uint(stride) };
            if k > 0 {
                at = at % CExpr::uint(dims[k]);
            }
            CExpr::Var(cx.declare(Type::Uint32, at))
        })
        .collect()
}

/// Inputs of the output's rank are cut into tile-local slices, unless their
/// leading extent is 1. Everything else is read whole on every tile.
fn is_sliced(input: &Tensor, out: &Tensor) -> bool {
    input.rank() == out.rank() && input.dim(0) != 1
}

fn run_kernel(rt: &Runtime, expr: &Expression, out: &Tensor) -> Result<()> {
    let inputs = expr.inputs();
    let workers = rt.topology().workers_per_partition;
    let multi = out.num_elements() > workers;
    let mut vertex = Vertex::new(if multi { VertexKind::MultiVertex } else { VertexKind::Vertex });

    let mut fields = HashMap::new();
    let mut bindings = Vec::with_capacity(inputs.len() + 2);
    let mut tiles: BTreeSet<usize> = out.shape().tiles().collect();
    for (k, t) in inputs.iter().enumerate() {
        let field = vertex.add_field(format!("in{k}"), t.ty(), Access::Input, FieldShape::Vector);
        fields.insert(t.id(), field);
        if is_sliced(t, out) {
            tiles.extend(t.shape().tiles());
            bindings.push(Binding::Sliced(t));
        } else {
            bindings.push(Binding::Whole(t));
        }
    }
    let out_field = vertex.add_field("out", out.ty(), Access::Output, FieldShape::Vector);
    bindings.push(Binding::Sliced(out));
    let rows = vertex.add_field("numRows", Type::Uint32, Access::Input, FieldShape::Param);
    let rows_per_tile: BTreeMap<usize, f64> =
        out.shape().distribution().iter_nonzero().map(|(t, r)| (t, r as f64)).collect();
    bindings.push(Binding::PerTile(rows_per_tile));

    let lowering = Lowering::new(expr, fields);
    let dims = out.shape().global_shape().dims().to_vec();
    let inner = out.shape().global_shape().stride(0);
    // keep worker chunks on 8 byte boundaries
    let align = (8 / out.ty().size().max(1)).max(1);
    let args: &[Type] = if multi { &[Type::Uint32] } else { &[] };

    let mut cx = EmissionContext::new();
    let compute = cx.compute(args, |cx, args| {
        let total = cx.declare(Type::Uint32, CExpr::Param(rows) * CExpr::uint(inner));
        let (begin, end) = match args.first() {
            Some(worker) => {
                let per_worker = (CExpr::from(total) + CExpr::uint(workers - 1)) / CExpr::uint(workers);
                let chunk = cx.declare(
                    Type::Uint32,
                    (per_worker + CExpr::uint(align - 1)) / CExpr::uint(align) * CExpr::uint(align),
                );
                let begin = cx.declare(Type::Uint32, (CExpr::from(*worker) * CExpr::from(chunk)).min(total.into()));
                let end = cx.declare(Type::Uint32, (CExpr::from(begin) + CExpr::from(chunk)).min(total.into()));
                (CExpr::from(begin), CExpr::from(end))
            }
            None => (CExpr::uint(0), CExpr::from(total)),
        };
        cx.for_range(begin, end, CExpr::uint(1), |cx, q| {
            let idx = unflatten(cx, q, &dims);
            let value = lowering.gen(cx, expr.root(), &idx)?;
            cx.store(out_field, q.into(), value);
            Ok(())
        })
    })?;
    vertex.functions.push(compute);

    let kernel = rt.kernel(vertex)?;
    let tiles: Vec<usize> = tiles.into_iter().collect();
    tracing::debug!(vertex = %kernel.name, tiles = tiles.len(), "materializing");
    rt.execute(&kernel, &bindings, &tiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ops::BinaryOp,
        shape::{DistributedShape, TensorShape},
        tensor::tests::{runtime, shape},
    };

    #[test]
    fn elementwise_arithmetic() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let a = Tensor::from_values(&rt, shape(&[4], 2), &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::from_values(&rt, shape(&[4], 2), &[10.0f32, 20.0, 30.0, 40.0]).unwrap();
        let sum = (&a + &b).unwrap().materialize(&rt).unwrap();
        assert_eq!(sum.to_vec::<f32>(&rt).unwrap(), vec![11.0, 22.0, 33.0, 44.0]);
        assert_eq!(sum.shape(), a.shape());

        let scaled = ((&a * 2.0f32).unwrap() - 1.0f32).unwrap().materialize(&rt).unwrap();
        assert_eq!(scaled.to_vec::<f32>(&rt).unwrap(), vec![1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn broadcast_rows_against_a_vector() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let m = Tensor::from_values(&rt, shape(&[2, 3], 2), &[100, 200, 300, 100, 200, 300i32]).unwrap();
        let v = Tensor::from_values(&rt, shape(&[3], 1), &[1, 2, 3i32]).unwrap();
        let row = Tensor::from_values(&rt, shape(&[2, 1], 2), &[0, 3i32]).unwrap();
        let e = ((&m + &v).unwrap() + &row).unwrap();
        let out = e.materialize(&rt).unwrap();
        assert_eq!(out.to_vec::<i32>(&rt).unwrap(), vec![101, 202, 303, 104, 205, 306]);
    }

    #[test]
    fn single_row_broadcasts_over_the_leading_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let row = Tensor::from_values(&rt, shape(&[1, 3], 1), &[100, 200, 300i32]).unwrap();
        let m = Tensor::from_values(&rt, shape(&[2, 3], 2), &[1, 2, 3, 4, 5, 6i32]).unwrap();
        for e in [(&row + &m).unwrap(), (&m + &row).unwrap()] {
            assert_eq!(e.shape(), m.shape());
            let out = e.materialize(&rt).unwrap();
            assert_eq!(out.to_vec::<i32>(&rt).unwrap(), vec![101, 202, 303, 104, 205, 306]);
        }
    }

    #[test]
    fn assignment_casts_and_broadcasts() {
        // shows the implicit cast warnings with --nocapture
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let dest = Tensor::zeros(&rt, Type::Int32, shape(&[3, 2], 3)).unwrap();
        dest.assign(&rt, 2.75f32).unwrap();
        assert_eq!(dest.to_vec::<i32>(&rt).unwrap(), vec![2; 6]);

        // in place update reads the old values
        dest.assign(&rt, (&dest * &dest).unwrap()).unwrap();
        assert_eq!(dest.to_vec::<i32>(&rt).unwrap(), vec![4; 6]);

        let too_big = Tensor::zeros(&rt, Type::Int32, shape(&[4, 2], 1)).unwrap();
        assert!(dest.assign(&rt, &too_big).is_err());
    }

    #[test]
    fn row_products() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let x = Tensor::from_values(&rt, shape(&[2, 3], 2), &[1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0]).unwrap();
        let y = Tensor::from_values(&rt, shape(&[2, 3], 2), &[0.0f32, 1.0, 0.0, 0.0, 0.0, 1.0]).unwrap();
        let z = Expression::cross(x.expr(), y.expr()).unwrap().materialize(&rt).unwrap();
        assert_eq!(z.to_vec::<f32>(&rt).unwrap(), vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);

        // the cross product is orthogonal to both operands
        for operand in [&x, &y] {
            let d = Expression::dot(z.expr(), operand.expr()).unwrap().materialize(&rt).unwrap();
            assert_eq!(d.shape().global_shape(), &TensorShape::new([2, 1]).unwrap());
            assert_eq!(d.to_vec::<f32>(&rt).unwrap(), vec![0.0, 0.0]);
        }
        let d = Expression::dot(x.expr(), x.expr()).unwrap().materialize(&rt).unwrap();
        assert_eq!(d.to_vec::<f32>(&rt).unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn cross_product_is_orthogonal_to_its_operands() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let u = Tensor::from_values(&rt, shape(&[1, 3], 1), &[1.0f32, 2.0, 3.0]).unwrap();
        let v = Tensor::from_values(&rt, shape(&[1, 3], 1), &[11.0f32, 12.0, 13.0]).unwrap();
        let w = Expression::cross(u.expr(), v.expr()).unwrap().materialize(&rt).unwrap();
        assert_eq!(w.to_vec::<f32>(&rt).unwrap(), vec![-10.0, 20.0, -10.0]);
        let d = Expression::dot(w.expr(), v.expr()).unwrap().materialize(&rt).unwrap();
        assert_eq!(d.to_vec::<f32>(&rt).unwrap(), vec![0.0]);
        let d = Expression::dot(u.expr(), w.expr()).unwrap().materialize(&rt).unwrap();
        assert_eq!(d.to_vec::<f32>(&rt).unwrap(), vec![0.0]);
    }

    #[test]
    fn permute_swaps_trailing_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let values: Vec<u32> = (0..12).collect();
        let t = Tensor::from_values(&rt, shape(&[2, 2, 3], 2), &values).unwrap();
        let p = t.expr().permute(&[0, 2, 1]).unwrap().materialize(&rt).unwrap();
        assert_eq!(p.shape().global_shape().dims(), &[2, 3, 2]);
        assert_eq!(p.to_vec::<u32>(&rt).unwrap(), vec![0, 3, 1, 4, 2, 5, 6, 9, 7, 10, 8, 11]);
    }

    #[test]
    fn multi_worker_kernels_cover_every_element() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        // uneven rows per tile, more elements than workers
        let dist = [(0, 5), (1, 17), (3, 2)].into();
        let s = DistributedShape::on_tiles(TensorShape::new([24, 3]).unwrap(), dist).unwrap();
        let values: Vec<f32> = (0..72).map(|v| v as f32).collect();
        let t = Tensor::from_values(&rt, s, &values).unwrap();
        let e = Expression::binary(BinaryOp::Add, t.expr(), Expression::constant(1.0, Type::Float32)).unwrap();
        let out = e.materialize(&rt).unwrap();
        let expected: Vec<f32> = values.iter().map(|v| v + 1.0).collect();
        assert_eq!(out.to_vec::<f32>(&rt).unwrap(), expected);
    }

    #[test]
    fn identical_expressions_compile_once() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let a = Tensor::from_values(&rt, shape(&[8], 4), &[1.0f32; 8]).unwrap();
        let b = Tensor::from_values(&rt, shape(&[8], 4), &[2.0f32; 8]).unwrap();
        a.expr().sqrt().unwrap().materialize(&rt).unwrap();
        b.expr().sqrt().unwrap().materialize(&rt).unwrap();
        assert_eq!(rt.compilations(), 1);
        let out = a.expr().sqrt().unwrap().materialize(&rt).unwrap();
        assert_eq!(out.to_vec::<f32>(&rt).unwrap(), vec![1.0; 8]);
        assert_eq!(rt.compilations(), 1);
    }
}
