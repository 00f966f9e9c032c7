//! The device side of a decomposed sparse matrix.
//!
//! Every tile holds the CRS addressing of its owned rows over local row
//! ids. Vectors come in two layouts: without halo (owned rows only) and
//! with halo, where each tile's block is followed by copies of the
//! separator rows of its neighbours. Kernels that read neighbouring rows
//! take vectors with halo and refresh the halo cells first.

pub(crate) mod kernels;

use std::sync::Arc;

use smallvec::SmallVec;
use tilesolve_kerpiler::{
    runtime::Binding, CopyBlock, DistributedShape, FirstDimDistribution, IntoExpression, ReduceOp, Runtime, Tensor,
    TensorShape, Type,
};

use crate::{
    error::{Error, Result},
    host::HostMatrix,
    layout::DistributedTileLayout,
    solver::VectorNorm,
};

pub(crate) type Bindings<'a> = SmallVec<[Binding<'a>; 8]>;

/// Rows of every tile grouped by color, see [`Coloring`](crate::layout::Coloring).
#[derive(Debug, Clone)]
pub struct DeviceColoring {
    pub sort_addr: Tensor,
    pub start_ptr: Tensor,
}

#[derive(Debug, Clone)]
pub struct Matrix {
    layout: Arc<DistributedTileLayout>,
    value_type: Type,
    diag: Tensor,
    off_diag: Tensor,
    row_ptr: Tensor,
    col_ind: Tensor,
    coloring: DeviceColoring,
    multicolor_recommended: bool,
    halo_blocks: Vec<CopyBlock>,
    tiles: Vec<usize>,
}

// one block per tile, concatenated in tile order
fn upload(rt: &Runtime, ty: Type, blocks: &[Vec<f64>]) -> Result<Tensor> {
    let dist: FirstDimDistribution = blocks.iter().enumerate().map(|(tile, b)| (tile, b.len())).collect();
    let shape = DistributedShape::on_tiles(TensorShape::new([dist.sum()])?, dist)?;
    Ok(Tensor::from_f64(rt, ty, shape, &blocks.concat())?)
}

// indices get the narrowest unsigned type that holds all of them
fn upload_indices<'a>(rt: &Runtime, blocks: impl Iterator<Item = &'a [usize]>) -> Result<Tensor> {
    let blocks: Vec<Vec<f64>> = blocks.map(|b| b.iter().map(|i| *i as f64).collect()).collect();
    let max = blocks.iter().flatten().fold(0.0f64, |m, v| m.max(*v));
    upload(rt, Type::unsigned_for(max as usize), &blocks)
}

impl Matrix {
    /// Copy the decomposed matrix to the device with values of type `ty`.
    #[tracing::instrument(skip_all, fields(rows = host.num_rows(), tiles = host.num_tiles(), ty = %ty))]
    pub fn new(rt: &Runtime, host: &HostMatrix, ty: Type) -> Result<Self> {
        if !ty.is_float() {
            return Err(Error::Matrix(format!("matrix values must be floating point, got {ty}")));
        }
        let addressing = host.addressing();
        let coloring = host.coloring();
        let diag: Vec<Vec<f64>> = addressing.iter().map(|a| a.diag.clone()).collect();
        let off_diag: Vec<Vec<f64>> = addressing.iter().map(|a| a.off_diag.clone()).collect();
        let matrix = Self {
            layout: host.layout().clone(),
            value_type: ty,
            diag: upload(rt, ty, &diag)?,
            off_diag: upload(rt, ty, &off_diag)?,
            row_ptr: upload_indices(rt, addressing.iter().map(|a| a.row_ptr.as_slice()))?,
            col_ind: upload_indices(rt, addressing.iter().map(|a| a.col_ind.as_slice()))?,
            coloring: DeviceColoring {
                sort_addr: upload_indices(rt, coloring.iter().map(|c| c.sort_addr.as_slice()))?,
                start_ptr: upload_indices(rt, coloring.iter().map(|c| c.start_ptr.as_slice()))?,
            },
            multicolor_recommended: host.multicolor_recommended(),
            halo_blocks: host.layout().halo_copy_blocks()?,
            tiles: (0..host.num_tiles()).collect(),
        };
        tracing::debug!(
            nnz = matrix.off_diag.num_elements(),
            index_type = %matrix.col_ind.ty(),
            halo_blocks = matrix.halo_blocks.len(),
            "matrix uploaded"
        );
        Ok(matrix)
    }

    pub fn layout(&self) -> &Arc<DistributedTileLayout> { &self.layout }
    pub fn value_type(&self) -> Type { self.value_type }
    pub fn diag(&self) -> &Tensor { &self.diag }
    pub fn off_diag(&self) -> &Tensor { &self.off_diag }
    pub fn row_ptr(&self) -> &Tensor { &self.row_ptr }
    pub fn col_ind(&self) -> &Tensor { &self.col_ind }
    pub fn coloring(&self) -> &DeviceColoring { &self.coloring }
    pub fn multicolor_recommended(&self) -> bool { self.multicolor_recommended }
    pub fn num_rows(&self) -> usize { self.layout.num_rows() }
    pub fn num_tiles(&self) -> usize { self.tiles.len() }
    pub(crate) fn tiles(&self) -> &[usize] { &self.tiles }

    /// Bindings for [`kernels::CrsFields`] with the matrix's own
    /// coefficients, followed by `rest`.
    pub(crate) fn bindings<'a>(&'a self, rest: impl IntoIterator<Item = Binding<'a>>) -> Bindings<'a> {
        self.bindings_with(&self.diag, &self.off_diag, rest)
    }

    /// Like [`bindings`](Self::bindings) with other coefficients on the
    /// same addressing, e.g. a factorization.
    pub(crate) fn bindings_with<'a>(
        &'a self,
        diag: &'a Tensor,
        off_diag: &'a Tensor,
        rest: impl IntoIterator<Item = Binding<'a>>,
    ) -> Bindings<'a> {
        let mut bindings: Bindings<'a> = SmallVec::new();
        bindings.extend([
            Binding::Sliced(diag),
            Binding::Sliced(off_diag),
            Binding::Sliced(&self.row_ptr),
            Binding::Sliced(&self.col_ind),
        ]);
        bindings.extend(rest);
        bindings
    }

    pub fn vector_shape(&self, with_halo: bool) -> Result<DistributedShape> { self.layout.vector_shape(with_halo, 0) }

    pub fn is_vector_compatible(&self, v: &Tensor, with_halo: bool) -> bool {
        v.rank() == 1
            && self.vector_shape(with_halo).is_ok_and(|s| &s == v.shape())
            && v.tile_mapping().is_compatible_with(v.shape())
    }

    pub(crate) fn check_vector(&self, v: &Tensor, with_halo: bool, what: &'static str) -> Result<()> {
        if self.is_vector_compatible(v, with_halo) {
            return Ok(());
        }
        let expected = self.vector_shape(with_halo)?;
        let halo = if with_halo { "with" } else { "without" };
        Err(Error::IncompatibleVector { what, reason: format!("expected {expected} {halo} halo, got {}", v.shape()) })
    }

    pub fn create_uninitialized_vector(&self, rt: &Runtime, ty: Type, with_halo: bool) -> Result<Tensor> {
        Ok(Tensor::uninitialized(rt, ty, self.vector_shape(with_halo)?)?)
    }

    /// Upload a global vector in row order, halo cells included when
    /// `with_halo` is set.
    pub fn load_vector(&self, rt: &Runtime, values: &[f64], with_halo: bool) -> Result<Tensor> {
        let decomposed = self.layout.decompose_vector(values, with_halo)?;
        Ok(Tensor::from_f64(rt, self.value_type, self.vector_shape(with_halo)?, &decomposed)?)
    }

    /// Download a vector with or without halo into global row order.
    pub fn vector_to_host(&self, rt: &Runtime, v: &Tensor) -> Result<Vec<f64>> {
        let with_halo = if self.is_vector_compatible(v, false) {
            false
        } else {
            self.check_vector(v, true, "v")?;
            true
        };
        self.layout.reassemble_vector(&v.to_f64_vec(rt)?, with_halo)
    }

    /// Refresh the halo cells of `v` from the rows they mirror.
    pub fn exchange_halo_cells(&self, rt: &Runtime, v: &Tensor) -> Result<()> {
        self.check_vector(v, true, "v")?;
        if !self.halo_blocks.is_empty() {
            v.copy_from(rt, v, &self.halo_blocks)?;
        }
        Ok(())
    }

    // owned rows of every tile, between the layouts with and without halo
    fn owned_blocks(&self, into_halo: bool) -> Vec<CopyBlock> {
        let with = self.layout.tile_offsets(true);
        let without = self.layout.tile_offsets(false);
        self.layout
            .tiles()
            .iter()
            .zip(with.into_iter().zip(without))
            .map(|(t, (w, wo))| {
                let (src, dst) = if into_halo { (wo, w) } else { (w, wo) };
                CopyBlock { src, dst, len: t.num_owned() }
            })
            .collect()
    }

    /// A copy of the owned rows of a vector with halo.
    pub fn strip_halo(&self, rt: &Runtime, v: &Tensor) -> Result<Tensor> {
        self.check_vector(v, true, "v")?;
        let out = self.create_uninitialized_vector(rt, v.ty(), false)?;
        out.copy_from(rt, v, &self.owned_blocks(false))?;
        Ok(out)
    }

    /// Evaluate `value`, a vector without halo, into the owned rows of
    /// `dst`. Halo cells of `dst` are left alone.
    pub fn assign_without_halo(&self, rt: &Runtime, dst: &Tensor, value: impl IntoExpression) -> Result<()> {
        self.check_vector(dst, true, "destination")?;
        let value = value.into_expression();
        let src = match value.as_tensor() {
            Some(t) if self.is_vector_compatible(t, false) => t.clone(),
            _ => {
                let tmp = self.create_uninitialized_vector(rt, dst.ty(), false)?;
                tmp.assign(rt, value)?;
                tmp
            }
        };
        dst.copy_from(rt, &src, &self.owned_blocks(true))?;
        Ok(())
    }

    /// `A x` without halo, for `x` with halo.
    #[tracing::instrument(skip_all)]
    pub fn spmv(&self, rt: &Runtime, x: &Tensor) -> Result<Tensor> {
        self.check_vector(x, true, "x")?;
        self.exchange_halo_cells(rt, x)?;
        let out = self.create_uninitialized_vector(rt, x.ty(), false)?;
        let kernel = rt.kernel(kernels::spmv_vertex(self, x.ty(), rt.topology().workers_per_partition)?)?;
        rt.execute(&kernel, &self.bindings([Binding::Sliced(x), Binding::Sliced(&out)]), &self.tiles)?;
        Ok(out)
    }

    /// `b - A x` in the type of `x`.
    pub fn residual(&self, rt: &Runtime, x: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.residual_with_precision(rt, x, b, x.ty(), x.ty())
    }

    /// `b - A x`, accumulated per row in `extended` and stored as
    /// `working`. `x` has a halo, `b` and the result do not.
    #[tracing::instrument(skip_all, fields(working = %working, extended = %extended))]
    pub fn residual_with_precision(
        &self,
        rt: &Runtime,
        x: &Tensor,
        b: &Tensor,
        working: Type,
        extended: Type,
    ) -> Result<Tensor> {
        self.check_vector(x, true, "x")?;
        self.check_vector(b, false, "b")?;
        self.exchange_halo_cells(rt, x)?;
        let out = self.create_uninitialized_vector(rt, working, false)?;
        let vertex =
            kernels::residual_vertex(self, x.ty(), b.ty(), working, extended, rt.topology().workers_per_partition)?;
        let kernel = rt.kernel(vertex)?;
        let bindings = self.bindings([Binding::Sliced(x), Binding::Sliced(b), Binding::Sliced(&out)]);
        rt.execute(&kernel, &bindings, &self.tiles)?;
        drop(bindings);
        Ok(out)
    }

    /// The norm of a vector with or without halo, as a scalar on tile 0.
    pub fn vector_norm(&self, rt: &Runtime, norm: VectorNorm, v: &Tensor) -> Result<Tensor> {
        let v = if self.is_vector_compatible(v, false) { v.clone() } else { self.strip_halo(rt, v)? };
        let norm = match norm {
            VectorNorm::L1 => v.expr().abs()?.reduce(rt, 0, ReduceOp::Add)?,
            VectorNorm::L2 => v.reduce(rt, 0, ReduceOp::SquareAdd)?.expr().sqrt()?.materialize(rt)?,
            VectorNorm::LInf => v.expr().abs()?.reduce(rt, 0, ReduceOp::Max)?,
            VectorNorm::None => return Err(Error::Config("cannot compute a vector norm of kind None".into())),
        };
        Ok(norm)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        host::{poisson_3d, TripletMatrix},
        partition::RecursiveBisection,
    };

    fn poisson(tiles: usize) -> HostMatrix {
        HostMatrix::new(poisson_3d(4, 4, 2).into_crs().unwrap(), tiles, &RecursiveBisection::default()).unwrap()
    }

    fn random_vector(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn assert_close(a: &[f64], b: &[f64], tol: f64) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() <= tol, "row {i}: {x} vs {y}");
        }
    }

    #[test]
    fn spmv_matches_host_product() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        for tiles in [1, 3, 4] {
            let host = poisson(tiles);
            let a = Matrix::new(&rt, &host, Type::Float64).unwrap();
            let values = random_vector(host.num_rows(), tiles as u64);
            let x = a.load_vector(&rt, &values, true).unwrap();
            let y = a.spmv(&rt, &x).unwrap();
            assert!(a.is_vector_compatible(&y, false));
            assert_close(&a.vector_to_host(&rt, &y).unwrap(), &host.crs().multiply(&values), 1e-12);
        }
    }

    #[test]
    fn spmv_refreshes_stale_halo_cells() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let host = poisson(4);
        let a = Matrix::new(&rt, &host, Type::Float32).unwrap();
        let values: Vec<f64> = (0..host.num_rows()).map(|i| (i % 7) as f64).collect();
        // owned rows only, halo cells stay zero until exchanged
        let x = a.create_uninitialized_vector(&rt, Type::Float32, true).unwrap();
        a.assign_without_halo(&rt, &x, &a.load_vector(&rt, &values, false).unwrap()).unwrap();
        let y = a.spmv(&rt, &x).unwrap();
        assert_close(&a.vector_to_host(&rt, &y).unwrap(), &host.crs().multiply(&values), 1e-5);
        assert_eq!(x.to_f64_vec(&rt).unwrap(), host.decompose_vector(&values, true).unwrap());
    }

    #[test]
    fn residual_in_extended_precision() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let host = poisson(3);
        let a = Matrix::new(&rt, &host, Type::Float32).unwrap();
        let xs = random_vector(host.num_rows(), 5);
        let bs = random_vector(host.num_rows(), 6);
        let x = a.load_vector(&rt, &xs, true).unwrap();
        let b = a.load_vector(&rt, &bs, false).unwrap();
        let ax = host.crs().multiply(&xs);
        let expected: Vec<f64> = bs.iter().zip(&ax).map(|(b, ax)| b - ax).collect();

        let r = a.residual(&rt, &x, &b).unwrap();
        assert_eq!(r.ty(), Type::Float32);
        assert_close(&a.vector_to_host(&rt, &r).unwrap(), &expected, 1e-5);

        let r = a.residual_with_precision(&rt, &x, &b, Type::Float32, Type::Float64).unwrap();
        assert_eq!(r.ty(), Type::Float32);
        assert_close(&a.vector_to_host(&rt, &r).unwrap(), &expected, 1e-6);
    }

    #[test]
    fn norms_ignore_halo_cells() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let host = poisson(4);
        let a = Matrix::new(&rt, &host, Type::Float64).unwrap();
        let values: Vec<f64> = (0..host.num_rows()).map(|i| if i % 2 == 0 { i as f64 } else { -(i as f64) }).collect();
        let with_halo = a.load_vector(&rt, &values, true).unwrap();
        let without = a.load_vector(&rt, &values, false).unwrap();
        let l1: f64 = values.iter().map(|v| v.abs()).sum();
        let l2 = values.iter().map(|v| v * v).sum::<f64>().sqrt();
        let linf = (host.num_rows() - 1) as f64;
        for v in [&with_halo, &without] {
            let norm = |n| a.vector_norm(&rt, n, v).unwrap().to_scalar::<f64>(&rt).unwrap();
            assert!((norm(VectorNorm::L1) - l1).abs() < 1e-9);
            assert!((norm(VectorNorm::L2) - l2).abs() < 1e-9);
            assert_eq!(norm(VectorNorm::LInf), linf);
        }
        assert!(matches!(a.vector_norm(&rt, VectorNorm::None, &without), Err(Error::Config(_))));
    }

    #[test]
    fn strip_halo_keeps_owned_rows() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let host = poisson(4);
        let a = Matrix::new(&rt, &host, Type::Float32).unwrap();
        let values: Vec<f64> = (0..host.num_rows()).map(|i| i as f64).collect();
        let stripped = a.strip_halo(&rt, &a.load_vector(&rt, &values, true).unwrap()).unwrap();
        assert_eq!(stripped.to_f64_vec(&rt).unwrap(), host.decompose_vector(&values, false).unwrap());
        assert_eq!(a.vector_to_host(&rt, &stripped).unwrap(), values);
    }

    #[test]
    fn mismatched_vectors_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let host = poisson(4);
        let a = Matrix::new(&rt, &host, Type::Float32).unwrap();
        let without = a.load_vector(&rt, &vec![1.0; host.num_rows()], false).unwrap();
        assert!(matches!(a.spmv(&rt, &without), Err(Error::IncompatibleVector { what: "x", .. })));
        assert!(a.load_vector(&rt, &[1.0, 2.0], false).is_err());

        let mut m = TripletMatrix::new(2, 2);
        m.push(0, 0, 1.0);
        m.push(1, 1, 1.0);
        let host = HostMatrix::new(m.into_crs().unwrap(), 1, &RecursiveBisection::default()).unwrap();
        assert!(matches!(Matrix::new(&rt, &host, Type::Int32), Err(Error::Matrix(_))));
    }
}
