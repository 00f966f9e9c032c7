//! Typed, shaped, tile-mapped device tensors.
//!
//! A [`Tensor`] is a cheap handle: cloning it shares the device buffer,
//! which is released when the last handle goes away. Element-wise work on
//! tensors goes through [`Expression`]s, which are materialized by
//! generating a kernel, see [`materialize`].

mod materialize;
mod print;
mod reduce;

use std::{fmt, sync::Arc};

use crate::{
    error::{Error, Result},
    expr::{Expression, IntoExpression},
    runtime::{CopyBlock, HostTensor, Runtime, Storage},
    shape::{DistributedShape, TileMapping},
    typing::{Scalar, Type},
};

#[derive(Clone)]
pub struct Tensor {
    storage: Arc<Storage>,
    shape: DistributedShape,
}

impl Tensor {
    /// Allocate device memory laid out linearly over the shape's tiles.
    pub fn uninitialized(rt: &Runtime, ty: Type, shape: DistributedShape) -> Result<Self> {
        rt.check_shape(&shape)?;
        let storage = rt.allocate(ty, TileMapping::linear(&shape))?;
        Ok(Self { storage, shape })
    }

    // device memory starts out zeroed
    pub fn zeros(rt: &Runtime, ty: Type, shape: DistributedShape) -> Result<Self> {
        Self::uninitialized(rt, ty, shape)
    }

    pub fn from_values<T: Scalar>(rt: &Runtime, shape: DistributedShape, values: &[T]) -> Result<Self> {
        let values: Vec<f64> = values.iter().map(|v| v.to_f64()).collect();
        Self::from_f64(rt, T::TYPE, shape, &values)
    }

    pub fn from_f64(rt: &Runtime, ty: Type, shape: DistributedShape, values: &[f64]) -> Result<Self> {
        let tensor = Self::uninitialized(rt, ty, shape)?;
        tensor.write(rt, values)?;
        Ok(tensor)
    }

    /// A scalar on tile 0 holding `value`.
    pub fn with_initial_value<T: Scalar>(rt: &Runtime, value: T) -> Result<Self> {
        Self::from_values(rt, DistributedShape::scalar(0), &[value])
    }

    pub fn id(&self) -> u64 { self.storage.id() }
    pub fn ty(&self) -> Type { self.storage.ty() }
    pub fn shape(&self) -> &DistributedShape { &self.shape }
    pub fn tile_mapping(&self) -> &TileMapping { self.storage.mapping() }
    pub fn rank(&self) -> usize { self.shape.rank() }
    pub fn dim(&self, d: usize) -> usize { self.shape.dim(d) }
    pub fn num_elements(&self) -> usize { self.shape.num_elements() }

    pub fn expr(&self) -> Expression {
        Expression::input(self)
    }

    /// Overwrite the whole tensor with `values` in row-major order.
    pub fn write(&self, rt: &Runtime, values: &[f64]) -> Result<()> {
        rt.write(&self.storage, values)
    }

    pub fn to_f64_vec(&self, rt: &Runtime) -> Result<Vec<f64>> {
        rt.read(&self.storage)
    }

    pub fn to_vec<T: Scalar>(&self, rt: &Runtime) -> Result<Vec<T>> {
        Ok(self.to_f64_vec(rt)?.into_iter().map(T::from_f64).collect())
    }

    pub fn to_scalar<T: Scalar>(&self, rt: &Runtime) -> Result<T> {
        match self.to_vec::<T>(rt)?.as_slice() {
            [v] => Ok(*v),
            values => Err(Error::ShapeMismatch { expected: "a single element".into(), got: format!("{} elements", values.len()) }),
        }
    }

    pub fn copy_to_host(&self, rt: &Runtime) -> Result<HostTensor> {
        HostTensor::new(rt, self.ty(), self.shape.clone(), &self.to_f64_vec(rt)?)
    }

    /// A new tensor with the same shape, type and contents.
    pub fn duplicate(&self, rt: &Runtime) -> Result<Tensor> {
        self.rearrange(rt, self.shape.clone())
    }

    /// Evaluate `value` into this tensor, casting and broadcasting if needed.
    pub fn assign(&self, rt: &Runtime, value: impl IntoExpression) -> Result<()> {
        value.into_expression().materialize_into(rt, self)
    }

    /// Set every element to `value`.
    pub fn fill(&self, rt: &Runtime, value: f64) -> Result<()> {
        self.assign(rt, Expression::constant(value, self.ty()).broadcast(self.shape())?)
    }

    /// Copy into a new tensor whose rows are spread as `shape` says.
    pub fn rearrange(&self, rt: &Runtime, shape: DistributedShape) -> Result<Tensor> {
        if shape.global_shape() != self.shape.global_shape() {
            return Err(Error::ShapeMismatch { expected: self.shape.to_string(), got: shape.to_string() });
        }
        let out = Tensor::uninitialized(rt, self.ty(), shape)?;
        out.copy_from(rt, self, &[CopyBlock { src: 0, dst: 0, len: self.num_elements() }])?;
        Ok(out)
    }

    /// Element copies from `src` into this tensor, converting types.
    pub fn copy_from(&self, rt: &Runtime, src: &Tensor, blocks: &[CopyBlock]) -> Result<()> {
        rt.copy(&src.storage, &self.storage, blocks)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor#{}<{}, {}>", self.id(), self.shape, self.ty())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::{RuntimeConfig, Topology},
        shape::TensorShape,
    };

    pub(crate) fn runtime(dir: &tempfile::TempDir) -> Runtime {
        Runtime::with_cache_dir(dir.path()).unwrap()
    }

    pub(crate) fn runtime_with(dir: &tempfile::TempDir, num_units: usize) -> Runtime {
        let topology = Topology { num_units, ..Topology::default() };
        Runtime::new(RuntimeConfig::default().with_cache_dir(dir.path()).with_topology(topology)).unwrap()
    }

    pub(crate) fn shape(dims: &[usize], tiles: usize) -> DistributedShape {
        DistributedShape::linearly_distributed(TensorShape::new(dims.iter().copied()).unwrap(), tiles).unwrap()
    }

    #[test]
    fn values_round_trip_through_the_device() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let t = Tensor::from_values(&rt, shape(&[2, 2], 2), &[1.5f32, 2.0, -3.25, 4.0]).unwrap();
        assert_eq!(t.ty(), Type::Float32);
        assert_eq!(t.to_vec::<f32>(&rt).unwrap(), vec![1.5, 2.0, -3.25, 4.0]);
        assert!(t.to_scalar::<f32>(&rt).is_err());
        assert!(t.write(&rt, &[1.0]).is_err());

        let s = Tensor::with_initial_value(&rt, 7u32).unwrap();
        assert_eq!(s.to_scalar::<u32>(&rt).unwrap(), 7);
    }

    #[test]
    fn buffers_are_released_with_the_last_handle() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let t = Tensor::zeros(&rt, Type::Int32, shape(&[4], 2)).unwrap();
        let u = t.clone();
        assert_eq!(rt.num_buffers(), 1);
        drop(t);
        assert_eq!(rt.num_buffers(), 1);
        drop(u);
        assert_eq!(rt.num_buffers(), 0);
    }

    #[test]
    fn rearrange_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let values: Vec<i32> = (0..12).collect();
        let t = Tensor::from_values(&rt, shape(&[6, 2], 3), &values).unwrap();
        let target = DistributedShape::on_single_tile(TensorShape::new([6, 2]).unwrap(), 5);
        let r = t.rearrange(&rt, target.clone()).unwrap();
        assert_eq!(r.shape(), &target);
        assert_eq!(r.tile_mapping().num_elements_on_tile(5), 12);
        assert_eq!(r.to_vec::<i32>(&rt).unwrap(), values);
        assert_ne!(r.id(), t.id());
        assert!(t.rearrange(&rt, shape(&[4, 3], 1)).is_err());

        let d = t.duplicate(&rt).unwrap();
        assert_eq!(d.shape(), t.shape());
        assert_eq!(d.to_vec::<i32>(&rt).unwrap(), values);
    }

    #[test]
    fn shapes_must_fit_the_device() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let tiles = rt.topology().num_partitions();
        let far = DistributedShape::on_single_tile(TensorShape::new([2]).unwrap(), tiles);
        assert!(Tensor::zeros(&rt, Type::Float32, far).is_err());
    }

    #[test]
    fn host_transfer_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let host = HostTensor::from_values(&rt, shape(&[3], 1), &[1u8, 2, 3]).unwrap();
        assert_eq!(rt.resources().len(), 1);
        let remote = host.copy_to_remote();
        // handing over keeps the registration alive
        assert_eq!(rt.resources().len(), 1);
        let t = remote.copy_to_tensor(&rt).unwrap();
        assert!(rt.resources().is_empty());
        assert_eq!(t.to_vec::<u8>(&rt).unwrap(), vec![1, 2, 3]);

        let back = t.copy_to_host(&rt).unwrap();
        assert_eq!(back.to_vec::<u8>().unwrap(), vec![1, 2, 3]);
        drop(back);
        assert!(rt.resources().is_empty());
    }
}
