use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use super::Runtime;
use crate::{
    error::{Error, Result},
    shape::DistributedShape,
    tensor::Tensor,
    typing::{Scalar, Type},
};

#[derive(Debug, Default)]
struct Resources {
    buffers: HashMap<u64, Arc<[f64]>>,
    next_id: u64,
}

/// Registry of host buffers taking part in a host to device transfer.
#[derive(Debug, Clone, Default)]
pub struct ResourceTable {
    inner: Arc<Mutex<Resources>>,
}

impl ResourceTable {
    pub fn new() -> Self { Self::default() }

    fn register(&self, data: Arc<[f64]>) -> u64 {
        let mut r = self.inner.lock();
        let id = r.next_id;
        r.next_id += 1;
        r.buffers.insert(id, data);
        id
    }
    fn get(&self, id: u64) -> Result<Arc<[f64]>> {
        self.inner.lock().buffers.get(&id).cloned().ok_or(Error::UnknownBuffer(id))
    }
    fn release(&self, id: u64) {
        self.inner.lock().buffers.remove(&id);
    }
    // live host buffers
    pub fn len(&self) -> usize { self.inner.lock().buffers.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Values on the host, registered with the runtime's resource table.
///
/// Dropping releases the registration unless the data was handed on to a
/// [`RemoteTensor`].
#[derive(Debug)]
pub struct HostTensor {
    id: u64,
    ty: Type,
    shape: DistributedShape,
    table: ResourceTable,
    copied_to_remote: bool,
}

impl HostTensor {
    pub fn new(rt: &Runtime, ty: Type, shape: DistributedShape, values: &[f64]) -> Result<Self> {
        if values.len() != shape.num_elements() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} values", shape.num_elements()),
                got: format!("{} values", values.len()),
            });
        }
        let data: Arc<[f64]> = values.iter().map(|v| ty.round(*v)).collect();
        let table = rt.resources().clone();
        let id = table.register(data);
        Ok(Self { id, ty, shape, table, copied_to_remote: false })
    }

    pub fn from_values<T: Scalar>(rt: &Runtime, shape: DistributedShape, values: &[T]) -> Result<Self> {
        let values: Vec<f64> = values.iter().map(|v| v.to_f64()).collect();
        Self::new(rt, T::TYPE, shape, &values)
    }

    pub fn ty(&self) -> Type { self.ty }
    pub fn shape(&self) -> &DistributedShape { &self.shape }
    pub fn values(&self) -> Result<Vec<f64>> { Ok(self.table.get(self.id)?.to_vec()) }
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>> {
        Ok(self.table.get(self.id)?.iter().map(|v| T::from_f64(*v)).collect())
    }

    /// Hand the registered data to the transfer stage.
    pub fn copy_to_remote(mut self) -> RemoteTensor {
        self.copied_to_remote = true;
        RemoteTensor { id: self.id, ty: self.ty, shape: self.shape.clone(), table: self.table.clone() }
    }
}

impl Drop for HostTensor {
    fn drop(&mut self) {
        if !self.copied_to_remote {
            self.table.release(self.id);
        }
    }
}

/// Data in flight to the device. Consumed by [`RemoteTensor::copy_to_tensor`].
#[derive(Debug)]
pub struct RemoteTensor {
    id: u64,
    ty: Type,
    shape: DistributedShape,
    table: ResourceTable,
}

impl RemoteTensor {
    pub fn shape(&self) -> &DistributedShape { &self.shape }

    pub fn copy_to_tensor(self, rt: &Runtime) -> Result<Tensor> {
        let data = self.table.get(self.id)?;
        let tensor = Tensor::uninitialized(rt, self.ty, self.shape.clone())?;
        tensor.write(rt, &data)?;
        Ok(tensor)
    }
}

impl Drop for RemoteTensor {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}
