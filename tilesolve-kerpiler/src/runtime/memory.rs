use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    shape::TileMapping,
    typing::Type,
};

/// Flattened contents of one device tensor.
#[derive(Debug)]
pub(crate) struct Buffer {
    pub ty: Type,
    pub data: Vec<f64>,
}

/// Device memory, keyed by buffer id.
///
/// Values are held as `f64` and always rounded to the buffer type on write.
#[derive(Debug, Default)]
pub(crate) struct DeviceMemory {
    buffers: HashMap<u64, Buffer>,
    next_id: u64,
}

impl DeviceMemory {
    pub fn allocate(&mut self, ty: Type, len: usize) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(id, Buffer { ty, data: vec![0.0; len] });
        id
    }
    pub fn release(&mut self, id: u64) {
        self.buffers.remove(&id);
    }
    pub fn get(&self, id: u64) -> Result<&Buffer> {
        self.buffers.get(&id).ok_or(Error::UnknownBuffer(id))
    }
    pub fn get_mut(&mut self, id: u64) -> Result<&mut Buffer> {
        self.buffers.get_mut(&id).ok_or(Error::UnknownBuffer(id))
    }
    // move the data out while a kernel runs on it
    pub fn take(&mut self, id: u64) -> Result<Vec<f64>> {
        Ok(std::mem::take(&mut self.get_mut(id)?.data))
    }
    pub fn restore(&mut self, id: u64, data: Vec<f64>) {
        if let Some(b) = self.buffers.get_mut(&id) {
            b.data = data;
        }
    }
    pub fn len(&self) -> usize { self.buffers.len() }
}

/// Shared handle to one buffer. The buffer is freed with the last handle.
pub struct Storage {
    id: u64,
    ty: Type,
    len: usize,
    mapping: TileMapping,
    memory: Weak<Mutex<DeviceMemory>>,
}

impl Storage {
    pub(crate) fn new(memory: &Arc<Mutex<DeviceMemory>>, ty: Type, mapping: TileMapping) -> Self {
        let len = mapping.num_elements();
        let id = memory.lock().allocate(ty, len);
        tracing::trace!(id, %ty, len, "allocated device buffer");
        Self { id, ty, len, mapping, memory: Arc::downgrade(memory) }
    }
    pub fn id(&self) -> u64 { self.id }
    pub fn ty(&self) -> Type { self.ty }
    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    pub fn mapping(&self) -> &TileMapping { &self.mapping }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.upgrade() {
            memory.lock().release(self.id);
            tracing::trace!(id = self.id, "released device buffer");
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Storage#{}<{}; {}>", self.id, self.ty, self.len)
    }
}
