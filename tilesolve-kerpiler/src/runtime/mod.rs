//! The simulated tile device.
//!
//! A [`Runtime`] is the explicit context every device operation goes
//! through. It owns device memory, the host resource table and the store
//! of compiled kernels.

mod interp;
mod kernels;
mod memory;
mod resource;

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

pub use kernels::KernelStore;
pub(crate) use memory::DeviceMemory;
pub use memory::Storage;
pub use resource::{HostTensor, RemoteTensor, ResourceTable};

use self::interp::{FieldView, IndexMap, Machine};
use crate::{
    codegen::ir::{FieldShape, Vertex},
    config::{RuntimeConfig, Topology},
    error::{Error, Result},
    shape::{DistributedShape, TileMapping},
    tensor::Tensor,
    typing::Type,
};

/// How a vertex field is connected for one execution.
#[derive(Debug)]
pub enum Binding<'a> {
    // the tile's own elements of the tensor
    Sliced(&'a Tensor),
    // the whole tensor on every tile
    Whole(&'a Tensor),
    // one value per tile, missing tiles read 0
    PerTile(BTreeMap<usize, f64>),
    Scalar(f64),
}

/// A contiguous element copy between two tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyBlock {
    pub src: usize,
    pub dst: usize,
    pub len: usize,
}

pub struct Runtime {
    config: RuntimeConfig,
    memory: Arc<Mutex<DeviceMemory>>,
    resources: ResourceTable,
    kernels: Mutex<KernelStore>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let kernels = KernelStore::new(&config)?;
        tracing::info!(
            tiles = config.topology.num_partitions(),
            workers = config.topology.workers_per_partition,
            "runtime ready"
        );
        Ok(Self {
            config,
            memory: Arc::new(Mutex::new(DeviceMemory::default())),
            resources: ResourceTable::new(),
            kernels: Mutex::new(kernels),
        })
    }

    pub fn config(&self) -> &RuntimeConfig { &self.config }
    pub fn topology(&self) -> &Topology { &self.config.topology }
    pub fn resources(&self) -> &ResourceTable { &self.resources }
    // kernels compiled (not restored) by this runtime
    pub fn compilations(&self) -> usize { self.kernels.lock().compilations() }
    // live device buffers
    pub fn num_buffers(&self) -> usize { self.memory.lock().len() }

    pub(crate) fn allocate(&self, ty: Type, mapping: TileMapping) -> Result<Arc<Storage>> {
        let tiles = self.topology().num_partitions();
        if let Some(max) = mapping.max_tile() {
            if max >= tiles {
                return Err(Error::InvalidArgument {
                    arg: "mapping",
                    reason: format!("tile {max} does not exist, the device has {tiles} tiles"),
                });
            }
        }
        Ok(Arc::new(Storage::new(&self.memory, ty, mapping)))
    }

    pub(crate) fn read(&self, storage: &Storage) -> Result<Vec<f64>> {
        Ok(self.memory.lock().get(storage.id())?.data.clone())
    }

    pub(crate) fn write(&self, storage: &Storage, values: &[f64]) -> Result<()> {
        let mut memory = self.memory.lock();
        let buffer = memory.get_mut(storage.id())?;
        if buffer.data.len() != values.len() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} values", buffer.data.len()),
                got: format!("{} values", values.len()),
            });
        }
        let ty = buffer.ty;
        for (d, v) in buffer.data.iter_mut().zip(values) {
            *d = ty.round(*v);
        }
        Ok(())
    }

    /// Copy element blocks from `src` into `dst`, converting to the
    /// destination type. All reads happen before any write.
    pub(crate) fn copy(&self, src: &Storage, dst: &Storage, blocks: &[CopyBlock]) -> Result<()> {
        let mut memory = self.memory.lock();
        let source = &memory.get(src.id())?.data;
        let mut staged = Vec::with_capacity(blocks.len());
        for b in blocks {
            let Some(values) = source.get(b.src..b.src + b.len) else {
                return Err(Error::InvalidArgument { arg: "blocks", reason: format!("{b:?} exceeds source of {}", source.len()) });
            };
            staged.push((b.dst, values.to_vec()));
        }
        let target = memory.get_mut(dst.id())?;
        let ty = target.ty;
        for (at, values) in staged {
            let n = target.data.len();
            let Some(slot) = target.data.get_mut(at..at + values.len()) else {
                return Err(Error::InvalidArgument { arg: "blocks", reason: format!("copy to {at} exceeds target of {n}") });
            };
            for (d, v) in slot.iter_mut().zip(values) {
                *d = ty.round(v);
            }
        }
        Ok(())
    }

    /// Look up a kernel by content, compiling it on a miss.
    pub fn kernel(&self, vertex: Vertex) -> Result<Arc<Vertex>> {
        self.kernels.lock().get_or_compile(vertex)
    }

    /// Run `kernel` once on each of `tiles`.
    #[tracing::instrument(skip_all, fields(vertex = %kernel.name))]
    pub fn execute(&self, kernel: &Vertex, bindings: &[Binding], tiles: &[usize]) -> Result<()> {
        if bindings.len() != kernel.fields.len() {
            return Err(Error::InvalidArgument {
                arg: "bindings",
                reason: format!("{} bindings for {} fields", bindings.len(), kernel.fields.len()),
            });
        }
        // one slot per distinct buffer, in binding order
        let mut ids: Vec<u64> = vec![];
        let mut slot_of = Vec::with_capacity(bindings.len());
        for (field, binding) in kernel.fields.iter().zip(bindings) {
            let tensor = match (binding, field.shape) {
                (Binding::Sliced(t) | Binding::Whole(t), FieldShape::Vector) => t,
                (Binding::PerTile(_) | Binding::Scalar(_), FieldShape::Param) => {
                    slot_of.push(usize::MAX);
                    continue;
                }
                _ => {
                    return Err(Error::InvalidArgument {
                        arg: "bindings",
                        reason: format!("field {} bound to the wrong kind of value", field.name),
                    })
                }
            };
            if tensor.ty() != field.ty {
                return Err(Error::TypeMismatch { op: "connect", lhs: field.ty, rhs: tensor.ty() });
            }
            let slot = match ids.iter().position(|id| *id == tensor.id()) {
                Some(slot) => slot,
                None => {
                    ids.push(tensor.id());
                    ids.len() - 1
                }
            };
            slot_of.push(slot);
        }

        let mut memory = self.memory.lock();
        let mut slots = Vec::with_capacity(ids.len());
        for id in &ids {
            match memory.take(*id) {
                Ok(data) => slots.push(data),
                Err(e) => {
                    for (id, data) in ids.iter().zip(slots) {
                        memory.restore(*id, data);
                    }
                    return Err(e);
                }
            }
        }
        let num_vars = kernel.num_vars();
        let workers = self.topology().workers_per_partition;
        let mut run = || -> Result<()> {
            for &tile in tiles {
                let views: Vec<FieldView> = bindings
                    .iter()
                    .zip(&slot_of)
                    .map(|(b, slot)| match b {
                        Binding::Sliced(t) => FieldView::Vector {
                            slot: *slot,
                            map: IndexMap::Gather(t.tile_mapping().local_to_global(tile)),
                        },
                        Binding::Whole(t) => FieldView::Vector { slot: *slot, map: IndexMap::Identity(t.num_elements()) },
                        Binding::PerTile(values) => FieldView::Param(values.get(&tile).copied().unwrap_or(0.0)),
                        Binding::Scalar(v) => FieldView::Param(*v),
                    })
                    .collect();
                Machine { vertex: kernel, views: &views, memory: &mut slots, workers, tile, num_vars }.run()?;
            }
            Ok(())
        };
        let result = run();
        for (id, data) in ids.iter().zip(slots) {
            memory.restore(*id, data);
        }
        tracing::trace!(tiles = tiles.len(), "executed");
        result
    }
}

impl Runtime {
    /// A runtime with default configuration and its kernel cache in `dir`.
    pub fn with_cache_dir(dir: impl Into<std::path::PathBuf>) -> Result<Self> {
        Self::new(RuntimeConfig::default().with_cache_dir(dir))
    }

    pub(crate) fn check_shape(&self, shape: &DistributedShape) -> Result<()> {
        let tiles = self.topology().num_partitions();
        match shape.distribution().max_key() {
            Some(max) if max >= tiles => Err(Error::InvalidArgument {
                arg: "shape",
                reason: format!("tile {max} does not exist, the device has {tiles} tiles"),
            }),
            _ => Ok(()),
        }
    }
}
