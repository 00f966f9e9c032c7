use std::{collections::HashMap, fs, sync::Arc};

use crate::{
    codegen::{
        cache::{CacheEntry, VertexCache, PLACEHOLDER},
        compiler::{compiler_from_config, load_object, KernelCompiler},
        ir::Vertex,
        render::render,
    },
    config::RuntimeConfig,
    error::Result,
};

/// Compiled kernels, backed by the on-disk vertex cache.
pub struct KernelStore {
    cache: VertexCache,
    compiler: Box<dyn KernelCompiler + Send + Sync>,
    loaded: HashMap<String, Arc<Vertex>>,
    compilations: usize,
}

impl KernelStore {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let cache = VertexCache::open(&config.cache.dir)?;
        let compiler = compiler_from_config(&config.compiler, config.cache.dump_source_listing);
        Ok(Self { cache, compiler, loaded: HashMap::new(), compilations: 0 })
    }

    pub fn with_compiler(cache: VertexCache, compiler: Box<dyn KernelCompiler + Send + Sync>) -> Self {
        Self { cache, compiler, loaded: HashMap::new(), compilations: 0 }
    }

    pub fn compilations(&self) -> usize { self.compilations }
    pub fn cache(&self) -> &VertexCache { &self.cache }

    /// The vertex is identified by its source rendered under a placeholder
    /// name, so two kernels differing only in their connected tensors share
    /// one compiled object.
    pub fn get_or_compile(&mut self, mut vertex: Vertex) -> Result<Arc<Vertex>> {
        let hash = VertexCache::hash_source(&render(&vertex, PLACEHOLDER));
        if let Some(v) = self.loaded.get(&hash) {
            tracing::trace!(vertex = %v.name, "kernel already loaded");
            return Ok(v.clone());
        }
        if let Some(entry) = self.cache.get(&hash) {
            tracing::debug!(vertex = %entry.vertex_name, "restoring cached kernel");
            let v = Arc::new(load_object(&entry.elf_path)?);
            self.loaded.insert(hash, v.clone());
            return Ok(v);
        }
        let name = VertexCache::vertex_name(&hash);
        vertex.name = name.clone();
        let src_path = self.cache.source_path(&name);
        let elf_path = self.cache.object_path(&name);
        fs::write(&src_path, render(&vertex, &name))?;
        tracing::info!(vertex = %name, kind = ?vertex.kind, "compiling kernel");
        self.compiler.compile(&vertex, &src_path, &elf_path)?;
        self.compilations += 1;
        self.cache.insert(hash.clone(), CacheEntry { vertex_name: name, src_path, elf_path })?;
        let v = Arc::new(vertex);
        self.loaded.insert(hash, v.clone());
        Ok(v)
    }
}
