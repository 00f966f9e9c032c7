use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Hardware topology the engine lowers onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Topology {
    // worker threads that share one tile
    pub workers_per_partition: usize,
    // tiles on one accelerator unit
    pub partitions_per_unit: usize,
    pub num_units: usize,
}

impl Default for Topology {
    fn default() -> Self {
        Self { workers_per_partition: 6, partitions_per_unit: 1472, num_units: 1 }
    }
}

impl Topology {
    pub fn num_partitions(&self) -> usize { self.partitions_per_unit * self.num_units }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub dir: PathBuf,
    // write a `.lst` listing of the lowered kernel next to the object
    pub dump_source_listing: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { dir: std::env::temp_dir().join("tilesolve-vertices"), dump_source_listing: false }
    }
}

/// How kernel sources are turned into loadable objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CompilerConfig {
    #[default]
    Host,
    // external toolchain, `{src}` and `{out}` in args are substituted
    Command { program: String, args: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub topology: Topology,
    pub cache: CacheConfig,
    pub compiler: CompilerConfig,
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = dir.into(); self
    }
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology; self
    }
}

/// Controls how tensors are summarised when printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrintFormat {
    pub summarise_threshold: usize,
    pub edge_items: usize,
}

impl Default for PrintFormat {
    fn default() -> Self { Self::new(100) }
}

impl PrintFormat {
    pub fn new(summarise_threshold: usize) -> Self {
        Self { summarise_threshold, edge_items: summarise_threshold / 2 }
    }
    pub fn with_edge_items(summarise_threshold: usize, edge_items: usize) -> Result<Self> {
        if edge_items * 2 > summarise_threshold {
            return Err(crate::Error::InvalidArgument {
                arg: "edge_items",
                reason: format!("{edge_items} edge items do not fit a threshold of {summarise_threshold}"),
            });
        }
        Ok(Self { summarise_threshold, edge_items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hardware() {
        let config = RuntimeConfig::from_json("{}").unwrap();
        assert_eq!(config.topology.workers_per_partition, 6);
        assert_eq!(config.topology.partitions_per_unit, 1472);
        assert_eq!(config.compiler, CompilerConfig::Host);
    }

    #[test]
    fn parses_partial_config() {
        let config = RuntimeConfig::from_json(
            r#"{"topology": {"numUnits": 2}, "compiler": {"kind": "command", "program": "popc", "args": ["-O3", "{src}", "-o", "{out}"]}}"#,
        ).unwrap();
        assert_eq!(config.topology.num_partitions(), 2944);
        assert!(matches!(config.compiler, CompilerConfig::Command { ref program, .. } if program == "popc"));
    }

    #[test]
    fn edge_items_must_fit() {
        assert!(PrintFormat::with_edge_items(5, 2).is_ok());
        assert!(PrintFormat::with_edge_items(2, 2).is_err());
    }
}
