use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Name used while hashing, as long as any real vertex name.
pub const PLACEHOLDER: &str = "vertexPLACEHOLDER12345";
const DICTIONARY: &str = "vertices.json";
const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub vertex_name: String,
    pub src_path: PathBuf,
    pub elf_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct Dictionary {
    version: u32,
    vertices: BTreeMap<String, CacheEntry>,
}

/// Content-addressed store of compiled vertices.
///
/// The dictionary maps the hash of a vertex's source (rendered with
/// [`PLACEHOLDER`] as its name) to the generated name and the source and
/// object paths. It is written back after every insertion.
#[derive(Debug)]
pub struct VertexCache {
    dir: PathBuf,
    entries: BTreeMap<String, CacheEntry>,
}

impl VertexCache {
    /// Open (or create) the cache in `dir`, dropping entries whose files vanished.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(DICTIONARY);
        let mut entries = BTreeMap::new();
        if path.exists() {
            match serde_json::from_slice::<Dictionary>(&fs::read(&path)?) {
                Ok(d) if d.version == VERSION => entries = d.vertices,
                Ok(d) => tracing::warn!("ignoring vertex cache of version {}", d.version),
                Err(e) => tracing::warn!("ignoring unreadable vertex cache {}: {e}", path.display()),
            }
        }
        let before = entries.len();
        entries.retain(|_, e: &mut CacheEntry| e.src_path.exists() && e.elf_path.exists());
        let cache = Self { dir, entries };
        if cache.entries.len() != before {
            tracing::debug!(pruned = before - cache.entries.len(), "pruned stale vertex cache entries");
            cache.save()?;
        }
        tracing::debug!(dir = %cache.dir.display(), entries = cache.entries.len(), "opened vertex cache");
        Ok(cache)
    }

    pub fn hash_source(source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn vertex_name(hash: &str) -> String {
        format!("vertex{}", &hash[..16.min(hash.len())])
    }

    pub fn dir(&self) -> &Path { &self.dir }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn get(&self, hash: &str) -> Option<&CacheEntry> { self.entries.get(hash) }

    pub fn source_path(&self, name: &str) -> PathBuf { self.dir.join(format!("{name}.cpp")) }
    pub fn object_path(&self, name: &str) -> PathBuf { self.dir.join(format!("{name}.elf")) }

    pub fn insert(&mut self, hash: String, entry: CacheEntry) -> Result<()> {
        self.entries.insert(hash, entry);
        self.save()
    }

    // write to a temporary file first so a crash never leaves half a dictionary
    fn save(&self) -> Result<()> {
        let dict = Dictionary { version: VERSION, vertices: self.entries.clone() };
        let text = serde_json::to_string_pretty(&dict)?;
        let tmp = self.dir.join(format!("{DICTIONARY}.tmp"));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, self.dir.join(DICTIONARY))
            .map_err(|e| Error::Cache(format!("cannot replace {DICTIONARY}: {e}")))
    }
}
