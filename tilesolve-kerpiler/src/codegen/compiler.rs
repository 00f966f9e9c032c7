use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use auto_impl::auto_impl;
use serde::{Deserialize, Serialize};

use super::{ir::Vertex, render::expr};
use crate::{
    config::CompilerConfig,
    error::{Error, Result},
};

/// Turns a rendered vertex into a loadable object file.
#[auto_impl(&, Box, Arc)]
pub trait KernelCompiler {
    fn compile(&self, vertex: &Vertex, source: &Path, object: &Path) -> Result<()>;
}

const OBJECT_FORMAT: &str = "tilesolve-kernel";

#[derive(Serialize, Deserialize)]
struct KernelObject {
    format: String,
    version: u32,
    vertex: Vertex,
}

/// Reads an object written by [`HostCompiler`].
pub fn load_object(path: &Path) -> Result<Vertex> {
    let err = |reason: String| Error::KernelLoad { path: path.to_owned(), reason };
    let bytes = fs::read(path).map_err(|e| err(e.to_string()))?;
    let object: KernelObject = serde_json::from_slice(&bytes).map_err(|e| err(e.to_string()))?;
    if object.format != OBJECT_FORMAT {
        return Err(err(format!("unexpected object format {:?}", object.format)));
    }
    Ok(object.vertex)
}

/// Compiles for the simulated device: validates the vertex and writes it
/// out as the object the device executes.
#[derive(Debug, Clone, Default)]
pub struct HostCompiler {
    // also write a `.lst` listing of every function
    pub dump_listing: bool,
}

impl KernelCompiler for HostCompiler {
    fn compile(&self, vertex: &Vertex, _source: &Path, object: &Path) -> Result<()> {
        vertex.validate()?;
        let object_data = KernelObject { format: OBJECT_FORMAT.into(), version: 1, vertex: vertex.clone() };
        fs::write(object, serde_json::to_vec(&object_data)?)?;
        if self.dump_listing {
            fs::write(object.with_extension("lst"), listing(vertex))?;
        }
        Ok(())
    }
}

fn listing(vertex: &Vertex) -> String {
    let mut out = format!("{} ({:?})\n", vertex.name, vertex.kind);
    for (i, f) in vertex.fields.iter().enumerate() {
        out += &format!("  field {i}: {} {} {:?} {:?}\n", f.name, f.ty, f.access, f.shape);
    }
    for f in &vertex.functions {
        out += &format!("  fn {} [{:?}] args={} stmts={}\n", f.name, f.role, f.args.len(), f.body.len());
    }
    for (i, p) in vertex.phases.iter().enumerate() {
        let count = match &p.repeat {
            super::ir::Repeat::Once => "once".to_owned(),
            super::ir::Repeat::Ascending(c) => format!("ascending {}", expr(vertex, c)),
            super::ir::Repeat::Descending(c) => format!("descending {}", expr(vertex, c)),
        };
        out += &format!("  phase {i}: func{} {count}\n", p.worker);
    }
    out
}

/// Runs an external toolchain on the source first. `{src}` and `{out}`
/// in the arguments become the source path and `<object>.target`. The
/// simulated device still executes the host object written afterwards.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    pub program: String,
    pub args: Vec<String>,
    pub host: HostCompiler,
}

impl CommandCompiler {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect(), host: HostCompiler::default() }
    }

    pub fn target_path(object: &Path) -> PathBuf {
        object.with_extension("target")
    }
}

impl KernelCompiler for CommandCompiler {
    fn compile(&self, vertex: &Vertex, source: &Path, object: &Path) -> Result<()> {
        let target = Self::target_path(object);
        let (src, out) = (source.display().to_string(), target.display().to_string());
        let args: Vec<String> = self.args.iter().map(|a| a.replace("{src}", &src).replace("{out}", &out)).collect();
        tracing::info!(program = %self.program, ?args, "invoking kernel compiler");
        let output = Command::new(&self.program).args(&args).output().map_err(|e| Error::Compilation {
            name: vertex.name.clone(),
            reason: format!("cannot run {}: {e}", self.program),
        })?;
        if !output.status.success() {
            return Err(Error::Compilation {
                name: vertex.name.clone(),
                reason: format!("{} exited with {}: {}", self.program, output.status, String::from_utf8_lossy(&output.stderr).trim()),
            });
        }
        self.host.compile(vertex, source, object)
    }
}

pub fn compiler_from_config(config: &CompilerConfig, dump_listing: bool) -> Box<dyn KernelCompiler + Send + Sync> {
    match config {
        CompilerConfig::Host => Box::new(HostCompiler { dump_listing }),
        CompilerConfig::Command { program, args } => {
            let mut c = CommandCompiler::new(program.clone(), args.clone());
            c.host.dump_listing = dump_listing;
            Box::new(c)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codegen::{emit::EmissionContext, ir::VertexKind},
        typing::Type,
    };

    fn trivial() -> Vertex {
        let mut v = Vertex::new(VertexKind::Vertex);
        v.name = "vertexT".into();
        let mut cx = EmissionContext::new();
        v.functions.push(cx.compute(&[], |_, _| Ok(())).unwrap());
        v
    }

    #[test]
    fn host_objects_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("v.elf");
        HostCompiler { dump_listing: true }.compile(&trivial(), &dir.path().join("v.cpp"), &obj).unwrap();
        assert_eq!(load_object(&obj).unwrap(), trivial());
        assert!(dir.path().join("v.lst").exists());
        fs::write(&obj, "{}").unwrap();
        assert!(matches!(load_object(&obj), Err(Error::KernelLoad { .. })));
    }

    #[test]
    fn malformed_vertices_do_not_compile() {
        let dir = tempfile::tempdir().unwrap();
        let mut v = trivial();
        v.functions[0].ret = Type::Void;
        let r = HostCompiler::default().compile(&v, &dir.path().join("v.cpp"), &dir.path().join("v.elf"));
        assert!(matches!(r, Err(Error::MalformedVertex { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn external_compiler_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("v.cpp");
        fs::write(&src, "int main() {}").unwrap();
        let obj = dir.path().join("v.elf");
        let failing = CommandCompiler::new("sh", ["-c", "echo broken >&2; exit 3"]);
        match failing.compile(&trivial(), &src, &obj) {
            Err(Error::Compilation { reason, .. }) => assert!(reason.contains("broken")),
            other => panic!("unexpected {other:?}"),
        }
        let copying = CommandCompiler::new("cp", ["{src}", "{out}"]);
        copying.compile(&trivial(), &src, &obj).unwrap();
        assert!(CommandCompiler::target_path(&obj).exists());
        assert_eq!(load_object(&obj).unwrap(), trivial());
    }
}
