//! Kernel generation: IR, emission, source rendering, caching and compilation.

pub mod cache;
pub mod compiler;
pub mod emit;
pub mod ir;
pub mod lower;
pub mod render;

pub use cache::{CacheEntry, VertexCache};
pub use compiler::{CommandCompiler, HostCompiler, KernelCompiler};
pub use emit::EmissionContext;
pub use ir::{Access, CExpr, Field, FieldRef, FieldShape, Function, Phase, Repeat, Role, Stmt, Var, Vertex, VertexKind};
