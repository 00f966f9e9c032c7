//! Lazily built elementwise expressions over tensors.
//!
//! An [`Expression`] owns a flat arena of [`Node`]s. Children are allocated
//! before parents, so walking the arena front to back visits every node
//! after its operands.

mod node;
pub use node::*;
mod expression;
pub use expression::*;
mod operators;
pub use operators::*;
