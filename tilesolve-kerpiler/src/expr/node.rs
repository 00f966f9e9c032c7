use smallvec::{smallvec, SmallVec};
use tilesolve_arena::Idx;

use crate::{
    ops::{BinaryOp, UnaryOp},
    shape::DistributedShape,
    tensor::Tensor,
    typing::Type,
};

pub type NodeRef = Idx<Node>;

#[derive(Debug, Clone)]
pub enum Node {
    // stored tensor
    Input { tensor: Tensor },
    // literal, already rounded to `ty`
    Const { value: f64, ty: Type },
    Unary { op: UnaryOp, child: NodeRef, ty: Type },
    Binary { op: BinaryOp, lhs: NodeRef, rhs: NodeRef, ty: Type },
    Cast { child: NodeRef, ty: Type },
    // reorders trailing dimensions, perm[0] is always 0
    Permute { child: NodeRef, perm: SmallVec<[usize; 4]> },
    Broadcast { child: NodeRef, shape: DistributedShape },
    // row-wise dot product of two [n, m] operands
    Dot { lhs: NodeRef, rhs: NodeRef, ty: Type },
    // row-wise cross product of two [n, 3] operands
    Cross { lhs: NodeRef, rhs: NodeRef, ty: Type },
}

impl Node {
    pub fn upstream(&self) -> SmallVec<[NodeRef; 2]> {
        match self {
            Node::Input { .. } | Node::Const { .. } => smallvec![],
            Node::Unary { child, .. }
            | Node::Cast { child, .. }
            | Node::Permute { child, .. }
            | Node::Broadcast { child, .. } => smallvec![*child],
            Node::Binary { lhs, rhs, .. }
            | Node::Dot { lhs, rhs, .. }
            | Node::Cross { lhs, rhs, .. } => smallvec![*lhs, *rhs],
        }
    }

    // rewrite child handles after the node moved `by` slots back
    pub(crate) fn relink(self, by: u32) -> Node {
        match self {
            Node::Unary { op, child, ty } => Node::Unary { op, child: child.shift(by), ty },
            Node::Binary { op, lhs, rhs, ty } => Node::Binary { op, lhs: lhs.shift(by), rhs: rhs.shift(by), ty },
            Node::Cast { child, ty } => Node::Cast { child: child.shift(by), ty },
            Node::Permute { child, perm } => Node::Permute { child: child.shift(by), perm },
            Node::Broadcast { child, shape } => Node::Broadcast { child: child.shift(by), shape },
            Node::Dot { lhs, rhs, ty } => Node::Dot { lhs: lhs.shift(by), rhs: rhs.shift(by), ty },
            Node::Cross { lhs, rhs, ty } => Node::Cross { lhs: lhs.shift(by), rhs: rhs.shift(by), ty },
            leaf => leaf,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::Input { .. } => "input",
            Node::Const { .. } => "const",
            Node::Unary { .. } => "unary",
            Node::Binary { .. } => "binary",
            Node::Cast { .. } => "cast",
            Node::Permute { .. } => "permute",
            Node::Broadcast { .. } => "broadcast",
            Node::Dot { .. } => "dot",
            Node::Cross { .. } => "cross",
        }
    }
}
