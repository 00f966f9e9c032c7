use std::{
    cell::OnceCell,
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
};

use smallvec::SmallVec;
use tilesolve_arena::Arena;

use super::{Node, NodeRef};
use crate::{
    error::{Error, Result},
    ops::{BinaryOp, UnaryOp},
    shape::{DistributedShape, TileMapping},
    tensor::Tensor,
    typing::{format_literal, Type},
};

/// A lazily evaluated expression over device tensors.
///
/// Cloning copies the node arena, so expressions never alias each other.
/// Shape and tile mapping are computed on first access and memoized.
#[derive(Clone)]
pub struct Expression {
    nodes: Arena<Node>,
    root: NodeRef,
    shape: OnceCell<DistributedShape>,
    mapping: OnceCell<TileMapping>,
}

impl Expression {
    fn leaf(node: Node) -> Self {
        let mut nodes = Arena::new();
        let root = nodes.alloc(node);
        Self { nodes, root, shape: OnceCell::new(), mapping: OnceCell::new() }
    }

    // push `node` on top of this expression's arena
    fn grow(mut self, make: impl FnOnce(NodeRef) -> Node) -> Self {
        let root = self.nodes.alloc(make(self.root));
        Self { nodes: self.nodes, root, shape: OnceCell::new(), mapping: OnceCell::new() }
    }

    // merge two arenas, the right one is appended after the left one
    fn join(lhs: Expression, rhs: Expression, make: impl FnOnce(NodeRef, NodeRef) -> Node) -> Self {
        let mut nodes = lhs.nodes;
        let offset = nodes.append(rhs.nodes, |node, by| node.relink(by));
        let (l, r) = (lhs.root, rhs.root.shift(offset));
        let root = nodes.alloc(make(l, r));
        Self { nodes, root, shape: OnceCell::new(), mapping: OnceCell::new() }
    }

    pub fn input(tensor: &Tensor) -> Self {
        Self::leaf(Node::Input { tensor: tensor.clone() })
    }

    /// A scalar literal. The value is rounded into `ty` right away.
    pub fn constant(value: f64, ty: Type) -> Self {
        Self::leaf(Node::Const { value: ty.round(value), ty })
    }

    pub fn unary(self, op: UnaryOp) -> Result<Self> {
        let ty = op.infer(self.ty())?;
        Ok(self.grow(|child| Node::Unary { op, child, ty }))
    }

    /// Combine two expressions elementwise. Fails right here when the
    /// shapes cannot be broadcast, not later at materialization.
    pub fn binary(op: BinaryOp, lhs: Expression, rhs: Expression) -> Result<Self> {
        let ty = op.infer(lhs.ty(), rhs.ty())?;
        if DistributedShape::broadcast(lhs.shape(), rhs.shape()).is_none() {
            return Err(Error::IncompatibleBroadcast {
                lhs: lhs.shape().to_string(),
                rhs: rhs.shape().to_string(),
            });
        }
        Ok(Self::join(lhs, rhs, |lhs, rhs| Node::Binary { op, lhs, rhs, ty }))
    }

    pub fn cast(self, ty: Type) -> Self {
        if self.ty() == ty {
            return self;
        }
        self.grow(|child| Node::Cast { child, ty })
    }

    /// Reorder trailing dimensions. The leading dimension is distributed
    /// and therefore has to stay in place.
    pub fn permute(self, perm: &[usize]) -> Result<Self> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        let valid = perm.len() == rank
            && perm.first() == Some(&0)
            && perm.iter().all(|p| *p < rank && !std::mem::replace(&mut seen[*p], true));
        if !valid {
            return Err(Error::InvalidPermutation { perm: perm.to_vec(), rank });
        }
        if perm.iter().enumerate().all(|(i, p)| i == *p) {
            return Ok(self);
        }
        let perm: SmallVec<[usize; 4]> = perm.iter().copied().collect();
        Ok(self.grow(|child| Node::Permute { child, perm }))
    }

    /// Explicitly broadcast to `shape`, which must be at least as large.
    pub fn broadcast(self, shape: &DistributedShape) -> Result<Self> {
        let err = || Error::IncompatibleBroadcast {
            lhs: self.shape().to_string(),
            rhs: shape.to_string(),
        };
        if shape.rank() < self.rank() {
            return Err(err());
        }
        match DistributedShape::broadcast(self.shape(), shape) {
            Some(s) if &s == shape => {}
            _ => return Err(err()),
        }
        if self.shape() == shape {
            return Ok(self);
        }
        let shape = shape.clone();
        Ok(self.grow(|child| Node::Broadcast { child, shape }))
    }

    /// Row-wise dot product of two `[n, m]` operands, giving `[n, 1]`.
    pub fn dot(lhs: Expression, rhs: Expression) -> Result<Self> {
        let (a, b) = (lhs.shape(), rhs.shape());
        if a.rank() != 2 || b.rank() != 2 || a.dim(1) != b.dim(1) || a.dim(1) < 2 {
            return Err(Error::ShapeMismatch {
                expected: "two [n, m] operands with m > 1".into(),
                got: format!("{a} and {b}"),
            });
        }
        let ty = row_product_type("dot", lhs.ty(), rhs.ty())?;
        Self::check_rows(&lhs, &rhs)?;
        Ok(Self::join(lhs, rhs, |lhs, rhs| Node::Dot { lhs, rhs, ty }))
    }

    /// Row-wise cross product of two `[n, 3]` operands.
    pub fn cross(lhs: Expression, rhs: Expression) -> Result<Self> {
        let (a, b) = (lhs.shape(), rhs.shape());
        if a.rank() != 2 || b.rank() != 2 || a.dim(1) != 3 || b.dim(1) != 3 {
            return Err(Error::ShapeMismatch {
                expected: "two [n, 3] operands".into(),
                got: format!("{a} and {b}"),
            });
        }
        let ty = row_product_type("cross", lhs.ty(), rhs.ty())?;
        Self::check_rows(&lhs, &rhs)?;
        Ok(Self::join(lhs, rhs, |lhs, rhs| Node::Cross { lhs, rhs, ty }))
    }

    // leading dimensions must broadcast for row-wise products
    fn check_rows(lhs: &Expression, rhs: &Expression) -> Result<()> {
        match DistributedShape::broadcast(lhs.shape(), rhs.shape()) {
            Some(_) => Ok(()),
            None => Err(Error::IncompatibleBroadcast {
                lhs: lhs.shape().to_string(),
                rhs: rhs.shape().to_string(),
            }),
        }
    }

    pub fn nodes(&self) -> &Arena<Node> { &self.nodes }
    pub fn root(&self) -> NodeRef { self.root }

    pub fn ty(&self) -> Type { self.ty_of(self.root) }
    pub fn rank(&self) -> usize { self.shape().rank() }
    pub fn num_elements(&self) -> usize { self.shape().num_elements() }

    pub fn shape(&self) -> &DistributedShape {
        self.shape.get_or_init(|| self.shape_of(self.root))
    }

    /// Where the result of this expression lives once materialized. A bare
    /// input keeps its own mapping, anything else is laid out linearly.
    pub fn tile_mapping(&self) -> &TileMapping {
        self.mapping.get_or_init(|| match &self.nodes[self.root] {
            Node::Input { tensor } => tensor.tile_mapping().clone(),
            _ => TileMapping::linear(self.shape()),
        })
    }

    /// The backing tensor if this expression is nothing but an input.
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match &self.nodes[self.root] {
            Node::Input { tensor } => Some(tensor),
            _ => None,
        }
    }

    // every distinct input tensor, in first-use order
    pub fn inputs(&self) -> Vec<Tensor> {
        let mut out: Vec<Tensor> = vec![];
        for node in self.nodes.values() {
            if let Node::Input { tensor } = node {
                if !out.iter().any(|t| t.id() == tensor.id()) {
                    out.push(tensor.clone());
                }
            }
        }
        out
    }

    pub fn ty_of(&self, idx: NodeRef) -> Type {
        match &self.nodes[idx] {
            Node::Input { tensor } => tensor.ty(),
            Node::Const { ty, .. }
            | Node::Unary { ty, .. }
            | Node::Binary { ty, .. }
            | Node::Cast { ty, .. }
            | Node::Dot { ty, .. }
            | Node::Cross { ty, .. } => *ty,
            Node::Permute { child, .. } | Node::Broadcast { child, .. } => self.ty_of(*child),
        }
    }

    pub fn shape_of(&self, idx: NodeRef) -> DistributedShape {
        match &self.nodes[idx] {
            Node::Input { tensor } => tensor.shape().clone(),
            Node::Const { .. } => DistributedShape::scalar(0),
            Node::Unary { child, .. } | Node::Cast { child, .. } => self.shape_of(*child),
            Node::Binary { lhs, rhs, .. } | Node::Cross { lhs, rhs, .. } => self.broadcast_of(*lhs, *rhs),
            Node::Dot { lhs, rhs, .. } => self.broadcast_of(*lhs, *rhs).collapsed(1),
            Node::Permute { child, perm } => self.shape_of(*child).permuted(perm),
            Node::Broadcast { shape, .. } => shape.clone(),
        }
    }

    // operands of a binary node are checked to broadcast when it is built
    fn broadcast_of(&self, lhs: NodeRef, rhs: NodeRef) -> DistributedShape {
        let (l, r) = (self.shape_of(lhs), self.shape_of(rhs));
        let shape = DistributedShape::broadcast(&l, &r);
        debug_assert!(shape.is_some(), "operands {l} and {r} of a binary node do not broadcast");
        shape.unwrap_or(l)
    }

    /// Structural hash of the whole tree. Equal trees hash equal no matter
    /// which tensors they read.
    pub fn hash(&self) -> u64 {
        let mut memo: Vec<u64> = Vec::with_capacity(self.nodes.len());
        for (_, node) in self.nodes.iter() {
            let mut h = DefaultHasher::new();
            node.kind().hash(&mut h);
            match node {
                Node::Input { tensor } => {
                    tensor.ty().hash(&mut h);
                    tensor.shape().global_shape().hash(&mut h);
                }
                Node::Const { value, ty } => {
                    ty.hash(&mut h);
                    format_literal(*value, *ty).hash(&mut h);
                }
                Node::Unary { op, ty, .. } => (op, ty).hash(&mut h),
                Node::Binary { op, ty, .. } => (op, ty).hash(&mut h),
                Node::Cast { ty, .. } | Node::Dot { ty, .. } | Node::Cross { ty, .. } => ty.hash(&mut h),
                Node::Permute { perm, .. } => perm.hash(&mut h),
                Node::Broadcast { shape, .. } => shape.global_shape().hash(&mut h),
            }
            for child in node.upstream() {
                memo[child.index()].hash(&mut h);
            }
            memo.push(h.finish());
        }
        memo[self.root.index()]
    }

    /// Human readable form, e.g. `add(input<4x3, float32>, const<float32>(1.00000000e+00f))`.
    pub fn as_string(&self) -> String {
        self.string_of(self.root)
    }

    fn string_of(&self, idx: NodeRef) -> String {
        match &self.nodes[idx] {
            Node::Input { tensor } => format!("input<{}, {}>", tensor.shape(), tensor.ty()),
            Node::Const { value, ty } => format!("const<{ty}>({})", format_literal(*value, *ty)),
            Node::Unary { op, child, .. } => format!("{}({})", op.name(), self.string_of(*child)),
            Node::Binary { op, lhs, rhs, .. } => {
                format!("{}({}, {})", op.name(), self.string_of(*lhs), self.string_of(*rhs))
            }
            Node::Cast { child, ty } => format!("cast<{ty}>({})", self.string_of(*child)),
            Node::Permute { child, perm } => format!("permute<{perm:?}>({})", self.string_of(*child)),
            Node::Broadcast { child, shape } => format!("broadcast<{shape}>({})", self.string_of(*child)),
            Node::Dot { lhs, rhs, .. } => format!("dot({}, {})", self.string_of(*lhs), self.string_of(*rhs)),
            Node::Cross { lhs, rhs, .. } => format!("cross({}, {})", self.string_of(*lhs), self.string_of(*rhs)),
        }
    }
}

fn row_product_type(op: &'static str, lhs: Type, rhs: Type) -> Result<Type> {
    let ty = BinaryOp::Multiply.infer(lhs, rhs)?;
    if ty.is_bool() {
        return Err(Error::TypeMismatch { op, lhs, rhs });
    }
    Ok(ty)
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::tests::{runtime, shape};

    fn scaled_sum(t: &Tensor, k: f64) -> Expression {
        let scaled = Expression::binary(BinaryOp::Multiply, t.expr(), Expression::constant(k, Type::Float32)).unwrap();
        Expression::binary(BinaryOp::Add, scaled, t.expr()).unwrap()
    }

    #[test]
    fn non_broadcastable_operands_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let a = Tensor::zeros(&rt, Type::Float32, shape(&[2, 3], 2)).unwrap();
        let taller = Tensor::zeros(&rt, Type::Float32, shape(&[4, 3], 2)).unwrap();
        let wider = Tensor::zeros(&rt, Type::Float32, shape(&[2, 4], 2)).unwrap();
        for other in [&taller, &wider] {
            let err = Expression::binary(BinaryOp::Add, a.expr(), other.expr()).unwrap_err();
            assert!(matches!(err, Error::IncompatibleBroadcast { .. }), "{err}");
            assert!(Expression::binary(BinaryOp::Subtract, other.expr(), a.expr()).is_err());
        }
        // the failure leaves the operands usable
        let sum = Expression::binary(BinaryOp::Add, a.expr(), a.expr()).unwrap();
        assert_eq!(sum.shape(), a.shape());
        assert_eq!(sum.ty(), Type::Float32);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "do not broadcast")]
    fn unchecked_binary_node_is_caught() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let a = Tensor::zeros(&rt, Type::Float32, shape(&[2, 3], 2)).unwrap();
        let b = Tensor::zeros(&rt, Type::Float32, shape(&[2, 4], 2)).unwrap();
        let e = Expression::join(a.expr(), b.expr(), |lhs, rhs| Node::Binary { op: BinaryOp::Add, lhs, rhs, ty: Type::Float32 });
        e.shape();
    }

    #[test]
    fn permutations_keep_the_leading_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let t = Tensor::zeros(&rt, Type::Int32, shape(&[2, 3, 4], 2)).unwrap();
        for perm in [&[1, 0, 2][..], &[0, 1], &[0, 1, 1], &[0, 2, 3]] {
            assert!(matches!(t.expr().permute(perm), Err(Error::InvalidPermutation { .. })), "{perm:?}");
        }
        let p = t.expr().permute(&[0, 2, 1]).unwrap();
        assert_eq!(p.shape().global_shape().dims(), &[2, 4, 3]);
        assert_eq!(p.shape().distribution(), t.shape().distribution());
        assert!(t.expr().permute(&[0, 1, 2]).unwrap().as_tensor().is_some());
    }

    #[test]
    fn explicit_broadcast_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let v = Tensor::zeros(&rt, Type::Float32, shape(&[3], 1)).unwrap();
        let m = Tensor::zeros(&rt, Type::Float32, shape(&[2, 3], 2)).unwrap();
        let b = v.expr().broadcast(m.shape()).unwrap();
        assert_eq!(b.shape(), m.shape());
        assert!(matches!(m.expr().broadcast(v.shape()), Err(Error::IncompatibleBroadcast { .. })));
        assert!(v.expr().broadcast(&shape(&[2, 4], 2)).is_err());
    }

    #[test]
    fn structural_hash_ignores_which_tensors_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let a = Tensor::zeros(&rt, Type::Float32, shape(&[4, 3], 2)).unwrap();
        let b = Tensor::zeros(&rt, Type::Float32, shape(&[4, 3], 2)).unwrap();
        let wide = Tensor::zeros(&rt, Type::Float64, shape(&[4, 3], 2)).unwrap();
        assert_eq!(scaled_sum(&a, 2.0).hash(), scaled_sum(&b, 2.0).hash());
        assert_ne!(scaled_sum(&a, 2.0).hash(), scaled_sum(&a, 3.0).hash());
        assert_ne!(scaled_sum(&a, 2.0).hash(), scaled_sum(&wide, 2.0).hash());

        let scaled = Expression::binary(BinaryOp::Multiply, a.expr(), Expression::constant(2.0, Type::Float32)).unwrap();
        let swapped = Expression::binary(BinaryOp::Add, a.expr(), scaled).unwrap();
        assert_ne!(scaled_sum(&a, 2.0).hash(), swapped.hash());
        assert_ne!(a.expr().unary(UnaryOp::Sqrt).unwrap().hash(), a.expr().unary(UnaryOp::Cos).unwrap().hash());
    }

    #[test]
    fn readable_form() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(&dir);
        let t = Tensor::zeros(&rt, Type::Float32, shape(&[4, 3], 2)).unwrap();
        let e = Expression::binary(BinaryOp::Add, t.expr(), Expression::constant(1.0, Type::Float32)).unwrap();
        assert_eq!(e.as_string(), "add(input<4x3, float32>, const<float32>(1.00000000e+00f))");
        assert_eq!(e.to_string(), e.as_string());
        assert_eq!(t.expr().cast(Type::Float64).as_string(), "cast<float64>(input<4x3, float32>)");
        assert_eq!(Expression::constant(0.5, Type::Float64).as_string(), "const<float64>(5.0000000000000000e-01)");
    }
}
