use std::collections::HashMap;

use super::{
    emit::EmissionContext,
    ir::{CExpr, FieldRef, Var},
};
use crate::{
    error::{Error, Result},
    expr::{Expression, Node, NodeRef},
    ops::BinaryOp,
    typing::Type,
};

/// Inlines an expression tree into scalar kernel code.
///
/// Every node is generated at a multi-index of its own shape. Index 0 is
/// the tile-local row; trailing indices are global. A size-1 dimension of
/// an operand always reads index 0, which is how broadcasting happens.
pub struct Lowering<'e> {
    expr: &'e Expression,
    fields: HashMap<u64, FieldRef>,
}

impl<'e> Lowering<'e> {
    // `fields` maps tensor ids to the vertex fields they are connected to
    pub fn new(expr: &'e Expression, fields: HashMap<u64, FieldRef>) -> Self {
        Self { expr, fields }
    }

    pub fn gen(&self, cx: &mut EmissionContext, node: NodeRef, idx: &[CExpr]) -> Result<CExpr> {
        match &self.expr.nodes()[node] {
            Node::Input { tensor } => {
                let field = self
                    .fields
                    .get(&tensor.id())
                    .ok_or_else(|| Error::Internal(format!("tensor {} has no field", tensor.id())))?;
                let dims = tensor.shape().global_shape().dims();
                let idx = project(dims, idx)?;
                Ok(CExpr::load(*field, linear_index(dims, &idx)))
            }
            Node::Const { value, ty } => Ok(CExpr::lit(*value, *ty)),
            Node::Unary { op, child, ty } => {
                let arg = self.gen_child(cx, *child, idx)?;
                Ok(CExpr::Unary { op: *op, ty: *ty, arg: Box::new(arg) })
            }
            Node::Binary { op, lhs, rhs, ty } => {
                let l = self.gen_child(cx, *lhs, idx)?;
                let r = self.gen_child(cx, *rhs, idx)?;
                Ok(CExpr::Binary { op: *op, ty: *ty, lhs: Box::new(l), rhs: Box::new(r) })
            }
            Node::Cast { child, ty } => Ok(self.gen_child(cx, *child, idx)?.cast(*ty)),
            Node::Permute { child, perm } => {
                let mut inner = vec![CExpr::uint(0); idx.len()];
                for (k, p) in perm.iter().enumerate() {
                    inner[*p] = idx[k].clone();
                }
                self.gen(cx, *child, &inner)
            }
            Node::Broadcast { child, .. } => self.gen_child(cx, *child, idx),
            Node::Dot { lhs, rhs, ty } => {
                let m = self.expr.shape_of(*lhs).dim(1).max(self.expr.shape_of(*rhs).dim(1));
                let ty = *ty;
                let acc = cx.declare(ty, CExpr::lit(0.0, ty));
                cx.for_range(CExpr::uint(0), CExpr::uint(m), CExpr::uint(1), |cx, j| {
                    let at = [idx[0].clone(), CExpr::Var(j)];
                    let a = self.gen_child(cx, *lhs, &at)?.cast(ty);
                    let b = self.gen_child(cx, *rhs, &at)?.cast(ty);
                    let product = CExpr::Binary { op: BinaryOp::Multiply, ty, lhs: Box::new(a), rhs: Box::new(b) };
                    cx.assign(acc, CExpr::Binary { op: BinaryOp::Add, ty, lhs: Box::new(acc.into()), rhs: Box::new(product) });
                    Ok(())
                })?;
                Ok(acc.into())
            }
            Node::Cross { lhs, rhs, ty } => {
                let ty = *ty;
                let k = idx[1].clone();
                let k1 = cx.declare(Type::Uint32, (k.clone() + CExpr::uint(1)) % CExpr::uint(3));
                let k2 = cx.declare(Type::Uint32, (k + CExpr::uint(2)) % CExpr::uint(3));
                let mut component = |a_at: Var, b_at: Var| -> Result<CExpr> {
                    let a = self.gen_child(cx, *lhs, &[idx[0].clone(), a_at.into()])?.cast(ty);
                    let b = self.gen_child(cx, *rhs, &[idx[0].clone(), b_at.into()])?.cast(ty);
                    Ok(CExpr::Binary { op: BinaryOp::Multiply, ty, lhs: Box::new(a), rhs: Box::new(b) })
                };
                let first = component(k1, k2)?;
                let second = component(k2, k1)?;
                Ok(CExpr::Binary { op: BinaryOp::Subtract, ty, lhs: Box::new(first), rhs: Box::new(second) })
            }
        }
    }

    fn gen_child(&self, cx: &mut EmissionContext, child: NodeRef, idx: &[CExpr]) -> Result<CExpr> {
        let shape = self.expr.shape_of(child);
        let idx = project(shape.global_shape().dims(), idx)?;
        self.gen(cx, child, &idx)
    }
}

// right-align `idx` onto an operand with extents `dims`
fn project(dims: &[usize], idx: &[CExpr]) -> Result<Vec<CExpr>> {
    let offset = idx.len().checked_sub(dims.len()).ok_or_else(|| {
        Error::Internal(format!("operand of rank {} under a node of rank {}", dims.len(), idx.len()))
    })?;
    Ok(dims
        .iter()
        .enumerate()
        .map(|(k, d)| if *d == 1 { CExpr::uint(0) } else { idx[offset + k].clone() })
        .collect())
}

fn is_zero(e: &CExpr) -> bool {
    matches!(e, CExpr::Lit { value, .. } if *value == 0.0)
}

// row-major flattening, skipping terms that are known to vanish
pub fn linear_index(dims: &[usize], idx: &[CExpr]) -> CExpr {
    let mut flat: Option<CExpr> = None;
    let mut stride = 1;
    for (d, i) in dims.iter().zip(idx).rev() {
        if !is_zero(i) {
            let term = if stride == 1 { i.clone() } else { i.clone() * CExpr::uint(stride) };
            flat = Some(match flat {
                Some(f) => term + f,
                None => term,
            });
        }
        stride *= d;
    }
    flat.unwrap_or_else(|| CExpr::uint(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_dimensions_read_index_zero() {
        let i = CExpr::Var(Var { id: 0, ty: Type::Uint32 });
        let j = CExpr::Var(Var { id: 1, ty: Type::Uint32 });
        let p = project(&[1, 3], &[i.clone(), j.clone()]).unwrap();
        assert!(is_zero(&p[0]));
        assert_eq!(p[1], j);
        // lower rank operands align to the right
        let p = project(&[3], &[i, j.clone()]).unwrap();
        assert_eq!(p, vec![j]);
        assert!(project(&[2, 3, 4], &[CExpr::uint(0)]).is_err());
    }

    #[test]
    fn flattening_skips_zero_terms() {
        let i = CExpr::Var(Var { id: 0, ty: Type::Uint32 });
        assert!(is_zero(&linear_index(&[1, 1], &[CExpr::uint(0), CExpr::uint(0)])));
        assert_eq!(linear_index(&[4, 1], &[i.clone(), CExpr::uint(0)]), i);
        let e = linear_index(&[4, 3], &[i.clone(), i.clone()]);
        assert_eq!(e, (i.clone() * CExpr::uint(3)) + i);
    }
}
