//! Kernel intermediate representation.
//!
//! A [`Vertex`] is the unit that gets hashed, compiled, cached and run
//! once per tile. Its functions are built from a small statement set.

use std::ops::{Add, Div, Mul, Rem, Sub};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    ops::{BinaryOp, UnaryOp},
    typing::Type,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Var {
    pub id: u32,
    pub ty: Type,
}

// position of a field in `Vertex::fields`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub index: u16,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CExpr {
    Lit { value: f64, ty: Type },
    Var(Var),
    Load { field: FieldRef, index: Box<CExpr> },
    // number of elements of a vector field on this tile
    Size(FieldRef),
    // per-tile scalar bound at connection time
    Param(FieldRef),
    Unary { op: UnaryOp, ty: Type, arg: Box<CExpr> },
    Binary { op: BinaryOp, ty: Type, lhs: Box<CExpr>, rhs: Box<CExpr> },
    Cast { ty: Type, arg: Box<CExpr> },
    Call { func: u32, ty: Type, args: Vec<CExpr> },
}

impl CExpr {
    pub fn lit(value: f64, ty: Type) -> CExpr { CExpr::Lit { value: ty.round(value), ty } }
    pub fn uint(n: usize) -> CExpr { CExpr::lit(n as f64, Type::Uint32) }
    pub fn load(field: FieldRef, index: CExpr) -> CExpr { CExpr::Load { field, index: Box::new(index) } }

    pub fn ty(&self) -> Type {
        match self {
            CExpr::Lit { ty, .. }
            | CExpr::Unary { ty, .. }
            | CExpr::Binary { ty, .. }
            | CExpr::Cast { ty, .. }
            | CExpr::Call { ty, .. } => *ty,
            CExpr::Var(v) => v.ty,
            CExpr::Load { field, .. } | CExpr::Param(field) => field.ty,
            CExpr::Size(_) => Type::Uint32,
        }
    }

    pub fn unary(op: UnaryOp, arg: CExpr) -> Result<CExpr> {
        let ty = op.infer(arg.ty())?;
        Ok(CExpr::Unary { op, ty, arg: Box::new(arg) })
    }

    pub fn binary(op: BinaryOp, lhs: CExpr, rhs: CExpr) -> Result<CExpr> {
        let ty = op.infer(lhs.ty(), rhs.ty())?;
        Ok(CExpr::Binary { op, ty, lhs: Box::new(lhs), rhs: Box::new(rhs) })
    }

    // for operands whose types are known to combine
    fn typed(op: BinaryOp, lhs: CExpr, rhs: CExpr) -> CExpr {
        let ty = op.infer(lhs.ty(), rhs.ty()).unwrap_or_else(|_| Type::larger(lhs.ty(), rhs.ty()));
        CExpr::Binary { op, ty, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn cast(self, ty: Type) -> CExpr {
        if self.ty() == ty { self } else { CExpr::Cast { ty, arg: Box::new(self) } }
    }

    pub fn lt(self, rhs: CExpr) -> CExpr { CExpr::typed(BinaryOp::LessThan, self, rhs) }
    pub fn le(self, rhs: CExpr) -> CExpr { CExpr::typed(BinaryOp::LessEqual, self, rhs) }
    pub fn gt(self, rhs: CExpr) -> CExpr { CExpr::typed(BinaryOp::GreaterThan, self, rhs) }
    pub fn ge(self, rhs: CExpr) -> CExpr { CExpr::typed(BinaryOp::GreaterEqual, self, rhs) }
    pub fn equals(self, rhs: CExpr) -> CExpr { CExpr::typed(BinaryOp::Equal, self, rhs) }
    pub fn and(self, rhs: CExpr) -> CExpr { CExpr::typed(BinaryOp::LogicalAnd, self, rhs) }
    pub fn min(self, rhs: CExpr) -> CExpr { CExpr::typed(BinaryOp::Minimum, self, rhs) }
}

macro_rules! impl_cexpr_op {
    ($Trait: ident, $method: ident, $Op: ident) => {
        impl $Trait for CExpr {
            type Output = CExpr;
            fn $method(self, rhs: CExpr) -> CExpr { CExpr::typed(BinaryOp::$Op, self, rhs) }
        }
    };
}

impl_cexpr_op!(Add, add, Add);
impl_cexpr_op!(Sub, sub, Subtract);
impl_cexpr_op!(Mul, mul, Multiply);
impl_cexpr_op!(Div, div, Divide);
impl_cexpr_op!(Rem, rem, Remainder);

impl From<Var> for CExpr {
    fn from(v: Var) -> CExpr { CExpr::Var(v) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stmt {
    Declare { var: Var, init: Option<CExpr> },
    Assign { var: Var, value: CExpr },
    Store { field: FieldRef, index: CExpr, value: CExpr },
    If { cond: CExpr, then: Vec<Stmt>, otherwise: Vec<Stmt> },
    While { cond: CExpr, body: Vec<Stmt> },
    // `for (var = start; var < end; var += step)`
    For { var: Var, start: CExpr, end: CExpr, step: CExpr, body: Vec<Stmt> },
    Break,
    Continue,
    Return(Option<CExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Worker,
    Supervisor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: u32,
    pub name: String,
    pub role: Role,
    pub ret: Type,
    pub args: Vec<Var>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VertexKind {
    // one thread per tile
    Vertex,
    // compute runs once per worker with the worker id
    MultiVertex,
    // phases of worker functions separated by barriers
    SupervisorVertex,
}

impl VertexKind {
    pub fn base_class(self) -> &'static str {
        match self {
            VertexKind::Vertex => "Vertex",
            VertexKind::MultiVertex => "MultiVertex",
            VertexKind::SupervisorVertex => "SupervisorVertex",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Access {
    Input,
    Output,
    InOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldShape {
    Vector,
    Param,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: Type,
    pub access: Access,
    pub shape: FieldShape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Repeat {
    Once,
    // iteration counter runs 0, 1, .., count - 1
    Ascending(CExpr),
    // iteration counter runs count - 1, .., 0
    Descending(CExpr),
}

/// All workers run `worker` (with the iteration number) and then meet at
/// a barrier before the next iteration or phase starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub worker: u32,
    pub repeat: Repeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub name: String,
    pub kind: VertexKind,
    pub fields: Vec<Field>,
    pub functions: Vec<Function>,
    pub phases: Vec<Phase>,
}

pub const COMPUTE: &str = "compute";

impl Vertex {
    pub fn new(kind: VertexKind) -> Self {
        Self { name: String::new(), kind, fields: vec![], functions: vec![], phases: vec![] }
    }

    pub fn add_field(&mut self, name: impl Into<String>, ty: Type, access: Access, shape: FieldShape) -> FieldRef {
        self.fields.push(Field { name: name.into(), ty, access, shape });
        FieldRef { index: (self.fields.len() - 1) as u16, ty }
    }

    pub fn field(&self, f: FieldRef) -> &Field { &self.fields[f.index as usize] }

    pub fn function(&self, id: u32) -> Option<&Function> {
        self.functions.iter().find(|f| f.id == id)
    }

    pub fn compute(&self) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == COMPUTE)
    }

    // one slot per variable id used anywhere in the vertex
    pub fn num_vars(&self) -> usize {
        fn walk(stmts: &[Stmt], max: &mut u32) {
            for s in stmts {
                match s {
                    Stmt::Declare { var, .. } | Stmt::Assign { var, .. } => *max = (*max).max(var.id + 1),
                    Stmt::For { var, body, .. } => {
                        *max = (*max).max(var.id + 1);
                        walk(body, max);
                    }
                    Stmt::If { then, otherwise, .. } => {
                        walk(then, max);
                        walk(otherwise, max);
                    }
                    Stmt::While { body, .. } => walk(body, max),
                    _ => {}
                }
            }
        }
        let mut max = 0;
        for f in &self.functions {
            for a in &f.args { max = max.max(a.id + 1); }
            walk(&f.body, &mut max);
        }
        max as usize
    }

    /// Check the structural rules the device relies on.
    pub fn validate(&self) -> Result<()> {
        let bad = |reason: &str| Err(Error::MalformedVertex { name: self.name.clone(), reason: reason.into() });
        if self.fields.len() > u16::MAX as usize {
            return bad("too many fields");
        }
        match self.kind {
            VertexKind::Vertex | VertexKind::MultiVertex => {
                let Some(compute) = self.compute() else { return bad("missing compute function") };
                if compute.ret != Type::Bool {
                    return bad("compute must return bool");
                }
                let args = if self.kind == VertexKind::Vertex { 0 } else { 1 };
                if compute.args.len() != args {
                    return bad("wrong number of compute arguments");
                }
                if !self.phases.is_empty() {
                    return bad("only supervisor vertices have phases");
                }
            }
            VertexKind::SupervisorVertex => {
                if self.compute().is_some() {
                    return bad("supervisor vertices are driven by phases, not compute");
                }
                if self.phases.is_empty() {
                    return bad("supervisor vertex without phases");
                }
                for phase in &self.phases {
                    match self.function(phase.worker) {
                        Some(f) if f.role == Role::Worker && f.args.len() == 2 => {}
                        _ => return bad("phase worker must be a worker function of (worker id, iteration)"),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute(args: Vec<Var>, ret: Type) -> Function {
        Function { id: 0, name: COMPUTE.into(), role: Role::Worker, ret, args, body: vec![Stmt::Return(Some(CExpr::lit(1.0, Type::Bool)))] }
    }

    #[test]
    fn validation_rules() {
        let mut v = Vertex::new(VertexKind::MultiVertex);
        v.functions.push(compute(vec![], Type::Bool));
        assert!(v.validate().is_err());
        v.functions[0] = compute(vec![Var { id: 0, ty: Type::Uint32 }], Type::Void);
        assert!(v.validate().is_err());
        v.functions[0] = compute(vec![Var { id: 0, ty: Type::Uint32 }], Type::Bool);
        assert!(v.validate().is_ok());
        assert_eq!(v.num_vars(), 1);

        let mut s = Vertex::new(VertexKind::SupervisorVertex);
        assert!(s.validate().is_err());
        let worker = Function { id: 1, name: "func1".into(), role: Role::Worker, ret: Type::Void, args: vec![], body: vec![] };
        s.functions.push(worker);
        s.phases.push(Phase { worker: 1, repeat: Repeat::Once });
        assert!(s.validate().is_err());
        s.functions[0].args = vec![Var { id: 0, ty: Type::Uint32 }, Var { id: 1, ty: Type::Uint32 }];
        assert!(s.validate().is_ok());
    }

    #[test]
    fn index_arithmetic_stays_unsigned() {
        let i = CExpr::Var(Var { id: 3, ty: Type::Uint32 });
        let e = i.clone() * CExpr::uint(4) + CExpr::uint(1);
        assert_eq!(e.ty(), Type::Uint32);
        assert_eq!(i.lt(CExpr::uint(2)).ty(), Type::Bool);
        assert_eq!(CExpr::uint(2).cast(Type::Float32).ty(), Type::Float32);
    }
}
