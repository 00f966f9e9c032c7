use super::ir::{CExpr, FieldRef, Function, Role, Stmt, Var, COMPUTE};
use crate::{error::Result, typing::Type};

/// Builder state for one kernel.
///
/// Variable and function numbering restarts with every context, so the
/// same kernel always renders to the same text.
#[derive(Debug)]
pub struct EmissionContext {
    next_var: u32,
    next_func: u32,
    blocks: Vec<Vec<Stmt>>,
}

impl Default for EmissionContext {
    fn default() -> Self { Self::new() }
}

impl EmissionContext {
    pub fn new() -> Self {
        Self { next_var: 0, next_func: 0, blocks: vec![vec![]] }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn fresh(&mut self, ty: Type) -> Var {
        self.next_var += 1;
        Var { id: self.next_var - 1, ty }
    }

    pub fn emit(&mut self, stmt: Stmt) {
        if let Some(block) = self.blocks.last_mut() {
            block.push(stmt);
        }
    }

    /// Declare a fresh variable of type `ty` initialised with `init`.
    pub fn declare(&mut self, ty: Type, init: CExpr) -> Var {
        let var = self.fresh(ty);
        self.emit(Stmt::Declare { var, init: Some(init.cast(ty)) });
        var
    }

    pub fn assign(&mut self, var: Var, value: CExpr) {
        self.emit(Stmt::Assign { var, value: value.cast(var.ty) });
    }

    pub fn store(&mut self, field: FieldRef, index: CExpr, value: CExpr) {
        self.emit(Stmt::Store { field, index, value: value.cast(field.ty) });
    }

    pub fn ret(&mut self, value: Option<CExpr>) {
        self.emit(Stmt::Return(value));
    }

    pub fn brk(&mut self) { self.emit(Stmt::Break) }
    pub fn cont(&mut self) { self.emit(Stmt::Continue) }

    // collect whatever `f` emits into a separate block
    fn block(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<Vec<Stmt>> {
        self.blocks.push(vec![]);
        let done = f(self);
        let body = self.blocks.pop().unwrap_or_default();
        done.map(|_| body)
    }

    pub fn for_range(
        &mut self,
        start: CExpr,
        end: CExpr,
        step: CExpr,
        f: impl FnOnce(&mut Self, Var) -> Result<()>,
    ) -> Result<()> {
        let var = self.fresh(Type::Uint32);
        let body = self.block(|cx| f(cx, var))?;
        self.emit(Stmt::For { var, start, end, step, body });
        Ok(())
    }

    pub fn if_then(&mut self, cond: CExpr, then: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        let then = self.block(then)?;
        self.emit(Stmt::If { cond, then, otherwise: vec![] });
        Ok(())
    }

    pub fn if_else(
        &mut self,
        cond: CExpr,
        then: impl FnOnce(&mut Self) -> Result<()>,
        otherwise: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        let then = self.block(then)?;
        let otherwise = self.block(otherwise)?;
        self.emit(Stmt::If { cond, then, otherwise });
        Ok(())
    }

    pub fn while_loop(&mut self, cond: CExpr, body: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        let body = self.block(body)?;
        self.emit(Stmt::While { cond, body });
        Ok(())
    }

    /// Build a function. `name` of `None` gives the next `func{n}` name.
    pub fn function(
        &mut self,
        name: Option<&str>,
        role: Role,
        ret: Type,
        args: &[Type],
        f: impl FnOnce(&mut Self, &[Var]) -> Result<()>,
    ) -> Result<Function> {
        let id = self.next_func;
        self.next_func += 1;
        let args: Vec<Var> = args.iter().map(|ty| self.fresh(*ty)).collect();
        let body = self.block(|cx| f(cx, &args))?;
        let name = name.map(str::to_owned).unwrap_or_else(|| format!("func{id}"));
        Ok(Function { id, name, role, ret, args, body })
    }

    // the entry point of a Vertex or MultiVertex, always returns true at the end
    pub fn compute(&mut self, args: &[Type], f: impl FnOnce(&mut Self, &[Var]) -> Result<()>) -> Result<Function> {
        self.function(Some(COMPUTE), Role::Worker, Type::Bool, args, |cx, vars| {
            f(cx, vars)?;
            cx.ret(Some(CExpr::lit(1.0, Type::Bool)));
            Ok(())
        })
    }
}
