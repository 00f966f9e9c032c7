use crate::{
    codegen::ir::{Access, CExpr, FieldRef, Function, Repeat, Stmt, Vertex, VertexKind},
    error::{Error, Result},
    ops::BinaryOp,
};

// local element index to buffer index
#[derive(Debug)]
pub(crate) enum IndexMap {
    Identity(usize),
    Gather(Vec<usize>),
}

impl IndexMap {
    fn len(&self) -> usize {
        match self {
            IndexMap::Identity(n) => *n,
            IndexMap::Gather(v) => v.len(),
        }
    }
    fn global(&self, local: usize) -> Option<usize> {
        match self {
            IndexMap::Identity(n) => (local < *n).then_some(local),
            IndexMap::Gather(v) => v.get(local).copied(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum FieldView {
    Vector { slot: usize, map: IndexMap },
    Param(f64),
}

enum Flow {
    Next,
    Break,
    Continue,
    Return(Option<f64>),
}

/// Runs one vertex instance on one tile.
pub(crate) struct Machine<'a> {
    pub vertex: &'a Vertex,
    pub views: &'a [FieldView],
    pub memory: &'a mut [Vec<f64>],
    pub workers: usize,
    pub tile: usize,
    pub num_vars: usize,
}

impl<'a> Machine<'a> {
    pub fn run(&mut self) -> Result<()> {
        let vertex = self.vertex;
        match vertex.kind {
            VertexKind::Vertex | VertexKind::MultiVertex => {
                let compute = vertex.compute().ok_or_else(|| self.fail("missing compute function"))?;
                let workers = if vertex.kind == VertexKind::Vertex { 1 } else { self.workers };
                let arity = compute.args.len();
                for worker in 0..workers {
                    let args = [worker as f64];
                    if self.call(compute, &args[..arity.min(1)])? == Some(0.0) {
                        return Err(self.fail("compute returned false"));
                    }
                }
            }
            VertexKind::SupervisorVertex => {
                for phase in &vertex.phases {
                    let worker = vertex.function(phase.worker).ok_or_else(|| self.fail("phase worker missing"))?;
                    let iterations: Vec<usize> = match &phase.repeat {
                        Repeat::Once => vec![0],
                        Repeat::Ascending(n) => (0..self.eval(n, &[])? as usize).collect(),
                        Repeat::Descending(n) => (0..self.eval(n, &[])? as usize).rev().collect(),
                    };
                    for it in iterations {
                        for w in 0..self.workers {
                            self.call(worker, &[w as f64, it as f64])?;
                        }
                        // barrier: the next iteration starts after every worker returned
                    }
                }
            }
        }
        Ok(())
    }

    fn fail(&self, what: &str) -> Error {
        Error::Execution(format!("{} on tile {}: {what}", self.vertex.name, self.tile))
    }

    fn call(&mut self, f: &Function, args: &[f64]) -> Result<Option<f64>> {
        let mut frame = vec![0.0; self.num_vars];
        for (a, v) in f.args.iter().zip(args) {
            frame[a.id as usize] = a.ty.round(*v);
        }
        match self.exec_block(&f.body, &mut frame)? {
            Flow::Return(v) => Ok(v),
            _ => Ok(None),
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt], frame: &mut [f64]) -> Result<Flow> {
        for s in stmts {
            match self.exec(s, frame)? {
                Flow::Next => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    fn exec(&mut self, stmt: &Stmt, frame: &mut [f64]) -> Result<Flow> {
        match stmt {
            Stmt::Declare { var, init } => {
                frame[var.id as usize] = match init {
                    Some(e) => var.ty.round(self.eval(e, frame)?),
                    None => 0.0,
                };
            }
            Stmt::Assign { var, value } => {
                frame[var.id as usize] = var.ty.round(self.eval(value, frame)?);
            }
            Stmt::Store { field, index, value } => {
                let i = self.eval(index, frame)?;
                let v = self.eval(value, frame)?;
                self.store(*field, i, v)?;
            }
            Stmt::If { cond, then, otherwise } => {
                let branch = if self.eval(cond, frame)? != 0.0 { then } else { otherwise };
                return self.exec_block(branch, frame);
            }
            Stmt::While { cond, body } => {
                while self.eval(cond, frame)? != 0.0 {
                    match self.exec_block(body, frame)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Next | Flow::Continue => {}
                    }
                }
            }
            Stmt::For { var, start, end, step, body } => {
                let slot = var.id as usize;
                frame[slot] = var.ty.round(self.eval(start, frame)?);
                while frame[slot] < self.eval(end, frame)? {
                    match self.exec_block(body, frame)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Next | Flow::Continue => {}
                    }
                    let step = self.eval(step, frame)?;
                    if step <= 0.0 {
                        return Err(self.fail("loop step must be positive"));
                    }
                    frame[slot] = var.ty.round(frame[slot] + step);
                }
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Return(value) => {
                let v = match value {
                    Some(e) => Some(self.eval(e, frame)?),
                    None => None,
                };
                return Ok(Flow::Return(v));
            }
        }
        Ok(Flow::Next)
    }

    fn eval(&mut self, e: &CExpr, frame: &[f64]) -> Result<f64> {
        Ok(match e {
            CExpr::Lit { value, .. } => *value,
            CExpr::Var(v) => match frame.get(v.id as usize) {
                Some(x) => *x,
                None => return Err(self.fail("variable outside the frame")),
            },
            CExpr::Load { field, index } => {
                let i = self.eval(index, frame)?;
                self.load(*field, i)?
            }
            CExpr::Size(field) => match self.view(*field)? {
                FieldView::Vector { map, .. } => map.len() as f64,
                FieldView::Param(_) => return Err(self.fail("size of a scalar field")),
            },
            CExpr::Param(field) => match self.view(*field)? {
                FieldView::Param(v) => *v,
                FieldView::Vector { .. } => return Err(self.fail("vector field used as a parameter")),
            },
            CExpr::Unary { op, ty, arg } => ty.round(op.apply(self.eval(arg, frame)?)),
            // logical operators short-circuit so guards can protect loads
            CExpr::Binary { op: BinaryOp::LogicalAnd, lhs, rhs, .. } => {
                let ok = self.eval(lhs, frame)? != 0.0 && self.eval(rhs, frame)? != 0.0;
                if ok { 1.0 } else { 0.0 }
            }
            CExpr::Binary { op: BinaryOp::LogicalOr, lhs, rhs, .. } => {
                let ok = self.eval(lhs, frame)? != 0.0 || self.eval(rhs, frame)? != 0.0;
                if ok { 1.0 } else { 0.0 }
            }
            CExpr::Binary { op, ty, lhs, rhs } => {
                let a = self.eval(lhs, frame)?;
                let b = self.eval(rhs, frame)?;
                let integer = lhs.ty().is_integer() && rhs.ty().is_integer();
                ty.round(op.apply(a, b, integer))
            }
            CExpr::Cast { ty, arg } => ty.round(self.eval(arg, frame)?),
            CExpr::Call { func, args, .. } => {
                let vertex = self.vertex;
                let f = vertex.function(*func).ok_or_else(|| self.fail("call to unknown function"))?;
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.eval(a, frame)?);
                }
                self.call(f, &values)?.unwrap_or(0.0)
            }
        })
    }

    fn view(&self, field: FieldRef) -> Result<&'a FieldView> {
        self.views.get(field.index as usize).ok_or_else(|| self.fail("field index out of range"))
    }

    fn locate(&self, field: FieldRef, index: f64) -> Result<(usize, usize)> {
        let FieldView::Vector { slot, map } = self.view(field)? else {
            return Err(self.fail("indexing a scalar field"));
        };
        let name = &self.vertex.field(field).name;
        if index < 0.0 {
            return Err(self.fail(&format!("negative index {index} into {name}")));
        }
        match map.global(index as usize) {
            Some(g) => Ok((*slot, g)),
            None => Err(self.fail(&format!("index {index} out of bounds for {name} of size {}", map.len()))),
        }
    }

    fn load(&self, field: FieldRef, index: f64) -> Result<f64> {
        let (slot, g) = self.locate(field, index)?;
        Ok(self.memory[slot][g])
    }

    fn store(&mut self, field: FieldRef, index: f64, value: f64) -> Result<()> {
        let f = self.vertex.field(field);
        if f.access == Access::Input {
            return Err(self.fail(&format!("store into input field {}", f.name)));
        }
        let ty = f.ty;
        let (slot, g) = self.locate(field, index)?;
        self.memory[slot][g] = ty.round(value);
        Ok(())
    }
}
