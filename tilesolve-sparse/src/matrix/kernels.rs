//! Kernel building blocks shared by the matrix operations and solvers.

use tilesolve_kerpiler::{
    codegen::{Access, CExpr, EmissionContext, FieldRef, FieldShape, Phase, Repeat, Role, Var, Vertex, VertexKind},
    Result, Type,
};

use super::Matrix;

/// The four addressing and coefficient fields of a CRS matrix, added first
/// to every matrix kernel so their bindings line up.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CrsFields {
    pub diag: FieldRef,
    pub off_diag: FieldRef,
    pub row_ptr: FieldRef,
    pub col_ind: FieldRef,
}

impl CrsFields {
    pub fn add(vertex: &mut Vertex, a: &Matrix, diag: Access, off_diag: Access) -> Self {
        Self {
            diag: vertex.add_field("diagCoeffs", a.value_type(), diag, FieldShape::Vector),
            off_diag: vertex.add_field("offDiagCoeffs", a.value_type(), off_diag, FieldShape::Vector),
            row_ptr: vertex.add_field("rowPtr", a.row_ptr().ty(), Access::Input, FieldShape::Vector),
            col_ind: vertex.add_field("colInd", a.col_ind().ty(), Access::Input, FieldShape::Vector),
        }
    }

    pub fn num_rows(&self) -> CExpr { CExpr::Size(self.diag) }

    /// Declare `(start, end)` of the entries of `row`.
    pub fn row_range(&self, cx: &mut EmissionContext, row: CExpr) -> (Var, Var) {
        let start = cx.declare(Type::Uint32, CExpr::load(self.row_ptr, row.clone()));
        let end = cx.declare(Type::Uint32, CExpr::load(self.row_ptr, row + CExpr::uint(1)));
        (start, end)
    }

    /// `sum(offDiag[a] * x[colInd[a]])` over the entries of `row`, in `ty`.
    pub fn off_diagonal_sum(&self, cx: &mut EmissionContext, x: FieldRef, row: CExpr, ty: Type) -> Result<Var> {
        let sum = cx.declare(ty, CExpr::lit(0.0, ty));
        let (start, end) = self.row_range(cx, row);
        cx.for_range(start.into(), end.into(), CExpr::uint(1), |cx, a| {
            let col = CExpr::load(self.col_ind, a.into());
            let term = CExpr::load(self.off_diag, a.into()).cast(ty) * CExpr::load(x, col).cast(ty);
            cx.assign(sum, CExpr::from(sum) + term);
            Ok(())
        })?;
        Ok(sum)
    }
}

/// Color sorted row lists on a tile.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ColorFields {
    pub sort_addr: FieldRef,
    pub start_ptr: FieldRef,
}

impl ColorFields {
    pub fn add(vertex: &mut Vertex, a: &Matrix) -> Self {
        let coloring = a.coloring();
        Self {
            sort_addr: vertex.add_field("colorSortAddr", coloring.sort_addr.ty(), Access::Input, FieldShape::Vector),
            start_ptr: vertex.add_field("colorSortStartAddr", coloring.start_ptr.ty(), Access::Input, FieldShape::Vector),
        }
    }

    pub fn num_colors(&self) -> CExpr { CExpr::Size(self.start_ptr) - CExpr::uint(1) }

    /// Append a phase that runs `body` on every row of one color per
    /// iteration, rows dealt round robin to the workers. Colors run
    /// ascending or, with `descending`, from the last one down.
    pub fn phase(
        &self,
        cx: &mut EmissionContext,
        vertex: &mut Vertex,
        workers: usize,
        descending: bool,
        body: impl FnOnce(&mut EmissionContext, Var) -> Result<()>,
    ) -> Result<()> {
        let f = cx.function(None, Role::Worker, Type::Void, &[Type::Uint32, Type::Uint32], |cx, args| {
            let (worker, color) = (args[0], args[1]);
            let start = CExpr::load(self.start_ptr, color.into()).cast(Type::Uint32) + worker.into();
            let end = CExpr::load(self.start_ptr, CExpr::from(color) + CExpr::uint(1));
            cx.for_range(start, end, CExpr::uint(workers), |cx, i| {
                let row = cx.declare(Type::Uint32, CExpr::load(self.sort_addr, i.into()));
                body(cx, row)
            })
        })?;
        let repeat = if descending { Repeat::Descending(self.num_colors()) } else { Repeat::Ascending(self.num_colors()) };
        vertex.phases.push(Phase { worker: f.id, repeat });
        vertex.functions.push(f);
        Ok(())
    }
}

/// `out = A x` on the owned rows, `x` with halo.
pub(crate) fn spmv_vertex(a: &Matrix, x_ty: Type, workers: usize) -> Result<Vertex> {
    let mut vertex = Vertex::new(VertexKind::MultiVertex);
    let crs = CrsFields::add(&mut vertex, a, Access::Input, Access::Input);
    let x = vertex.add_field("x", x_ty, Access::Input, FieldShape::Vector);
    let out = vertex.add_field("result", x_ty, Access::Output, FieldShape::Vector);
    let mut cx = EmissionContext::new();
    let compute = cx.compute(&[Type::Uint32], |cx, args| {
        cx.for_range(args[0].into(), crs.num_rows(), CExpr::uint(workers), |cx, row| {
            let sum = crs.off_diagonal_sum(cx, x, row.into(), x_ty)?;
            let diag = CExpr::load(crs.diag, row.into()).cast(x_ty) * CExpr::load(x, row.into());
            cx.store(out, row.into(), diag + sum.into());
            Ok(())
        })
    })?;
    vertex.functions.push(compute);
    Ok(vertex)
}

/// `out = b - A x`, accumulated in `extended` and stored as `working`.
pub(crate) fn residual_vertex(a: &Matrix, x_ty: Type, b_ty: Type, working: Type, extended: Type, workers: usize) -> Result<Vertex> {
    let mut vertex = Vertex::new(VertexKind::MultiVertex);
    let crs = CrsFields::add(&mut vertex, a, Access::Input, Access::Input);
    let x = vertex.add_field("x", x_ty, Access::Input, FieldShape::Vector);
    let b = vertex.add_field("b", b_ty, Access::Input, FieldShape::Vector);
    let out = vertex.add_field("result", working, Access::Output, FieldShape::Vector);
    let mut cx = EmissionContext::new();
    let compute = cx.compute(&[Type::Uint32], |cx, args| {
        cx.for_range(args[0].into(), crs.num_rows(), CExpr::uint(workers), |cx, row| {
            let sum = crs.off_diagonal_sum(cx, x, row.into(), extended)?;
            let diag = CExpr::load(crs.diag, row.into()).cast(extended) * CExpr::load(x, row.into()).cast(extended);
            let r = CExpr::load(b, row.into()).cast(extended) - diag - sum.into();
            cx.store(out, row.into(), r);
            Ok(())
        })
    })?;
    vertex.functions.push(compute);
    Ok(vertex)
}
