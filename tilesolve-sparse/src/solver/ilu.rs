//! Incomplete LU preconditioning.
//!
//! The factorization keeps the sparsity pattern of the owned block of each
//! tile, couplings to halo rows are dropped. `DILU` only modifies the
//! diagonal and reuses the off-diagonal coefficients of the matrix,
//! `ILU(0)` works on a copy of both. It is computed on the first solve and
//! reused afterwards.

use std::sync::Arc;

use parking_lot::Mutex;
use tilesolve_kerpiler::{
    codegen::{Access, CExpr, EmissionContext, FieldRef, FieldShape, Role, Var, Vertex, VertexKind},
    runtime::Binding,
    Runtime, Tensor, Type,
};

use super::{check_operands, IluConfig, Solver, SolverStats, VectorNorm};
use crate::{
    error::Result,
    matrix::{
        kernels::{ColorFields, CrsFields},
        Bindings, Matrix,
    },
};

type KResult<T> = tilesolve_kerpiler::Result<T>;

struct Factorization {
    inverse_diag: Tensor,
    off_diag: Tensor,
}

pub struct Ilu<'a> {
    a: &'a Matrix,
    config: IluConfig,
    solve_multicolor: bool,
    factorize_multicolor: bool,
    factorization: Mutex<Option<Arc<Factorization>>>,
}

// `getOffDiagValue(i, j)`: the coefficient at (i, j), zero outside the pattern
fn off_diagonal_lookup(cx: &mut EmissionContext, vertex: &mut Vertex, crs: &CrsFields) -> KResult<u32> {
    let ty = crs.off_diag.ty;
    let f = cx.function(Some("getOffDiagValue"), Role::Worker, ty, &[Type::Uint32, Type::Uint32], |cx, args| {
        let (i, j) = (args[0], args[1]);
        let (start, end) = crs.row_range(cx, i.into());
        cx.for_range(start.into(), end.into(), CExpr::uint(1), |cx, a| {
            let col = CExpr::load(crs.col_ind, a.into()).cast(Type::Uint32);
            cx.if_then(col.equals(j.into()), |cx| {
                cx.ret(Some(CExpr::load(crs.off_diag, a.into())));
                Ok(())
            })
        })?;
        cx.ret(Some(CExpr::lit(0.0, ty)));
        Ok(())
    })?;
    let id = f.id;
    vertex.functions.push(f);
    Ok(id)
}

fn call(func: u32, ty: Type, args: [CExpr; 2]) -> CExpr { CExpr::Call { func, ty, args: args.into() } }

fn column(cx: &mut EmissionContext, crs: &CrsFields, a: Var) -> Var {
    cx.declare(Type::Uint32, CExpr::load(crs.col_ind, a.into()).cast(Type::Uint32))
}

// d[i] -= sum over j < i of a_ij * a_ji / d[j]
fn dilu_row(cx: &mut EmissionContext, crs: &CrsFields, get_off: u32, i: Var) -> KResult<()> {
    let ty = crs.diag.ty;
    let n = crs.num_rows();
    let temp = cx.declare(ty, CExpr::load(crs.diag, i.into()));
    let (start, end) = crs.row_range(cx, i.into());
    cx.for_range(start.into(), end.into(), CExpr::uint(1), |cx, a| {
        let j = column(cx, crs, a);
        cx.if_then(CExpr::from(j).gt(i.into()), |cx| {
            cx.brk();
            Ok(())
        })?;
        cx.if_then(CExpr::from(j).ge(n), |cx| {
            cx.cont();
            Ok(())
        })?;
        let a_ji = call(get_off, ty, [j.into(), i.into()]);
        let update = CExpr::load(crs.off_diag, a.into()) * a_ji / CExpr::load(crs.diag, j.into());
        cx.assign(temp, CExpr::from(temp) - update);
        Ok(())
    })?;
    cx.store(crs.diag, i.into(), temp.into());
    Ok(())
}

// row i of the in-place ILU(0) elimination
fn ilu0_row(cx: &mut EmissionContext, crs: &CrsFields, get_off: u32, i: Var) -> KResult<()> {
    let ty = crs.diag.ty;
    let n = crs.num_rows();
    let (start, end) = crs.row_range(cx, i.into());
    cx.for_range(start.into(), end.into(), CExpr::uint(1), |cx, ik| {
        let k = column(cx, crs, ik);
        cx.if_then(CExpr::from(k).ge(i.into()), |cx| {
            cx.brk();
            Ok(())
        })?;
        let a_ik = CExpr::load(crs.off_diag, ik.into()) / CExpr::load(crs.diag, k.into());
        let l = cx.declare(ty, a_ik);
        cx.store(crs.off_diag, ik.into(), l.into());
        cx.for_range(CExpr::from(ik) + CExpr::uint(1), end.into(), CExpr::uint(1), |cx, ij| {
            let j = column(cx, crs, ij);
            cx.if_then(CExpr::from(j).ge(n.clone()), |cx| {
                cx.brk();
                Ok(())
            })?;
            let a_kj = call(get_off, ty, [k.into(), j.into()]);
            cx.store(crs.off_diag, ij.into(), CExpr::load(crs.off_diag, ij.into()) - CExpr::from(l) * a_kj);
            Ok(())
        })?;
        let a_ki = call(get_off, ty, [k.into(), i.into()]);
        cx.store(crs.diag, i.into(), CExpr::load(crs.diag, i.into()) - CExpr::from(l) * a_ki);
        Ok(())
    })
}

fn factorize_vertex(a: &Matrix, diagonal_based: bool, multicolor: bool, workers: usize) -> KResult<Vertex> {
    let kind = if multicolor { VertexKind::SupervisorVertex } else { VertexKind::Vertex };
    let mut vertex = Vertex::new(kind);
    let off_access = if diagonal_based { Access::Input } else { Access::InOut };
    let crs = CrsFields::add(&mut vertex, a, Access::InOut, off_access);
    let mut cx = EmissionContext::new();
    let get_off = off_diagonal_lookup(&mut cx, &mut vertex, &crs)?;
    let row = |cx: &mut EmissionContext, i: Var| {
        if diagonal_based { dilu_row(cx, &crs, get_off, i) } else { ilu0_row(cx, &crs, get_off, i) }
    };
    if multicolor {
        let colors = ColorFields::add(&mut vertex, a);
        colors.phase(&mut cx, &mut vertex, workers, false, row)?;
    } else {
        let compute = cx.compute(&[], |cx, _| cx.for_range(CExpr::uint(0), crs.num_rows(), CExpr::uint(1), row))?;
        vertex.functions.push(compute);
    }
    Ok(vertex)
}

// sum of offDiag * x over the owned columns of row i below or above the diagonal
fn partial_sum(cx: &mut EmissionContext, crs: &CrsFields, x: FieldRef, i: Var, lower: bool) -> KResult<Var> {
    let ty = x.ty;
    let n = crs.num_rows();
    let sum = cx.declare(ty, CExpr::lit(0.0, ty));
    let (start, end) = crs.row_range(cx, i.into());
    cx.for_range(start.into(), end.into(), CExpr::uint(1), |cx, a| {
        let j = column(cx, crs, a);
        let stop = if lower { CExpr::from(j).gt(i.into()) } else { CExpr::from(j).ge(n) };
        cx.if_then(stop, |cx| {
            cx.brk();
            Ok(())
        })?;
        let term = || CExpr::load(crs.off_diag, a.into()).cast(ty) * CExpr::load(x, j.into());
        if lower {
            cx.assign(sum, CExpr::from(sum) + term());
            Ok(())
        } else {
            cx.if_then(CExpr::from(j).gt(i.into()), |cx| {
                cx.assign(sum, CExpr::from(sum) + term());
                Ok(())
            })
        }
    })?;
    Ok(sum)
}

fn lower_row(cx: &mut EmissionContext, crs: &CrsFields, x: FieldRef, b: FieldRef, diagonal_based: bool, i: Var) -> KResult<()> {
    let sum = partial_sum(cx, crs, x, i, true)?;
    let rhs = CExpr::load(b, i.into()).cast(x.ty) - sum.into();
    let value = if diagonal_based { rhs * CExpr::load(crs.diag, i.into()).cast(x.ty) } else { rhs };
    cx.store(x, i.into(), value);
    Ok(())
}

fn upper_row(cx: &mut EmissionContext, crs: &CrsFields, x: FieldRef, diagonal_based: bool, i: Var) -> KResult<()> {
    let sum = partial_sum(cx, crs, x, i, false)?;
    let inverse_diag = CExpr::load(crs.diag, i.into()).cast(x.ty);
    let value = if diagonal_based {
        CExpr::load(x, i.into()) - inverse_diag * sum.into()
    } else {
        (CExpr::load(x, i.into()) - sum.into()) * inverse_diag
    };
    cx.store(x, i.into(), value);
    Ok(())
}

// forward then backward substitution, `diagCoeffs` holds the inverse diagonal
fn solve_vertex(a: &Matrix, x_ty: Type, b_ty: Type, diagonal_based: bool, multicolor: bool, workers: usize) -> KResult<Vertex> {
    let kind = if multicolor { VertexKind::SupervisorVertex } else { VertexKind::Vertex };
    let mut vertex = Vertex::new(kind);
    let crs = CrsFields::add(&mut vertex, a, Access::Input, Access::Input);
    let x = vertex.add_field("x", x_ty, Access::InOut, FieldShape::Vector);
    let b = vertex.add_field("b", b_ty, Access::Input, FieldShape::Vector);
    let mut cx = EmissionContext::new();
    if multicolor {
        let colors = ColorFields::add(&mut vertex, a);
        colors.phase(&mut cx, &mut vertex, workers, false, |cx, i| lower_row(cx, &crs, x, b, diagonal_based, i))?;
        colors.phase(&mut cx, &mut vertex, workers, true, |cx, i| upper_row(cx, &crs, x, diagonal_based, i))?;
    } else {
        let compute = cx.compute(&[], |cx, _| {
            let n = crs.num_rows();
            cx.for_range(CExpr::uint(0), n.clone(), CExpr::uint(1), |cx, i| lower_row(cx, &crs, x, b, diagonal_based, i))?;
            cx.for_range(CExpr::uint(0), n.clone(), CExpr::uint(1), |cx, r| {
                let i = cx.declare(Type::Uint32, n - CExpr::uint(1) - r.into());
                upper_row(cx, &crs, x, diagonal_based, i)
            })
        })?;
        vertex.functions.push(compute);
    }
    Ok(vertex)
}

impl<'a> Ilu<'a> {
    pub fn new(a: &'a Matrix, config: IluConfig) -> Self {
        let solve_multicolor = config.solve_multicolor.should_use_multicolor(a);
        let factorize_multicolor = config.factorize_multicolor.should_use_multicolor(a);
        Self { a, config, solve_multicolor, factorize_multicolor, factorization: Mutex::new(None) }
    }

    pub fn config(&self) -> &IluConfig { &self.config }

    fn color_bindings<'b>(&self, multicolor: bool, bindings: &mut Bindings<'b>)
    where
        'a: 'b,
    {
        if multicolor {
            let coloring = self.a.coloring();
            bindings.extend([Binding::Sliced(&coloring.sort_addr), Binding::Sliced(&coloring.start_ptr)]);
        }
    }

    /// Compute the factorization unless it is already there.
    pub fn factorize(&self, rt: &Runtime) -> Result<()> {
        self.factorization(rt).map(|_| ())
    }

    #[tracing::instrument(skip_all, fields(solver = self.config.name(), multicolor = self.factorize_multicolor))]
    fn factorization(&self, rt: &Runtime) -> Result<Arc<Factorization>> {
        let mut slot = self.factorization.lock();
        if let Some(f) = slot.as_ref() {
            return Ok(f.clone());
        }
        let a = self.a;
        let diagonal_based = self.config.diagonal_based;
        let diag = a.diag().duplicate(rt)?;
        let off_diag = if diagonal_based { a.off_diag().clone() } else { a.off_diag().duplicate(rt)? };
        let workers = rt.topology().workers_per_partition;
        let kernel = rt.kernel(factorize_vertex(a, diagonal_based, self.factorize_multicolor, workers)?)?;
        let mut bindings = a.bindings_with(&diag, &off_diag, []);
        self.color_bindings(self.factorize_multicolor, &mut bindings);
        rt.execute(&kernel, &bindings, a.tiles())?;
        drop(bindings);
        let inverse_diag = diag.expr().inverse()?.cast(a.value_type()).materialize(rt)?;
        tracing::debug!("factorized");
        let f = Arc::new(Factorization { inverse_diag, off_diag });
        *slot = Some(f.clone());
        Ok(f)
    }
}

impl Solver for Ilu<'_> {
    #[tracing::instrument(skip_all, fields(solver = self.config.name(), multicolor = self.solve_multicolor))]
    fn solve(&self, rt: &Runtime, x: &Tensor, b: &Tensor) -> Result<SolverStats> {
        check_operands(self.a, self.config.name(), x, b)?;
        let f = self.factorization(rt)?;
        let a = self.a;
        // rows of later colors may be read before they are written
        x.fill(rt, 0.0)?;
        let workers = rt.topology().workers_per_partition;
        let vertex = solve_vertex(a, x.ty(), b.ty(), self.config.diagonal_based, self.solve_multicolor, workers)?;
        let kernel = rt.kernel(vertex)?;
        let mut bindings = a.bindings_with(&f.inverse_diag, &f.off_diag, [Binding::Sliced(x), Binding::Sliced(b)]);
        self.color_bindings(self.solve_multicolor, &mut bindings);
        rt.execute(&kernel, &bindings, a.tiles())?;

        let mut stats = SolverStats::new(self.name(), VectorNorm::None, a.num_tiles());
        stats.iterations = 1;
        Ok(stats)
    }

    fn name(&self) -> String { self.config.name().into() }
    fn uses_initial_guess(&self) -> bool { false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::TileAddressing,
        solver::{tests::Problem, MultiColorMode},
    };

    fn lookup(a: &TileAddressing, off: &[f64], i: usize, j: usize) -> f64 {
        (a.row_ptr[i]..a.row_ptr[i + 1]).find(|p| a.col_ind[*p] == j).map_or(0.0, |p| off[p])
    }

    // factorize on the host, rows in `order`; returns (inverse diagonal, off-diagonal)
    fn host_factorize(a: &TileAddressing, order: &[usize], dilu: bool) -> (Vec<f64>, Vec<f64>) {
        let n = a.num_rows();
        let mut d = a.diag.clone();
        let mut off = a.off_diag.clone();
        for &i in order {
            let (start, end) = (a.row_ptr[i], a.row_ptr[i + 1]);
            if dilu {
                let mut t = d[i];
                for p in start..end {
                    let j = a.col_ind[p];
                    if j > i {
                        break;
                    }
                    if j < n {
                        t -= off[p] * lookup(a, &off, j, i) / d[j];
                    }
                }
                d[i] = t;
                continue;
            }
            for ik in start..end {
                let k = a.col_ind[ik];
                if k >= i {
                    break;
                }
                off[ik] /= d[k];
                for ij in ik + 1..end {
                    let j = a.col_ind[ij];
                    if j >= n {
                        break;
                    }
                    let v = off[ik] * lookup(a, &off, k, j);
                    off[ij] -= v;
                }
                let v = off[ik] * lookup(a, &off, k, i);
                d[i] -= v;
            }
        }
        (d.iter().map(|v| 1.0 / v).collect(), off)
    }

    fn host_substitute(a: &TileAddressing, (inv, off): &(Vec<f64>, Vec<f64>), lower: &[usize], upper: &[usize], dilu: bool, b: &[f64]) -> Vec<f64> {
        let n = a.num_rows();
        let mut x = vec![0.0; n];
        for &i in lower {
            let sum: f64 = (a.row_ptr[i]..a.row_ptr[i + 1])
                .take_while(|p| a.col_ind[*p] <= i)
                .fold(0.0, |s, p| s + off[p] * x[a.col_ind[p]]);
            x[i] = if dilu { (b[i] - sum) * inv[i] } else { b[i] - sum };
        }
        for &i in upper {
            let sum: f64 = (a.row_ptr[i]..a.row_ptr[i + 1])
                .filter(|p| a.col_ind[*p] > i && a.col_ind[*p] < n)
                .fold(0.0, |s, p| s + off[p] * x[a.col_ind[p]]);
            x[i] = if dilu { x[i] - inv[i] * sum } else { (x[i] - sum) * inv[i] };
        }
        x
    }

    fn config(multicolor: MultiColorMode, diagonal_based: bool) -> IluConfig {
        IluConfig { solve_multicolor: multicolor, factorize_multicolor: multicolor, diagonal_based }
    }

    #[test]
    fn matches_host_reference() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let problem = Problem::poisson(4, 3, 3, 1);
        let addressing = &problem.host.addressing()[0];
        let coloring = &problem.host.coloring()[0];
        let b_local = problem.host.decompose_vector(&problem.rhs, false).unwrap();
        let rows: Vec<usize> = (0..addressing.num_rows()).collect();
        let reversed: Vec<usize> = rows.iter().rev().copied().collect();
        let by_color_desc: Vec<usize> =
            (0..coloring.num_colors()).rev().flat_map(|c| coloring.rows_of_color(c).to_vec()).collect();

        for dilu in [true, false] {
            for mode in [MultiColorMode::Off, MultiColorMode::On] {
                let (a, x, b) = problem.device(&rt, Type::Float64);
                let ilu = Ilu::new(&a, config(mode, dilu));
                let stats = ilu.solve(&rt, &x, &b).unwrap();
                assert_eq!(stats.iterations, 1);
                assert_eq!(stats.norm, VectorNorm::None);

                let (order, upper) = match mode {
                    MultiColorMode::On => (&coloring.sort_addr, &by_color_desc),
                    _ => (&rows, &reversed),
                };
                let factors = host_factorize(addressing, order, dilu);
                let expected = host_substitute(addressing, &factors, order, upper, dilu, &b_local);
                let got = x.to_f64_vec(&rt).unwrap();
                for (g, e) in got.iter().zip(&expected) {
                    assert!((g - e).abs() < 1e-12, "{} {mode:?}: {g} vs {e}", ilu.name());
                }
            }
        }
    }

    #[test]
    fn exact_on_tridiagonal_systems() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        // a 1D stencil has no fill-in, both factorizations are the exact LU
        let problem = Problem::poisson(12, 1, 1, 1);
        for dilu in [true, false] {
            let (a, x, b) = problem.device(&rt, Type::Float64);
            let ilu = Ilu::new(&a, config(MultiColorMode::Off, dilu));
            ilu.solve(&rt, &x, &b).unwrap();
            assert!(problem.max_error(&a, &rt, &x) < 1e-12, "{}", ilu.name());
        }
    }

    #[test]
    fn factorization_is_computed_once() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let problem = Problem::poisson(3, 3, 3, 3);
        let (a, x, b) = problem.device(&rt, Type::Float32);
        let coefficients = a.off_diag().to_f64_vec(&rt).unwrap();
        let ilu = Ilu::new(&a, config(MultiColorMode::Auto, false));
        assert_eq!(ilu.name(), "ILU(0)");
        assert!(!ilu.uses_initial_guess());
        ilu.factorize(&rt).unwrap();
        let factors = ilu.factorization(&rt).unwrap();
        ilu.solve(&rt, &x, &b).unwrap();
        let first = a.vector_to_host(&rt, &x).unwrap();
        // a stale x must not leak into the result
        x.fill(&rt, 100.0).unwrap();
        ilu.solve(&rt, &x, &b).unwrap();
        assert_eq!(a.vector_to_host(&rt, &x).unwrap(), first);
        assert!(Arc::ptr_eq(&factors, &ilu.factorization(&rt).unwrap()));
        // ILU(0) works on a copy of the coefficients
        assert_eq!(a.off_diag().to_f64_vec(&rt).unwrap(), coefficients);
    }
}
