use tilesolve_kerpiler::{
    codegen::{Access, CExpr, EmissionContext, FieldRef, FieldShape, Vertex, VertexKind},
    runtime::Binding,
    Runtime, Tensor, Type,
};

use super::{check_operands, host_norm, report_iteration, GaussSeidelConfig, Solver, SolverStats};
use crate::{
    error::{Error, Result},
    matrix::{
        kernels::{ColorFields, CrsFields},
        Matrix,
    },
};

/// Gauss-Seidel smoothing, row by row or color by color.
pub struct GaussSeidel<'a> {
    a: &'a Matrix,
    config: GaussSeidelConfig,
    multicolor: bool,
}

// x[row] = (b[row] - sum(offDiag * x)) / diag[row]
fn smooth_row(cx: &mut EmissionContext, crs: &CrsFields, x: FieldRef, b: FieldRef, row: CExpr, acc: Type) -> tilesolve_kerpiler::Result<()> {
    let sum = crs.off_diagonal_sum(cx, x, row.clone(), acc)?;
    let rhs = CExpr::load(b, row.clone()).cast(acc) - sum.into();
    cx.store(x, row.clone(), (rhs / CExpr::load(crs.diag, row).cast(acc)).cast(x.ty));
    Ok(())
}

fn smoother_vertex(a: &Matrix, x_ty: Type, b_ty: Type, acc: Type, multicolor: bool, workers: usize) -> tilesolve_kerpiler::Result<Vertex> {
    let kind = if multicolor { VertexKind::SupervisorVertex } else { VertexKind::Vertex };
    let mut vertex = Vertex::new(kind);
    let crs = CrsFields::add(&mut vertex, a, Access::Input, Access::Input);
    let x = vertex.add_field("x", x_ty, Access::InOut, FieldShape::Vector);
    let b = vertex.add_field("b", b_ty, Access::Input, FieldShape::Vector);
    let mut cx = EmissionContext::new();
    if multicolor {
        let colors = ColorFields::add(&mut vertex, a);
        colors.phase(&mut cx, &mut vertex, workers, false, |cx, row| smooth_row(cx, &crs, x, b, row.into(), acc))?;
    } else {
        let compute = cx.compute(&[], |cx, _| {
            cx.for_range(CExpr::uint(0), crs.num_rows(), CExpr::uint(1), |cx, row| {
                smooth_row(cx, &crs, x, b, row.into(), acc)
            })
        })?;
        vertex.functions.push(compute);
    }
    Ok(vertex)
}

impl<'a> GaussSeidel<'a> {
    pub fn new(a: &'a Matrix, config: GaussSeidelConfig) -> Self {
        let multicolor = config.solve_multicolor.should_use_multicolor(a);
        Self { a, config, multicolor }
    }

    pub fn config(&self) -> &GaussSeidelConfig { &self.config }
    pub fn multicolor(&self) -> bool { self.multicolor }

    /// One sweep over the owned rows of every tile. Halo cells are
    /// refreshed first and stay fixed during the sweep.
    #[tracing::instrument(skip_all, fields(multicolor = self.multicolor))]
    pub fn sweep(&self, rt: &Runtime, x: &Tensor, b: &Tensor) -> Result<()> {
        self.a.exchange_halo_cells(rt, x)?;
        let acc = self.config.working_type.unwrap_or(x.ty());
        let workers = rt.topology().workers_per_partition;
        let kernel = rt.kernel(smoother_vertex(self.a, x.ty(), b.ty(), acc, self.multicolor, workers)?)?;
        let coloring = self.a.coloring();
        let colors = [Binding::Sliced(&coloring.sort_addr), Binding::Sliced(&coloring.start_ptr)];
        let mut bindings = self.a.bindings([Binding::Sliced(x), Binding::Sliced(b)]);
        if self.multicolor {
            bindings.extend(colors);
        }
        rt.execute(&kernel, &bindings, self.a.tiles())?;
        Ok(())
    }
}

impl Solver for GaussSeidel<'_> {
    #[tracing::instrument(skip_all, fields(solver = "GaussSeidel"))]
    fn solve(&self, rt: &Runtime, x: &Tensor, b: &Tensor) -> Result<SolverStats> {
        check_operands(self.a, "GaussSeidel", x, b)?;
        let c = &self.config;
        if c.num_sweeps == 0 {
            return Err(Error::Config("GaussSeidel needs numSweeps of at least 1".into()));
        }
        let mut stats = SolverStats::new(self.name(), c.norm, self.a.num_tiles());
        if c.num_fixed_iterations > 0 {
            tracing::trace!(iterations = c.num_fixed_iterations, "fixed number of sweeps, no convergence check");
            for _ in 0..c.num_fixed_iterations {
                self.sweep(rt, x, b)?;
            }
            stats.iterations = c.num_fixed_iterations;
            return Ok(stats);
        }

        if SolverStats::requires_b_norm(c.rel_tolerance) {
            stats.b_norm = Some(host_norm(self.a, rt, c.norm, b)?);
        }
        stats.initial_residual = host_norm(self.a, rt, c.norm, &self.a.residual(rt, x, b)?)?;
        stats.final_residual = stats.initial_residual;
        while !((stats.converged && stats.iterations >= c.min_iterations) || stats.iterations >= c.max_iterations) {
            for _ in 0..c.num_sweeps {
                self.sweep(rt, x, b)?;
                stats.iterations += 1;
            }
            stats.final_residual = host_norm(self.a, rt, c.norm, &self.a.residual(rt, x, b)?)?;
            stats.check_convergence(c.abs_tolerance, c.rel_tolerance, c.rel_residual)?;
            report_iteration(&stats, c.print_performance_each_iteration);
        }
        if c.print_performance_after_solve {
            stats.print();
        }
        Ok(stats)
    }

    fn name(&self) -> String { "GaussSeidel".into() }
    fn uses_initial_guess(&self) -> bool { true }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::{Coloring, TileAddressing},
        solver::{tests::Problem, MultiColorMode},
    };

    // one sweep on the host, rows visited in `order`
    fn host_sweep(a: &TileAddressing, order: &[usize], x: &mut [f64], b: &[f64]) {
        for &row in order {
            let sum: f64 = a.row(row).map(|(col, v)| v * x[col]).sum();
            x[row] = (b[row] - sum) / a.diag[row];
        }
    }

    fn config(mode: MultiColorMode) -> GaussSeidelConfig {
        GaussSeidelConfig { solve_multicolor: mode, abs_tolerance: 1e-8, max_iterations: 500, ..Default::default() }
    }

    #[test]
    fn sweeps_follow_row_and_color_order() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let problem = Problem::poisson(4, 3, 3, 1);
        let addressing = &problem.host.addressing()[0];
        let coloring: &Coloring = &problem.host.coloring()[0];
        let b_local = problem.host.decompose_vector(&problem.rhs, false).unwrap();
        for (mode, order) in [(MultiColorMode::Off, (0..addressing.num_rows()).collect::<Vec<_>>()), (MultiColorMode::On, coloring.sort_addr.clone())] {
            let (a, x, b) = problem.device(&rt, Type::Float64);
            let gs = GaussSeidel::new(&a, config(mode));
            let mut expected = vec![0.0; addressing.num_rows()];
            for _ in 0..2 {
                gs.sweep(&rt, &x, &b).unwrap();
                host_sweep(addressing, &order, &mut expected, &b_local);
            }
            let got = x.to_f64_vec(&rt).unwrap();
            for (g, e) in got.iter().zip(&expected) {
                assert!((g - e).abs() < 1e-12, "{mode:?}: {g} vs {e}");
            }
        }
    }

    #[test]
    fn converges_sequential_and_multicolor() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let problem = Problem::poisson(4, 4, 2, 4);
        for mode in [MultiColorMode::Off, MultiColorMode::On] {
            let (a, x, b) = problem.device(&rt, Type::Float64);
            let gs = GaussSeidel::new(&a, config(mode));
            assert_eq!(gs.multicolor(), mode == MultiColorMode::On);
            let stats = gs.solve(&rt, &x, &b).unwrap();
            assert!(stats.converged, "{stats}");
            assert!(!stats.singular);
            assert!(stats.iterations > 1 && stats.iterations < 500);
            assert!(stats.final_residual < 1e-8 && stats.initial_residual > 1.0);
            assert!(problem.max_error(&a, &rt, &x) < 1e-6);
        }
    }

    #[test]
    fn relative_tolerance_and_sweeps_per_check() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let problem = Problem::poisson(3, 3, 3, 2);
        let (a, x, b) = problem.device(&rt, Type::Float32);
        let config = GaussSeidelConfig { rel_tolerance: 1e-3, num_sweeps: 4, max_iterations: 400, ..Default::default() };
        let stats = GaussSeidel::new(&a, config).solve(&rt, &x, &b).unwrap();
        let b_norm = stats.b_norm.unwrap();
        assert!(stats.converged);
        assert!(stats.final_residual < b_norm * 1e-3);
        assert_eq!(stats.iterations % 4, 0);
    }

    #[test]
    fn fixed_iterations_skip_convergence() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let problem = Problem::poisson(3, 3, 2, 2);
        let (a, x, b) = problem.device(&rt, Type::Float32);
        let config = GaussSeidelConfig { num_fixed_iterations: 3, ..Default::default() };
        let stats = GaussSeidel::new(&a, config).solve(&rt, &x, &b).unwrap();
        assert_eq!(stats.iterations, 3);
        assert!(!stats.converged);
        assert_eq!(stats.initial_residual, 0.0);
        assert!(a.vector_to_host(&rt, &x).unwrap().iter().any(|v| *v != 0.0));
    }
}
