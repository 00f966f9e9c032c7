use tilesolve_kerpiler::{ReduceOp, Runtime, Tensor};

use super::{check_operands, host_norm, report_iteration, PBiCGStabConfig, Solver, SolverStats};
use crate::{error::Result, matrix::Matrix};

// magnitude below which rho or omega count as a breakdown
const SMALL: f64 = 1e-37;

/// Stabilized bi-conjugate gradients with an optional right preconditioner.
///
/// The scalars of the recurrence stay on the device as one element tensors,
/// so the vector updates build the same kernels in every iteration. Only
/// rho, omega and the residual norm are read back for the checks.
pub struct PBiCGStab<'a> {
    a: &'a Matrix,
    config: PBiCGStabConfig,
    preconditioner: Option<Box<dyn Solver + 'a>>,
}

// rho, alpha and omega of the previous iteration
struct Recurrence {
    rho: Tensor,
    alpha: Tensor,
    omega: Tensor,
}

impl<'a> PBiCGStab<'a> {
    pub fn new(a: &'a Matrix, config: PBiCGStabConfig, preconditioner: Option<Box<dyn Solver + 'a>>) -> Self {
        Self { a, config, preconditioner }
    }

    pub fn config(&self) -> &PBiCGStabConfig { &self.config }

    // out = M^-1 v, or a plain copy without a preconditioner
    fn precondition(&self, rt: &Runtime, out: &Tensor, v: &Tensor) -> Result<()> {
        match &self.preconditioner {
            Some(m) => {
                if m.uses_initial_guess() {
                    out.fill(rt, 0.0)?;
                }
                m.solve(rt, out, v)?;
            }
            None => self.a.assign_without_halo(rt, out, v)?,
        }
        Ok(())
    }

    fn verbose(&self, rt: &Runtime, name: &str, t: &Tensor) -> Result<()> {
        if self.config.verbose {
            let value = t.to_scalar::<f64>(rt)?;
            tracing::info!(solver = %self.name(), "{name} = {value}");
        }
        Ok(())
    }
}

impl Solver for PBiCGStab<'_> {
    #[tracing::instrument(skip_all, fields(solver = %self.name()))]
    fn solve(&self, rt: &Runtime, x: &Tensor, b: &Tensor) -> Result<SolverStats> {
        let a = self.a;
        let c = &self.config;
        check_operands(a, &self.name(), x, b)?;
        let ty = c.working_type.unwrap_or(x.ty());
        let mut stats = SolverStats::new(self.name(), c.norm, a.num_tiles());

        let mut r = a.residual_with_precision(rt, x, b, ty, ty)?;
        if SolverStats::requires_b_norm(c.rel_tolerance) {
            stats.b_norm = Some(host_norm(a, rt, c.norm, b)?);
        }
        stats.initial_residual = host_norm(a, rt, c.norm, &r)?;
        stats.final_residual = stats.initial_residual;

        let r0 = r.duplicate(rt)?;
        let p = r.duplicate(rt)?;
        let y = a.create_uninitialized_vector(rt, ty, true)?;
        let z = a.create_uninitialized_vector(rt, ty, true)?;
        let mut v: Option<Tensor> = None;
        let mut previous: Option<Recurrence> = None;

        while !((stats.converged && stats.iterations >= c.min_iterations)
            || stats.iterations >= c.max_iterations
            || stats.singular)
        {
            let rho = (&r0 * &r)?.reduce(rt, 0, ReduceOp::Add)?;
            self.verbose(rt, "rho", &rho)?;
            if stats.check_singularity(rho.to_scalar::<f64>(rt)?.abs(), SMALL) {
                tracing::debug!(iteration = stats.iterations, "rho vanished");
                break;
            }

            if let (Some(prev), Some(v)) = (&previous, &v) {
                let beta = ((&rho / &prev.rho)? * (&prev.alpha / &prev.omega)?)?;
                let direction = (&p - (&prev.omega * v)?)?;
                p.assign(rt, (&r + (beta * direction)?)?)?;
            }

            self.precondition(rt, &y, &p)?;
            let ay = a.spmv(rt, &y)?;
            let alpha = (&rho / &(&r0 * &ay)?.reduce(rt, 0, ReduceOp::Add)?)?.materialize(rt)?;
            self.verbose(rt, "alpha", &alpha)?;
            let s = (&r - (&alpha * &ay)?)?.materialize(rt)?;

            self.precondition(rt, &z, &s)?;
            let t = a.spmv(rt, &z)?;
            let tt = t.reduce(rt, 0, ReduceOp::SquareAdd)?;
            let omega = (&(&t * &s)?.reduce(rt, 0, ReduceOp::Add)? / &tt)?.materialize(rt)?;
            self.verbose(rt, "omega", &omega)?;
            if stats.check_singularity(omega.to_scalar::<f64>(rt)?.abs(), SMALL) {
                tracing::debug!(iteration = stats.iterations, "omega vanished");
                break;
            }

            let correction = ((&alpha * &y)? + (&omega * &z)?)?;
            x.assign(rt, (x + correction.cast(x.ty()))?)?;
            r = (&s - (&omega * &t)?)?.materialize(rt)?;

            stats.final_residual = host_norm(a, rt, c.norm, &r)?;
            stats.check_convergence(c.abs_tolerance, c.rel_tolerance, c.rel_residual)?;
            stats.iterations += 1;
            report_iteration(&stats, c.print_performance_each_iteration);
            previous = Some(Recurrence { rho, alpha, omega });
            v = Some(ay);
        }

        if c.print_performance_after_solve {
            stats.print();
        }
        Ok(stats)
    }

    fn name(&self) -> String {
        match &self.preconditioner {
            Some(m) => format!("PBiCGStab({})", m.name()),
            None => "BiCGStab".into(),
        }
    }

    fn uses_initial_guess(&self) -> bool { true }
}
