//! Momentum predictor:
//! `ddt(rho, U) + div(phi, U) - laplacian(rho nuEff, U)
//!   = -grad(p) + div(rho nuEff dev2(T(grad(U))))`, plus an optional
//! turbulence matrix, followed by `A` and `H` for the pressure corrector.

use crate::solver::assembly::{EquationSystem, Gamma, LaplacianBoundary, LduContribution};
use crate::solver::database::MatrixDataBase;
use crate::solver::error::Result;
use crate::solver::gpu::{DeviceBuffer, Kernel};
use crate::solver::linear_solver::LinearSolverStats;
use crate::solver::profiling::{ProfileCategory, ProfileTimer};

#[derive(Default, Clone, Copy)]
pub struct MomentumInputs<'a> {
    /// Turbulence model matrix folded in by `add_fv_matrix`.
    pub turbulence: Option<LduContribution<'a>>,
}

pub struct MomentumEquation {
    eqn: EquationSystem,
    r_au: DeviceBuffer<f64>,
    hby_a: DeviceBuffer<f64>,
}

impl MomentumEquation {
    pub fn new(db: &mut MatrixDataBase) -> Result<Self> {
        let n = db.num_cells();
        Ok(Self {
            eqn: EquationSystem::new(db, "UEqn", 3)?,
            r_au: db.allocate_scalar("UEqn.A", n)?,
            hby_a: db.allocate_scalar("UEqn.H", 3 * n)?,
        })
    }

    pub fn equation(&self) -> &EquationSystem {
        &self.eqn
    }

    /// Queues the predictor terms. Flow inputs must already be prepared.
    pub fn assemble(&mut self, db: &mut MatrixDataBase, inputs: &MomentumInputs<'_>) -> Result<()> {
        let metrics = db.metrics_handle();
        let _t = ProfileTimer::new(&metrics, ProfileCategory::Assembly, "UEqn:assemble");
        let (flow, scratch) = (db.flow, db.scratch);
        let patch = db.mesh.velocity_patch;
        let rdt = db.config().rdelta_t();

        // effective dynamic viscosity, cell and boundary
        db.launch(Kernel::Product {
            dst: scratch.cell_gamma,
            a: flow.rho,
            b: flow.nu_eff,
        })?;
        db.launch(Kernel::Product {
            dst: scratch.boundary_gamma,
            a: flow.boundary_rho,
            b: flow.boundary_nu_eff,
        })?;

        let eqn = &mut self.eqn;
        eqn.initialize_time_step(db)?;
        eqn.seed_psi(db, flow.u_old)?;
        eqn.fvm_ddt(db, flow.rho, flow.rho_old, flow.u_old, rdt)?;
        eqn.fvm_div(db, flow.phi, flow.boundary_phi, patch, flow.boundary_u, 1.0)?;
        eqn.fvm_laplacian(
            db,
            Gamma::Cell(scratch.cell_gamma),
            scratch.boundary_gamma,
            LaplacianBoundary::Patch {
                patch,
                value: flow.boundary_u,
            },
            -1.0,
        )?;
        eqn.fvc_grad(db, flow.p, flow.boundary_p, -1.0, false)?;
        eqn.fvc_grad_vector(db, flow.u_old, flow.boundary_u, scratch.grad_u)?;
        eqn.dev2_transpose(db, scratch.grad_u, scratch.dev2_t)?;
        eqn.fvc_div_tensor(db, scratch.dev2_t, scratch.cell_gamma, scratch.boundary_gamma, 1.0)?;
        self.add_fv_matrix(db, inputs.turbulence.as_ref())?;
        self.eqn.sync(db)
    }

    /// Folds the turbulence matrix, if any, together with the boundary coefficients.
    pub fn add_fv_matrix(&mut self, db: &mut MatrixDataBase, turbulence: Option<&LduContribution<'_>>) -> Result<()> {
        self.eqn.add_to_source(db, turbulence)
    }

    pub fn solve(&mut self, db: &mut MatrixDataBase) -> Result<Vec<LinearSolverStats>> {
        let config = db.config().momentum.clone();
        self.eqn.solve(db, &config)
    }

    /// Diagonal coefficient per unit volume, one per cell.
    pub fn a(&self, db: &mut MatrixDataBase) -> Result<Vec<f64>> {
        self.eqn.compute_a(db, self.r_au)?;
        db.download(self.r_au)
    }

    /// `H` per unit volume, three per cell.
    pub fn h(&self, db: &mut MatrixDataBase) -> Result<Vec<f64>> {
        self.eqn.compute_h(db, self.hby_a)?;
        db.download(self.hby_a)
    }

    pub fn update_psi(&self, db: &MatrixDataBase, u: &mut [f64]) -> Result<()> {
        self.eqn.update_psi(db, u)
    }

    pub fn correct_psi(&self, db: &MatrixDataBase, u: &[f64]) -> Result<()> {
        self.eqn.correct_psi(db, u)
    }
}
