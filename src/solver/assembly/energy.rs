//! Energy equation in enthalpy form:
//! `ddt(rho, he) + div(phi, he) - laplacian(alphaEff, he)
//!   = -ddt(rho, K) - div(phi, K) + div(hDiffCorrFlux) + dpdt`.

use crate::solver::assembly::{EquationSystem, Gamma, LaplacianBoundary};
use crate::solver::database::{EnergyInputs, MatrixDataBase};
use crate::solver::error::Result;
use crate::solver::linear_solver::LinearSolverStats;
use crate::solver::profiling::{ProfileCategory, ProfileTimer};

pub struct EnergyEquation {
    eqn: EquationSystem,
}

impl EnergyEquation {
    pub fn new(db: &mut MatrixDataBase) -> Result<Self> {
        Ok(Self {
            eqn: EquationSystem::new(db, "EEqn", 1)?,
        })
    }

    pub fn equation(&self) -> &EquationSystem {
        &self.eqn
    }

    /// Stages the energy inputs and queues every term. Flow inputs must
    /// already be prepared for this step.
    pub fn assemble(&mut self, db: &mut MatrixDataBase, inputs: &EnergyInputs<'_>) -> Result<()> {
        let metrics = db.metrics_handle();
        let _t = ProfileTimer::new(&metrics, ProfileCategory::Assembly, "EEqn:assemble");
        db.prepare_data(inputs)?;
        let (flow, energy) = (db.flow, db.energy);
        let patch = db.mesh.velocity_patch;
        let rdt = db.config().rdelta_t();

        let eqn = &mut self.eqn;
        eqn.initialize_time_step(db)?;
        eqn.seed_psi(db, energy.he_old)?;
        eqn.fvm_ddt(db, flow.rho, flow.rho_old, energy.he_old, rdt)?;
        eqn.fvm_div(db, flow.phi, flow.boundary_phi, patch, energy.boundary_he, 1.0)?;
        eqn.fvm_laplacian(
            db,
            Gamma::Cell(energy.alpha_eff),
            energy.boundary_alpha_eff,
            LaplacianBoundary::FixedGradient {
                patch,
                gradient: energy.boundary_gradient,
            },
            -1.0,
        )?;
        eqn.fvc_ddt(db, flow.rho, flow.rho_old, Some((energy.k, energy.k_old)), rdt, -1.0)?;
        eqn.fvc_div_face_scalar(db, flow.phi, energy.k, flow.boundary_phi, energy.boundary_k, -1.0)?;
        eqn.fvc_div_cell_vector(db, energy.diff_corr_flux, energy.boundary_diff_corr_flux, 1.0)?;
        eqn.add_cell_source(db, energy.dpdt, 1.0, true)?;
        eqn.add_to_source(db, None)?;
        eqn.sync(db)
    }

    pub fn solve(&mut self, db: &mut MatrixDataBase) -> Result<LinearSolverStats> {
        let config = db.config().energy.clone();
        let stats = self.eqn.solve(db, &config)?;
        Ok(stats.into_iter().next().unwrap_or_default())
    }

    pub fn update_psi(&self, db: &MatrixDataBase, he: &mut [f64]) -> Result<()> {
        self.eqn.update_psi(db, he)
    }
}
