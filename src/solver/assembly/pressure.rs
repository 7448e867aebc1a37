//! Pressure corrector:
//! `psi ddt(p) + ddt(rho)|explicit + div(phiHbyA) - laplacian(rhorAUf, p) = 0`,
//! and the conservative flux `phi = phiHbyA + flux(pEqn)`.

use crate::solver::assembly::{EquationSystem, Gamma, LaplacianBoundary};
use crate::solver::database::MatrixDataBase;
use crate::solver::error::{check_len, Result};
use crate::solver::gpu::DeviceBuffer;
use crate::solver::linear_solver::LinearSolverStats;
use crate::solver::profiling::{ProfileCategory, ProfileTimer};

type F = DeviceBuffer<f64>;

pub struct PressureInputs<'a> {
    /// Compressibility `d rho / d p`, per cell.
    pub psi: &'a [f64],
    /// Pressure at the start of the corrector, per cell.
    pub p: &'a [f64],
    /// Predicted flux, face order.
    pub phi_hby_a: &'a [f64],
    pub boundary_phi_hby_a: &'a [f64],
    /// Face diffusivity `rho/A`, face order.
    pub rhor_auf: &'a [f64],
    pub boundary_rhor_auf: &'a [f64],
    pub boundary_p: &'a [f64],
}

/// Corrected flux, host orders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PressureFlux {
    pub internal: Vec<f64>,
    pub boundary: Vec<f64>,
}

pub struct PressureEquation {
    eqn: EquationSystem,
    patch: DeviceBuffer<u32>,
    compressibility: F,
    p_old: F,
    phi_hby_a: F,
    boundary_phi_hby_a: F,
    boundary_p: F,
    flux: F,
    boundary_flux: F,
}

impl PressureEquation {
    /// `patch_type_names` classifies the pressure boundary, one name per patch.
    pub fn new<S: AsRef<str>>(db: &mut MatrixDataBase, patch_type_names: &[S]) -> Result<Self> {
        let n = db.num_cells();
        let ns = db.topology().num_surfaces();
        let nbf = db.num_boundary_faces();
        Ok(Self {
            eqn: EquationSystem::new(db, "pEqn", 1)?,
            patch: db.allocate_patch_types("pressure_patch_type", patch_type_names)?,
            compressibility: db.allocate_scalar("pEqn.psi", n)?,
            p_old: db.allocate_scalar("pEqn.p_old", n)?,
            phi_hby_a: db.allocate_scalar("pEqn.phiHbyA", 2 * ns)?,
            boundary_phi_hby_a: db.allocate_scalar("pEqn.boundary_phiHbyA", nbf)?,
            boundary_p: db.allocate_scalar("pEqn.boundary_p", nbf)?,
            flux: db.allocate_scalar("pEqn.flux", ns)?,
            boundary_flux: db.allocate_scalar("pEqn.boundary_flux", nbf)?,
        })
    }

    pub fn equation(&self) -> &EquationSystem {
        &self.eqn
    }

    /// Queues the corrector terms. Density snapshots come from the prepared flow inputs.
    pub fn assemble(&mut self, db: &mut MatrixDataBase, inputs: &PressureInputs<'_>) -> Result<()> {
        let metrics = db.metrics_handle();
        let _t = ProfileTimer::new(&metrics, ProfileCategory::Assembly, "pEqn:assemble");
        let ns = db.topology().num_surfaces();
        let n = db.num_cells();
        check_len("compressibility", n, inputs.psi.len())?;
        check_len("p", n, inputs.p.len())?;
        check_len("rhorAUf", ns, inputs.rhor_auf.len())?;
        let (flow, scratch) = (db.flow, db.scratch);
        let rdt = db.config().rdelta_t();

        db.upload(self.compressibility, inputs.psi)?;
        db.upload(self.p_old, inputs.p)?;
        db.upload_face_flux(self.phi_hby_a, inputs.phi_hby_a)?;
        db.upload_boundary(self.boundary_phi_hby_a, inputs.boundary_phi_hby_a, 1)?;
        db.upload(scratch.face_gamma, inputs.rhor_auf)?;
        db.upload_boundary(scratch.boundary_gamma, inputs.boundary_rhor_auf, 1)?;
        db.upload_boundary(self.boundary_p, inputs.boundary_p, 1)?;

        let eqn = &mut self.eqn;
        eqn.initialize_time_step(db)?;
        eqn.seed_psi(db, self.p_old)?;
        eqn.fvm_ddt(db, self.compressibility, self.compressibility, self.p_old, rdt)?;
        eqn.fvm_laplacian(
            db,
            Gamma::Face(scratch.face_gamma),
            scratch.boundary_gamma,
            LaplacianBoundary::Patch {
                patch: self.patch,
                value: self.boundary_p,
            },
            -1.0,
        )?;
        eqn.fvc_ddt(db, flow.rho, flow.rho_old, None, rdt, -1.0)?;
        eqn.fvc_div_flux(db, self.phi_hby_a, self.boundary_phi_hby_a, -1.0)?;
        eqn.add_to_source(db, None)?;
        eqn.sync(db)
    }

    pub fn solve(&mut self, db: &mut MatrixDataBase) -> Result<LinearSolverStats> {
        let config = db.config().pressure.clone();
        let stats = self.eqn.solve(db, &config)?;
        Ok(stats.into_iter().next().unwrap_or_default())
    }

    pub fn update_psi(&self, db: &MatrixDataBase, p: &mut [f64]) -> Result<()> {
        self.eqn.update_psi(db, p)
    }

    /// `phiHbyA + pEqn.flux()` for the solved pressure; the boundary part is
    /// returned in host boundary order.
    pub fn flux(&self, db: &mut MatrixDataBase, inputs: &PressureInputs<'_>) -> Result<PressureFlux> {
        check_len("phiHbyA", self.flux.len(), inputs.phi_hby_a.len())?;
        db.upload(self.flux, inputs.phi_hby_a)?;
        db.upload_boundary(self.boundary_flux, inputs.boundary_phi_hby_a, 1)?;
        self.eqn.face_flux(db, self.flux, self.boundary_flux)?;
        let internal = db.download(self.flux)?;
        let grouped = db.download(self.boundary_flux)?;
        Ok(PressureFlux {
            internal,
            boundary: db.topology().unpermute_boundary_values(&grouped, 1),
        })
    }
}
