//! Equation assembly on top of the matrix data base.
//!
//! An [`EquationSystem`] owns one `A psi = b` system and queues the term
//! kernels that build it. Terms must arrive in the order
//! `initialize_time_step -> fvm_* -> fvc_* -> add_to_source -> sync`;
//! the phase machine rejects anything that moves backwards.

pub mod energy;
pub mod momentum;
pub mod pressure;
pub mod species;

pub use energy::EnergyEquation;
pub use momentum::{MomentumEquation, MomentumInputs};
pub use pressure::{PressureEquation, PressureFlux, PressureInputs};
pub use species::SpeciesEquation;

use crate::solver::bridge::LinearSolverBridge;
use crate::solver::database::MatrixDataBase;
use crate::solver::error::{check_len, AssemblyError, Result};
use crate::solver::gpu::{DeviceBuffer, Kernel, LinearSystem};
use crate::solver::linear_solver::LinearSolverStats;
use crate::solver::options::{DivScheme, LinearSolverConfig};

type F = DeviceBuffer<f64>;
type U = DeviceBuffer<u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Initialized,
    Implicit,
    Explicit,
    Folded,
    Synced,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Initialized => "initialize_time_step",
            Phase::Implicit => "fvm terms",
            Phase::Explicit => "fvc terms",
            Phase::Folded => "add_to_source",
            Phase::Synced => "sync",
        }
    }
}

/// An externally assembled matrix in `[lower | diag | upper]` order, with
/// its interleaved source, added to the system scaled by `coeff`.
#[derive(Debug, Clone, Copy)]
pub struct LduContribution<'a> {
    pub matrix: &'a [f64],
    pub source: &'a [f64],
    pub coeff: f64,
}

/// Diffusivity of a Laplacian term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gamma {
    /// Per cell, linearly interpolated to faces.
    Cell(F),
    /// Per internal face, in face order.
    Face(F),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaplacianBoundary {
    /// Linearise each face by its patch type around `value`.
    Patch { patch: U, value: F },
    /// Prescribed surface-normal gradient on every non-empty face.
    FixedGradient { patch: U, gradient: F },
}

pub struct EquationSystem {
    name: &'static str,
    system: LinearSystem,
    phase: Phase,
    strict: bool,
}

impl EquationSystem {
    pub fn new(db: &mut MatrixDataBase, name: &'static str, ncmpt: usize) -> Result<Self> {
        let system = db.allocate_system(name, ncmpt)?;
        Ok(Self {
            name,
            system,
            phase: Phase::Idle,
            strict: db.config().strict_ordering,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn system(&self) -> &LinearSystem {
        &self.system
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, op: &'static str, to: Phase) -> Result<()> {
        use Phase::*;
        let allowed = match to {
            Idle | Initialized => true,
            Implicit => matches!(self.phase, Initialized | Implicit),
            Explicit => matches!(self.phase, Initialized | Implicit | Explicit),
            Folded => matches!(self.phase, Initialized | Implicit | Explicit),
            Synced => matches!(self.phase, Folded | Synced),
        };
        if allowed {
            self.phase = to;
            return Ok(());
        }
        let new_pass = matches!(self.phase, Idle | Synced) && to != Synced;
        if new_pass && !self.strict {
            log::warn!(
                "{}: `{}` without initialize_time_step, terms accumulate onto the previous pass",
                self.name,
                op
            );
            self.phase = to;
            return Ok(());
        }
        Err(AssemblyError::Phase {
            equation: self.name,
            op,
            phase: self.phase.name(),
        }
        .into())
    }

    fn require_synced(&self, op: &'static str) -> Result<()> {
        if self.phase == Phase::Synced {
            Ok(())
        } else {
            Err(AssemblyError::Phase {
                equation: self.name,
                op,
                phase: self.phase.name(),
            }
            .into())
        }
    }

    /// Zeroes the matrix, source and boundary coefficients. `psi` is kept as
    /// the initial guess.
    pub fn initialize_time_step(&mut self, db: &mut MatrixDataBase) -> Result<()> {
        self.enter("initialize_time_step", Phase::Initialized)?;
        let sys = self.system;
        for buffer in [sys.values, sys.source, sys.internal_coeffs, sys.boundary_coeffs] {
            db.fill(buffer, 0.0)?;
        }
        Ok(())
    }

    /// Copies `src` into `psi` on the device.
    pub fn seed_psi(&mut self, db: &mut MatrixDataBase, src: F) -> Result<()> {
        check_len("initial guess", self.system.psi.len(), src.len())?;
        db.device()
            .copy_buffer(src.id(), 0, self.system.psi.id(), 0, src.size_bytes())?;
        Ok(())
    }

    /// `diag += rdt rho V`, `source += rdt rho_old psi_old V`.
    pub fn fvm_ddt(&mut self, db: &mut MatrixDataBase, rho: F, rho_old: F, psi_old: F, rdt: f64) -> Result<()> {
        self.enter("fvm_ddt", Phase::Implicit)?;
        db.launch(Kernel::FvmDdt {
            sys: self.system,
            diag_index: db.csr.diag_index,
            volume: db.mesh.volume,
            rho,
            rho_old,
            psi_old,
            rdt,
        })?;
        Ok(())
    }

    /// Implicit convection of `psi` by the slot-ordered flux `phi`, with the
    /// boundary linearised around `boundary_value`.
    pub fn fvm_div(
        &mut self,
        db: &mut MatrixDataBase,
        phi: F,
        boundary_phi: F,
        patch: U,
        boundary_value: F,
        coeff: f64,
    ) -> Result<()> {
        self.enter("fvm_div", Phase::Implicit)?;
        let weight = match db.config().div_scheme {
            DivScheme::Linear => db.faces.weight,
            DivScheme::Upwind => {
                let dst = db.scratch.face_weight;
                db.launch(Kernel::UpwindWeight { dst, phi })?;
                dst
            }
        };
        db.launch(Kernel::FvmDiv {
            sys: self.system,
            csr: db.csr,
            weight,
            phi,
            coeff,
        })?;
        db.launch(Kernel::BoundaryDiv {
            sys: self.system,
            patch_type: patch,
            phi: boundary_phi,
            weight: db.mesh.boundary_weight,
            value: boundary_value,
            coeff,
        })?;
        Ok(())
    }

    pub fn fvm_laplacian(
        &mut self,
        db: &mut MatrixDataBase,
        gamma: Gamma,
        boundary_gamma: F,
        boundary: LaplacianBoundary,
        coeff: f64,
    ) -> Result<()> {
        self.enter("fvm_laplacian", Phase::Implicit)?;
        let (gamma, face_gamma) = match gamma {
            Gamma::Cell(g) => (g, false),
            Gamma::Face(g) => (g, true),
        };
        db.launch(Kernel::FvmLaplacian {
            sys: self.system,
            csr: db.csr,
            faces: db.faces,
            gamma,
            face_gamma,
            coeff,
        })?;
        let zero = db.scratch.boundary_zero;
        let (patch, value, gradient, fixed_gradient) = match boundary {
            LaplacianBoundary::Patch { patch, value } => (patch, value, zero, false),
            LaplacianBoundary::FixedGradient { patch, gradient } => (patch, zero, gradient, true),
        };
        db.launch(Kernel::BoundaryLaplacian {
            sys: self.system,
            patch_type: patch,
            gamma: boundary_gamma,
            mag_sf: db.mesh.boundary_mag_sf,
            delta_coeffs: db.mesh.boundary_delta_coeffs,
            value,
            gradient,
            fixed_gradient,
            coeff,
        })?;
        Ok(())
    }

    /// Adds `coeff * sum(Sf psi_f)` to a three-component source, divided by
    /// the cell volume when `volume_scaled`.
    pub fn fvc_grad(
        &mut self,
        db: &mut MatrixDataBase,
        field: F,
        boundary_field: F,
        coeff: f64,
        volume_scaled: bool,
    ) -> Result<()> {
        self.enter("fvc_grad", Phase::Explicit)?;
        check_len("fvc_grad source components", 3, self.system.ncmpt as usize)?;
        db.launch(Kernel::FvcGradScalar {
            out: self.system.source,
            field,
            boundary_field,
            csr: db.csr,
            faces: db.faces,
            volume: db.mesh.volume,
            coeff,
            volume_scaled,
        })?;
        Ok(())
    }

    /// Writes the cell gradient tensor of a vector field into `out` (nine per cell).
    pub fn fvc_grad_vector(&mut self, db: &mut MatrixDataBase, field: F, boundary_field: F, out: F) -> Result<()> {
        self.enter("fvc_grad_vector", Phase::Explicit)?;
        db.launch(Kernel::FvcGradVector {
            out,
            field,
            boundary_field,
            csr: db.csr,
            faces: db.faces,
            volume: db.mesh.volume,
        })?;
        Ok(())
    }

    /// `out = grad^T - 2/3 tr(grad) I`.
    pub fn dev2_transpose(&mut self, db: &mut MatrixDataBase, grad: F, out: F) -> Result<()> {
        self.enter("dev2_transpose", Phase::Explicit)?;
        db.launch(Kernel::Dev2Transpose { out, grad })?;
        Ok(())
    }

    pub fn fvc_div_tensor(
        &mut self,
        db: &mut MatrixDataBase,
        tensor: F,
        gamma: F,
        boundary_gamma: F,
        coeff: f64,
    ) -> Result<()> {
        self.enter("fvc_div_tensor", Phase::Explicit)?;
        db.launch(Kernel::FvcDivTensor {
            source: self.system.source,
            tensor,
            gamma,
            boundary_gamma,
            csr: db.csr,
            faces: db.faces,
            coeff,
        })?;
        Ok(())
    }

    /// Divergence of `phi * field_f` with `field` linearly interpolated.
    pub fn fvc_div_face_scalar(
        &mut self,
        db: &mut MatrixDataBase,
        phi: F,
        field: F,
        boundary_phi: F,
        boundary_field: F,
        coeff: f64,
    ) -> Result<()> {
        self.enter("fvc_div_face_scalar", Phase::Explicit)?;
        db.launch(Kernel::FvcDivFaceScalar {
            source: self.system.source,
            phi,
            field,
            boundary_phi,
            boundary_field,
            csr: db.csr,
            weight: db.faces.weight,
            coeff,
        })?;
        Ok(())
    }

    pub fn fvc_div_cell_vector(&mut self, db: &mut MatrixDataBase, field: F, boundary_field: F, coeff: f64) -> Result<()> {
        self.enter("fvc_div_cell_vector", Phase::Explicit)?;
        db.launch(Kernel::FvcDivCellVector {
            source: self.system.source,
            field,
            boundary_field,
            csr: db.csr,
            faces: db.faces,
            coeff,
        })?;
        Ok(())
    }

    /// Divergence of a slot-ordered face flux.
    pub fn fvc_div_flux(&mut self, db: &mut MatrixDataBase, flux: F, boundary_flux: F, coeff: f64) -> Result<()> {
        self.enter("fvc_div_flux", Phase::Explicit)?;
        db.launch(Kernel::FvcDivFlux {
            source: self.system.source,
            flux,
            boundary_flux,
            csr: db.csr,
            coeff,
        })?;
        Ok(())
    }

    pub fn fvc_ddt(
        &mut self,
        db: &mut MatrixDataBase,
        rho: F,
        rho_old: F,
        field: Option<(F, F)>,
        rdt: f64,
        coeff: f64,
    ) -> Result<()> {
        self.enter("fvc_ddt", Phase::Explicit)?;
        db.launch(Kernel::FvcDdt {
            source: self.system.source,
            rho,
            rho_old,
            field,
            volume: db.mesh.volume,
            rdt,
            coeff,
        })?;
        Ok(())
    }

    pub fn add_cell_source(&mut self, db: &mut MatrixDataBase, field: F, coeff: f64, volume_scaled: bool) -> Result<()> {
        self.enter("add_cell_source", Phase::Explicit)?;
        db.launch(Kernel::AddCellSource {
            source: self.system.source,
            field,
            volume: db.mesh.volume,
            ncmpt: self.system.ncmpt,
            coeff,
            volume_scaled,
        })?;
        Ok(())
    }

    /// Folds the optional external matrix, then the boundary coefficients
    /// into the diagonal and source, one boundary-cell group at a time.
    pub fn add_to_source(&mut self, db: &mut MatrixDataBase, ldu: Option<&LduContribution<'_>>) -> Result<()> {
        let source_len = self.system.source.len();
        if let Some(ldu) = ldu {
            check_len("ldu matrix", self.system.nnz as usize, ldu.matrix.len())?;
            check_len("ldu source", source_len, ldu.source.len())?;
        }
        self.enter("add_to_source", Phase::Folded)?;
        if let Some(ldu) = ldu {
            let (matrix, source) = (db.scratch.ldu, db.scratch.ldu_source);
            let source = DeviceBuffer::from_raw(source.id(), source_len);
            db.upload(matrix, ldu.matrix)?;
            db.upload(source, ldu.source)?;
            db.launch(Kernel::AddLduMatrix {
                sys: self.system,
                ldu: matrix,
                ldu_source: source,
                tmp_perm: db.mesh.tmp_permutated_list,
                coeff: ldu.coeff,
            })?;
        }
        db.launch(Kernel::AddBoundaryDiagSrc {
            sys: self.system,
            diag_index: db.csr.diag_index,
            cell_offset: db.mesh.boundary_cell_offset,
            cell_id: db.mesh.boundary_cell_id,
        })?;
        Ok(())
    }

    pub fn sync(&mut self, db: &mut MatrixDataBase) -> Result<()> {
        self.enter("sync", Phase::Synced)?;
        db.sync()
    }

    pub fn solve(&mut self, db: &mut MatrixDataBase, config: &LinearSolverConfig) -> Result<Vec<LinearSolverStats>> {
        self.require_synced("solve")?;
        LinearSolverBridge::solve(db, &self.system, config)
    }

    /// Diagonal coefficient per unit volume, boundary contributions averaged
    /// over components.
    pub fn compute_a(&self, db: &mut MatrixDataBase, out: F) -> Result<()> {
        self.require_synced("A")?;
        check_len("A", self.system.num_cells as usize, out.len())?;
        db.launch(Kernel::ComputeA {
            out,
            sys: self.system,
            diag_index: db.csr.diag_index,
            cell_boundary_ptr: db.csr.cell_boundary_ptr,
            volume: db.mesh.volume,
        })?;
        Ok(())
    }

    /// Off-diagonal residual `(b - sum(a_nb psi_nb)) / V`, interleaved like `psi`.
    pub fn compute_h(&self, db: &mut MatrixDataBase, out: F) -> Result<()> {
        self.require_synced("H")?;
        check_len("H", self.system.psi.len(), out.len())?;
        db.launch(Kernel::ComputeH {
            out,
            sys: self.system,
            csr: db.csr,
            volume: db.mesh.volume,
        })?;
        Ok(())
    }

    /// Adds the matrix face fluxes of the current solution to `out` (face
    /// order) and `boundary_out` (grouped order).
    pub fn face_flux(&self, db: &mut MatrixDataBase, out: F, boundary_out: F) -> Result<()> {
        self.require_synced("flux")?;
        check_len("flux components", 1, self.system.ncmpt as usize)?;
        db.launch(Kernel::FaceFlux {
            out,
            sys: self.system,
            face_csr_index: db.mesh.face_csr_index,
            owner: db.mesh.owner,
            neighbour: db.mesh.neighbour,
        })?;
        db.launch(Kernel::BoundaryFaceFlux {
            out: boundary_out,
            sys: self.system,
            boundary_face_cell: db.mesh.boundary_face_cell,
        })?;
        Ok(())
    }

    pub fn update_psi(&self, db: &MatrixDataBase, psi: &mut [f64]) -> Result<()> {
        self.require_synced("update_psi")?;
        db.update_psi(&self.system, psi)
    }

    pub fn correct_psi(&self, db: &MatrixDataBase, psi: &[f64]) -> Result<()> {
        db.correct_psi(&self.system, psi)
    }

    /// Returns the system's buffers to the device.
    pub fn release(self, db: &mut MatrixDataBase) -> Result<()> {
        db.release_system(self.system)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::solver::error::Error;
    use crate::solver::gpu::HostDevice;
    use crate::solver::mesh::BoxMesh;
    use crate::solver::options::SolverConfig;

    fn setup(strict: bool) -> (MatrixDataBase, EquationSystem) {
        let config = SolverConfig {
            strict_ordering: strict,
            ..SolverConfig::default()
        };
        let mut db = MatrixDataBase::new(Arc::new(HostDevice::new()), BoxMesh::channel_1d(3).generate(), &config)
            .unwrap();
        let eqn = EquationSystem::new(&mut db, "test", 1).unwrap();
        (db, eqn)
    }

    fn assert_phase_error(result: Result<()>) {
        assert!(matches!(result, Err(Error::Assembly(AssemblyError::Phase { .. }))));
    }

    #[test]
    fn implicit_after_explicit_is_rejected() {
        let (mut db, mut eqn) = setup(false);
        let (rho, cell) = (db.flow.rho, db.energy.k);
        eqn.initialize_time_step(&mut db).unwrap();
        eqn.fvc_ddt(&mut db, rho, rho, None, 1.0, -1.0).unwrap();
        assert_phase_error(eqn.fvm_ddt(&mut db, rho, rho, cell, 1.0));
        assert_eq!(eqn.phase(), Phase::Explicit);
    }

    #[test]
    fn terms_after_add_to_source_are_rejected() {
        let (mut db, mut eqn) = setup(false);
        let source = db.energy.dpdt;
        eqn.initialize_time_step(&mut db).unwrap();
        eqn.add_to_source(&mut db, None).unwrap();
        assert_phase_error(eqn.add_cell_source(&mut db, source, 1.0, true));
    }

    #[test]
    fn solve_requires_sync() {
        let (mut db, mut eqn) = setup(false);
        eqn.initialize_time_step(&mut db).unwrap();
        let config = LinearSolverConfig::default();
        assert!(matches!(
            eqn.solve(&mut db, &config),
            Err(Error::Assembly(AssemblyError::Phase { op: "solve", .. }))
        ));
        assert_phase_error(eqn.sync(&mut db));
    }

    #[test]
    fn unreset_pass_warns_unless_strict() {
        let (mut db, mut eqn) = setup(false);
        let rho = db.flow.rho;
        let psi_old = db.energy.he_old;
        eqn.initialize_time_step(&mut db).unwrap();
        eqn.add_to_source(&mut db, None).unwrap();
        eqn.sync(&mut db).unwrap();
        assert!(eqn.fvm_ddt(&mut db, rho, rho, psi_old, 1.0).is_ok());

        let (mut db, mut strict) = setup(true);
        let (rho, psi_old) = (db.flow.rho, db.energy.he_old);
        strict.initialize_time_step(&mut db).unwrap();
        strict.add_to_source(&mut db, None).unwrap();
        strict.sync(&mut db).unwrap();
        assert_phase_error(strict.fvm_ddt(&mut db, rho, rho, psi_old, 1.0));
        strict.initialize_time_step(&mut db).unwrap();
        assert_eq!(strict.phase(), Phase::Initialized);
    }

    #[test]
    fn ldu_length_is_checked() {
        let (mut db, mut eqn) = setup(false);
        eqn.initialize_time_step(&mut db).unwrap();
        let ldu = LduContribution {
            matrix: &[1.0; 3],
            source: &[0.0; 3],
            coeff: 1.0,
        };
        assert!(matches!(
            eqn.add_to_source(&mut db, Some(&ldu)),
            Err(Error::Assembly(AssemblyError::Input { what: "ldu matrix", .. }))
        ));
        assert_eq!(eqn.phase(), Phase::Initialized);
    }
}
