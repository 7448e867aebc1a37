#![allow(dead_code)]

use std::sync::Arc;

use dfmatrix::solver::database::{EnergyInputs, FlowInputs};
use dfmatrix::solver::gpu::HostDevice;
use dfmatrix::solver::mesh::MeshInput;
use dfmatrix::{MatrixDataBase, SolverConfig};
use nalgebra::Vector3;

pub fn host_db(mesh: MeshInput, config: &SolverConfig) -> (Arc<HostDevice>, MatrixDataBase) {
    let device = Arc::new(HostDevice::new());
    let db = MatrixDataBase::new(device.clone(), mesh, config).unwrap();
    (device, db)
}

/// Owned host fields behind a `FlowInputs` hand-off.
#[derive(Clone, Debug)]
pub struct FlowState {
    pub rho_old: Vec<f64>,
    pub rho: Vec<f64>,
    pub phi: Vec<f64>,
    pub boundary_phi: Vec<f64>,
    pub boundary_rho: Vec<f64>,
    pub p: Vec<f64>,
    pub boundary_p: Vec<f64>,
    pub u_old: Vec<f64>,
    pub boundary_u: Vec<f64>,
    pub nu_eff: Vec<f64>,
    pub boundary_nu_eff: Vec<f64>,
}

impl FlowState {
    /// Unit density, zero pressure and a uniform velocity whose face flux is `U . Sf`.
    pub fn uniform(mesh: &MeshInput, velocity: Vector3<f64>) -> Self {
        let n = mesh.num_cells;
        let nbf = mesh.num_boundary_faces();
        let flux = |sf: &[f64]| -> Vec<f64> {
            sf.chunks(3)
                .map(|s| velocity.dot(&Vector3::from_column_slice(s)))
                .collect()
        };
        Self {
            rho_old: vec![1.0; n],
            rho: vec![1.0; n],
            phi: flux(&mesh.sf),
            boundary_phi: flux(&mesh.boundary_sf),
            boundary_rho: vec![1.0; nbf],
            p: vec![0.0; n],
            boundary_p: vec![0.0; nbf],
            u_old: velocity.iter().copied().cycle().take(3 * n).collect(),
            boundary_u: velocity.iter().copied().cycle().take(3 * nbf).collect(),
            nu_eff: vec![0.0; n],
            boundary_nu_eff: vec![0.0; nbf],
        }
    }

    pub fn inputs(&self) -> FlowInputs<'_> {
        FlowInputs {
            rho_old: &self.rho_old,
            rho: &self.rho,
            phi: &self.phi,
            boundary_phi: &self.boundary_phi,
            boundary_rho: &self.boundary_rho,
            p: &self.p,
            boundary_p: &self.boundary_p,
            u_old: &self.u_old,
            boundary_u: &self.boundary_u,
            nu_eff: &self.nu_eff,
            boundary_nu_eff: &self.boundary_nu_eff,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EnergyState {
    pub he_old: Vec<f64>,
    pub k: Vec<f64>,
    pub k_old: Vec<f64>,
    pub alpha_eff: Vec<f64>,
    pub dpdt: Vec<f64>,
    pub diff_corr_flux: Vec<f64>,
    pub boundary_he: Vec<f64>,
    pub boundary_k: Vec<f64>,
    pub boundary_alpha_eff: Vec<f64>,
    pub boundary_gradient: Vec<f64>,
    pub boundary_diff_corr_flux: Vec<f64>,
}

impl EnergyState {
    /// Uniform enthalpy, adiabatic walls, no kinetic energy and no pressure work.
    pub fn uniform(mesh: &MeshInput, he: f64) -> Self {
        let n = mesh.num_cells;
        let nbf = mesh.num_boundary_faces();
        Self {
            he_old: vec![he; n],
            k: vec![0.0; n],
            k_old: vec![0.0; n],
            alpha_eff: vec![1.0; n],
            dpdt: vec![0.0; n],
            diff_corr_flux: vec![0.0; 3 * n],
            boundary_he: vec![he; nbf],
            boundary_k: vec![0.0; nbf],
            boundary_alpha_eff: vec![1.0; nbf],
            boundary_gradient: vec![0.0; nbf],
            boundary_diff_corr_flux: vec![0.0; 3 * nbf],
        }
    }

    pub fn inputs(&self) -> EnergyInputs<'_> {
        EnergyInputs {
            he_old: &self.he_old,
            k: &self.k,
            k_old: &self.k_old,
            alpha_eff: &self.alpha_eff,
            dpdt: &self.dpdt,
            diff_corr_flux: &self.diff_corr_flux,
            boundary_he: &self.boundary_he,
            boundary_k: &self.boundary_k,
            boundary_alpha_eff: &self.boundary_alpha_eff,
            boundary_gradient: &self.boundary_gradient,
            boundary_diff_corr_flux: &self.boundary_diff_corr_flux,
        }
    }
}

/// Net outward flux per cell from internal (face order) and boundary (host order) fluxes.
pub fn net_flux(mesh: &MeshInput, internal: &[f64], boundary: &[f64]) -> Vec<f64> {
    let mut net = vec![0.0; mesh.num_cells];
    for (f, &phi) in internal.iter().enumerate() {
        net[mesh.owner[f] as usize] += phi;
        net[mesh.neighbour[f] as usize] -= phi;
    }
    for (b, &phi) in boundary.iter().enumerate() {
        net[mesh.boundary_face_cell[b] as usize] += phi;
    }
    net
}
