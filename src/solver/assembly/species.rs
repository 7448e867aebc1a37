//! Species transport, one scalar system per species:
//! `ddt(rho, Yi) + div(phi, Yi) - laplacian(rhoD_i, Yi) = S_i`.

use crate::solver::assembly::{EquationSystem, Gamma, LaplacianBoundary};
use crate::solver::database::MatrixDataBase;
use crate::solver::error::{check_len, Result};
use crate::solver::gpu::DeviceBuffer;
use crate::solver::linear_solver::LinearSolverStats;
use crate::solver::profiling::{ProfileCategory, ProfileTimer};

pub struct SpeciesEquation {
    eqns: Vec<EquationSystem>,
}

impl SpeciesEquation {
    pub fn new(db: &mut MatrixDataBase) -> Result<Self> {
        let eqns = (0..db.num_species())
            .map(|_| EquationSystem::new(db, "YEqn", 1))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { eqns })
    }

    pub fn num_species(&self) -> usize {
        self.eqns.len()
    }

    pub fn equation(&self, species: usize) -> &EquationSystem {
        &self.eqns[species]
    }

    /// Queues the transport terms of one species. `source` is a volumetric
    /// rate per cell. Flow and species inputs must already be prepared.
    pub fn assemble(&mut self, db: &mut MatrixDataBase, species: usize, source: Option<&[f64]>) -> Result<()> {
        let metrics = db.metrics_handle();
        let _t = ProfileTimer::new(&metrics, ProfileCategory::Assembly, "YEqn:assemble");
        let flow = db.flow;
        let patch = db.mesh.species_patch;
        let (y, rho_d) = (db.species.y[species], db.species.rho_d[species]);
        let (y_b, rho_d_b) = (db.species.boundary_y[species], db.species.boundary_rho_d[species]);
        let rdt = db.config().rdelta_t();
        let staging = DeviceBuffer::from_raw(db.scratch.cell.id(), db.num_cells());

        let eqn = &mut self.eqns[species];
        eqn.initialize_time_step(db)?;
        eqn.seed_psi(db, y)?;
        eqn.fvm_ddt(db, flow.rho, flow.rho_old, y, rdt)?;
        eqn.fvm_div(db, flow.phi, flow.boundary_phi, patch, y_b, 1.0)?;
        eqn.fvm_laplacian(
            db,
            Gamma::Cell(rho_d),
            rho_d_b,
            LaplacianBoundary::Patch { patch, value: y_b },
            -1.0,
        )?;
        if let Some(source) = source {
            check_len("species source", db.num_cells(), source.len())?;
            db.upload(staging, source)?;
            eqn.add_cell_source(db, staging, 1.0, true)?;
        }
        eqn.add_to_source(db, None)?;
        eqn.sync(db)
    }

    pub fn solve(&mut self, db: &mut MatrixDataBase, species: usize) -> Result<LinearSolverStats> {
        let config = db.config().species.clone();
        let stats = self.eqns[species].solve(db, &config)?;
        Ok(stats.into_iter().next().unwrap_or_default())
    }

    pub fn update_psi(&self, db: &MatrixDataBase, species: usize, y: &mut [f64]) -> Result<()> {
        self.eqns[species].update_psi(db, y)
    }
}
