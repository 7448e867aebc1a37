//! Hands an assembled system to the Krylov solvers and writes the solution
//! back into the system's `psi` buffer.

use std::time::Instant;

use rayon::prelude::*;

use crate::solver::database::MatrixDataBase;
use crate::solver::error::Result;
use crate::solver::gpu::LinearSystem;
use crate::solver::linear_solver::{self, LinearSolverStats, SparseMatrix};
use crate::solver::options::LinearSolverConfig;
use crate::solver::profiling::ProfileCategory;

pub struct LinearSolverBridge;

impl LinearSolverBridge {
    /// Solves every component of `system` starting from its current `psi`.
    /// Returns one stats entry per component; non-convergence is logged, not
    /// returned as an error.
    pub fn solve(
        db: &MatrixDataBase,
        system: &LinearSystem,
        config: &LinearSolverConfig,
    ) -> Result<Vec<LinearSolverStats>> {
        let start = Instant::now();
        db.sync()?;
        let values = db.download(system.values)?;
        let source = db.download(system.source)?;
        let mut psi = db.download(system.psi)?;

        let topology = db.topology();
        let (nnz, ncmpt) = (system.nnz as usize, system.ncmpt as usize);
        let (row_ptr, col_index) = (topology.row_ptr(), topology.col_index());

        let results: Vec<(Vec<f64>, LinearSolverStats)> = (0..ncmpt)
            .into_par_iter()
            .map(|c| {
                let a = SparseMatrix::from_csr(row_ptr, col_index, values[c * nnz..(c + 1) * nnz].to_vec());
                let b: Vec<f64> = source.iter().skip(c).step_by(ncmpt).copied().collect();
                let mut x: Vec<f64> = psi.iter().skip(c).step_by(ncmpt).copied().collect();
                let stats = linear_solver::solve(&a, &b, &mut x, config);
                (x, stats)
            })
            .collect();

        let mut stats = Vec::with_capacity(ncmpt);
        for (c, (x, s)) in results.into_iter().enumerate() {
            for (i, v) in x.into_iter().enumerate() {
                psi[i * ncmpt + c] = v;
            }
            if s.diverged {
                log::warn!(
                    "component {c}: solver diverged after {} iterations (residual {:e})",
                    s.iterations,
                    s.residual
                );
            } else if !s.converged {
                log::warn!(
                    "component {c}: not converged after {} iterations (residual {:e}, initial {:e})",
                    s.iterations,
                    s.residual,
                    s.initial_residual
                );
            } else {
                log::debug!(
                    "component {c}: {} iterations, residual {:e} -> {:e} in {:?}",
                    s.iterations,
                    s.initial_residual,
                    s.residual,
                    s.time
                );
            }
            stats.push(s);
        }

        db.upload(system.psi, &psi)?;
        db.metrics().record_location(
            "bridge:solve",
            ProfileCategory::Solve,
            start.elapsed(),
            system.values.size_bytes(),
        );
        Ok(stats)
    }
}
