pub mod solver;

pub use solver::database::MatrixDataBase;
pub use solver::error::{Error, Result};
pub use solver::options::SolverConfig;
