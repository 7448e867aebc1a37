pub mod assembly;
pub mod boundary;
pub mod bridge;
pub mod database;
pub mod error;
pub mod gpu;
pub mod linear_solver;
pub mod mesh;
pub mod options;
pub mod profiling;
pub mod topology;

pub use assembly::{EquationSystem, Gamma, LaplacianBoundary, LduContribution, Phase};
pub use bridge::LinearSolverBridge;
pub use database::{EnergyInputs, FlowInputs, MatrixDataBase, SpeciesInputs};
pub use gpu::{open_device, ComputeDevice, HostDevice};
pub use linear_solver::LinearSolverStats;
pub use options::{LinearSolverConfig, SolverConfig};
pub use topology::MatrixTopology;
