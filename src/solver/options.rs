use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::solver::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Host,
    Wgpu,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "host" | "cpu" => Ok(BackendKind::Host),
            "wgpu" | "gpu" => Ok(BackendKind::Wgpu),
            _ => Err(format!("unknown backend: {}", value)),
        }
    }
}

/// Face interpolation used by the implicit convection term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivScheme {
    #[default]
    Linear,
    Upwind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KrylovMethod {
    #[default]
    BiCgStab,
    Cg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionerType {
    None,
    #[default]
    Jacobi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearSolverConfig {
    pub method: KrylovMethod,
    pub preconditioner: PreconditionerType,
    /// Absolute residual tolerance.
    pub tolerance: f64,
    /// Residual reduction relative to the initial residual; 0 disables it.
    pub rel_tol: f64,
    pub max_iter: usize,
}

impl Default for LinearSolverConfig {
    fn default() -> Self {
        Self {
            method: KrylovMethod::BiCgStab,
            preconditioner: PreconditionerType::Jacobi,
            tolerance: 1e-10,
            rel_tol: 0.0,
            max_iter: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub backend: BackendKind,
    pub delta_t: f64,
    pub div_scheme: DivScheme,
    pub energy: LinearSolverConfig,
    pub momentum: LinearSolverConfig,
    pub pressure: LinearSolverConfig,
    pub species: LinearSolverConfig,
    /// Reject a new assembly pass that was not preceded by `initialize_time_step`
    /// instead of warning and accumulating.
    pub strict_ordering: bool,
    /// Caps host-backend allocations; `None` means unlimited.
    pub memory_limit_bytes: Option<u64>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Host,
            delta_t: 1e-3,
            div_scheme: DivScheme::Linear,
            energy: LinearSolverConfig::default(),
            momentum: LinearSolverConfig::default(),
            pressure: LinearSolverConfig {
                method: KrylovMethod::Cg,
                ..LinearSolverConfig::default()
            },
            species: LinearSolverConfig::default(),
            strict_ordering: false,
            memory_limit_bytes: None,
        }
    }
}

impl SolverConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn rdelta_t(&self) -> f64 {
        1.0 / self.delta_t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg = SolverConfig::from_json_str(
            r#"{ "delta_t": 0.5, "div_scheme": "upwind", "pressure": { "max_iter": 20 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.delta_t, 0.5);
        assert_eq!(cfg.div_scheme, DivScheme::Upwind);
        assert_eq!(cfg.pressure.max_iter, 20);
        assert_eq!(cfg.pressure.method, KrylovMethod::BiCgStab);
        assert_eq!(cfg.backend, BackendKind::Host);
        assert!(!cfg.strict_ordering);
    }

    #[test]
    fn bad_json_is_a_config_error() {
        assert!(matches!(
            SolverConfig::from_json_str("{ delta_t: }"),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            SolverConfig::load("/nonexistent/dfmatrix.json"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn backend_parses_aliases() {
        assert_eq!("gpu".parse::<BackendKind>(), Ok(BackendKind::Wgpu));
        assert!("cuda".parse::<BackendKind>().is_err());
    }
}
