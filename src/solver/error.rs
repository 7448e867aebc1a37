use std::fmt;
use std::panic::Location;

/// Malformed connectivity detected while building the CSR skeleton.
///
/// These are configuration errors: the caller handed in a mesh the permuter
/// cannot lay out, and nothing has been allocated on the device yet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("{what}: expected {expected} entries, got {actual}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{what}[{index}] = {cell} is outside 0..{num_cells}")]
    CellOutOfRange {
        what: &'static str,
        index: usize,
        cell: u32,
        num_cells: usize,
    },
    #[error("face {face}: owner {owner} must be lower than neighbour {neighbour}")]
    OwnerNotLower { face: usize, owner: u32, neighbour: u32 },
    #[error("face {face} repeats the cell pair ({owner}, {neighbour})")]
    DuplicateFace { face: usize, owner: u32, neighbour: u32 },
    #[error("row pointer decreases at row {row}")]
    NonMonotoneRowPointer { row: usize },
    #[error("row {row} has no diagonal entry")]
    MissingDiagonal { row: usize },
    #[error("unknown patch type '{name}' on patch {patch}")]
    UnknownPatchType { patch: usize, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceErrorKind {
    OutOfMemory { requested: u64, available: u64 },
    InvalidBuffer(u64),
    SizeMismatch { expected: u64, actual: u64 },
    Transfer(String),
    Backend(String),
    Unsupported(String),
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceErrorKind::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of device memory (requested {requested} bytes, {available} available)"
            ),
            DeviceErrorKind::InvalidBuffer(id) => write!(f, "invalid buffer handle {id}"),
            DeviceErrorKind::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch (expected {expected} bytes, got {actual})")
            }
            DeviceErrorKind::Transfer(msg) => write!(f, "transfer failed: {msg}"),
            DeviceErrorKind::Backend(msg) => write!(f, "backend error: {msg}"),
            DeviceErrorKind::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

/// Fatal device failure. Carries the operation plus the source location that
/// detected it, mirroring a `file:line` CUDA-style diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device error at {file}:{line} during {op}: {kind}")]
pub struct DeviceError {
    pub op: &'static str,
    pub kind: DeviceErrorKind,
    pub file: &'static str,
    pub line: u32,
}

impl DeviceError {
    #[track_caller]
    pub fn new(op: &'static str, kind: DeviceErrorKind) -> Self {
        let location = Location::caller();
        Self {
            op,
            kind,
            file: location.file(),
            line: location.line(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("{equation}: `{op}` is not allowed after `{phase}`")]
    Phase {
        equation: &'static str,
        op: &'static str,
        phase: &'static str,
    },
    #[error("{what}: expected {expected} values, got {actual}")]
    Input {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Device failures terminate the run; everything else is the caller's to handle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Device(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Checks a host slice length before it is staged for the device.
pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(AssemblyError::Input {
            what,
            expected,
            actual,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_records_call_site() {
        let err = DeviceError::new("create_buffer", DeviceErrorKind::InvalidBuffer(7));
        assert!(err.file.ends_with("error.rs"));
        assert!(err.line > 0);
        let text = err.to_string();
        assert!(text.contains("create_buffer"));
        assert!(text.contains("invalid buffer handle 7"));
    }

    #[test]
    fn only_device_errors_are_fatal() {
        let dev: Error = DeviceError::new("sync", DeviceErrorKind::Backend("lost".into())).into();
        assert!(dev.is_fatal());
        let topo: Error = TopologyError::MissingDiagonal { row: 3 }.into();
        assert!(!topo.is_fatal());
    }
}
