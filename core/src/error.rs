//! Error types for the dataset engine.
//!
//! Every failure carries a [`Severity`]. Job-fatal errors mean the distributed job cannot
//! continue and the driver is expected to abort every worker; local errors leave the
//! dataset unchanged and are surfaced by soft operations as `false`.

use crate::device::DataType;
use crate::loss::{CostFunction, TargetKind};
use nndataset_kernels::{Activation, KernelError};
use std::path::PathBuf;
use thiserror::Error;

/// How far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The whole job must stop.
    JobFatal,
    /// The calling worker may carry on; state is unchanged.
    Local,
}

#[derive(Error, Debug)]
pub enum DataSetError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed dataset file: {0}")]
    Format(String),

    #[error("Missing required field {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Unsupported data type tag {0}")]
    UnsupportedDataType(u32),

    #[error("Data type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch { expected: DataType, found: DataType },

    #[error("Shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("{op} requires a {expected} dataset")]
    WrongKind {
        op: &'static str,
        expected: &'static str,
    },

    #[error("{what} index {index} out of range (bound {bound})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        bound: usize,
    },

    #[error("Dataset is not sparse")]
    NotSparse,

    #[error("Denoising is not enabled")]
    DenoisingDisabled,

    #[error("{cost:?} is not defined for {kind:?} targets")]
    UnsupportedCost { cost: CostFunction, kind: TargetKind },

    #[error("{cost:?} output delta is not defined for activation {activation:?}")]
    UnsupportedActivation {
        cost: CostFunction,
        activation: Activation,
    },

    #[error("Device buffer {0} has not been allocated")]
    MissingBuffer(&'static str),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("{op} failed on the coordinator")]
    PeerAborted { op: &'static str },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
}

impl DataSetError {
    pub fn severity(&self) -> Severity {
        match self {
            DataSetError::NotSparse | DataSetError::DenoisingDisabled => Severity::Local,
            _ => Severity::JobFatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::JobFatal
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DataSetError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DataSetError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DataSetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity() {
        assert_eq!(DataSetError::NotSparse.severity(), Severity::Local);
        assert_eq!(DataSetError::DenoisingDisabled.severity(), Severity::Local);
        assert!(
            DataSetError::WrongKind {
                op: "get_data_point",
                expected: "dense",
            }
            .is_fatal()
        );
        assert!(DataSetError::PeerAborted { op: "load" }.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = DataSetError::IndexOutOfRange {
            what: "example",
            index: 4,
            bound: 4,
        };
        assert_eq!(format!("{}", err), "example index 4 out of range (bound 4)");

        let err = DataSetError::MissingField("width0".into());
        assert_eq!(format!("{}", err), "Missing required field width0");
    }
}
