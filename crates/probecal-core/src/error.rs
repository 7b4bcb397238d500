use crate::Real;
use thiserror::Error;

/// Errors surfaced by the calibration engine.
///
/// Routine incompleteness (no stereo pair yet, fewer than two cameras for pair
/// selection, a probe that has not converged) is reported through `Option` or
/// a status value instead of this type.
#[derive(Debug, Error)]
pub enum CalibError {
    /// Array sizes do not match the expected layout. Raised before any solve.
    #[error("input shape mismatch for {what}: expected {expected}, got {actual}")]
    InputShape {
        what: String,
        expected: usize,
        actual: usize,
    },
    /// Not enough cameras, points or observations for an operation the caller
    /// explicitly asked for.
    #[error("insufficient data for {operation}: need {required}, have {available}")]
    InsufficientData {
        operation: String,
        required: usize,
        available: usize,
    },
    /// The nonlinear solver failed or the geometry was degenerate.
    ///
    /// `last_estimate` carries the parameter vector the solver started from (or
    /// stopped at) for diagnostics.
    #[error("numerical solver failure: {message}")]
    NumericalSolverFailure {
        message: String,
        last_estimate: Option<Vec<Real>>,
    },
    /// A camera id was referenced that has no calibration on record.
    #[error("camera {0} has no intrinsic calibration")]
    UnknownCamera(String),
    /// Correspondence log could not be parsed or written.
    #[error("correspondence log: {0}")]
    Log(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CalibError {
    pub fn shape(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::InputShape {
            what: what.into(),
            expected,
            actual,
        }
    }

    pub fn insufficient(operation: impl Into<String>, required: usize, available: usize) -> Self {
        Self::InsufficientData {
            operation: operation.into(),
            required,
            available,
        }
    }

    /// Wrap a lower-level solver error, keeping its full context chain.
    pub fn solver(err: anyhow::Error, last_estimate: Option<Vec<Real>>) -> Self {
        Self::NumericalSolverFailure {
            message: format!("{err:#}"),
            last_estimate,
        }
    }
}

pub type CalibResult<T> = Result<T, CalibError>;
