//! Error types for the mixture-model denoising engine.

use std::fmt;

/// Errors that can occur during model construction, fitting, or estimation.
///
/// A fit that merely fails to reach eps-convergence within the iteration
/// limit is *not* an error; it is reported through
/// [`FitStatus::IterationLimit`](crate::fitter::FitStatus) with the partial
/// model returned intact.
#[derive(Debug, Clone)]
pub enum GmmError {
    /// Invalid configuration parameter, surfaced before any iteration starts.
    InvalidConfig {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why it's invalid.
        message: String,
    },

    /// A covariance became numerically singular after regularization.
    ///
    /// For a per-component covariance this is handled internally by
    /// deactivating the component; it propagates only when the shared
    /// covariance is affected (no fallback exists) or when construction
    /// itself fails.
    NumericalInstability {
        /// Offending component index, if attributable to one component.
        component: Option<usize>,
        /// Description of the failure.
        message: String,
    },

    /// Input dimensionality does not match the model dimensionality.
    DimensionMismatch {
        /// Dimensionality the model expects.
        expected: usize,
        /// Dimensionality the input carries.
        actual: usize,
    },

    /// The input contained zero patches.
    EmptyInput,
}

impl fmt::Display for GmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GmmError::InvalidConfig { parameter, message } => {
                write!(f, "Invalid configuration for '{}': {}", parameter, message)
            }
            GmmError::NumericalInstability { component, message } => match component {
                Some(c) => write!(
                    f,
                    "Numerical instability in component {}: {}",
                    c, message
                ),
                None => write!(f, "Numerical instability: {}", message),
            },
            GmmError::DimensionMismatch { expected, actual } => {
                write!(
                    f,
                    "Dimension mismatch: model expects D = {}, input has D = {}",
                    expected, actual
                )
            }
            GmmError::EmptyInput => write!(f, "Input contains zero patches"),
        }
    }
}

impl std::error::Error for GmmError {}

/// Convenience type alias for Results with GmmError.
pub type Result<T> = std::result::Result<T, GmmError>;
