//! Error type shared by every fallible operation in the crate.

use thiserror::Error;

/// Errors raised by projections, the recurrent core and configuration loading.
///
/// All variants describe caller mistakes; none of them is transient, so a failed call
/// should be fixed at the call site rather than retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RvtError {
    /// The module was wired or used in a way its configuration does not allow.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Batch or spatial dimensions disagree with each other or with stored state.
    #[error("shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// A scalar argument is outside its valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RvtError {
    pub fn config(msg: impl Into<String>) -> Self {
        RvtError::Configuration(msg.into())
    }

    pub fn shape(context: impl Into<String>, expected: &[usize], found: &[usize]) -> Self {
        RvtError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        RvtError::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RvtError>;
