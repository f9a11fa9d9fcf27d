// SPDX-License-Identifier: PolyForm-Shield-1.0

use protocol::{ModelName, ParseModelNameError};
use thiserror::Error;

/// Why a generate call did not produce images.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    #[error(transparent)]
    UnknownModel(#[from] ParseModelNameError),

    /// Another caller is loading the model; retry later.
    #[error("{0} is being loaded by another request; retry shortly")]
    Busy(ModelName),

    #[error("failed to load {model}: {reason}")]
    LoadFailed { model: ModelName, reason: String },

    #[error("render on {model} failed: {reason}")]
    RenderFailed { model: ModelName, reason: String },

    /// The host is stopping and no longer loads or serves models.
    #[error("server is shutting down; {0} is unavailable")]
    ShuttingDown(ModelName),
}

impl GenerateError {
    /// Only contention is worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerateError::Busy(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnloadError {
    #[error(transparent)]
    UnknownModel(#[from] ParseModelNameError),

    #[error("{0} is not loaded")]
    NotResident(ModelName),

    #[error("teardown of {model} failed: {reason}")]
    TeardownFailed { model: ModelName, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_busy_is_retryable() {
        assert!(GenerateError::Busy(ModelName::StableLarge).is_retryable());
        assert!(!GenerateError::LoadFailed {
            model: ModelName::StableLarge,
            reason: "oom".into(),
        }
        .is_retryable());
        assert!(!GenerateError::RenderFailed {
            model: ModelName::FluxDev,
            reason: "nan".into(),
        }
        .is_retryable());
        assert!(!GenerateError::UnknownModel(ParseModelNameError("dalle".into())).is_retryable());
        assert!(!GenerateError::ShuttingDown(ModelName::FluxDev).is_retryable());
    }
}
