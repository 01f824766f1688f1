//! Shared utility functions for provider adapters.

use cro_domain::error::OrchestratorError;

/// Convert a [`reqwest::Error`] into the domain error type.
pub(crate) fn from_reqwest(e: reqwest::Error) -> OrchestratorError {
    OrchestratorError::Provider {
        provider: "http".into(),
        message: e.to_string(),
    }
}
