//! Error types for the orchestrator and API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Errors raised by the lifecycle manager, artifact resolver and memory service
///
/// Cloneable so a single load outcome can be handed to every caller waiting
/// on the same in-flight load.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    /// Every artifact resolution stage was exhausted without a usable engine
    #[error("Model '{slug}' unavailable: {reason}")]
    ModelUnavailable { slug: String, reason: String },

    /// Both the primary and the fallback engine failed to initialize
    #[error("Engine initialization failed for '{slug}': {reason}")]
    EngineInitFailure { slug: String, reason: String },

    /// Speech-to-text models are never loaded through the chat path
    #[error("'{slug}' is a speech-to-text model and cannot be loaded as a chat model")]
    UnsupportedModelKind { slug: String },

    /// Registry lookup or download failed
    #[error("Network failure: {message}")]
    Network { message: String },

    /// Snapshot read or write failed
    #[error("Persistence failure: {message}")]
    Persistence { message: String },

    /// A request against a ready engine failed
    #[error("Engine request failed: {message}")]
    Engine { message: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    /// The embedding model could not be brought up
    #[error("Memory service unavailable: {message}")]
    MemoryUnavailable { message: String },
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn unavailable(slug: &str, reason: impl Into<String>) -> Self {
        Self::ModelUnavailable {
            slug: slug.to_string(),
            reason: reason.into(),
        }
    }

    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }

    pub fn engine(err: impl std::fmt::Display) -> Self {
        Self::Engine {
            message: err.to_string(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::UnsupportedModelKind { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ModelUnavailable { .. }
            | Self::EngineInitFailure { .. }
            | Self::MemoryUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Network { .. } | Self::Engine { .. } => StatusCode::BAD_GATEWAY,
            Self::Persistence { .. } | Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound {
                what: err.to_string(),
            }
        } else {
            Self::Io {
                message: err.to_string(),
            }
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            OrchestratorError::NotFound { what: "x".into() }.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            OrchestratorError::UnsupportedModelKind {
                slug: "whisper-small".into()
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            OrchestratorError::unavailable("m", "gone").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            OrchestratorError::network("timeout").status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: OrchestratorError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing.txt").into();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));

        let err: OrchestratorError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, OrchestratorError::Io { .. }));
    }

    #[test]
    fn test_display_messages() {
        let err = OrchestratorError::UnsupportedModelKind {
            slug: "whisper-small".into(),
        };
        assert!(err.to_string().contains("speech-to-text"));

        let err = OrchestratorError::unavailable("lfm2-350m", "no artifact");
        assert_eq!(err.to_string(), "Model 'lfm2-350m' unavailable: no artifact");
    }
}
