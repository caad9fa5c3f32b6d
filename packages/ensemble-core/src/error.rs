//! Centralized error types for the Ensemble playback engine.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps every error to a machine-readable code via [`ErrorCode`]
//! - Converts transport failures into engine outcomes

use serde::Serialize;
use thiserror::Error;

use crate::sonos::soap::SoapError;
use crate::sonos::types::RendererId;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

impl ErrorCode for SoapError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "http_request_failed",
            Self::HttpStatus(_, _) => "http_error_status",
            Self::Fault(_) => "soap_fault",
            Self::Parse => "soap_parse_error",
        }
    }
}

/// Outcome taxonomy of renderer-facing engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum EngineError {
    /// The renderer has no resolvable coordinator connection.
    #[error("No coordinator instance for renderer {0}")]
    NoCoordinator(RendererId),

    /// The track request was cancelled by a newer request for the same renderer.
    ///
    /// This is a control-flow signal, not a user-facing failure.
    #[error("Track request superseded by a newer request")]
    RequestSuperseded,

    /// A protocol call was rejected by the device.
    #[error("Action failed: {0}")]
    ActionFailure(String),

    /// The connection to the renderer is lost.
    #[error("Connection to renderer {0} is dead")]
    ConnectionDead(RendererId),

    /// Reconciliation found the device persistently diverging from the expected track.
    #[error("Renderer {0} is desynchronized: {1}")]
    Desynchronized(RendererId, String),

    /// The track's codec tag is not one the engine can encode.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// The renderer id is not known to the engine.
    #[error("Unknown renderer: {0}")]
    UnknownRenderer(RendererId),

    /// Caller supplied an invalid argument.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Engine configuration is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ErrorCode for EngineError {
    fn code(&self) -> &'static str {
        match self {
            Self::NoCoordinator(_) => "no_coordinator",
            Self::RequestSuperseded => "request_superseded",
            Self::ActionFailure(_) => "action_failure",
            Self::ConnectionDead(_) => "connection_dead",
            Self::Desynchronized(_, _) => "desynchronized",
            Self::UnsupportedCodec(_) => "unsupported_codec",
            Self::UnknownRenderer(_) => "unknown_renderer",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

impl EngineError {
    /// Returns true for outcomes that only signal supersession.
    #[must_use]
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::RequestSuperseded)
    }
}

impl From<SoapError> for EngineError {
    fn from(err: SoapError) -> Self {
        Self::ActionFailure(format!("{} ({})", err, err.code()))
    }
}

/// Convenient Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

// Re-export Result type aliases from their defining modules
pub use crate::sonos::soap::SoapResult;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soap_fault_becomes_action_failure() {
        let err: EngineError = SoapError::Fault("UPnPError (701)".into()).into();
        assert_eq!(err.code(), "action_failure");
        assert!(err.to_string().contains("701"));
    }

    #[test]
    fn serializes_with_type_tag() {
        let err = EngineError::NoCoordinator(RendererId::new("RINCON_A"));
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["type"], "NoCoordinator");
        assert_eq!(json["details"], "RINCON_A");
    }

    #[test]
    fn superseded_is_control_flow() {
        assert!(EngineError::RequestSuperseded.is_superseded());
        assert!(!EngineError::ActionFailure("x".into()).is_superseded());
    }
}
