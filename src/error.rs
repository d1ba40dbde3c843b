//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **AppError**: errors returned by HTTP handlers, converted into JSON
//!   responses through actix's `ResponseError` trait.
//! - **ConsultationError**: the failure taxonomy of a live voice consultation.
//!   These never cross the session boundary as a panic or an `Err` returned to
//!   the UI; they are delivered through the session's error callback.
//!
//! ## Propagation summary:
//! - Acquisition and connection failures are fatal for the session.
//! - Decode failures drop one audio chunk and the session carries on.
//! - Tool resolution failures are reported back to the model as an `{error}`
//!   payload so it can verbalize a fallback.
//! - Protocol anomalies are logged and otherwise ignored.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// HTTP-facing error types.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts an `AppError` into a JSON response.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Frame size must be greater than 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures that can occur during a live voice consultation.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConsultationError {
    /// Microphone permission or capture hardware problem.
    #[error("microphone acquisition failed: {0}")]
    Acquisition(String),

    /// Handshake or transport failure with the streaming endpoint.
    #[error("connection to the live endpoint failed: {0}")]
    Connection(String),

    /// A single inbound audio chunk could not be decoded.
    #[error("audio chunk could not be decoded: {0}")]
    Decode(String),

    /// The record store failed while a tool call was being resolved.
    #[error("tool resolution failed: {0}")]
    ToolResolution(String),

    /// The remote model broke the session protocol (e.g. a duplicate completion).
    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(String),
}

impl ConsultationError {
    /// Fatal errors end the session; the rest are absorbed locally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsultationError::Acquisition(_) | ConsultationError::Connection(_)
        )
    }

    /// Machine-readable code used on the UI socket.
    pub fn code(&self) -> &'static str {
        match self {
            ConsultationError::Acquisition(_) => "acquisition_error",
            ConsultationError::Connection(_) => "connection_error",
            ConsultationError::Decode(_) => "decode_error",
            ConsultationError::ToolResolution(_) => "tool_resolution_error",
            ConsultationError::ProtocolAnomaly(_) => "protocol_anomaly",
        }
    }

    /// Generic copy shown to the user. Internal detail is never replayed.
    pub fn user_message(&self) -> &'static str {
        match self {
            ConsultationError::Acquisition(_) => "Failed to start AI service",
            ConsultationError::Connection(_) => {
                "Lost connection to the AI assistant. Please check your network and try again."
            }
            ConsultationError::Decode(_) => "Some assistant audio could not be played",
            ConsultationError::ToolResolution(_) | ConsultationError::ProtocolAnomaly(_) => {
                "The assistant ran into a problem"
            }
        }
    }
}
