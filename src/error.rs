use serde_json::Value;
use thiserror::Error;

/// Typed failure taxonomy for the daemon's core operations.
///
/// Every variant maps to exactly one abstract error kind and, at the
/// IPC boundary, to one outbound `error` frame. Kept separate from
/// `anyhow::Error` (still used for ambient/IO failures inside
/// component internals) so that `classify` below is an exhaustive
/// match rather than a substring search.
#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("authentication failed")]
    AuthenticationFailure,

    #[error("not authorized: {0}")]
    AuthorizationFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("internal failure")]
    InternalFailure(#[from] anyhow::Error),
}

impl AlarmError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn not_authorized(what: impl Into<String>) -> Self {
        Self::AuthorizationFailure(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    /// Map to the message that goes out in an `error` frame. Never
    /// leaks internal detail for `InternalFailure` — that detail is
    /// logged instead via `tracing::error!` at the call site.
    pub fn client_message(&self) -> String {
        match self {
            Self::AuthenticationFailure => "authentication failed".to_string(),
            Self::AuthorizationFailure(_) => "not authorized".to_string(),
            Self::NotFound(what) => format!("not found: {what}"),
            Self::Conflict(what) => format!("conflict: {what}"),
            Self::MalformedMessage(what) => format!("malformed message: {what}"),
            Self::TransportFailure(_) => "transport failure".to_string(),
            Self::InternalFailure(_) => "internal error".to_string(),
        }
    }

    /// Whether this error should close the connection outright rather
    /// than produce an `error` frame on an otherwise-live session.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Self::AuthenticationFailure | Self::TransportFailure(_))
    }
}

pub fn error_frame(err: &AlarmError) -> Value {
    serde_json::json!({
        "type": "error",
        "payload": { "message": err.client_message() }
    })
}
