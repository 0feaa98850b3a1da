//! Errors returned by the moderation and messaging backends.
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// XRPC error names that mean the session must be renewed.
const SESSION_ERRORS: &[&str] = &["ExpiredToken", "InvalidToken", "AuthenticationRequired"];

/// A failed call against an XRPC service.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The service answered with an error status.
    #[error("{status}: {}", describe(.error, .message))]
    Xrpc {
        status: StatusCode,
        error: Option<String>,
        message: Option<String>,
    },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("failed to decode response: {0}")]
    Decode(String),
    /// No session is available and one could not be established.
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
}

fn describe(error: &Option<String>, message: &Option<String>) -> String {
    let error = error.as_deref().unwrap_or("Unknown");
    match message.as_deref() {
        Some(message) => format!("{error} ({message})"),
        None => error.to_owned(),
    }
}

/// The standard XRPC error body.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct XrpcErrorBody {
    pub error: Option<String>,
    pub message: Option<String>,
}

impl ApiError {
    pub(crate) fn from_response(status: StatusCode, body: &str) -> Self {
        let body: XrpcErrorBody = serde_json::from_str(body).unwrap_or_else(|_| XrpcErrorBody {
            error: None,
            message: (!body.is_empty()).then(|| body.to_owned()),
        });
        Self::Xrpc {
            status,
            error: body.error,
            message: body.message,
        }
    }

    /// The backend rejected the request itself (e.g. an unknown label), so
    /// repeating it cannot help.
    pub fn is_bad_request(&self) -> bool {
        match *self {
            Self::Xrpc {
                status,
                ref error,
                ref message,
            } => {
                status == StatusCode::BAD_REQUEST
                    || error.as_deref() == Some("InvalidRequest")
                    || message
                        .as_deref()
                        .is_some_and(|m| m.contains("Invalid label"))
            }
            _ => false,
        }
    }

    /// Whether the call may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        !self.is_bad_request()
    }

    /// The session used for the call has expired or was rejected.
    pub fn is_session_expired(&self) -> bool {
        match *self {
            Self::Xrpc {
                status, ref error, ..
            } => {
                status == StatusCode::UNAUTHORIZED
                    || error
                        .as_deref()
                        .is_some_and(|e| SESSION_ERRORS.contains(&e))
            }
            Self::Unauthenticated(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err)
        }
    }
}
