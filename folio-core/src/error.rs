use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkManifestFetch,
    NetworkAnnotationFetch,
    NetworkSearchFetch,
    ParsingManifest,
    SelectionFailed,
    SearchUnsupported,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NetworkManifestFetch => "NETWORK_MANIFEST_FETCH",
            ErrorCode::NetworkAnnotationFetch => "NETWORK_ANNOTATION_FETCH",
            ErrorCode::NetworkSearchFetch => "NETWORK_SEARCH_FETCH",
            ErrorCode::ParsingManifest => "PARSING_MANIFEST",
            ErrorCode::SelectionFailed => "SELECTION_FAILED",
            ErrorCode::SearchUnsupported => "SEARCH_UNSUPPORTED",
        }
    }

    fn is_network(self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkManifestFetch
                | ErrorCode::NetworkAnnotationFetch
                | ErrorCode::NetworkSearchFetch
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct StructuredError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    /// Set when the failure was the fetch timeout firing.
    pub timeout: bool,
    pub status: Option<u16>,
}

impl StructuredError {
    pub fn new(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable,
            timeout: false,
            status: None,
        }
    }

    pub fn http_status(code: ErrorCode, url: &str, status: u16) -> Self {
        Self {
            code,
            message: format!("HTTP {status} fetching {url}"),
            recoverable: status >= 500 || status == 429,
            timeout: false,
            status: Some(status),
        }
    }

    pub fn timed_out(code: ErrorCode, url: &str, after_ms: u128) -> Self {
        Self {
            code,
            message: format!("timed out after {after_ms}ms fetching {url}"),
            recoverable: true,
            timeout: true,
            status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The operation was cancelled by its caller. Never retried and never
    /// surfaced to the user.
    #[error("operation aborted")]
    Aborted,
    #[error(transparent)]
    Structured(#[from] StructuredError),
}

impl Error {
    pub fn parse(message: impl Into<String>) -> Self {
        Error::Structured(StructuredError::new(
            ErrorCode::ParsingManifest,
            message,
            false,
        ))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Aborted => false,
            Error::Structured(err) => err.recoverable,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Aborted => None,
            Error::Structured(err) => Some(err.code),
        }
    }

    /// Re-tags a network failure with the code of the subsystem that
    /// issued the request. Parse failures and cancellation pass through.
    pub fn retag_network(self, code: ErrorCode) -> Self {
        match self {
            Error::Structured(mut err) if err.code.is_network() => {
                err.code = code;
                Error::Structured(err)
            }
            other => other,
        }
    }
}

/// Failures reported by a [`crate::Transport`] before any HTTP status is known.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request aborted")]
    Aborted,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("failed to read response body: {0}")]
    Body(String),
}

/// Independent error slots exposed to UI consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorDomain {
    Manifest,
    Annotations,
    Search,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
    pub at: DateTime<Utc>,
}

impl DomainError {
    pub fn new(code: ErrorCode, message: impl Into<String>, recoverable: Option<bool>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable,
            at: Utc::now(),
        }
    }

    /// Returns `None` for cancellation, which is never shown to the user.
    pub fn from_error(err: &Error) -> Option<Self> {
        match err {
            Error::Aborted => None,
            Error::Structured(err) => Some(Self::new(
                err.code,
                err.message.clone(),
                Some(err.recoverable),
            )),
        }
    }
}
