//! Custom error types for rustsyntheca.
//!
//! All fallible operations return `Result<T, SynthecaError>`. The enum also
//! carries the transient/fatal classification used by the retrying client.

use thiserror::Error;

/// Main error type for rustsyntheca operations.
#[derive(Debug, Error)]
pub enum SynthecaError {
    /// Network-level failure (connect, timeout, body read)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("HTTP {status} from {url}")]
    Http {
        /// Response status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Transient failures persisted for the whole attempt budget
    #[error("{method} {url} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        method: String,
        url: String,
        attempts: u32,
        /// Last error observed before giving up
        last: Box<SynthecaError>,
    },

    /// XML could not be tokenized
    #[error("XML error: {0}")]
    Xml(String),

    /// OAI-PMH protocol error element (other than noRecordsMatch)
    #[error("OAI-PMH error {code}: {message}")]
    Oai { code: String, message: String },

    /// Payload was well-formed but not shaped as expected
    #[error("Parse error: {0}")]
    Parse(String),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Work was abandoned before completion
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl SynthecaError {
    /// Whether a retry may succeed: timeouts, connect, send and body-read
    /// failures, HTTP 429 and 5xx. Builder, URL and redirect-policy errors
    /// are fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            SynthecaError::Network(e) => {
                // reqwest reports a body stream cut short as a decode error
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode()
            }
            SynthecaError::Http { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }

    /// HTTP status carried by this error, looking through exhausted retries.
    pub fn status(&self) -> Option<u16> {
        match self {
            SynthecaError::Http { status, .. } => Some(*status),
            SynthecaError::Network(e) => e.status().map(|s| s.as_u16()),
            SynthecaError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

/// Result type alias using `SynthecaError`
pub type Result<T> = std::result::Result<T, SynthecaError>;

/// Extension trait for adding context to Option types
pub trait OptionExt<T> {
    /// Convert Option to Result with a parse error message
    fn ok_or_parse(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_parse(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| SynthecaError::Parse(msg.to_string()))
    }
}
