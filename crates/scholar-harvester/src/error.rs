//! Error types for the harvester.
//!
//! Uses `thiserror` for structured error handling with automatic `From` implementations.
//! [`ClientError`] covers a single HTTP exchange; [`HarvestError`] covers everything
//! the pipeline components surface, and carries the transient/fatal classification the
//! retry policy and the orchestrator act on.

use std::path::PathBuf;
use std::time::Duration;

use crate::proxy::AttemptFailure;
use crate::retry::Retryable;

/// Errors from the HTTP transport layer.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    /// HTTP transport error (connection, DNS, TLS, etc.)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Rate limited by the remote source (429 response)
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Suggested wait time before retry
        retry_after: Duration,
    },

    /// Resource not found (404 response)
    #[error("Resource not found: {resource}")]
    NotFound {
        /// Description of the missing resource
        resource: String,
    },

    /// Invalid request parameters (400 response)
    #[error("Bad request: {message}")]
    BadRequest {
        /// Error message from the remote side
        message: String,
    },

    /// Request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Server error (5xx response)
    #[error("Server error ({status}): {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Error message
        message: String,
    },

    /// Unexpected HTTP status
    #[error("Unexpected status {status}: {message}")]
    UnexpectedStatus {
        /// HTTP status code
        status: u16,
        /// Response body or message
        message: String,
    },
}

impl ClientError {
    /// Create a rate limited error with retry-after duration.
    #[must_use]
    pub fn rate_limited(seconds: u64) -> Self {
        Self::RateLimited { retry_after: Duration::from_secs(seconds) }
    }

    /// Create a not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    /// Create a bad request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest { message: message.into() }
    }

    /// Create a server error.
    #[must_use]
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server { status, message: message.into() }
    }

    /// Returns true if this error is retryable.
    ///
    /// Transport failures count as retryable unless the request itself could not be
    /// built; those will fail identically on every attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder(),
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Server { .. } => true,
            Self::NotFound { .. } | Self::BadRequest { .. } | Self::UnexpectedStatus { .. } => {
                false
            }
        }
    }

    /// Get the retry-after duration if this is a rate limit error.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Errors surfaced by the harvesting components and the pipeline.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    /// Error from the HTTP transport
    #[error("transport error: {0}")]
    Client(#[from] ClientError),

    /// The source answered with a captcha or verification page
    #[error("request to {url} was blocked by the source")]
    Blocked {
        /// URL that was requested
        url: String,
    },

    /// Every egress path in the proxy chain failed
    #[error("proxy chain exhausted after {} attempts: {}", failures.len(), format_failures(failures))]
    ChainExhausted {
        /// Per-attempt failure reasons, in the order they were tried
        failures: Vec<AttemptFailure>,
    },

    /// The retry policy gave up
    #[error("gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Failure of the final attempt
        #[source]
        source: Box<HarvestError>,
    },

    /// Malformed profile id, DOI, or similar input
    #[error("invalid {kind} '{value}'")]
    InvalidIdentifier {
        /// What kind of identifier was rejected
        kind: &'static str,
        /// The rejected value
        value: String,
    },

    /// A fetched document did not have the expected shape
    #[error("could not parse {what}: {message}")]
    Parse {
        /// What was being parsed
        what: &'static str,
        /// Parser message
        message: String,
    },

    /// Malformed or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failure on the dataset or cache directory
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        /// Path being read or written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// No stored dataset exists for the profile
    #[error("no dataset stored for profile {0}")]
    MissingDataset(String),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The run was cancelled at a sequence boundary
    #[error("cancelled")]
    Cancelled,
}

impl HarvestError {
    /// Create a parse error.
    #[must_use]
    pub fn parse(what: &'static str, message: impl Into<String>) -> Self {
        Self::Parse { what, message: message.into() }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a storage error.
    #[must_use]
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage { path: path.into(), source }
    }

    /// Create an invalid identifier error.
    #[must_use]
    pub fn invalid(kind: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidIdentifier { kind, value: value.into() }
    }

    /// Transient failures may succeed if tried again later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Client(e) => e.is_retryable(),
            Self::Blocked { .. } | Self::ChainExhausted { .. } => true,
            Self::RetryExhausted { source, .. } => source.is_transient(),
            Self::InvalidIdentifier { .. }
            | Self::Parse { .. }
            | Self::Config(_)
            | Self::Storage { .. }
            | Self::MissingDataset(_)
            | Self::Serialization(_)
            | Self::Cancelled => false,
        }
    }

    /// Fatal failures abort the whole run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::Storage { .. } | Self::Cancelled => true,
            Self::RetryExhausted { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

impl Retryable for HarvestError {
    fn is_retryable(&self) -> bool {
        // Exhaustion is terminal for the policy that produced it; an outer policy
        // must not multiply the attempts.
        !matches!(self, Self::RetryExhausted { .. }) && self.is_transient()
    }

    fn exhausted(self, attempts: u32) -> Self {
        Self::RetryExhausted { attempts, source: Box::new(self) }
    }
}

fn format_failures(failures: &[AttemptFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Result type alias for transport operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Result type alias for harvesting operations.
pub type HarvestResult<T> = Result<T, HarvestError>;
