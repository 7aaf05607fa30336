//! Error types for cloud-registry

use thiserror::Error;

/// Errors that can occur while talking to the cloud API
#[derive(Error, Debug)]
pub enum CloudError {
    /// Transport-level failure (connect, TLS, timeout)
    #[error("HTTP error: {0}")]
    Http(String),

    /// The API answered with a non-success status
    #[error("API error {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Response body did not match the expected schema
    #[error("failed to decode API response: {0}")]
    Decode(String),

    /// A field the orchestrator depends on was absent or null
    #[error("API response missing required field: {0}")]
    MissingField(&'static str),

    /// Listing had more pages than the client is willing to follow
    #[error("image listing exceeds {max_pages} pages; refusing to act on a partial list")]
    TooManyPages { max_pages: u32 },

    /// Client could not be constructed from its configuration
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl CloudError {
    /// Whether the API reported the resource as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::Api { status: 404, .. })
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CloudError::Decode(err.to_string())
        } else {
            CloudError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(err: serde_json::Error) -> Self {
        CloudError::Decode(err.to_string())
    }
}

/// Result type for cloud API operations
pub type CloudResult<T> = std::result::Result<T, CloudError>;
