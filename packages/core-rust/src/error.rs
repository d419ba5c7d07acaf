//! Error taxonomy shared by reads, mutations, and the remote API.

/// Failure of a read, a mutation, or a remote call.
///
/// `Clone` so a single fetch result can be handed to every reader attached
/// to the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// Connection-level failure or timeout. The only retryable kind.
    #[error("network error: {0}")]
    Network(String),
    /// The remote rejected the request (4xx-class).
    #[error("request rejected ({status}): {message}")]
    Client { status: u16, message: String },
    /// The remote failed while handling the request (5xx-class).
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    /// Invalid input or a malformed optimistic patch. Never sent to the remote.
    #[error("invalid optimistic patch: {0}")]
    Validation(String),
    /// The fetch task panicked or was aborted before producing a result.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    /// Network failure caused by an attempt exceeding its deadline.
    #[must_use]
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Network(format!("request timed out after {timeout_ms}ms"))
    }

    /// Whether the store may retry the request that produced this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Client { .. } => "client",
            Self::Server { .. } => "server",
            Self::Validation(_) => "validation",
            Self::Internal(_) => "internal",
        }
    }

    /// Classifies an HTTP status code. Returns `None` for success codes.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Option<Self> {
        match status {
            400..=499 => Some(Self::Client {
                status,
                message: message.into(),
            }),
            500..=599 => Some(Self::Server {
                status,
                message: message.into(),
            }),
            _ => None,
        }
    }
}
