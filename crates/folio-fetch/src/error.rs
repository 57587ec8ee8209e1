use std::sync::Arc;

use thiserror::Error;

/// An error that happens while fetching a resource.
///
/// Errors are cheap to clone, since the same outcome of a single coalesced fetch is handed to
/// every caller that joined it.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The fetch function itself failed, for example because the backend could not be reached.
    ///
    /// The error is passed through verbatim and shared among all coalesced callers.
    #[error("fetch failed: {0:#}")]
    Failed(Arc<anyhow::Error>),
    /// The fetch was superseded by a newer fetch of the same subscription, or the subscription
    /// was torn down.
    ///
    /// This is never surfaced to consumers as a subscription error.
    #[error("fetch was cancelled")]
    Cancelled,
    /// The fetch stopped without settling, for instance because it panicked or the runtime is
    /// shutting down.
    #[error("fetch aborted before it settled")]
    Aborted,
    /// A caller joined a pending request whose fetch produces a different type.
    ///
    /// The attached string is the request key.
    #[error("pending request `{0}` resolves to a different type")]
    TypeMismatch(String),
}

impl FetchError {
    /// Returns `true` if this error only denotes a superseded fetch.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the error produced by the fetch function, if any.
    pub fn fetch_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Returns `true` if both errors originate from the very same failed fetch.
    pub fn is_same_failure(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Failed(a), Self::Failed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }
}
