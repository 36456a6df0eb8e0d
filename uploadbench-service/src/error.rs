//! Error types for backend operations and object transfers.

use std::error::Error as StdError;
use std::fmt::Write;

use thiserror::Error;

/// Errors returned by a [`Backend`](crate::backend::Backend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// IO errors related to payload streaming.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend could not be set up from the given settings.
    #[error("invalid backend configuration: {0}")]
    Configuration(String),

    /// The backend refused the operation, without an underlying client error.
    #[error("request rejected: {context}")]
    Rejected {
        /// What was rejected and why.
        context: String,
    },

    /// All errors stemming from the storage client. These can be network errors encountered when
    /// sending the request, but can also indicate errors returned by the storage API itself.
    #[error("request failed: {context}")]
    Request {
        /// The operation that failed.
        context: String,
        /// The client error.
        #[source]
        cause: Box<dyn StdError + Send + Sync>,
    },
}

impl BackendError {
    /// Creates a [`BackendError::Rejected`] with the given context.
    pub fn rejected(context: impl Into<String>) -> Self {
        Self::Rejected {
            context: context.into(),
        }
    }

    /// Returns a closure that wraps a client error into [`BackendError::Request`].
    ///
    /// Meant to be used with [`Result::map_err`].
    pub fn request<E>(context: impl Into<String>) -> impl FnOnce(E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let context = context.into();
        move |cause| Self::Request {
            context,
            cause: Box::new(cause),
        }
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Reasons a single object transfer did not complete.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A request against the storage backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The transfer was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,
}

/// Formats an error together with all of its sources, separated by colons.
pub fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        write!(message, ": {cause}").ok();
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_includes_sources() {
        let io = std::io::Error::other("connection reset");
        let error = BackendError::request("failed to upload part 3")(io);

        assert_eq!(
            error_chain(&error),
            "request failed: failed to upload part 3: connection reset"
        );
    }

    #[test]
    fn transparent_transfer_error() {
        let error = TransferError::from(BackendError::rejected("injected failure"));
        assert_eq!(error_chain(&error), "request rejected: injected failure");
        assert_eq!(TransferError::Cancelled.to_string(), "cancelled");
    }
}
