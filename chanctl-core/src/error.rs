use thiserror::Error;

use crate::node::NodeError;

/// Errors returned by the channel registry, the fee policy manager and the
/// unit converter.
///
/// Every failure is returned as a typed result.  None of these are fatal to the
/// process, and the stores keep their prior state when one is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The channel list or the alias table could not be fetched.
    /// The previous snapshot is still served.
    #[error("channel sync failed: {0}")]
    Sync(NodeError),
    /// No channel with this channel point in the current snapshot
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    /// The channel point could not be parsed into an outpoint.
    /// Raised before any request reaches the node.
    #[error("invalid channel reference: {0}")]
    InvalidChannelReference(String),
    /// The node rejected or could not execute a close
    #[error("channel close failed: {0}")]
    CloseFailed(String),
    /// A fee value was missing, negative or not a number
    #[error("invalid fee value: {0}")]
    InvalidFeeValue(String),
    /// A mutation for this channel point is already in flight
    #[error("submission already in progress for {0}")]
    SubmissionInProgress(String),
    /// The node rejected a fee policy update
    #[error("fee update failed: {0}")]
    FeeSubmissionFailed(String),
    /// An amount typed in the current display unit could not be converted
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    /// A close intent was driven through a transition it does not allow
    #[error("invalid close transition: {0}")]
    InvalidTransition(String),
}

impl Error {
    /// Whether the caller can simply try again later.
    ///
    /// A guard rejection or a sync failure is not a real failure of the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Sync(_) | Error::SubmissionInProgress(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_test() {
        assert_eq!(
            Error::InvalidChannelReference("abcd1234".to_string()).to_string(),
            "invalid channel reference: abcd1234"
        );
        assert_eq!(
            Error::Sync(NodeError::Transport("connection refused".to_string())).to_string(),
            "channel sync failed: transport: connection refused"
        );
        assert_eq!(
            Error::SubmissionInProgress("abcd:1".to_string()).to_string(),
            "submission already in progress for abcd:1"
        );
    }

    #[test]
    fn retryable_test() {
        assert!(Error::SubmissionInProgress("a:0".to_string()).is_retryable());
        assert!(Error::Sync(NodeError::Rejected("busy".to_string())).is_retryable());
        assert!(!Error::CloseFailed("no".to_string()).is_retryable());
        assert!(!Error::InvalidFeeValue("-1".to_string()).is_retryable());
    }
}
