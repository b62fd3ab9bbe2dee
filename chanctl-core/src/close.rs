//! The caller-side close flow for one channel.
//!
//! Closing is irreversible, so the request goes through an explicit
//! confirmation step first:
//!
//! ```text
//! Idle -> ConfirmPending -> Closing -> Closed
//!   ^          |               |
//!   +--cancel--+               +--> Idle (with error)
//! ```

use crate::error::Error;
use crate::model::{Channel, NavigationHint};
use crate::registry::ChannelRegistry;

#[derive(Clone, Debug, PartialEq)]
pub enum CloseState {
    /// Nothing requested.  Carries the error of the last failed attempt.
    Idle { last_error: Option<String> },
    /// The user asked to close and must confirm
    ConfirmPending,
    /// The close request is with the node
    Closing,
    Closed,
}

/// Close intent for a single channel, owned by the presentation layer
#[derive(Clone, Debug, PartialEq)]
pub struct CloseIntent {
    state: CloseState,
}

impl Default for CloseIntent {
    fn default() -> Self {
        CloseIntent { state: CloseState::Idle { last_error: None } }
    }
}

impl CloseIntent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &CloseState {
        &self.state
    }

    pub fn is_confirm_pending(&self) -> bool {
        self.state == CloseState::ConfirmPending
    }

    /// Ask for confirmation
    pub fn request(&mut self) -> Result<(), Error> {
        match self.state {
            CloseState::Idle { .. } => {
                self.state = CloseState::ConfirmPending;
                Ok(())
            }
            _ => Err(self.invalid("request")),
        }
    }

    /// Back to Idle without side effects
    pub fn cancel(&mut self) -> Result<(), Error> {
        match self.state {
            CloseState::ConfirmPending => {
                self.state = CloseState::Idle { last_error: None };
                Ok(())
            }
            _ => Err(self.invalid("cancel")),
        }
    }

    /// The close/cancel button: request from Idle, cancel from ConfirmPending
    pub fn toggle(&mut self) -> Result<(), Error> {
        match self.state {
            CloseState::ConfirmPending => self.cancel(),
            _ => self.request(),
        }
    }

    /// The user confirmed, the request is about to be sent
    pub fn begin(&mut self) -> Result<(), Error> {
        match self.state {
            CloseState::ConfirmPending => {
                self.state = CloseState::Closing;
                Ok(())
            }
            _ => Err(self.invalid("begin")),
        }
    }

    /// Record the node's answer to the close request
    pub fn finish<T>(&mut self, result: &Result<T, Error>) -> Result<(), Error> {
        if self.state != CloseState::Closing {
            return Err(self.invalid("finish"));
        }
        self.state = match result {
            Ok(_) => CloseState::Closed,
            Err(e) => CloseState::Idle { last_error: Some(e.to_string()) },
        };
        Ok(())
    }

    /// Confirm and run the close against the registry
    pub async fn confirm(
        &mut self,
        registry: &ChannelRegistry,
        channel: &Channel,
    ) -> Result<NavigationHint, Error> {
        self.begin()?;
        let result = registry.close_channel(channel).await;
        self.finish(&result)?;
        result
    }

    fn invalid(&self, action: &str) -> Error {
        Error::InvalidTransition(format!("cannot {} while {:?}", action, self.state))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::node::NodeError;
    use crate::util::mocks::{make_test_channel, MockNode, NodeCall};

    #[test]
    fn transitions_test() {
        let mut intent = CloseIntent::new();
        assert!(intent.begin().is_err());
        assert!(intent.cancel().is_err());

        intent.toggle().unwrap();
        assert!(intent.is_confirm_pending());
        intent.toggle().unwrap();
        assert_eq!(intent.state(), &CloseState::Idle { last_error: None });

        intent.request().unwrap();
        assert!(intent.request().is_err());
        intent.begin().unwrap();
        assert!(intent.cancel().is_err());
        intent.finish::<()>(&Err(Error::CloseFailed("peer offline".to_string()))).unwrap();
        assert_eq!(
            intent.state(),
            &CloseState::Idle { last_error: Some("channel close failed: peer offline".to_string()) }
        );
        // a failed attempt can be retried by the user
        intent.request().unwrap();
    }

    #[tokio::test]
    async fn confirm_test() {
        let channel = make_test_channel("aa:0", Some(3));
        let node = Arc::new(MockNode::new(vec![channel.clone()]));
        let registry = ChannelRegistry::new(node.clone());
        registry.refresh().await.unwrap();

        let mut intent = CloseIntent::new();
        // no confirmation, no request
        assert!(matches!(
            intent.confirm(&registry, &channel).await,
            Err(Error::InvalidTransition(_))
        ));
        assert!(!node.calls().contains(&NodeCall::CloseById(3)));

        intent.request().unwrap();
        node.fail_close(Some(NodeError::Rejected("busy".to_string())));
        assert!(intent.confirm(&registry, &channel).await.is_err());
        assert!(matches!(intent.state(), CloseState::Idle { last_error: Some(_) }));

        node.fail_close(None);
        intent.request().unwrap();
        assert_eq!(intent.confirm(&registry, &channel).await, Ok(NavigationHint::ReturnToWallet));
        assert_eq!(intent.state(), &CloseState::Closed);
        assert!(intent.request().is_err());
    }
}
