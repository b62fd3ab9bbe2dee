//! The node-communication collaborator.
//!
//! Everything the core knows about the remote node goes through [`NodeClient`].
//! The transport behind it (REST, gRPC, an in-process node) is not our concern,
//! only the request/response shape of each call.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Channel, NodeFeePolicy};

/// A failed node call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The request did not get a usable answer (connection, timeout, decode)
    #[error("transport: {0}")]
    Transport(String),
    /// The node answered and refused the request
    #[error("{0}")]
    Rejected(String),
}

impl NodeError {
    /// The message to surface to the user
    pub fn message(&self) -> &str {
        match self {
            NodeError::Transport(s) => s,
            NodeError::Rejected(s) => s,
        }
    }
}

/// Request/response access to a Lightning node
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// All channels the node knows about, including ones pending confirmation
    async fn list_channels(&self) -> Result<Vec<Channel>, NodeError>;

    /// Remote node pubkey to alias
    async fn list_peer_aliases(&self) -> Result<HashMap<String, String>, NodeError>;

    /// Close a confirmed channel by its short channel id
    async fn close_channel_by_id(&self, channel_id: u64) -> Result<(), NodeError>;

    /// Close a channel by its funding outpoint
    async fn close_channel_by_outpoint(
        &self,
        funding_txid: &str,
        output_index: u32,
    ) -> Result<(), NodeError>;

    /// The fee policy this node applies to a channel, `None` if the node has no
    /// explicit record for it
    async fn get_fee_policy(&self, channel_point: &str)
        -> Result<Option<NodeFeePolicy>, NodeError>;

    /// Replace the fee policy of a channel
    async fn set_fee_policy(
        &self,
        channel_point: &str,
        base_fee_msat: u64,
        fee_rate: f64,
    ) -> Result<(), NodeError>;
}
