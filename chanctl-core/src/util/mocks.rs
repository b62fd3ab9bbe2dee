//! A scriptable in-memory node for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::model::{Channel, NodeFeePolicy};
use crate::node::{NodeClient, NodeError};

/// A node call, as recorded by [`MockNode`]
#[derive(Clone, Debug, PartialEq)]
pub enum NodeCall {
    ListChannels,
    ListPeerAliases,
    CloseById(u64),
    CloseByOutpoint(String, u32),
    GetFeePolicy(String),
    SetFeePolicy(String, u64, f64),
}

/// Holds one node call in flight until released.
///
/// `entered` resolves once the call has reached the node, which lets a test
/// act while the request is outstanding.
#[derive(Clone, Default)]
pub struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    /// Wait until the held call has reached the node
    pub async fn entered(&self) {
        self.entered.notified().await
    }

    /// Let the held call answer
    pub fn release(&self) {
        self.release.notify_one()
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await
    }
}

#[derive(Default)]
struct State {
    channels: Vec<Channel>,
    aliases: HashMap<String, String>,
    policies: HashMap<String, NodeFeePolicy>,
    calls: Vec<NodeCall>,
    list_error: Option<NodeError>,
    close_error: Option<NodeError>,
    fee_error: Option<NodeError>,
    list_gate: Option<Gate>,
    alias_gate: Option<Gate>,
    fetch_gate: Option<Gate>,
    close_gate: Option<Gate>,
    fee_gate: Option<Gate>,
}

/// In-memory [`NodeClient`] with call recording and failure injection.
///
/// A successful close removes the channel from the node's list.
#[derive(Default)]
pub struct MockNode {
    state: Mutex<State>,
}

impl MockNode {
    pub fn new(channels: Vec<Channel>) -> Self {
        let node = MockNode::default();
        node.set_channels(channels);
        node
    }

    pub fn set_channels(&self, channels: Vec<Channel>) {
        self.state.lock().unwrap().channels = channels;
    }

    pub fn add_alias(&self, pubkey: &str, alias: &str) {
        self.state.lock().unwrap().aliases.insert(pubkey.to_string(), alias.to_string());
    }

    pub fn set_policy(&self, channel_point: &str, base_fee_msat: u64, fee_rate: f64) {
        self.state
            .lock()
            .unwrap()
            .policies
            .insert(channel_point.to_string(), NodeFeePolicy { base_fee_msat, fee_rate });
    }

    pub fn policy(&self, channel_point: &str) -> Option<NodeFeePolicy> {
        self.state.lock().unwrap().policies.get(channel_point).copied()
    }

    /// Fail every list call until cleared with `None`
    pub fn fail_list(&self, error: Option<NodeError>) {
        self.state.lock().unwrap().list_error = error;
    }

    /// Fail every close call until cleared with `None`
    pub fn fail_close(&self, error: Option<NodeError>) {
        self.state.lock().unwrap().close_error = error;
    }

    /// Fail every fee update until cleared with `None`
    pub fn fail_fees(&self, error: Option<NodeError>) {
        self.state.lock().unwrap().fee_error = error;
    }

    /// Hold the next `list_channels` call.  The channel list is captured
    /// before the call is held.
    pub fn hold_list(&self) -> Gate {
        let gate = Gate::default();
        self.state.lock().unwrap().list_gate = Some(gate.clone());
        gate
    }

    /// Hold the next `list_peer_aliases` call.  The alias table is captured
    /// before the call is held.
    pub fn hold_aliases(&self) -> Gate {
        let gate = Gate::default();
        self.state.lock().unwrap().alias_gate = Some(gate.clone());
        gate
    }

    /// Hold the next `get_fee_policy` call.  The policy is captured before the
    /// call is held.
    pub fn hold_fetch(&self) -> Gate {
        let gate = Gate::default();
        self.state.lock().unwrap().fetch_gate = Some(gate.clone());
        gate
    }

    /// Hold the next close call
    pub fn hold_close(&self) -> Gate {
        let gate = Gate::default();
        self.state.lock().unwrap().close_gate = Some(gate.clone());
        gate
    }

    /// Hold the next `set_fee_policy` call
    pub fn hold_fees(&self) -> Gate {
        let gate = Gate::default();
        self.state.lock().unwrap().fee_gate = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<NodeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: NodeCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    async fn finish_close(
        &self,
        gate: Option<Gate>,
        matches: impl Fn(&Channel) -> bool,
    ) -> Result<(), NodeError> {
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.close_error.clone() {
            return Err(err);
        }
        let before = state.channels.len();
        state.channels.retain(|c| !matches(c));
        if state.channels.len() == before {
            return Err(NodeError::Rejected("channel not found".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn list_channels(&self) -> Result<Vec<Channel>, NodeError> {
        self.record(NodeCall::ListChannels);
        let (channels, error, gate) = {
            let mut state = self.state.lock().unwrap();
            (state.channels.clone(), state.list_error.clone(), state.list_gate.take())
        };
        if let Some(gate) = gate {
            gate.pass().await;
        }
        match error {
            Some(err) => Err(err),
            None => Ok(channels),
        }
    }

    async fn list_peer_aliases(&self) -> Result<HashMap<String, String>, NodeError> {
        self.record(NodeCall::ListPeerAliases);
        let (aliases, error, gate) = {
            let mut state = self.state.lock().unwrap();
            (state.aliases.clone(), state.list_error.clone(), state.alias_gate.take())
        };
        if let Some(gate) = gate {
            gate.pass().await;
        }
        match error {
            Some(err) => Err(err),
            None => Ok(aliases),
        }
    }

    async fn close_channel_by_id(&self, channel_id: u64) -> Result<(), NodeError> {
        self.record(NodeCall::CloseById(channel_id));
        let gate = self.state.lock().unwrap().close_gate.take();
        self.finish_close(gate, |c| c.channel_id == Some(channel_id)).await
    }

    async fn close_channel_by_outpoint(
        &self,
        funding_txid: &str,
        output_index: u32,
    ) -> Result<(), NodeError> {
        self.record(NodeCall::CloseByOutpoint(funding_txid.to_string(), output_index));
        let gate = self.state.lock().unwrap().close_gate.take();
        let channel_point = format!("{}:{}", funding_txid, output_index);
        self.finish_close(gate, |c| c.channel_point == channel_point).await
    }

    async fn get_fee_policy(
        &self,
        channel_point: &str,
    ) -> Result<Option<NodeFeePolicy>, NodeError> {
        self.record(NodeCall::GetFeePolicy(channel_point.to_string()));
        let (policy, gate) = {
            let mut state = self.state.lock().unwrap();
            (state.policies.get(channel_point).copied(), state.fetch_gate.take())
        };
        if let Some(gate) = gate {
            gate.pass().await;
        }
        Ok(policy)
    }

    async fn set_fee_policy(
        &self,
        channel_point: &str,
        base_fee_msat: u64,
        fee_rate: f64,
    ) -> Result<(), NodeError> {
        self.record(NodeCall::SetFeePolicy(channel_point.to_string(), base_fee_msat, fee_rate));
        let gate = self.state.lock().unwrap().fee_gate.take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fee_error.clone() {
            return Err(err);
        }
        state
            .policies
            .insert(channel_point.to_string(), NodeFeePolicy { base_fee_msat, fee_rate });
        Ok(())
    }
}

/// A channel with plausible balances
pub fn make_test_channel(channel_point: &str, channel_id: Option<u64>) -> Channel {
    Channel {
        channel_point: channel_point.to_string(),
        channel_id,
        remote_pubkey: format!("02{}", "ab".repeat(32)),
        alias: None,
        local_balance: 600_000,
        remote_balance: 390_000,
        unsettled_balance: 0,
        capacity: 1_000_000,
        is_active: channel_id.is_some(),
        is_private: false,
        commit_weight: 724,
        commit_fee: 9_050,
        csv_delay: 144,
        fee_per_kw: 12_500,
        total_satoshis_sent: 0,
        total_satoshis_received: 0,
    }
}
