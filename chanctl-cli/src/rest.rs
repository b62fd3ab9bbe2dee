//! [`NodeClient`] over the node's REST gateway.
//!
//! The gateway encodes 64-bit integers as JSON strings, and omits fields that
//! hold their default value, so every payload struct below defaults missing
//! fields and accepts numbers in either form.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use log::*;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use url::Url;

use chanctl::model::parse_channel_point;
use chanctl::{Channel, NodeClient, NodeError, NodeFeePolicy};

use crate::config::Settings;

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

pub struct RestNode {
    client: Client,
    base_url: Url,
    macaroon: Option<String>,
    force_close: bool,
    time_lock_delta: u32,
}

impl RestNode {
    pub fn new(
        base_url: Url,
        macaroon: Option<String>,
        accept_invalid_certs: bool,
        timeout: Duration,
    ) -> Result<Self, NodeError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(timeout)
            .build()
            .map_err(transport)?;
        Ok(RestNode {
            client,
            base_url: with_trailing_slash(base_url),
            macaroon,
            force_close: false,
            time_lock_delta: crate::config::DEFAULT_TIME_LOCK_DELTA,
        })
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let mut node = RestNode::new(
            settings.url.clone(),
            settings.macaroon_hex()?,
            settings.accept_invalid_certs,
            settings.timeout,
        )?;
        node.force_close = settings.force_close;
        node.time_lock_delta = settings.time_lock_delta;
        Ok(node)
    }

    // Routes are joined relative to the base, so a path prefix such as
    // `https://host/lnd/` is kept.
    fn endpoint(&self, path: &str) -> Result<Url, NodeError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| NodeError::Transport(format!("bad endpoint {}: {}", path, e)))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, NodeError> {
        let request = self.client.request(method, self.endpoint(path)?);
        Ok(match &self.macaroon {
            Some(macaroon) => request.header(MACAROON_HEADER, macaroon),
            None => request,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, NodeError> {
        trace!("GET {}", path);
        let response = self.request(Method::GET, path)?.send().await.map_err(transport)?;
        check_status(response).await?.json().await.map_err(transport)
    }

    async fn channel_point_for_id(&self, channel_id: u64) -> Result<String, NodeError> {
        let list: ChannelList = self.get("/v1/channels").await?;
        list.channels
            .into_iter()
            .find(|c| c.chan_id == channel_id)
            .map(|c| c.channel_point)
            .ok_or_else(|| NodeError::Rejected(format!("channel id {} not found", channel_id)))
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn transport(e: reqwest::Error) -> NodeError {
    NodeError::Transport(e.to_string())
}

async fn check_status(response: Response) -> Result<Response, NodeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(NodeError::Rejected(error_message(status.as_u16(), &body)))
}

fn error_message(status: u16, body: &str) -> String {
    match serde_json::from_str::<RestError>(body) {
        Ok(e) => e.text(),
        Err(_) if body.trim().is_empty() => format!("http status {}", status),
        Err(_) => body.trim().to_string(),
    }
}

/// Reads a streaming response up to the end of its first message
async fn first_message(mut response: Response) -> Result<String, NodeError> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(transport)? {
        buf.extend_from_slice(&chunk);
        if buf.contains(&b'\n') {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    Ok(text.lines().next().unwrap_or_default().to_string())
}

fn parse_close_update(line: &str) -> Result<(), NodeError> {
    if line.trim().is_empty() {
        return Err(NodeError::Transport("close stream ended without an update".to_string()));
    }
    let update: CloseUpdate = serde_json::from_str(line)
        .map_err(|e| NodeError::Transport(format!("bad close update: {}", e)))?;
    match update.error {
        Some(e) => Err(NodeError::Rejected(e.text())),
        None => Ok(()),
    }
}

fn de_num<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum<T> {
        Str(String),
        Num(T),
    }
    match StrOrNum::<T>::deserialize(deserializer)? {
        StrOrNum::Str(s) => s.parse().map_err(de::Error::custom),
        StrOrNum::Num(n) => Ok(n),
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct RestError {
    message: Option<String>,
    error: Option<String>,
}

impl RestError {
    fn text(self) -> String {
        self.message.or(self.error).unwrap_or_else(|| "unknown node error".to_string())
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct ChannelList {
    channels: Vec<ActiveChannel>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct ActiveChannel {
    active: bool,
    remote_pubkey: String,
    channel_point: String,
    #[serde(deserialize_with = "de_num")]
    chan_id: u64,
    #[serde(deserialize_with = "de_num")]
    capacity: u64,
    #[serde(deserialize_with = "de_num")]
    local_balance: u64,
    #[serde(deserialize_with = "de_num")]
    remote_balance: u64,
    #[serde(deserialize_with = "de_num")]
    commit_fee: u64,
    #[serde(deserialize_with = "de_num")]
    commit_weight: u64,
    #[serde(deserialize_with = "de_num")]
    fee_per_kw: u64,
    #[serde(deserialize_with = "de_num")]
    unsettled_balance: u64,
    #[serde(deserialize_with = "de_num")]
    total_satoshis_sent: u64,
    #[serde(deserialize_with = "de_num")]
    total_satoshis_received: u64,
    #[serde(deserialize_with = "de_num")]
    csv_delay: u32,
    private: bool,
    peer_alias: String,
}

impl From<ActiveChannel> for Channel {
    fn from(c: ActiveChannel) -> Self {
        Channel {
            channel_point: c.channel_point,
            // zero means the funding transaction is not confirmed yet
            channel_id: Some(c.chan_id).filter(|id| *id != 0),
            remote_pubkey: c.remote_pubkey,
            alias: Some(c.peer_alias).filter(|a| !a.is_empty()),
            local_balance: c.local_balance,
            remote_balance: c.remote_balance,
            unsettled_balance: c.unsettled_balance,
            capacity: c.capacity,
            is_active: c.active,
            is_private: c.private,
            commit_weight: c.commit_weight,
            commit_fee: c.commit_fee,
            csv_delay: c.csv_delay,
            fee_per_kw: c.fee_per_kw,
            total_satoshis_sent: c.total_satoshis_sent,
            total_satoshis_received: c.total_satoshis_received,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct PendingChannels {
    pending_open_channels: Vec<PendingOpenChannel>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct PendingOpenChannel {
    channel: PendingChannel,
    #[serde(deserialize_with = "de_num")]
    commit_fee: u64,
    #[serde(deserialize_with = "de_num")]
    commit_weight: u64,
    #[serde(deserialize_with = "de_num")]
    fee_per_kw: u64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct PendingChannel {
    remote_node_pub: String,
    channel_point: String,
    #[serde(deserialize_with = "de_num")]
    capacity: u64,
    #[serde(deserialize_with = "de_num")]
    local_balance: u64,
    #[serde(deserialize_with = "de_num")]
    remote_balance: u64,
    private: bool,
}

impl From<PendingOpenChannel> for Channel {
    fn from(p: PendingOpenChannel) -> Self {
        Channel {
            channel_point: p.channel.channel_point,
            channel_id: None,
            remote_pubkey: p.channel.remote_node_pub,
            local_balance: p.channel.local_balance,
            remote_balance: p.channel.remote_balance,
            capacity: p.channel.capacity,
            is_private: p.channel.private,
            commit_weight: p.commit_weight,
            commit_fee: p.commit_fee,
            fee_per_kw: p.fee_per_kw,
            ..Default::default()
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct PeerList {
    peers: Vec<Peer>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct Peer {
    pub_key: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct NodeInfo {
    node: GraphNode,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct GraphNode {
    alias: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct FeeReport {
    channel_fees: Vec<ChannelFeeReport>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct ChannelFeeReport {
    channel_point: String,
    #[serde(deserialize_with = "de_num")]
    base_fee_msat: u64,
    #[serde(deserialize_with = "de_num")]
    fee_rate: f64,
}

impl FeeReport {
    fn policy(&self, channel_point: &str) -> Option<NodeFeePolicy> {
        self.channel_fees.iter().find(|f| f.channel_point == channel_point).map(|f| {
            NodeFeePolicy { base_fee_msat: f.base_fee_msat, fee_rate: f.fee_rate }
        })
    }
}

#[derive(Serialize, Debug)]
struct PolicyUpdateRequest<'a> {
    chan_point: ChanPoint<'a>,
    base_fee_msat: String,
    fee_rate: f64,
    time_lock_delta: u32,
}

#[derive(Serialize, Debug)]
struct ChanPoint<'a> {
    funding_txid_str: &'a str,
    output_index: u32,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct PolicyUpdateResponse {
    failed_updates: Vec<FailedUpdate>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct FailedUpdate {
    reason: String,
    update_error: String,
}

impl PolicyUpdateResponse {
    fn into_result(self) -> Result<(), NodeError> {
        match self.failed_updates.into_iter().next() {
            None => Ok(()),
            Some(f) if !f.update_error.is_empty() => Err(NodeError::Rejected(f.update_error)),
            Some(f) => Err(NodeError::Rejected(f.reason)),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct CloseUpdate {
    error: Option<RestError>,
}

#[async_trait]
impl NodeClient for RestNode {
    async fn list_channels(&self) -> Result<Vec<Channel>, NodeError> {
        let (open, pending) = tokio::try_join!(
            self.get::<ChannelList>("/v1/channels"),
            self.get::<PendingChannels>("/v1/channels/pending"),
        )?;
        let mut channels: Vec<Channel> = open.channels.into_iter().map(Channel::from).collect();
        channels.extend(pending.pending_open_channels.into_iter().map(Channel::from));
        debug!("node lists {} channels", channels.len());
        Ok(channels)
    }

    async fn list_peer_aliases(&self) -> Result<HashMap<String, String>, NodeError> {
        let peers: PeerList = self.get("/v1/peers").await?;
        let mut aliases = HashMap::new();
        for peer in peers.peers {
            let path = format!("/v1/graph/node/{}?include_channels=false", peer.pub_key);
            match self.get::<NodeInfo>(&path).await {
                Ok(info) if !info.node.alias.is_empty() => {
                    aliases.insert(peer.pub_key, info.node.alias);
                }
                Ok(_) => {}
                // peers without a node announcement are not in the graph
                Err(e) => debug!("no alias for {}: {}", peer.pub_key, e),
            }
        }
        Ok(aliases)
    }

    async fn close_channel_by_id(&self, channel_id: u64) -> Result<(), NodeError> {
        let channel_point = self.channel_point_for_id(channel_id).await?;
        let (txid, index) =
            parse_channel_point(&channel_point).map_err(|e| NodeError::Rejected(e.to_string()))?;
        self.close_channel_by_outpoint(&txid, index).await
    }

    async fn close_channel_by_outpoint(
        &self,
        funding_txid: &str,
        output_index: u32,
    ) -> Result<(), NodeError> {
        let path =
            format!("/v1/channels/{}/{}?force={}", funding_txid, output_index, self.force_close);
        info!("DELETE /v1/channels/{}/{}", funding_txid, output_index);
        let response = self.request(Method::DELETE, &path)?.send().await.map_err(transport)?;
        let response = check_status(response).await?;
        // the close keeps running on the node after the stream is dropped
        parse_close_update(&first_message(response).await?)
    }

    async fn get_fee_policy(
        &self,
        channel_point: &str,
    ) -> Result<Option<NodeFeePolicy>, NodeError> {
        let report: FeeReport = self.get("/v1/fees").await?;
        Ok(report.policy(channel_point))
    }

    async fn set_fee_policy(
        &self,
        channel_point: &str,
        base_fee_msat: u64,
        fee_rate: f64,
    ) -> Result<(), NodeError> {
        let (txid, output_index) =
            parse_channel_point(channel_point).map_err(|e| NodeError::Rejected(e.to_string()))?;
        let body = PolicyUpdateRequest {
            chan_point: ChanPoint { funding_txid_str: &txid, output_index },
            base_fee_msat: base_fee_msat.to_string(),
            fee_rate,
            time_lock_delta: self.time_lock_delta,
        };
        info!("POST /v1/chanpolicy {:?}", body);
        let response = self
            .request(Method::POST, "/v1/chanpolicy")?
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let reply: PolicyUpdateResponse =
            check_status(response).await?.json().await.map_err(transport)?;
        reply.into_result()
    }
}
