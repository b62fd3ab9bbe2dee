use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A payment channel with a remote peer, as last reported by the node.
///
/// Channels are replaced wholesale on every registry sync.  All amounts are in
/// satoshis.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    /// Funding outpoint as `txid:vout`
    pub channel_point: String,
    /// Short channel id, only assigned once the funding is confirmed
    pub channel_id: Option<u64>,
    pub remote_pubkey: String,
    /// Alias reported with the channel, may be overridden by the peer alias table
    pub alias: Option<String>,
    pub local_balance: u64,
    pub remote_balance: u64,
    pub unsettled_balance: u64,
    pub capacity: u64,
    pub is_active: bool,
    pub is_private: bool,
    pub commit_weight: u64,
    pub commit_fee: u64,
    pub csv_delay: u32,
    pub fee_per_kw: u64,
    pub total_satoshis_sent: u64,
    pub total_satoshis_received: u64,
}

impl Channel {
    /// A channel without a short channel id has not been confirmed yet
    pub fn is_pending(&self) -> bool {
        self.channel_id.is_none()
    }

    /// Check the soft invariant `local + remote + unsettled <= capacity`.
    ///
    /// Returns an observation when it does not hold.
    pub fn balance_observation(&self) -> Option<BalanceObservation> {
        let total = self
            .local_balance
            .checked_add(self.remote_balance)
            .and_then(|t| t.checked_add(self.unsettled_balance));
        match total {
            Some(t) if t <= self.capacity => None,
            _ => Some(BalanceObservation {
                channel_point: self.channel_point.clone(),
                total,
                capacity: self.capacity,
            }),
        }
    }
}

/// A channel whose balances add up to more than its capacity.
///
/// This is a data quality note about what the node reported, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceObservation {
    pub channel_point: String,
    /// `None` if the sum overflowed
    pub total: Option<u64>,
    pub capacity: u64,
}

impl fmt::Display for BalanceObservation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.total {
            Some(total) => write!(
                f,
                "{}: balances sum to {} but capacity is {}",
                self.channel_point, total, self.capacity
            ),
            None => write!(
                f,
                "{}: balances overflow, capacity is {}",
                self.channel_point, self.capacity
            ),
        }
    }
}

/// How a close request addresses the channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseTarget {
    /// A confirmed channel, by short channel id
    ById(u64),
    /// A channel still pending confirmation, by funding outpoint
    ByOutpoint { funding_txid: String, output_index: u32 },
}

impl CloseTarget {
    /// Choose the close path from the shape of the channel data.
    ///
    /// A channel id always wins.  Otherwise the channel point must parse.
    pub fn for_channel(channel: &Channel) -> Result<CloseTarget, Error> {
        if let Some(id) = channel.channel_id {
            return Ok(CloseTarget::ById(id));
        }
        let (funding_txid, output_index) = parse_channel_point(&channel.channel_point)?;
        Ok(CloseTarget::ByOutpoint { funding_txid, output_index })
    }
}

impl fmt::Display for CloseTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CloseTarget::ById(id) => write!(f, "id {}", id),
            CloseTarget::ByOutpoint { funding_txid, output_index } => {
                write!(f, "outpoint {}:{}", funding_txid, output_index)
            }
        }
    }
}

/// Split a `txid:vout` channel point into its funding txid and output index
pub fn parse_channel_point(channel_point: &str) -> Result<(String, u32), Error> {
    let invalid = |why: &str| {
        Error::InvalidChannelReference(format!("{} in channel point {:?}", why, channel_point))
    };
    let (txid, index) = channel_point.split_once(':').ok_or_else(|| invalid("missing separator"))?;
    if txid.is_empty() {
        return Err(invalid("empty funding txid"));
    }
    // u32::from_str would also take a leading '+'
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("non-numeric output index"));
    }
    let output_index = index.parse::<u32>().map_err(|_| invalid("output index out of range"))?;
    Ok((txid.to_string(), output_index))
}

/// Where the presentation layer should go after a successful close
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NavigationHint {
    ReturnToWallet,
}

/// Fee policy as reported by the node
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFeePolicy {
    pub base_fee_msat: u64,
    /// Proportional fee as a ratio, e.g. 0.000001 for 1 ppm
    pub fee_rate: f64,
}

/// Submission state of a channel's fee policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeeStatus {
    Idle,
    Pending,
    Succeeded,
    Failed,
}

/// The fee schedule this node applies to one channel
#[derive(Clone, Debug, PartialEq)]
pub struct FeePolicy {
    pub base_fee_msat: u64,
    /// Stored as a ratio, see [`FeePolicy::fee_rate_ppm`] for display
    pub fee_rate: f64,
    pub status: FeeStatus,
    /// Only set while `status` is `Failed`
    pub last_error: Option<String>,
}

impl Default for FeePolicy {
    fn default() -> Self {
        FeePolicy { base_fee_msat: 0, fee_rate: 0.0, status: FeeStatus::Idle, last_error: None }
    }
}

impl FeePolicy {
    /// Fee rate in parts per million, rounded to 3 decimals to hide float noise
    pub fn fee_rate_ppm(&self) -> f64 {
        (self.fee_rate * 1_000_000_000.0).round() / 1000.0
    }

    pub fn is_pending(&self) -> bool {
        self.status == FeeStatus::Pending
    }
}
