use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::*;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::model::{BalanceObservation, Channel, CloseTarget, NavigationHint};
use crate::node::{NodeClient, NodeError};

/// An immutable view of the node's channels and peer aliases.
///
/// The registry swaps the whole snapshot on each sync, so a reader holding
/// one never sees a half-updated set.
#[derive(Debug, Default)]
pub struct Snapshot {
    generation: u64,
    channels: Vec<Channel>,
    aliases: HashMap<String, String>,
    observations: Vec<BalanceObservation>,
}

impl Snapshot {
    /// Bumped on every install.  The empty initial snapshot is generation 0.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Channels in the order the node listed them
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn get(&self, channel_point: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.channel_point == channel_point)
    }

    pub fn peer_alias(&self, pubkey: &str) -> Option<&str> {
        self.aliases.get(pubkey).map(String::as_str).filter(|a| !a.is_empty())
    }

    /// Channels whose balances exceeded their capacity at sync time
    pub fn observations(&self) -> &[BalanceObservation] {
        &self.observations
    }
}

/// State changes, for consumers that do not want to poll
#[derive(Clone, Debug, PartialEq)]
pub enum RegistryEvent {
    Refreshed { generation: u64 },
    RefreshFailed(String),
    CloseDispatched(String),
    Closed(String),
    CloseFailed { channel_point: String, message: String },
}

// Mutations in flight and their effect on sync
#[derive(Default)]
struct Tracker {
    // channel points with a close request outstanding
    closing: HashSet<String>,
    // closed locally, excluded from syncs until the node stops listing them
    removed: HashSet<String>,
    // sequence number of the last refresh that was installed
    applied_seq: u64,
    // sequence number of the alias table in the snapshot
    aliases_seq: u64,
}

const EVENT_CAPACITY: usize = 64;
const PUBKEY_DISPLAY_PREFIX: usize = 10;
const PUBKEY_DISPLAY_SUFFIX: usize = 6;

/// Holds the current channel snapshot and executes close requests
#[derive(Clone)]
pub struct ChannelRegistry {
    node: Arc<dyn NodeClient>,
    snapshot: Arc<RwLock<Arc<Snapshot>>>,
    tracker: Arc<Mutex<Tracker>>,
    refresh_seq: Arc<AtomicU64>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ChannelRegistry {
    /// Create an empty registry.  Call [`ChannelRegistry::refresh`] to populate it.
    pub fn new(node: Arc<dyn NodeClient>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        ChannelRegistry {
            node,
            snapshot: Arc::new(RwLock::new(Arc::new(Snapshot::default()))),
            tracker: Arc::new(Mutex::new(Tracker::default())),
            refresh_seq: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// The current snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().unwrap())
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.snapshot().channels().to_vec()
    }

    pub fn get_channel(&self, channel_point: &str) -> Result<Channel, Error> {
        self.snapshot()
            .get(channel_point)
            .cloned()
            .ok_or_else(|| Error::ChannelNotFound(channel_point.to_string()))
    }

    /// Whether a close request for this channel is outstanding
    pub fn is_closing(&self, channel_point: &str) -> bool {
        self.tracker.lock().unwrap().closing.contains(channel_point)
    }

    /// Fetch the channel list and the alias table and install them as the new
    /// snapshot.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, Error> {
        let seq = self.refresh_seq.fetch_add(1, Ordering::AcqRel) + 1;
        info!("ENTER refresh {}", seq);
        let fetched = tokio::try_join!(self.node.list_channels(), self.node.list_peer_aliases());
        let (channels, aliases) = match fetched {
            Ok(r) => r,
            Err(e) => return Err(self.refresh_failed(e)),
        };
        debug!("refresh {}: {} channels, {} aliases", seq, channels.len(), aliases.len());

        let mut tracker = self.tracker.lock().unwrap();
        if seq < tracker.applied_seq {
            // a later refresh already landed
            debug!("refresh {} is stale, keeping refresh {}", seq, tracker.applied_seq);
            return Ok(self.snapshot());
        }
        tracker.applied_seq = seq;
        let aliases = if seq >= tracker.aliases_seq {
            tracker.aliases_seq = seq;
            Some(aliases)
        } else {
            debug!("refresh {}: alias table from refresh {} is newer", seq, tracker.aliases_seq);
            None
        };
        // the node no longer lists these, so their local removal is confirmed
        tracker.removed.retain(|cp| channels.iter().any(|c| &c.channel_point == cp));
        let channels: Vec<Channel> =
            channels.into_iter().filter(|c| !tracker.removed.contains(&c.channel_point)).collect();
        let observations: Vec<BalanceObservation> =
            channels.iter().filter_map(Channel::balance_observation).collect();
        for observation in &observations {
            warn!("data quality: {}", observation);
        }
        let snapshot = self.install(|prev| Snapshot {
            generation: prev.generation + 1,
            channels,
            aliases: aliases.unwrap_or_else(|| prev.aliases.clone()),
            observations,
        });
        drop(tracker);

        info!("REPLY refresh {} generation {}", seq, snapshot.generation);
        self.emit(RegistryEvent::Refreshed { generation: snapshot.generation });
        Ok(snapshot)
    }

    /// Refresh only the peer alias table
    pub async fn refresh_aliases(&self) -> Result<Arc<Snapshot>, Error> {
        let seq = self.refresh_seq.fetch_add(1, Ordering::AcqRel) + 1;
        info!("ENTER refresh_aliases {}", seq);
        let aliases = match self.node.list_peer_aliases().await {
            Ok(aliases) => aliases,
            Err(e) => return Err(self.refresh_failed(e)),
        };
        let mut tracker = self.tracker.lock().unwrap();
        if seq < tracker.aliases_seq {
            debug!("refresh_aliases {} is stale, keeping refresh {}", seq, tracker.aliases_seq);
            return Ok(self.snapshot());
        }
        tracker.aliases_seq = seq;
        let snapshot = self.install(|prev| Snapshot {
            generation: prev.generation + 1,
            channels: prev.channels.clone(),
            aliases,
            observations: prev.observations.clone(),
        });
        drop(tracker);
        info!("REPLY refresh_aliases {} generation {}", seq, snapshot.generation);
        self.emit(RegistryEvent::Refreshed { generation: snapshot.generation });
        Ok(snapshot)
    }

    /// The label to show for a channel's peer.  Never empty.
    ///
    /// Prefers the peer alias table, then the alias reported with the channel,
    /// then a shortened pubkey.
    pub fn resolve_alias(&self, channel: &Channel) -> String {
        if let Some(alias) = self.snapshot().peer_alias(&channel.remote_pubkey) {
            return alias.to_string();
        }
        if let Some(alias) = channel.alias.as_ref().filter(|a| !a.is_empty()) {
            return alias.clone();
        }
        if !channel.remote_pubkey.is_empty() {
            return shorten_pubkey(&channel.remote_pubkey);
        }
        if !channel.channel_point.is_empty() {
            return channel.channel_point.clone();
        }
        "unknown peer".to_string()
    }

    /// Ask the node to close a channel.
    ///
    /// Confirmed channels are closed by id, pending ones by funding outpoint.
    /// On success the channel is dropped from the snapshot right away and the
    /// caller gets a navigation hint.  There is no retry on failure.
    ///
    /// The request runs on its own task, so dropping the returned future does
    /// not abandon the bookkeeping for a close the node may still execute.
    pub async fn close_channel(&self, channel: &Channel) -> Result<NavigationHint, Error> {
        let target = CloseTarget::for_channel(channel)?;
        let channel_point = channel.channel_point.clone();
        if !self.tracker.lock().unwrap().closing.insert(channel_point.clone()) {
            return Err(Error::SubmissionInProgress(channel_point));
        }
        info!("ENTER close_channel {} by {}", channel_point, target);
        self.emit(RegistryEvent::CloseDispatched(channel_point.clone()));

        let registry = self.clone();
        let cp = channel_point.clone();
        let task = tokio::spawn(async move {
            let result = match &target {
                CloseTarget::ById(id) => registry.node.close_channel_by_id(*id).await,
                CloseTarget::ByOutpoint { funding_txid, output_index } => {
                    registry.node.close_channel_by_outpoint(funding_txid, *output_index).await
                }
            };
            registry.close_resolved(&cp, result)
        });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                // the task panicked or the runtime is going away
                error!("close_channel {} task failed: {}", channel_point, e);
                self.tracker.lock().unwrap().closing.remove(&channel_point);
                Err(Error::CloseFailed(e.to_string()))
            }
        }
    }

    fn close_resolved(
        &self,
        channel_point: &str,
        result: Result<(), NodeError>,
    ) -> Result<NavigationHint, Error> {
        let mut tracker = self.tracker.lock().unwrap();
        tracker.closing.remove(channel_point);
        match result {
            Ok(()) => {
                tracker.removed.insert(channel_point.to_string());
                self.install(|prev| Snapshot {
                    generation: prev.generation + 1,
                    channels: prev
                        .channels
                        .iter()
                        .filter(|c| c.channel_point != channel_point)
                        .cloned()
                        .collect(),
                    aliases: prev.aliases.clone(),
                    observations: prev
                        .observations
                        .iter()
                        .filter(|o| o.channel_point != channel_point)
                        .cloned()
                        .collect(),
                });
                drop(tracker);
                info!("REPLY close_channel {}", channel_point);
                self.emit(RegistryEvent::Closed(channel_point.to_string()));
                Ok(NavigationHint::ReturnToWallet)
            }
            Err(e) => {
                drop(tracker);
                error!("close_channel {} failed: {}", channel_point, e);
                self.emit(RegistryEvent::CloseFailed {
                    channel_point: channel_point.to_string(),
                    message: e.message().to_string(),
                });
                Err(Error::CloseFailed(e.message().to_string()))
            }
        }
    }

    // Callers hold the tracker lock, so installs are ordered with the
    // bookkeeping they depend on.
    fn install(&self, make: impl FnOnce(&Snapshot) -> Snapshot) -> Arc<Snapshot> {
        let mut current = self.snapshot.write().unwrap();
        let next = Arc::new(make(&current));
        *current = Arc::clone(&next);
        next
    }

    fn refresh_failed(&self, e: NodeError) -> Error {
        warn!("refresh failed, keeping generation {}: {}", self.snapshot().generation, e);
        self.emit(RegistryEvent::RefreshFailed(e.to_string()));
        Error::Sync(e)
    }

    fn emit(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn shorten_pubkey(pubkey: &str) -> String {
    let len = pubkey.chars().count();
    if len <= PUBKEY_DISPLAY_PREFIX + PUBKEY_DISPLAY_SUFFIX + 4 {
        return pubkey.to_string();
    }
    let prefix: String = pubkey.chars().take(PUBKEY_DISPLAY_PREFIX).collect();
    let suffix: String = pubkey.chars().skip(len - PUBKEY_DISPLAY_SUFFIX).collect();
    format!("{}...{}", prefix, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::mocks::{make_test_channel, MockNode, NodeCall};
    use test_log::test;

    fn setup(channels: Vec<Channel>) -> (Arc<MockNode>, ChannelRegistry) {
        let node = Arc::new(MockNode::new(channels));
        let registry = ChannelRegistry::new(node.clone());
        (node, registry)
    }

    #[test]
    fn shorten_pubkey_test() {
        assert_eq!(shorten_pubkey("02abcdef"), "02abcdef");
        let pubkey = format!("03{}", "0123456789".repeat(6));
        assert_eq!(shorten_pubkey(&pubkey), "0301234567...456789");
    }

    #[test(tokio::test)]
    async fn resolve_alias_test() {
        let mut channel = make_test_channel("aa:0", Some(1));
        let (node, registry) = setup(vec![channel.clone()]);
        registry.refresh().await.unwrap();
        assert_eq!(registry.resolve_alias(&channel), "02abababab...ababab");

        channel.alias = Some(String::new());
        assert_eq!(registry.resolve_alias(&channel), "02abababab...ababab");
        channel.alias = Some("carol".to_string());
        assert_eq!(registry.resolve_alias(&channel), "carol");

        node.add_alias(&channel.remote_pubkey, "bob");
        registry.refresh_aliases().await.unwrap();
        assert_eq!(registry.resolve_alias(&channel), "bob");

        let bare = Channel { channel_point: "cc:1".to_string(), ..Default::default() };
        assert_eq!(registry.resolve_alias(&bare), "cc:1");
        assert_eq!(registry.resolve_alias(&Channel::default()), "unknown peer");
    }

    #[test(tokio::test)]
    async fn older_refresh_landing_late_is_discarded_test() {
        let (node, registry) = setup(vec![make_test_channel("aa:0", Some(1))]);
        let gate = node.hold_list();
        let slow = registry.clone();
        let first = tokio::spawn(async move { slow.refresh().await });
        gate.entered().await;

        node.set_channels(vec![
            make_test_channel("aa:0", Some(1)),
            make_test_channel("bb:1", None),
        ]);
        let second = registry.refresh().await.unwrap();
        assert_eq!(second.channels().len(), 2);

        gate.release();
        let stale = first.await.unwrap().unwrap();
        assert_eq!(stale.generation(), second.generation());
        assert_eq!(registry.channels().len(), 2);
        assert!(registry.get_channel("bb:1").is_ok());
    }

    #[test(tokio::test)]
    async fn older_alias_table_landing_late_is_discarded_test() {
        let channel = make_test_channel("aa:0", Some(1));
        let (node, registry) = setup(vec![channel.clone()]);
        node.add_alias(&channel.remote_pubkey, "old");
        let gate = node.hold_aliases();
        let slow = registry.clone();
        let aliases = tokio::spawn(async move { slow.refresh_aliases().await });
        gate.entered().await;

        node.add_alias(&channel.remote_pubkey, "new");
        registry.refresh().await.unwrap();
        assert_eq!(registry.resolve_alias(&channel), "new");

        gate.release();
        aliases.await.unwrap().unwrap();
        assert_eq!(registry.resolve_alias(&channel), "new");

        // a later alias-only refresh still applies
        node.add_alias(&channel.remote_pubkey, "newer");
        registry.refresh_aliases().await.unwrap();
        assert_eq!(registry.resolve_alias(&channel), "newer");
    }

    #[test(tokio::test)]
    async fn refresh_failure_keeps_snapshot_test() {
        let (node, registry) = setup(vec![make_test_channel("aa:0", Some(1))]);
        let mut events = registry.subscribe();
        let first = registry.refresh().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), RegistryEvent::Refreshed { generation: 1 });

        node.fail_list(Some(NodeError::Transport("connection refused".to_string())));
        match registry.refresh().await {
            Err(Error::Sync(NodeError::Transport(_))) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::RefreshFailed(_)));
        assert_eq!(registry.snapshot().generation(), first.generation());
        assert_eq!(registry.channels().len(), 1);
    }

    #[test(tokio::test)]
    async fn observation_test() {
        let mut bad = make_test_channel("bb:0", Some(2));
        bad.unsettled_balance = 500_000;
        let (_node, registry) = setup(vec![make_test_channel("aa:0", Some(1)), bad]);
        let snapshot = registry.refresh().await.unwrap();
        // surfaced, not dropped
        assert_eq!(snapshot.channels().len(), 2);
        assert_eq!(snapshot.observations().len(), 1);
        assert_eq!(snapshot.observations()[0].channel_point, "bb:0");
    }

    #[test(tokio::test)]
    async fn close_failure_keeps_channel_test() {
        let channel = make_test_channel("aa:0", Some(7));
        let (node, registry) = setup(vec![channel.clone()]);
        registry.refresh().await.unwrap();
        node.fail_close(Some(NodeError::Rejected("peer offline".to_string())));

        assert_eq!(
            registry.close_channel(&channel).await,
            Err(Error::CloseFailed("peer offline".to_string()))
        );
        assert!(registry.get_channel("aa:0").is_ok());
        assert!(!registry.is_closing("aa:0"));

        // no automatic retry
        let closes = node.calls().into_iter().filter(|c| *c == NodeCall::CloseById(7)).count();
        assert_eq!(closes, 1);
    }
}
