use std::time::Duration;

use log::*;
use tokio::task::JoinHandle;
use tokio::{task, time};
use triggered::Listener;

use crate::fees::FeePolicyManager;
use crate::registry::ChannelRegistry;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically refreshes the channel registry and the fee policies of the
/// listed channels.
///
/// A failed round is logged and the stale snapshot stays in place until the
/// next one.
#[derive(Clone)]
pub struct Syncer {
    registry: ChannelRegistry,
    fees: FeePolicyManager,
    interval: Duration,
}

impl Syncer {
    /// A zero `interval` is raised to one millisecond
    pub fn new(registry: ChannelRegistry, fees: FeePolicyManager, interval: Duration) -> Self {
        Syncer { registry, fees, interval: interval.max(MIN_INTERVAL) }
    }

    /// Start a task that syncs until `shutdown_signal` fires
    pub fn start(&self, shutdown_signal: Listener) -> JoinHandle<()> {
        let s = self.clone();
        let handle = task::spawn(async move {
            s.run(shutdown_signal).await;
        });
        info!("syncer started, interval {:?}", self.interval);
        handle
    }

    async fn run(&self, shutdown_signal: Listener) {
        let mut interval = time::interval(self.interval);
        loop {
            let shutdown_signal_clone = shutdown_signal.clone();
            tokio::select! {
                _ = interval.tick() => {
                    self.sync_once().await;
                }
                _ = shutdown_signal_clone => break,
            }
        }
        info!("syncer stopped");
    }

    /// One sync round.  Returns whether the channel refresh succeeded.
    ///
    /// Cached fee policies of channels the node no longer lists are dropped,
    /// unless a submission for them is still pending.
    pub async fn sync_once(&self) -> bool {
        let snapshot = match self.registry.refresh().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("sync failed: {}", e);
                return false;
            }
        };
        let channel_points: Vec<String> =
            snapshot.channels().iter().map(|c| c.channel_point.clone()).collect();
        for gone in self.fees.cached_channel_points() {
            if channel_points.contains(&gone) {
                continue;
            }
            if let Err(e) = self.fees.forget(&gone) {
                debug!("keeping fee policy of {}: {}", gone, e);
            }
        }
        if let Err(e) = self.fees.fetch_all(&channel_points).await {
            warn!("fee policy sync incomplete: {}", e);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::node::NodeError;
    use crate::registry::RegistryEvent;
    use crate::util::mocks::{make_test_channel, MockNode};

    #[tokio::test]
    async fn sync_once_test() {
        let node = Arc::new(MockNode::new(vec![make_test_channel("aa:0", Some(1))]));
        node.set_policy("aa:0", 1000, 0.0005);
        let registry = ChannelRegistry::new(node.clone());
        let fees = FeePolicyManager::new(node.clone());
        let syncer = Syncer::new(registry.clone(), fees.clone(), Duration::from_secs(60));

        assert!(syncer.sync_once().await);
        assert_eq!(registry.channels().len(), 1);
        assert_eq!(fees.get_policy("aa:0").base_fee_msat, 1000);

        node.fail_list(Some(NodeError::Transport("down".to_string())));
        assert!(!syncer.sync_once().await);
        assert_eq!(registry.channels().len(), 1);
    }

    #[tokio::test]
    async fn sync_once_drops_policies_of_gone_channels_test() {
        let node = Arc::new(MockNode::new(vec![
            make_test_channel("aa:0", Some(1)),
            make_test_channel("bb:1", Some(2)),
        ]));
        let registry = ChannelRegistry::new(node.clone());
        let fees = FeePolicyManager::new(node.clone());
        let syncer = Syncer::new(registry, fees.clone(), Duration::from_secs(60));

        assert!(syncer.sync_once().await);
        // asked about, never listed
        fees.get_policy("zz:9");
        let mut cached = fees.cached_channel_points();
        cached.sort();
        assert_eq!(cached, vec!["aa:0", "bb:1", "zz:9"]);

        node.set_channels(vec![make_test_channel("aa:0", Some(1))]);
        assert!(syncer.sync_once().await);
        assert_eq!(fees.cached_channel_points(), vec!["aa:0"]);
    }

    #[tokio::test]
    async fn start_and_stop_test() {
        let node = Arc::new(MockNode::new(vec![make_test_channel("aa:0", Some(1))]));
        let registry = ChannelRegistry::new(node.clone());
        let fees = FeePolicyManager::new(node);
        let mut events = registry.subscribe();
        let syncer = Syncer::new(registry, fees, Duration::from_millis(10));

        let (trigger, listener) = triggered::trigger();
        let handle = syncer.start(listener);
        // the first tick fires right away
        assert_eq!(events.recv().await.unwrap(), RegistryEvent::Refreshed { generation: 1 });
        trigger.trigger();
        handle.await.unwrap();
    }
}
