use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::*;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::model::{FeePolicy, FeeStatus};
use crate::node::{NodeClient, NodeError};

/// Fee submission state changes
#[derive(Clone, Debug, PartialEq)]
pub enum FeeEvent {
    Pending(String),
    Succeeded(String),
    Failed { channel_point: String, message: String },
}

/// How a fee submission ended, handed out once by [`FeePolicyManager::acknowledge`]
#[derive(Clone, Debug, PartialEq)]
pub enum FeeOutcome {
    Succeeded,
    Failed(String),
}

/// A validated fee schedule, ready to submit
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeeUpdate {
    pub base_fee_msat: u64,
    pub fee_rate: f64,
}

impl FeeUpdate {
    pub fn new(base_fee_msat: i64, fee_rate: f64) -> Result<Self, Error> {
        if base_fee_msat < 0 {
            return Err(Error::InvalidFeeValue(format!(
                "base fee must not be negative, got {}",
                base_fee_msat
            )));
        }
        if !fee_rate.is_finite() || fee_rate < 0.0 {
            return Err(Error::InvalidFeeValue(format!(
                "fee rate must be a non-negative number, got {}",
                fee_rate
            )));
        }
        if fee_rate > 1.0 {
            warn!("fee rate {} is above 1, the proportional fee exceeds the amount", fee_rate);
        }
        Ok(FeeUpdate { base_fee_msat: base_fee_msat as u64, fee_rate })
    }

    /// Validate form input, where either field may be left blank
    pub fn parse(base_fee_msat: &str, fee_rate: &str) -> Result<Self, Error> {
        let base_fee_msat = base_fee_msat.trim();
        let fee_rate = fee_rate.trim();
        if base_fee_msat.is_empty() {
            return Err(Error::InvalidFeeValue("base fee is missing".to_string()));
        }
        if fee_rate.is_empty() {
            return Err(Error::InvalidFeeValue("fee rate is missing".to_string()));
        }
        let base = base_fee_msat.parse::<i64>().map_err(|_| {
            Error::InvalidFeeValue(format!("base fee {:?} is not a whole number", base_fee_msat))
        })?;
        let rate = fee_rate.parse::<f64>().map_err(|_| {
            Error::InvalidFeeValue(format!("fee rate {:?} is not a number", fee_rate))
        })?;
        FeeUpdate::new(base, rate)
    }
}

const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct Cache {
    policies: HashMap<String, FeePolicy>,
    // bumped when a submission starts or resolves; a fetch spanning a bump is stale
    versions: HashMap<String, u64>,
    next_version: u64,
}

impl Cache {
    fn version(&self, channel_point: &str) -> u64 {
        self.versions.get(channel_point).copied().unwrap_or(0)
    }

    fn bump(&mut self, channel_point: &str) {
        self.next_version += 1;
        self.versions.insert(channel_point.to_string(), self.next_version);
    }

    fn entry(&mut self, channel_point: &str) -> &mut FeePolicy {
        self.policies.entry(channel_point.to_string()).or_default()
    }
}

/// Caches per-channel fee policies and serializes updates to them.
///
/// At most one update per channel point is in flight.  A second submission
/// while one is pending is rejected, not queued.
#[derive(Clone)]
pub struct FeePolicyManager {
    node: Arc<dyn NodeClient>,
    cache: Arc<Mutex<Cache>>,
    events: broadcast::Sender<FeeEvent>,
}

impl FeePolicyManager {
    pub fn new(node: Arc<dyn NodeClient>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        FeePolicyManager { node, cache: Arc::new(Mutex::new(Cache::default())), events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeeEvent> {
        self.events.subscribe()
    }

    /// The cached policy.  A channel nobody has set or fetched yet has the
    /// zero policy.
    pub fn get_policy(&self, channel_point: &str) -> FeePolicy {
        self.cache.lock().unwrap().entry(channel_point).clone()
    }

    /// Channel points with a cached policy
    pub fn cached_channel_points(&self) -> Vec<String> {
        self.cache.lock().unwrap().policies.keys().cloned().collect()
    }

    /// Load the node's current policy for one channel into the cache.
    ///
    /// Values are left alone while a submission is pending for the channel,
    /// and when a submission started or finished while the fetch was out.
    pub async fn fetch_policy(&self, channel_point: &str) -> Result<FeePolicy, Error> {
        let version = self.cache.lock().unwrap().version(channel_point);
        debug!("fetch_policy {} at version {}", channel_point, version);
        let fetched = self.node.get_fee_policy(channel_point).await.map_err(|e| {
            warn!("fetch_policy {} failed: {}", channel_point, e);
            Error::Sync(e)
        })?;
        let mut cache = self.cache.lock().unwrap();
        let current = cache.version(channel_point);
        let policy = cache.entry(channel_point);
        if policy.is_pending() {
            debug!("fetch_policy {}: submission pending, keeping cached values", channel_point);
        } else if current != version {
            debug!("fetch_policy {}: stale answer, keeping cached values", channel_point);
        } else {
            let fetched = fetched.unwrap_or_default();
            policy.base_fee_msat = fetched.base_fee_msat;
            policy.fee_rate = fetched.fee_rate;
        }
        Ok(policy.clone())
    }

    /// Fetch the policies of several channels.  Keeps going after a failure and
    /// returns the first one.
    pub async fn fetch_all(&self, channel_points: &[String]) -> Result<(), Error> {
        let mut first_error = None;
        for channel_point in channel_points {
            if let Err(e) = self.fetch_policy(channel_point).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Validate and submit a new fee schedule for a channel.
    ///
    /// Returns the accepted policy.  On a node failure the previous values stay
    /// and the error is kept on the policy until acknowledged.
    pub async fn set_fees(
        &self,
        channel_point: &str,
        base_fee_msat: i64,
        fee_rate: f64,
    ) -> Result<FeePolicy, Error> {
        let update = FeeUpdate::new(base_fee_msat, fee_rate)?;
        self.submit(channel_point, update).await
    }

    /// Submit an already validated update
    pub async fn submit(&self, channel_point: &str, update: FeeUpdate) -> Result<FeePolicy, Error> {
        {
            let mut cache = self.cache.lock().unwrap();
            let policy = cache.entry(channel_point);
            if policy.is_pending() {
                return Err(Error::SubmissionInProgress(channel_point.to_string()));
            }
            // a new edit discards an unacknowledged outcome
            policy.status = FeeStatus::Pending;
            policy.last_error = None;
            cache.bump(channel_point);
        }
        info!(
            "ENTER set_fees {} base {} msat rate {}",
            channel_point, update.base_fee_msat, update.fee_rate
        );
        self.emit(FeeEvent::Pending(channel_point.to_string()));

        let manager = self.clone();
        let cp = channel_point.to_string();
        let task = tokio::spawn(async move {
            let result =
                manager.node.set_fee_policy(&cp, update.base_fee_msat, update.fee_rate).await;
            manager.resolve(&cp, update, result)
        });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("set_fees {} task failed: {}", channel_point, e);
                self.resolve(channel_point, update, Err(NodeError::Transport(e.to_string())))
            }
        }
    }

    fn resolve(
        &self,
        channel_point: &str,
        update: FeeUpdate,
        result: Result<(), NodeError>,
    ) -> Result<FeePolicy, Error> {
        let mut cache = self.cache.lock().unwrap();
        cache.bump(channel_point);
        let policy = cache.entry(channel_point);
        match result {
            Ok(()) => {
                policy.base_fee_msat = update.base_fee_msat;
                policy.fee_rate = update.fee_rate;
                policy.status = FeeStatus::Succeeded;
                policy.last_error = None;
                let accepted = policy.clone();
                drop(cache);
                info!("REPLY set_fees {}", channel_point);
                self.emit(FeeEvent::Succeeded(channel_point.to_string()));
                Ok(accepted)
            }
            Err(e) => {
                let message = e.message().to_string();
                policy.status = FeeStatus::Failed;
                policy.last_error = Some(message.clone());
                drop(cache);
                error!("set_fees {} failed: {}", channel_point, e);
                self.emit(FeeEvent::Failed {
                    channel_point: channel_point.to_string(),
                    message: message.clone(),
                });
                Err(Error::FeeSubmissionFailed(message))
            }
        }
    }

    /// Take the outcome of the last submission and return the policy to Idle.
    ///
    /// Returns `None` if there is nothing to acknowledge, so each outcome is
    /// handed out once.
    pub fn acknowledge(&self, channel_point: &str) -> Option<FeeOutcome> {
        let mut cache = self.cache.lock().unwrap();
        let policy = cache.policies.get_mut(channel_point)?;
        let outcome = match policy.status {
            FeeStatus::Succeeded => FeeOutcome::Succeeded,
            FeeStatus::Failed => FeeOutcome::Failed(policy.last_error.take().unwrap_or_default()),
            FeeStatus::Idle | FeeStatus::Pending => return None,
        };
        policy.status = FeeStatus::Idle;
        Some(outcome)
    }

    /// Drop the cached policy of a channel that went away
    pub fn forget(&self, channel_point: &str) -> Result<(), Error> {
        let mut cache = self.cache.lock().unwrap();
        if cache.policies.get(channel_point).map_or(false, FeePolicy::is_pending) {
            return Err(Error::SubmissionInProgress(channel_point.to_string()));
        }
        cache.policies.remove(channel_point);
        cache.versions.remove(channel_point);
        Ok(())
    }

    fn emit(&self, event: FeeEvent) {
        let _ = self.events.send(event);
    }
}
