#![crate_name = "chanctl"]
#![forbid(unsafe_code)]

//! Channel state and fee policy management for a Lightning node client.
//!
//! [`ChannelRegistry`] holds a node-derived snapshot of channels and peer
//! aliases and executes close requests.  [`FeePolicyManager`] tracks per-channel
//! fee policies and their in-flight updates.  [`UnitConverter`] renders amounts
//! in the selected denomination.  All node access goes through [`NodeClient`].

pub mod close;
pub mod error;
pub mod fees;
pub mod model;
pub mod node;
pub mod registry;
pub mod sync;
pub mod units;
pub mod util;
pub mod view;

pub use self::close::{CloseIntent, CloseState};
pub use self::error::Error;
pub use self::fees::{FeeEvent, FeeOutcome, FeePolicyManager, FeeUpdate};
pub use self::model::{
    BalanceObservation, Channel, CloseTarget, FeePolicy, FeeStatus, NavigationHint, NodeFeePolicy,
};
pub use self::node::{NodeClient, NodeError};
pub use self::registry::{ChannelRegistry, RegistryEvent, Snapshot};
pub use self::sync::Syncer;
pub use self::units::{DisplayUnit, FiatRate, UnitConverter};
