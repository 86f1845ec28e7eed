//! Distributed mining workflow: the per-transaction worker state machine
//! and its collaborators.

pub mod context;
pub mod fetcher;
pub mod registry;
pub mod replication;
pub mod stamp;
pub mod validation;
pub mod worker;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::MiningConfig;
use crate::crypto::{NodeKeys, PublicKey};
use crate::election::Election;
use crate::p2p::{NodeRoster, P2pClient};

pub use context::ValidationContext;
pub use fetcher::{FetchedContext, TransactionContextFetcher};
pub use registry::WorkflowRegistry;
pub use replication::persist_and_acknowledge;
pub use validation::{
    ChainPendingValidator, LogMaliciousReporter, MaliciousReporter, PendingValidator,
};
pub use worker::{MiningOutcome, MiningWorker, WorkerHandle};

/// Beacon slots partition time into fixed windows.
pub const BEACON_SLOT_SECS: u64 = 600;

/// Shared collaborators of every mining worker on this node.
pub struct MiningEnv {
    pub keys: Arc<NodeKeys>,
    pub p2p: Arc<dyn P2pClient>,
    pub election: Arc<dyn Election>,
    pub roster: NodeRoster,
    pub registry: WorkflowRegistry,
    pub pending: Arc<dyn PendingValidator>,
    pub malicious: Arc<dyn MaliciousReporter>,
    /// Keys allowed to originate transactions, searched by the proof of
    /// work.
    pub origin_keys: Vec<PublicKey>,
    pub config: MiningConfig,
}

pub(crate) fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn beacon_slot(now_secs: u64) -> u64 {
    now_secs - now_secs % BEACON_SLOT_SECS
}
