//! Logical peer-to-peer messages of the mining workflow and the client seam
//! the transport implements. Framing and authentication belong to the
//! transport; the workflow only deals in these shapes.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{Address, PublicKey};
use crate::errors::ChainResult;
use crate::types::{
    BitString, CrossValidationStamp, Peer, ReplicationAttestation, Transaction, UnspentOutput,
    ValidationStamp,
};

/// Per-validator replica masks, one bitstring per validation node, split by
/// replica role.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTree {
    pub chain: Vec<BitString>,
    pub beacon: Vec<BitString>,
    pub io: Vec<BitString>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "message")]
pub enum MiningMessage {
    /// Cross-validator context hand-off to the coordinator.
    AddMiningContext {
        tx_address: Address,
        validator_public_key: PublicKey,
        previous_storage_node_keys: Vec<PublicKey>,
        chain_storage_nodes_view: BitString,
        beacon_storage_nodes_view: BitString,
    },
    /// Coordinator's stamp distribution to the confirmed cross-validators.
    CrossValidate {
        tx_address: Address,
        validation_stamp: ValidationStamp,
        replication_tree: ReplicationTree,
        confirmed_validation_nodes: BitString,
    },
    /// A cross-validator's stamp, sent to the coordinator and its peers.
    CrossValidationDone {
        tx_address: Address,
        cross_validation_stamp: CrossValidationStamp,
    },
    /// Validated transaction shipped to a chain replica.
    ReplicateTransactionChain {
        transaction: Box<Transaction>,
        ack_storage: bool,
    },
    /// Validated transaction shipped to an I/O replica, no ack expected.
    ReplicateTransaction { transaction: Box<Transaction> },
    /// Replica's signed storage confirmation.
    AcknowledgeStorage { signature: Vec<u8> },
    /// Replica-side failure report.
    Error { reason: String },
    /// Storage-quorum proof fanned out to welcome and beacon nodes.
    ReplicationAttestation(Box<ReplicationAttestation>),
    /// Context-fetch requests and replies.
    GetTransaction { address: Address },
    TransactionResponse { transaction: Option<Box<Transaction>> },
    GetUnspentOutputs { address: Address },
    UnspentOutputsResponse { unspent_outputs: Vec<UnspentOutput> },
    /// Batched availability probe: the queried peer reports which of the
    /// listed keys it currently sees available, one bit per key.
    GetNodeAvailability { keys: Vec<PublicKey> },
    NodeAvailabilityResponse { view: BitString },
    /// Generic acknowledgement for one-way messages.
    Done,
}

/// Transport seam. `send` is request/response against a single peer;
/// `broadcast` is best-effort fan-out where individual failures are logged
/// and dropped.
#[async_trait]
pub trait P2pClient: Send + Sync {
    async fn send(&self, peer: &Peer, message: MiningMessage) -> ChainResult<MiningMessage>;

    async fn broadcast(&self, peers: &[Peer], message: MiningMessage) {
        for peer in peers {
            if let Err(err) = self.send(peer, message.clone()).await {
                debug!(peer = %peer.last_public_key, ?err, "broadcast delivery failed");
            }
        }
    }
}

/// Known peers of the node, shared across the mining workflows.
#[derive(Clone, Default)]
pub struct NodeRoster {
    inner: Arc<RwLock<Vec<Peer>>>,
}

impl NodeRoster {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(peers)),
        }
    }

    pub fn set(&self, peers: Vec<Peer>) {
        *self.inner.write() = peers;
    }

    pub fn all(&self) -> Vec<Peer> {
        self.inner.read().clone()
    }

    pub fn authorized_nodes(&self) -> Vec<Peer> {
        self.inner
            .read()
            .iter()
            .filter(|peer| peer.authorized)
            .cloned()
            .collect()
    }

    pub fn available_nodes(&self) -> Vec<Peer> {
        self.inner
            .read()
            .iter()
            .filter(|peer| peer.available)
            .cloned()
            .collect()
    }

    pub fn by_last_key(&self, key: &PublicKey) -> Option<Peer> {
        self.inner
            .read()
            .iter()
            .find(|peer| peer.last_public_key == *key)
            .cloned()
    }

    /// Deduplicates a peer list by first public key, keeping first sightings.
    pub fn distinct_nodes(peers: Vec<Peer>) -> Vec<Peer> {
        let mut seen = std::collections::HashSet::new();
        peers
            .into_iter()
            .filter(|peer| seen.insert(peer.first_public_key.clone()))
            .collect()
    }
}
