//! Pure accumulator of one mining workflow's state. Transitions consume the
//! context and return the updated value; the worker owns it outright, so no
//! interior mutability or back-pointers are involved.

use std::collections::BTreeMap;

use crate::crypto::PublicKey;
use crate::p2p::ReplicationTree;
use crate::types::{
    BitString, CrossValidationStamp, Peer, Transaction, UnspentOutput, ValidationStamp,
};

#[derive(Clone, Debug)]
pub struct ValidationContext {
    pub transaction: Transaction,
    pub welcome_node: Peer,
    /// Election-ordered validators; the head coordinates.
    pub validation_nodes: Vec<Peer>,
    pub chain_storage_nodes: Vec<Peer>,
    pub beacon_storage_nodes: Vec<Peer>,
    pub io_storage_nodes: Vec<Peer>,
    pub previous_transaction: Option<Transaction>,
    pub unspent_outputs: Vec<UnspentOutput>,
    /// Keys of the previous-address storage nodes gathered from the fetch
    /// and from cross-validator contexts.
    pub previous_storage_node_keys: Vec<PublicKey>,
    pub chain_nodes_view: BitString,
    pub beacon_nodes_view: BitString,
    /// One bit per cross-validator, set when its context arrived.
    pub cross_validation_nodes_confirmation: BitString,
    pub valid_pending_transaction: bool,
    pub validation_stamp: Option<ValidationStamp>,
    pub cross_validation_stamps: Vec<CrossValidationStamp>,
    pub replication_tree: Option<ReplicationTree>,
    /// Replica index in the elected chain-storage set to signature.
    pub storage_confirmations: BTreeMap<u16, Vec<u8>>,
}

impl ValidationContext {
    pub fn new(transaction: Transaction, welcome_node: Peer, validation_nodes: Vec<Peer>) -> Self {
        let cross_validator_count = validation_nodes.len().saturating_sub(1);
        Self {
            transaction,
            welcome_node,
            validation_nodes,
            chain_storage_nodes: Vec::new(),
            beacon_storage_nodes: Vec::new(),
            io_storage_nodes: Vec::new(),
            previous_transaction: None,
            unspent_outputs: Vec::new(),
            previous_storage_node_keys: Vec::new(),
            chain_nodes_view: BitString::zeroes(0),
            beacon_nodes_view: BitString::zeroes(0),
            cross_validation_nodes_confirmation: BitString::zeroes(cross_validator_count),
            valid_pending_transaction: false,
            validation_stamp: None,
            cross_validation_stamps: Vec::new(),
            replication_tree: None,
            storage_confirmations: BTreeMap::new(),
        }
    }

    pub fn coordinator(&self) -> &Peer {
        &self.validation_nodes[0]
    }

    pub fn cross_validation_nodes(&self) -> &[Peer] {
        &self.validation_nodes[1..]
    }

    pub fn with_pending_validation(mut self, valid: bool) -> Self {
        self.valid_pending_transaction = valid;
        self
    }

    pub fn with_elections(
        mut self,
        chain_storage_nodes: Vec<Peer>,
        beacon_storage_nodes: Vec<Peer>,
        io_storage_nodes: Vec<Peer>,
    ) -> Self {
        self.chain_nodes_view = BitString::zeroes(chain_storage_nodes.len());
        self.beacon_nodes_view = BitString::zeroes(beacon_storage_nodes.len());
        self.chain_storage_nodes = chain_storage_nodes;
        self.beacon_storage_nodes = beacon_storage_nodes;
        self.io_storage_nodes = io_storage_nodes;
        self
    }

    pub fn with_fetched_context(
        mut self,
        previous_transaction: Option<Transaction>,
        unspent_outputs: Vec<UnspentOutput>,
        previous_storage_node_keys: Vec<PublicKey>,
        chain_nodes_view: BitString,
        beacon_nodes_view: BitString,
    ) -> Self {
        self.previous_transaction = previous_transaction;
        self.unspent_outputs = unspent_outputs;
        self.previous_storage_node_keys = previous_storage_node_keys;
        self.chain_nodes_view = chain_nodes_view;
        self.beacon_nodes_view = beacon_nodes_view;
        self
    }

    /// Index of a cross-validator by its last public key.
    pub fn cross_validator_index(&self, key: &PublicKey) -> Option<usize> {
        self.cross_validation_nodes()
            .iter()
            .position(|peer| peer.last_public_key == *key)
    }

    /// Aggregates a cross-validator's mining context: marks its confirmation
    /// bit, unions the availability views, and merges the previous-storage
    /// key set.
    pub fn aggregate_mining_context(
        mut self,
        validator_index: usize,
        previous_storage_node_keys: Vec<PublicKey>,
        chain_view: &BitString,
        beacon_view: &BitString,
    ) -> Self {
        self.cross_validation_nodes_confirmation.set(validator_index);
        self.chain_nodes_view.merge(chain_view);
        self.beacon_nodes_view.merge(beacon_view);
        for key in previous_storage_node_keys {
            if !self.previous_storage_node_keys.contains(&key) {
                self.previous_storage_node_keys.push(key);
            }
        }
        self
    }

    /// True when every expected cross-validator has contributed context.
    pub fn enough_confirmations(&self) -> bool {
        self.cross_validation_nodes_confirmation.all_set()
    }

    pub fn confirmed_cross_validation_count(&self) -> usize {
        self.cross_validation_nodes_confirmation.ones()
    }

    pub fn confirmed_cross_validation_nodes(&self) -> Vec<Peer> {
        self.cross_validation_nodes_confirmation
            .iter_ones()
            .filter_map(|index| self.cross_validation_nodes().get(index).cloned())
            .collect()
    }

    pub fn with_validation_stamp(mut self, stamp: ValidationStamp) -> Self {
        self.validation_stamp = Some(stamp);
        self
    }

    pub fn with_replication_tree(mut self, tree: ReplicationTree) -> Self {
        self.replication_tree = Some(tree);
        self
    }

    /// Records which cross-validators the coordinator confirmed; used by the
    /// cross-validator path where the bitstring arrives over the wire.
    pub fn with_confirmed_cross_validation_nodes(mut self, confirmed: BitString) -> Self {
        if confirmed.len() == self.cross_validation_nodes_confirmation.len() {
            self.cross_validation_nodes_confirmation = confirmed;
        }
        self
    }

    /// Adds a cross-validation stamp, ignoring duplicate signers.
    pub fn add_cross_validation_stamp(mut self, stamp: CrossValidationStamp) -> Self {
        let duplicate = self
            .cross_validation_stamps
            .iter()
            .any(|existing| existing.node_public_key == stamp.node_public_key);
        if !duplicate {
            self.cross_validation_stamps.push(stamp);
        }
        self
    }

    /// True when every confirmed cross-validator has returned a stamp.
    pub fn enough_cross_validation_stamps(&self) -> bool {
        self.cross_validation_stamps.len() >= self.confirmed_cross_validation_count()
    }

    /// Atomic commitment: every collected stamp reports the same
    /// inconsistency list, in particular the empty one.
    pub fn atomic_commitment(&self) -> bool {
        let Some(first) = self.cross_validation_stamps.first() else {
            return false;
        };
        self.cross_validation_stamps
            .iter()
            .all(|stamp| stamp.inconsistencies == first.inconsistencies)
    }

    pub fn add_storage_confirmation(mut self, node_index: u16, signature: Vec<u8>) -> Self {
        self.storage_confirmations.insert(node_index, signature);
        self
    }

    /// True once the storage quorum is reached; `None` requires every
    /// elected chain replica.
    pub fn enough_storage_confirmations(&self, quorum: Option<usize>) -> bool {
        let required = quorum
            .unwrap_or(self.chain_storage_nodes.len())
            .min(self.chain_storage_nodes.len());
        self.storage_confirmations.len() >= required.max(1)
    }

    /// Splits the replica sets into per-validator masks: replicas are sorted
    /// by geographic patch and dealt round-robin across the validators, so
    /// each validator forwards to a patch-spread slice.
    pub fn create_replication_tree(&self) -> ReplicationTree {
        ReplicationTree {
            chain: split_replicas(&self.chain_storage_nodes, self.validation_nodes.len()),
            beacon: split_replicas(&self.beacon_storage_nodes, self.validation_nodes.len()),
            io: split_replicas(&self.io_storage_nodes, self.validation_nodes.len()),
        }
    }

    /// The transaction with its validation and cross-validation stamps
    /// attached, ready for replication.
    pub fn validated_transaction(&self) -> Transaction {
        let mut transaction = self.transaction.clone();
        transaction.validation_stamp = self.validation_stamp.clone();
        transaction.cross_validation_stamps = self.cross_validation_stamps.clone();
        transaction
    }
}

fn split_replicas(replicas: &[Peer], validator_count: usize) -> Vec<BitString> {
    let validator_count = validator_count.max(1);
    let mut masks = vec![BitString::zeroes(replicas.len()); validator_count];
    let mut order: Vec<usize> = (0..replicas.len()).collect();
    order.sort_by(|left, right| replicas[*left].geo_patch.cmp(&replicas[*right].geo_patch));
    for (round, replica_index) in order.into_iter().enumerate() {
        masks[round % validator_count].set(replica_index);
    }
    masks
}
