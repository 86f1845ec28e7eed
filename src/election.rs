//! Deterministic node elections. Every validator must derive the same
//! storage and validation sets from the same inputs, so elections are pure
//! functions of the address/seed and the candidate list.

use sha2::{Digest, Sha256};

use crate::crypto::Address;
use crate::types::{Peer, Transaction, TransactionType};

pub trait Election: Send + Sync {
    /// Storage nodes elected to hold a chain address, best first.
    fn chain_storage_nodes(&self, address: &Address, nodes: &[Peer]) -> Vec<Peer>;

    /// Type-aware election: network transactions are replicated on every
    /// authorized node rather than a sampled set.
    fn chain_storage_nodes_with_type(
        &self,
        address: &Address,
        tx_type: TransactionType,
        nodes: &[Peer],
    ) -> Vec<Peer>;

    /// Storage nodes elected for a beacon subset slot.
    fn beacon_storage_nodes(&self, subset: u8, slot_time: u64, nodes: &[Peer]) -> Vec<Peer>;

    /// Validators for a pending transaction, seed-sorted; the head of the
    /// list coordinates the workflow.
    fn validation_nodes(&self, transaction: &Transaction, timestamp: u64, nodes: &[Peer])
        -> Vec<Peer>;

    /// Deterministic election seed recorded in the validation stamp.
    fn election_proof(&self, address: &Address, timestamp: u64) -> Vec<u8>;
}

/// Election by hashing the seed with each candidate key and sorting the
/// digests.
#[derive(Clone, Debug)]
pub struct HashElection {
    pub storage_replicas: usize,
    pub validators: usize,
}

impl Default for HashElection {
    fn default() -> Self {
        Self {
            storage_replicas: 3,
            validators: 3,
        }
    }
}

impl HashElection {
    fn rank(seed: &[u8], candidates: &[Peer]) -> Vec<Peer> {
        let mut ranked: Vec<(Vec<u8>, Peer)> = candidates
            .iter()
            .map(|peer| {
                let mut hasher = Sha256::new();
                hasher.update(seed);
                hasher.update(peer.first_public_key.as_bytes());
                (hasher.finalize().to_vec(), peer.clone())
            })
            .collect();
        ranked.sort_by(|left, right| left.0.cmp(&right.0));
        ranked.into_iter().map(|(_, peer)| peer).collect()
    }

    fn eligible(nodes: &[Peer]) -> Vec<Peer> {
        nodes
            .iter()
            .filter(|peer| peer.authorized && peer.available)
            .cloned()
            .collect()
    }
}

impl Election for HashElection {
    fn chain_storage_nodes(&self, address: &Address, nodes: &[Peer]) -> Vec<Peer> {
        let mut elected = Self::rank(address.as_bytes(), &Self::eligible(nodes));
        elected.truncate(self.storage_replicas);
        elected
    }

    fn chain_storage_nodes_with_type(
        &self,
        address: &Address,
        tx_type: TransactionType,
        nodes: &[Peer],
    ) -> Vec<Peer> {
        match tx_type {
            TransactionType::Node | TransactionType::NodeSharedSecrets => Self::eligible(nodes),
            _ => self.chain_storage_nodes(address, nodes),
        }
    }

    fn beacon_storage_nodes(&self, subset: u8, slot_time: u64, nodes: &[Peer]) -> Vec<Peer> {
        let mut seed = Vec::with_capacity(9);
        seed.push(subset);
        seed.extend_from_slice(&slot_time.to_be_bytes());
        let mut elected = Self::rank(&seed, &Self::eligible(nodes));
        elected.truncate(self.storage_replicas);
        elected
    }

    fn validation_nodes(
        &self,
        transaction: &Transaction,
        timestamp: u64,
        nodes: &[Peer],
    ) -> Vec<Peer> {
        let seed = self.election_proof(&transaction.address, timestamp);
        let mut elected = Self::rank(&seed, &Self::eligible(nodes));
        elected.truncate(self.validators.max(1));
        elected
    }

    fn election_proof(&self, address: &Address, timestamp: u64) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"election");
        hasher.update(address.as_bytes());
        hasher.update(timestamp.to_be_bytes());
        hasher.finalize().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{HashAlgorithm, NodeKeys};
    use std::net::{IpAddr, Ipv4Addr};

    fn peers(count: usize) -> Vec<Peer> {
        (0..count)
            .map(|i| {
                let keys = NodeKeys::generate();
                Peer::new(
                    keys.public_key().clone(),
                    keys.public_key().clone(),
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    9_000 + i as u16,
                )
            })
            .collect()
    }

    fn address(byte: u8) -> Address {
        let mut bytes = vec![0u8, HashAlgorithm::Sha256.id()];
        bytes.extend_from_slice(&[byte; 32]);
        Address::from_bytes(bytes).unwrap()
    }

    #[test]
    fn elections_are_deterministic() {
        let election = HashElection::default();
        let nodes = peers(8);
        let first = election.chain_storage_nodes(&address(0x11), &nodes);
        let second = election.chain_storage_nodes(&address(0x11), &nodes);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn different_addresses_shuffle_the_ranking() {
        let election = HashElection {
            storage_replicas: 8,
            validators: 3,
        };
        let nodes = peers(8);
        let for_first = election.chain_storage_nodes(&address(0x11), &nodes);
        let for_second = election.chain_storage_nodes(&address(0x99), &nodes);
        // Same membership, near-certainly a different order.
        assert_ne!(for_first, for_second);
    }

    #[test]
    fn unavailable_nodes_are_skipped() {
        let election = HashElection::default();
        let mut nodes = peers(4);
        nodes[0].available = false;
        nodes[1].authorized = false;
        let elected = election.chain_storage_nodes(&address(0x11), &nodes);
        assert_eq!(elected.len(), 2);
        assert!(elected.iter().all(|peer| peer.authorized && peer.available));
    }

    #[test]
    fn network_types_replicate_everywhere() {
        let election = HashElection::default();
        let nodes = peers(6);
        let elected = election.chain_storage_nodes_with_type(
            &address(0x11),
            TransactionType::Node,
            &nodes,
        );
        assert_eq!(elected.len(), 6);
    }
}
