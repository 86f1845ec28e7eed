//! Best-effort retrieval of a transaction's mining context from the storage
//! replicas elected for its previous address: the previous transaction, the
//! current unspent outputs, and the availability views over the chain and
//! beacon storage sets. Every replica is probed concurrently with its own
//! timeout; the first authoritative reply wins and the losers are dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::crypto::{Address, PublicKey};
use crate::p2p::{MiningMessage, P2pClient};
use crate::types::{BitString, Peer, Transaction, UnspentOutput};

pub struct FetchedContext {
    pub previous_transaction: Option<Transaction>,
    pub unspent_outputs: Vec<UnspentOutput>,
    pub previous_storage_node_keys: Vec<PublicKey>,
    pub chain_nodes_view: BitString,
    pub beacon_nodes_view: BitString,
    /// Wall-clock duration of the whole fetch, the base of the
    /// coordinator's confirmation waiting budget.
    pub elapsed: Duration,
}

pub struct TransactionContextFetcher {
    p2p: Arc<dyn P2pClient>,
    request_timeout: Duration,
}

impl TransactionContextFetcher {
    pub fn new(p2p: Arc<dyn P2pClient>, request_timeout: Duration) -> Self {
        Self {
            p2p,
            request_timeout,
        }
    }

    pub async fn fetch(
        &self,
        previous_address: &Address,
        previous_storage_nodes: &[Peer],
        chain_storage_nodes: &[Peer],
        beacon_storage_nodes: &[Peer],
    ) -> FetchedContext {
        let started = Instant::now();
        let (previous_transaction, unspent_outputs, chain_nodes_view, beacon_nodes_view) = tokio::join!(
            self.fetch_previous_transaction(previous_address, previous_storage_nodes),
            self.fetch_unspent_outputs(previous_address, previous_storage_nodes),
            self.availability_view(chain_storage_nodes),
            self.availability_view(beacon_storage_nodes),
        );
        FetchedContext {
            previous_transaction,
            unspent_outputs,
            previous_storage_node_keys: previous_storage_nodes
                .iter()
                .map(|peer| peer.first_public_key.clone())
                .collect(),
            chain_nodes_view,
            beacon_nodes_view,
            elapsed: started.elapsed(),
        }
    }

    /// Probes every replica at once; the first reply wins, and a reachable
    /// replica answering "none" is authoritative. In-flight probes are
    /// dropped with the stream.
    async fn fetch_previous_transaction(
        &self,
        previous_address: &Address,
        replicas: &[Peer],
    ) -> Option<Transaction> {
        let mut probes: FuturesUnordered<_> = replicas
            .iter()
            .map(|peer| {
                let request = MiningMessage::GetTransaction {
                    address: previous_address.clone(),
                };
                async move {
                    match timeout(self.request_timeout, self.p2p.send(peer, request)).await {
                        Ok(Ok(MiningMessage::TransactionResponse { transaction })) => {
                            Some(transaction.map(|boxed| *boxed))
                        }
                        Ok(Ok(other)) => {
                            debug!(peer = %peer.last_public_key, ?other, "unexpected previous-transaction reply");
                            None
                        }
                        Ok(Err(err)) => {
                            debug!(peer = %peer.last_public_key, ?err, "previous-transaction fetch failed");
                            None
                        }
                        Err(_) => {
                            debug!(peer = %peer.last_public_key, "previous-transaction fetch timed out");
                            None
                        }
                    }
                }
            })
            .collect();
        while let Some(outcome) = probes.next().await {
            if let Some(transaction) = outcome {
                return transaction;
            }
        }
        None
    }

    async fn fetch_unspent_outputs(
        &self,
        previous_address: &Address,
        replicas: &[Peer],
    ) -> Vec<UnspentOutput> {
        let mut probes: FuturesUnordered<_> = replicas
            .iter()
            .map(|peer| {
                let request = MiningMessage::GetUnspentOutputs {
                    address: previous_address.clone(),
                };
                async move {
                    match timeout(self.request_timeout, self.p2p.send(peer, request)).await {
                        Ok(Ok(MiningMessage::UnspentOutputsResponse { unspent_outputs })) => {
                            Some(unspent_outputs)
                        }
                        Ok(Ok(other)) => {
                            debug!(peer = %peer.last_public_key, ?other, "unexpected unspent-outputs reply");
                            None
                        }
                        Ok(Err(err)) => {
                            debug!(peer = %peer.last_public_key, ?err, "unspent-outputs fetch failed");
                            None
                        }
                        Err(_) => {
                            debug!(peer = %peer.last_public_key, "unspent-outputs fetch timed out");
                            None
                        }
                    }
                }
            })
            .collect();
        while let Some(outcome) = probes.next().await {
            if let Some(unspent_outputs) = outcome {
                return unspent_outputs;
            }
        }
        Vec::new()
    }

    /// Availability view over a storage set: one batched request carrying
    /// the whole set's keys goes to every member, every answered view is
    /// unioned, and a peer that answered at all is marked available.
    async fn availability_view(&self, storage_nodes: &[Peer]) -> BitString {
        let keys: Vec<PublicKey> = storage_nodes
            .iter()
            .map(|peer| peer.first_public_key.clone())
            .collect();
        let responses = join_all(storage_nodes.iter().map(|peer| {
            let request = MiningMessage::GetNodeAvailability { keys: keys.clone() };
            async move { timeout(self.request_timeout, self.p2p.send(peer, request)).await }
        }))
        .await;

        let mut view = BitString::zeroes(storage_nodes.len());
        for (index, response) in responses.into_iter().enumerate() {
            match response {
                Ok(Ok(MiningMessage::NodeAvailabilityResponse { view: peer_view })) => {
                    if peer_view.len() == view.len() {
                        view.merge(&peer_view);
                    } else {
                        debug!(
                            peer = %storage_nodes[index].last_public_key,
                            "availability view of the wrong width"
                        );
                    }
                    view.set(index);
                }
                Ok(Ok(other)) => {
                    debug!(peer = %storage_nodes[index].last_public_key, ?other, "unexpected availability reply");
                }
                Ok(Err(err)) => {
                    debug!(peer = %storage_nodes[index].last_public_key, ?err, "availability probe failed");
                }
                Err(_) => {
                    debug!(peer = %storage_nodes[index].last_public_key, "availability probe timed out");
                }
            }
        }
        view
    }
}
