//! Replication fan-out: one task per chain replica with a hard deadline,
//! responses funneled back into the worker mailbox, plus the replica-side
//! persistence that answers a chain replication request.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::crypto::NodeKeys;
use crate::errors::ChainResult;
use crate::mining::worker::WorkerHandle;
use crate::p2p::{MiningMessage, P2pClient};
use crate::storage::ChainStore;
use crate::types::{Peer, Transaction, TransactionSummary};

/// Ships the validated transaction to every elected chain replica. Each
/// replica answers with a storage acknowledgement or an error; timeouts and
/// transport failures are reported as replication errors and otherwise
/// ignored.
pub fn replicate_to_chain_replicas(
    p2p: Arc<dyn P2pClient>,
    transaction: Transaction,
    replicas: Vec<Peer>,
    worker: WorkerHandle,
    deadline: Duration,
) {
    for peer in replicas {
        let p2p = Arc::clone(&p2p);
        let worker = worker.clone();
        let message = MiningMessage::ReplicateTransactionChain {
            transaction: Box::new(transaction.clone()),
            ack_storage: true,
        };
        tokio::spawn(async move {
            match timeout(deadline, p2p.send(&peer, message)).await {
                Ok(Ok(MiningMessage::AcknowledgeStorage { signature })) => {
                    worker.add_ack_storage(peer.last_public_key.clone(), signature);
                }
                Ok(Ok(MiningMessage::Error { reason })) => {
                    worker.replication_error(peer.last_public_key.clone(), reason);
                }
                Ok(Ok(other)) => {
                    worker.replication_error(
                        peer.last_public_key.clone(),
                        format!("unexpected replication reply: {other:?}"),
                    );
                }
                Ok(Err(err)) => {
                    worker.replication_error(peer.last_public_key.clone(), err.to_string());
                }
                Err(_) => {
                    worker.replication_error(
                        peer.last_public_key.clone(),
                        "replication request timed out".into(),
                    );
                }
            }
        });
    }
}

/// Replica side of `ReplicateTransactionChain`: persists the validated
/// transaction, moves the chain head, records the key rotation, and answers
/// with a signature over the transaction summary.
pub async fn persist_and_acknowledge(
    store: &ChainStore,
    keys: &NodeKeys,
    transaction: &Transaction,
) -> ChainResult<MiningMessage> {
    let summary = TransactionSummary::from_transaction(transaction)?;
    let previous_address = transaction.previous_address();
    store.append_transaction(transaction).await?;

    let timestamp = (summary.timestamp / 1_000) as u32;
    store
        .index()
        .set_last_chain_address(&previous_address, &transaction.address, timestamp)?;
    let genesis = store.index().get_genesis_address(&previous_address);
    store
        .index()
        .set_public_key(&genesis, &transaction.previous_public_key, timestamp)?;

    debug!(address = %transaction.address, "chain transaction replicated");
    Ok(MiningMessage::AcknowledgeStorage {
        signature: keys.sign(&summary.serialize()),
    })
}
