use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crypto::Address;
use crate::errors::{ChainError, ChainResult};
use crate::storage::index::ChainIndex;
use crate::types::Transaction;

pub const DEFAULT_WRITER_PARTITIONS: usize = 20;

enum WriteCommand {
    Append {
        genesis: Address,
        transaction: Box<Transaction>,
        reply: oneshot::Sender<ChainResult<u32>>,
    },
    BeaconSummary {
        address: Address,
        payload: Vec<u8>,
        reply: oneshot::Sender<ChainResult<()>>,
    },
}

/// Pool of writer tasks, one ordered mailbox per partition. A genesis address
/// always hashes to the same partition, so appends to one chain are totally
/// ordered without a file lock while distinct chains progress in parallel.
pub struct ChainWriterPool {
    senders: Vec<mpsc::UnboundedSender<WriteCommand>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChainWriterPool {
    pub fn spawn(db_path: PathBuf, index: Arc<ChainIndex>, partitions: usize) -> ChainResult<Self> {
        let partitions = partitions.max(1);
        std::fs::create_dir_all(db_path.join("chains"))?;
        std::fs::create_dir_all(db_path.join("beacon_summary"))?;
        let mut senders = Vec::with_capacity(partitions);
        let mut tasks = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            tasks.push(tokio::spawn(writer_loop(
                partition,
                db_path.clone(),
                Arc::clone(&index),
                rx,
            )));
        }
        Ok(Self { senders, tasks })
    }

    /// Routes an append to the writer owning the genesis partition and waits
    /// for the durable write. Returns the offset assigned to the record.
    pub async fn append(&self, genesis: Address, transaction: Transaction) -> ChainResult<u32> {
        let (reply, response) = oneshot::channel();
        let partition = self.partition(&genesis);
        self.senders[partition]
            .send(WriteCommand::Append {
                genesis,
                transaction: Box::new(transaction),
                reply,
            })
            .map_err(|_| ChainError::Storage("chain writer terminated".into()))?;
        response
            .await
            .map_err(|_| ChainError::Storage("chain writer dropped the append".into()))?
    }

    /// Writes a beacon summary file. Summaries are written exactly once per
    /// summary address; a second write is an error.
    pub async fn write_beacon_summary(&self, address: Address, payload: Vec<u8>) -> ChainResult<()> {
        let (reply, response) = oneshot::channel();
        let partition = self.partition(&address);
        self.senders[partition]
            .send(WriteCommand::BeaconSummary {
                address,
                payload,
                reply,
            })
            .map_err(|_| ChainError::Storage("chain writer terminated".into()))?;
        response
            .await
            .map_err(|_| ChainError::Storage("chain writer dropped the write".into()))?
    }

    /// Closes the mailboxes and waits for in-flight writes to finish.
    pub async fn shutdown(mut self) {
        self.senders.clear();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(?err, "chain writer task terminated unexpectedly");
                }
            }
        }
    }

    fn partition(&self, genesis: &Address) -> usize {
        let mut hasher = DefaultHasher::new();
        genesis.as_bytes().hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }
}

async fn writer_loop(
    partition: usize,
    db_path: PathBuf,
    index: Arc<ChainIndex>,
    mut mailbox: mpsc::UnboundedReceiver<WriteCommand>,
) {
    while let Some(command) = mailbox.recv().await {
        match command {
            WriteCommand::Append {
                genesis,
                transaction,
                reply,
            } => {
                let result = append_transaction(&db_path, &index, &genesis, &transaction).await;
                if let Err(err) = &result {
                    warn!(partition, %genesis, ?err, "chain append failed");
                }
                let _ = reply.send(result);
            }
            WriteCommand::BeaconSummary {
                address,
                payload,
                reply,
            } => {
                let _ = reply.send(write_beacon_summary(&db_path, &address, &payload).await);
            }
        }
    }
    debug!(partition, "chain writer stopped");
}

async fn append_transaction(
    db_path: &PathBuf,
    index: &ChainIndex,
    genesis: &Address,
    transaction: &Transaction,
) -> ChainResult<u32> {
    let bytes = transaction.serialize();
    let path = db_path.join("chains").join(genesis.to_hex());
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(&bytes).await?;
    file.sync_data().await?;
    index.add_tx(
        &transaction.address,
        genesis,
        transaction.tx_type,
        bytes.len() as u32,
    )
}

async fn write_beacon_summary(
    db_path: &PathBuf,
    address: &Address,
    payload: &[u8],
) -> ChainResult<()> {
    let path = db_path.join("beacon_summary").join(address.to_hex());
    let mut file = match OpenOptions::new().create_new(true).write(true).open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(ChainError::Storage(format!(
                "beacon summary {address} was already written"
            )));
        }
        Err(err) => return Err(err.into()),
    };
    file.write_all(payload).await?;
    file.sync_data().await?;
    Ok(())
}
