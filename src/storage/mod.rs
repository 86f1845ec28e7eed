//! Embedded chain storage: append-only per-chain files, subset indices, and
//! the partitioned writer pool that serializes appends per genesis.

pub mod bloom;
pub mod index;
pub mod writer;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::crypto::Address;
use crate::encoding::ByteReader;
use crate::errors::{ChainError, ChainResult};
use crate::types::Transaction;

pub use index::{ChainIndex, ChainStats, TxEntry, SUBSET_COUNT};
pub use writer::{ChainWriterPool, DEFAULT_WRITER_PARTITIONS};

/// Facade over the chain files, the index, and the writer pool. Reads open
/// their own handles; all writes go through the owning partition writer.
pub struct ChainStore {
    db_path: PathBuf,
    index: Arc<ChainIndex>,
    writers: ChainWriterPool,
}

impl ChainStore {
    /// Opens (or creates) the store rooted at the configured `db_path`,
    /// replaying the on-disk indices. Must be called from within a tokio
    /// runtime: the writer pool spawns its tasks here.
    pub fn open(config: &StorageConfig) -> ChainResult<Self> {
        let db_path = config.db_path.clone();
        let index = Arc::new(ChainIndex::open(&db_path, config.bloom_expected_items)?);
        let writers =
            ChainWriterPool::spawn(db_path.clone(), Arc::clone(&index), config.writer_partitions)?;
        Ok(Self {
            db_path,
            index,
            writers,
        })
    }

    pub fn index(&self) -> &Arc<ChainIndex> {
        &self.index
    }

    /// Appends a transaction to its chain. The genesis is resolved from the
    /// previous address: a known previous transaction pins its chain,
    /// otherwise the previous address is the genesis itself.
    pub async fn append_transaction(&self, transaction: &Transaction) -> ChainResult<u32> {
        let previous = transaction.previous_address();
        let genesis = self.index.get_genesis_address(&previous);
        self.writers.append(genesis, transaction.clone()).await
    }

    /// Reads one transaction through its index entry.
    pub fn get_transaction(&self, address: &Address) -> ChainResult<Option<Transaction>> {
        let Some(entry) = self.index.get_tx_entry(address)? else {
            return Ok(None);
        };
        let path = self.chain_file(&entry.genesis_address);
        let bytes = fs::read(&path)?;
        let start = entry.offset as usize;
        let end = start + entry.size as usize;
        if end > bytes.len() {
            return Err(ChainError::Storage(format!(
                "chain file {} is shorter than the index entry for {address}",
                path.display()
            )));
        }
        Transaction::decode(&bytes[start..end]).map(Some)
    }

    /// Replays a whole chain file in append order.
    pub fn scan_chain(&self, genesis: &Address) -> ChainResult<Vec<Transaction>> {
        let path = self.chain_file(genesis);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)?;
        let mut reader = ByteReader::new(&bytes);
        let mut transactions = Vec::new();
        while !reader.is_empty() {
            transactions.push(Transaction::deserialize(&mut reader)?);
        }
        Ok(transactions)
    }

    pub async fn write_beacon_summary(&self, address: Address, payload: Vec<u8>) -> ChainResult<()> {
        self.writers.write_beacon_summary(address, payload).await
    }

    pub fn read_beacon_summary(&self, address: &Address) -> ChainResult<Option<Vec<u8>>> {
        let path = self.db_path.join("beacon_summary").join(address.to_hex());
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(&path)?))
    }

    /// Drains the writer pool. In-flight appends complete; new appends fail.
    pub async fn close(self) {
        self.writers.shutdown().await;
    }

    fn chain_file(&self, genesis: &Address) -> PathBuf {
        self.db_path.join("chains").join(genesis.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::crypto::{Address, HashAlgorithm, NodeKeys};
    use crate::types::{TransactionData, TransactionType};
    use tempfile::TempDir;

    fn store_config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            db_path: dir.path().to_path_buf(),
            writer_partitions: 4,
            bloom_expected_items: 1024,
        }
    }

    fn transaction(keys: &NodeKeys, content: &[u8], address_tail: u8) -> Transaction {
        let mut bytes = vec![0u8, HashAlgorithm::Sha256.id()];
        bytes.extend_from_slice(&[address_tail; 32]);
        Transaction {
            address: Address::from_bytes(bytes).unwrap(),
            tx_type: TransactionType::Transfer,
            data: TransactionData {
                content: content.to_vec(),
                ..TransactionData::default()
            },
            previous_public_key: keys.public_key().clone(),
            previous_signature: vec![1u8; 64],
            origin_signature: vec![2u8; 64],
            validation_stamp: None,
            cross_validation_stamps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn append_then_read_back() {
        let dir = TempDir::new().unwrap();
        let store = ChainStore::open(&store_config(&dir)).unwrap();
        let keys = NodeKeys::generate();
        let tx = transaction(&keys, b"first", 0x11);

        let offset = store.append_transaction(&tx).await.unwrap();
        assert_eq!(offset, 0);

        let read = store.get_transaction(&tx.address).unwrap().unwrap();
        assert_eq!(read, tx);
    }

    #[tokio::test]
    async fn chain_replay_matches_append_order() {
        let dir = TempDir::new().unwrap();
        let store = ChainStore::open(&store_config(&dir)).unwrap();
        let keys = NodeKeys::generate();
        let genesis = Address::from_public_key(HashAlgorithm::Sha256, keys.public_key());

        let first = transaction(&keys, b"first", 0x11);
        let second = transaction(&keys, b"second, longer content", 0x12);
        store.append_transaction(&first).await.unwrap();
        store.append_transaction(&second).await.unwrap();

        // Both share the same previous key, hence the same genesis.
        let replayed = store.scan_chain(&genesis).unwrap();
        assert_eq!(replayed, vec![first.clone(), second.clone()]);

        let entry = store.index().get_tx_entry(&second.address).unwrap().unwrap();
        assert_eq!(entry.offset, first.serialized_size());
        assert_eq!(entry.size, second.serialized_size());
    }

    #[tokio::test]
    async fn beacon_summary_is_write_once() {
        let dir = TempDir::new().unwrap();
        let store = ChainStore::open(&store_config(&dir)).unwrap();
        let mut bytes = vec![0u8, HashAlgorithm::Sha256.id()];
        bytes.extend_from_slice(&[0x42; 32]);
        let address = Address::from_bytes(bytes).unwrap();

        store
            .write_beacon_summary(address.clone(), b"summary".to_vec())
            .await
            .unwrap();
        assert_eq!(
            store.read_beacon_summary(&address).unwrap().unwrap(),
            b"summary".to_vec()
        );

        let second = store
            .write_beacon_summary(address.clone(), b"again".to_vec())
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn appends_to_one_chain_are_ordered() {
        let dir = TempDir::new().unwrap();
        let store = ChainStore::open(&store_config(&dir)).unwrap();
        let keys = NodeKeys::generate();

        let mut expected_offset = 0;
        for i in 0u8..16 {
            let tx = transaction(&keys, format!("payload {i}").as_bytes(), 0x20 + i);
            let offset = store.append_transaction(&tx).await.unwrap();
            assert_eq!(offset, expected_offset);
            expected_offset += tx.serialized_size();
        }
        store.close().await;
    }
}
