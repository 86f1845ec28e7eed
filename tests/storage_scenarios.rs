//! End-to-end storage scenarios: single-append bookkeeping, crash recovery
//! over a truncated subset index, temporal chain-head queries, and restart
//! equivalence of the rebuilt tables.

use std::fs;

use tempfile::TempDir;

use weave_chain::crypto::{Address, HashAlgorithm, NodeKeys};
use weave_chain::storage::{ChainIndex, ChainStore};
use weave_chain::types::{Transaction, TransactionData, TransactionType};
use weave_chain::StorageConfig;

/// Two 34-byte self-describing sha256 addresses plus the u32 size and offset.
const SUBSET_RECORD_LEN: u64 = 34 + 34 + 4 + 4;

fn storage_config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        db_path: dir.path().to_path_buf(),
        writer_partitions: 4,
        bloom_expected_items: 1024,
    }
}

fn address(subset: u8, tail: u8) -> Address {
    let mut bytes = vec![0u8, HashAlgorithm::Sha256.id()];
    bytes.push(subset);
    bytes.extend_from_slice(&[tail; 31]);
    Address::from_bytes(bytes).unwrap()
}

fn transaction(keys: &NodeKeys, tx_address: Address, content: &[u8]) -> Transaction {
    let mut transaction = Transaction {
        address: tx_address,
        tx_type: TransactionType::Transfer,
        data: TransactionData {
            content: content.to_vec(),
            ..TransactionData::default()
        },
        previous_public_key: keys.public_key().clone(),
        previous_signature: Vec::new(),
        origin_signature: vec![9u8; 64],
        validation_stamp: None,
        cross_validation_stamps: Vec::new(),
    };
    transaction.previous_signature = keys.sign(&transaction.payload_for_previous_signature());
    transaction
}

#[tokio::test]
async fn single_append_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = ChainStore::open(&storage_config(&dir)).unwrap();
    let keys = NodeKeys::generate();
    let tx = transaction(&keys, address(0x07, 0x11), b"first transaction");
    let genesis = tx.previous_address();

    store.append_transaction(&tx).await.unwrap();

    let entry = store.index().get_tx_entry(&tx.address).unwrap().unwrap();
    assert_eq!(entry.genesis_address, genesis);
    assert_eq!(entry.size, tx.serialized_size());
    assert_eq!(entry.offset, 0);
    assert_eq!(store.index().chain_size(&tx.address), 1);
    assert!(store.index().transaction_exists(&tx.address));

    // Exactly one record in the subset index file of subset 0x07.
    let subset_file = dir.path().join("07-summary");
    assert_eq!(fs::metadata(&subset_file).unwrap().len(), SUBSET_RECORD_LEN);
}

#[test]
fn crash_recovery_ignores_the_partial_tail() {
    let dir = TempDir::new().unwrap();
    let genesis = address(0x07, 0x00);
    {
        let index = ChainIndex::open(dir.path(), 1024).unwrap();
        for (i, size) in [100u32, 50, 75].iter().enumerate() {
            let tx = address(0x07, 0x10 + i as u8);
            index
                .add_tx(&tx, &genesis, TransactionType::Transfer, *size)
                .unwrap();
        }
    }

    // Drop the last byte of the third record, as a crash mid-flush would.
    let subset_file = dir.path().join("07-summary");
    let full_len = fs::metadata(&subset_file).unwrap().len();
    assert_eq!(full_len, 3 * SUBSET_RECORD_LEN);
    let file = fs::OpenOptions::new().write(true).open(&subset_file).unwrap();
    file.set_len(full_len - 1).unwrap();
    drop(file);

    let index = ChainIndex::open(dir.path(), 1024).unwrap();
    assert!(index
        .get_tx_entry(&address(0x07, 0x10))
        .unwrap()
        .is_some());
    assert!(index
        .get_tx_entry(&address(0x07, 0x11))
        .unwrap()
        .is_some());
    // The truncated record is gone.
    assert!(index
        .get_tx_entry(&address(0x07, 0x12))
        .unwrap()
        .is_none());
    assert_eq!(index.chain_size(&genesis), 2);

    // A new append lands after the recovered sizes only.
    let offset = index
        .add_tx(&address(0x07, 0x13), &genesis, TransactionType::Transfer, 60)
        .unwrap();
    assert_eq!(offset, 150);
}

#[test]
fn temporal_last_address_queries() {
    let dir = TempDir::new().unwrap();
    let index = ChainIndex::open(dir.path(), 1024).unwrap();
    let genesis = address(0x07, 0x00);
    let at_100 = address(0x11, 0x01);
    let at_200 = address(0x22, 0x02);
    let at_300 = address(0x33, 0x03);

    index.set_last_chain_address(&genesis, &at_100, 100).unwrap();
    index.set_last_chain_address(&genesis, &at_200, 200).unwrap();
    index.set_last_chain_address(&genesis, &at_300, 300).unwrap();

    assert_eq!(index.get_last_chain_address(&genesis).unwrap(), at_300);
    assert_eq!(
        index.get_last_chain_address_until(&genesis, 250).unwrap(),
        at_200
    );
    assert_eq!(
        index.get_last_chain_address_until(&genesis, 300).unwrap(),
        at_300
    );
    assert_eq!(
        index.get_last_chain_address_until(&genesis, 1_000).unwrap(),
        at_300
    );
    // Nothing is old enough: the queried address falls back on itself.
    assert_eq!(
        index.get_last_chain_address_until(&genesis, 50).unwrap(),
        genesis
    );
}

#[tokio::test]
async fn restart_rebuilds_equivalent_tables() {
    let dir = TempDir::new().unwrap();
    let keys = NodeKeys::generate();
    let other_keys = NodeKeys::generate();

    let first = transaction(&keys, address(0x07, 0x11), b"first");
    let second = transaction(&keys, address(0x09, 0x12), b"second one");
    let third = transaction(&other_keys, address(0x07, 0x21), b"another chain");

    {
        let store = ChainStore::open(&storage_config(&dir)).unwrap();
        for tx in [&first, &second, &third] {
            store.append_transaction(tx).await.unwrap();
            store
                .index()
                .set_last_chain_address(&tx.previous_address(), &tx.address, 100)
                .unwrap();
        }
        store.close().await;
    }

    let store = ChainStore::open(&storage_config(&dir)).unwrap();
    let index = store.index();

    for tx in [&first, &second, &third] {
        let entry = index.get_tx_entry(&tx.address).unwrap().unwrap();
        assert_eq!(entry.size, tx.serialized_size());
        assert_eq!(entry.genesis_address, tx.previous_address());
        assert!(index.transaction_exists(&tx.address));
    }
    assert_eq!(
        index.get_last_chain_address(&first.previous_address()).unwrap(),
        second.address
    );
    assert_eq!(
        index.get_last_chain_address(&third.previous_address()).unwrap(),
        third.address
    );
    assert_eq!(index.chain_size(&first.address), 2);
    assert_eq!(index.chain_size(&third.address), 1);
    assert_eq!(
        index.count_transactions_by_type(TransactionType::Transfer),
        3
    );

    // Offsets stay strictly monotonic per chain after the restart.
    let first_entry = index.get_tx_entry(&first.address).unwrap().unwrap();
    let second_entry = index.get_tx_entry(&second.address).unwrap().unwrap();
    assert_eq!(first_entry.offset, 0);
    assert_eq!(second_entry.offset, first.serialized_size());

    // And the chain files replay to the appended transactions.
    let replayed = store.scan_chain(&first.previous_address()).unwrap();
    assert_eq!(replayed, vec![first.clone(), second.clone()]);
}

#[tokio::test]
async fn all_addresses_listing_covers_every_chain() {
    let dir = TempDir::new().unwrap();
    let store = ChainStore::open(&storage_config(&dir)).unwrap();
    let keys = NodeKeys::generate();
    let other_keys = NodeKeys::generate();

    let first = transaction(&keys, address(0x07, 0x11), b"first");
    let second = transaction(&other_keys, address(0x08, 0x21), b"second");
    for tx in [&first, &second] {
        store.append_transaction(tx).await.unwrap();
        store
            .index()
            .set_last_chain_address(&tx.previous_address(), &tx.address, 42)
            .unwrap();
    }

    let mut listed: Vec<Address> = store
        .index()
        .list_all_addresses()
        .collect::<weave_chain::ChainResult<_>>()
        .unwrap();
    listed.sort();
    let mut expected = vec![first.address.clone(), second.address.clone()];
    expected.sort();
    assert_eq!(listed, expected);
}
