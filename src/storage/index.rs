//! In-memory lookup tables and on-disk indices for the transaction chains.
//!
//! Four record families live under `db_path`, all big-endian and append-only:
//!
//! - `<HEX(subset)>-summary` — one record per stored transaction:
//!   `<current_address><genesis_address><size:u32><offset:u32>`;
//! - `<HEX(genesis)>-addresses` — `<unix_ts:u32><address>` per chain head;
//! - `<HEX(genesis)>-keys` — `<unix_ts:u32><public_key>` per key rotation;
//! - `<type_name>` — `<address>` per transaction of that type.
//!
//! Startup replays the subset and type files to rebuild the tables and the
//! per-subset bloom filters; a partially flushed trailing record is dropped,
//! anything else that fails to decode aborts the open so the operator can
//! intervene.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::crypto::{Address, HashAlgorithm, PublicKey};
use crate::encoding::{is_truncation, ByteReader};
use crate::errors::{ChainError, ChainResult};
use crate::storage::bloom::BloomFilter;
use crate::types::TransactionType;

pub const SUBSET_COUNT: usize = 256;

/// Location of one stored transaction inside its genesis chain file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxEntry {
    pub genesis_address: Address,
    pub size: u32,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainStats {
    pub total_size: u32,
    pub tx_count: u32,
}

struct Tables {
    tx_index: HashMap<Address, TxEntry>,
    chain_stats: HashMap<Address, ChainStats>,
    last_index: HashMap<Address, Address>,
    type_stats: HashMap<TransactionType, u64>,
    blooms: Vec<BloomFilter>,
}

pub struct ChainIndex {
    db_path: PathBuf,
    tables: RwLock<Tables>,
}

impl ChainIndex {
    /// Opens the index rooted at `db_path`, replaying every subset and type
    /// file found there.
    pub fn open(db_path: impl Into<PathBuf>, bloom_expected_items: usize) -> ChainResult<Self> {
        let db_path = db_path.into();
        fs::create_dir_all(&db_path)?;
        let mut tables = Tables {
            tx_index: HashMap::new(),
            chain_stats: HashMap::new(),
            last_index: HashMap::new(),
            type_stats: HashMap::new(),
            blooms: (0..SUBSET_COUNT)
                .map(|_| BloomFilter::with_rate(bloom_expected_items, 0.001))
                .collect(),
        };
        let index = {
            recover_subsets(&db_path, &mut tables)?;
            recover_last_addresses(&db_path, &mut tables)?;
            recover_type_counts(&db_path, &mut tables)?;
            Self {
                db_path,
                tables: RwLock::new(tables),
            }
        };
        Ok(index)
    }

    /// Records a newly appended transaction: one subset index record, one
    /// type index record, bloom and table updates. The offset assigned is
    /// the chain's total size before this transaction.
    pub fn add_tx(
        &self,
        address: &Address,
        genesis_address: &Address,
        tx_type: TransactionType,
        size: u32,
    ) -> ChainResult<u32> {
        let mut tables = self.tables.write();
        let stats = tables
            .chain_stats
            .get(genesis_address)
            .copied()
            .unwrap_or_default();
        let offset = stats.total_size;
        let total_size = stats.total_size.checked_add(size).ok_or_else(|| {
            ChainError::Storage(format!(
                "chain {genesis_address} exceeds the 4 GiB addressable size"
            ))
        })?;
        let tx_count = stats.tx_count + 1;

        let mut record = Vec::with_capacity(address.len() + genesis_address.len() + 8);
        record.extend_from_slice(address.as_bytes());
        record.extend_from_slice(genesis_address.as_bytes());
        record.extend_from_slice(&size.to_be_bytes());
        record.extend_from_slice(&offset.to_be_bytes());
        append_durable(&self.subset_file(address.subset()), &record)?;
        append_durable(&self.type_file(tx_type), address.as_bytes())?;

        tables.blooms[address.subset() as usize].insert(address.digest());
        tables.tx_index.insert(
            address.clone(),
            TxEntry {
                genesis_address: genesis_address.clone(),
                size,
                offset,
            },
        );
        tables
            .chain_stats
            .insert(genesis_address.clone(), ChainStats { total_size, tx_count });
        *tables.type_stats.entry(tx_type).or_insert(0) += 1;
        Ok(offset)
    }

    /// Looks up a transaction location. A miss in the in-memory table falls
    /// back to the subset bloom filter and, on a positive, a linear scan of
    /// the subset index file; bloom false positives end as `None`.
    pub fn get_tx_entry(&self, address: &Address) -> ChainResult<Option<TxEntry>> {
        {
            let tables = self.tables.read();
            if let Some(entry) = tables.tx_index.get(address) {
                return Ok(Some(entry.clone()));
            }
            if !tables.blooms[address.subset() as usize].contains(address.digest()) {
                return Ok(None);
            }
        }
        self.scan_subset_for(address)
    }

    /// Fast existence check: table membership or bloom positive. May report
    /// true spuriously; `get_tx_entry` is the authoritative answer.
    pub fn transaction_exists(&self, address: &Address) -> bool {
        let tables = self.tables.read();
        tables.tx_index.contains_key(address)
            || tables.blooms[address.subset() as usize].contains(address.digest())
    }

    /// Number of transactions on the chain `address` belongs to.
    pub fn chain_size(&self, address: &Address) -> u64 {
        let genesis = self.get_genesis_address(address);
        let tables = self.tables.read();
        tables
            .chain_stats
            .get(&genesis)
            .map(|stats| stats.tx_count as u64)
            .unwrap_or(0)
    }

    /// Genesis of the chain `address` belongs to; an unknown address is its
    /// own genesis.
    pub fn get_genesis_address(&self, address: &Address) -> Address {
        let tables = self.tables.read();
        tables
            .tx_index
            .get(address)
            .map(|entry| entry.genesis_address.clone())
            .unwrap_or_else(|| address.clone())
    }

    pub fn get_first_chain_address(&self, address: &Address) -> Address {
        self.get_genesis_address(address)
    }

    /// Appends a chain-addresses record and moves the chain head.
    pub fn set_last_chain_address(
        &self,
        previous_address: &Address,
        new_address: &Address,
        timestamp: u32,
    ) -> ChainResult<()> {
        let genesis = self.get_genesis_address(previous_address);
        let mut record = Vec::with_capacity(4 + new_address.len());
        record.extend_from_slice(&timestamp.to_be_bytes());
        record.extend_from_slice(new_address.as_bytes());
        append_durable(&self.addresses_file(&genesis), &record)?;
        self.tables
            .write()
            .last_index
            .insert(genesis, new_address.clone());
        Ok(())
    }

    /// Current head of the chain `address` belongs to. Falls back to a scan
    /// of the chain-addresses file, then to the queried address itself.
    pub fn get_last_chain_address(&self, address: &Address) -> ChainResult<Address> {
        let genesis = self.get_genesis_address(address);
        if let Some(last) = self.tables.read().last_index.get(&genesis) {
            return Ok(last.clone());
        }
        let mut last = None;
        for record in ChainAddressesIter::open(&self.addresses_file(&genesis)) {
            let (_, recorded) = record?;
            last = Some(recorded);
        }
        Ok(last.unwrap_or_else(|| address.clone()))
    }

    /// Head of the chain as of `until` (unix seconds): the recorded address
    /// with the greatest timestamp `<= until`, or the queried address when
    /// nothing qualifies.
    pub fn get_last_chain_address_until(
        &self,
        address: &Address,
        until: u32,
    ) -> ChainResult<Address> {
        let genesis = self.get_genesis_address(address);
        let mut best: Option<(u32, Address)> = None;
        for record in ChainAddressesIter::open(&self.addresses_file(&genesis)) {
            let (timestamp, recorded) = record?;
            if timestamp == until {
                return Ok(recorded);
            }
            if timestamp < until && best.as_ref().map(|(ts, _)| timestamp >= *ts).unwrap_or(true) {
                best = Some((timestamp, recorded));
            }
        }
        Ok(best
            .map(|(_, recorded)| recorded)
            .unwrap_or_else(|| address.clone()))
    }

    /// Appends a chain-keys record for a key rotation.
    pub fn set_public_key(
        &self,
        genesis_address: &Address,
        public_key: &PublicKey,
        timestamp: u32,
    ) -> ChainResult<()> {
        let mut record = Vec::with_capacity(4 + public_key.len());
        record.extend_from_slice(&timestamp.to_be_bytes());
        record.extend_from_slice(public_key.as_bytes());
        append_durable(&self.keys_file(genesis_address), &record)
    }

    /// First key recorded for the chain the given key belongs to; the key
    /// itself when its chain is unknown.
    pub fn get_first_public_key(&self, public_key: &PublicKey) -> ChainResult<PublicKey> {
        let address = Address::from_public_key(HashAlgorithm::Sha256, public_key);
        let genesis = self.get_genesis_address(&address);
        let path = self.keys_file(&genesis);
        if !path.exists() {
            return Ok(public_key.clone());
        }
        let bytes = fs::read(&path)?;
        let mut reader = ByteReader::new(&bytes);
        if reader.is_empty() {
            return Ok(public_key.clone());
        }
        let _timestamp = reader.read_u32()?;
        PublicKey::read_from(&mut reader)
    }

    /// Lazy sequence over the addresses recorded for a transaction type.
    pub fn list_addresses_by_type(&self, tx_type: TransactionType) -> TypeAddressIter {
        TypeAddressIter::open(&self.type_file(tx_type))
    }

    pub fn count_transactions_by_type(&self, tx_type: TransactionType) -> u64 {
        self.tables
            .read()
            .type_stats
            .get(&tx_type)
            .copied()
            .unwrap_or(0)
    }

    /// Known genesis addresses, in unspecified order.
    pub fn list_genesis_addresses(&self) -> Vec<Address> {
        self.tables.read().chain_stats.keys().cloned().collect()
    }

    /// Lazy sequence over every recorded chain address, per genesis.
    pub fn list_all_addresses(&self) -> impl Iterator<Item = ChainResult<Address>> + '_ {
        let genesis_addresses = self.list_genesis_addresses();
        genesis_addresses.into_iter().flat_map(move |genesis| {
            ChainAddressesIter::open(&self.addresses_file(&genesis))
                .map(|record| record.map(|(_, address)| address))
                .collect::<Vec<_>>()
        })
    }

    fn scan_subset_for(&self, address: &Address) -> ChainResult<Option<TxEntry>> {
        let path = self.subset_file(address.subset());
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let mut reader = ByteReader::new(&bytes);
        loop {
            match read_subset_record(&mut reader) {
                Ok(Some(record)) if record.address == *address => {
                    return Ok(Some(record.entry));
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Ok(None),
                Err(err) if is_truncation(&err) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }

    fn subset_file(&self, subset: u8) -> PathBuf {
        self.db_path.join(format!("{}-summary", hex::encode([subset])))
    }

    fn addresses_file(&self, genesis: &Address) -> PathBuf {
        self.db_path.join(format!("{}-addresses", genesis.to_hex()))
    }

    fn keys_file(&self, genesis: &Address) -> PathBuf {
        self.db_path.join(format!("{}-keys", genesis.to_hex()))
    }

    fn type_file(&self, tx_type: TransactionType) -> PathBuf {
        self.db_path.join(tx_type.name())
    }
}

struct SubsetRecord {
    address: Address,
    entry: TxEntry,
}

fn read_subset_record(reader: &mut ByteReader<'_>) -> ChainResult<Option<SubsetRecord>> {
    if reader.is_empty() {
        return Ok(None);
    }
    let address = Address::read_from(reader)?;
    let genesis_address = Address::read_from(reader)?;
    let size = reader.read_u32()?;
    let offset = reader.read_u32()?;
    Ok(Some(SubsetRecord {
        address,
        entry: TxEntry {
            genesis_address,
            size,
            offset,
        },
    }))
}

fn recover_subsets(db_path: &Path, tables: &mut Tables) -> ChainResult<()> {
    for subset in 0..SUBSET_COUNT {
        let path = db_path.join(format!("{}-summary", hex::encode([subset as u8])));
        if !path.exists() {
            continue;
        }
        let bytes = fs::read(&path)?;
        let mut reader = ByteReader::new(&bytes);
        let mut valid_len = 0usize;
        let mut records = 0usize;
        loop {
            match read_subset_record(&mut reader) {
                Ok(Some(record)) => {
                    valid_len = reader.position();
                    records += 1;
                    tables.blooms[subset].insert(record.address.digest());
                    let stats = tables
                        .chain_stats
                        .entry(record.entry.genesis_address.clone())
                        .or_default();
                    stats.total_size = stats
                        .total_size
                        .checked_add(record.entry.size)
                        .ok_or_else(|| {
                            ChainError::Storage(format!(
                                "chain {} exceeds the 4 GiB addressable size",
                                record.entry.genesis_address
                            ))
                        })?;
                    stats.tx_count += 1;
                    tables.tx_index.insert(record.address, record.entry);
                }
                Ok(None) => break,
                Err(err) if is_truncation(&err) => {
                    warn!(
                        subset,
                        dropped = bytes.len() - valid_len,
                        "dropping partial trailing record from subset index"
                    );
                    let file = OpenOptions::new().write(true).open(&path)?;
                    file.set_len(valid_len as u64)?;
                    file.sync_data()?;
                    break;
                }
                Err(err) => {
                    return Err(ChainError::Storage(format!(
                        "subset index {} is corrupted: {err}",
                        path.display()
                    )));
                }
            }
        }
        if records > 0 {
            debug!(subset, records, "recovered subset index");
        }
    }
    Ok(())
}

fn recover_last_addresses(db_path: &Path, tables: &mut Tables) -> ChainResult<()> {
    let genesis_addresses: Vec<Address> = tables.chain_stats.keys().cloned().collect();
    for genesis in genesis_addresses {
        let path = db_path.join(format!("{}-addresses", genesis.to_hex()));
        let mut last = None;
        for record in ChainAddressesIter::open(&path) {
            let (_, address) = record?;
            last = Some(address);
        }
        if let Some(address) = last {
            tables.last_index.insert(genesis, address);
        }
    }
    Ok(())
}

fn recover_type_counts(db_path: &Path, tables: &mut Tables) -> ChainResult<()> {
    for tx_type in TransactionType::all() {
        let path = db_path.join(tx_type.name());
        if !path.exists() {
            continue;
        }
        let mut count = 0u64;
        for record in TypeAddressIter::open(&path) {
            record?;
            count += 1;
        }
        if count > 0 {
            tables.type_stats.insert(tx_type, count);
        }
    }
    Ok(())
}

fn append_durable(path: &Path, record: &[u8]) -> ChainResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(record)?;
    file.sync_data()?;
    Ok(())
}

/// Streaming reader over a `<unix_ts:u32><address>` record file. A clean or
/// mid-record end of file terminates the sequence.
pub struct ChainAddressesIter {
    reader: Option<BufReader<File>>,
}

impl ChainAddressesIter {
    fn open(path: &Path) -> Self {
        let reader = File::open(path).ok().map(BufReader::new);
        Self { reader }
    }
}

impl Iterator for ChainAddressesIter {
    type Item = ChainResult<(u32, Address)>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let mut ts_bytes = [0u8; 4];
        if !read_exact_or_end(reader, &mut ts_bytes) {
            self.reader = None;
            return None;
        }
        match read_address_io(reader) {
            Some(address) => Some(Ok((u32::from_be_bytes(ts_bytes), address))),
            None => {
                self.reader = None;
                None
            }
        }
    }
}

/// Streaming reader over an address-only record file.
pub struct TypeAddressIter {
    reader: Option<BufReader<File>>,
}

impl TypeAddressIter {
    fn open(path: &Path) -> Self {
        let reader = File::open(path).ok().map(BufReader::new);
        Self { reader }
    }
}

impl Iterator for TypeAddressIter {
    type Item = ChainResult<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        match read_address_io(reader) {
            Some(address) => Some(Ok(address)),
            None => {
                self.reader = None;
                None
            }
        }
    }
}

fn read_exact_or_end(reader: &mut BufReader<File>, buf: &mut [u8]) -> bool {
    match reader.read_exact(buf) {
        Ok(()) => true,
        Err(_) => false,
    }
}

fn read_address_io(reader: &mut BufReader<File>) -> Option<Address> {
    let mut header = [0u8; 2];
    if !read_exact_or_end(reader, &mut header) {
        return None;
    }
    let algorithm = HashAlgorithm::from_id(header[1]).ok()?;
    let mut digest = vec![0u8; algorithm.digest_size()];
    if !read_exact_or_end(reader, &mut digest) {
        return None;
    }
    let mut bytes = Vec::with_capacity(2 + digest.len());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&digest);
    Address::from_bytes(bytes).ok()
}
