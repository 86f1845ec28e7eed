use serde::{Deserialize, Serialize};

use crate::crypto::{Address, PublicKey};
use crate::encoding::ByteReader;
use crate::errors::{ChainError, ChainResult};
use crate::types::transaction::{Transaction, TransactionType};

/// Compact digest of a validated transaction. Storage confirmations are
/// signed over its serialization rather than the full transaction to bound
/// message size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub address: Address,
    pub tx_type: TransactionType,
    pub timestamp: u64,
    pub fee: u64,
    pub movements_addresses: Vec<Address>,
}

impl TransactionSummary {
    /// Builds the summary of a stamped transaction. Fails when the
    /// transaction has not been through validation yet.
    pub fn from_transaction(transaction: &Transaction) -> ChainResult<Self> {
        let stamp = transaction.validation_stamp.as_ref().ok_or_else(|| {
            ChainError::Transaction("cannot summarize an unvalidated transaction".into())
        })?;
        let movements_addresses = stamp
            .ledger_operations
            .transaction_movements
            .iter()
            .map(|movement| movement.to.clone())
            .collect();
        Ok(Self {
            address: transaction.address.clone(),
            tx_type: transaction.tx_type,
            timestamp: stamp.timestamp,
            fee: stamp.ledger_operations.fee,
            movements_addresses,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.address.as_bytes());
        buf.push(self.tx_type.id());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.fee.to_be_bytes());
        buf.extend_from_slice(&(self.movements_addresses.len() as u32).to_be_bytes());
        for address in &self.movements_addresses {
            buf.extend_from_slice(address.as_bytes());
        }
        buf
    }

    pub fn deserialize(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let address = Address::read_from(reader)?;
        let tx_type = TransactionType::from_id(reader.read_u8()?)?;
        let timestamp = reader.read_u64()?;
        let fee = reader.read_u64()?;
        let count = reader.read_u32()? as usize;
        let mut movements_addresses = Vec::with_capacity(count);
        for _ in 0..count {
            movements_addresses.push(Address::read_from(reader)?);
        }
        Ok(Self {
            address,
            tx_type,
            timestamp,
            fee,
            movements_addresses,
        })
    }
}

/// Proof that a transaction reached its storage quorum: the summary plus the
/// signatures collected from the chain replicas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationAttestation {
    pub transaction_summary: TransactionSummary,
    /// `(replica index in the elected chain-storage set, signature over the
    /// serialized summary)`.
    pub confirmations: Vec<(u16, Vec<u8>)>,
}

impl ReplicationAttestation {
    /// Checks every confirmation signature against the replica set the
    /// caller elected for the summarized address.
    pub fn verify(&self, replica_keys: &[PublicKey]) -> bool {
        let payload = self.transaction_summary.serialize();
        self.confirmations.iter().all(|(index, signature)| {
            replica_keys
                .get(*index as usize)
                .map(|key| key.verifies(&payload, signature))
                .unwrap_or(false)
        })
    }
}
