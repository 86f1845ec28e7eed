use serde::{Deserialize, Serialize};

use crate::crypto::{Address, PublicKey};
use crate::encoding::{put_var_bytes, ByteReader};
use crate::errors::{ChainError, ChainResult};
use crate::types::stamps::{CrossValidationStamp, ValidationStamp};

pub const TRANSACTION_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Transfer,
    Token,
    Data,
    Hosting,
    Node,
    NodeSharedSecrets,
    CodeProposal,
    CodeApproval,
    Beacon,
    BeaconSummary,
}

impl TransactionType {
    pub fn from_id(id: u8) -> ChainResult<Self> {
        match id {
            0 => Ok(TransactionType::Transfer),
            1 => Ok(TransactionType::Token),
            2 => Ok(TransactionType::Data),
            3 => Ok(TransactionType::Hosting),
            4 => Ok(TransactionType::Node),
            5 => Ok(TransactionType::NodeSharedSecrets),
            6 => Ok(TransactionType::CodeProposal),
            7 => Ok(TransactionType::CodeApproval),
            8 => Ok(TransactionType::Beacon),
            9 => Ok(TransactionType::BeaconSummary),
            other => Err(ChainError::Encoding(format!("unknown transaction type id {other}"))),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            TransactionType::Transfer => 0,
            TransactionType::Token => 1,
            TransactionType::Data => 2,
            TransactionType::Hosting => 3,
            TransactionType::Node => 4,
            TransactionType::NodeSharedSecrets => 5,
            TransactionType::CodeProposal => 6,
            TransactionType::CodeApproval => 7,
            TransactionType::Beacon => 8,
            TransactionType::BeaconSummary => 9,
        }
    }

    /// File-name stem of the per-type address index.
    pub fn name(self) -> &'static str {
        match self {
            TransactionType::Transfer => "transfer",
            TransactionType::Token => "token",
            TransactionType::Data => "data",
            TransactionType::Hosting => "hosting",
            TransactionType::Node => "node",
            TransactionType::NodeSharedSecrets => "node_shared_secrets",
            TransactionType::CodeProposal => "code_proposal",
            TransactionType::CodeApproval => "code_approval",
            TransactionType::Beacon => "beacon",
            TransactionType::BeaconSummary => "beacon_summary",
        }
    }

    pub fn all() -> [TransactionType; 10] {
        [
            TransactionType::Transfer,
            TransactionType::Token,
            TransactionType::Data,
            TransactionType::Hosting,
            TransactionType::Node,
            TransactionType::NodeSharedSecrets,
            TransactionType::CodeProposal,
            TransactionType::CodeApproval,
            TransactionType::Beacon,
            TransactionType::BeaconSummary,
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UcoTransfer {
    pub to: Address,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub to: Address,
    pub token_address: Address,
    pub token_id: u32,
    pub amount: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub uco_transfers: Vec<UcoTransfer>,
    pub token_transfers: Vec<TokenTransfer>,
}

impl Ledger {
    pub fn is_empty(&self) -> bool {
        self.uco_transfers.is_empty() && self.token_transfers.is_empty()
    }
}

/// An encrypted secret with the keys authorized to decrypt it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub secret: Vec<u8>,
    pub authorized_keys: Vec<(PublicKey, Vec<u8>)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    pub content: Vec<u8>,
    pub code: String,
    pub ledger: Ledger,
    pub ownerships: Vec<Ownership>,
    pub recipients: Vec<Address>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub address: Address,
    pub tx_type: TransactionType,
    pub data: TransactionData,
    pub previous_public_key: PublicKey,
    pub previous_signature: Vec<u8>,
    pub origin_signature: Vec<u8>,
    pub validation_stamp: Option<ValidationStamp>,
    pub cross_validation_stamps: Vec<CrossValidationStamp>,
}

impl Transaction {
    /// Address of the previous transaction in the chain (the genesis address
    /// for a chain's first transaction).
    pub fn previous_address(&self) -> Address {
        Address::from_public_key(self.address.hash_algorithm(), &self.previous_public_key)
    }

    /// Bytes covered by `previous_signature`.
    pub fn payload_for_previous_signature(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(TRANSACTION_VERSION);
        buf.extend_from_slice(self.address.as_bytes());
        buf.push(self.tx_type.id());
        write_data(&mut buf, &self.data);
        buf
    }

    /// Bytes covered by `origin_signature`.
    pub fn payload_for_origin_signature(&self) -> Vec<u8> {
        let mut buf = self.payload_for_previous_signature();
        buf.extend_from_slice(self.previous_public_key.as_bytes());
        put_var_bytes(&mut buf, &self.previous_signature);
        buf
    }

    /// Full self-describing encoding, the on-disk chain record.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.payload_for_origin_signature();
        put_var_bytes(&mut buf, &self.origin_signature);
        match &self.validation_stamp {
            Some(stamp) => {
                buf.push(1);
                stamp.write(&mut buf);
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&(self.cross_validation_stamps.len() as u32).to_be_bytes());
        for stamp in &self.cross_validation_stamps {
            stamp.write(&mut buf);
        }
        buf
    }

    pub fn serialized_size(&self) -> u32 {
        self.serialize().len() as u32
    }

    pub fn deserialize(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let version = reader.read_u8()?;
        if version != TRANSACTION_VERSION {
            return Err(ChainError::Encoding(format!(
                "unsupported transaction version {version}"
            )));
        }
        let address = Address::read_from(reader)?;
        let tx_type = TransactionType::from_id(reader.read_u8()?)?;
        let data = read_data(reader)?;
        let previous_public_key = PublicKey::read_from(reader)?;
        let previous_signature = reader.read_var_bytes()?;
        let origin_signature = reader.read_var_bytes()?;
        let validation_stamp = match reader.read_u8()? {
            0 => None,
            1 => Some(ValidationStamp::read_from(reader)?),
            other => {
                return Err(ChainError::Encoding(format!(
                    "invalid validation stamp marker {other}"
                )))
            }
        };
        let stamp_count = reader.read_u32()? as usize;
        let mut cross_validation_stamps = Vec::with_capacity(stamp_count);
        for _ in 0..stamp_count {
            cross_validation_stamps.push(CrossValidationStamp::read_from(reader)?);
        }
        Ok(Self {
            address,
            tx_type,
            data,
            previous_public_key,
            previous_signature,
            origin_signature,
            validation_stamp,
            cross_validation_stamps,
        })
    }

    pub fn decode(bytes: &[u8]) -> ChainResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let transaction = Self::deserialize(&mut reader)?;
        if !reader.is_empty() {
            return Err(ChainError::Encoding(format!(
                "{} trailing bytes after transaction",
                reader.remaining()
            )));
        }
        Ok(transaction)
    }
}

fn write_data(buf: &mut Vec<u8>, data: &TransactionData) {
    put_var_bytes(buf, &data.content);
    put_var_bytes(buf, data.code.as_bytes());
    buf.extend_from_slice(&(data.ledger.uco_transfers.len() as u32).to_be_bytes());
    for transfer in &data.ledger.uco_transfers {
        buf.extend_from_slice(transfer.to.as_bytes());
        buf.extend_from_slice(&transfer.amount.to_be_bytes());
    }
    buf.extend_from_slice(&(data.ledger.token_transfers.len() as u32).to_be_bytes());
    for transfer in &data.ledger.token_transfers {
        buf.extend_from_slice(transfer.to.as_bytes());
        buf.extend_from_slice(transfer.token_address.as_bytes());
        buf.extend_from_slice(&transfer.token_id.to_be_bytes());
        buf.extend_from_slice(&transfer.amount.to_be_bytes());
    }
    buf.extend_from_slice(&(data.ownerships.len() as u32).to_be_bytes());
    for ownership in &data.ownerships {
        put_var_bytes(buf, &ownership.secret);
        buf.extend_from_slice(&(ownership.authorized_keys.len() as u32).to_be_bytes());
        for (public_key, encrypted_key) in &ownership.authorized_keys {
            buf.extend_from_slice(public_key.as_bytes());
            put_var_bytes(buf, encrypted_key);
        }
    }
    buf.extend_from_slice(&(data.recipients.len() as u32).to_be_bytes());
    for recipient in &data.recipients {
        buf.extend_from_slice(recipient.as_bytes());
    }
}

fn read_data(reader: &mut ByteReader<'_>) -> ChainResult<TransactionData> {
    let content = reader.read_var_bytes()?;
    let code = String::from_utf8(reader.read_var_bytes()?)
        .map_err(|err| ChainError::Encoding(format!("invalid code utf-8: {err}")))?;
    let uco_count = reader.read_u32()? as usize;
    let mut uco_transfers = Vec::with_capacity(uco_count);
    for _ in 0..uco_count {
        let to = Address::read_from(reader)?;
        let amount = reader.read_u64()?;
        uco_transfers.push(UcoTransfer { to, amount });
    }
    let token_count = reader.read_u32()? as usize;
    let mut token_transfers = Vec::with_capacity(token_count);
    for _ in 0..token_count {
        let to = Address::read_from(reader)?;
        let token_address = Address::read_from(reader)?;
        let token_id = reader.read_u32()?;
        let amount = reader.read_u64()?;
        token_transfers.push(TokenTransfer {
            to,
            token_address,
            token_id,
            amount,
        });
    }
    let ownership_count = reader.read_u32()? as usize;
    let mut ownerships = Vec::with_capacity(ownership_count);
    for _ in 0..ownership_count {
        let secret = reader.read_var_bytes()?;
        let key_count = reader.read_u32()? as usize;
        let mut authorized_keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let public_key = PublicKey::read_from(reader)?;
            let encrypted_key = reader.read_var_bytes()?;
            authorized_keys.push((public_key, encrypted_key));
        }
        ownerships.push(Ownership {
            secret,
            authorized_keys,
        });
    }
    let recipient_count = reader.read_u32()? as usize;
    let mut recipients = Vec::with_capacity(recipient_count);
    for _ in 0..recipient_count {
        recipients.push(Address::read_from(reader)?);
    }
    Ok(TransactionData {
        content,
        code,
        ledger: Ledger {
            uco_transfers,
            token_transfers,
        },
        ownerships,
        recipients,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{HashAlgorithm, NodeKeys};

    fn sample_address(byte: u8) -> Address {
        let mut bytes = vec![0u8, HashAlgorithm::Sha256.id()];
        bytes.extend_from_slice(&[byte; 32]);
        Address::from_bytes(bytes).unwrap()
    }

    #[test]
    fn chain_record_round_trip() {
        let keys = NodeKeys::generate();
        let transaction = Transaction {
            address: sample_address(0x11),
            tx_type: TransactionType::Transfer,
            data: TransactionData {
                content: b"hello chain".to_vec(),
                code: String::new(),
                ledger: Ledger {
                    uco_transfers: vec![UcoTransfer {
                        to: sample_address(0x22),
                        amount: 1_000,
                    }],
                    token_transfers: vec![TokenTransfer {
                        to: sample_address(0x33),
                        token_address: sample_address(0x44),
                        token_id: 0,
                        amount: 7,
                    }],
                },
                ownerships: vec![Ownership {
                    secret: vec![1, 2, 3],
                    authorized_keys: vec![(keys.public_key().clone(), vec![9u8; 16])],
                }],
                recipients: vec![sample_address(0x55)],
            },
            previous_public_key: keys.public_key().clone(),
            previous_signature: vec![4u8; 64],
            origin_signature: vec![5u8; 64],
            validation_stamp: None,
            cross_validation_stamps: Vec::new(),
        };

        let bytes = transaction.serialize();
        assert_eq!(bytes.len() as u32, transaction.serialized_size());
        let decoded = Transaction::decode(&bytes).unwrap();
        assert_eq!(decoded, transaction);
    }

    #[test]
    fn previous_address_is_the_hash_of_the_previous_key() {
        let keys = NodeKeys::generate();
        let transaction = Transaction {
            address: sample_address(0x11),
            tx_type: TransactionType::Data,
            data: TransactionData::default(),
            previous_public_key: keys.public_key().clone(),
            previous_signature: Vec::new(),
            origin_signature: Vec::new(),
            validation_stamp: None,
            cross_validation_stamps: Vec::new(),
        };
        let expected = Address::from_public_key(HashAlgorithm::Sha256, keys.public_key());
        assert_eq!(transaction.previous_address(), expected);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let keys = NodeKeys::generate();
        let transaction = Transaction {
            address: sample_address(0x11),
            tx_type: TransactionType::Data,
            data: TransactionData::default(),
            previous_public_key: keys.public_key().clone(),
            previous_signature: vec![4u8; 64],
            origin_signature: vec![5u8; 64],
            validation_stamp: None,
            cross_validation_stamps: Vec::new(),
        };
        let bytes = transaction.serialize();
        assert!(Transaction::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
