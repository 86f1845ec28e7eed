use serde::{Deserialize, Serialize};

use crate::crypto::{Address, NodeKeys, PublicKey};
use crate::encoding::{put_var_bytes, ByteReader};
use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Uco,
    Token { token_address: Address, token_id: u32 },
}

/// A funds movement settled by the transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMovement {
    pub to: Address,
    pub amount: u64,
    pub movement_type: MovementType,
}

/// An output spendable by a chain, as gathered from storage replicas and as
/// produced by the validation stamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub from: Address,
    pub amount: u64,
    pub output_type: MovementType,
}

/// Reward movement to a validation node, settled out of the fee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMovement {
    pub to: PublicKey,
    pub amount: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOperations {
    pub fee: u64,
    pub transaction_movements: Vec<TransactionMovement>,
    pub unspent_outputs: Vec<UnspentOutput>,
    pub node_movements: Vec<NodeMovement>,
}

impl LedgerOperations {
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.fee.to_be_bytes());
        buf.extend_from_slice(&(self.transaction_movements.len() as u32).to_be_bytes());
        for movement in &self.transaction_movements {
            buf.extend_from_slice(movement.to.as_bytes());
            buf.extend_from_slice(&movement.amount.to_be_bytes());
            write_movement_type(buf, &movement.movement_type);
        }
        buf.extend_from_slice(&(self.unspent_outputs.len() as u32).to_be_bytes());
        for output in &self.unspent_outputs {
            buf.extend_from_slice(output.from.as_bytes());
            buf.extend_from_slice(&output.amount.to_be_bytes());
            write_movement_type(buf, &output.output_type);
        }
        buf.extend_from_slice(&(self.node_movements.len() as u32).to_be_bytes());
        for movement in &self.node_movements {
            buf.extend_from_slice(movement.to.as_bytes());
            buf.extend_from_slice(&movement.amount.to_be_bytes());
        }
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let fee = reader.read_u64()?;
        let movement_count = reader.read_u32()? as usize;
        let mut transaction_movements = Vec::with_capacity(movement_count);
        for _ in 0..movement_count {
            let to = Address::read_from(reader)?;
            let amount = reader.read_u64()?;
            let movement_type = read_movement_type(reader)?;
            transaction_movements.push(TransactionMovement {
                to,
                amount,
                movement_type,
            });
        }
        let output_count = reader.read_u32()? as usize;
        let mut unspent_outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let from = Address::read_from(reader)?;
            let amount = reader.read_u64()?;
            let output_type = read_movement_type(reader)?;
            unspent_outputs.push(UnspentOutput {
                from,
                amount,
                output_type,
            });
        }
        let node_movement_count = reader.read_u32()? as usize;
        let mut node_movements = Vec::with_capacity(node_movement_count);
        for _ in 0..node_movement_count {
            let to = PublicKey::read_from(reader)?;
            let amount = reader.read_u64()?;
            node_movements.push(NodeMovement { to, amount });
        }
        Ok(Self {
            fee,
            transaction_movements,
            unspent_outputs,
            node_movements,
        })
    }
}

fn write_movement_type(buf: &mut Vec<u8>, movement_type: &MovementType) {
    match movement_type {
        MovementType::Uco => buf.push(0),
        MovementType::Token {
            token_address,
            token_id,
        } => {
            buf.push(1);
            buf.extend_from_slice(token_address.as_bytes());
            buf.extend_from_slice(&token_id.to_be_bytes());
        }
    }
}

fn read_movement_type(reader: &mut ByteReader<'_>) -> ChainResult<MovementType> {
    match reader.read_u8()? {
        0 => Ok(MovementType::Uco),
        1 => {
            let token_address = Address::read_from(reader)?;
            let token_id = reader.read_u32()?;
            Ok(MovementType::Token {
                token_address,
                token_id,
            })
        }
        other => Err(ChainError::Encoding(format!("unknown movement type {other}"))),
    }
}

/// Coordinator-signed attestation of a transaction's validity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationStamp {
    /// Unix milliseconds at stamp creation.
    pub timestamp: u64,
    /// Key that verified the origin signature, or the null key when the
    /// search failed.
    pub proof_of_work: PublicKey,
    pub proof_of_integrity: Vec<u8>,
    pub proof_of_election: Vec<u8>,
    pub ledger_operations: LedgerOperations,
    pub signature: Vec<u8>,
}

impl ValidationStamp {
    /// Bytes covered by the coordinator's signature and by every
    /// cross-validation stamp.
    pub fn payload_for_signature(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(self.proof_of_work.as_bytes());
        put_var_bytes(&mut buf, &self.proof_of_integrity);
        put_var_bytes(&mut buf, &self.proof_of_election);
        self.ledger_operations.write(&mut buf);
        buf
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.payload_for_signature());
        put_var_bytes(buf, &self.signature);
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let timestamp = reader.read_u64()?;
        let proof_of_work = PublicKey::read_from(reader)?;
        let proof_of_integrity = reader.read_var_bytes()?;
        let proof_of_election = reader.read_var_bytes()?;
        let ledger_operations = LedgerOperations::read_from(reader)?;
        let signature = reader.read_var_bytes()?;
        Ok(Self {
            timestamp,
            proof_of_work,
            proof_of_integrity,
            proof_of_election,
            ledger_operations,
            signature,
        })
    }

    pub fn verify_signature(&self, coordinator_key: &PublicKey) -> bool {
        coordinator_key.verifies(&self.payload_for_signature(), &self.signature)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inconsistency {
    Signature,
    ProofOfWork,
    ProofOfIntegrity,
    ProofOfElection,
    TransactionFee,
    TransactionMovements,
    UnspentOutputs,
    NodeMovements,
    Timestamp,
}

impl Inconsistency {
    pub fn from_id(id: u8) -> ChainResult<Self> {
        match id {
            0 => Ok(Inconsistency::Signature),
            1 => Ok(Inconsistency::ProofOfWork),
            2 => Ok(Inconsistency::ProofOfIntegrity),
            3 => Ok(Inconsistency::ProofOfElection),
            4 => Ok(Inconsistency::TransactionFee),
            5 => Ok(Inconsistency::TransactionMovements),
            6 => Ok(Inconsistency::UnspentOutputs),
            7 => Ok(Inconsistency::NodeMovements),
            8 => Ok(Inconsistency::Timestamp),
            other => Err(ChainError::Encoding(format!("unknown inconsistency id {other}"))),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Inconsistency::Signature => 0,
            Inconsistency::ProofOfWork => 1,
            Inconsistency::ProofOfIntegrity => 2,
            Inconsistency::ProofOfElection => 3,
            Inconsistency::TransactionFee => 4,
            Inconsistency::TransactionMovements => 5,
            Inconsistency::UnspentOutputs => 6,
            Inconsistency::NodeMovements => 7,
            Inconsistency::Timestamp => 8,
        }
    }
}

/// A cross-validator's signed agreement, or disagreement, with a validation
/// stamp. An empty inconsistency list is an affirmative vote.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationStamp {
    pub node_public_key: PublicKey,
    pub signature: Vec<u8>,
    pub inconsistencies: Vec<Inconsistency>,
}

impl CrossValidationStamp {
    pub fn sign(keys: &NodeKeys, stamp: &ValidationStamp, inconsistencies: Vec<Inconsistency>) -> Self {
        let payload = Self::payload(stamp, &inconsistencies);
        Self {
            node_public_key: keys.public_key().clone(),
            signature: keys.sign(&payload),
            inconsistencies,
        }
    }

    pub fn verify(&self, stamp: &ValidationStamp) -> bool {
        let payload = Self::payload(stamp, &self.inconsistencies);
        self.node_public_key.verifies(&payload, &self.signature)
    }

    fn payload(stamp: &ValidationStamp, inconsistencies: &[Inconsistency]) -> Vec<u8> {
        let mut buf = stamp.payload_for_signature();
        buf.push(inconsistencies.len() as u8);
        for inconsistency in inconsistencies {
            buf.push(inconsistency.id());
        }
        buf
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.node_public_key.as_bytes());
        put_var_bytes(buf, &self.signature);
        buf.push(self.inconsistencies.len() as u8);
        for inconsistency in &self.inconsistencies {
            buf.push(inconsistency.id());
        }
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let node_public_key = PublicKey::read_from(reader)?;
        let signature = reader.read_var_bytes()?;
        let count = reader.read_u8()? as usize;
        let mut inconsistencies = Vec::with_capacity(count);
        for _ in 0..count {
            inconsistencies.push(Inconsistency::from_id(reader.read_u8()?)?);
        }
        Ok(Self {
            node_public_key,
            signature,
            inconsistencies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HashAlgorithm;

    fn sample_address(byte: u8) -> Address {
        let mut bytes = vec![0u8, HashAlgorithm::Sha256.id()];
        bytes.extend_from_slice(&[byte; 32]);
        Address::from_bytes(bytes).unwrap()
    }

    fn sample_stamp() -> ValidationStamp {
        ValidationStamp {
            timestamp: 1_700_000_000_000,
            proof_of_work: PublicKey::null(),
            proof_of_integrity: vec![7u8; 32],
            proof_of_election: vec![9u8; 32],
            ledger_operations: LedgerOperations {
                fee: 42,
                transaction_movements: vec![TransactionMovement {
                    to: sample_address(0x21),
                    amount: 1_000,
                    movement_type: MovementType::Uco,
                }],
                unspent_outputs: vec![UnspentOutput {
                    from: sample_address(0x22),
                    amount: 5_000,
                    output_type: MovementType::Uco,
                }],
                node_movements: Vec::new(),
            },
            signature: vec![3u8; 64],
        }
    }

    #[test]
    fn validation_stamp_round_trip() {
        let stamp = sample_stamp();
        let mut buf = Vec::new();
        stamp.write(&mut buf);
        let mut reader = ByteReader::new(&buf);
        let decoded = ValidationStamp::read_from(&mut reader).unwrap();
        assert_eq!(decoded, stamp);
        assert!(reader.is_empty());
    }

    #[test]
    fn cross_validation_stamp_signs_over_inconsistencies() {
        let keys = NodeKeys::generate();
        let stamp = sample_stamp();
        let affirmative = CrossValidationStamp::sign(&keys, &stamp, Vec::new());
        assert!(affirmative.verify(&stamp));

        let mut tampered = affirmative.clone();
        tampered.inconsistencies = vec![Inconsistency::ProofOfWork];
        assert!(!tampered.verify(&stamp));
    }

    #[test]
    fn cross_validation_stamp_round_trip() {
        let keys = NodeKeys::generate();
        let stamp = sample_stamp();
        let cross =
            CrossValidationStamp::sign(&keys, &stamp, vec![Inconsistency::Timestamp]);
        let mut buf = Vec::new();
        cross.write(&mut buf);
        let mut reader = ByteReader::new(&buf);
        let decoded = CrossValidationStamp::read_from(&mut reader).unwrap();
        assert_eq!(decoded, cross);
    }
}
