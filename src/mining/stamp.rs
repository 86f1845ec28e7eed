//! Validation stamp construction and the cross-validation checks that
//! compare a received stamp against a locally recomputed one. Every
//! component is a deterministic function of the transaction and the fetched
//! context, so agreeing validators produce identical stamps.

use sha2::{Digest, Sha256};

use crate::crypto::{NodeKeys, PublicKey};
use crate::election::Election;
use crate::encoding::put_var_bytes;
use crate::mining::context::ValidationContext;
use crate::types::{
    Inconsistency, LedgerOperations, MovementType, NodeMovement, Transaction, TransactionMovement,
    UnspentOutput, ValidationStamp,
};

/// Flat fee floor, in the smallest currency unit.
pub const BASE_FEE: u64 = 1_000_000;
pub const FEE_PER_MOVEMENT: u64 = 100_000;
pub const FEE_PER_CONTENT_KILOBYTE: u64 = 10_000;

pub fn create_validation_stamp(
    context: &ValidationContext,
    coordinator_keys: &NodeKeys,
    election: &dyn Election,
    origin_keys: &[PublicKey],
    timestamp: u64,
) -> ValidationStamp {
    let transaction = &context.transaction;
    let ledger_operations = build_ledger_operations(context);
    let mut stamp = ValidationStamp {
        timestamp,
        proof_of_work: proof_of_work(transaction, origin_keys),
        proof_of_integrity: proof_of_integrity(
            transaction,
            context.previous_transaction.as_ref(),
        ),
        proof_of_election: election.election_proof(&transaction.address, timestamp),
        ledger_operations,
        signature: Vec::new(),
    };
    stamp.signature = coordinator_keys.sign(&stamp.payload_for_signature());
    stamp
}

/// Recomputes every stamp component and reports the mismatches. An empty
/// list is an affirmative cross-validation.
pub fn validate_stamp(
    context: &ValidationContext,
    stamp: &ValidationStamp,
    election: &dyn Election,
    origin_keys: &[PublicKey],
    coordinator_key: &PublicKey,
    now: u64,
    timestamp_tolerance_ms: u64,
) -> Vec<Inconsistency> {
    let transaction = &context.transaction;
    let mut inconsistencies = Vec::new();

    if !stamp.verify_signature(coordinator_key) {
        inconsistencies.push(Inconsistency::Signature);
    }
    if stamp.proof_of_work != proof_of_work(transaction, origin_keys) {
        inconsistencies.push(Inconsistency::ProofOfWork);
    }
    if stamp.proof_of_integrity
        != proof_of_integrity(transaction, context.previous_transaction.as_ref())
    {
        inconsistencies.push(Inconsistency::ProofOfIntegrity);
    }
    if stamp.proof_of_election != election.election_proof(&transaction.address, stamp.timestamp) {
        inconsistencies.push(Inconsistency::ProofOfElection);
    }

    let expected = build_ledger_operations(context);
    if stamp.ledger_operations.fee != expected.fee {
        inconsistencies.push(Inconsistency::TransactionFee);
    }
    if stamp.ledger_operations.transaction_movements != expected.transaction_movements {
        inconsistencies.push(Inconsistency::TransactionMovements);
    }
    if stamp.ledger_operations.unspent_outputs != expected.unspent_outputs {
        inconsistencies.push(Inconsistency::UnspentOutputs);
    }
    if stamp.ledger_operations.node_movements != node_movements(expected.fee, context) {
        inconsistencies.push(Inconsistency::NodeMovements);
    }
    if now.abs_diff(stamp.timestamp) > timestamp_tolerance_ms {
        inconsistencies.push(Inconsistency::Timestamp);
    }

    inconsistencies
}

fn build_ledger_operations(context: &ValidationContext) -> LedgerOperations {
    let transaction = &context.transaction;
    let fee = fee(transaction);
    let transaction_movements = movements(transaction);
    let unspent_outputs = resulting_unspent_outputs(
        transaction,
        &context.unspent_outputs,
        fee,
        &transaction_movements,
    );
    LedgerOperations {
        fee,
        transaction_movements,
        unspent_outputs,
        node_movements: node_movements(fee, context),
    }
}

/// Deterministic fee: a flat floor plus per-movement and per-kilobyte
/// components.
pub fn fee(transaction: &Transaction) -> u64 {
    let movement_count = (transaction.data.ledger.uco_transfers.len()
        + transaction.data.ledger.token_transfers.len()) as u64;
    let content_kilobytes = transaction.data.content.len() as u64 / 1_024;
    BASE_FEE + movement_count * FEE_PER_MOVEMENT + content_kilobytes * FEE_PER_CONTENT_KILOBYTE
}

pub fn movements(transaction: &Transaction) -> Vec<TransactionMovement> {
    let mut movements = Vec::new();
    for transfer in &transaction.data.ledger.uco_transfers {
        movements.push(TransactionMovement {
            to: transfer.to.clone(),
            amount: transfer.amount,
            movement_type: MovementType::Uco,
        });
    }
    for transfer in &transaction.data.ledger.token_transfers {
        movements.push(TransactionMovement {
            to: transfer.to.clone(),
            amount: transfer.amount,
            movement_type: MovementType::Token {
                token_address: transfer.token_address.clone(),
                token_id: transfer.token_id,
            },
        });
    }
    movements
}

/// New output set for the chain: the UCO change left after settling the
/// movements and the fee, plus the token outputs carried over.
fn resulting_unspent_outputs(
    transaction: &Transaction,
    consumed: &[UnspentOutput],
    fee: u64,
    movements: &[TransactionMovement],
) -> Vec<UnspentOutput> {
    let uco_in: u64 = consumed
        .iter()
        .filter(|output| output.output_type == MovementType::Uco)
        .map(|output| output.amount)
        .sum();
    let uco_out: u64 = movements
        .iter()
        .filter(|movement| movement.movement_type == MovementType::Uco)
        .map(|movement| movement.amount)
        .sum();
    let change = uco_in.saturating_sub(uco_out).saturating_sub(fee);

    let mut outputs = Vec::new();
    if change > 0 {
        outputs.push(UnspentOutput {
            from: transaction.address.clone(),
            amount: change,
            output_type: MovementType::Uco,
        });
    }
    outputs.extend(
        consumed
            .iter()
            .filter(|output| output.output_type != MovementType::Uco)
            .cloned(),
    );
    outputs
}

/// The fee split equally across the validators that worked the transaction.
pub fn node_movements(fee: u64, context: &ValidationContext) -> Vec<NodeMovement> {
    let validators = context.validation_nodes.len() as u64;
    if validators == 0 {
        return Vec::new();
    }
    let reward = fee / validators;
    context
        .validation_nodes
        .iter()
        .map(|peer| NodeMovement {
            to: peer.last_public_key.clone(),
            amount: reward,
        })
        .collect()
}

/// First known origin key whose signature check passes, or the null key when
/// the search fails (flagged by cross-validation).
pub fn proof_of_work(transaction: &Transaction, origin_keys: &[PublicKey]) -> PublicKey {
    let payload = transaction.payload_for_origin_signature();
    origin_keys
        .iter()
        .find(|key| key.verifies(&payload, &transaction.origin_signature))
        .cloned()
        .unwrap_or_else(PublicKey::null)
}

/// Hash chain over the pending transaction and the previous transaction's
/// proof of integrity.
pub fn proof_of_integrity(
    transaction: &Transaction,
    previous_transaction: Option<&Transaction>,
) -> Vec<u8> {
    let mut payload = transaction.payload_for_origin_signature();
    put_var_bytes(&mut payload, &transaction.origin_signature);
    let mut hasher = Sha256::new();
    hasher.update(&payload);
    if let Some(previous) = previous_transaction {
        if let Some(stamp) = &previous.validation_stamp {
            hasher.update(&stamp.proof_of_integrity);
        }
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Address, HashAlgorithm};
    use crate::election::HashElection;
    use crate::types::{Ledger, Peer, TransactionData, TransactionType, UcoTransfer};
    use std::net::{IpAddr, Ipv4Addr};

    fn address(byte: u8) -> Address {
        let mut bytes = vec![0u8, HashAlgorithm::Sha256.id()];
        bytes.extend_from_slice(&[byte; 32]);
        Address::from_bytes(bytes).unwrap()
    }

    fn peer(port: u16) -> Peer {
        let keys = NodeKeys::generate();
        Peer::new(
            keys.public_key().clone(),
            keys.public_key().clone(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        )
    }

    fn signed_transaction(origin: &NodeKeys) -> Transaction {
        let previous = NodeKeys::generate();
        let mut transaction = Transaction {
            address: address(0x11),
            tx_type: TransactionType::Transfer,
            data: TransactionData {
                ledger: Ledger {
                    uco_transfers: vec![UcoTransfer {
                        to: address(0x22),
                        amount: 2_000_000,
                    }],
                    token_transfers: Vec::new(),
                },
                ..TransactionData::default()
            },
            previous_public_key: previous.public_key().clone(),
            previous_signature: Vec::new(),
            origin_signature: Vec::new(),
            validation_stamp: None,
            cross_validation_stamps: Vec::new(),
        };
        transaction.previous_signature =
            previous.sign(&transaction.payload_for_previous_signature());
        transaction.origin_signature = origin.sign(&transaction.payload_for_origin_signature());
        transaction
    }

    fn context_for(transaction: Transaction) -> ValidationContext {
        ValidationContext::new(transaction, peer(8_000), vec![peer(9_000), peer(9_001)])
    }

    #[test]
    fn proof_of_work_finds_the_origin_key() {
        let origin = NodeKeys::generate();
        let other = NodeKeys::generate();
        let transaction = signed_transaction(&origin);

        let found = proof_of_work(
            &transaction,
            &[other.public_key().clone(), origin.public_key().clone()],
        );
        assert_eq!(&found, origin.public_key());

        let missed = proof_of_work(&transaction, &[other.public_key().clone()]);
        assert_eq!(missed, PublicKey::null());
    }

    #[test]
    fn stamp_validates_cleanly_against_its_own_context() {
        let origin = NodeKeys::generate();
        let coordinator = NodeKeys::generate();
        let election = HashElection::default();
        let transaction = signed_transaction(&origin);
        let mut context = context_for(transaction);
        context.unspent_outputs = vec![UnspentOutput {
            from: address(0x33),
            amount: 10_000_000,
            output_type: MovementType::Uco,
        }];

        let now = 1_700_000_000_000;
        let stamp = create_validation_stamp(
            &context,
            &coordinator,
            &election,
            &[origin.public_key().clone()],
            now,
        );
        let inconsistencies = validate_stamp(
            &context,
            &stamp,
            &election,
            &[origin.public_key().clone()],
            coordinator.public_key(),
            now,
            10_000,
        );
        assert!(inconsistencies.is_empty(), "{inconsistencies:?}");
        assert_eq!(&stamp.proof_of_work, origin.public_key());

        // 10M in, 2M moved, fee of 1.1M: the change comes back to the chain.
        let change = &stamp.ledger_operations.unspent_outputs[0];
        assert_eq!(change.amount, 10_000_000 - 2_000_000 - stamp.ledger_operations.fee);
    }

    #[test]
    fn tampered_stamp_is_flagged() {
        let origin = NodeKeys::generate();
        let coordinator = NodeKeys::generate();
        let election = HashElection::default();
        let context = context_for(signed_transaction(&origin));
        let now = 1_700_000_000_000;
        let origin_keys = [origin.public_key().clone()];

        let mut stamp =
            create_validation_stamp(&context, &coordinator, &election, &origin_keys, now);
        stamp.proof_of_work = PublicKey::null();
        stamp.ledger_operations.fee += 1;

        let inconsistencies = validate_stamp(
            &context,
            &stamp,
            &election,
            &origin_keys,
            coordinator.public_key(),
            now,
            10_000,
        );
        assert!(inconsistencies.contains(&Inconsistency::Signature));
        assert!(inconsistencies.contains(&Inconsistency::ProofOfWork));
        assert!(inconsistencies.contains(&Inconsistency::TransactionFee));
    }

    #[test]
    fn stale_timestamp_is_flagged() {
        let origin = NodeKeys::generate();
        let coordinator = NodeKeys::generate();
        let election = HashElection::default();
        let context = context_for(signed_transaction(&origin));
        let origin_keys = [origin.public_key().clone()];

        let stamp = create_validation_stamp(
            &context,
            &coordinator,
            &election,
            &origin_keys,
            1_700_000_000_000,
        );
        let inconsistencies = validate_stamp(
            &context,
            &stamp,
            &election,
            &origin_keys,
            coordinator.public_key(),
            1_700_000_000_000 + 60_000,
            10_000,
        );
        assert_eq!(inconsistencies, vec![Inconsistency::Timestamp]);
    }

    #[test]
    fn integrity_chains_over_the_previous_stamp() {
        let origin = NodeKeys::generate();
        let transaction = signed_transaction(&origin);

        let alone = proof_of_integrity(&transaction, None);

        let mut previous = signed_transaction(&origin);
        previous.validation_stamp = Some(ValidationStamp {
            timestamp: 1,
            proof_of_work: PublicKey::null(),
            proof_of_integrity: vec![0xaa; 32],
            proof_of_election: vec![0xbb; 32],
            ledger_operations: LedgerOperations::default(),
            signature: vec![0xcc; 64],
        });
        let chained = proof_of_integrity(&transaction, Some(&previous));

        assert_ne!(alone, chained);
    }
}
