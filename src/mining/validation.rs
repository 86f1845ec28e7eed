use tracing::warn;

use crate::errors::{ChainError, ChainResult};
use crate::mining::context::ValidationContext;
use crate::types::Transaction;

/// Local acceptance checks a pending transaction must pass before mining
/// starts. The outcome is recorded in the validation context; it does not
/// abort the workflow.
pub trait PendingValidator: Send + Sync {
    fn validate(&self, transaction: &Transaction) -> ChainResult<()>;
}

/// Default policy: a well-formed previous signature and a present origin
/// signature.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChainPendingValidator;

impl PendingValidator for ChainPendingValidator {
    fn validate(&self, transaction: &Transaction) -> ChainResult<()> {
        if transaction.previous_signature.is_empty() {
            return Err(ChainError::Transaction("missing previous signature".into()));
        }
        if transaction.origin_signature.is_empty() {
            return Err(ChainError::Transaction("missing origin signature".into()));
        }
        transaction
            .previous_public_key
            .verify(
                &transaction.payload_for_previous_signature(),
                &transaction.previous_signature,
            )
            .map_err(|_| ChainError::Transaction("invalid previous signature".into()))
    }
}

/// Collaborator notified when cross-validation stamps disagree; the context
/// carries everything needed to investigate the split.
pub trait MaliciousReporter: Send + Sync {
    fn report(&self, context: &ValidationContext);
}

/// Default reporter: a structured log line, leaving investigation to the
/// operator.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMaliciousReporter;

impl MaliciousReporter for LogMaliciousReporter {
    fn report(&self, context: &ValidationContext) {
        let inconsistency_sets: Vec<_> = context
            .cross_validation_stamps
            .iter()
            .map(|stamp| (&stamp.node_public_key, &stamp.inconsistencies))
            .collect();
        warn!(
            address = %context.transaction.address,
            ?inconsistency_sets,
            "cross-validation stamps disagree, transaction dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Address, HashAlgorithm, NodeKeys};
    use crate::types::{TransactionData, TransactionType};

    fn transaction(sign: bool) -> Transaction {
        let keys = NodeKeys::generate();
        let mut bytes = vec![0u8, HashAlgorithm::Sha256.id()];
        bytes.extend_from_slice(&[0x11; 32]);
        let mut transaction = Transaction {
            address: Address::from_bytes(bytes).unwrap(),
            tx_type: TransactionType::Transfer,
            data: TransactionData::default(),
            previous_public_key: keys.public_key().clone(),
            previous_signature: Vec::new(),
            origin_signature: vec![9u8; 64],
            validation_stamp: None,
            cross_validation_stamps: Vec::new(),
        };
        transaction.previous_signature = if sign {
            keys.sign(&transaction.payload_for_previous_signature())
        } else {
            vec![0u8; 64]
        };
        transaction
    }

    #[test]
    fn accepts_a_properly_signed_transaction() {
        assert!(ChainPendingValidator.validate(&transaction(true)).is_ok());
    }

    #[test]
    fn rejects_a_bad_previous_signature() {
        assert!(ChainPendingValidator.validate(&transaction(false)).is_err());
    }
}
