pub mod bitstring;
pub mod node;
pub mod stamps;
pub mod summary;
pub mod transaction;

pub use bitstring::BitString;
pub use node::Peer;
pub use stamps::{
    CrossValidationStamp, Inconsistency, LedgerOperations, MovementType, NodeMovement,
    TransactionMovement, UnspentOutput, ValidationStamp,
};
pub use summary::{ReplicationAttestation, TransactionSummary};
pub use transaction::{
    Ledger, Ownership, TokenTransfer, Transaction, TransactionData, TransactionType, UcoTransfer,
};
