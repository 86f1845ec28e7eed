//! Core subsystems of a committee-validated transaction-chain ledger node.
//!
//! Two subsystems make up the crate. The [`storage`] module is the embedded
//! chain store: append-only per-chain files with subset-partitioned indices,
//! per-subset bloom filters, and a pool of writer tasks that serializes
//! appends per genesis address. The [`mining`] module is the distributed
//! validation workflow: a per-transaction worker that takes the coordinator
//! or cross-validator role, gathers context from storage replicas, exchanges
//! validation stamps to atomic commitment, and drives replication with
//! signed storage acknowledgements.
//!
//! The transport, the election policy, pending-transaction acceptance, and
//! malicious-behaviour handling are collaborator traits ([`p2p::P2pClient`],
//! [`election::Election`], [`mining::PendingValidator`],
//! [`mining::MaliciousReporter`]); the crate ships deterministic defaults
//! where that makes sense and leaves the transport to the caller.

pub mod config;
pub mod crypto;
pub mod election;
pub mod encoding;
pub mod errors;
pub mod mining;
pub mod p2p;
pub mod storage;
pub mod types;

pub use config::{MiningConfig, NodeConfig, StorageConfig};
pub use errors::{ChainError, ChainResult};
