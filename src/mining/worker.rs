//! Per-transaction mining workflow.
//!
//! One worker task is spawned per pending transaction on every elected
//! validator. The worker compares its key against the election-ordered
//! validator list to take the coordinator or cross-validator role, gathers
//! its transaction context, then drives the stamp exchange to atomic
//! commitment and replication. All inputs arrive through the mailbox
//! registered in the [`WorkflowRegistry`](crate::mining::WorkflowRegistry);
//! messages that arrive ahead of the state able to consume them are
//! postponed and redelivered on state entry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::crypto::{Address, PublicKey};
use crate::errors::{ChainError, ChainResult};
use crate::mining::context::ValidationContext;
use crate::mining::fetcher::TransactionContextFetcher;
use crate::mining::replication::replicate_to_chain_replicas;
use crate::mining::stamp::{create_validation_stamp, validate_stamp};
use crate::mining::{beacon_slot, unix_millis_now, MiningEnv};
use crate::p2p::{MiningMessage, NodeRoster, ReplicationTree};
use crate::types::{
    BitString, CrossValidationStamp, Peer, ReplicationAttestation, Transaction,
    TransactionSummary, ValidationStamp,
};

/// Terminal result of one mining workflow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MiningOutcome {
    /// Storage quorum reached and the attestation broadcast.
    Replicated,
    /// Cross-validation stamps disagreed; handed to malicious detection.
    ConsensusNotReached,
    /// No cross-validator confirmed its context before the waiting budget.
    NoCrossValidators,
    /// The pending transaction failed local acceptance checks; mining never
    /// left the preparation step.
    PendingValidationFailed,
    /// The global mining deadline fired.
    TimedOut,
    /// Unrecoverable local failure.
    Aborted(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    Coordinator,
    CrossValidator,
    WaitCrossValidationStamps,
    Replication,
}

enum WorkerMsg {
    AddMiningContext {
        from: PublicKey,
        previous_storage_node_keys: Vec<PublicKey>,
        chain_view: BitString,
        beacon_view: BitString,
    },
    CrossValidate {
        stamp: ValidationStamp,
        replication_tree: ReplicationTree,
        confirmed: BitString,
    },
    AddCrossValidationStamp {
        stamp: CrossValidationStamp,
    },
    AddAckStorage {
        node_public_key: PublicKey,
        signature: Vec<u8>,
    },
    ReplicationError {
        node_public_key: PublicKey,
        reason: String,
    },
}

/// Mailbox of a running worker; cheap to clone and safe to use after the
/// worker stopped (sends are dropped).
#[derive(Clone)]
pub struct WorkerHandle {
    tx_address: Address,
    sender: mpsc::UnboundedSender<WorkerMsg>,
}

impl WorkerHandle {
    pub fn tx_address(&self) -> &Address {
        &self.tx_address
    }

    pub fn add_mining_context(
        &self,
        from: PublicKey,
        previous_storage_node_keys: Vec<PublicKey>,
        chain_view: BitString,
        beacon_view: BitString,
    ) {
        let _ = self.sender.send(WorkerMsg::AddMiningContext {
            from,
            previous_storage_node_keys,
            chain_view,
            beacon_view,
        });
    }

    pub fn cross_validate(
        &self,
        stamp: ValidationStamp,
        replication_tree: ReplicationTree,
        confirmed: BitString,
    ) {
        let _ = self.sender.send(WorkerMsg::CrossValidate {
            stamp,
            replication_tree,
            confirmed,
        });
    }

    pub fn add_cross_validation_stamp(&self, stamp: CrossValidationStamp) {
        let _ = self
            .sender
            .send(WorkerMsg::AddCrossValidationStamp { stamp });
    }

    pub fn add_ack_storage(&self, node_public_key: PublicKey, signature: Vec<u8>) {
        let _ = self.sender.send(WorkerMsg::AddAckStorage {
            node_public_key,
            signature,
        });
    }

    pub fn replication_error(&self, node_public_key: PublicKey, reason: String) {
        let _ = self.sender.send(WorkerMsg::ReplicationError {
            node_public_key,
            reason,
        });
    }
}

enum Step {
    Continue,
    Finish(MiningOutcome),
}

pub struct MiningWorker {
    env: Arc<MiningEnv>,
    handle: WorkerHandle,
    mailbox: mpsc::UnboundedReceiver<WorkerMsg>,
    state: WorkerState,
    postponed: VecDeque<WorkerMsg>,
    wait_deadline: Option<Instant>,
    summary: Option<TransactionSummary>,
    summary_payload: Vec<u8>,
}

impl MiningWorker {
    /// Registers and spawns a worker for a pending transaction handed over
    /// by the welcome node, together with the election-ordered validator
    /// list. Fails when the transaction is already being mined.
    pub fn spawn(
        env: Arc<MiningEnv>,
        transaction: Transaction,
        welcome_node: Peer,
        validation_nodes: Vec<Peer>,
    ) -> ChainResult<(WorkerHandle, JoinHandle<MiningOutcome>)> {
        if validation_nodes.is_empty() {
            return Err(ChainError::Mining("empty validation node list".into()));
        }
        let (sender, mailbox) = mpsc::unbounded_channel();
        let handle = WorkerHandle {
            tx_address: transaction.address.clone(),
            sender,
        };
        env.registry.register(handle.clone())?;

        let worker = MiningWorker {
            env,
            handle: handle.clone(),
            mailbox,
            state: WorkerState::Coordinator,
            postponed: VecDeque::new(),
            wait_deadline: None,
            summary: None,
            summary_payload: Vec::new(),
        };
        let context = ValidationContext::new(transaction, welcome_node, validation_nodes);
        let join = tokio::spawn(worker.run(context));
        Ok((handle, join))
    }

    async fn run(mut self, context: ValidationContext) -> MiningOutcome {
        let address = context.transaction.address.clone();
        let tx_type = context.transaction.tx_type;
        let outcome = match self.workflow(context).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%address, ?err, "mining workflow aborted");
                MiningOutcome::Aborted(err.to_string())
            }
        };
        self.env.registry.deregister(&address);
        info!(%address, ?tx_type, ?outcome, "mining workflow finished");
        outcome
    }

    async fn workflow(&mut self, context: ValidationContext) -> ChainResult<MiningOutcome> {
        let stop_at =
            Instant::now() + Duration::from_millis(self.env.config.global_timeout_ms);

        let mut context = self.prepare(context)?;
        if !context.valid_pending_transaction {
            return Ok(MiningOutcome::PendingValidationFailed);
        }

        // Gather the transaction context under the global deadline.
        let previous_address = context.transaction.previous_address();
        let candidates = self.env.roster.all();
        let previous_storage_nodes = self
            .env
            .election
            .chain_storage_nodes(&previous_address, &candidates);
        let fetcher = TransactionContextFetcher::new(
            Arc::clone(&self.env.p2p),
            Duration::from_millis(self.env.config.context_request_timeout_ms),
        );
        let fetched = match timeout_at(
            stop_at,
            fetcher.fetch(
                &previous_address,
                &previous_storage_nodes,
                &context.chain_storage_nodes,
                &context.beacon_storage_nodes,
            ),
        )
        .await
        {
            Ok(fetched) => fetched,
            Err(_) => {
                warn!(address = %context.transaction.address, "context fetch hit the mining deadline");
                return Ok(MiningOutcome::TimedOut);
            }
        };
        let retrieval_duration = fetched.elapsed;
        context = context.with_fetched_context(
            fetched.previous_transaction,
            fetched.unspent_outputs,
            fetched.previous_storage_node_keys,
            fetched.chain_nodes_view,
            fetched.beacon_nodes_view,
        );

        // Role split against the election-ordered validator list.
        if context.coordinator().last_public_key == *self.env.keys.public_key() {
            self.state = WorkerState::Coordinator;
            if context.enough_confirmations() {
                // Single-validator election: nobody can cross-validate.
                let (_, step) = self.create_and_notify_stamp(context).await?;
                return Ok(match step {
                    Step::Finish(outcome) => outcome,
                    Step::Continue => MiningOutcome::Aborted(
                        "stamp creation without cross validators must stop".into(),
                    ),
                });
            }
            let cross_validators = context.cross_validation_nodes().len() as u32;
            let budget = (retrieval_duration
                + Duration::from_millis(self.env.config.coordinator_grace_ms))
                * cross_validators;
            self.wait_deadline = Some(Instant::now() + budget);
        } else {
            self.state = WorkerState::CrossValidator;
            self.notify_context(&context).await;
        }

        // Mailbox loop: messages, the confirmation budget, the global stop.
        loop {
            let wait_at = self.wait_deadline.unwrap_or(stop_at);
            tokio::select! {
                maybe_msg = self.mailbox.recv() => {
                    let Some(msg) = maybe_msg else {
                        return Ok(MiningOutcome::Aborted("worker mailbox closed".into()));
                    };
                    let (ctx, step) = self.process(context, msg).await?;
                    context = ctx;
                    if let Step::Finish(outcome) = step {
                        return Ok(outcome);
                    }
                }
                _ = time::sleep_until(wait_at), if self.wait_deadline.is_some() => {
                    self.wait_deadline = None;
                    if self.state == WorkerState::Coordinator {
                        debug!(address = %context.transaction.address, "confirmation budget elapsed");
                        let (ctx, step) = self.create_and_notify_stamp(context).await?;
                        context = ctx;
                        if let Step::Finish(outcome) = step {
                            return Ok(outcome);
                        }
                        let (ctx, step) = self.redeliver_postponed(context).await?;
                        context = ctx;
                        if let Step::Finish(outcome) = step {
                            return Ok(outcome);
                        }
                    }
                }
                _ = time::sleep_until(stop_at) => {
                    warn!(
                        address = %context.transaction.address,
                        tx_type = ?context.transaction.tx_type,
                        "mining workflow timed out"
                    );
                    return Ok(MiningOutcome::TimedOut);
                }
            }
        }
    }

    /// Pending validation and the storage elections, everything derivable
    /// before touching the network.
    fn prepare(&self, context: ValidationContext) -> ChainResult<ValidationContext> {
        let valid_pending = match self.env.pending.validate(&context.transaction) {
            Ok(()) => true,
            Err(err) => {
                warn!(address = %context.transaction.address, ?err, "pending transaction failed local validation");
                false
            }
        };
        let context = context.with_pending_validation(valid_pending);

        let candidates = self.env.roster.all();
        let chain_storage_nodes = self.env.election.chain_storage_nodes_with_type(
            &context.transaction.address,
            context.transaction.tx_type,
            &candidates,
        );
        let beacon_storage_nodes = self.env.election.beacon_storage_nodes(
            context.transaction.address.subset(),
            beacon_slot(unix_millis_now() / 1_000),
            &candidates,
        );

        let mut io_targets: Vec<Peer> = Vec::new();
        for recipient in context
            .transaction
            .data
            .ledger
            .uco_transfers
            .iter()
            .map(|transfer| &transfer.to)
            .chain(
                context
                    .transaction
                    .data
                    .ledger
                    .token_transfers
                    .iter()
                    .map(|transfer| &transfer.to),
            )
            .chain(context.transaction.data.recipients.iter())
        {
            io_targets.extend(self.env.election.chain_storage_nodes(recipient, &candidates));
        }
        let io_storage_nodes = NodeRoster::distinct_nodes(io_targets);

        Ok(context.with_elections(chain_storage_nodes, beacon_storage_nodes, io_storage_nodes))
    }

    /// Cross-validator context hand-off to the coordinator.
    async fn notify_context(&self, context: &ValidationContext) {
        let message = MiningMessage::AddMiningContext {
            tx_address: context.transaction.address.clone(),
            validator_public_key: self.env.keys.public_key().clone(),
            previous_storage_node_keys: context.previous_storage_node_keys.clone(),
            chain_storage_nodes_view: context.chain_nodes_view.clone(),
            beacon_storage_nodes_view: context.beacon_nodes_view.clone(),
        };
        let coordinator = context.coordinator().clone();
        let budget = Duration::from_millis(self.env.config.context_request_timeout_ms);
        match time::timeout(budget, self.env.p2p.send(&coordinator, message)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                warn!(coordinator = %coordinator.last_public_key, ?err, "failed to send mining context");
            }
            Err(_) => {
                warn!(coordinator = %coordinator.last_public_key, "mining context send timed out");
            }
        }
    }

    /// Handles one message, then redelivers postponed messages after every
    /// state change until the queue settles.
    async fn process(
        &mut self,
        mut context: ValidationContext,
        msg: WorkerMsg,
    ) -> ChainResult<(ValidationContext, Step)> {
        let mut queue = VecDeque::new();
        queue.push_back(msg);
        while let Some(msg) = queue.pop_front() {
            let state_before = self.state;
            let (ctx, step) = self.dispatch(context, msg).await?;
            context = ctx;
            if let Step::Finish(outcome) = step {
                return Ok((context, Step::Finish(outcome)));
            }
            if self.state != state_before {
                while let Some(postponed) = self.postponed.pop_back() {
                    queue.push_front(postponed);
                }
            }
        }
        Ok((context, Step::Continue))
    }

    async fn redeliver_postponed(
        &mut self,
        mut context: ValidationContext,
    ) -> ChainResult<(ValidationContext, Step)> {
        // Take the queue once: a message the current state still cannot
        // consume goes back to `postponed` without being retried here.
        let mut pending = std::mem::take(&mut self.postponed);
        while let Some(msg) = pending.pop_front() {
            let (ctx, step) = self.process(context, msg).await?;
            context = ctx;
            if let Step::Finish(outcome) = step {
                return Ok((context, Step::Finish(outcome)));
            }
        }
        Ok((context, Step::Continue))
    }

    async fn dispatch(
        &mut self,
        context: ValidationContext,
        msg: WorkerMsg,
    ) -> ChainResult<(ValidationContext, Step)> {
        match msg {
            WorkerMsg::AddMiningContext {
                from,
                previous_storage_node_keys,
                chain_view,
                beacon_view,
            } => {
                if self.state != WorkerState::Coordinator {
                    debug!(%from, state = ?self.state, "ignoring mining context outside coordination");
                    return Ok((context, Step::Continue));
                }
                let Some(index) = context.cross_validator_index(&from) else {
                    warn!(%from, "mining context from a non-elected validator");
                    return Ok((context, Step::Continue));
                };
                let context = context.aggregate_mining_context(
                    index,
                    previous_storage_node_keys,
                    &chain_view,
                    &beacon_view,
                );
                if context.enough_confirmations() {
                    self.wait_deadline = None;
                    return self.create_and_notify_stamp(context).await;
                }
                Ok((context, Step::Continue))
            }
            WorkerMsg::CrossValidate {
                stamp,
                replication_tree,
                confirmed,
            } => {
                if self.state != WorkerState::CrossValidator {
                    debug!(state = ?self.state, "ignoring cross-validate outside cross-validation");
                    return Ok((context, Step::Continue));
                }
                self.on_cross_validate(context, stamp, replication_tree, confirmed)
                    .await
            }
            WorkerMsg::AddCrossValidationStamp { stamp } => match self.state {
                WorkerState::WaitCrossValidationStamps => {
                    self.on_cross_validation_stamp(context, stamp).await
                }
                WorkerState::CrossValidator => {
                    self.postponed
                        .push_back(WorkerMsg::AddCrossValidationStamp { stamp });
                    Ok((context, Step::Continue))
                }
                _ => {
                    debug!(state = ?self.state, "ignoring late cross-validation stamp");
                    Ok((context, Step::Continue))
                }
            },
            WorkerMsg::AddAckStorage {
                node_public_key,
                signature,
            } => match self.state {
                WorkerState::Replication => {
                    self.on_ack_storage(context, node_public_key, signature).await
                }
                _ => {
                    self.postponed.push_back(WorkerMsg::AddAckStorage {
                        node_public_key,
                        signature,
                    });
                    Ok((context, Step::Continue))
                }
            },
            WorkerMsg::ReplicationError {
                node_public_key,
                reason,
            } => {
                debug!(replica = %node_public_key, %reason, "replication attempt failed");
                Ok((context, Step::Continue))
            }
        }
    }

    /// Coordinator transition out of context aggregation: stamp, replication
    /// tree, `CrossValidate` broadcast to the confirmed cross-validators.
    async fn create_and_notify_stamp(
        &mut self,
        context: ValidationContext,
    ) -> ChainResult<(ValidationContext, Step)> {
        self.wait_deadline = None;
        if context.confirmed_cross_validation_count() == 0 {
            warn!(
                address = %context.transaction.address,
                "no cross validator confirmed its mining context"
            );
            return Ok((context, Step::Finish(MiningOutcome::NoCrossValidators)));
        }

        let stamp = create_validation_stamp(
            &context,
            &self.env.keys,
            self.env.election.as_ref(),
            &self.env.origin_keys,
            unix_millis_now(),
        );
        let tree = context.create_replication_tree();
        let context = context
            .with_validation_stamp(stamp.clone())
            .with_replication_tree(tree.clone());

        self.state = WorkerState::WaitCrossValidationStamps;
        let message = MiningMessage::CrossValidate {
            tx_address: context.transaction.address.clone(),
            validation_stamp: stamp,
            replication_tree: tree,
            confirmed_validation_nodes: context.cross_validation_nodes_confirmation.clone(),
        };
        self.env
            .p2p
            .broadcast(&context.confirmed_cross_validation_nodes(), message)
            .await;
        Ok((context, Step::Continue))
    }

    /// Cross-validator receiving the coordinator's stamp: check it, sign the
    /// verdict, fan it out.
    async fn on_cross_validate(
        &mut self,
        context: ValidationContext,
        stamp: ValidationStamp,
        replication_tree: ReplicationTree,
        confirmed: BitString,
    ) -> ChainResult<(ValidationContext, Step)> {
        let context = context
            .with_replication_tree(replication_tree)
            .with_confirmed_cross_validation_nodes(confirmed);

        let inconsistencies = validate_stamp(
            &context,
            &stamp,
            self.env.election.as_ref(),
            &self.env.origin_keys,
            &context.coordinator().last_public_key,
            unix_millis_now(),
            self.env.config.timestamp_tolerance_ms,
        );
        if !inconsistencies.is_empty() {
            warn!(
                address = %context.transaction.address,
                ?inconsistencies,
                "validation stamp failed cross-validation"
            );
        }

        let own_stamp = CrossValidationStamp::sign(&self.env.keys, &stamp, inconsistencies);
        let context = context
            .with_validation_stamp(stamp)
            .add_cross_validation_stamp(own_stamp.clone());

        let mut targets = vec![context.coordinator().clone()];
        let own_key = self.env.keys.public_key();
        targets.extend(
            context
                .confirmed_cross_validation_nodes()
                .into_iter()
                .filter(|peer| peer.last_public_key != *own_key),
        );
        let message = MiningMessage::CrossValidationDone {
            tx_address: context.transaction.address.clone(),
            cross_validation_stamp: own_stamp,
        };
        self.env.p2p.broadcast(&targets, message).await;

        if context.confirmed_cross_validation_count() == 1 && context.atomic_commitment() {
            // Sole cross-validator with a self-affirming stamp: nothing
            // further to wait for.
            return self.enter_replication(context);
        }
        self.state = WorkerState::WaitCrossValidationStamps;
        Ok((context, Step::Continue))
    }

    async fn on_cross_validation_stamp(
        &mut self,
        context: ValidationContext,
        stamp: CrossValidationStamp,
    ) -> ChainResult<(ValidationContext, Step)> {
        let Some(validation_stamp) = context.validation_stamp.clone() else {
            debug!("cross-validation stamp before any validation stamp");
            return Ok((context, Step::Continue));
        };
        let legitimate = context
            .cross_validator_index(&stamp.node_public_key)
            .map(|index| context.cross_validation_nodes_confirmation.get(index))
            .unwrap_or(false);
        if !legitimate || !stamp.verify(&validation_stamp) {
            warn!(
                signer = %stamp.node_public_key,
                "ignoring cross-validation stamp with bad signer or signature"
            );
            return Ok((context, Step::Continue));
        }

        let context = context.add_cross_validation_stamp(stamp);
        if !context.enough_cross_validation_stamps() {
            return Ok((context, Step::Continue));
        }
        if context.atomic_commitment() {
            return self.enter_replication(context);
        }
        self.env.malicious.report(&context);
        Ok((context, Step::Finish(MiningOutcome::ConsensusNotReached)))
    }

    /// Atomic commitment reached: fan the validated transaction out to the
    /// chain replicas and start counting signed acknowledgements.
    fn enter_replication(
        &mut self,
        context: ValidationContext,
    ) -> ChainResult<(ValidationContext, Step)> {
        let validated = context.validated_transaction();
        let summary = TransactionSummary::from_transaction(&validated)?;
        self.summary_payload = summary.serialize();
        self.summary = Some(summary);
        self.state = WorkerState::Replication;

        replicate_to_chain_replicas(
            Arc::clone(&self.env.p2p),
            validated,
            context.chain_storage_nodes.clone(),
            self.handle.clone(),
            Duration::from_millis(self.env.config.replication_timeout_ms),
        );
        Ok((context, Step::Continue))
    }

    async fn on_ack_storage(
        &mut self,
        context: ValidationContext,
        node_public_key: PublicKey,
        signature: Vec<u8>,
    ) -> ChainResult<(ValidationContext, Step)> {
        let Some(index) = context
            .chain_storage_nodes
            .iter()
            .position(|peer| peer.last_public_key == node_public_key)
        else {
            warn!(replica = %node_public_key, "storage ack from a non-elected replica");
            return Ok((context, Step::Continue));
        };
        if !node_public_key.verifies(&self.summary_payload, &signature) {
            warn!(replica = %node_public_key, "storage ack signature does not verify");
            return Ok((context, Step::Continue));
        }

        let context = context.add_storage_confirmation(index as u16, signature);
        if !context.enough_storage_confirmations(self.env.config.storage_confirmation_quorum) {
            return Ok((context, Step::Continue));
        }
        self.notify_attestation(&context).await?;
        Ok((context, Step::Finish(MiningOutcome::Replicated)))
    }

    /// Storage quorum reached: attestation to the welcome and beacon nodes,
    /// the validated transaction to the I/O replicas.
    async fn notify_attestation(&mut self, context: &ValidationContext) -> ChainResult<()> {
        let summary = self
            .summary
            .take()
            .ok_or_else(|| ChainError::Mining("missing transaction summary".into()))?;
        let attestation = ReplicationAttestation {
            transaction_summary: summary,
            confirmations: context
                .storage_confirmations
                .iter()
                .map(|(index, signature)| (*index, signature.clone()))
                .collect(),
        };

        let mut targets = vec![context.welcome_node.clone()];
        targets.extend(context.beacon_storage_nodes.iter().cloned());
        self.env
            .p2p
            .broadcast(
                &targets,
                MiningMessage::ReplicationAttestation(Box::new(attestation)),
            )
            .await;

        if !context.io_storage_nodes.is_empty() {
            self.env
                .p2p
                .broadcast(
                    &context.io_storage_nodes,
                    MiningMessage::ReplicateTransaction {
                        transaction: Box::new(context.validated_transaction()),
                    },
                )
                .await;
        }
        info!(
            address = %context.transaction.address,
            confirmations = context.storage_confirmations.len(),
            "replication attestation broadcast"
        );
        Ok(())
    }
}
