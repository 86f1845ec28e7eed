use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::crypto::Address;
use crate::errors::{ChainError, ChainResult};
use crate::mining::worker::WorkerHandle;

/// Process-wide map from transaction address to the mailbox of the worker
/// mining it. A transaction is mined at most once per node: registering an
/// in-flight address is rejected.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<Mutex<HashMap<Address, WorkerHandle>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: WorkerHandle) -> ChainResult<()> {
        let mut workers = self.inner.lock();
        let address = handle.tx_address().clone();
        if workers.contains_key(&address) {
            return Err(ChainError::Mining(format!(
                "transaction {address} is already being mined"
            )));
        }
        workers.insert(address, handle);
        Ok(())
    }

    pub fn lookup(&self, address: &Address) -> Option<WorkerHandle> {
        self.inner.lock().get(address).cloned()
    }

    pub fn deregister(&self, address: &Address) {
        self.inner.lock().remove(address);
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().len()
    }
}
