//! Per-conversation locks.
//!
//! One logical lock per conversation id serializes request runs. Tokio
//! mutexes queue waiters FIFO, which gives the fairness the ordering
//! invariants need. Waiting is bounded: a timeout surfaces as `Busy`.

use crate::error::{OrchestratorError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
pub struct ConversationLocks {
    inner: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a conversation, waiting at most `deadline`.
    pub async fn acquire(&self, conversation_id: Uuid, deadline: Duration) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut map = self.inner.lock().expect("lock map poisoned");
            Arc::clone(map.entry(conversation_id).or_default())
        };
        match tokio::time::timeout(deadline, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                tracing::warn!(conversation_id = %conversation_id, "lock wait timed out");
                Err(OrchestratorError::Busy)
            }
        }
    }

    /// Drop a conversation's lock entry once no run holds it. Best-effort
    /// cleanup after conversation deletion.
    pub fn forget(&self, conversation_id: Uuid) {
        let mut map = self.inner.lock().expect("lock map poisoned");
        if let Some(lock) = map.get(&conversation_id)
            && lock.try_lock().is_ok()
        {
            map.remove(&conversation_id);
        }
    }
}
