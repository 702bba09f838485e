//! Debounced conversation saves
//!
//! Every transcript mutation schedules a save; only the latest snapshot
//! within the debounce window is written. Writes never overlap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::storage::conversations::ConversationRepository;
use crate::storage::StorageError;
use crate::types::Conversation;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

struct SchedulerState {
    seq: AtomicU64,
    pending: Mutex<Option<Vec<Conversation>>>,
    write_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct SaveScheduler {
    repository: Arc<dyn ConversationRepository>,
    debounce: Duration,
    state: Arc<SchedulerState>,
}

impl SaveScheduler {
    pub fn new(repository: Arc<dyn ConversationRepository>, debounce: Duration) -> Self {
        Self {
            repository,
            debounce,
            state: Arc::new(SchedulerState {
                seq: AtomicU64::new(0),
                pending: Mutex::new(None),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Store `snapshot` and write it after the debounce unless superseded
    pub fn schedule(&self, snapshot: Vec<Conversation>) {
        let seq = self.state.seq.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.pending.lock().expect("pending save mutex poisoned") = Some(snapshot);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            if this.state.seq.load(Ordering::SeqCst) != seq {
                return;
            }
            if let Err(e) = this.write_pending().await {
                tracing::error!("Failed to save conversations: {}", e);
            }
        });
    }

    /// Write the pending snapshot now, if any
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.write_pending().await
    }

    pub fn has_pending(&self) -> bool {
        self.state
            .pending
            .lock()
            .expect("pending save mutex poisoned")
            .is_some()
    }

    async fn write_pending(&self) -> Result<(), StorageError> {
        let _guard = self.state.write_lock.lock().await;
        let snapshot = self
            .state
            .pending
            .lock()
            .expect("pending save mutex poisoned")
            .take();
        match snapshot {
            Some(conversations) => self.repository.save(&conversations).await,
            None => Ok(()),
        }
    }
}
