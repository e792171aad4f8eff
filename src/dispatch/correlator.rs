//! Matches asynchronous beacon results back to waiting callers.
//!
//! The bounded wait is a per-command-id oneshot subscription; the result
//! apply path is entirely independent of whether anyone is still
//! subscribed, so a command keeps completing in the background after a
//! caller gives up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::types::CommandOutcome;
use crate::error_handling::types::StorageError;
use crate::storage::storage_trait::Store;

pub struct ResultCorrelator {
    store: Arc<dyn Store>,
    waiters: Mutex<HashMap<Uuid, Vec<oneshot::Sender<()>>>>,
}

impl ResultCorrelator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to the completion of one command id.
    ///
    /// Subscribe before handing the command to a beacon, otherwise a fast
    /// result can slip in between delivery and subscription.
    pub fn subscribe(&self, command_id: Uuid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .entry(command_id)
            .or_default()
            .push(tx);
        rx
    }

    /// Releases every waiter subscribed to the command id.
    pub fn notify(&self, command_id: Uuid) {
        let senders = self.waiters.lock().unwrap().remove(&command_id);
        if let Some(senders) = senders {
            for tx in senders {
                // A dropped receiver just means the caller stopped waiting.
                let _ = tx.send(());
            }
        }
    }

    /// Applies a beacon result to the stored command.
    ///
    /// Idempotent: unknown ids and commands already in a terminal state are
    /// discarded with a log line, and re-delivery of the same result never
    /// double-updates fields. Returns whether the result was applied.
    pub async fn deliver_result(
        &self,
        command_id: Uuid,
        outcome: CommandOutcome,
    ) -> Result<bool, StorageError> {
        let command = match self.store.get_command(command_id).await? {
            Some(c) => c,
            None => {
                warn!("discarding result for unknown command {}", command_id);
                return Ok(false);
            }
        };
        if command.status.is_terminal() {
            info!(
                "discarding late result for command {} already {}",
                command_id,
                command.status.as_str()
            );
            return Ok(false);
        }
        let applied = self.store.apply_result(command_id, &outcome).await?;
        if applied {
            debug!(
                "command {} resolved with exit code {}",
                command_id, outcome.exit_code
            );
            self.notify(command_id);
        } else {
            // Lost the CAS race, most likely against the stale sweep.
            info!("result for command {} arrived after force-close", command_id);
        }
        Ok(applied)
    }
}
