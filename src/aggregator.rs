//! Per-recipient outcome bookkeeping and the notification's terminal switch.
//!
//! Workers never touch the notification row directly: counters move only
//! through [`Aggregator::record_outcome`] and the state only through
//! [`Aggregator::mark_sending`] and [`Aggregator::check_completion`].
use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::db::{self, Pool, RecordedOutcome};
use crate::model::{DeliveryOutcome, ErrorClass, NotificationState, RecipientDescriptor};

/// Published once per notification, by whichever caller won the terminal
/// transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalEvent {
    pub notification_id: String,
    pub state: NotificationState,
}

#[derive(Clone)]
pub struct Aggregator {
    pool: Pool,
    terminal_tx: broadcast::Sender<TerminalEvent>,
}

impl Aggregator {
    pub fn new(pool: Pool) -> Self {
        let (terminal_tx, _) = broadcast::channel(64);
        Self { pool, terminal_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.terminal_tx.subscribe()
    }

    /// Idempotent upsert of the (notification, recipient) result. A terminal
    /// outcome bumps its counter exactly once; later writes for the same pair
    /// are ignored and reported as `false`.
    #[instrument(skip_all, fields(notification_id = %notification_id, recipient = %recipient.conversation_ref))]
    pub async fn record_outcome(
        &self,
        notification_id: &str,
        recipient: &RecipientDescriptor,
        outcome: DeliveryOutcome,
        attempts: u32,
        error_class: Option<ErrorClass>,
    ) -> Result<bool> {
        let applied = db::record_delivery_result(
            &self.pool,
            &RecordedOutcome {
                notification_id,
                recipient_ref: &recipient.conversation_ref,
                display_name: recipient.display_name.as_deref(),
                outcome,
                attempts: attempts as i32,
                error_class,
            },
        )
        .await?;
        if !applied {
            debug!(outcome = outcome.as_str(), "recipient already terminal; ignored");
        }
        Ok(applied)
    }

    pub async fn is_terminal(&self, notification_id: &str, recipient_ref: &str) -> Result<bool> {
        db::has_terminal_result(&self.pool, notification_id, recipient_ref).await
    }

    pub async fn mark_sending(&self, notification_id: &str) -> Result<bool> {
        db::mark_sending(&self.pool, notification_id).await
    }

    /// Move the notification to `Completed`/`Failed` once every resolved
    /// recipient has a terminal result. Safe to call from any number of
    /// workers at once: exactly one of them gets `Some(state)`.
    #[instrument(skip_all, fields(notification_id = %notification_id))]
    pub async fn check_completion(&self, notification_id: &str) -> Result<Option<NotificationState>> {
        let state = db::try_complete_notification(&self.pool, notification_id).await?;
        if let Some(state) = state {
            info!(state = state.as_str(), "notification reached terminal state");
            // No subscribers is fine.
            let _ = self.terminal_tx.send(TerminalEvent {
                notification_id: notification_id.to_string(),
                state,
            });
        }
        Ok(state)
    }
}

/// Log every terminal transition until all senders are gone. Returns how
/// many transitions it saw.
pub async fn log_terminal_events(mut events: broadcast::Receiver<TerminalEvent>) -> usize {
    let mut seen = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                seen += 1;
                info!(
                    notification_id = %event.notification_id,
                    state = event.state.as_str(),
                    "notification finished"
                );
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "terminal event listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return seen,
        }
    }
}
