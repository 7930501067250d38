use crate::aggregator::Aggregator;
use crate::db::{self, Pool};
use crate::messenger::{Messenger, SendError};
use crate::model::{DeliveryOutcome, ErrorClass, Notification, RecipientDescriptor, WorkUnit};
use anyhow::Result;
use futures::stream::{self, TryStreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Bounded retry with exponential backoff for throttled and transient sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total send attempts per recipient, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): base * 2^(attempt-1),
    /// capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exp)
            .min(self.max_delay)
    }

    /// A platform-provided retry-after wins over the computed backoff.
    pub fn delay_for(&self, err: &SendError, attempt: u32) -> Duration {
        match err {
            SendError::Throttled {
                retry_after: Some(after),
            } => *after,
            _ => self.backoff(attempt),
        }
    }
}

/// Final word on one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempted {
    pub outcome: DeliveryOutcome,
    pub attempts: u32,
    pub error_class: Option<ErrorClass>,
}

pub struct SendWorker {
    pool: Pool,
    messenger: Arc<dyn Messenger>,
    aggregator: Aggregator,
    policy: RetryPolicy,
    lease: Duration,
    concurrency: usize,
}

impl SendWorker {
    pub fn new(
        pool: Pool,
        messenger: Arc<dyn Messenger>,
        aggregator: Aggregator,
        policy: RetryPolicy,
        lease: Duration,
    ) -> Self {
        Self {
            pool,
            messenger,
            aggregator,
            policy,
            lease,
            concurrency: 1,
        }
    }

    /// How many recipients of one unit are in flight at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Claim and fully process one work unit. Returns false when the queue
    /// had nothing claimable.
    #[instrument(skip_all)]
    pub async fn process_next_unit(&self) -> Result<bool> {
        let Some(unit) = db::claim_next_work_unit(&self.pool, self.lease).await? else {
            return Ok(false);
        };
        let notification_id = unit.notification_id.clone();

        match db::fetch_notification(&self.pool, &notification_id).await? {
            None => {
                warn!(unit_id = unit.id, %notification_id, "work unit for unknown notification; dropping");
            }
            Some(n) if n.state.is_terminal() => {
                info!(unit_id = unit.id, %notification_id, "notification already terminal; dropping duplicate unit");
            }
            Some(n) => {
                self.aggregator.mark_sending(&n.id).await?;
                if !self.under_lease(&unit, self.process_unit(&n, &unit)).await? {
                    warn!(unit_id = unit.id, %notification_id, "lease taken over by another worker; abandoning unit");
                    return Ok(true);
                }
            }
        }

        // Check before deleting: if the check fails the unit survives and its
        // next claim retries it.
        self.aggregator.check_completion(&notification_id).await?;
        db::delete_work_unit(&self.pool, unit.id).await?;
        Ok(true)
    }

    /// Drive `work` while renewing the unit's lease. Returns false, dropping
    /// `work`, as soon as a renewal finds the unit re-claimed elsewhere.
    async fn under_lease<F>(&self, unit: &WorkUnit, work: F) -> Result<bool>
    where
        F: Future<Output = Result<()>>,
    {
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval((self.lease / 3).max(Duration::from_millis(10)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick is immediate; the claim itself just set the lease.
        heartbeat.tick().await;
        loop {
            tokio::select! {
                res = &mut work => return res.map(|()| true),
                _ = heartbeat.tick() => {
                    if !db::renew_lease(&self.pool, unit.id, unit.claim_count, self.lease).await? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn process_unit(&self, notification: &Notification, unit: &WorkUnit) -> Result<()> {
        stream::iter(unit.recipients.iter().map(Ok::<_, anyhow::Error>))
            .try_for_each_concurrent(self.concurrency, |recipient| {
                self.process_recipient(notification, recipient)
            })
            .await?;
        info!(
            unit_id = unit.id,
            sequence = unit.sequence,
            recipients = unit.recipients.len(),
            "work unit processed"
        );
        Ok(())
    }

    async fn process_recipient(
        &self,
        notification: &Notification,
        recipient: &RecipientDescriptor,
    ) -> Result<()> {
        // A re-delivered unit must not send twice to the same recipient.
        if self
            .aggregator
            .is_terminal(&notification.id, &recipient.conversation_ref)
            .await?
        {
            return Ok(());
        }

        let result = if db::is_cancelled(&self.pool, &notification.id).await? {
            Attempted {
                outcome: DeliveryOutcome::Failed,
                attempts: 0,
                error_class: Some(ErrorClass::Cancelled),
            }
        } else {
            match self.deliver(notification, recipient).await? {
                Some(result) => result,
                None => return Ok(()),
            }
        };

        self.aggregator
            .record_outcome(
                &notification.id,
                recipient,
                result.outcome,
                result.attempts,
                result.error_class,
            )
            .await?;
        Ok(())
    }

    /// Send to one recipient, retrying throttled and transient failures.
    /// Intermediate attempts are recorded as `Retrying` on the same result
    /// row; only storage errors escape.
    ///
    /// Returns `None` when the recipient reached a terminal result elsewhere
    /// while this worker was backing off.
    #[instrument(skip_all, fields(notification_id = %notification.id, recipient = %recipient.conversation_ref))]
    pub async fn deliver(
        &self,
        notification: &Notification,
        recipient: &RecipientDescriptor,
    ) -> Result<Option<Attempted>> {
        let mut attempt = 0u32;
        let mut last_class = None;
        loop {
            attempt += 1;
            if attempt > 1
                && self
                    .aggregator
                    .is_terminal(&notification.id, &recipient.conversation_ref)
                    .await?
            {
                debug!(attempt, "recipient finished by another worker; stop retrying");
                return Ok(None);
            }

            let err = match self
                .messenger
                .send(&recipient.conversation_ref, &notification.body)
                .await
            {
                Ok(()) => {
                    return Ok(Some(Attempted {
                        outcome: DeliveryOutcome::Sent,
                        attempts: attempt,
                        error_class: last_class,
                    }))
                }
                Err(err) => err,
            };

            if let SendError::Permanent(reason) = &err {
                warn!(attempt, %reason, "recipient unreachable");
                return Ok(Some(Attempted {
                    outcome: DeliveryOutcome::Failed,
                    attempts: attempt,
                    error_class: Some(ErrorClass::Permanent),
                }));
            }

            if attempt >= self.policy.max_attempts {
                warn!(attempt, error = %err, "retry budget exhausted");
                return Ok(Some(Attempted {
                    outcome: DeliveryOutcome::PermanentlyFailed,
                    attempts: attempt,
                    error_class: Some(err.exhausted_class()),
                }));
            }

            last_class = Some(err.class());
            let recorded = self
                .aggregator
                .record_outcome(
                    &notification.id,
                    recipient,
                    DeliveryOutcome::Retrying,
                    attempt,
                    last_class,
                )
                .await?;
            if !recorded {
                debug!(attempt, "recipient finished by another worker; stop retrying");
                return Ok(None);
            }
            let delay = self.policy.delay_for(&err, attempt);
            warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "send failed; backing off");
            tokio::time::sleep(delay).await;
        }
    }

    /// Finish notifications whose results are all recorded but whose
    /// terminal transition never happened. Returns how many it finished.
    pub async fn sweep_completions(&self) -> Result<usize> {
        let mut finished = 0;
        for id in db::list_completable_notifications(&self.pool).await? {
            if self.aggregator.check_completion(&id).await?.is_some() {
                finished += 1;
            }
        }
        Ok(finished)
    }

    /// Process units until none is claimable, then sweep. Returns how many
    /// units were handled.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while self.process_next_unit().await? {
            processed += 1;
        }
        self.sweep_completions().await?;
        Ok(processed)
    }

    /// Poll the queue until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next_unit().await {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(err) = self.sweep_completions().await {
                        error!(?err, "completion sweep failed");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    error!(?err, "send worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Spawn `count` workers sharing one queue.
pub fn spawn_pool(
    worker: Arc<SendWorker>,
    count: usize,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|_| tokio::spawn(worker.clone().run(poll_interval, shutdown.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert_eq!(p.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let p = policy();
        let throttled = SendError::Throttled {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(p.delay_for(&throttled, 1), Duration::from_secs(2));

        let bare = SendError::Throttled { retry_after: None };
        assert_eq!(p.delay_for(&bare, 2), Duration::from_millis(200));
        let transient = SendError::Transient("reset".into());
        assert_eq!(p.delay_for(&transient, 1), Duration::from_millis(100));
    }
}
