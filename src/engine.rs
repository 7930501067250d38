//! Authoring-side entry points: draft, start, cancel, and observe.
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::aggregator::Aggregator;
use crate::batcher::Batcher;
use crate::config::Config;
use crate::db::{self, NewNotification, Pool};
use crate::error::EngineError;
use crate::model::{Audience, DeliveryResult, Notification, NotificationState};
use crate::resolver::{Resolver, ResolverOptions};
use crate::roster::{RosterSource, SqliteRoster};

#[derive(Clone)]
pub struct DeliveryEngine {
    pool: Pool,
    resolver: Arc<Resolver>,
    batcher: Batcher,
    aggregator: Aggregator,
}

impl DeliveryEngine {
    pub fn new(
        pool: Pool,
        roster: Arc<dyn RosterSource>,
        options: ResolverOptions,
        batch_size: usize,
    ) -> Self {
        Self {
            resolver: Arc::new(Resolver::new(roster, options)),
            batcher: Batcher::new(pool.clone(), batch_size),
            aggregator: Aggregator::new(pool.clone()),
            pool,
        }
    }

    /// Engine over the SQLite-captured roster.
    pub fn from_config(pool: Pool, cfg: &Config) -> Self {
        let roster = Arc::new(SqliteRoster::new(pool.clone()));
        Self::new(pool, roster, cfg.resolver_options(), cfg.delivery.batch_size)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Shared with workers so terminal events reach this engine's subscribers.
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    #[instrument(skip_all)]
    pub async fn create_draft(
        &self,
        title: &str,
        body: &str,
        audience: Audience,
        author: Option<&str>,
    ) -> Result<String, EngineError> {
        if title.trim().is_empty() {
            return Err(EngineError::InvalidDraft("title must be non-empty"));
        }
        if audience.is_empty() {
            return Err(EngineError::InvalidDraft("audience must name at least one target"));
        }
        let id = db::insert_notification(
            &self.pool,
            &NewNotification {
                title: title.trim().to_string(),
                body: body.to_string(),
                audience,
                author: author.map(str::to_string),
            },
        )
        .await?;
        info!(notification_id = %id, "draft created");
        Ok(id)
    }

    /// Resolve the audience and queue the work units. Returns the number of
    /// units created. On any error the notification is left in `Draft`.
    #[instrument(skip_all, fields(notification_id = %id))]
    pub async fn start_delivery(&self, id: &str) -> Result<usize, EngineError> {
        let notification = self.load(id).await?;
        if notification.state != NotificationState::Draft {
            return Err(EngineError::AlreadyStarted {
                id: notification.id,
                state: notification.state,
            });
        }

        let recipients = match self.resolver.resolve(&notification.audience).await {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "audience resolution failed; draft unchanged");
                return Err(err.into());
            }
        };

        // A concurrent start loses here, inside the queueing transaction.
        let units = self.batcher.enqueue(id, &recipients).await?;

        if recipients.is_empty() {
            self.aggregator.check_completion(id).await?;
        }
        Ok(units)
    }

    /// Flag a queued or sending notification as cancelled. Recipients not yet
    /// attempted are recorded as cancelled failures by the workers.
    #[instrument(skip_all, fields(notification_id = %id))]
    pub async fn cancel(&self, id: &str) -> Result<(), EngineError> {
        if db::mark_cancelled(&self.pool, id).await? {
            info!("notification cancelled");
            return Ok(());
        }
        let n = self.load(id).await?;
        Err(EngineError::NotCancellable {
            id: n.id,
            state: n.state,
        })
    }

    pub async fn progress(&self, id: &str) -> Result<Notification, EngineError> {
        self.load(id).await
    }

    pub async fn results(&self, id: &str) -> Result<Vec<DeliveryResult>, EngineError> {
        self.load(id).await?;
        Ok(db::list_delivery_results(&self.pool, id).await?)
    }

    /// Poll until the notification is `Completed` or `Failed`.
    pub async fn wait_for_terminal(
        &self,
        id: &str,
        poll: Duration,
    ) -> Result<Notification, EngineError> {
        loop {
            let n = self.load(id).await?;
            if n.state.is_terminal() {
                return Ok(n);
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn load(&self, id: &str) -> Result<Notification, EngineError> {
        db::fetch_notification(&self.pool, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }
}
