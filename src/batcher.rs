//! Splits a resolved audience into work units and commits them to the queue.
use tracing::{info, instrument};

use crate::db::{self, Pool};
use crate::error::EngineError;
use crate::model::RecipientDescriptor;

#[derive(Clone)]
pub struct Batcher {
    pool: Pool,
    batch_size: usize,
}

impl Batcher {
    pub fn new(pool: Pool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Number of work units `recipients` recipients will be split into.
    pub fn unit_count(&self, recipients: usize) -> usize {
        recipients.div_ceil(self.batch_size)
    }

    /// Record `resolved`, move the notification to `Queued` and insert its
    /// work units, all in one transaction. The state change is written first,
    /// so no unit is ever visible for a notification still in `Draft`.
    #[instrument(skip_all, fields(notification_id = %notification_id))]
    pub async fn enqueue(
        &self,
        notification_id: &str,
        recipients: &[RecipientDescriptor],
    ) -> Result<usize, EngineError> {
        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;

        let queued =
            db::queue_notification_tx(&mut tx, notification_id, recipients.len() as i64).await?;
        if !queued {
            tx.rollback().await.map_err(anyhow::Error::from)?;
            return Err(match db::fetch_notification(&self.pool, notification_id).await? {
                None => EngineError::NotFound(notification_id.to_string()),
                Some(n) => EngineError::AlreadyStarted {
                    id: n.id,
                    state: n.state,
                },
            });
        }

        let mut units = 0;
        for (sequence, chunk) in recipients.chunks(self.batch_size).enumerate() {
            db::insert_work_unit_tx(&mut tx, notification_id, sequence as i64, chunk).await?;
            units += 1;
        }
        tx.commit().await.map_err(anyhow::Error::from)?;

        info!(
            resolved = recipients.len(),
            units,
            batch_size = self.batch_size,
            "notification queued"
        );
        Ok(units)
    }
}
