use super::model::{ChannelRecord, NewNotification, RecordedOutcome, TeamRecord, UserRecord};
use crate::model::{
    Audience, Counter, Counters, DeliveryOutcome, DeliveryResult, ErrorClass, Notification,
    NotificationState, RecipientDescriptor, RecipientKind, WorkUnit,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx refuses to open a missing file unless asked to create it.
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_notification(pool: &Pool, draft: &NewNotification) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let audience = serde_json::to_string(&draft.audience).context("encode audience")?;
    sqlx::query(
        "INSERT INTO notifications (id, title, body, audience, state, author, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&draft.title)
    .bind(&draft.body)
    .bind(audience)
    .bind(NotificationState::Draft.as_str())
    .bind(draft.author.as_deref())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn fetch_notification(pool: &Pool, id: &str) -> Result<Option<Notification>> {
    let row = sqlx::query(
        "SELECT id, title, body, audience, state, author, cancelled, resolved, sent, failed, throttled, \
                created_at, started_at, completed_at \
         FROM notifications WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(|row| notification_from_row(&row)).transpose()
}

fn notification_from_row(row: &SqliteRow) -> Result<Notification> {
    let id: String = row.get("id");
    let state_str: String = row.get("state");
    let state = NotificationState::parse_state(&state_str)
        .ok_or_else(|| anyhow!("notification {} has unknown state {}", id, state_str))?;
    let audience_json: String = row.get("audience");
    let audience: Audience = serde_json::from_str(&audience_json)
        .with_context(|| format!("notification {} has malformed audience", id))?;

    Ok(Notification {
        title: row.get("title"),
        body: row.get("body"),
        audience,
        state,
        author: row.try_get::<Option<String>, _>("author").ok().flatten(),
        cancelled: row.get::<i64, _>("cancelled") != 0,
        counters: Counters {
            resolved: row.get("resolved"),
            sent: row.get("sent"),
            failed: row.get("failed"),
            throttled: row.get("throttled"),
        },
        created_at: row.get("created_at"),
        started_at: row
            .try_get::<Option<DateTime<Utc>>, _>("started_at")
            .ok()
            .flatten(),
        completed_at: row
            .try_get::<Option<DateTime<Utc>>, _>("completed_at")
            .ok()
            .flatten(),
        id,
    })
}

/// Draft -> Queued with the resolved count. Returns false when the
/// notification was not in `Draft`.
pub async fn queue_notification_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    resolved: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE notifications SET state = ?, resolved = ?, started_at = ? WHERE id = ? AND state = ?",
    )
    .bind(NotificationState::Queued.as_str())
    .bind(resolved)
    .bind(Utc::now())
    .bind(id)
    .bind(NotificationState::Draft.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Queued -> Sending; a no-op in any other state.
#[instrument(skip_all)]
pub async fn mark_sending(pool: &Pool, id: &str) -> Result<bool> {
    let res = sqlx::query("UPDATE notifications SET state = ? WHERE id = ? AND state = ?")
        .bind(NotificationState::Sending.as_str())
        .bind(id)
        .bind(NotificationState::Queued.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn mark_cancelled(pool: &Pool, id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE notifications SET cancelled = 1 WHERE id = ? AND state IN (?, ?)",
    )
    .bind(id)
    .bind(NotificationState::Queued.as_str())
    .bind(NotificationState::Sending.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn is_cancelled(pool: &Pool, id: &str) -> Result<bool> {
    let flag: Option<i64> = sqlx::query_scalar("SELECT cancelled FROM notifications WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(flag.unwrap_or(0) != 0)
}

/// Guarded terminal transition. Only the caller whose UPDATE matched gets
/// `Some(state)`; every concurrent caller afterwards sees `None`.
#[instrument(skip_all)]
pub async fn try_complete_notification(
    pool: &Pool,
    id: &str,
) -> Result<Option<NotificationState>> {
    let state: Option<String> = sqlx::query_scalar(
        "UPDATE notifications \
         SET state = CASE WHEN failed = 0 THEN ? ELSE ? END, completed_at = ? \
         WHERE id = ? AND state IN (?, ?) AND sent + failed + throttled >= resolved \
         RETURNING state",
    )
    .bind(NotificationState::Completed.as_str())
    .bind(NotificationState::Failed.as_str())
    .bind(Utc::now())
    .bind(id)
    .bind(NotificationState::Queued.as_str())
    .bind(NotificationState::Sending.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(state.and_then(|s| NotificationState::parse_state(&s)))
}

/// Queued/Sending notifications whose results are all in, i.e. ones whose
/// terminal transition is still outstanding.
pub async fn list_completable_notifications(pool: &Pool) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM notifications \
         WHERE state IN (?, ?) AND sent + failed + throttled >= resolved \
         ORDER BY created_at",
    )
    .bind(NotificationState::Queued.as_str())
    .bind(NotificationState::Sending.as_str())
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Work units
// ---------------------------------------------------------------------------

pub async fn insert_work_unit_tx(
    tx: &mut Transaction<'_, Sqlite>,
    notification_id: &str,
    sequence: i64,
    recipients: &[RecipientDescriptor],
) -> Result<i64> {
    let payload = serde_json::to_string(recipients).context("encode work unit")?;
    let rec = sqlx::query(
        "INSERT INTO work_units (notification_id, sequence, recipients, created_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(notification_id)
    .bind(sequence)
    .bind(payload)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

/// Lease the oldest unit that is unclaimed or whose lease has run out.
#[instrument(skip_all)]
pub async fn claim_next_work_unit(pool: &Pool, lease: std::time::Duration) -> Result<Option<WorkUnit>> {
    let now = Utc::now().timestamp_millis();
    let lease_until = now + lease.as_millis() as i64;
    let row = sqlx::query(
        "UPDATE work_units SET claim_count = claim_count + 1, lease_until = ? \
         WHERE id = (SELECT id FROM work_units WHERE lease_until IS NULL OR lease_until <= ? ORDER BY id LIMIT 1) \
         RETURNING id, notification_id, sequence, recipients, claim_count",
    )
    .bind(lease_until)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let id: i64 = row.get("id");
    let payload: String = row.get("recipients");
    let recipients: Vec<RecipientDescriptor> = serde_json::from_str(&payload)
        .with_context(|| format!("work unit {} has malformed recipients", id))?;
    Ok(Some(WorkUnit {
        id,
        notification_id: row.get("notification_id"),
        sequence: row.get("sequence"),
        recipients,
        claim_count: row.get("claim_count"),
    }))
}

/// Push the lease forward. Only the claim that still owns the unit
/// (same `claim_count`) may renew; returns false once another worker has
/// re-claimed it or the unit is gone.
pub async fn renew_lease(
    pool: &Pool,
    id: i64,
    claim_count: i32,
    lease: std::time::Duration,
) -> Result<bool> {
    let lease_until = Utc::now().timestamp_millis() + lease.as_millis() as i64;
    let res = sqlx::query("UPDATE work_units SET lease_until = ? WHERE id = ? AND claim_count = ?")
        .bind(lease_until)
        .bind(id)
        .bind(claim_count)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn delete_work_unit(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM work_units WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_work_units(pool: &Pool, notification_id: Option<&str>) -> Result<i64> {
    let count: i64 = match notification_id {
        Some(id) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM work_units WHERE notification_id = ?")
                .bind(id)
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM work_units")
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

// ---------------------------------------------------------------------------
// Delivery results
// ---------------------------------------------------------------------------

/// Upsert one delivery result and, if it is the first terminal write for the
/// pair, bump the matching notification counter in the same transaction.
///
/// Returns false when the pair already had a terminal result (nothing written).
#[instrument(skip_all)]
pub async fn record_delivery_result(pool: &Pool, rec: &RecordedOutcome<'_>) -> Result<bool> {
    let terminal = rec.outcome.is_terminal();
    let mut tx = pool.begin().await?;
    // Write first so the transaction takes the write lock up front.
    let res = sqlx::query(
        "INSERT INTO delivery_results \
            (notification_id, recipient_ref, display_name, outcome, terminal, attempts, error_class, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(notification_id, recipient_ref) DO UPDATE SET \
            outcome = excluded.outcome, terminal = excluded.terminal, attempts = excluded.attempts, \
            error_class = excluded.error_class, updated_at = excluded.updated_at \
         WHERE delivery_results.terminal = 0",
    )
    .bind(rec.notification_id)
    .bind(rec.recipient_ref)
    .bind(rec.display_name)
    .bind(rec.outcome.as_str())
    .bind(terminal as i64)
    .bind(rec.attempts)
    .bind(rec.error_class.map(|c| c.as_str()))
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    if res.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    if let Some(counter) = Counter::for_outcome(rec.outcome, rec.error_class) {
        let col = counter.column();
        let sql = format!("UPDATE notifications SET {col} = {col} + 1 WHERE id = ?");
        sqlx::query(&sql)
            .bind(rec.notification_id)
            .execute(&mut *tx)
            .await
            .context("failed to bump notification counter")?;
    }
    tx.commit().await?;
    Ok(true)
}

pub async fn has_terminal_result(pool: &Pool, notification_id: &str, recipient_ref: &str) -> Result<bool> {
    let terminal: Option<i64> = sqlx::query_scalar(
        "SELECT terminal FROM delivery_results WHERE notification_id = ? AND recipient_ref = ?",
    )
    .bind(notification_id)
    .bind(recipient_ref)
    .fetch_optional(pool)
    .await?;
    Ok(terminal.unwrap_or(0) != 0)
}

#[instrument(skip_all)]
pub async fn list_delivery_results(pool: &Pool, notification_id: &str) -> Result<Vec<DeliveryResult>> {
    let rows = sqlx::query(
        "SELECT notification_id, recipient_ref, display_name, outcome, attempts, error_class, updated_at \
         FROM delivery_results WHERE notification_id = ? ORDER BY recipient_ref",
    )
    .bind(notification_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let outcome_str: String = row.get("outcome");
            let outcome = DeliveryOutcome::parse_outcome(&outcome_str)
                .ok_or_else(|| anyhow!("unknown delivery outcome {}", outcome_str))?;
            Ok(DeliveryResult {
                notification_id: row.get("notification_id"),
                recipient_ref: row.get("recipient_ref"),
                display_name: row.try_get::<Option<String>, _>("display_name").ok().flatten(),
                outcome,
                attempts: row.get("attempts"),
                error_class: row
                    .try_get::<Option<String>, _>("error_class")
                    .ok()
                    .flatten()
                    .and_then(|s| ErrorClass::parse_class(&s)),
                updated_at: row.get("updated_at"),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn upsert_team(pool: &Pool, team: &TeamRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO roster_teams (team_id, tenant_id, name, conversation_ref, active, updated_at) \
         VALUES (?, ?, ?, ?, 1, ?) \
         ON CONFLICT(team_id) DO UPDATE SET tenant_id = excluded.tenant_id, \
            name = COALESCE(excluded.name, roster_teams.name), \
            conversation_ref = excluded.conversation_ref, active = 1, updated_at = excluded.updated_at",
    )
    .bind(&team.team_id)
    .bind(&team.tenant_id)
    .bind(team.name.as_deref())
    .bind(&team.conversation_ref)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn deactivate_team(pool: &Pool, team_id: &str) -> Result<bool> {
    let res = sqlx::query("UPDATE roster_teams SET active = 0, updated_at = ? WHERE team_id = ?")
        .bind(Utc::now())
        .bind(team_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn rename_team(pool: &Pool, team_id: &str, name: &str) -> Result<bool> {
    let res = sqlx::query("UPDATE roster_teams SET name = ?, updated_at = ? WHERE team_id = ?")
        .bind(name)
        .bind(Utc::now())
        .bind(team_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn upsert_user(pool: &Pool, user: &UserRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO roster_users (user_id, tenant_id, name, conversation_ref, updated_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET tenant_id = excluded.tenant_id, \
            name = COALESCE(excluded.name, roster_users.name), \
            conversation_ref = excluded.conversation_ref, updated_at = excluded.updated_at",
    )
    .bind(&user.user_id)
    .bind(&user.tenant_id)
    .bind(user.name.as_deref())
    .bind(&user.conversation_ref)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_channel(pool: &Pool, channel: &ChannelRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO roster_channels (channel_id, team_id, tenant_id, name, conversation_ref, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(channel_id) DO UPDATE SET team_id = excluded.team_id, tenant_id = excluded.tenant_id, \
            name = COALESCE(excluded.name, roster_channels.name), \
            conversation_ref = excluded.conversation_ref, updated_at = excluded.updated_at",
    )
    .bind(&channel.channel_id)
    .bind(channel.team_id.as_deref())
    .bind(&channel.tenant_id)
    .bind(channel.name.as_deref())
    .bind(&channel.conversation_ref)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn add_team_member(pool: &Pool, team_id: &str, user_id: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO team_members (team_id, user_id) VALUES (?, ?)")
        .bind(team_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

fn user_descriptor(row: &SqliteRow, team_id: Option<&str>) -> RecipientDescriptor {
    RecipientDescriptor {
        conversation_ref: row.get("conversation_ref"),
        kind: RecipientKind::User,
        display_name: row.try_get::<Option<String>, _>("name").ok().flatten(),
        team_id: team_id.map(str::to_string),
        tenant_id: row.get("tenant_id"),
    }
}

/// `None` if the team is unknown, otherwise whether it is still active.
pub async fn team_is_active(pool: &Pool, team_id: &str) -> Result<Option<bool>> {
    let active: Option<i64> = sqlx::query_scalar("SELECT active FROM roster_teams WHERE team_id = ?")
        .bind(team_id)
        .fetch_optional(pool)
        .await?;
    Ok(active.map(|a| a != 0))
}

/// One keyset page of a team's members, ordered by user id.
#[instrument(skip_all)]
pub async fn list_team_members(
    pool: &Pool,
    team_id: &str,
    after: Option<&str>,
    limit: u32,
) -> Result<Vec<(String, RecipientDescriptor)>> {
    let rows = sqlx::query(
        "SELECT u.user_id, u.tenant_id, u.name, u.conversation_ref \
         FROM team_members m \
         JOIN roster_users u ON u.user_id = m.user_id \
         JOIN roster_teams t ON t.team_id = m.team_id \
         WHERE m.team_id = ? AND t.active = 1 AND u.user_id > ? \
         ORDER BY u.user_id LIMIT ?",
    )
    .bind(team_id)
    .bind(after.unwrap_or(""))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("user_id"), user_descriptor(row, Some(team_id))))
        .collect())
}

/// One keyset page of a tenant's users, ordered by user id.
#[instrument(skip_all)]
pub async fn list_tenant_users(
    pool: &Pool,
    tenant_id: &str,
    after: Option<&str>,
    limit: u32,
) -> Result<Vec<(String, RecipientDescriptor)>> {
    let rows = sqlx::query(
        "SELECT user_id, tenant_id, name, conversation_ref FROM roster_users \
         WHERE tenant_id = ? AND user_id > ? ORDER BY user_id LIMIT ?",
    )
    .bind(tenant_id)
    .bind(after.unwrap_or(""))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("user_id"), user_descriptor(row, None)))
        .collect())
}

pub async fn fetch_user(pool: &Pool, user_id: &str) -> Result<Option<RecipientDescriptor>> {
    let row = sqlx::query(
        "SELECT user_id, tenant_id, name, conversation_ref FROM roster_users WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| user_descriptor(&row, None)))
}

pub async fn fetch_channel(pool: &Pool, channel_id: &str) -> Result<Option<RecipientDescriptor>> {
    let row = sqlx::query(
        "SELECT channel_id, team_id, tenant_id, name, conversation_ref FROM roster_channels WHERE channel_id = ?",
    )
    .bind(channel_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| RecipientDescriptor {
        conversation_ref: row.get("conversation_ref"),
        kind: RecipientKind::Channel,
        display_name: row.try_get::<Option<String>, _>("name").ok().flatten(),
        team_id: row.try_get::<Option<String>, _>("team_id").ok().flatten(),
        tenant_id: row.get("tenant_id"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_pool() -> (TempDir, Pool) {
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/repo.db", td.path().display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (td, pool)
    }

    fn draft() -> NewNotification {
        NewNotification {
            title: "Hello".into(),
            body: "payload".into(),
            audience: Audience::Users(vec!["u1".into()]),
            author: Some("alice".into()),
        }
    }

    #[test]
    fn memory_url_passes_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn file_url_gets_create_mode() {
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nested/x.db", td.path().display());
        let prepared = prepare_sqlite_url(&url);
        assert!(prepared.ends_with("nested/x.db?mode=rwc"));
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn notification_round_trip_and_guarded_queue() {
        let (_td, pool) = setup_pool().await;
        let id = insert_notification(&pool, &draft()).await.unwrap();

        let n = fetch_notification(&pool, &id).await.unwrap().unwrap();
        assert_eq!(n.state, NotificationState::Draft);
        assert_eq!(n.audience, Audience::Users(vec!["u1".into()]));
        assert_eq!(n.author.as_deref(), Some("alice"));
        assert!(n.started_at.is_none());

        let mut tx = pool.begin().await.unwrap();
        assert!(queue_notification_tx(&mut tx, &id, 1).await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        assert!(!queue_notification_tx(&mut tx, &id, 1).await.unwrap());
        tx.rollback().await.unwrap();

        let n = fetch_notification(&pool, &id).await.unwrap().unwrap();
        assert_eq!(n.state, NotificationState::Queued);
        assert_eq!(n.counters.resolved, 1);
        assert!(n.started_at.is_some());
        assert!(fetch_notification(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_unit_is_not_claimed_twice() {
        let (_td, pool) = setup_pool().await;
        let id = insert_notification(&pool, &draft()).await.unwrap();
        let recipient = RecipientDescriptor {
            conversation_ref: "42".into(),
            kind: RecipientKind::User,
            display_name: Some("Bob".into()),
            team_id: None,
            tenant_id: "contoso".into(),
        };
        let mut tx = pool.begin().await.unwrap();
        insert_work_unit_tx(&mut tx, &id, 0, &[recipient.clone()])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let lease = std::time::Duration::from_secs(60);
        let unit = claim_next_work_unit(&pool, lease).await.unwrap().unwrap();
        assert_eq!(unit.recipients, vec![recipient]);
        assert_eq!(unit.claim_count, 1);
        assert!(claim_next_work_unit(&pool, lease).await.unwrap().is_none());

        // An expired lease makes the unit claimable again.
        sqlx::query("UPDATE work_units SET lease_until = 0")
            .execute(&pool)
            .await
            .unwrap();
        let again = claim_next_work_unit(&pool, lease).await.unwrap().unwrap();
        assert_eq!(again.id, unit.id);
        assert_eq!(again.claim_count, 2);

        // The first claim lost ownership; only the current one may renew.
        assert!(!renew_lease(&pool, unit.id, unit.claim_count, lease).await.unwrap());
        assert!(renew_lease(&pool, again.id, again.claim_count, lease).await.unwrap());
        assert!(claim_next_work_unit(&pool, lease).await.unwrap().is_none());

        delete_work_unit(&pool, unit.id).await.unwrap();
        assert_eq!(count_work_units(&pool, Some(&id)).await.unwrap(), 0);
        assert!(!renew_lease(&pool, again.id, again.claim_count, lease).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_result_is_written_once() {
        let (_td, pool) = setup_pool().await;
        let id = insert_notification(&pool, &draft()).await.unwrap();
        let mut tx = pool.begin().await.unwrap();
        queue_notification_tx(&mut tx, &id, 1).await.unwrap();
        tx.commit().await.unwrap();

        let mut rec = RecordedOutcome {
            notification_id: &id,
            recipient_ref: "42",
            display_name: Some("Bob"),
            outcome: DeliveryOutcome::Retrying,
            attempts: 1,
            error_class: Some(ErrorClass::Throttled),
        };
        assert!(record_delivery_result(&pool, &rec).await.unwrap());
        assert!(!has_terminal_result(&pool, &id, "42").await.unwrap());

        rec.outcome = DeliveryOutcome::Sent;
        rec.attempts = 2;
        rec.error_class = None;
        assert!(record_delivery_result(&pool, &rec).await.unwrap());
        assert!(!record_delivery_result(&pool, &rec).await.unwrap());

        let n = fetch_notification(&pool, &id).await.unwrap().unwrap();
        assert_eq!(n.counters.sent, 1);

        assert_eq!(list_completable_notifications(&pool).await.unwrap(), vec![id.clone()]);
        assert_eq!(
            try_complete_notification(&pool, &id).await.unwrap(),
            Some(NotificationState::Completed)
        );
        assert!(list_completable_notifications(&pool).await.unwrap().is_empty());

        let results = list_delivery_results(&pool, &id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, DeliveryOutcome::Sent);
        assert_eq!(results[0].attempts, 2);
        assert_eq!(results[0].error_class, None);
    }

    #[tokio::test]
    async fn team_member_pages() {
        let (_td, pool) = setup_pool().await;
        upsert_team(
            &pool,
            &TeamRecord {
                team_id: "t1".into(),
                tenant_id: "contoso".into(),
                name: Some("Ops".into()),
                conversation_ref: "-100".into(),
            },
        )
        .await
        .unwrap();
        for uid in ["a", "b", "c"] {
            upsert_user(
                &pool,
                &UserRecord {
                    user_id: uid.into(),
                    tenant_id: "contoso".into(),
                    name: None,
                    conversation_ref: format!("chat-{uid}"),
                },
            )
            .await
            .unwrap();
            add_team_member(&pool, "t1", uid).await.unwrap();
        }
        add_team_member(&pool, "t1", "a").await.unwrap();

        let first = list_team_members(&pool, "t1", None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let last_key = first.last().map(|(k, _)| k.clone());
        let second = list_team_members(&pool, "t1", last_key.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].1.conversation_ref, "chat-c");
        assert_eq!(second[0].1.team_id.as_deref(), Some("t1"));

        assert!(deactivate_team(&pool, "t1").await.unwrap());
        assert_eq!(team_is_active(&pool, "t1").await.unwrap(), Some(false));
        assert!(list_team_members(&pool, "t1", None, 10).await.unwrap().is_empty());
    }
}
