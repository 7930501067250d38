//! Roster source: who can be reached, page by page.
use async_trait::async_trait;
use futures::stream::{self, Stream};

use crate::db::{self, Pool};
use crate::error::ResolutionError;
use crate::model::RecipientDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberScope {
    Team(String),
    Tenant(String),
}

#[derive(Debug, Clone, Default)]
pub struct RosterPage {
    pub members: Vec<RecipientDescriptor>,
    /// Cursor for the following page; `None` on the last page.
    pub next: Option<String>,
}

/// Read-only view of the captured roster.
#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn list_members(
        &self,
        scope: &MemberScope,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<RosterPage, ResolutionError>;

    async fn lookup_user(&self, user_id: &str)
        -> Result<Option<RecipientDescriptor>, ResolutionError>;

    async fn lookup_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<RecipientDescriptor>, ResolutionError>;
}

/// Lazily walk every page of `scope`. Nothing is fetched until polled, and
/// calling this again restarts from the first page.
pub fn member_pages<'a>(
    source: &'a dyn RosterSource,
    scope: &'a MemberScope,
    page_size: u32,
) -> impl Stream<Item = Result<Vec<RecipientDescriptor>, ResolutionError>> + 'a {
    // State: None once the last page was returned, otherwise the next cursor.
    stream::try_unfold(Some(None::<String>), move |cursor| async move {
        let Some(cursor) = cursor else {
            return Ok::<_, ResolutionError>(None);
        };
        let page = source
            .list_members(scope, cursor.as_deref(), page_size)
            .await?;
        Ok(Some((page.members, page.next.map(Some))))
    })
}

/// Roster captured by the chat front-end into SQLite.
#[derive(Clone)]
pub struct SqliteRoster {
    pool: Pool,
}

impl SqliteRoster {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn unavailable(err: anyhow::Error) -> ResolutionError {
    ResolutionError::RosterUnavailable(format!("{err:#}"))
}

#[async_trait]
impl RosterSource for SqliteRoster {
    async fn list_members(
        &self,
        scope: &MemberScope,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<RosterPage, ResolutionError> {
        let rows = match scope {
            MemberScope::Team(team_id) => {
                db::list_team_members(&self.pool, team_id, cursor, limit).await
            }
            MemberScope::Tenant(tenant_id) => {
                db::list_tenant_users(&self.pool, tenant_id, cursor, limit).await
            }
        }
        .map_err(unavailable)?;

        let next = if rows.len() as u32 >= limit {
            rows.last().map(|(key, _)| key.clone())
        } else {
            None
        };
        Ok(RosterPage {
            members: rows.into_iter().map(|(_, d)| d).collect(),
            next,
        })
    }

    async fn lookup_user(
        &self,
        user_id: &str,
    ) -> Result<Option<RecipientDescriptor>, ResolutionError> {
        db::fetch_user(&self.pool, user_id).await.map_err(unavailable)
    }

    async fn lookup_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<RecipientDescriptor>, ResolutionError> {
        db::fetch_channel(&self.pool, channel_id)
            .await
            .map_err(unavailable)
    }
}
