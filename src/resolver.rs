//! Expands an audience into a deduplicated list of recipients.
use std::collections::HashSet;
use std::sync::Arc;

use futures::TryStreamExt;
use tracing::{debug, info, instrument, warn};

use crate::config::TenantFilter;
use crate::error::ResolutionError;
use crate::model::{Audience, RecipientDescriptor};
use crate::roster::{member_pages, MemberScope, RosterSource};

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub page_size: u32,
    pub filter: TenantFilter,
}

/// First-seen-wins set keyed on conversation reference.
#[derive(Debug, Default)]
struct RecipientSet {
    seen: HashSet<String>,
    items: Vec<RecipientDescriptor>,
}

impl RecipientSet {
    fn insert(&mut self, d: RecipientDescriptor) -> bool {
        if !self.seen.insert(d.conversation_ref.clone()) {
            return false;
        }
        self.items.push(d);
        true
    }
}

pub struct Resolver {
    roster: Arc<dyn RosterSource>,
    options: ResolverOptions,
}

impl Resolver {
    pub fn new(roster: Arc<dyn RosterSource>, options: ResolverOptions) -> Self {
        Self { roster, options }
    }

    /// Resolve `audience` against the current roster. Output order follows
    /// roster order, so repeated calls against an unchanged roster are equal.
    #[instrument(skip_all)]
    pub async fn resolve(
        &self,
        audience: &Audience,
    ) -> Result<Vec<RecipientDescriptor>, ResolutionError> {
        let mut set = RecipientSet::default();
        match audience {
            Audience::Teams(team_ids) => {
                for team_id in non_blank(team_ids) {
                    self.collect_scope(MemberScope::Team(team_id.to_string()), &mut set)
                        .await?;
                }
            }
            Audience::AllUsers(tenant_id) => {
                self.collect_scope(MemberScope::Tenant(tenant_id.trim().to_string()), &mut set)
                    .await?;
            }
            Audience::Users(user_ids) => {
                for user_id in non_blank(user_ids) {
                    match self.roster.lookup_user(user_id).await? {
                        Some(d) => self.admit(d, &mut set),
                        None => warn!(user_id, "user not in roster; skipping"),
                    }
                }
            }
            Audience::Channels(channel_ids) => {
                for channel_id in non_blank(channel_ids) {
                    match self.roster.lookup_channel(channel_id).await? {
                        Some(d) => self.admit(d, &mut set),
                        None => warn!(channel_id, "channel not in roster; skipping"),
                    }
                }
            }
        }
        info!(resolved = set.items.len(), "audience resolved");
        Ok(set.items)
    }

    async fn collect_scope(
        &self,
        scope: MemberScope,
        set: &mut RecipientSet,
    ) -> Result<(), ResolutionError> {
        let pages = member_pages(self.roster.as_ref(), &scope, self.options.page_size);
        futures::pin_mut!(pages);
        while let Some(page) = pages.try_next().await? {
            for d in page {
                self.admit(d, set);
            }
        }
        Ok(())
    }

    fn admit(&self, d: RecipientDescriptor, set: &mut RecipientSet) {
        if !self.options.filter.allows(&d.tenant_id) {
            debug!(tenant = %d.tenant_id, "recipient tenant filtered out");
            return;
        }
        set.insert(d);
    }
}

fn non_blank(ids: &[String]) -> impl Iterator<Item = &str> {
    ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecipientKind;
    use crate::roster::RosterPage;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn user(id: &str, tenant: &str) -> RecipientDescriptor {
        RecipientDescriptor {
            conversation_ref: format!("conv-{id}"),
            kind: RecipientKind::User,
            display_name: Some(id.to_uppercase()),
            team_id: None,
            tenant_id: tenant.into(),
        }
    }

    #[derive(Default)]
    struct FakeRoster {
        teams: HashMap<String, Vec<RecipientDescriptor>>,
        tenant: Vec<RecipientDescriptor>,
        users: HashMap<String, RecipientDescriptor>,
        fail: bool,
        page_calls: AtomicUsize,
    }

    #[async_trait]
    impl RosterSource for FakeRoster {
        async fn list_members(
            &self,
            scope: &MemberScope,
            cursor: Option<&str>,
            limit: u32,
        ) -> Result<RosterPage, ResolutionError> {
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ResolutionError::RosterUnavailable("down".into()));
            }
            let all = match scope {
                MemberScope::Team(id) => self.teams.get(id).cloned().unwrap_or_default(),
                MemberScope::Tenant(_) => self.tenant.clone(),
            };
            let start: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (start + limit as usize).min(all.len());
            Ok(RosterPage {
                members: all[start..end].to_vec(),
                next: (end < all.len()).then(|| end.to_string()),
            })
        }

        async fn lookup_user(
            &self,
            user_id: &str,
        ) -> Result<Option<RecipientDescriptor>, ResolutionError> {
            Ok(self.users.get(user_id).cloned())
        }

        async fn lookup_channel(
            &self,
            _channel_id: &str,
        ) -> Result<Option<RecipientDescriptor>, ResolutionError> {
            Ok(None)
        }
    }

    fn resolver(roster: FakeRoster, filter: TenantFilter) -> (Arc<FakeRoster>, Resolver) {
        let roster = Arc::new(roster);
        let r = Resolver::new(
            roster.clone(),
            ResolverOptions {
                page_size: 2,
                filter,
            },
        );
        (roster, r)
    }

    #[tokio::test]
    async fn overlapping_teams_resolve_each_user_once() {
        let mut roster = FakeRoster::default();
        roster.teams.insert(
            "t1".into(),
            vec![user("a", "x"), user("b", "x"), user("c", "x")],
        );
        roster
            .teams
            .insert("t2".into(), vec![user("c", "x"), user("d", "x")]);
        let (_, r) = resolver(roster, TenantFilter::open());

        let audience = Audience::Teams(vec!["t1".into(), "t2".into(), "t1".into()]);
        let got = r.resolve(&audience).await.unwrap();
        let refs: Vec<_> = got.iter().map(|d| d.conversation_ref.as_str()).collect();
        assert_eq!(refs, vec!["conv-a", "conv-b", "conv-c", "conv-d"]);

        let again = r.resolve(&audience).await.unwrap();
        assert_eq!(got, again);
    }

    #[tokio::test]
    async fn all_users_walks_every_page() {
        let mut roster = FakeRoster::default();
        roster.tenant = (0..5).map(|i| user(&i.to_string(), "x")).collect();
        let (roster, r) = resolver(roster, TenantFilter::open());

        let got = r.resolve(&Audience::AllUsers("x".into())).await.unwrap();
        assert_eq!(got.len(), 5);
        // 5 members at 2 per page.
        assert_eq!(roster.page_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_team_resolves_to_nothing() {
        let mut roster = FakeRoster::default();
        roster.teams.insert("t0".into(), vec![]);
        let (_, r) = resolver(roster, TenantFilter::open());
        let got = r.resolve(&Audience::Teams(vec!["t0".into()])).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn unknown_users_are_skipped_and_tenant_filter_applies() {
        let mut roster = FakeRoster::default();
        roster.users.insert("a".into(), user("a", "contoso"));
        roster.users.insert("b".into(), user("b", "fabrikam"));
        let (_, r) = resolver(roster, TenantFilter::new(false, vec!["contoso".to_string()]));

        let got = r
            .resolve(&Audience::Users(vec![
                "a".into(),
                "b".into(),
                "ghost".into(),
                " ".into(),
            ]))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].conversation_ref, "conv-a");
    }

    #[tokio::test]
    async fn roster_outage_is_a_resolution_error() {
        let roster = FakeRoster {
            fail: true,
            ..Default::default()
        };
        let (_, r) = resolver(roster, TenantFilter::open());
        let err = r
            .resolve(&Audience::AllUsers("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::RosterUnavailable(_)));
    }
}
