//! Chat front-end: turns incoming Telegram messages into roster updates.
use crate::config::TenantFilter;
use crate::db::{self, ChannelRecord, Pool, TeamRecord, UserRecord};
use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{Chat, User};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenUser {
    pub user_id: String,
    pub name: Option<String>,
    /// Private chat with the bot; Telegram uses the user id for it.
    pub conversation_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenTeam {
    pub team_id: String,
    pub name: Option<String>,
    pub conversation_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Ping,
    Unknown(String),
}

/// One fact the front-end learned from an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    BotAdded { team: SeenTeam },
    BotRemoved { team_id: String },
    TeamRenamed { team_id: String, name: String },
    MemberSeen { team: SeenTeam, user: SeenUser },
    UserSeen { user: SeenUser },
    ChannelSeen { channel: SeenTeam },
    Command(Command),
}

fn seen_user(user: &User) -> SeenUser {
    let name = match &user.last_name {
        Some(last) => format!("{} {}", user.first_name, last),
        None => user.first_name.clone(),
    };
    SeenUser {
        user_id: user.id.0.to_string(),
        name: Some(name),
        conversation_ref: user.id.0.to_string(),
    }
}

fn seen_chat(chat: &Chat) -> SeenTeam {
    SeenTeam {
        team_id: chat.id.0.to_string(),
        name: chat.title().map(str::to_string),
        conversation_ref: chat.id.0.to_string(),
    }
}

pub fn parse_command(text: &str) -> Option<Command> {
    let word = text.split_whitespace().next()?;
    if !word.starts_with('/') {
        return None;
    }
    // "/ping@my_bot" in groups.
    let name = word.split('@').next().unwrap_or(word);
    Some(match name {
        "/start" => Command::Start,
        "/ping" => Command::Ping,
        other => Command::Unknown(other.to_string()),
    })
}

/// Everything `msg` tells us about the roster, in the order it should be
/// applied.
pub fn events_from_message(msg: &Message, bot_id: UserId) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    let chat = &msg.chat;

    if chat.is_channel() {
        events.push(ChatEvent::ChannelSeen {
            channel: seen_chat(chat),
        });
        return events;
    }

    if chat.is_private() {
        if let Some(user) = msg.from().filter(|u| !u.is_bot) {
            events.push(ChatEvent::UserSeen {
                user: seen_user(user),
            });
        }
    } else if chat.is_group() || chat.is_supergroup() {
        let team = seen_chat(chat);

        if let Some(members) = msg.new_chat_members() {
            for member in members {
                if member.id == bot_id {
                    events.push(ChatEvent::BotAdded { team: team.clone() });
                } else if !member.is_bot {
                    events.push(ChatEvent::MemberSeen {
                        team: team.clone(),
                        user: seen_user(member),
                    });
                }
            }
        }
        if let Some(left) = msg.left_chat_member() {
            if left.id == bot_id {
                events.push(ChatEvent::BotRemoved {
                    team_id: team.team_id.clone(),
                });
                return events;
            }
        }
        if let Some(title) = msg.new_chat_title() {
            events.push(ChatEvent::TeamRenamed {
                team_id: team.team_id.clone(),
                name: title.to_string(),
            });
        }
        if let Some(user) = msg.from().filter(|u| !u.is_bot && u.id != bot_id) {
            events.push(ChatEvent::MemberSeen {
                team,
                user: seen_user(user),
            });
        }
    }

    if let Some(cmd) = msg.text().and_then(parse_command) {
        events.push(ChatEvent::Command(cmd));
    }
    events
}

/// Write one event into the roster tables. Returns false when the tenant
/// gate dropped it.
#[instrument(skip_all)]
pub async fn apply_event(
    pool: &Pool,
    tenant_id: &str,
    filter: &TenantFilter,
    event: &ChatEvent,
) -> Result<bool> {
    if !filter.allows(tenant_id) {
        debug!(tenant_id, "event from filtered tenant dropped");
        return Ok(false);
    }
    match event {
        ChatEvent::BotAdded { team } => {
            db::upsert_team(pool, &team_record(tenant_id, team)).await?;
            info!(team_id = %team.team_id, "bot added to team");
        }
        ChatEvent::BotRemoved { team_id } => {
            if db::deactivate_team(pool, team_id).await? {
                info!(%team_id, "bot removed from team");
            }
        }
        ChatEvent::TeamRenamed { team_id, name } => {
            db::rename_team(pool, team_id, name).await?;
        }
        ChatEvent::MemberSeen { team, user } => {
            // Membership rows reference both sides.
            db::upsert_team(pool, &team_record(tenant_id, team)).await?;
            db::upsert_user(pool, &user_record(tenant_id, user)).await?;
            db::add_team_member(pool, &team.team_id, &user.user_id).await?;
        }
        ChatEvent::UserSeen { user } => {
            db::upsert_user(pool, &user_record(tenant_id, user)).await?;
        }
        ChatEvent::ChannelSeen { channel } => {
            db::upsert_channel(
                pool,
                &ChannelRecord {
                    channel_id: channel.team_id.clone(),
                    team_id: None,
                    tenant_id: tenant_id.to_string(),
                    name: channel.name.clone(),
                    conversation_ref: channel.conversation_ref.clone(),
                },
            )
            .await?;
        }
        ChatEvent::Command(_) => {}
    }
    Ok(true)
}

fn team_record(tenant_id: &str, team: &SeenTeam) -> TeamRecord {
    TeamRecord {
        team_id: team.team_id.clone(),
        tenant_id: tenant_id.to_string(),
        name: team.name.clone(),
        conversation_ref: team.conversation_ref.clone(),
    }
}

fn user_record(tenant_id: &str, user: &SeenUser) -> UserRecord {
    UserRecord {
        user_id: user.user_id.clone(),
        tenant_id: tenant_id.to_string(),
        name: user.name.clone(),
        conversation_ref: user.conversation_ref.clone(),
    }
}

/// Shared state for the update handler.
#[derive(Clone)]
pub struct FrontEnd {
    pub pool: Pool,
    pub tenant_id: String,
    pub filter: TenantFilter,
    pub bot_id: UserId,
}

#[instrument(skip_all, fields(chat_id = msg.chat.id.0))]
pub async fn handle_update(bot: &Bot, state: &FrontEnd, msg: &Message) -> Result<()> {
    for event in events_from_message(msg, state.bot_id) {
        if let ChatEvent::Command(cmd) = &event {
            reply_to_command(bot, msg, cmd).await;
            continue;
        }
        if !apply_event(&state.pool, &state.tenant_id, &state.filter, &event).await? {
            return Ok(());
        }
    }
    Ok(())
}

async fn reply_to_command(bot: &Bot, msg: &Message, cmd: &Command) {
    let text = match cmd {
        Command::Start => "Subscribed. Announcements will arrive in this chat.",
        Command::Ping => "PONG",
        Command::Unknown(_) if msg.chat.is_private() => "Unknown command.",
        Command::Unknown(_) => return,
    };
    if let Err(err) = bot.send_message(msg.chat.id, text).await {
        warn!(?err, "failed to answer command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecipientKind;

    async fn setup_pool() -> (tempfile::TempDir, Pool) {
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/handlers.db", td.path().display());
        let pool = db::init_pool(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        (td, pool)
    }

    fn team() -> SeenTeam {
        SeenTeam {
            team_id: "-1001".into(),
            name: Some("Ops".into()),
            conversation_ref: "-1001".into(),
        }
    }

    fn user(id: &str) -> SeenUser {
        SeenUser {
            user_id: id.into(),
            name: Some(format!("User {id}")),
            conversation_ref: id.into(),
        }
    }

    #[test]
    fn command_parsing() {
        assert_eq!(parse_command("/ping"), Some(Command::Ping));
        assert_eq!(parse_command("  /start now"), Some(Command::Start));
        assert_eq!(parse_command("/ping@watch_bot"), Some(Command::Ping));
        assert_eq!(
            parse_command("/begin"),
            Some(Command::Unknown("/begin".into()))
        );
        assert_eq!(parse_command("hello /ping"), None);
        assert_eq!(parse_command(""), None);
    }

    #[tokio::test]
    async fn captured_members_become_resolvable() {
        let (_td, pool) = setup_pool().await;
        let filter = TenantFilter::open();

        apply_event(&pool, "contoso", &filter, &ChatEvent::BotAdded { team: team() })
            .await
            .unwrap();
        for id in ["11", "12"] {
            apply_event(
                &pool,
                "contoso",
                &filter,
                &ChatEvent::MemberSeen {
                    team: team(),
                    user: user(id),
                },
            )
            .await
            .unwrap();
        }
        apply_event(
            &pool,
            "contoso",
            &filter,
            &ChatEvent::TeamRenamed {
                team_id: "-1001".into(),
                name: "Operations".into(),
            },
        )
        .await
        .unwrap();

        let members = db::list_team_members(&pool, "-1001", None, 10).await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].1.kind, RecipientKind::User);
        assert_eq!(members[0].1.conversation_ref, "11");

        apply_event(
            &pool,
            "contoso",
            &filter,
            &ChatEvent::BotRemoved {
                team_id: "-1001".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(db::team_is_active(&pool, "-1001").await.unwrap(), Some(false));
        assert!(db::list_team_members(&pool, "-1001", None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn filtered_tenant_is_not_captured() {
        let (_td, pool) = setup_pool().await;
        let filter = TenantFilter::new(false, vec!["contoso".to_string()]);

        let applied = apply_event(
            &pool,
            "fabrikam",
            &filter,
            &ChatEvent::UserSeen { user: user("7") },
        )
        .await
        .unwrap();
        assert!(!applied);
        assert!(db::fetch_user(&pool, "7").await.unwrap().is_none());

        assert!(apply_event(
            &pool,
            "contoso",
            &filter,
            &ChatEvent::UserSeen { user: user("7") },
        )
        .await
        .unwrap());
        let got = db::fetch_user(&pool, "7").await.unwrap().unwrap();
        assert_eq!(got.tenant_id, "contoso");
        assert_eq!(got.display_name.as_deref(), Some("User 7"));
    }

    #[tokio::test]
    async fn channel_capture() {
        let (_td, pool) = setup_pool().await;
        apply_event(
            &pool,
            "contoso",
            &TenantFilter::open(),
            &ChatEvent::ChannelSeen {
                channel: SeenTeam {
                    team_id: "-100500".into(),
                    name: Some("News".into()),
                    conversation_ref: "-100500".into(),
                },
            },
        )
        .await
        .unwrap();
        let ch = db::fetch_channel(&pool, "-100500").await.unwrap().unwrap();
        assert_eq!(ch.kind, RecipientKind::Channel);
        assert_eq!(ch.display_name.as_deref(), Some("News"));
    }
}
