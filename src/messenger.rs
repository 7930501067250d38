use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use teloxide::adaptors::throttle::Limits;
use teloxide::adaptors::Throttle;
use teloxide::prelude::*;
use teloxide::requests::RequesterExt;
use teloxide::types::Recipient;
use teloxide::{ApiError, RequestError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::ErrorClass;

/// How a single platform send went wrong.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("rate limited by platform (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },
    #[error("transient send failure: {0}")]
    Transient(String),
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SendError::Throttled { .. } => ErrorClass::Throttled,
            SendError::Transient(_) => ErrorClass::Transient,
            SendError::Permanent(_) => ErrorClass::Permanent,
        }
    }

    /// Class recorded once the retry budget for this error is spent.
    pub fn exhausted_class(&self) -> ErrorClass {
        match self {
            SendError::Throttled { .. } => ErrorClass::ThrottleExhausted,
            SendError::Transient(_) => ErrorClass::TransientExhausted,
            SendError::Permanent(_) => ErrorClass::Permanent,
        }
    }
}

/// The one platform operation the delivery engine depends on.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, conversation_ref: &str, body: &str) -> Result<(), SendError>;
}

pub struct TelegramMessenger {
    bot: Throttle<Bot>,
}

impl fmt::Debug for TelegramMessenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramMessenger").finish_non_exhaustive()
    }
}

impl TelegramMessenger {
    /// Wraps the bot in teloxide's throttle adaptor so the bot stays under
    /// Telegram's global and per-chat limits before 429s are even returned.
    /// Must be called inside a Tokio runtime.
    pub fn new(token: String) -> Self {
        Self::from_bot(Bot::new(token))
    }

    pub fn from_bot(bot: Bot) -> Self {
        Self {
            bot: bot.throttle(Limits::default()),
        }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(&self, conversation_ref: &str, body: &str) -> Result<(), SendError> {
        let recipient = parse_recipient(conversation_ref)?;
        match self.bot.send_message(recipient, body).await {
            Ok(msg) => {
                debug!(conversation_ref, message_id = msg.id.0, "message sent");
                Ok(())
            }
            Err(err) => {
                let classified = classify(err);
                warn!(conversation_ref, error = %classified, "telegram send failed");
                Err(classified)
            }
        }
    }
}

/// Conversation references are numeric chat ids, or `@username` for public
/// channels.
pub fn parse_recipient(conversation_ref: &str) -> Result<Recipient, SendError> {
    let trimmed = conversation_ref.trim();
    if let Ok(id) = trimmed.parse::<i64>() {
        return Ok(Recipient::Id(ChatId(id)));
    }
    if trimmed.len() > 1 && trimmed.starts_with('@') {
        return Ok(Recipient::ChannelUsername(trimmed.to_string()));
    }
    Err(SendError::Permanent(format!(
        "malformed conversation reference {:?}",
        conversation_ref
    )))
}

/// Telegram reports its own 5xx failures as API errors with these
/// descriptions.
fn is_server_error(description: &str) -> bool {
    const SERVER_ERRORS: [&str; 4] = [
        "Internal Server Error",
        "Bad Gateway",
        "Service Unavailable",
        "Gateway Timeout",
    ];
    SERVER_ERRORS.iter().any(|e| description.contains(e))
}

pub fn classify(err: RequestError) -> SendError {
    match err {
        RequestError::RetryAfter(after) => SendError::Throttled {
            retry_after: Some(after.duration()),
        },
        // Blocked, kicked, chat not found, deactivated user and friends: no
        // amount of retrying will reach this recipient.
        RequestError::Api(api) => match api {
            ApiError::Unknown(ref text) if text.contains("Too Many Requests") => {
                SendError::Throttled { retry_after: None }
            }
            ApiError::Unknown(ref text) if is_server_error(text) => {
                SendError::Transient(text.clone())
            }
            other => SendError::Permanent(other.to_string()),
        },
        RequestError::MigrateToChatId(new_id) => {
            SendError::Permanent(format!("chat migrated to {:?}", new_id))
        }
        other => SendError::Transient(other.to_string()),
    }
}
