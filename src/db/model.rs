//! Input records and view models used by repositories.
//!
//! Keep these structs focused on the data written or returned by queries.
//! Business logic should live in higher layers.

use crate::model::{Audience, DeliveryOutcome, ErrorClass};

/// Fields an author supplies when creating a draft.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub title: String,
    pub body: String,
    pub audience: Audience,
    pub author: Option<String>,
}

/// Team conversation captured from the chat front-end.
#[derive(Debug, Clone)]
pub struct TeamRecord {
    pub team_id: String,
    pub tenant_id: String,
    pub name: Option<String>,
    pub conversation_ref: String,
}

/// User with a direct conversation to the bot.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: String,
    pub tenant_id: String,
    pub name: Option<String>,
    pub conversation_ref: String,
}

/// Channel conversation, optionally owned by a team.
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub team_id: Option<String>,
    pub tenant_id: String,
    pub name: Option<String>,
    pub conversation_ref: String,
}

/// One write to `delivery_results`.
#[derive(Debug, Clone)]
pub struct RecordedOutcome<'a> {
    pub notification_id: &'a str,
    pub recipient_ref: &'a str,
    pub display_name: Option<&'a str>,
    pub outcome: DeliveryOutcome,
    pub attempts: i32,
    pub error_class: Option<ErrorClass>,
}
