use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NotificationState {
    Draft,
    Queued,
    Sending,
    Completed,
    Failed,
}

impl NotificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationState::Draft => "DRAFT",
            NotificationState::Queued => "QUEUED",
            NotificationState::Sending => "SENDING",
            NotificationState::Completed => "COMPLETED",
            NotificationState::Failed => "FAILED",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(NotificationState::Draft),
            "QUEUED" => Some(NotificationState::Queued),
            "SENDING" => Some(NotificationState::Sending),
            "COMPLETED" => Some(NotificationState::Completed),
            "FAILED" => Some(NotificationState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationState::Completed | NotificationState::Failed)
    }
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "ids", rename_all = "snake_case")]
pub enum Audience {
    /// Every member of each listed team.
    Teams(Vec<String>),
    /// Each listed channel conversation.
    Channels(Vec<String>),
    /// Each listed user, directly.
    Users(Vec<String>),
    /// The whole user roster of a tenant.
    AllUsers(String),
}

impl Audience {
    pub fn is_empty(&self) -> bool {
        match self {
            Audience::Teams(ids) | Audience::Channels(ids) | Audience::Users(ids) => {
                ids.iter().all(|id| id.trim().is_empty())
            }
            Audience::AllUsers(tenant) => tenant.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RecipientKind {
    Team,
    Channel,
    User,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::Team => "team",
            RecipientKind::Channel => "channel",
            RecipientKind::User => "user",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "team" => Some(RecipientKind::Team),
            "channel" => Some(RecipientKind::Channel),
            "user" => Some(RecipientKind::User),
            _ => None,
        }
    }
}

/// A resolved, platform-addressable send target.
///
/// `conversation_ref` is the identity: two descriptors with the same ref are
/// the same recipient regardless of how they were reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientDescriptor {
    pub conversation_ref: String,
    pub kind: RecipientKind,
    pub display_name: Option<String>,
    pub team_id: Option<String>,
    pub tenant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: i64,
    pub notification_id: String,
    pub sequence: i64,
    pub recipients: Vec<RecipientDescriptor>,
    pub claim_count: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Throttled or transiently failed; another attempt follows.
    Retrying,
    Failed,
    PermanentlyFailed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Sent => "SENT",
            DeliveryOutcome::Retrying => "RETRYING",
            DeliveryOutcome::Failed => "FAILED",
            DeliveryOutcome::PermanentlyFailed => "PERMANENTLY_FAILED",
        }
    }

    pub fn parse_outcome(s: &str) -> Option<Self> {
        match s {
            "SENT" => Some(DeliveryOutcome::Sent),
            "RETRYING" => Some(DeliveryOutcome::Retrying),
            "FAILED" => Some(DeliveryOutcome::Failed),
            "PERMANENTLY_FAILED" => Some(DeliveryOutcome::PermanentlyFailed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryOutcome::Retrying)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorClass {
    Throttled,
    Transient,
    Permanent,
    ThrottleExhausted,
    TransientExhausted,
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Throttled => "throttled",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::ThrottleExhausted => "throttle-exhausted",
            ErrorClass::TransientExhausted => "transient-exhausted",
            ErrorClass::Cancelled => "cancelled",
        }
    }

    pub fn parse_class(s: &str) -> Option<Self> {
        match s {
            "throttled" => Some(ErrorClass::Throttled),
            "transient" => Some(ErrorClass::Transient),
            "permanent" => Some(ErrorClass::Permanent),
            "throttle-exhausted" => Some(ErrorClass::ThrottleExhausted),
            "transient-exhausted" => Some(ErrorClass::TransientExhausted),
            "cancelled" => Some(ErrorClass::Cancelled),
            _ => None,
        }
    }
}

/// Which notification counter a terminal outcome lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Sent,
    Failed,
    Throttled,
}

impl Counter {
    /// Column name on `notifications`.
    pub fn column(&self) -> &'static str {
        match self {
            Counter::Sent => "sent",
            Counter::Failed => "failed",
            Counter::Throttled => "throttled",
        }
    }

    pub fn for_outcome(outcome: DeliveryOutcome, class: Option<ErrorClass>) -> Option<Self> {
        match (outcome, class) {
            (DeliveryOutcome::Retrying, _) => None,
            (DeliveryOutcome::Sent, _) => Some(Counter::Sent),
            (DeliveryOutcome::PermanentlyFailed, Some(ErrorClass::ThrottleExhausted)) => {
                Some(Counter::Throttled)
            }
            (DeliveryOutcome::PermanentlyFailed, _) | (DeliveryOutcome::Failed, _) => {
                Some(Counter::Failed)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counters {
    pub resolved: i64,
    pub sent: i64,
    pub failed: i64,
    pub throttled: i64,
}

impl Counters {
    pub fn finished(&self) -> i64 {
        self.sent + self.failed + self.throttled
    }

    pub fn pending(&self) -> i64 {
        (self.resolved - self.finished()).max(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub audience: Audience,
    pub state: NotificationState,
    pub author: Option<String>,
    pub cancelled: bool,
    pub counters: Counters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub notification_id: String,
    pub recipient_ref: String,
    pub display_name: Option<String>,
    pub outcome: DeliveryOutcome,
    pub attempts: i32,
    pub error_class: Option<ErrorClass>,
    pub updated_at: DateTime<Utc>,
}

/// Uniform reply shape handed back to the authoring surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub result: Option<T>,
    pub error_message: Option<String>,
    pub time_generated: DateTime<Utc>,
}

impl<T> Envelope<T> {
    pub fn ok(result: T) -> Self {
        Self {
            result: Some(result),
            error_message: None,
            time_generated: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error_message: Some(message.into()),
            time_generated: Utc::now(),
        }
    }
}
