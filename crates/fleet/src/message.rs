use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use haulage_core::{DriverId, MessageId, VersionedAggregate, Watermarks};

pub mod fields {
    pub const STATE: &str = "state";
    pub const STATE_CHANGED_AT: &str = "state_changed_at";
    pub const ATTEMPTS: &str = "attempts";
    pub const LAST_ERROR: &str = "last_error";
    pub const DEDUPE_KEY: &str = "dedupe_key";
}

/// Outbound message lifecycle: `New -> Ready -> Processing -> Sent | Error`.
///
/// `Processing` is the in-flight marker. A record stuck there past the sweeper
/// threshold is an orphan and goes back to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    New,
    Ready,
    Processing,
    Sent,
    Error,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Sent | MessageState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageChannel {
    Email,
    Push,
}

impl MessageChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageChannel::Email => "email",
            MessageChannel::Push => "push",
        }
    }
}

/// Channel-specific content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum MessagePayload {
    Email {
        to: String,
        subject: String,
        body: String,
    },
    Push {
        driver_id: DriverId,
        title: String,
        body: String,
    },
}

impl MessagePayload {
    pub fn channel(&self) -> MessageChannel {
        match self {
            MessagePayload::Email { .. } => MessageChannel::Email,
            MessagePayload::Push { .. } => MessageChannel::Push,
        }
    }
}

/// Aggregate root: an outbound email or push notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub payload: MessagePayload,
    pub state: MessageState,
    pub state_changed_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Idempotency key for messages created as a side effect of reconciliation.
    #[serde(default)]
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub watermarks: Watermarks,
}

impl Message {
    pub fn new(payload: MessagePayload) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            payload,
            state: MessageState::New,
            state_changed_at: now,
            attempts: 0,
            last_error: None,
            dedupe_key: None,
            created_at: now,
            version: 0,
            watermarks: Watermarks::new(),
        }
    }

    pub fn email(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(MessagePayload::Email {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        })
    }

    pub fn push(driver_id: DriverId, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(MessagePayload::Push {
            driver_id,
            title: title.into(),
            body: body.into(),
        })
    }

    /// Mark the message eligible for dispatch right away.
    pub fn ready(mut self) -> Self {
        self.state = MessageState::Ready;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn channel(&self) -> MessageChannel {
        self.payload.channel()
    }
}

impl VersionedAggregate for Message {
    type Id = MessageId;
    const COLLECTION: &'static str = "messages";

    fn id(&self) -> MessageId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn watermarks(&self) -> &Watermarks {
        &self.watermarks
    }

    fn watermarks_mut(&mut self) -> &mut Watermarks {
        &mut self.watermarks
    }
}
