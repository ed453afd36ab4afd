//! Record types for the collection pipeline
//!
//! Conversations are upserted by id (the most recently observed version
//! wins); messages are append-only facts, never rewritten once stored.
//! Timestamps stay raw strings so that malformed values can be stored and
//! graded instead of rejected at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category descriptor for a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub title: String,
}

/// The other party in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counterparty {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_dormant: bool,
    #[serde(default)]
    pub is_banned: bool,
}

impl Default for Counterparty {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            is_active: true,
            is_dormant: false,
            is_banned: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Top-level collected item: one conversation with a counterparty about a
/// service request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub service: Service,
    #[serde(default)]
    pub counterparty: Counterparty,
    /// Quoted price for the underlying request, if one was attached.
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub hired: bool,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub unread_count: i64,
    /// Set once message pagination for this conversation reached its
    /// natural end; resume runs trust this, not file presence.
    #[serde(default)]
    pub messages_complete: bool,
}

impl Conversation {
    pub fn created_ts(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.created_at)
    }

    pub fn updated_ts(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.updated_at)
    }
}

/// Author of a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    System,
    File,
    Image,
    Quote,
    /// Anything the upstream service adds that we don't model yet.
    #[serde(other)]
    Other,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::System => "system",
            MessageKind::File => "file",
            MessageKind::Image => "image",
            MessageKind::Quote => "quote",
            MessageKind::Other => "other",
        }
    }
}

/// One message within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub receiver_read: bool,
}

/// Implemented by anything the collector can paginate over.
pub trait Record {
    fn record_id(&self) -> i64;

    /// Most recent activity, consulted by recency cutoffs. `None` exempts
    /// the record from cutoff checks.
    fn activity_ts(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl Record for Conversation {
    fn record_id(&self) -> i64 {
        self.id
    }

    fn activity_ts(&self) -> Option<DateTime<Utc>> {
        self.updated_ts()
    }
}

impl Record for Message {
    fn record_id(&self) -> i64 {
        self.id
    }
}

/// Why a pagination run ended. Stop-policy triggers are ordinary
/// terminations, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The source reported no further cursor.
    Exhausted,
    /// Too many consecutive pages without a new record.
    EmptyPages,
    /// Wall-clock deadline reached.
    Deadline,
    PageLimit,
    RecordLimit,
    /// A whole page fell outside the recency window.
    ReachedCutoff,
    Cancelled,
    /// Retries exhausted or a fatal fetch error; prior records kept.
    Aborted,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Exhausted => "exhausted",
            Termination::EmptyPages => "empty_pages",
            Termination::Deadline => "deadline",
            Termination::PageLimit => "page_limit",
            Termination::RecordLimit => "record_limit",
            Termination::ReachedCutoff => "reached_cutoff",
            Termination::Cancelled => "cancelled",
            Termination::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    /// Ended early (deadline, cancellation, retries exhausted) but kept
    /// whatever was collected.
    Partial,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Partial => "partial",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Terminal result of one conversation's collection task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub conversation_id: i64,
    pub status: TaskStatus,
    pub message_count: usize,
    pub pages: u32,
    pub termination: Option<Termination>,
    pub duration_secs: f64,
    pub error: Option<String>,
}

/// One collection run's output, prior to merge into the central store.
/// Discarded after merge; only its summary is persisted.
#[derive(Debug, Serialize)]
pub struct RunBatch {
    pub started_at: DateTime<Utc>,
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
    pub outcomes: Vec<TaskOutcome>,
}

impl RunBatch {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            conversations: Vec::new(),
            messages: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty() && self.messages.is_empty()
    }
}

impl Default for RunBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an RFC3339 timestamp, normalizing to UTC. Empty or malformed
/// input is `None`, never an error.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.trim().is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
