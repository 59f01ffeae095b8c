//! Core domain model for YAHNC: delivery records, task payloads and shared helpers.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "yahnc-core";

/// Number of top stories fetched per poll tick.
pub const BATCH_SIZE: usize = 30;

/// Stories with fewer comments than this are not posted.
pub const NUM_COMMENTS_THRESHOLD: i64 = 5;

/// Stories scoring below this are not posted.
pub const SCORE_THRESHOLD: i64 = 50;

/// Records older than this are deleted by the cleanup tick.
pub const RETENTION_HOURS: i64 = 24;

/// Wall-clock bound on every outbound HTTP call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(9 * 60);

pub const DEFAULT_CHAT_ID: &str = "@yahnc";

/// Logical root every delivery record key lives under.
pub const RECORD_ROOT: &str = "TopStory";

pub const DEFAULT_HN_API_BASE: &str = "https://hacker-news.firebaseio.com/v0/";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org/";

pub fn retention_window() -> chrono::Duration {
    chrono::Duration::hours(RETENTION_HOURS)
}

/// Records whose `last_saved` is at or before this instant are expired.
pub fn expiry_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - retention_window()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl ItemId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ItemId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Identifier of the chat message posted for an item. Zero means "not sent yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
    pub const UNSENT: MessageId = MessageId(0);

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn is_unsent(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Storage key of a delivery record: the item id scoped under [`RECORD_ROOT`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub root: &'static str,
    pub item_id: ItemId,
}

impl RecordKey {
    pub fn new(item_id: ItemId) -> Self {
        Self {
            root: RECORD_ROOT,
            item_id,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/Story/{}", self.root, self.item_id)
    }
}

/// Feed-derived attributes captured at the last successful actuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StorySnapshot {
    pub title: String,
    pub url: Option<String>,
    pub score: i64,
    pub descendants: i64,
    pub by: Option<String>,
    pub time: Option<i64>,
}

/// The sole persisted entity: links a feed item to its outbound chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub item_id: ItemId,
    pub message_id: MessageId,
    pub last_saved: DateTime<Utc>,
    pub story: Option<StorySnapshot>,
}

impl DeliveryRecord {
    /// Transient record for an item that has no message yet.
    pub fn unsent(item_id: ItemId) -> Self {
        Self::with_message(item_id, MessageId::UNSENT)
    }

    pub fn with_message(item_id: ItemId, message_id: MessageId) -> Self {
        Self {
            item_id,
            message_id,
            last_saved: DateTime::<Utc>::default(),
            story: None,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.item_id)
    }

    pub fn is_delivered(&self) -> bool {
        !self.message_id.is_unsent()
    }

    /// Refresh `last_saved` ahead of a write.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_saved = now;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.last_saved <= expiry_cutoff(now)
    }
}

/// Why an item was not eligible for delivery at actuation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IneligibleReason {
    Missing,
    Dead,
    Deleted,
    LowScore { score: i64 },
    FewComments { descendants: i64 },
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "item does not exist"),
            Self::Dead => write!(f, "item is dead"),
            Self::Deleted => write!(f, "item is deleted"),
            Self::LowScore { score } => {
                write!(f, "score {score} below threshold {SCORE_THRESHOLD}")
            }
            Self::FewComments { descendants } => write!(
                f,
                "{descendants} comments below threshold {NUM_COMMENTS_THRESHOLD}"
            ),
        }
    }
}

/// Named action a delivery task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    SendMessage,
    EditMessage,
    DeleteMessage,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [
        TaskKind::SendMessage,
        TaskKind::EditMessage,
        TaskKind::DeleteMessage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::EditMessage => "edit_message",
            Self::DeleteMessage => "delete_message",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTaskKind(pub String);

impl fmt::Display for UnknownTaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown task kind `{}`", self.0)
    }
}

impl std::error::Error for UnknownTaskKind {}

impl FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownTaskKind(s.to_string()))
    }
}

/// Typed payload of a durable delivery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryTask {
    SendMessage { item_id: ItemId },
    EditMessage { item_id: ItemId, message_id: MessageId },
    DeleteMessage { item_id: ItemId, message_id: MessageId },
}

impl DeliveryTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::SendMessage { .. } => TaskKind::SendMessage,
            Self::EditMessage { .. } => TaskKind::EditMessage,
            Self::DeleteMessage { .. } => TaskKind::DeleteMessage,
        }
    }

    pub fn item_id(&self) -> ItemId {
        match self {
            Self::SendMessage { item_id }
            | Self::EditMessage { item_id, .. }
            | Self::DeleteMessage { item_id, .. } => *item_id,
        }
    }

    pub fn message_id(&self) -> MessageId {
        match self {
            Self::SendMessage { .. } => MessageId::UNSENT,
            Self::EditMessage { message_id, .. } | Self::DeleteMessage { message_id, .. } => {
                *message_id
            }
        }
    }

    /// The record this task starts its actuation from.
    pub fn record(&self) -> DeliveryRecord {
        DeliveryRecord::with_message(self.item_id(), self.message_id())
    }
}

/// Link to the story's discussion page.
pub fn news_url(id: ItemId) -> String {
    format!("https://news.ycombinator.com/item?id={id}")
}

pub fn item_url(api_base: &str, id: ItemId) -> String {
    format!("{}item/{id}.json", with_trailing_slash(api_base))
}

pub fn top_stories_url(api_base: &str, limit: usize) -> String {
    format!(
        "{}topstories.json?orderBy=\"$key\"&limitToFirst={limit}",
        with_trailing_slash(api_base)
    )
}

/// Bot API endpoint; `bot_key` is the `bot<token>` path segment.
pub fn telegram_api_url(api_base: &str, bot_key: &str, method: &str) -> String {
    format!("{}{bot_key}/{method}", with_trailing_slash(api_base))
}

fn with_trailing_slash(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    }
}

/// Source of the current time, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to an instant until moved explicitly.
#[derive(Debug)]
pub struct FixedClock {
    at: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.at.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut at = self.at.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *at += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.at.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
