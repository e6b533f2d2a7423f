use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::DIRECT_CONVERSATION_SEPARATOR;

// User identity = opaque id handed out by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversation identifier.
///
/// Direct (1:1) conversations use a deterministic id derived from the two
/// participant ids so both sides address the same remote document without
/// coordination.  Group conversation ids are assigned by the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic id for a 1:1 conversation: sorted participant ids joined
    /// with a separator.  `direct(a, b) == direct(b, a)`.
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        Self(format!("{}{}{}", lo.0, DIRECT_CONVERSATION_SEPARATOR, hi.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content carried by an outbound send.  Duplicated into the queue entry so
/// a retry never depends on re-reading the message row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MessagePayload {
    /// Plain text body; absent for media-only messages.
    pub text: Option<String>,
    /// Opaque reference to an already-uploaded attachment.
    pub media_ref: Option<String>,
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media_ref: None,
        }
    }

    pub fn media(media_ref: impl Into<String>) -> Self {
        Self {
            text: None,
            media_ref: Some(media_ref.into()),
        }
    }
}

/// Delivery state of a message.
///
/// ```text
/// Pending  --(persisted locally)-->                Sent
/// Sent     --(remote accept)-->                    Delivered
/// Queued   --(network restored, remote accept)-->  Delivered
/// Pending/Sent --(send error, retries exhausted)-> Failed
/// Sent/Delivered --(any non-sender reads)-->       Read
/// Failed   --(user retries)-->                     Pending
/// ```
///
/// `Queued` is entered directly at creation when the device is offline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Stable text form used for the SQLite `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Progress rank used for forward-only merging of remote snapshots.
    ///
    /// `Failed` ranks below `Delivered`: a remote acceptance observed after
    /// local retry exhaustion still wins, while a stale `Sent` snapshot can
    /// never resurrect a failed message.
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Queued => 1,
            Self::Sent => 2,
            Self::Failed => 3,
            Self::Delivered => 4,
            Self::Read => 5,
        }
    }

    /// Merge with a remotely-reported status: the further-along status wins,
    /// a stale snapshot never regresses local state.
    pub fn merged_with(self, remote: Self) -> Self {
        if remote.rank() > self.rank() {
            remote
        } else {
            self
        }
    }

    /// Whether a message in this status is still waiting on the remote store
    /// and therefore eligible for the crash-recovery stale scan.
    pub fn awaits_confirmation(self) -> bool {
        matches!(self, Self::Pending | Self::Sent)
    }

    /// `Read` is reachable only from these states (idempotently from `Read`).
    pub fn can_become_read(self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Read)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
