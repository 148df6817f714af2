use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery lifecycle of a message. Transitions only move forward
/// (`Pending → Sent → Delivered → Read`) except for the retry back-edge
/// `Failed → Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position on the delivery ladder. `Failed` sits off-ladder at the
    /// bottom so a retried message can climb again from `Pending`.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending | Self::Failed => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    /// True when upgrading from `self` to `next` moves forward on the ladder.
    /// Used to drop out-of-order callbacks (a late `Delivered` after `Read`).
    pub fn can_upgrade_to(self, next: MessageStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Broad attachment category, derived from MIME type (with an extension
/// fallback for hosts that only know the file name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    File,
}

impl AttachmentKind {
    pub fn from_mime(mime: &str, file_name: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("image/") {
            return Self::Image;
        }
        if mime.starts_with("audio/") {
            return Self::Audio;
        }
        if mime.starts_with("video/") {
            return Self::Video;
        }
        match file_name.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
            Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "heic") => Self::Image,
            Some("mp3" | "m4a" | "ogg" | "wav") => Self::Audio,
            Some("mp4" | "mov" | "webm" | "mkv") => Self::Video,
            _ => Self::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Staged,
    Uploading,
    Uploaded,
    Failed,
}

/// A file attached to an outgoing message. Created when the user selects or
/// drops a file; destroyed when removed before send, or folded into the sent
/// message's attachment list on delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAttachment {
    pub id: Uuid,
    pub kind: AttachmentKind,
    pub state: AttachmentState,
    /// Upload progress, 0–100.
    pub progress: u8,
    /// Present once the attachment reaches `Uploaded`.
    pub url: Option<String>,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Present when the attachment is `Failed`.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Client-generated temp id while pending; replaced by the server id on
    /// confirmation. The store retains the temp→server mapping so transport
    /// replays merge instead of duplicating.
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// Optional when attachments are present — at least one of body and
    /// attachments is non-empty.
    pub body: Option<String>,
    pub attachments: Vec<MessageAttachment>,
    pub status: MessageStatus,
    /// Client timestamp; authoritative for ordering while pending.
    pub created_at: DateTime<Utc>,
    /// Authoritative once assigned by the server.
    pub server_timestamp: Option<DateTime<Utc>>,
    /// Read receipts: participant id → read-at. BTreeMap for deterministic
    /// iteration (grouping output must be stable).
    pub read_by: BTreeMap<Uuid, DateTime<Utc>>,
    /// Present when the message is `Failed`; cleared on retry.
    pub failure_reason: Option<String>,
}

impl Message {
    /// Timestamp used for ordering and date bucketing: server timestamp when
    /// assigned, client timestamp otherwise.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.server_timestamp.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Participant>,
    pub last_message_preview: Option<String>,
    pub unread_count: u32,
}

/// Ephemeral per-participant typing state. Never persisted; entries expire
/// and are removed by the coordinator's sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEntry {
    pub is_typing: bool,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ladder_only_moves_forward() {
        assert!(MessageStatus::Pending.can_upgrade_to(MessageStatus::Sent));
        assert!(MessageStatus::Sent.can_upgrade_to(MessageStatus::Read));
        assert!(!MessageStatus::Read.can_upgrade_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Delivered.can_upgrade_to(MessageStatus::Delivered));
        // Retried messages start over from the bottom of the ladder.
        assert!(MessageStatus::Failed.can_upgrade_to(MessageStatus::Sent));
    }

    #[test]
    fn attachment_kind_from_mime_and_extension() {
        assert_eq!(AttachmentKind::from_mime("image/png", "scan.png"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_mime("application/pdf", "invoice.pdf"), AttachmentKind::File);
        assert_eq!(AttachmentKind::from_mime("", "visit.MP4"), AttachmentKind::Video);
        assert_eq!(AttachmentKind::from_mime("application/octet-stream", "noext"), AttachmentKind::File);
    }
}
