use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageAttachment};

/// Events pushed into the core by the host's transport (socket, polling —
/// the host's business). The core exposes plain handler methods; this enum is
/// the wire shape hosts typically decode into.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InboundEvent {
    /// A participant started or stopped typing.
    Typing {
        conversation_id: Uuid,
        participant_id: Uuid,
        is_typing: bool,
    },

    /// The server confirmed delivery of a message to a participant's device.
    Delivered {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    /// A participant acknowledged having seen a message.
    ReadReceipt {
        conversation_id: Uuid,
        message_id: Uuid,
        participant_id: Uuid,
        read_at: DateTime<Utc>,
    },
}

impl InboundEvent {
    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::Typing { conversation_id, .. }
            | Self::Delivered { conversation_id, .. }
            | Self::ReadReceipt { conversation_id, .. } => *conversation_id,
        }
    }
}

/// Events emitted by the messaging core for the render layer. The host
/// subscribes and re-renders from the data carried here — the core never
/// touches any rendering surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MessagingEvent {
    /// An optimistic message entered the list in `pending`.
    MessagePending { message: Message },

    /// A pending message was confirmed. `temp_id` lets the host re-key any
    /// state it indexed by the optimistic id.
    MessageSent { temp_id: Uuid, message: Message },

    /// Transport rejected the send; body and attachments are preserved on
    /// the message for retry.
    MessageFailed { message_id: Uuid, reason: String },

    /// A message from another participant entered the list.
    MessageReceived { message: Message },

    /// Status or receipt change on an existing message.
    MessageUpdated { message: Message },

    /// An attachment changed state or progress.
    AttachmentUpdated { attachment: MessageAttachment },

    /// An attachment was removed from the staged set (user removal or
    /// mid-upload cancellation).
    AttachmentRemoved { attachment_id: Uuid },

    /// The set of currently-typing participants changed.
    TypingChanged {
        conversation_id: Uuid,
        participants: Vec<Uuid>,
    },

    /// A participant's aggregate "seen up to" marker advanced.
    SeenUpTo {
        conversation_id: Uuid,
        participant_id: Uuid,
        seen_at: DateTime<Utc>,
    },
}
