pub mod events;
pub mod groups;
pub mod models;

// Re-export key types for convenience.
pub use events::{InboundEvent, MessagingEvent};
pub use groups::{DateLabel, MessageGroup, SenderRun};
pub use models::{
    AttachmentKind, AttachmentState, Conversation, Message, MessageAttachment, MessageStatus,
    Participant, TypingEntry,
};
