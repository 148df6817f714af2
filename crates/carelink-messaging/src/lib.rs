/// Carelink messaging core: transport-agnostic engine behind the
/// conversation view.
///
/// Provides:
/// - Message lifecycle state machine with optimistic send and retry
/// - Attachment pipeline with validation, progress, and cancellation
/// - Pure grouping projection (date buckets, sender-runs)
/// - Per-conversation composer coordinating deferred sends
/// - Typing tracker with shared expiry sweep and read-receipt handling
///
/// The host supplies the network: a [`Delivery`] for sends, an [`Uploader`]
/// for attachments, and inbound typing/receipt events pushed through plain
/// methods. Rendering subscribes to [`carelink_types::MessagingEvent`].

pub mod attachments;
pub mod composer;
pub mod config;
pub mod error;
pub mod grouping;
pub mod presence;
pub mod store;
pub mod transport;

// Re-export key types for convenience.
pub use attachments::{AttachmentEvent, AttachmentPipeline, FileInput};
pub use composer::{Composer, DraftState};
pub use config::{AttachmentPolicy, GroupingConfig, MessagingConfig, TypingConfig};
pub use error::MessagingError;
pub use grouping::group_messages;
pub use presence::TypingTracker;
pub use store::{ConversationStore, ReceiptOutcome};
pub use transport::{
    CancelHandle, Delivery, DeliveryConfirmation, OutgoingMessage, UploadEvent, UploadRequest,
    Uploader,
};
