use thiserror::Error;
use uuid::Uuid;

/// Messaging error taxonomy.
///
/// Validation errors (`EmptyMessage`, `MessageTooLong`, `UnsupportedType`,
/// `FileTooLarge`, `SendInProgress`) surface synchronously before any
/// transport call. Transport
/// errors (`SendFailed`, `UploadFailed`) transition the affected entity to
/// `failed` with user input preserved — never fatal to the conversation view.
/// `DuplicateConfirmation` indicates a transport replay and is logged, not
/// shown to the user.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("message has no body or attachments")]
    EmptyMessage,

    #[error("message body is {len} characters, limit is {limit}")]
    MessageTooLong { len: usize, limit: usize },

    #[error("attachment type not allowed: {mime} ({file_name})")]
    UnsupportedType { mime: String, file_name: String },

    #[error("file is {size_bytes} bytes, limit is {limit_bytes}")]
    FileTooLarge { size_bytes: u64, limit_bytes: u64 },

    #[error("a send is already in flight for this conversation")]
    SendInProgress,

    #[error("duplicate confirmation for {temp_id}: confirmed as {existing}, got {incoming}")]
    DuplicateConfirmation {
        temp_id: Uuid,
        existing: Uuid,
        incoming: Uuid,
    },

    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    #[error("upload failed: {reason}")]
    UploadFailed { reason: String },

    #[error("unknown message id {id}")]
    UnknownMessage { id: Uuid },

    #[error("unknown attachment id {id}")]
    UnknownAttachment { id: Uuid },
}
