/// Collaborator contracts supplied by the host application.
///
/// The messaging core has no network surface of its own: sends go through a
/// [`Delivery`] implementation and file uploads through an [`Uploader`]. Both
/// are trait objects so hosts can back them with whatever transport they run
/// (HTTP, sockets, a test double).
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use carelink_types::MessageAttachment;

use crate::error::MessagingError;

/// Payload handed to the delivery collaborator. Carries the temp id so a
/// retry resubmits the same logical message and the server can dedupe.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub temp_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: Option<String>,
    pub attachments: Vec<MessageAttachment>,
}

/// Successful delivery result: the authoritative server id and timestamp.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfirmation {
    pub server_id: Uuid,
    pub server_timestamp: DateTime<Utc>,
}

/// Message transport. Implementations must be idempotent-safe when the same
/// temp id is resubmitted on retry.
pub trait Delivery: Send + Sync + 'static {
    fn send(
        &self,
        outgoing: OutgoingMessage,
    ) -> BoxFuture<'static, Result<DeliveryConfirmation, MessagingError>>;
}

/// File metadata handed to the upload collaborator. `reference` is the host's
/// stable handle for the file (path, blob key) — the core never reads bytes.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub attachment_id: Uuid,
    pub reference: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// Items of the lazy progress sequence an uploader yields. The stream ends
/// after a terminal `Completed` or `Failed` item.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Upload progress, 0–100.
    Progress(u8),
    Completed { url: String },
    Failed { reason: String },
}

/// Upload transport. The pipeline hands every upload a [`CancelHandle`];
/// implementations should poll it between chunks and stop early when set.
pub trait Uploader: Send + Sync + 'static {
    fn upload(
        &self,
        request: UploadRequest,
        cancel: CancelHandle,
    ) -> BoxStream<'static, UploadEvent>;
}

/// Shared cancellation flag for an in-flight upload.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
