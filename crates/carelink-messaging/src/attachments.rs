/// Attachment pipeline: validates, stages, and tracks upload progress for
/// files attached to an outgoing message.
///
/// Uploads of sibling attachments proceed independently; one failure never
/// rolls back the others. Progress and state changes fan out on a broadcast
/// channel so the composer can defer dispatch and the host can render
/// progress.
use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use carelink_types::{AttachmentKind, AttachmentState, MessageAttachment};

use crate::config::AttachmentPolicy;
use crate::error::MessagingError;
use crate::transport::{CancelHandle, UploadEvent, UploadRequest, Uploader};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A file the user selected or dropped. `reference` must be stable for the
/// same underlying file (path, blob key) — staging the identical reference
/// twice before send is a no-op, not a duplicate.
#[derive(Debug, Clone)]
pub struct FileInput {
    pub reference: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// Pipeline state changes, consumed by the composer and the render layer.
#[derive(Debug, Clone)]
pub enum AttachmentEvent {
    Updated(MessageAttachment),
    Removed(Uuid),
}

#[derive(Clone)]
pub struct AttachmentPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    policy: AttachmentPolicy,
    state: Mutex<PipelineState>,
    events_tx: broadcast::Sender<AttachmentEvent>,
}

#[derive(Default)]
struct PipelineState {
    staged: Vec<MessageAttachment>,
    by_reference: HashMap<String, Uuid>,
    files: HashMap<Uuid, FileInput>,
    cancels: HashMap<Uuid, CancelHandle>,
}

impl AttachmentPipeline {
    pub fn new(policy: AttachmentPolicy) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(PipelineInner {
                policy,
                state: Mutex::new(PipelineState::default()),
                events_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttachmentEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Validate and stage a file. Fails with `UnsupportedType` or
    /// `FileTooLarge` without touching already-staged attachments.
    pub async fn stage(&self, file: FileInput) -> Result<MessageAttachment, MessagingError> {
        if !self.inner.policy.permits(&file.mime_type, &file.file_name) {
            return Err(MessagingError::UnsupportedType {
                mime: file.mime_type,
                file_name: file.file_name,
            });
        }
        if file.size_bytes > self.inner.policy.max_size_bytes {
            return Err(MessagingError::FileTooLarge {
                size_bytes: file.size_bytes,
                limit_bytes: self.inner.policy.max_size_bytes,
            });
        }

        let mut state = self.inner.state.lock().await;

        if let Some(&existing_id) = state.by_reference.get(&file.reference) {
            if let Some(existing) = state.staged.iter().find(|a| a.id == existing_id) {
                debug!(reference = %file.reference, "file already staged, no-op");
                return Ok(existing.clone());
            }
        }

        let attachment = MessageAttachment {
            id: Uuid::new_v4(),
            kind: AttachmentKind::from_mime(&file.mime_type, &file.file_name),
            state: AttachmentState::Staged,
            progress: 0,
            url: None,
            file_name: file.file_name.clone(),
            mime_type: file.mime_type.clone(),
            size_bytes: file.size_bytes,
            error: None,
        };

        state.by_reference.insert(file.reference.clone(), attachment.id);
        state.files.insert(attachment.id, file);
        state.staged.push(attachment.clone());
        drop(state);

        self.inner.emit(AttachmentEvent::Updated(attachment.clone()));
        Ok(attachment)
    }

    /// Transition `staged → uploading` and start consuming the uploader's
    /// progress stream. Also accepts `failed` attachments for per-attachment
    /// retry. Concurrent uploads run independently.
    pub async fn begin_upload(
        &self,
        attachment_id: Uuid,
        uploader: Arc<dyn Uploader>,
    ) -> Result<(), MessagingError> {
        let (request, cancel) = {
            let mut state = self.inner.state.lock().await;
            let attachment = state
                .staged
                .iter_mut()
                .find(|a| a.id == attachment_id)
                .ok_or(MessagingError::UnknownAttachment { id: attachment_id })?;

            match attachment.state {
                AttachmentState::Staged | AttachmentState::Failed => {}
                AttachmentState::Uploading | AttachmentState::Uploaded => {
                    debug!(%attachment_id, state = ?attachment.state, "upload already underway, no-op");
                    return Ok(());
                }
            }

            attachment.state = AttachmentState::Uploading;
            attachment.progress = 0;
            attachment.error = None;
            let updated = attachment.clone();

            let file = state
                .files
                .get(&attachment_id)
                .ok_or(MessagingError::UnknownAttachment { id: attachment_id })?;
            let request = UploadRequest {
                attachment_id,
                reference: file.reference.clone(),
                file_name: file.file_name.clone(),
                mime_type: file.mime_type.clone(),
                size_bytes: file.size_bytes,
            };

            let cancel = CancelHandle::new();
            state.cancels.insert(attachment_id, cancel.clone());

            self.inner.emit(AttachmentEvent::Updated(updated));
            (request, cancel)
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut stream = uploader.upload(request, cancel.clone());
            let mut terminal = false;

            while let Some(event) = stream.next().await {
                if cancel.is_cancelled() {
                    break;
                }
                match event {
                    UploadEvent::Progress(progress) => {
                        inner.apply_progress(attachment_id, progress.min(100)).await;
                    }
                    UploadEvent::Completed { url } => {
                        inner.apply_completed(attachment_id, url).await;
                        terminal = true;
                        break;
                    }
                    UploadEvent::Failed { reason } => {
                        inner.apply_failed(attachment_id, &reason).await;
                        terminal = true;
                        break;
                    }
                }
            }

            if cancel.is_cancelled() {
                // cancel() already removed the attachment; nothing to update.
                debug!(%attachment_id, "upload task exiting after cancellation");
            } else if !terminal {
                inner
                    .apply_failed(attachment_id, "upload stream ended unexpectedly")
                    .await;
            }
            inner.state.lock().await.cancels.remove(&attachment_id);
        });

        Ok(())
    }

    /// Remove an attachment from the staged set. An in-flight upload is
    /// signalled to stop; a cancelled attachment is removed, not failed.
    pub async fn cancel(&self, attachment_id: Uuid) -> Result<(), MessagingError> {
        let mut state = self.inner.state.lock().await;
        let idx = state
            .staged
            .iter()
            .position(|a| a.id == attachment_id)
            .ok_or(MessagingError::UnknownAttachment { id: attachment_id })?;

        if let Some(cancel) = state.cancels.remove(&attachment_id) {
            cancel.cancel();
        }

        let removed = state.staged.remove(idx);
        state.by_reference.retain(|_, id| *id != attachment_id);
        state.files.remove(&attachment_id);
        drop(state);

        debug!(%attachment_id, file = %removed.file_name, "attachment removed");
        self.inner.emit(AttachmentEvent::Removed(attachment_id));
        Ok(())
    }

    /// Current staged set, in staging order.
    pub async fn snapshot(&self) -> Vec<MessageAttachment> {
        self.inner.state.lock().await.staged.clone()
    }

    /// Current state of just the given attachments, in staging order. Ids no
    /// longer staged (removed before send) are simply absent from the result.
    pub async fn subset(&self, ids: &[Uuid]) -> Vec<MessageAttachment> {
        self.inner
            .state
            .lock()
            .await
            .staged
            .iter()
            .filter(|a| ids.contains(&a.id))
            .cloned()
            .collect()
    }

    /// Drop attachments that were folded into a sent message. Unlike
    /// [`cancel`](Self::cancel) this signals nothing and emits no removal
    /// events — the attachments live on in the message. Anything staged since
    /// stays untouched.
    pub async fn release(&self, ids: &[Uuid]) {
        let mut state = self.inner.state.lock().await;
        state.staged.retain(|a| !ids.contains(&a.id));
        state.by_reference.retain(|_, id| !ids.contains(id));
        state.files.retain(|id, _| !ids.contains(id));
        state.cancels.retain(|id, _| !ids.contains(id));
    }

    /// True when every staged attachment has reached `uploaded` (vacuously
    /// true for an empty set) — the gate for dispatching a deferred send.
    pub async fn all_uploaded(&self) -> bool {
        self.inner
            .state
            .lock()
            .await
            .staged
            .iter()
            .all(|a| a.state == AttachmentState::Uploaded)
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.state.lock().await.staged.is_empty()
    }

    /// Drop all staged attachments; called once they are folded into a sent
    /// message.
    pub async fn clear(&self) {
        let mut state = self.inner.state.lock().await;
        for cancel in state.cancels.values() {
            cancel.cancel();
        }
        *state = PipelineState::default();
    }
}

impl PipelineInner {
    async fn apply_progress(&self, attachment_id: Uuid, progress: u8) {
        let updated = {
            let mut state = self.state.lock().await;
            let Some(attachment) = state.staged.iter_mut().find(|a| a.id == attachment_id) else {
                return; // removed while the event was in flight
            };
            if attachment.state != AttachmentState::Uploading {
                return;
            }
            attachment.progress = progress;
            attachment.clone()
        };
        self.emit(AttachmentEvent::Updated(updated));
    }

    async fn apply_completed(&self, attachment_id: Uuid, url: String) {
        let updated = {
            let mut state = self.state.lock().await;
            let Some(attachment) = state.staged.iter_mut().find(|a| a.id == attachment_id) else {
                return;
            };
            attachment.state = AttachmentState::Uploaded;
            attachment.progress = 100;
            attachment.url = Some(url);
            attachment.error = None;
            attachment.clone()
        };
        self.emit(AttachmentEvent::Updated(updated));
    }

    async fn apply_failed(&self, attachment_id: Uuid, reason: &str) {
        let updated = {
            let mut state = self.state.lock().await;
            let Some(attachment) = state.staged.iter_mut().find(|a| a.id == attachment_id) else {
                return;
            };
            attachment.state = AttachmentState::Failed;
            attachment.error = Some(reason.to_string());
            attachment.clone()
        };
        warn!(%attachment_id, reason, "attachment upload failed");
        self.emit(AttachmentEvent::Updated(updated));
    }

    fn emit(&self, event: AttachmentEvent) {
        let _ = self.events_tx.send(event);
    }
}
