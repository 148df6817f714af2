/// Composer / optimistic-send controller for one conversation.
///
/// Owns the conversation store, the attachment pipeline, and the typing
/// tracker; turns user input plus staged attachments into a pending message,
/// hands it to the delivery collaborator, and reconciles success or failure.
/// Every state change fans out as a [`MessagingEvent`] for the render layer.
///
/// Sends are scoped to this conversation: a transport call in flight here
/// never blocks other conversations, typing indicators, or receipt handling.
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use carelink_types::{
    Conversation, InboundEvent, Message, MessageAttachment, MessageGroup, MessagingEvent,
};

use crate::attachments::{AttachmentEvent, AttachmentPipeline, FileInput};
use crate::config::MessagingConfig;
use crate::error::MessagingError;
use crate::grouping::group_messages;
use crate::presence::TypingTracker;
use crate::store::ConversationStore;
use crate::transport::{Delivery, OutgoingMessage, Uploader};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Draft lifecycle: `Idle → Composing → Sending`, returning to `Idle` on
/// success or `Composing` (content preserved) on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DraftState {
    #[default]
    Idle,
    Composing,
    Sending,
}

#[derive(Clone)]
pub struct Composer {
    inner: Arc<ComposerInner>,
}

struct ComposerInner {
    config: MessagingConfig,
    delivery: Arc<dyn Delivery>,
    conversation_id: Uuid,
    local_participant: Uuid,
    store: Mutex<ConversationStore>,
    pipeline: AttachmentPipeline,
    typing: Mutex<TypingTracker>,
    draft: Mutex<Draft>,
    events_tx: broadcast::Sender<MessagingEvent>,
}

#[derive(Default)]
struct Draft {
    state: DraftState,
    body: String,
    /// Temp ids of pending messages whose transport call waits on uploads.
    deferred: Vec<Uuid>,
}

impl Composer {
    pub fn new(
        conversation: Conversation,
        local_participant: Uuid,
        config: MessagingConfig,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let conversation_id = conversation.id;
        let pipeline = AttachmentPipeline::new(config.attachments.clone());
        let typing = Mutex::new(TypingTracker::new(config.typing.ttl));

        let composer = Self {
            inner: Arc::new(ComposerInner {
                store: Mutex::new(ConversationStore::new(conversation, local_participant)),
                delivery,
                conversation_id,
                local_participant,
                pipeline,
                typing,
                draft: Mutex::new(Draft::default()),
                events_tx,
                config,
            }),
        };
        composer.spawn_pipeline_listener();
        composer.spawn_typing_sweeper();
        composer
    }

    /// Subscribe to render-layer events.
    pub fn subscribe(&self) -> broadcast::Receiver<MessagingEvent> {
        self.inner.events_tx.subscribe()
    }

    // -- Draft --

    pub async fn set_body(&self, body: impl Into<String>) {
        let mut draft = self.inner.draft.lock().await;
        draft.body = body.into();
        if draft.state == DraftState::Idle && !draft.body.is_empty() {
            draft.state = DraftState::Composing;
        }
    }

    pub async fn body(&self) -> String {
        self.inner.draft.lock().await.body.clone()
    }

    pub async fn draft_state(&self) -> DraftState {
        self.inner.draft.lock().await.state
    }

    // -- Attachments --

    pub async fn stage_attachment(
        &self,
        file: FileInput,
    ) -> Result<MessageAttachment, MessagingError> {
        let staged = self.inner.pipeline.stage(file).await?;
        let mut draft = self.inner.draft.lock().await;
        if draft.state == DraftState::Idle {
            draft.state = DraftState::Composing;
        }
        Ok(staged)
    }

    pub async fn begin_upload(
        &self,
        attachment_id: Uuid,
        uploader: Arc<dyn Uploader>,
    ) -> Result<(), MessagingError> {
        self.inner.pipeline.begin_upload(attachment_id, uploader).await
    }

    pub async fn cancel_attachment(&self, attachment_id: Uuid) -> Result<(), MessagingError> {
        self.inner.pipeline.cancel(attachment_id).await
    }

    pub async fn attachments(&self) -> Vec<MessageAttachment> {
        self.inner.pipeline.snapshot().await
    }

    // -- Sending --

    /// Validate the draft and place it in the list as a pending message.
    ///
    /// Validation (`EmptyMessage`, `MessageTooLong`) happens synchronously,
    /// before any transport interaction. One send at a time per conversation:
    /// submitting while a previous send is unresolved is rejected with
    /// `SendInProgress`, and the staged attachments bind to the message here —
    /// a later submit cannot fold them into a second message. If attachment
    /// uploads are still in flight the transport call is deferred until they
    /// all resolve, then fires exactly once. Input is cleared only on
    /// transport success.
    pub async fn submit(&self) -> Result<Message, MessagingError> {
        let (body, prior) = {
            let mut draft = self.inner.draft.lock().await;
            if draft.state == DraftState::Sending {
                return Err(MessagingError::SendInProgress);
            }
            let prior = draft.state;
            draft.state = DraftState::Sending;
            (draft.body.clone(), prior)
        };

        if let Some(limit) = self.inner.config.max_body_chars {
            let len = body.chars().count();
            if len > limit {
                self.inner.draft.lock().await.state = prior;
                return Err(MessagingError::MessageTooLong { len, limit });
            }
        }

        let attachments = self.inner.pipeline.snapshot().await;
        let body = Some(body).filter(|b| !b.trim().is_empty());
        if body.is_none() && attachments.is_empty() {
            self.inner.draft.lock().await.state = prior;
            return Err(MessagingError::EmptyMessage);
        }

        let created = {
            let mut store = self.inner.store.lock().await;
            store.create(body, attachments, self.inner.local_participant)
        };
        let message = match created {
            Ok(message) => message,
            Err(err) => {
                self.inner.draft.lock().await.state = prior;
                return Err(err);
            }
        };
        self.inner.emit(MessagingEvent::MessagePending {
            message: message.clone(),
        });

        self.inner.draft.lock().await.deferred.push(message.id);
        if !ComposerInner::dispatch_ready(&self.inner).await {
            info!(temp_id = %message.id, "attachment uploads in flight, send deferred");
        }

        Ok(message)
    }

    /// Resend a failed message with its original body and attachments. The
    /// same temp id goes back to the transport, so an idempotent server
    /// resolves it to a single logical message. Retrying a message that is
    /// not failed (a double click racing the confirmation) is a no-op.
    pub async fn retry(&self, message_id: Uuid) -> Result<Message, MessagingError> {
        let retried = {
            let mut store = self.inner.store.lock().await;
            match store.retry(message_id)? {
                Some(message) => message,
                None => {
                    debug!(%message_id, "retry of a non-failed message ignored");
                    return store
                        .message(message_id)
                        .cloned()
                        .ok_or(MessagingError::UnknownMessage { id: message_id });
                }
            }
        };
        {
            let mut draft = self.inner.draft.lock().await;
            draft.state = DraftState::Sending;
        }
        ComposerInner::dispatch(self.inner.clone(), retried.id, false);
        Ok(retried)
    }

    // -- Inbound events --

    /// Route an event pushed by the host's transport. Events for other
    /// conversations are ignored.
    pub async fn apply_inbound(&self, event: InboundEvent) -> Result<(), MessagingError> {
        if event.conversation_id() != self.inner.conversation_id {
            debug!(
                event_conversation = %event.conversation_id(),
                conversation = %self.inner.conversation_id,
                "inbound event for another conversation ignored"
            );
            return Ok(());
        }

        match event {
            InboundEvent::Typing {
                participant_id,
                is_typing,
                ..
            } => {
                self.set_typing(participant_id, is_typing).await;
                Ok(())
            }
            InboundEvent::Delivered { message_id, .. } => {
                let updated = {
                    let mut store = self.inner.store.lock().await;
                    match store.mark_delivered(message_id) {
                        Ok(updated) => updated,
                        Err(err @ MessagingError::UnknownMessage { .. }) => {
                            debug!(%err, "delivered event for unknown message ignored");
                            None
                        }
                        Err(err) => return Err(err),
                    }
                };
                if let Some(message) = updated {
                    self.inner.emit(MessagingEvent::MessageUpdated { message });
                }
                Ok(())
            }
            InboundEvent::ReadReceipt {
                message_id,
                participant_id,
                read_at,
                ..
            } => self.record_receipt(message_id, participant_id, read_at).await,
        }
    }

    /// Upsert a participant's typing state (heartbeats refresh the expiry).
    pub async fn set_typing(&self, participant_id: Uuid, is_typing: bool) {
        let now = Utc::now();
        let mut typing = self.inner.typing.lock().await;
        if typing.set_typing(participant_id, is_typing, now) {
            let participants = typing.typing_participants(now);
            drop(typing);
            self.inner.emit(MessagingEvent::TypingChanged {
                conversation_id: self.inner.conversation_id,
                participants,
            });
        }
    }

    /// Apply a read receipt and advance the participant's "seen up to"
    /// marker. Receipts for ids we never issued are logged and dropped — the
    /// host may be replaying history we do not hold.
    pub async fn record_receipt(
        &self,
        message_id: Uuid,
        participant_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<(), MessagingError> {
        let outcome = {
            let mut store = self.inner.store.lock().await;
            match store.apply_read_receipt(message_id, participant_id, read_at) {
                Ok(outcome) => outcome,
                Err(err @ MessagingError::UnknownMessage { .. }) => {
                    debug!(%err, "receipt for unknown message ignored");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        };

        if let Some(message) = outcome.message {
            self.inner.emit(MessagingEvent::MessageUpdated { message });
        }
        if let Some(seen_at) = outcome.seen_advanced_to {
            self.inner.emit(MessagingEvent::SeenUpTo {
                conversation_id: self.inner.conversation_id,
                participant_id,
                seen_at,
            });
        }
        Ok(())
    }

    /// Insert a message delivered by the host for another participant.
    /// Duplicate deliveries merge silently.
    pub async fn receive_message(&self, message: Message) {
        let inserted = self.inner.store.lock().await.insert_remote(message);
        if let Some(message) = inserted {
            self.inner.emit(MessagingEvent::MessageReceived { message });
        }
    }

    /// The local user is viewing the conversation; clears the unread count.
    pub async fn mark_read(&self) {
        self.inner.store.lock().await.mark_read_locally();
    }

    // -- Read access --

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.store.lock().await.messages().to_vec()
    }

    pub async fn conversation(&self) -> Conversation {
        self.inner.store.lock().await.conversation().clone()
    }

    /// Rendering projection: the grouping engine reads the list, never
    /// mutates it.
    pub async fn groups(&self, today: NaiveDate) -> Vec<MessageGroup> {
        let store = self.inner.store.lock().await;
        group_messages(store.messages(), &self.inner.config.grouping, today)
    }

    pub async fn seen_up_to(&self, participant_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner.store.lock().await.seen_up_to(participant_id)
    }

    pub async fn typing_participants(&self) -> Vec<Uuid> {
        self.inner.typing.lock().await.typing_participants(Utc::now())
    }

    // -- Background tasks --

    /// Forward pipeline events to subscribers and fire deferred sends once
    /// every upload has resolved. Holds only a weak handle so dropping the
    /// composer shuts the task down.
    fn spawn_pipeline_listener(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut events = self.inner.pipeline.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "attachment event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else { break };

                match &event {
                    AttachmentEvent::Updated(attachment) => {
                        inner.emit(MessagingEvent::AttachmentUpdated {
                            attachment: attachment.clone(),
                        });
                    }
                    AttachmentEvent::Removed(attachment_id) => {
                        inner.emit(MessagingEvent::AttachmentRemoved {
                            attachment_id: *attachment_id,
                        });
                    }
                }
                ComposerInner::dispatch_ready(&inner).await;
            }
        });
    }

    /// One shared expiry timer per conversation view, regardless of how many
    /// participants are typing.
    fn spawn_typing_sweeper(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.typing.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let now = Utc::now();
                let mut typing = inner.typing.lock().await;
                if typing.sweep(now) {
                    let participants = typing.typing_participants(now);
                    drop(typing);
                    inner.emit(MessagingEvent::TypingChanged {
                        conversation_id: inner.conversation_id,
                        participants,
                    });
                }
            }
        });
    }
}

impl ComposerInner {
    /// Fire any deferred sends whose uploads have all resolved. The deferral
    /// list is drained under the draft lock, so each send fires exactly once
    /// no matter how callbacks interleave. Returns true when something was
    /// dispatched.
    async fn dispatch_ready(inner: &Arc<ComposerInner>) -> bool {
        let ready = {
            let mut draft = inner.draft.lock().await;
            if draft.deferred.is_empty() || !inner.pipeline.all_uploaded().await {
                return false;
            }
            std::mem::take(&mut draft.deferred)
        };
        for temp_id in &ready {
            Self::dispatch(inner.clone(), *temp_id, true);
        }
        !ready.is_empty()
    }

    /// Hand a pending message to the delivery collaborator and reconcile the
    /// outcome. `fold_uploads` refreshes the attachments bound to this message
    /// from the pipeline first (initial sends); retries resend the stored
    /// payload untouched. Only the message's own attachment ids are folded,
    /// so files staged for a later draft never leak in.
    fn dispatch(inner: Arc<ComposerInner>, temp_id: Uuid, fold_uploads: bool) {
        tokio::spawn(async move {
            let outgoing = {
                let bound: Vec<Uuid> = {
                    let store = inner.store.lock().await;
                    match store.message(temp_id) {
                        Some(message) => message.attachments.iter().map(|a| a.id).collect(),
                        None => {
                            warn!(%temp_id, "dispatch aborted, message no longer in store");
                            return;
                        }
                    }
                };
                let message = if fold_uploads {
                    let refreshed = inner.pipeline.subset(&bound).await;
                    let mut store = inner.store.lock().await;
                    store.update_attachments(temp_id, refreshed)
                } else {
                    inner
                        .store
                        .lock()
                        .await
                        .message(temp_id)
                        .cloned()
                        .ok_or(MessagingError::UnknownMessage { id: temp_id })
                };
                let message = match message {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(%temp_id, %err, "dispatch aborted");
                        return;
                    }
                };
                OutgoingMessage {
                    temp_id: message.id,
                    conversation_id: message.conversation_id,
                    sender_id: message.sender_id,
                    body: message.body.clone(),
                    attachments: message.attachments.clone(),
                }
            };
            let folded: Vec<Uuid> = outgoing.attachments.iter().map(|a| a.id).collect();

            debug!(%temp_id, "handing message to delivery transport");
            match inner.delivery.send(outgoing).await {
                Ok(confirmation) => {
                    let confirmed = inner.store.lock().await.mark_sent(
                        temp_id,
                        confirmation.server_id,
                        confirmation.server_timestamp,
                    );
                    match confirmed {
                        Ok(message) => {
                            // Release only this message's attachments; anything
                            // staged since belongs to the next draft.
                            inner.pipeline.release(&folded).await;
                            {
                                let mut draft = inner.draft.lock().await;
                                draft.body.clear();
                                draft.state = DraftState::Idle;
                            }
                            info!(%temp_id, server_id = %confirmation.server_id, "message sent");
                            inner.emit(MessagingEvent::MessageSent { temp_id, message });
                        }
                        Err(err @ MessagingError::DuplicateConfirmation { .. }) => {
                            // Transport replay — logged, never surfaced.
                            warn!(%temp_id, %err, "duplicate confirmation ignored");
                        }
                        Err(err) => {
                            warn!(%temp_id, %err, "confirmation could not be applied");
                        }
                    }
                }
                Err(err) => {
                    let reason = err.to_string();
                    let failed = inner.store.lock().await.mark_failed(temp_id, &reason);
                    {
                        let mut draft = inner.draft.lock().await;
                        draft.state = DraftState::Composing;
                    }
                    match failed {
                        Ok(_) => {
                            warn!(%temp_id, reason, "send failed, payload kept for retry");
                            inner.emit(MessagingEvent::MessageFailed {
                                message_id: temp_id,
                                reason,
                            });
                        }
                        Err(err) => warn!(%temp_id, %err, "failure could not be recorded"),
                    }
                }
            }
        });
    }

    fn emit(&self, event: MessagingEvent) {
        let _ = self.events_tx.send(event);
    }
}
