/// Conversation store: owns the in-memory message list for one conversation
/// and enforces the status machine
/// (`pending → sent → delivered → read`, `pending ⇄ failed` on retry).
///
/// The store is the single writer; the grouping engine and the host only read
/// from it. Status transitions apply by state-machine rank regardless of
/// callback arrival order, so a late `delivered` after `read` never regresses
/// anything.
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use carelink_types::{Conversation, Message, MessageAttachment, MessageStatus};

use crate::error::MessagingError;

const PREVIEW_MAX_CHARS: usize = 80;

/// Result of applying an inbound read receipt.
#[derive(Debug, Clone)]
pub struct ReceiptOutcome {
    /// The updated message, when the receipt changed anything on it.
    pub message: Option<Message>,
    /// Set when the participant's aggregate "seen up to" marker advanced.
    pub seen_advanced_to: Option<DateTime<Utc>>,
}

pub struct ConversationStore {
    conversation: Conversation,
    local_participant: Uuid,
    messages: Vec<Message>,
    /// Temp id → server id, retained for the store's lifetime so duplicate
    /// deliveries of the same logical message merge instead of duplicating.
    confirmed: HashMap<Uuid, Uuid>,
    /// Participant → max read-at acknowledged. Backs the single trailing
    /// "seen" indicator instead of per-message receipt rendering.
    seen_up_to: HashMap<Uuid, DateTime<Utc>>,
}

impl ConversationStore {
    pub fn new(conversation: Conversation, local_participant: Uuid) -> Self {
        Self {
            conversation,
            local_participant,
            messages: Vec::new(),
            confirmed: HashMap::new(),
            seen_up_to: HashMap::new(),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Messages in render order. Primarily by `server_timestamp` when
    /// present, else `created_at`; a message only moves at pending→sent
    /// re-keying, and then only if the server timestamp demands it.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: Uuid) -> Option<&Message> {
        self.index_of(id).map(|idx| &self.messages[idx])
    }

    pub fn seen_up_to(&self, participant_id: Uuid) -> Option<DateTime<Utc>> {
        self.seen_up_to.get(&participant_id).copied()
    }

    /// Create an optimistic outgoing message in `pending` with a generated
    /// temp id. At least one of body/attachments must be non-empty.
    pub fn create(
        &mut self,
        body: Option<String>,
        attachments: Vec<MessageAttachment>,
        sender_id: Uuid,
    ) -> Result<Message, MessagingError> {
        let body = body.filter(|b| !b.trim().is_empty());
        if body.is_none() && attachments.is_empty() {
            return Err(MessagingError::EmptyMessage);
        }

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: self.conversation.id,
            sender_id,
            body,
            attachments,
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            server_timestamp: None,
            read_by: BTreeMap::new(),
            failure_reason: None,
        };

        self.conversation.last_message_preview = preview_for(&message);
        self.messages.push(message.clone());
        Ok(message)
    }

    /// Insert a message that arrived from another participant. Duplicate
    /// deliveries (same server id, or a server id our temp map already
    /// resolved) merge as a no-op. Returns the inserted message.
    pub fn insert_remote(&mut self, message: Message) -> Option<Message> {
        if self.index_of(message.id).is_some() || self.confirmed.values().any(|s| *s == message.id) {
            debug!(message_id = %message.id, "duplicate delivery merged");
            return None;
        }

        if message.sender_id != self.local_participant {
            self.conversation.unread_count += 1;
        }
        self.conversation.last_message_preview = preview_for(&message);

        let timestamp = message.effective_timestamp();
        let pos = self
            .messages
            .partition_point(|m| m.effective_timestamp() <= timestamp);
        self.messages.insert(pos, message.clone());
        Some(message)
    }

    /// The local user viewed the conversation; clear the unread counter.
    pub fn mark_read_locally(&mut self) {
        self.conversation.unread_count = 0;
    }

    /// Confirm a pending message: re-key it to the server id and timestamp.
    ///
    /// Idempotent on the same `server_id`. A second confirmation carrying a
    /// different server id signals a transport replay gone wrong — reported
    /// as `DuplicateConfirmation` for the caller to log, never fatal.
    pub fn mark_sent(
        &mut self,
        temp_id: Uuid,
        server_id: Uuid,
        server_timestamp: DateTime<Utc>,
    ) -> Result<Message, MessagingError> {
        if let Some(&existing) = self.confirmed.get(&temp_id) {
            if existing == server_id {
                debug!(%temp_id, %server_id, "replayed confirmation, no-op");
                return self
                    .message(server_id)
                    .cloned()
                    .ok_or(MessagingError::UnknownMessage { id: server_id });
            }
            return Err(MessagingError::DuplicateConfirmation {
                temp_id,
                existing,
                incoming: server_id,
            });
        }

        let idx = self
            .index_of(temp_id)
            .ok_or(MessagingError::UnknownMessage { id: temp_id })?;

        if self.messages[idx].status != MessageStatus::Pending {
            warn!(
                %temp_id,
                status = ?self.messages[idx].status,
                "confirmation for non-pending message ignored"
            );
            return Ok(self.messages[idx].clone());
        }

        {
            let message = &mut self.messages[idx];
            message.id = server_id;
            message.status = MessageStatus::Sent;
            message.server_timestamp = Some(server_timestamp);
            message.failure_reason = None;
        }
        self.confirmed.insert(temp_id, server_id);
        self.reposition(idx);

        self.message(server_id)
            .cloned()
            .ok_or(MessagingError::UnknownMessage { id: server_id })
    }

    /// Transition a pending message to `failed`, retaining body and
    /// attachments so the user can retry without retyping.
    pub fn mark_failed(&mut self, temp_id: Uuid, reason: &str) -> Result<Message, MessagingError> {
        let idx = self
            .index_of(temp_id)
            .ok_or(MessagingError::UnknownMessage { id: temp_id })?;
        let message = &mut self.messages[idx];

        if message.status != MessageStatus::Pending {
            debug!(%temp_id, status = ?message.status, "late failure ignored");
            return Ok(message.clone());
        }

        message.status = MessageStatus::Failed;
        message.failure_reason = Some(reason.to_string());
        Ok(message.clone())
    }

    /// Manual retry back-edge: `failed → pending`. Returns `None` when the
    /// message is not in `failed` (nothing to resend — guards the caller
    /// against double-dispatch on stale retry clicks).
    pub fn retry(&mut self, id: Uuid) -> Result<Option<Message>, MessagingError> {
        let idx = self.index_of(id).ok_or(MessagingError::UnknownMessage { id })?;
        let message = &mut self.messages[idx];

        if message.status != MessageStatus::Failed {
            debug!(%id, status = ?message.status, "retry on non-failed message ignored");
            return Ok(None);
        }

        message.status = MessageStatus::Pending;
        message.failure_reason = None;
        Ok(Some(message.clone()))
    }

    /// Rank-gated upgrade to `delivered`, applicable once the message is
    /// confirmed. Returns the updated message, or `None` when the event
    /// arrived out of order and changed nothing.
    pub fn mark_delivered(&mut self, message_id: Uuid) -> Result<Option<Message>, MessagingError> {
        let idx = self
            .index_of(message_id)
            .ok_or(MessagingError::UnknownMessage { id: message_id })?;
        let message = &mut self.messages[idx];

        if message.status == MessageStatus::Pending {
            debug!(%message_id, "delivered event before confirmation ignored");
            return Ok(None);
        }
        if message.status == MessageStatus::Failed {
            warn!(%message_id, "delivered event for failed message ignored");
            return Ok(None);
        }
        if !message.status.can_upgrade_to(MessageStatus::Delivered) {
            return Ok(None);
        }
        message.status = MessageStatus::Delivered;
        Ok(Some(message.clone()))
    }

    /// Apply a read receipt, applicable once the message is confirmed —
    /// receipts addressed to a still-pending or failed message are ignored,
    /// as are receipts from the message's own sender. Status upgrades to
    /// `read` by rank and never regresses.
    pub fn apply_read_receipt(
        &mut self,
        message_id: Uuid,
        participant_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> Result<ReceiptOutcome, MessagingError> {
        let idx = self
            .index_of(message_id)
            .ok_or(MessagingError::UnknownMessage { id: message_id })?;

        let changed = {
            let message = &mut self.messages[idx];
            if participant_id == message.sender_id {
                debug!(%message_id, %participant_id, "receipt from sender ignored");
                return Ok(ReceiptOutcome {
                    message: None,
                    seen_advanced_to: None,
                });
            }
            if message.status == MessageStatus::Pending {
                debug!(%message_id, "read receipt before confirmation ignored");
                return Ok(ReceiptOutcome {
                    message: None,
                    seen_advanced_to: None,
                });
            }
            if message.status == MessageStatus::Failed {
                warn!(%message_id, "read receipt for failed message ignored");
                return Ok(ReceiptOutcome {
                    message: None,
                    seen_advanced_to: None,
                });
            }

            // Keep the earliest read-at per participant.
            let new_reader = message.read_by.get(&participant_id).is_none();
            if new_reader {
                message.read_by.insert(participant_id, read_at);
            }

            let upgraded = message.status.can_upgrade_to(MessageStatus::Read);
            if upgraded {
                message.status = MessageStatus::Read;
            }

            (new_reader || upgraded).then(|| message.clone())
        };

        let seen_advanced_to = self.advance_seen(participant_id, read_at);
        Ok(ReceiptOutcome {
            message: changed,
            seen_advanced_to,
        })
    }

    /// Replace a pending message's attachments (used when staged uploads
    /// resolve and the final urls are folded in before dispatch).
    pub fn update_attachments(
        &mut self,
        id: Uuid,
        attachments: Vec<MessageAttachment>,
    ) -> Result<Message, MessagingError> {
        let idx = self.index_of(id).ok_or(MessagingError::UnknownMessage { id })?;
        self.messages[idx].attachments = attachments;
        Ok(self.messages[idx].clone())
    }

    fn advance_seen(&mut self, participant_id: Uuid, read_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.seen_up_to.get(&participant_id) {
            Some(&existing) if existing >= read_at => None,
            _ => {
                self.seen_up_to.insert(participant_id, read_at);
                Some(read_at)
            }
        }
    }

    /// Resolve an id that may be either a live message id or a retained temp
    /// id of an already-confirmed message.
    fn index_of(&self, id: Uuid) -> Option<usize> {
        let target = self.confirmed.get(&id).copied().unwrap_or(id);
        self.messages.iter().position(|m| m.id == target)
    }

    /// Keep the message where it is unless the newly assigned server
    /// timestamp genuinely reorders it. Only confirmed neighbors constrain
    /// the position — pending siblings hold their optimistic spot until
    /// their own confirmation re-keys them.
    fn reposition(&mut self, idx: usize) {
        let Some(timestamp) = self.messages[idx].server_timestamp else {
            return;
        };

        let prev_ok = self.messages[..idx]
            .iter()
            .rev()
            .find_map(|m| m.server_timestamp)
            .is_none_or(|prev| prev <= timestamp);
        let next_ok = self.messages[idx + 1..]
            .iter()
            .find_map(|m| m.server_timestamp)
            .is_none_or(|next| timestamp <= next);
        if prev_ok && next_ok {
            return;
        }

        let message = self.messages.remove(idx);
        // Order against confirmed messages by server timestamp, against
        // pending ones by the optimistic client key.
        let pos = self.messages.partition_point(|m| match m.server_timestamp {
            Some(confirmed) => confirmed <= timestamp,
            None => m.created_at <= message.created_at,
        });
        self.messages.insert(pos, message);
    }
}

fn preview_for(message: &Message) -> Option<String> {
    match &message.body {
        Some(body) if !body.trim().is_empty() => {
            Some(body.chars().take(PREVIEW_MAX_CHARS).collect())
        }
        _ => message.attachments.first().map(|a| a.file_name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    use carelink_types::{AttachmentKind, AttachmentState};

    fn store() -> (ConversationStore, Uuid) {
        let me = Uuid::new_v4();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            participants: vec![],
            last_message_preview: None,
            unread_count: 0,
        };
        (ConversationStore::new(conversation, me), me)
    }

    fn attachment(name: &str) -> MessageAttachment {
        MessageAttachment {
            id: Uuid::new_v4(),
            kind: AttachmentKind::File,
            state: AttachmentState::Uploaded,
            progress: 100,
            url: Some("https://files.example/a".to_string()),
            file_name: name.to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 1024,
            error: None,
        }
    }

    #[test]
    fn empty_create_is_rejected_without_side_effects() {
        let (mut store, me) = store();
        let err = store.create(Some("   ".to_string()), vec![], me).unwrap_err();
        assert!(matches!(err, MessagingError::EmptyMessage));
        assert!(store.messages().is_empty());
        assert!(store.conversation().last_message_preview.is_none());
    }

    #[test]
    fn attachment_only_message_is_allowed() {
        let (mut store, me) = store();
        let msg = store.create(None, vec![attachment("labs.pdf")], me).unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(
            store.conversation().last_message_preview.as_deref(),
            Some("labs.pdf")
        );
    }

    #[test]
    fn mark_sent_rekeys_and_is_idempotent() {
        let (mut store, me) = store();
        let msg = store.create(Some("hi".to_string()), vec![], me).unwrap();
        let server_id = Uuid::new_v4();
        let ts = Utc::now();

        let sent = store.mark_sent(msg.id, server_id, ts).unwrap();
        assert_eq!(sent.id, server_id);
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.server_timestamp, Some(ts));

        // Replay with the same server id is a no-op.
        let again = store.mark_sent(msg.id, server_id, ts).unwrap();
        assert_eq!(again.id, server_id);
        assert_eq!(store.messages().len(), 1);

        // A different server id after confirmation is a replay anomaly.
        let err = store.mark_sent(msg.id, Uuid::new_v4(), ts).unwrap_err();
        assert!(matches!(err, MessagingError::DuplicateConfirmation { .. }));
    }

    #[test]
    fn confirmation_preserves_position_unless_reordered() {
        let (mut store, me) = store();
        let first = store.create(Some("one".to_string()), vec![], me).unwrap();
        let second = store.create(Some("two".to_string()), vec![], me).unwrap();

        // Server timestamps arrive in the same order: nobody moves.
        let base = Utc::now();
        store.mark_sent(first.id, Uuid::new_v4(), base).unwrap();
        store.mark_sent(second.id, Uuid::new_v4(), base + TimeDelta::seconds(1)).unwrap();
        let bodies: Vec<_> = store.messages().iter().map(|m| m.body.clone().unwrap()).collect();
        assert_eq!(bodies, vec!["one", "two"]);
    }

    #[test]
    fn confirmation_reorders_when_server_timestamp_demands_it() {
        let (mut store, me) = store();
        let first = store.create(Some("one".to_string()), vec![], me).unwrap();
        let second = store.create(Some("two".to_string()), vec![], me).unwrap();

        let base = Utc::now();
        store.mark_sent(second.id, Uuid::new_v4(), base).unwrap();
        // First message confirmed with a later server timestamp: moves after.
        store.mark_sent(first.id, Uuid::new_v4(), base + TimeDelta::seconds(5)).unwrap();

        let bodies: Vec<_> = store.messages().iter().map(|m| m.body.clone().unwrap()).collect();
        assert_eq!(bodies, vec!["two", "one"]);
    }

    #[test]
    fn failed_message_keeps_payload_and_retries() {
        let (mut store, me) = store();
        let msg = store
            .create(Some("note".to_string()), vec![attachment("scan.pdf")], me)
            .unwrap();

        let failed = store.mark_failed(msg.id, "network down").unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.body.as_deref(), Some("note"));
        assert_eq!(failed.attachments.len(), 1);
        assert_eq!(failed.failure_reason.as_deref(), Some("network down"));

        let retried = store.retry(msg.id).unwrap().unwrap();
        assert_eq!(retried.status, MessageStatus::Pending);
        assert!(retried.failure_reason.is_none());
        assert_eq!(retried.id, msg.id); // same temp id for idempotent resend

        // A second retry click has nothing to resend.
        assert!(store.retry(msg.id).unwrap().is_none());
    }

    #[test]
    fn receipt_from_sender_is_ignored() {
        let (mut store, me) = store();
        let msg = store.create(Some("hi".to_string()), vec![], me).unwrap();
        let server_id = Uuid::new_v4();
        store.mark_sent(msg.id, server_id, Utc::now()).unwrap();

        let outcome = store.apply_read_receipt(server_id, me, Utc::now()).unwrap();
        assert!(outcome.message.is_none());
        assert_eq!(store.message(server_id).unwrap().status, MessageStatus::Sent);
    }

    #[test]
    fn status_never_regresses_after_read() {
        let (mut store, me) = store();
        let peer = Uuid::new_v4();
        let msg = store.create(Some("hi".to_string()), vec![], me).unwrap();
        let server_id = Uuid::new_v4();
        store.mark_sent(msg.id, server_id, Utc::now()).unwrap();

        let outcome = store.apply_read_receipt(server_id, peer, Utc::now()).unwrap();
        assert_eq!(outcome.message.unwrap().status, MessageStatus::Read);

        // Out-of-order delivered event must not regress.
        let late = store.mark_delivered(server_id).unwrap();
        assert!(late.is_none());
        assert_eq!(store.message(server_id).unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn receipt_or_delivered_before_confirmation_is_ignored() {
        let (mut store, me) = store();
        let peer = Uuid::new_v4();
        let msg = store.create(Some("hi".to_string()), vec![], me).unwrap();

        assert!(store.mark_delivered(msg.id).unwrap().is_none());
        let outcome = store.apply_read_receipt(msg.id, peer, Utc::now()).unwrap();
        assert!(outcome.message.is_none());
        assert!(outcome.seen_advanced_to.is_none());
        assert_eq!(store.message(msg.id).unwrap().status, MessageStatus::Pending);

        // The confirmation still lands and re-keys normally.
        let server_id = Uuid::new_v4();
        let ts = Utc::now();
        let sent = store.mark_sent(msg.id, server_id, ts).unwrap();
        assert_eq!(sent.id, server_id);
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.server_timestamp, Some(ts));
    }

    #[test]
    fn receipt_resolves_retained_temp_id() {
        let (mut store, me) = store();
        let peer = Uuid::new_v4();
        let msg = store.create(Some("hi".to_string()), vec![], me).unwrap();
        let server_id = Uuid::new_v4();
        store.mark_sent(msg.id, server_id, Utc::now()).unwrap();

        // Receipt addressed by the old temp id still lands.
        let outcome = store.apply_read_receipt(msg.id, peer, Utc::now()).unwrap();
        assert_eq!(outcome.message.unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn seen_marker_is_max_read_at() {
        let (mut store, me) = store();
        let peer = Uuid::new_v4();
        let a = store.create(Some("a".to_string()), vec![], me).unwrap();
        let b = store.create(Some("b".to_string()), vec![], me).unwrap();
        let sa = Uuid::new_v4();
        let sb = Uuid::new_v4();
        let base = Utc::now();
        store.mark_sent(a.id, sa, base).unwrap();
        store.mark_sent(b.id, sb, base + TimeDelta::seconds(1)).unwrap();

        let later = base + TimeDelta::seconds(30);
        let earlier = base + TimeDelta::seconds(10);

        let first = store.apply_read_receipt(sb, peer, later).unwrap();
        assert_eq!(first.seen_advanced_to, Some(later));

        // An older receipt does not move the marker back.
        let second = store.apply_read_receipt(sa, peer, earlier).unwrap();
        assert!(second.seen_advanced_to.is_none());
        assert_eq!(store.seen_up_to(peer), Some(later));
    }

    #[test]
    fn remote_duplicate_deliveries_merge() {
        let (mut store, me) = store();
        let peer = Uuid::new_v4();
        let incoming = Message {
            id: Uuid::new_v4(),
            conversation_id: store.conversation().id,
            sender_id: peer,
            body: Some("from peer".to_string()),
            attachments: vec![],
            status: MessageStatus::Sent,
            created_at: Utc::now(),
            server_timestamp: Some(Utc::now()),
            read_by: BTreeMap::new(),
            failure_reason: None,
        };

        assert!(store.insert_remote(incoming.clone()).is_some());
        assert!(store.insert_remote(incoming).is_none());
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.conversation().unread_count, 1);

        store.mark_read_locally();
        assert_eq!(store.conversation().unread_count, 0);
        let _ = me;
    }

    #[test]
    fn echo_of_own_confirmed_message_merges_by_temp_correlation() {
        let (mut store, me) = store();
        let msg = store.create(Some("hi".to_string()), vec![], me).unwrap();
        let server_id = Uuid::new_v4();
        store.mark_sent(msg.id, server_id, Utc::now()).unwrap();

        // The transport replays our own message under its server id.
        let echo = Message {
            id: server_id,
            conversation_id: store.conversation().id,
            sender_id: me,
            body: Some("hi".to_string()),
            attachments: vec![],
            status: MessageStatus::Sent,
            created_at: msg.created_at,
            server_timestamp: Some(Utc::now()),
            read_by: BTreeMap::new(),
            failure_reason: None,
        };
        assert!(store.insert_remote(echo).is_none());
        assert_eq!(store.messages().len(), 1);
    }
}
