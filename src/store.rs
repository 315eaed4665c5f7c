use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use crate::model::{Conversation, ConversationPatch, DeliveryStatus, Message};

pub const DEFAULT_MESSAGE_CAP: usize = 500;

#[derive(Default)]
struct StoreState {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<Message>>,
    // message ids ever observed per conversation; ids of capped-out
    // messages stay here so an old duplicate cannot reappear
    seen_ids: HashMap<String, HashSet<String>>,
}

/// Single source of truth for the conversation and message lists the UI
/// reads. All mutations are synchronous; readers observe each operation
/// atomically.
pub struct ConversationStore {
    state: RwLock<StoreState>,
    message_cap: usize,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::with_message_cap(DEFAULT_MESSAGE_CAP)
    }

    /// `message_cap` bounds how many messages are retained per
    /// conversation; the oldest are dropped past it. Conversations
    /// themselves are never evicted.
    pub fn with_message_cap(message_cap: usize) -> Self {
        ConversationStore {
            state: RwLock::new(StoreState::default()),
            message_cap,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idempotent insert keyed by message id; returns whether the message
    /// was new. Creates the owning conversation on first observation and
    /// refreshes its last-message fields.
    pub fn add_message(&self, message: Message) -> bool {
        let mut state = self.write();
        let conversation_id = message.conversation_id.clone();
        {
            let seen = state.seen_ids.entry(conversation_id.clone()).or_default();
            if !seen.insert(message.id.clone()) {
                debug!("ignoring duplicate message {}", message.id);
                return false;
            }
        }
        let conversation = state
            .conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| Conversation::new(conversation_id.clone()));
        conversation.last_message_id = Some(message.id.clone());
        conversation.last_activity = message.timestamp;

        let list = state.messages.entry(conversation_id).or_default();
        list.push(message);
        if list.len() > self.message_cap {
            let overflow = list.len() - self.message_cap;
            list.drain(..overflow);
        }
        true
    }

    /// Merge a partial update into the matching conversation. An unknown id
    /// creates the conversation first: entities exist from the moment they
    /// are observed, whether via fetch or live event.
    pub fn update_conversation(&self, patch: ConversationPatch) {
        if patch.id.is_empty() {
            debug!("ignoring conversation patch without an id");
            return;
        }
        let mut state = self.write();
        let conversation = state
            .conversations
            .entry(patch.id.clone())
            .or_insert_with(|| Conversation::new(patch.id.clone()));
        if let Some(participants) = patch.participants {
            conversation.participants = participants;
        }
        if let Some(status) = patch.status {
            conversation.status = status;
        }
        if let Some(unread_count) = patch.unread_count {
            conversation.unread_count = unread_count;
        }
        if let Some(last_message_id) = patch.last_message_id {
            conversation.last_message_id = Some(last_message_id);
        }
        if let Some(last_activity) = patch.last_activity {
            conversation.last_activity = last_activity;
        }
    }

    /// Full replace of the conversation list, used after an initial fetch.
    /// Message lists are left untouched.
    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        let mut state = self.write();
        state.conversations = conversations
            .into_iter()
            .map(|conversation| (conversation.id.clone(), conversation))
            .collect();
    }

    /// Full replace of one conversation's message list, used after a
    /// historical fetch or a sync replay.
    pub fn set_messages_for_conversation(&self, conversation_id: &str, messages: Vec<Message>) {
        let mut state = self.write();
        state.seen_ids.insert(
            conversation_id.to_string(),
            messages.iter().map(|message| message.id.clone()).collect(),
        );
        let conversation = state
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation::new(conversation_id.to_string()));
        if let Some(last) = messages.last() {
            conversation.last_message_id = Some(last.id.clone());
            conversation.last_activity = last.timestamp;
        }
        state
            .messages
            .insert(conversation_id.to_string(), messages);
    }

    /// Zeroes the unread counter; message-level read status is only moved
    /// by `set_message_status`.
    pub fn mark_as_read(&self, conversation_id: &str) {
        let mut state = self.write();
        if let Some(conversation) = state.conversations.get_mut(conversation_id) {
            conversation.unread_count = 0;
        }
    }

    pub fn increment_unread(&self, conversation_id: &str) {
        let mut state = self.write();
        if let Some(conversation) = state.conversations.get_mut(conversation_id) {
            conversation.unread_count += 1;
        }
    }

    /// Status transition for already-stored messages; everything else about
    /// a message is immutable once inserted.
    pub fn set_message_status(
        &self,
        conversation_id: &str,
        message_ids: &[String],
        status: DeliveryStatus,
    ) {
        let mut state = self.write();
        if let Some(messages) = state.messages.get_mut(conversation_id) {
            for message in messages
                .iter_mut()
                .filter(|message| message_ids.contains(&message.id))
            {
                message.status = status;
            }
        }
    }

    pub fn contains_message(&self, conversation_id: &str, message_id: &str) -> bool {
        self.read()
            .seen_ids
            .get(conversation_id)
            .is_some_and(|seen| seen.contains(message_id))
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.read().conversations.get(conversation_id).cloned()
    }

    /// Conversation list for the inbox view, newest activity first.
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> =
            self.read().conversations.values().cloned().collect();
        conversations.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        conversations
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.read()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationStatus, MessageDirection, MessageKind};

    fn message(id: &str, conversation_id: &str, timestamp: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            direction: MessageDirection::Inbound,
            content: "hi".to_string(),
            kind: MessageKind::Text,
            timestamp,
            status: DeliveryStatus::Delivered,
            metadata: None,
        }
    }

    #[test]
    fn duplicate_message_insert_is_a_no_op() {
        let store = ConversationStore::new();
        assert!(store.add_message(message("m1", "c1", 10)));
        assert!(!store.add_message(message("m1", "c1", 20)));
        assert_eq!(store.messages("c1").len(), 1);
        // the duplicate must not touch denormalized fields either
        assert_eq!(store.conversation("c1").expect("conversation").last_activity, 10);
    }

    #[test]
    fn add_message_creates_the_conversation_and_tracks_last_message() {
        let store = ConversationStore::new();
        store.add_message(message("m1", "c1", 10));
        store.add_message(message("m2", "c1", 20));
        let conversation = store.conversation("c1").expect("conversation");
        assert_eq!(conversation.last_message_id.as_deref(), Some("m2"));
        assert_eq!(conversation.last_activity, 20);
    }

    #[test]
    fn patch_merge_preserves_untouched_fields() {
        let store = ConversationStore::new();
        let mut seeded = Conversation::new("c1");
        seeded.participants = vec!["ana".to_string()];
        seeded.unread_count = 4;
        seeded.last_activity = 99;
        store.set_conversations(vec![seeded]);

        store.update_conversation(ConversationPatch {
            id: "c1".to_string(),
            unread_count: Some(0),
            ..ConversationPatch::default()
        });

        let conversation = store.conversation("c1").expect("conversation");
        assert_eq!(conversation.unread_count, 0);
        assert_eq!(conversation.participants, vec!["ana".to_string()]);
        assert_eq!(conversation.last_activity, 99);
    }

    #[test]
    fn patch_for_an_unknown_id_creates_the_conversation() {
        let store = ConversationStore::new();
        store.update_conversation(ConversationPatch {
            id: "fresh".to_string(),
            status: Some(ConversationStatus::Pending),
            ..ConversationPatch::default()
        });
        let conversation = store.conversation("fresh").expect("conversation");
        assert_eq!(conversation.status, ConversationStatus::Pending);
        assert_eq!(conversation.unread_count, 0);
    }

    #[test]
    fn mark_as_read_zeroes_the_counter_only() {
        let store = ConversationStore::new();
        store.add_message(message("m1", "c1", 10));
        store.increment_unread("c1");
        store.mark_as_read("c1");
        assert_eq!(store.conversation("c1").expect("conversation").unread_count, 0);
        // message-level status is untouched
        assert_eq!(store.messages("c1")[0].status, DeliveryStatus::Delivered);
    }

    #[test]
    fn message_cap_drops_the_oldest_and_still_dedups_them() {
        let store = ConversationStore::with_message_cap(3);
        for i in 0..5 {
            store.add_message(message(&format!("m{i}"), "c1", i));
        }
        let retained: Vec<String> = store
            .messages("c1")
            .into_iter()
            .map(|message| message.id)
            .collect();
        assert_eq!(retained, vec!["m2", "m3", "m4"]);
        // an evicted id must still be recognized as already seen
        assert!(!store.add_message(message("m0", "c1", 50)));
    }

    #[test]
    fn set_messages_replaces_the_list_and_reseeds_dedup() {
        let store = ConversationStore::new();
        store.add_message(message("m1", "c1", 10));
        store.set_messages_for_conversation("c1", vec![message("m7", "c1", 70)]);
        assert_eq!(store.messages("c1").len(), 1);
        assert!(store.contains_message("c1", "m7"));
        assert!(!store.contains_message("c1", "m1"));
        let conversation = store.conversation("c1").expect("conversation");
        assert_eq!(conversation.last_message_id.as_deref(), Some("m7"));
    }

    #[test]
    fn status_transitions_apply_to_listed_ids_only() {
        let store = ConversationStore::new();
        store.add_message(message("m1", "c1", 10));
        store.add_message(message("m2", "c1", 20));
        store.set_message_status("c1", &["m1".to_string()], DeliveryStatus::Read);
        let messages = store.messages("c1");
        assert_eq!(messages[0].status, DeliveryStatus::Read);
        assert_eq!(messages[1].status, DeliveryStatus::Delivered);
    }

    #[test]
    fn conversations_sort_by_most_recent_activity() {
        let store = ConversationStore::new();
        store.add_message(message("m1", "old", 10));
        store.add_message(message("m2", "new", 20));
        let ids: Vec<String> = store
            .conversations()
            .into_iter()
            .map(|conversation| conversation.id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
    }
}
