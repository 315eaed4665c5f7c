use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::model::normalize_conv_id;
use crate::store::ConversationStore;
use crate::transport::Transport;

/// Tracks which conversation room the viewer is in — zero or one at a
/// time — and drives join/leave transitions. Issues commands only; it
/// never registers listeners on the shared connection.
pub struct RoomManager {
    transport: Arc<dyn Transport>,
    store: Arc<ConversationStore>,
    current: Mutex<Option<String>>,
}

impl RoomManager {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<ConversationStore>) -> Self {
        RoomManager {
            transport,
            store,
            current: Mutex::new(None),
        }
    }

    fn current_lock(&self) -> MutexGuard<'_, Option<String>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route ids may arrive percent-encoded; they are normalized before
    /// comparison so an encoding difference never produces a spurious
    /// leave/join pair for the same conversation.
    pub fn set_active_conversation(&self, conversation_id: Option<&str>) {
        let next = conversation_id.map(normalize_conv_id);
        let mut current = self.current_lock();
        if *current == next {
            debug!("room unchanged ({next:?})");
            return;
        }
        // leave the previous room before joining the next one
        if let Some(previous) = current.take() {
            self.transport.leave_conversation(&previous);
        }
        if let Some(id) = &next {
            self.transport.join_conversation(id);
            self.store.mark_as_read(id);
        }
        *current = next;
    }

    pub fn current(&self) -> Option<String> {
        self.current_lock().clone()
    }

    /// Re-issues the join for the active room, used after a reconnect.
    pub fn rejoin_current(&self) {
        if let Some(id) = self.current_lock().as_deref() {
            self.transport.join_conversation(id);
        }
    }

    pub fn leave_current(&self) {
        let mut current = self.current_lock();
        if let Some(previous) = current.take() {
            self.transport.leave_conversation(&previous);
        }
    }
}
