use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::watch;
use uuid::Uuid;

use crate::messages::ClientCommand;
use crate::model::{
    normalize_conv_id, DeliveryStatus, Message, MessageDirection, MessageKind,
};
use crate::room::RoomManager;
use crate::store::ConversationStore;
use crate::throttle::{EventThrottler, ThrottleConfig};
use crate::transport::{
    ChatHandlers, ConnectionNotice, ConnectionStatus, ListenerGuard, Transport,
};

pub type TypingObserver = Box<dyn Fn(String, bool) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wires the transport, throttler, store and room manager together and
/// owns the cross-cutting policies: dedup before throttling, unread
/// bookkeeping for the active room, rejoin/resync after reconnect, and
/// visibility-driven reconnects.
pub struct ChatSync {
    transport: Arc<dyn Transport>,
    store: Arc<ConversationStore>,
    rooms: Arc<RoomManager>,
    throttler: Arc<Mutex<EventThrottler>>,
    typing_observer: Arc<RwLock<Option<TypingObserver>>>,
    listener_guard: Mutex<Option<ListenerGuard>>,
}

impl ChatSync {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<ConversationStore>,
        throttle: ThrottleConfig,
    ) -> Self {
        let rooms = Arc::new(RoomManager::new(
            Arc::clone(&transport),
            Arc::clone(&store),
        ));
        ChatSync {
            transport,
            store,
            rooms,
            throttler: Arc::new(Mutex::new(EventThrottler::new(throttle))),
            typing_observer: Arc::new(RwLock::new(None)),
            listener_guard: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.status()
    }

    /// Typing indicators are an ephemeral UI signal; they are throttled
    /// and forwarded here, never persisted.
    pub fn set_typing_observer(&self, observer: TypingObserver) {
        *self
            .typing_observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    /// Registers the handler set (replacing any previous one) and kicks
    /// off the connection. Listeners go first so the connected notice is
    /// not missed.
    pub fn start(&self) {
        let guard = self.transport.register_listeners(self.build_handlers());
        *lock(&self.listener_guard) = Some(guard);
        self.transport.request_connect();
    }

    fn build_handlers(&self) -> ChatHandlers {
        let mut handlers = ChatHandlers::default();

        {
            let store = Arc::clone(&self.store);
            let rooms = Arc::clone(&self.rooms);
            let transport = Arc::clone(&self.transport);
            let throttler = Arc::clone(&self.throttler);
            handlers.on_new_message = Box::new(move |mut message| {
                message.conversation_id = normalize_conv_id(&message.conversation_id);
                // dedup against the store before spending throttle budget
                if store.contains_message(&message.conversation_id, &message.id) {
                    debug!("duplicate message {} dropped", message.id);
                    return;
                }
                let _ = lock(&throttler).process_event("new-message", message, |message| {
                    let conversation_id = message.conversation_id.clone();
                    let message_id = message.id.clone();
                    let inbound = message.direction == MessageDirection::Inbound;
                    if !store.add_message(message) {
                        return;
                    }
                    if inbound {
                        if rooms.current().as_deref() == Some(conversation_id.as_str()) {
                            // the viewer is looking at this conversation
                            store.mark_as_read(&conversation_id);
                            transport.send_command(ClientCommand::MarkRead {
                                conversation_id,
                                message_ids: vec![message_id],
                            });
                        } else {
                            store.increment_unread(&conversation_id);
                        }
                    }
                });
            });
        }

        {
            let store = Arc::clone(&self.store);
            handlers.on_message_ack = Box::new(move |mut message| {
                message.conversation_id = normalize_conv_id(&message.conversation_id);
                if store.contains_message(&message.conversation_id, &message.id) {
                    store.set_message_status(
                        &message.conversation_id,
                        std::slice::from_ref(&message.id),
                        message.status,
                    );
                } else {
                    let _ = store.add_message(message);
                }
            });
        }

        {
            let store = Arc::clone(&self.store);
            handlers.on_message_read = Box::new(move |conversation_id, message_ids| {
                let conversation_id = normalize_conv_id(&conversation_id);
                store.set_message_status(&conversation_id, &message_ids, DeliveryStatus::Read);
            });
        }

        {
            let store = Arc::clone(&self.store);
            let throttler = Arc::clone(&self.throttler);
            handlers.on_conversation_event = Box::new(move |conversation_id, mut patch| {
                patch.id = normalize_conv_id(&conversation_id);
                let _ = lock(&throttler)
                    .process_event("conversation-event", patch, |patch| {
                        store.update_conversation(patch);
                    });
            });
        }

        {
            let observer = Arc::clone(&self.typing_observer);
            let throttler = Arc::clone(&self.throttler);
            handlers.on_typing = Box::new(move |conversation_id, is_typing| {
                let _ = lock(&throttler).process_event(
                    "typing",
                    (conversation_id, is_typing),
                    |(conversation_id, is_typing)| {
                        let observer = observer.read().unwrap_or_else(PoisonError::into_inner);
                        if let Some(observer) = observer.as_ref() {
                            observer(normalize_conv_id(&conversation_id), is_typing);
                        }
                    },
                );
            });
        }

        {
            let store = Arc::clone(&self.store);
            handlers.on_state_synced = Box::new(move |snapshot| {
                info!(
                    "applying synced state: {} conversations",
                    snapshot.conversations.len()
                );
                let conversations = snapshot
                    .conversations
                    .into_iter()
                    .map(|mut conversation| {
                        conversation.id = normalize_conv_id(&conversation.id);
                        conversation
                    })
                    .collect();
                store.set_conversations(conversations);
                for (conversation_id, messages) in snapshot.messages {
                    store.set_messages_for_conversation(
                        &normalize_conv_id(&conversation_id),
                        messages,
                    );
                }
            });
        }

        {
            let rooms = Arc::clone(&self.rooms);
            let transport = Arc::clone(&self.transport);
            let throttler = Arc::clone(&self.throttler);
            handlers.on_connection = Box::new(move |notice| match notice {
                ConnectionNotice::Connected => {
                    // stale counters from the previous connection
                    lock(&throttler).reset();
                    rooms.rejoin_current();
                }
                ConnectionNotice::Disconnected { reason } => {
                    warn!("transport disconnected: {reason}");
                }
                ConnectionNotice::Error { details } => warn!("transport error: {details}"),
                ConnectionNotice::ServerShutdown { notice } => {
                    info!("server shutting down: {notice}");
                }
                ConnectionNotice::SyncRequired { notice } => {
                    debug!("server requested resync: {notice}");
                    transport.send_command(ClientCommand::SyncRequest {
                        correlation_id: Uuid::new_v4().to_string(),
                        requested_at: Utc::now().timestamp_millis(),
                    });
                }
            });
        }

        handlers
    }

    /// Forwarded from the routing layer on page changes.
    pub fn set_active_conversation(&self, conversation_id: Option<&str>) {
        self.rooms.set_active_conversation(conversation_id);
    }

    /// Forwarded from the host's visibility signal. Becoming visible while
    /// disconnected forces an immediate reconnect attempt instead of
    /// waiting for the next scheduled retry.
    pub fn handle_visibility_change(&self, visible: bool) {
        if visible && !self.transport.is_connected() {
            info!("became visible while disconnected, reconnecting");
            self.transport.request_connect();
        }
    }

    /// Optimistic send: the message lands in the store as `pending` and
    /// is confirmed (or failed) by the ack event.
    pub fn send_message(
        &self,
        conversation_id: &str,
        content: impl Into<String>,
        kind: MessageKind,
        metadata: Option<serde_json::Value>,
    ) -> Message {
        let conversation_id = normalize_conv_id(conversation_id);
        let content = content.into();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            direction: MessageDirection::Outbound,
            content: content.clone(),
            kind,
            timestamp: Utc::now().timestamp_millis(),
            status: DeliveryStatus::Pending,
            metadata: metadata.clone(),
        };
        let _ = self.store.add_message(message.clone());
        self.transport.send_command(ClientCommand::SendMessage {
            conversation_id,
            message_id: message.id.clone(),
            content,
            kind,
            metadata,
        });
        message
    }

    pub fn typing_start(&self, conversation_id: &str) {
        self.transport.send_command(ClientCommand::TypingStart {
            conversation_id: normalize_conv_id(conversation_id),
        });
    }

    pub fn typing_stop(&self, conversation_id: &str) {
        self.transport.send_command(ClientCommand::TypingStop {
            conversation_id: normalize_conv_id(conversation_id),
        });
    }

    /// Clears the local unread counter and reports the still-unread
    /// inbound messages upstream. Message-level read status moves when
    /// the server echoes a `message-read` event back.
    pub fn mark_read(&self, conversation_id: &str) {
        let conversation_id = normalize_conv_id(conversation_id);
        let pending: Vec<String> = self
            .store
            .messages(&conversation_id)
            .iter()
            .filter(|message| {
                message.direction == MessageDirection::Inbound
                    && message.status != DeliveryStatus::Read
            })
            .map(|message| message.id.clone())
            .collect();
        self.store.mark_as_read(&conversation_id);
        self.transport.send_command(ClientCommand::MarkRead {
            conversation_id,
            message_ids: pending,
        });
    }

    /// Unsubscribes the listeners, leaves the active room and leaves the
    /// transport free to be reused.
    pub fn shutdown(&self) {
        lock(&self.listener_guard).take();
        self.rooms.leave_current();
        info!("chat sync torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ServerEvent, SyncSnapshot};
    use crate::model::{Conversation, ConversationPatch};
    use crate::test_support::RecordingTransport;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn inbound(id: &str, conversation_id: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            direction: MessageDirection::Inbound,
            content: "hola".to_string(),
            kind: MessageKind::Text,
            timestamp: 1_700_000_000_000,
            status: DeliveryStatus::Delivered,
            metadata: None,
        }
    }

    fn setup() -> (Arc<RecordingTransport>, Arc<ConversationStore>, ChatSync) {
        let transport = Arc::new(RecordingTransport::new());
        let store = Arc::new(ConversationStore::new());
        let sync = ChatSync::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&store),
            ThrottleConfig::default(),
        );
        sync.start();
        (transport, store, sync)
    }

    #[tokio::test]
    async fn duplicate_new_message_events_insert_once() {
        let (transport, store, _sync) = setup();
        transport.emit(ServerEvent::NewMessage {
            message: inbound("m1", "c1"),
        });
        transport.emit(ServerEvent::NewMessage {
            message: inbound("m1", "c1"),
        });
        assert_eq!(store.messages("c1").len(), 1);
    }

    #[tokio::test]
    async fn inbound_messages_for_background_conversations_bump_unread() {
        let (transport, store, sync) = setup();
        sync.set_active_conversation(Some("other"));
        transport.emit(ServerEvent::NewMessage {
            message: inbound("m1", "c1"),
        });
        assert_eq!(store.conversation("c1").expect("conversation").unread_count, 1);
    }

    #[tokio::test]
    async fn inbound_messages_for_the_active_room_are_read_and_acked() {
        let (transport, store, sync) = setup();
        // the id arrives percent-encoded from the route
        sync.set_active_conversation(Some("c%40example.com"));
        transport.emit(ServerEvent::NewMessage {
            message: inbound("m1", "c@example.com"),
        });
        let conversation = store.conversation("c@example.com").expect("conversation");
        assert_eq!(conversation.unread_count, 0);
        assert!(transport.commands().iter().any(|command| matches!(
            command,
            ClientCommand::MarkRead { conversation_id, message_ids }
                if conversation_id == "c@example.com" && message_ids == &["m1".to_string()]
        )));
    }

    #[tokio::test]
    async fn events_for_a_left_room_still_land_in_the_store() {
        let (transport, store, sync) = setup();
        sync.set_active_conversation(Some("a"));
        sync.set_active_conversation(Some("b"));
        transport.emit(ServerEvent::NewMessage {
            message: inbound("m1", "a"),
        });
        assert_eq!(store.messages("a").len(), 1);
        // but it is background traffic now, so unread goes up
        assert_eq!(store.conversation("a").expect("conversation").unread_count, 1);
    }

    #[tokio::test]
    async fn conversation_events_merge_into_the_store() {
        let (transport, store, _sync) = setup();
        transport.emit(ServerEvent::ConversationEvent {
            conversation_id: "c1".to_string(),
            patch: ConversationPatch {
                unread_count: Some(7),
                ..ConversationPatch::default()
            },
        });
        assert_eq!(store.conversation("c1").expect("conversation").unread_count, 7);
    }

    #[tokio::test]
    async fn state_sync_seeds_conversations_and_messages() {
        let (transport, store, _sync) = setup();
        let snapshot = SyncSnapshot {
            conversations: vec![Conversation::new("c1")],
            messages: [("c1".to_string(), vec![inbound("m1", "c1")])]
                .into_iter()
                .collect(),
        };
        transport.emit(ServerEvent::StateSynced { snapshot });
        assert!(store.contains_message("c1", "m1"));
        assert!(store.conversation("c1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_events_reach_the_observer_until_the_burst_ceiling() {
        let (transport, _store, sync) = setup();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        sync.set_typing_observer(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        for _ in 0..10 {
            transport.emit(ServerEvent::Typing {
                conversation_id: "c1".to_string(),
                is_typing: true,
            });
        }
        // default typing burst ceiling is three per 100ms
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn becoming_visible_while_disconnected_reconnects_once() {
        let (transport, _store, sync) = setup();
        let initial = transport.connect_requests();
        transport.set_connected(false);
        sync.handle_visibility_change(true);
        assert_eq!(transport.connect_requests(), initial + 1);
    }

    #[tokio::test]
    async fn becoming_visible_while_connected_does_nothing() {
        let (transport, _store, sync) = setup();
        let initial = transport.connect_requests();
        sync.handle_visibility_change(true);
        assert_eq!(transport.connect_requests(), initial);
    }

    #[tokio::test]
    async fn reconnect_rejoins_the_active_room() {
        let (transport, _store, sync) = setup();
        sync.set_active_conversation(Some("c1"));
        transport.notify(ConnectionNotice::Connected);
        let joins = transport
            .commands()
            .iter()
            .filter(|command| matches!(
                command,
                ClientCommand::JoinRoom { conversation_id } if conversation_id == "c1"
            ))
            .count();
        assert_eq!(joins, 2);
    }

    #[tokio::test]
    async fn sync_required_notice_triggers_a_fresh_sync_request() {
        let (transport, _store, _sync) = setup();
        transport.notify(ConnectionNotice::SyncRequired {
            notice: "epoch rolled".to_string(),
        });
        assert!(transport.commands().iter().any(|command| matches!(
            command,
            ClientCommand::SyncRequest { .. }
        )));
    }

    #[tokio::test]
    async fn acks_move_pending_messages_to_their_final_status() {
        let (transport, store, sync) = setup();
        let sent = sync.send_message("c1", "hey", MessageKind::Text, None);
        assert_eq!(store.messages("c1")[0].status, DeliveryStatus::Pending);
        let mut acked = store.messages("c1")[0].clone();
        acked.status = DeliveryStatus::Sent;
        transport.emit(ServerEvent::MessageSentAck { message: acked });
        assert_eq!(store.messages("c1")[0].status, DeliveryStatus::Sent);
        assert_eq!(store.messages("c1")[0].id, sent.id);
    }

    #[tokio::test]
    async fn read_receipts_update_message_status() {
        let (transport, store, _sync) = setup();
        transport.emit(ServerEvent::NewMessage {
            message: inbound("m1", "c1"),
        });
        transport.emit(ServerEvent::MessageRead {
            conversation_id: "c1".to_string(),
            message_ids: vec!["m1".to_string()],
        });
        assert_eq!(store.messages("c1")[0].status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn shutdown_leaves_the_active_room() {
        let (transport, _store, sync) = setup();
        sync.set_active_conversation(Some("c1"));
        sync.shutdown();
        assert!(transport.commands().iter().any(|command| matches!(
            command,
            ClientCommand::LeaveRoom { conversation_id } if conversation_id == "c1"
        )));
    }

    #[tokio::test]
    async fn mark_read_reports_unread_inbound_ids() {
        let (transport, store, sync) = setup();
        transport.emit(ServerEvent::NewMessage {
            message: inbound("m1", "c1"),
        });
        sync.mark_read("c1");
        assert_eq!(store.conversation("c1").expect("conversation").unread_count, 0);
        assert!(transport.commands().iter().any(|command| matches!(
            command,
            ClientCommand::MarkRead { message_ids, .. } if message_ids == &["m1".to_string()]
        )));
    }
}
