use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::messages::{ClientCommand, ServerEvent, SyncSnapshot};
use crate::model::{ConversationPatch, Message};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Connectivity signal surfaced to the handler layer; the only thing the
/// core propagates upward besides store contents.
#[derive(Debug, Clone)]
pub enum ConnectionNotice {
    Connected,
    Disconnected { reason: String },
    Error { details: String },
    ServerShutdown { notice: String },
    SyncRequired { notice: String },
}

/// Supplies the bearer credential. Read at `connect` time, never cached,
/// so a token refresh before a reconnect takes effect.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

pub struct StaticToken(pub Option<String>);

#[async_trait]
impl CredentialSource for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

type Handler<T> = Box<dyn Fn(T) + Send + Sync>;

/// One handler per logical event category. Exactly one set is active at a
/// time; registering a new set replaces the previous one.
pub struct ChatHandlers {
    pub on_new_message: Handler<Message>,
    pub on_message_ack: Handler<Message>,
    pub on_message_read: Box<dyn Fn(String, Vec<String>) + Send + Sync>,
    pub on_typing: Box<dyn Fn(String, bool) + Send + Sync>,
    pub on_conversation_event: Box<dyn Fn(String, ConversationPatch) + Send + Sync>,
    pub on_state_synced: Handler<SyncSnapshot>,
    pub on_connection: Handler<ConnectionNotice>,
}

impl Default for ChatHandlers {
    fn default() -> Self {
        ChatHandlers {
            on_new_message: Box::new(|_| {}),
            on_message_ack: Box::new(|_| {}),
            on_message_read: Box::new(|_, _| {}),
            on_typing: Box::new(|_, _| {}),
            on_conversation_event: Box::new(|_, _| {}),
            on_state_synced: Box::new(|_| {}),
            on_connection: Box::new(|_| {}),
        }
    }
}

/// Unregisters its handler set on drop.
pub struct ListenerGuard {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    pub(crate) fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        ListenerGuard {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Command/listener surface of the socket client. Commands are
/// fire-and-forget and never fail the caller; connectivity problems show
/// up on the status channel and the `on_connection` handler instead.
pub trait Transport: Send + Sync {
    /// Fire-and-forget connect trigger; a no-op while connected or
    /// connecting.
    fn request_connect(&self);
    fn is_connected(&self) -> bool;
    fn send_command(&self, command: ClientCommand);
    fn register_listeners(&self, handlers: ChatHandlers) -> ListenerGuard;
    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    fn join_conversation(&self, conversation_id: &str) {
        self.send_command(ClientCommand::JoinRoom {
            conversation_id: conversation_id.to_string(),
        });
    }

    fn leave_conversation(&self, conversation_id: &str) {
        self.send_command(ClientCommand::LeaveRoom {
            conversation_id: conversation_id.to_string(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub auto_reconnect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            url: "ws://127.0.0.1:2052/ws".to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

struct Registration {
    id: u64,
    handlers: ChatHandlers,
}

/// The one live connection to the real-time backend.
pub struct WsTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    credentials: Arc<dyn CredentialSource>,
    state: Mutex<ConnState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    listeners: RwLock<Option<Registration>>,
    listener_seq: AtomicU64,
    // bumped on every successful connect; stale reader tasks check it
    // before touching connection state
    conn_epoch: AtomicU64,
    attempts: AtomicU32,
    status_tx: watch::Sender<ConnectionStatus>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WsTransport {
    pub fn new(config: TransportConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        WsTransport {
            inner: Arc::new(Inner {
                config,
                credentials,
                state: Mutex::new(ConnState::Disconnected),
                outbound: Mutex::new(None),
                listeners: RwLock::new(None),
                listener_seq: AtomicU64::new(0),
                conn_epoch: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                status_tx,
            }),
        }
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        Inner::connect(&self.inner).await
    }
}

impl Transport for WsTransport {
    fn request_connect(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _ = Inner::connect(&inner).await;
        });
    }

    fn is_connected(&self) -> bool {
        *lock(&self.inner.state) == ConnState::Connected
    }

    fn send_command(&self, command: ClientCommand) {
        self.inner.send_command(command);
    }

    fn register_listeners(&self, handlers: ChatHandlers) -> ListenerGuard {
        let id = self.inner.listener_seq.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Registration { id, handlers });
        let inner = Arc::clone(&self.inner);
        ListenerGuard::new(move || {
            let mut listeners = inner.listeners.write().unwrap_or_else(PoisonError::into_inner);
            // only clear if this guard's registration is still the active one
            if listeners.as_ref().is_some_and(|reg| reg.id == id) {
                *listeners = None;
            }
        })
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }
}

impl Inner {
    async fn connect(inner: &Arc<Inner>) -> Result<(), TransportError> {
        {
            let mut state = lock(&inner.state);
            if *state != ConnState::Disconnected {
                debug!("connect ignored, transport already {state:?}");
                return Ok(());
            }
            *state = ConnState::Connecting;
        }
        inner.status_tx.send_replace(ConnectionStatus::Connecting);

        let token = inner.credentials.bearer_token().await;
        if token.is_none() {
            // proceed anyway and let the server reject via the error event
            debug!("connecting without a bearer token");
        }
        let url = build_ws_url(&inner.config.url, token.as_deref());

        let (stream, _response) = match connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(err) => {
                *lock(&inner.state) = ConnState::Disconnected;
                inner.status_tx.send_replace(ConnectionStatus::Disconnected);
                warn!("websocket connect failed: {err}");
                inner.notify(ConnectionNotice::Error {
                    details: err.to_string(),
                });
                Inner::schedule_reconnect(inner);
                return Err(TransportError::Connect(err));
            }
        };

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let epoch = inner.conn_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&inner.outbound) = Some(tx);
        *lock(&inner.state) = ConnState::Connected;
        inner.attempts.store(0, Ordering::SeqCst);
        inner.status_tx.send_replace(ConnectionStatus::Connected);
        info!("websocket connected to {}", inner.config.url);
        inner.notify(ConnectionNotice::Connected);

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = ws_tx.send(frame).await {
                    error!("failed to send websocket frame: {err}");
                    break;
                }
            }
        });

        let reader = Arc::clone(inner);
        tokio::spawn(async move {
            let mut reason = "stream closed".to_string();
            while let Some(result) = ws_rx.next().await {
                match result {
                    Ok(WsMessage::Close(_)) => {
                        reason = "closed by server".to_string();
                        break;
                    }
                    Ok(frame) => reader.handle_frame(&frame),
                    Err(err) => {
                        error!("websocket error: {err}");
                        reason = err.to_string();
                        break;
                    }
                }
            }
            Inner::on_disconnected(&reader, epoch, &reason);
        });

        // fresh correlation id on every (re)connect so the backend can
        // decide whether to replay missed events
        inner.send_command(ClientCommand::SyncRequest {
            correlation_id: Uuid::new_v4().to_string(),
            requested_at: Utc::now().timestamp_millis(),
        });

        Ok(())
    }

    fn handle_frame(&self, frame: &WsMessage) {
        let WsMessage::Text(text) = frame else {
            return;
        };
        match serde_json::from_str::<ServerEvent>(text.as_str()) {
            Ok(event) => self.dispatch(event),
            Err(err) => warn!("discarding malformed event: {err}"),
        }
    }

    fn dispatch(&self, event: ServerEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        let Some(registration) = listeners.as_ref() else {
            debug!("no listeners registered, dropping event");
            return;
        };
        dispatch_event(&registration.handlers, event);
    }

    fn notify(&self, notice: ConnectionNotice) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(registration) = listeners.as_ref() {
            (registration.handlers.on_connection)(notice);
        }
    }

    fn send_command(&self, command: ClientCommand) {
        let outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            // dropped, not queued: the sync request after reconnect
            // recovers whatever this would have told the server
            debug!("dropping command while disconnected: {command:?}");
            return;
        };
        match serde_json::to_string(&command) {
            Ok(json) => {
                let _ = tx.send(WsMessage::text(json));
            }
            Err(err) => error!("failed to encode command: {err}"),
        }
    }

    fn on_disconnected(inner: &Arc<Inner>, epoch: u64, reason: &str) {
        if inner.conn_epoch.load(Ordering::SeqCst) != epoch {
            // a newer connection owns the state now
            return;
        }
        {
            let mut state = lock(&inner.state);
            if *state == ConnState::Disconnected {
                return;
            }
            *state = ConnState::Disconnected;
        }
        *lock(&inner.outbound) = None;
        inner.status_tx.send_replace(ConnectionStatus::Disconnected);
        warn!("websocket disconnected: {reason}");
        inner.notify(ConnectionNotice::Disconnected {
            reason: reason.to_string(),
        });
        Inner::schedule_reconnect(inner);
    }

    fn schedule_reconnect(inner: &Arc<Inner>) {
        if !inner.config.auto_reconnect {
            return;
        }
        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= inner.config.max_reconnect_attempts {
            warn!("reconnect attempts exhausted, waiting for an external trigger");
            return;
        }
        let delay = reconnect_delay(&inner.config, attempt);
        info!("reconnecting in {delay:?} (attempt {})", attempt + 1);
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = Inner::connect(&inner).await;
        });
    }
}

pub(crate) fn dispatch_event(handlers: &ChatHandlers, event: ServerEvent) {
    match event {
        ServerEvent::Connected { session_id } => {
            debug!("server acknowledged connection (session {session_id:?})");
        }
        ServerEvent::Disconnected { reason } => {
            (handlers.on_connection)(ConnectionNotice::Disconnected { reason });
        }
        ServerEvent::Error { details } => {
            (handlers.on_connection)(ConnectionNotice::Error { details });
        }
        ServerEvent::StateSynced { snapshot } => (handlers.on_state_synced)(snapshot),
        ServerEvent::NewMessage { message } => (handlers.on_new_message)(message),
        ServerEvent::MessageSentAck { message } => (handlers.on_message_ack)(message),
        ServerEvent::MessageRead {
            conversation_id,
            message_ids,
        } => (handlers.on_message_read)(conversation_id, message_ids),
        ServerEvent::Typing {
            conversation_id,
            is_typing,
        } => (handlers.on_typing)(conversation_id, is_typing),
        ServerEvent::ConversationEvent {
            conversation_id,
            patch,
        } => (handlers.on_conversation_event)(conversation_id, patch),
        ServerEvent::ServerShutdown { notice } => {
            (handlers.on_connection)(ConnectionNotice::ServerShutdown { notice });
        }
        ServerEvent::SyncRequired { notice } => {
            (handlers.on_connection)(ConnectionNotice::SyncRequired { notice });
        }
    }
}

fn build_ws_url(base: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => {
            let separator = if base.contains('?') { '&' } else { '?' };
            format!("{base}{separator}token={}", urlencoding::encode(token))
        }
        None => base.to_string(),
    }
}

fn reconnect_delay(config: &TransportConfig, attempt: u32) -> Duration {
    let exponential = config.reconnect_base_delay * 2u32.saturating_pow(attempt);
    std::cmp::min(exponential, config.reconnect_max_delay)
}
