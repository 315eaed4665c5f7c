use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

use crate::messages::{ClientCommand, ServerEvent};
use crate::transport::{
    dispatch_event, ChatHandlers, ConnectionNotice, ConnectionStatus, ListenerGuard, Transport,
};

/// Transport double that records commands and lets tests feed events
/// through the registered handler set.
pub(crate) struct RecordingTransport {
    commands: Mutex<Vec<ClientCommand>>,
    handlers: Mutex<Option<ChatHandlers>>,
    connected: AtomicBool,
    connect_requests: AtomicU32,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Connected);
        RecordingTransport {
            commands: Mutex::new(Vec::new()),
            handlers: Mutex::new(None),
            connected: AtomicBool::new(true),
            connect_requests: AtomicU32::new(0),
            status_tx,
        }
    }

    pub fn commands(&self) -> Vec<ClientCommand> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn connect_requests(&self) -> u32 {
        self.connect_requests.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: ServerEvent) {
        let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handlers) = handlers.as_ref() {
            dispatch_event(handlers, event);
        }
    }

    pub fn notify(&self, notice: ConnectionNotice) {
        let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handlers) = handlers.as_ref() {
            (handlers.on_connection)(notice);
        }
    }
}

impl Transport for RecordingTransport {
    fn request_connect(&self) {
        self.connect_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_command(&self, command: ClientCommand) {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
    }

    fn register_listeners(&self, handlers: ChatHandlers) -> ListenerGuard {
        *self.handlers.lock().unwrap_or_else(PoisonError::into_inner) = Some(handlers);
        ListenerGuard::new(|| {})
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }
}
