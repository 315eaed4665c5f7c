use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{Conversation, ConversationPatch, Message, MessageKind};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "join-room")]
    JoinRoom { conversation_id: String },
    #[serde(rename = "leave-room")]
    LeaveRoom { conversation_id: String },
    #[serde(rename = "sync-request")]
    SyncRequest {
        correlation_id: String,
        requested_at: i64,
    },
    #[serde(rename = "send-message")]
    SendMessage {
        conversation_id: String,
        message_id: String,
        content: String,
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    #[serde(rename = "typing-start")]
    TypingStart { conversation_id: String },
    #[serde(rename = "typing-stop")]
    TypingStop { conversation_id: String },
    #[serde(rename = "mark-read")]
    MarkRead {
        conversation_id: String,
        message_ids: Vec<String>,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename = "disconnected")]
    Disconnected { reason: String },
    #[serde(rename = "error")]
    Error { details: String },
    #[serde(rename = "state-synced")]
    StateSynced { snapshot: SyncSnapshot },
    #[serde(rename = "new-message")]
    NewMessage { message: Message },
    #[serde(rename = "message-sent-ack")]
    MessageSentAck { message: Message },
    #[serde(rename = "message-read")]
    MessageRead {
        conversation_id: String,
        message_ids: Vec<String>,
    },
    #[serde(rename = "typing")]
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
    #[serde(rename = "conversation-event")]
    ConversationEvent {
        conversation_id: String,
        patch: ConversationPatch,
    },
    #[serde(rename = "server-shutdown")]
    ServerShutdown { notice: String },
    #[serde(rename = "sync-required")]
    SyncRequired { notice: String },
}

/// Reconciled state the server replays after a `sync-request`, keyed by
/// conversation id.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SyncSnapshot {
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub messages: HashMap<String, Vec<Message>>,
}
