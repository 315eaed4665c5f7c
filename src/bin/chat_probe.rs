use std::env;
use std::sync::Arc;
use std::time::Duration;

use inbox_sync::transport::StaticToken;
use inbox_sync::{ChatSync, ConversationStore, ThrottleConfig, TransportConfig, WsTransport};
use log::info;

// Smoke tool: connects to a live backend, optionally focuses one
// conversation, and logs what lands in the store.
#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .init();

    let url = env::var("INBOX_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:2052/ws".to_string());
    let token = env::var("INBOX_TOKEN").ok();
    let conversation = env::args().nth(1);

    let transport = Arc::new(WsTransport::new(
        TransportConfig {
            url: url.clone(),
            ..TransportConfig::default()
        },
        Arc::new(StaticToken(token)),
    ));
    let store = Arc::new(ConversationStore::new());
    let sync = ChatSync::new(transport, Arc::clone(&store), ThrottleConfig::default());

    info!("probing {url}");
    sync.start();
    if let Some(id) = conversation.as_deref() {
        info!("focusing conversation {id}");
        sync.set_active_conversation(Some(id));
    }

    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        for conversation in store.conversations() {
            info!(
                "{}: {} messages, {} unread, last activity {}",
                conversation.id,
                store.messages(&conversation.id).len(),
                conversation.unread_count,
                conversation.last_activity
            );
        }
    }
}
