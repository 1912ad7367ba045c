//! platforma-chat - follow conversations live from the terminal.
//!
//! Usage: `PLATFORMA_TOKEN=... platforma-chat <conversation-id>...`

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use platforma_client::{
    attach_to, ApiConfig, ConnectionRegistry, ConversationFeed, Credential, InboundFrame,
    MessagesApi, RealtimeConfig, Topic,
};
use platforma_shared::{ConnectionNotification, WsEvent};

const HISTORY_LIMIT: u32 = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "platforma_client=debug,platforma_chat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let token = std::env::var("PLATFORMA_TOKEN").context("PLATFORMA_TOKEN is not set")?;
    let credential = Credential::new(token);

    let conversation_ids = std::env::args()
        .skip(1)
        .map(|arg| {
            arg.parse::<i64>()
                .with_context(|| format!("invalid conversation id: {arg}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    if conversation_ids.is_empty() {
        bail!("usage: platforma-chat <conversation-id>...");
    }

    let config = RealtimeConfig::from_env();
    tracing::info!(endpoint = %config.endpoint, conversations = ?conversation_ids, "Starting platforma-chat");

    let registry = Arc::new(ConnectionRegistry::from_config(config));
    let api = MessagesApi::new(&ApiConfig::from_env(), credential.clone());

    let mut feeds = Vec::with_capacity(conversation_ids.len());
    for id in conversation_ids {
        let feed = ConversationFeed::open(&registry, id, move |message| {
            tracing::info!(
                conversation = id,
                message_id = message.id,
                sender = message.sender_id,
                attachments = message.has_attachments(),
                "{}",
                message.text()
            );
        });

        match api.latest_messages(id, HISTORY_LIMIT).await {
            Ok(history) => {
                let loaded = feed.seed(history);
                tracing::info!(conversation = id, loaded, "History loaded");
                for message in feed.messages() {
                    tracing::info!(
                        conversation = id,
                        message_id = message.id,
                        sender = message.sender_id,
                        at = %message.created_at,
                        "{}",
                        message.text()
                    );
                }
            }
            Err(e) => tracing::warn!(conversation = id, error = %e, "Could not load history"),
        }

        feeds.push(feed);
    }

    let notifications = attach_to(&registry, Topic::notifications(), log_notification);
    let announcements = attach_to(&registry, Topic::announcements(), log_announcement);

    registry.connect(credential);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    for feed in feeds {
        feed.close();
    }
    drop(notifications);
    drop(announcements);
    registry.disconnect();

    Ok(())
}

fn log_notification(frame: InboundFrame) {
    match frame.json::<WsEvent<ConnectionNotification>>() {
        Ok(event) => tracing::info!(
            kind = %event.payload.kind,
            request_id = event.payload.request_id,
            from_user = event.payload.from_user_id,
            "Notification"
        ),
        Err(e) => tracing::warn!(error = %e, body = %frame.body(), "Unrecognized notification"),
    }
}

fn log_announcement(frame: InboundFrame) {
    match frame.json::<WsEvent>() {
        Ok(event) => tracing::info!(kind = %event.kind, payload = %event.payload, "Announcement"),
        Err(e) => tracing::warn!(error = %e, body = %frame.body(), "Unrecognized announcement"),
    }
}
