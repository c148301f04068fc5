use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ChatSession, ConnectionState, DeliveryState, ReconcilerUpdate, TimelineEntry,
    WebSocketConnector,
};
use shared::domain::{MessageId, RoomId, UserId};
use storage::Storage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from client.toml / the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long, default_value = "general")]
    room: String,
}

const HELP: &str = "commands: /edit <id> <text>, /delete <id>, /retry <id>, /join <room>, \
/leave, /history, /status, /logout, /quit; anything else is sent to the current room";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(user) = args.user {
        settings.user_id = UserId::new(user);
    }
    if let Some(database_url) = args.database_url {
        settings.database_url = client_core::config::normalize_database_url(&database_url);
    }

    let storage = Storage::new(&settings.database_url)
        .await
        .with_context(|| format!("failed to open local history at {}", settings.database_url))?;
    let connector = WebSocketConnector::new(&settings.server_url, settings.auth_token.clone())?;
    let session = ChatSession::new(settings, Arc::new(connector), Arc::new(storage));

    spawn_status_printer(&session);
    session.start().await;

    let mut room = RoomId::new(args.room);
    if let Err(err) = session.join_room(&room).await {
        warn!(room_id = %room, error = %err, "history unavailable");
    }
    print_timeline(&session.timeline(&room).await);
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "/quit" => break,
            "/logout" => {
                session.logout().await;
                break;
            }
            "/status" => println!(
                "connection: {}, queued: {}",
                session.connection_state(),
                session.queued_messages_count()
            ),
            "/history" => print_timeline(&session.timeline(&room).await),
            "/edit" => match rest.split_once(' ') {
                Some((id, text)) => session.edit_message(&room, &MessageId::new(id), text).await,
                None => println!("usage: /edit <id> <text>"),
            },
            "/delete" if !rest.is_empty() => {
                session.delete_message(&room, &MessageId::new(rest)).await;
            }
            "/retry" if !rest.is_empty() => {
                if let Err(err) = session.retry_message(&MessageId::new(rest)).await {
                    println!("{err}");
                }
            }
            "/join" if !rest.is_empty() => {
                session.leave_room(&room).await;
                room = RoomId::new(rest);
                if let Err(err) = session.join_room(&room).await {
                    warn!(room_id = %room, error = %err, "history unavailable");
                }
                print_timeline(&session.timeline(&room).await);
            }
            "/leave" => session.leave_room(&room).await,
            _ if command.starts_with('/') => println!("{HELP}"),
            _ => {
                let message_id = session.send_message(&room, line, None).await;
                info!(%message_id, "message submitted");
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn spawn_status_printer(session: &Arc<ChatSession>) {
    let mut state = session.watch_connection_state();
    let mut queued = session.watch_queued_messages_count();
    let mut updates = session.subscribe_updates();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = state.borrow_and_update().clone();
                    match current {
                        ConnectionState::Error(reason) => println!("! connection problem: {reason}"),
                        other => println!("* {other}"),
                    }
                }
                changed = queued.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let pending = *queued.borrow_and_update();
                    if pending > 0 {
                        println!("* {pending} message(s) waiting to sync");
                    }
                }
                update = updates.recv() => match update {
                    Ok(update) => print_update(update),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

fn print_update(update: ReconcilerUpdate) {
    match update {
        ReconcilerUpdate::ConfirmedAdded(message) => {
            println!("[{}] {}: {}", message.message_id, message.sender_id, message.content);
        }
        ReconcilerUpdate::ConfirmedChanged(message) if message.deleted => {
            println!("[{}] (deleted)", message.message_id);
        }
        ReconcilerUpdate::ConfirmedChanged(message) => {
            println!("[{}] {}: {} (edited)", message.message_id, message.sender_id, message.content);
        }
        ReconcilerUpdate::RecordChanged(record) => {
            if let DeliveryState::Failed(reason) = &record.delivery_state {
                println!("[{}] not delivered: {reason}; /retry {}", record.message_id, record.message_id);
            }
        }
        ReconcilerUpdate::System { content, .. } => println!("-- {content}"),
        ReconcilerUpdate::ServerError { message, .. } => println!("! server: {message}"),
        ReconcilerUpdate::RecordRetired { .. } => {}
    }
}

fn print_timeline(entries: &[TimelineEntry]) {
    for entry in entries {
        let marker = match &entry.delivery_state {
            DeliveryState::Sending => " (sending)",
            DeliveryState::Sent => " (sent)",
            DeliveryState::Delivered => "",
            DeliveryState::Failed(_) => " (failed)",
        };
        let content = if entry.deleted { "(deleted)" } else { entry.content.as_str() };
        let edited = if entry.edited && !entry.deleted { " (edited)" } else { "" };
        println!(
            "[{}] {}: {}{}{}",
            entry.message_id, entry.sender_id, content, edited, marker
        );
    }
}
