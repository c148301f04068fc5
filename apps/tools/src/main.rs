use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use shared::domain::RoomId;
use storage::{MessageRepository, Storage};

/// Maintenance commands for the client's local message history.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/client.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Checks that the store opens and answers queries.
    Health,
    /// Lists rooms with their stored message counts.
    Rooms,
    ListMessages {
        #[arg(long)]
        room: String,
    },
    /// Deletes every stored message of a room.
    Purge {
        #[arg(long)]
        room: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Health => {
            storage.health_check().await?;
            println!("ok {}", cli.database_url);
        }
        Command::Rooms => {
            for (room_id, count) in storage.list_rooms().await? {
                println!("{room_id}\t{count}");
            }
        }
        Command::ListMessages { room } => {
            let room_id = RoomId::new(room);
            let mut messages = storage.stream_messages(&room_id);
            while let Some(message) = messages.try_next().await? {
                let flags = match (message.edited, message.deleted) {
                    (_, true) => " [deleted]",
                    (true, false) => " [edited]",
                    (false, false) => "",
                };
                println!(
                    "{} {} {}: {}{}",
                    message.sent_at.to_rfc3339(),
                    message.message_id,
                    message.sender_id,
                    message.content,
                    flags
                );
            }
        }
        Command::Purge { room } => {
            let removed = storage.purge_room(&RoomId::new(room)).await?;
            println!("removed {removed} messages");
        }
    }

    Ok(())
}
