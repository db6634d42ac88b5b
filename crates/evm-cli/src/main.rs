#![forbid(unsafe_code)]

//! **evm-cli** – Command-line interface for driving an Event Virtual
//! Machine instance.
//!
//! This is a demo harness, not a homeserver: it wires up a [`Runtime`] over
//! an in-memory or sled-backed store and lets an operator issue `m.room.*`
//! events, inspect the sequence watermarks, and tail the `vm.notify`
//! broadcast stream from a terminal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evm_core::{Copts, EventBuilder, RoomContext};
use evm_runtime::{Runtime, RuntimeConfig, StorageConfig};
use evm_types::id::{RoomId, UserId};

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "evm")]
#[command(about = "Event Virtual Machine CLI - issue and inspect events")]
#[command(version)]
struct Cli {
    /// Storage backend to use (memory, sled)
    #[arg(long, default_value = "memory")]
    storage: String,

    /// Database path for persistent storage backends
    #[arg(long, default_value = "evm.db")]
    db_path: String,

    /// The server name events are composed and logged under
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue an `m.room.create` event, starting a new room
    CreateRoom {
        /// Room id, e.g. `!lounge:localhost`
        #[arg(long)]
        room: String,
        /// The creating user, e.g. `@alice:localhost`
        #[arg(long)]
        sender: String,
    },
    /// Issue an `m.room.message` event into an existing room
    SendMessage {
        /// Room id to send into
        #[arg(long)]
        room: String,
        /// The sending user
        #[arg(long)]
        sender: String,
        /// The message body
        #[arg(long)]
        body: String,
    },
    /// Print the current sequence watermarks and a room's head set
    QueryState {
        /// Room id to report the head set for
        #[arg(long)]
        room: Option<String>,
    },
    /// Run the runtime in daemon mode, printing every notified event
    Daemon,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    info!("starting evm-cli v{}", env!("CARGO_PKG_VERSION"));

    let storage = parse_storage_config(&cli.storage, &cli.db_path)?;
    debug!(?storage, "storage backend selected");

    let runtime = Runtime::new(RuntimeConfig {
        server_name: cli.server_name.clone(),
        storage,
        ..RuntimeConfig::default()
    })
    .await
    .context("failed to initialize evm runtime")?;
    info!("evm runtime initialized");

    match cli.command {
        Commands::CreateRoom { room, sender } => handle_create_room(&runtime, room, sender).await?,
        Commands::SendMessage { room, sender, body } => {
            handle_send_message(&runtime, room, sender, body).await?
        }
        Commands::QueryState { room } => handle_query_state(&runtime, room).await?,
        Commands::Daemon => handle_daemon(&runtime).await?,
    }

    Ok(())
}

//─────────────────────────────
//  Command handlers
//─────────────────────────────

async fn handle_create_room(runtime: &Runtime, room: String, sender: String) -> Result<()> {
    let room_id = RoomId::parse(room).context("invalid room id")?;
    let sender = UserId::parse(sender).context("invalid sender id")?;

    let builder = EventBuilder::new("m.room.create", sender.clone())
        .with_room_id(room_id.clone())
        .with_state_key("")
        .with_content(serde_json::json!({"creator": sender.as_str()}));

    info!(room = %room_id, sender = %sender, "issuing m.room.create");
    let fault = runtime
        .issue(builder, Copts::default(), None, None)
        .await
        .context("issuing create event failed")?;

    println!("fault: {fault} (watermarks {:?})", runtime.watermarks().await);
    Ok(())
}

async fn handle_send_message(runtime: &Runtime, room: String, sender: String, body: String) -> Result<()> {
    let room_id = RoomId::parse(room).context("invalid room id")?;
    let sender = UserId::parse(sender).context("invalid sender id")?;

    let builder = EventBuilder::new("m.room.message", sender)
        .with_content(serde_json::json!({"msgtype": "m.text", "body": body}));
    let room_ctx = RoomContext {
        room_id,
        store: runtime.store().as_ref(),
    };

    let fault = runtime
        .issue(builder, Copts::default(), Some(&room_ctx), None)
        .await
        .context("issuing message event failed")?;

    println!("fault: {fault} (watermarks {:?})", runtime.watermarks().await);
    Ok(())
}

async fn handle_query_state(runtime: &Runtime, room: Option<String>) -> Result<()> {
    let (uncommitted, committed, retired) = runtime.watermarks().await;
    println!("watermarks: uncommitted={uncommitted} committed={committed} retired={retired}");

    if let Some(room) = room {
        let room_id = RoomId::parse(room).context("invalid room id")?;
        let head = runtime.store().room_head(&room_id).await?;
        println!("room {room_id} head ({} events):", head.len());
        for id in head {
            println!("  {id}");
        }
    }

    Ok(())
}

async fn handle_daemon(runtime: &Runtime) -> Result<()> {
    println!("listening for notified events (press Ctrl+C to stop)");

    let mut rx = runtime.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => println!("{}", event.pretty_oneline()),
                    Err(e) => {
                        error!(error = %e, "notify stream closed");
                        break;
                    }
                }
            }
            _ = &mut ctrl_c => {
                println!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

//─────────────────────────────
//  Utility functions
//─────────────────────────────

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn parse_storage_config(storage_type: &str, db_path: &str) -> Result<StorageConfig> {
    match storage_type.to_lowercase().as_str() {
        "memory" => Ok(StorageConfig::Memory),
        #[cfg(feature = "sled-storage")]
        "sled" => Ok(StorageConfig::Sled {
            path: db_path.to_string(),
        }),
        #[cfg(not(feature = "sled-storage"))]
        "sled" => Err(anyhow::anyhow!(
            "sled storage requires building evm-cli with --features sled-storage"
        )),
        other => Err(anyhow::anyhow!(
            "unsupported storage type: {other}. supported types: memory, sled"
        )),
    }
}
