use clap::Parser;
use log::{error, info};
use serde_json::Value;
use server::config::{RateLimit, ServerConfig};
use server::game::{self, GameState};
use server::network::Server;
use server::pipeline::Reducer;
use shared::replay::{replay, Recording};
use shared::{Action, CanonicalState, InternalAction};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Path that accepts WebSocket upgrades
    #[clap(long, default_value = "/ws")]
    path: String,
    /// Seconds a disconnected player keeps their seat
    #[clap(short, long, default_value = "30")]
    grace: u64,
    /// Broadcast debounce in milliseconds
    #[clap(short, long, default_value = "33")]
    broadcast_ms: u64,
    /// Actions allowed per player per second
    #[clap(short, long, default_value = "60")]
    rate: u32,
    /// Largest accepted message in bytes
    #[clap(long, default_value = "16777216")]
    max_payload: usize,
    /// Restore state from a JSON file before accepting players
    #[clap(long)]
    state: Option<PathBuf>,
    /// Record every applied action to this file on shutdown
    #[clap(long)]
    record: Option<PathBuf>,
    /// Replay a recording offline, print a summary and exit
    #[clap(long)]
    replay: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            path: self.path.clone(),
            grace_period: Duration::from_secs(self.grace),
            broadcast_interval: Duration::from_millis(self.broadcast_ms),
            rate_limit: RateLimit {
                max_actions: self.rate,
                window: Duration::from_secs(1),
            },
            max_payload: self.max_payload,
            record_path: self.record.clone(),
            ..ServerConfig::default()
        }
    }
}

/// Main-method of the application.
/// Parses command-line arguments, then either replays a recording or runs the host.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Some(path) = &args.replay {
        return summarize_replay(path);
    }

    let server = Server::bind(args.config(), game::build_pipeline()).await?;
    let handle = server.handle();

    if let Some(path) = &args.state {
        let state: Value = serde_json::from_slice(&std::fs::read(path)?)?;
        handle.dispatch(Action::internal(InternalAction::Hydrate).with_payload(state));
        info!("Restored state from {}", path.display());
    }

    let run = server.run();
    tokio::pin!(run);

    // Handle shutdown gracefully
    tokio::select! {
        result = &mut run => {
            if let Err(e) = result {
                error!("Server stopped with error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            handle.shutdown();
            run.await?;
        }
    }

    Ok(())
}

fn summarize_replay(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let recording: Recording<CanonicalState<GameState>> = Recording::load(path)?;
    let reducer = game::root_reducer();
    let result = replay(&recording, |state, action| reducer.reduce(state, action));

    println!("Replayed {} actions over {} ms", result.action_count, result.duration);
    println!("Round: {}", result.final_state.app.round);
    for player in result.final_state.players.values() {
        let score = result
            .final_state
            .app
            .scores
            .get(&player.id)
            .copied()
            .unwrap_or(0);
        println!(
            "  {:<16} {:>6} pts{}{}",
            player.name,
            score,
            if player.is_host { " (host)" } else { "" },
            if player.connected { "" } else { " (away)" }
        );
    }
    Ok(())
}
