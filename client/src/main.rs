use clap::Parser;
use client::network::Client;
use client::{generate_secret, ClientConfig};
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Upgrade path on the host
    #[arg(long, default_value = "/ws")]
    path: String,

    /// Display name sent with JOIN
    #[arg(short, long, default_value = "player")]
    name: String,

    /// Secret to join with; reuse one to reconnect to the same seat
    #[arg(long)]
    secret: Option<String>,

    /// Milliseconds between clock probes
    #[arg(long, default_value = "2000")]
    ping_ms: u64,

    /// Milliseconds between random scoring actions, 0 to stay passive
    #[arg(short, long, default_value = "0")]
    action_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let secret = args.secret.unwrap_or_else(generate_secret);
    info!("Joining as {} with secret {}", args.name, secret);
    info!("Use RUST_LOG=debug to see clock samples");

    let config = ClientConfig {
        server: args.server,
        path: args.path,
        name: args.name,
        avatar: None,
        secret,
        ping_interval: Duration::from_millis(args.ping_ms.max(1)),
        action_interval: (args.action_ms > 0).then(|| Duration::from_millis(args.action_ms)),
    };

    let mut client = Client::new(config);
    client.run().await?;

    Ok(())
}
