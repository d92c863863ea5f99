use clap::Parser;
use client::mapping::{DomainRegistry, FieldMapping};
use client::network::Client;
use log::info;
use shared::MatchId;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Match to follow
    #[arg(short = 'm', long, default_value = "1")]
    match_id: u64,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Number of units to spawn after connecting
    #[arg(long, default_value = "0")]
    spawn: usize,

    /// Follow only the entities this client owns
    #[arg(long)]
    owned: bool,
}

/// Client-side view of an entity of the `movement` module.
#[derive(Debug, Default)]
struct Unit {
    x: f32,
    y: f32,
}

fn unit_mapping() -> FieldMapping<Unit> {
    FieldMapping::<Unit>::new("movement", "MOVABLE")
        .bind("POSITION_X", |unit, value| unit.x = value)
        .bind("POSITION_Y", |unit, value| unit.y = value)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let mut client = Client::new(
        &args.server,
        MatchId(args.match_id),
        DomainRegistry::new(unit_mapping()),
        args.fake_ping,
        args.spawn,
    )
    .await?
    .with_owned_only(args.owned);

    client.run().await?;

    Ok(())
}
