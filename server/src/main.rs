use clap::Parser;
use log::info;
use server::config::{self, CacheConfig, EngineConfig, ModuleDeclaration};
use server::engine::Engine;
use server::network::Server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Ticks per second
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Maximum number of connected clients
    #[arg(short = 'c', long, default_value = "64")]
    max_clients: usize,

    /// Maximum number of live entities across all matches
    #[arg(long, default_value_t = config::DEFAULT_MAX_ENTITIES)]
    max_entities: usize,

    /// Maximum number of component types, reserved ones included
    #[arg(long, default_value_t = config::DEFAULT_MAX_COMPONENTS)]
    max_components: usize,

    /// Commands executed per tick; the rest wait for the next tick
    #[arg(
        long,
        default_value_t = config::DEFAULT_MAX_COMMANDS_PER_TICK,
        value_parser = at_least_one
    )]
    max_commands_per_tick: usize,

    /// Dirty ratio above which a cached snapshot is rebuilt instead of patched
    #[arg(long, default_value_t = config::DEFAULT_REBUILD_THRESHOLD)]
    rebuild_threshold: f64,

    /// Rebuild cached snapshots after this many ticks (0 never rebuilds)
    #[arg(long, default_value_t = config::DEFAULT_MAX_CACHE_AGE_TICKS)]
    max_snapshot_age: u64,

    /// Module to install, as name=FLAG:COMPONENT,COMPONENT (repeatable)
    #[arg(short, long = "module", default_value = "movement=MOVABLE:POSITION_X,POSITION_Y")]
    modules: Vec<ModuleDeclaration>,
}

fn at_least_one(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let engine = Engine::new(EngineConfig {
        max_entities: args.max_entities,
        max_components: args.max_components,
        max_commands_per_tick: args.max_commands_per_tick,
        cache: CacheConfig {
            rebuild_threshold: args.rebuild_threshold,
            max_age_ticks: (args.max_snapshot_age > 0).then_some(args.max_snapshot_age),
        },
    });

    for module in &args.modules {
        let components: Vec<&str> = module.components.iter().map(String::as_str).collect();
        engine.install_module(&module.name, &module.flag, &components)?;
        info!(
            "Installed module {} (flag {}, {} components)",
            module.name,
            module.flag,
            components.len()
        );
    }

    let address = format!("{}:{}", args.host, args.port);
    info!("Starting server on {} at {}Hz", address, args.tick_rate);

    let mut server = Server::new(
        &address,
        config::tick_duration(args.tick_rate),
        args.max_clients,
        engine,
    )
    .await?;

    server.run().await?;

    Ok(())
}
