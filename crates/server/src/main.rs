mod config;
mod server;

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;

use config::ServerConfig;
use server::GameServer;
use skirmish::net::MessageRegistry;

#[derive(Parser)]
#[command(name = "skirmish-server")]
#[command(about = "Headless skirmish server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, default_value_t = skirmish::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = skirmish::DEFAULT_FRAME_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 16)]
    max_clients: usize,

    #[arg(
        short,
        long,
        value_delimiter = ',',
        help = "Arenas to cycle through (e.g. Eris,Amazonas)"
    )]
    arenas: Vec<String>,

    #[arg(long, default_value_t = 180, help = "Arena time limit in seconds, 0 for none")]
    time_limit: u16,

    #[arg(long, default_value_t = 5, help = "Seconds between arenas")]
    intermission: u32,

    #[arg(long, default_value_t = 10_000, help = "Handshake timeout in ms")]
    handshake_timeout_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = ServerConfig {
        bind: (args.bind, args.port).into(),
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        time_limit_secs: args.time_limit,
        intermission_secs: args.intermission,
        ..Default::default()
    };
    config.net.handshake_timeout_ms = args.handshake_timeout_ms;
    if !args.arenas.is_empty() {
        config.arena_playlist = args.arenas;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting network runtime")?;

    let registry = Arc::new(MessageRegistry::standard()?);
    let mut server = GameServer::bind(runtime.handle(), config, registry)?;

    let running = server.running();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted");
            running.store(false, Ordering::SeqCst);
        }
    });

    log::info!("Server started on {}", server.local_addr());
    server.run();
    log::info!("Server shutting down");

    Ok(())
}
