mod net;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use net::{ClientConfig, NetworkClient, PredictionConfig};
use skirmish::net::{MessageRegistry, SessionEvent};

#[derive(Parser)]
#[command(name = "skirmish-client")]
#[command(about = "Headless skirmish client")]
struct Args {
    #[arg(
        short,
        long,
        value_delimiter = ',',
        help = "Server addresses to try, first to answer wins (e.g. 127.0.0.1:16727)"
    )]
    server: Vec<SocketAddr>,

    #[arg(long, default_value = "0.0.0.0:0", help = "Local address for the UDP socket")]
    udp_bind: SocketAddr,

    #[arg(short, long, default_value = "pilot")]
    name: String,

    #[arg(long, default_value = "windlord")]
    ship: String,

    #[arg(long, default_value = "bazooka")]
    weapon: String,

    #[arg(short, long, help = "Leave after this many seconds")]
    duration: Option<u64>,

    #[arg(long, default_value_t = 2000, help = "Ship location history length in ms")]
    history_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = ClientConfig {
        player_name: args.name,
        ship: args.ship,
        weapon: args.weapon,
        udp_bind: args.udp_bind,
        duration_secs: args.duration,
        prediction: PredictionConfig {
            retention_ms: args.history_ms,
            ..Default::default()
        },
        ..Default::default()
    };
    if !args.server.is_empty() {
        config.servers = args.server;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("starting network runtime")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                running.store(false, Ordering::SeqCst);
            }
        });
    }

    let registry = Arc::new(MessageRegistry::standard()?);
    let deadline = config.duration_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut client = NetworkClient::new(config, registry);
    client.connect(runtime.handle())?;

    run(&mut client, &running, deadline);

    client.disconnect();
    log::info!("Client shutting down");
    Ok(())
}

fn run(client: &mut NetworkClient, running: &AtomicBool, deadline: Option<Instant>) {
    let mut last_report = Instant::now();

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if deadline.is_some_and(|deadline| now >= deadline) {
            break;
        }

        for event in client.update(now) {
            match event {
                SessionEvent::ConnectFailed { .. } | SessionEvent::ConnectionDropped { .. } => return,
                _ => {}
            }
        }

        if now.duration_since(last_report) >= Duration::from_secs(1) {
            last_report = now;
            report(client, now);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn report(client: &NetworkClient, now: Instant) {
    let ping = client.ping_time().unwrap_or_default();
    match client.predicted_ship(now) {
        Some(ship) => log::info!(
            "ping {:?}, ship at ({:.1}, {:.1}) heading {:.2} rad, {} history entries",
            ping,
            ship.position.x,
            ship.position.y,
            ship.rotation,
            client.prediction().map_or(0, |history| history.len())
        ),
        None if client.game().running_arena => log::info!("ping {ping:?}, waiting for our ship"),
        None => log::info!("ping {ping:?}, waiting for the next arena"),
    }
}
