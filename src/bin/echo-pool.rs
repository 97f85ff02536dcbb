use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use conn_pool::common;
use conn_pool::tcp::TcpSource;
use conn_pool::{EventLoopGroup, PoolConfig, PoolGroup};
use eyre::{Context, bail};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

/// Hammer a local echo server through a pooled client
#[derive(Parser, Debug)]
struct Args {
    /// address for the echo server
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,
    /// number of event loops, each with its own pool
    #[arg(long, default_value_t = 2)]
    event_loops: usize,
    /// connections per event loop
    #[arg(long, default_value_t = 4)]
    capacity: usize,
    /// concurrent client tasks
    #[arg(long, default_value_t = 16)]
    workers: usize,
    /// round trips per client task
    #[arg(long, default_value_t = 100)]
    rounds: usize,
    /// fail a request after waiting this long for a connection
    #[arg(long)]
    request_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    common::initialize_logging()?;
    let args = Args::parse();
    if args.event_loops == 0 || args.capacity == 0 {
        bail!("--event-loops and --capacity must be at least 1");
    }

    let listener = TcpListener::bind(args.listen)
        .await
        .wrap_err("binding echo server")?;
    let addr = listener.local_addr()?;
    info!(%addr, "echo server listening");
    tokio::spawn(serve_echo(listener));

    let loops = EventLoopGroup::new(args.event_loops).wrap_err("starting event loops")?;
    let mut config = PoolConfig::new(args.capacity);
    if let Some(ms) = args.request_timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }
    let group = Arc::new(PoolGroup::new(Arc::new(TcpSource::new(addr)), config, &loops));

    let mut workers = JoinSet::new();
    for worker in 0..args.workers {
        let group = Arc::clone(&group);
        let rounds = args.rounds;
        let task = async move {
            for round in 0..rounds {
                let message = format!("worker {worker} round {round}\n");
                let echoed = group
                    .with_connection(async |conn| conn.round_trip(message.as_bytes()).await)
                    .await??;
                if echoed != message.as_bytes() {
                    bail!("echo mismatch on round {round}");
                }
            }
            debug!("worker done");
            Ok::<_, eyre::Report>(())
        };
        workers.spawn(task.instrument(info_span!("worker", worker)));
    }

    let mut failures = 0;
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined.wrap_err("worker panicked")? {
            warn!("worker failed: {err:#}");
            failures += 1;
        }
    }
    info!(
        live = group.live_count(),
        capacity = group.capacity(),
        failures,
        "all workers finished"
    );

    group.close().await.wrap_err("closing connection pools")?;
    loops.shutdown();
    if failures > 0 {
        bail!("{failures} of {} workers failed", args.workers);
    }
    Ok(())
}

async fn serve_echo(listener: TcpListener) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        tokio::spawn(async move {
            let (mut read, mut write) = stream.split();
            if let Err(err) = tokio::io::copy(&mut read, &mut write).await {
                debug!(%peer, %err, "echo connection ended");
            }
        });
    }
}
