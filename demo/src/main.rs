//! varmcp pool demo
//!
//! Starts a loopback echo service standing in for an upstream evidence
//! source, drives a pool manager with concurrent clients against it, and
//! prints the final manager statistics as JSON on stdout.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use varmcp_pool::{Connection, ConnectionPoolConfig, PoolConfig, PoolError, PoolManager};

/// Command-line options
#[derive(Parser, Debug)]
#[command(
    name = "varmcp-pool-demo",
    version,
    about = "Exercise a varmcp connection pool manager against a loopback echo service"
)]
struct Cli {
    /// JSON pool configuration; defaults are used when omitted
    #[arg(long, env = "VARMCP_POOL_CONFIG")]
    config: Option<PathBuf>,

    /// Pool to drive; pointed at the echo service unless the config names it
    #[arg(long, default_value = "clinvar")]
    pool: String,

    /// Concurrent clients
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Checkout/return cycles per client
    #[arg(long, default_value_t = 20)]
    rounds: usize,

    /// Capacity of the driven pool when the config does not name it
    #[arg(long, default_value_t = 4)]
    max_conn: usize,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Default)]
struct Tally {
    served: AtomicU64,
    exhausted: AtomicU64,
    failed: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let echo_addr = spawn_echo_service().await?;
    info!("Echo service listening on {}", echo_addr);

    let mut config = match &cli.config {
        Some(path) => ConnectionPoolConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConnectionPoolConfig::default(),
    };
    if !config.pool_configs.contains_key(&cli.pool) {
        config = config.with_pool(
            cli.pool.clone(),
            PoolConfig::tcp(&echo_addr).with_max_conn(cli.max_conn),
        );
    }

    let manager = Arc::new(PoolManager::new(config));
    let tally = Arc::new(Tally::default());
    let cancel = CancellationToken::new();

    let clients: Vec<_> = (0..cli.clients)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let tally = Arc::clone(&tally);
            let cancel = cancel.clone();
            let pool = cli.pool.clone();
            let rounds = cli.rounds;
            tokio::spawn(async move {
                let client_id = format!("client-{i}");
                run_client(&manager, &cancel, &pool, &client_id, rounds, &tally).await;
            })
        })
        .collect();

    tokio::select! {
        _ = futures::future::join_all(clients) => {}
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for ctrl-c")?;
            warn!("Interrupted, cancelling clients");
            cancel.cancel();
        }
    }

    info!(
        "Served {} requests ({} exhausted, {} failed)",
        tally.served.load(Ordering::Relaxed),
        tally.exhausted.load(Ordering::Relaxed),
        tally.failed.load(Ordering::Relaxed)
    );

    let stats = manager.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    manager.close().await.context("closing pool manager")?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Accept connections and echo every byte back
async fn spawn_echo_service() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("binding echo service")?;
    let addr = listener.local_addr()?.to_string();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, peer)) => {
                    tokio::spawn(async move {
                        let (mut reader, mut writer) = stream.split();
                        if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                            debug!("Echo connection {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Echo service accept failed: {}", e);
                    break;
                }
            }
        }
    });

    Ok(addr)
}

async fn run_client(
    manager: &PoolManager,
    cancel: &CancellationToken,
    pool: &str,
    client_id: &str,
    rounds: usize,
    tally: &Tally,
) {
    for round in 0..rounds {
        if cancel.is_cancelled() {
            return;
        }

        let conn = match manager.checkout(cancel, pool, client_id).await {
            Ok(conn) => conn,
            Err(PoolError::Exhausted { .. }) => {
                tally.exhausted.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }
            Err(e) => {
                warn!("{} checkout failed: {}", client_id, e);
                tally.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let request = format!("{client_id} classify variant {round}\n");
        match exchange(&conn, request.as_bytes()).await {
            Ok(()) => {
                tally.served.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("{} request on {} failed: {}", client_id, conn.id(), e);
                tally.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Err(e) = manager.return_connection(pool, conn).await {
            warn!("{} return failed: {}", client_id, e);
        }
    }
}

/// Write one request and read back its echo
async fn exchange(conn: &Connection, request: &[u8]) -> Result<()> {
    let mut guard = conn.transport().await;
    let transport = guard.as_mut().context("connection already closed")?;
    transport.write_all(request).await?;
    let mut reply = vec![0u8; request.len()];
    transport.read_exact(&mut reply).await?;
    anyhow::ensure!(reply == request, "echo mismatch");
    Ok(())
}
