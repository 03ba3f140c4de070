//! tcpclad: TCP convergence layer daemon.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use tcpcl_core::TcpclConfig;
use tcpcl_engine::{Induct, Outduct, OutductRegistry, OutductSettings, SessionParams};

mod spool;

use spool::{new_claims, OutboundSpool, SpoolObserver, SpoolSink};

/// Bundles buffered between a spool poller and its outduct.
const QUEUE_DEPTH: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TcpclConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TcpclConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TcpclConfig::default()
    });

    // ── Shutdown channel ─────────────────────────────────────────────────────

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            let _ = shutdown_tx.send(());
        });
    }
    let mut shutdown_rx = shutdown_tx.subscribe();

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let mut tasks: Vec<(String, JoinHandle<Result<()>>)> = Vec::new();
    let sink = Arc::new(SpoolSink::new(&config.spool.inbound_dir)?);

    if config.induct.enabled {
        let params = SessionParams::from_config(&config, config.induct.framing);
        tracing::info!(local_eid = %params.local_eid, "tcpclad starting");
        let induct = Induct::bind(
            config.induct.listen,
            params,
            sink.clone(),
            shutdown_tx.subscribe(),
        )?;
        tasks.push(("induct".into(), tokio::spawn(induct.run())));
    }

    let registry = OutductRegistry::new();
    let claims = new_claims();
    let observer = Arc::new(SpoolObserver::new(claims.clone()));
    let handles = Arc::new(AtomicU64::new(1));
    let poll = Duration::from_millis(config.spool.poll_ms.max(1));

    for duct in &config.outducts {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);

        let outduct = Outduct::new(
            OutductSettings::from_config(&config, duct),
            registry.clone(),
            observer.clone(),
        )
        .with_sink(sink.clone());
        tasks.push((
            format!("outduct {}", duct.name),
            tokio::spawn(outduct.run(queue_rx, shutdown_tx.subscribe())),
        ));

        let spool = OutboundSpool::open(
            &config.spool.outbound_dir,
            &duct.name,
            claims.clone(),
            handles.clone(),
        )?;
        tasks.push((
            format!("spool {}", duct.name),
            tokio::spawn(spool.run(queue_tx, poll, shutdown_tx.subscribe())),
        ));
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let _ = shutdown_rx.recv().await;
    tracing::info!("shutting down");

    for (name, task) in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(task = %name, error = %e, "task failed"),
            Err(e) => tracing::error!(task = %name, error = %e, "task panicked"),
        }
    }

    tracing::info!("tcpclad stopped");
    Ok(())
}
