//! DTS - the Data Transport System node engine.
//!
//! A node runs one transport daemon (`dtsd`) hosting the RPC command port
//! and a pool of bulk ports. Files enter through a queue's four-step
//! handshake, flow hop-by-hop along the configured route, and leave
//! through the delivery executor at the terminal endpoint. `dtsq` is the
//! submitting front-end with offline recovery.

use anyhow::{Context, Result};
use std::sync::Arc;

pub mod client;
pub mod deliver;
pub mod dispatch;
pub mod monitor;
pub mod node;
pub mod queue;
pub mod recover;

pub use node::Node;

/// Period of the statistics timer.
const STAT_PERIOD: std::time::Duration = std::time::Duration::from_secs(60);

/// Grace window for queue managers to finish their current entry on a
/// graceful shutdown.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Run the daemon until shutdown: one manager task per queue, the RPC
/// accept loop, the statistics timer and the USR1/USR2 signal handlers.
pub async fn run_daemon(node: Arc<Node>) -> Result<()> {
    let mut managers = tokio::task::JoinSet::new();
    for q in &node.queues {
        // accept transfers from the first RPC on; the manager catches up
        q.set_state(queue::QueueState::Running);
        managers.spawn(queue::manager_task(node.clone(), q.clone()));
    }
    let rpc = tokio::spawn(dispatch::serve(node.clone()));
    let stats = tokio::spawn(stats_timer(node.clone()));
    install_signal_handlers(node.clone())?;
    tracing::info!("{}: daemon up, {} queue(s)", node.name, node.queues.len());

    node.shutdown.cancelled().await;
    let graceful = node.graceful.load(std::sync::atomic::Ordering::Acquire);
    tracing::info!(
        "{}: shutting down ({})",
        node.name,
        if graceful { "graceful" } else { "abort" }
    );
    stats.abort();
    if graceful {
        let drain = async {
            while managers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("{}: drain timed out, aborting queue managers", node.name);
            managers.abort_all();
        }
    } else {
        managers.abort_all();
    }
    match rpc.await {
        Ok(result) => result?,
        Err(e) if e.is_cancelled() => {}
        Err(e) => return Err(e).context("rpc dispatcher failed"),
    }
    Ok(())
}

fn install_signal_handlers(node: Arc<Node>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut usr1 = signal(SignalKind::user_defined1()).context("cannot install SIGUSR1")?;
    let mut usr2 = signal(SignalKind::user_defined2()).context("cannot install SIGUSR2")?;
    let n = node.clone();
    tokio::spawn(async move {
        usr1.recv().await;
        tracing::info!("SIGUSR1: graceful shutdown requested");
        n.graceful.store(true, std::sync::atomic::Ordering::Release);
        for q in &n.queues {
            q.set_state(queue::QueueState::Shutdown);
        }
        n.shutdown.cancel();
    });
    tokio::spawn(async move {
        usr2.recv().await;
        tracing::warn!("SIGUSR2: immediate abort requested");
        node.graceful
            .store(false, std::sync::atomic::Ordering::Release);
        for q in &node.queues {
            q.set_state(queue::QueueState::Shutdown);
        }
        node.shutdown.cancel();
    });
    Ok(())
}

/// Periodic refresh of the shared stats page so observers see pending
/// counts even while a queue is idle.
async fn stats_timer(node: Arc<Node>) {
    loop {
        tokio::time::sleep(STAT_PERIOD).await;
        for q in &node.queues {
            if let Some(rec) = node.shm_record(q.shm_idx) {
                rec.set_qname(&q.cfg.name);
                rec.push_msg(&format!(
                    "{} {} pending={}",
                    common::utc_timestamp(),
                    q.state(),
                    q.pending()
                ));
            }
        }
    }
}
