//! The per-process node: identity, sandbox, peer table and queues.
//!
//! There is exactly one [`Node`] per daemon. It is passed around
//! explicitly (no process-global); queues receive it as an opaque handle
//! for peer lookup, logging and the stats page, while ownership stays
//! here.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

use crate::monitor::MonitorHandle;
use crate::queue::Queue;
use common::config::{DtsConfig, NodeConfig};
use common::sandbox::Sandbox;
use common::stats::ErrorRing;
use remote::PortRange;

/// A known remote node. Read-only after config load.
#[derive(Debug, Clone)]
pub struct PeerClient {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub contact: u16,
    pub lo_port: u16,
    pub hi_port: u16,
    pub network: String,
    /// Delivery directory hint for status displays.
    pub delivery_dir: Option<String>,
}

impl PeerClient {
    pub fn client(&self) -> remote::Client {
        remote::Client::new(self.host.clone(), self.port)
    }
}

/// Mutable run flags togglable over RPC (`setDbg`, `dtsSet`).
#[derive(Debug, Clone, Default)]
pub struct RunFlags {
    pub verbose: u8,
    pub debug: u8,
    pub trace: bool,
    pub copy_mode: bool,
}

pub struct Node {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub contact: u16,
    pub passwd: String,
    pub ops_pass: String,
    root: std::sync::RwLock<std::path::PathBuf>,
    sandbox: std::sync::RwLock<Sandbox>,
    pub min_free: u64,
    pub bulk_range: PortRange,
    pub dbfile: Option<std::path::PathBuf>,
    pub logfile: Option<std::path::PathBuf>,
    pub monitor_url: std::sync::Mutex<Option<String>>,
    pub peers: Vec<PeerClient>,
    pub queues: Vec<Arc<Queue>>,
    pub flags: std::sync::RwLock<RunFlags>,
    pub errs: std::sync::Mutex<ErrorRing>,
    /// Free-form key/value store behind `dtsSet`/`dtsGet`.
    pub kv: std::sync::Mutex<std::collections::HashMap<String, String>>,
    pub shutdown: tokio_util::sync::CancellationToken,
    pub graceful: std::sync::atomic::AtomicBool,
    pub start: std::time::Instant,
    pub monitor: MonitorHandle,
    pub stats_page: Option<common::shm::StatsPage>,
}

impl Node {
    /// Build the node for `name` out of a parsed configuration. Creates
    /// the sandbox layout; failure here is fatal for the daemon.
    pub fn from_config(cfg: &DtsConfig, name: &str) -> Result<Arc<Self>> {
        let nc: &NodeConfig = cfg
            .node_named(name)
            .ok_or_else(|| anyhow!("no dts block named '{name}' in the configuration"))?;
        let root = nc.root.clone();
        std::fs::create_dir_all(root.join("spool"))
            .with_context(|| format!("cannot create sandbox root {root:?}"))?;
        std::fs::create_dir_all(root.join("copy"))?;
        std::fs::create_dir_all(root.join("logs"))?;

        let peers = cfg
            .peers_of(name)
            .into_iter()
            .map(|p| PeerClient {
                name: p.name.clone(),
                host: p.host.clone(),
                port: p.port,
                contact: p.contact,
                lo_port: p.lo_port,
                hi_port: p.hi_port,
                network: p.network.clone(),
                delivery_dir: p
                    .queues
                    .iter()
                    .find(|q| !q.delivery_dir.is_empty())
                    .map(|q| q.delivery_dir.clone()),
            })
            .collect();

        let stats_page = match common::shm::StatsPage::create(
            &format!("dts_stat_{}", nc.name),
            nc.queues.len(),
        ) {
            Ok(page) => Some(page),
            Err(e) => {
                tracing::warn!("stats page unavailable: {e:#}");
                None
            }
        };

        let queues: Vec<Arc<Queue>> = nc
            .queues
            .iter()
            .enumerate()
            .map(|(i, qc)| Arc::new(Queue::new(qc.clone(), i)))
            .collect();
        if let Some(page) = &stats_page {
            for (i, q) in queues.iter().enumerate() {
                page.queue(i).set_qname(&q.cfg.name);
            }
        }

        let monitor = MonitorHandle::new();
        let node = Arc::new(Self {
            name: nc.name.clone(),
            host: nc.host.clone(),
            port: nc.port,
            contact: nc.contact,
            passwd: nc.passwd.clone(),
            ops_pass: nc.ops_pass.clone(),
            sandbox: std::sync::RwLock::new(Sandbox::new(root.clone(), nc.ops_pass.clone())),
            root: std::sync::RwLock::new(root),
            min_free: nc.min_free,
            bulk_range: PortRange::new(nc.lo_port, nc.hi_port)?,
            dbfile: nc.dbfile.clone(),
            logfile: nc.logfile.clone(),
            monitor_url: std::sync::Mutex::new(nc.monitor.clone().or(cfg.monitor.clone())),
            peers,
            queues,
            flags: std::sync::RwLock::new(RunFlags {
                verbose: cfg.verbose,
                debug: cfg.debug,
                ..Default::default()
            }),
            errs: std::sync::Mutex::new(ErrorRing::default()),
            kv: std::sync::Mutex::new(std::collections::HashMap::new()),
            shutdown: tokio_util::sync::CancellationToken::new(),
            graceful: std::sync::atomic::AtomicBool::new(true),
            start: std::time::Instant::now(),
            monitor,
            stats_page,
        });
        Ok(node)
    }

    pub fn root(&self) -> std::path::PathBuf {
        self.root.read().unwrap().clone()
    }

    /// Resolve a wire path through the sandbox chokepoint.
    pub fn resolve(&self, path: &str) -> std::path::PathBuf {
        self.sandbox.read().unwrap().resolve(path)
    }

    /// Re-root the sandbox (ops verb).
    pub fn set_root(&self, root: std::path::PathBuf) {
        *self.sandbox.write().unwrap() = Sandbox::new(root.clone(), self.ops_pass.clone());
        *self.root.write().unwrap() = root;
    }

    pub fn peer(&self, name: &str) -> Option<&PeerClient> {
        self.peers.iter().find(|p| p.name == name || p.host == name)
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.iter().find(|q| q.cfg.name == name).cloned()
    }

    pub fn shm_record(&self, idx: usize) -> Option<&common::shm::ShmQueueRecord> {
        self.stats_page.as_ref().map(|p| p.queue(idx))
    }

    /// Record an error in the node ring, the log and the monitor feed.
    pub fn log_error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::error!("{msg}");
        self.errs.lock().unwrap().push(msg.clone());
        self.monitor.log(&self.name, msg);
    }

    pub fn uptime_sec(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    /// Spool directory for one queue.
    pub fn spool_dir(&self, qname: &str) -> std::path::PathBuf {
        self.root().join("spool").join(qname)
    }

    /// Per-queue log directory, also the landing area for uploaded
    /// offline recovery logs.
    pub fn qlog_dir(&self, qname: &str) -> std::path::PathBuf {
        self.root().join("logs").join(qname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: &str = "\
dts
    name  alpha
    host  127.0.0.1
    port  3000
    root  ROOT
    queue
        name    sci
        node    endpoint
        type    normal
        mode    push
        method  dts
        port    3005
dts
    name  beta
    host  127.0.0.2
    port  3000
    root  ROOT2
";

    #[tokio::test]
    async fn builds_node_with_peer_table() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let text = CFG
            .replace("ROOT2", tmp.path().join("beta").to_str().unwrap())
            .replace("ROOT", tmp.path().join("alpha").to_str().unwrap());
        let cfg = DtsConfig::parse(&text)?;
        let node = Node::from_config(&cfg, "alpha")?;
        assert_eq!(node.name, "alpha");
        assert_eq!(node.peers.len(), 1);
        assert_eq!(node.peers[0].name, "beta");
        assert!(node.queue("sci").is_some());
        assert!(node.queue("nope").is_none());
        assert!(node.root().join("spool").is_dir());
        assert!(node.root().join("copy").is_dir());
        Ok(())
    }
}
