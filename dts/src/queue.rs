//! Queue runtime: state machine, work queue and the manager loop.
//!
//! Each configured queue carries a single state, updated only by its
//! manager or by explicit admin verbs, plus a counting semaphore of
//! completed spool entries awaiting forwarding or delivery. Files leave a
//! queue in the order their `endTransfer` completed.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::node::Node;
use common::config::{QueueConfig, QueueMode, QueueRole, QueueType};
use common::control::ControlRecord;
use common::stats::{ErrorRing, QueueStats, XferStat, XferStatus};
use remote::protocol::{ConnMode, Request, Response, XferArgs};
use remote::xfer;

/// Queue states. SHUTDOWN keeps its deliberately high sentinel value so a
/// stray concurrent decrement can never land it in a neighbouring real
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueState {
    Paused = 0,
    Running = 1,
    Active = 2,
    Waiting = 3,
    Respawn = 16,
    Killed = 17,
    Respawning = 18,
    Shutdown = 90,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueState::Paused => "paused",
            QueueState::Running => "running",
            QueueState::Active => "active",
            QueueState::Waiting => "waiting",
            QueueState::Respawn => "respawn",
            QueueState::Killed => "killed",
            QueueState::Respawning => "respawning",
            QueueState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Forwarding attempts before the queue pauses itself.
const FORWARD_MAX_TRIES: u32 = 3;

/// An in-flight incoming handshake (initTransfer .. endTransfer).
#[derive(Debug, Clone)]
pub struct IncomingXfer {
    pub slot: std::path::PathBuf,
    pub started: std::time::Instant,
}

/// A handshake abandoned this long is considered dead and its slot is
/// reclaimed by the next initTransfer.
const INCOMING_STALE: std::time::Duration = std::time::Duration::from_secs(600);

/// State guarded by the per-queue mutex.
struct Inner {
    state: QueueState,
    stats: QueueStats,
    infile: String,
    outfile: String,
    errs: ErrorRing,
    incoming: Option<IncomingXfer>,
    /// Spool entries whose endTransfer already completed, for retry
    /// safety.
    completed: VecDeque<std::path::PathBuf>,
    /// Admin overrides from `setQueueDir` / `setQueueCmd`.
    delivery_dir_override: Option<String>,
    delivery_cmd_override: Option<String>,
    /// Entry the manager is processing right now.
    active_slot: Option<std::path::PathBuf>,
}

pub struct Queue {
    pub cfg: QueueConfig,
    pub shm_idx: usize,
    inner: std::sync::Mutex<Inner>,
    state_tx: tokio::sync::watch::Sender<QueueState>,
    state_rx: tokio::sync::watch::Receiver<QueueState>,
    /// Completed-entry counter the manager sleeps on.
    count: tokio::sync::Semaphore,
    /// Entries in endTransfer-completion order.
    work: std::sync::Mutex<VecDeque<std::path::PathBuf>>,
    /// initTransfer reservations, for the back-pressure ceiling.
    pub pending_slots: AtomicU64,
    flush_requested: AtomicBool,
    /// Cancellation for the transfer currently in flight on this queue.
    pub xfer_cancel: std::sync::Mutex<Option<tokio_util::sync::CancellationToken>>,
}

impl Queue {
    pub fn new(cfg: QueueConfig, shm_idx: usize) -> Self {
        let (state_tx, state_rx) = tokio::sync::watch::channel(QueueState::Paused);
        Self {
            cfg,
            shm_idx,
            inner: std::sync::Mutex::new(Inner {
                state: QueueState::Paused,
                stats: QueueStats::default(),
                infile: String::new(),
                outfile: String::new(),
                errs: ErrorRing::default(),
                incoming: None,
                completed: VecDeque::new(),
                delivery_dir_override: None,
                delivery_cmd_override: None,
                active_slot: None,
            }),
            state_tx,
            state_rx,
            count: tokio::sync::Semaphore::new(0),
            work: std::sync::Mutex::new(VecDeque::new()),
            pending_slots: AtomicU64::new(0),
            flush_requested: AtomicBool::new(false),
            xfer_cancel: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().unwrap().state
    }

    pub fn set_state(&self, state: QueueState) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        let _ = self.state_tx.send(state);
    }

    /// Wait until the state satisfies `pred`; returns the state seen.
    pub async fn wait_state(&self, mut pred: impl FnMut(QueueState) -> bool) -> QueueState {
        let mut rx = self.state_rx.clone();
        loop {
            let s = *rx.borrow_and_update();
            if pred(s) {
                return s;
            }
            if rx.changed().await.is_err() {
                return s;
            }
        }
    }

    /// Hand a completed spool entry to the manager.
    pub fn enqueue_work(&self, slot: std::path::PathBuf) {
        self.work.lock().unwrap().push_back(slot);
        self.count.add_permits(1);
    }

    /// Manager side: wait for the next completed entry.
    pub async fn next_work(&self) -> Option<std::path::PathBuf> {
        let permit = self.count.acquire().await.ok()?;
        permit.forget();
        self.work.lock().unwrap().pop_front()
    }

    /// Put an entry back at the head after a failed attempt, so order is
    /// preserved across retries.
    pub fn requeue_front(&self, slot: std::path::PathBuf) {
        self.work.lock().unwrap().push_front(slot);
        self.count.add_permits(1);
    }

    /// Drop one specific entry from the work queue (admin removal).
    pub fn remove_work(&self, slot: &std::path::Path) -> bool {
        let mut work = self.work.lock().unwrap();
        let Some(pos) = work.iter().position(|p| p == slot) else {
            return false;
        };
        work.remove(pos);
        if let Ok(permit) = self.count.try_acquire() {
            permit.forget();
        }
        true
    }

    /// Idempotent kick: return the count semaphore to the known-good
    /// value (one permit per queued entry) in case the manager is asleep
    /// on a drained semaphore.
    pub fn poke(&self) {
        let queued = self.work.lock().unwrap().len();
        let available = self.count.available_permits();
        if available < queued {
            self.count.add_permits(queued - available);
        }
    }

    pub fn pending(&self) -> u64 {
        self.work.lock().unwrap().len() as u64
    }

    pub fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::Release);
        self.poke();
        let mut inner = self.inner.lock().unwrap();
        inner.stats.flushes += 1;
    }

    fn take_flush(&self) -> bool {
        self.flush_requested.swap(false, Ordering::AcqRel)
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = self.inner.lock().unwrap().stats;
        stats.pending = self.pending();
        stats
    }

    pub fn set_stats(&self, stats: QueueStats) {
        self.inner.lock().unwrap().stats = stats;
    }

    pub fn update_stats(&self, xs: &XferStat) {
        self.inner.lock().unwrap().stats.update(xs);
    }

    pub fn infile(&self) -> String {
        self.inner.lock().unwrap().infile.clone()
    }

    pub fn outfile(&self) -> String {
        self.inner.lock().unwrap().outfile.clone()
    }

    pub fn set_infile(&self, name: &str) {
        self.inner.lock().unwrap().infile = name.to_string();
    }

    pub fn set_outfile(&self, name: &str) {
        self.inner.lock().unwrap().outfile = name.to_string();
    }

    /// Effective delivery directory, admin override first.
    pub fn delivery_dir(&self) -> String {
        self.inner
            .lock()
            .unwrap()
            .delivery_dir_override
            .clone()
            .unwrap_or_else(|| self.cfg.delivery_dir.clone())
    }

    pub fn set_delivery_dir(&self, dir: String) {
        self.inner.lock().unwrap().delivery_dir_override = Some(dir);
    }

    /// Effective delivery command, admin override first.
    pub fn delivery_cmd(&self) -> String {
        self.inner
            .lock()
            .unwrap()
            .delivery_cmd_override
            .clone()
            .unwrap_or_else(|| self.cfg.delivery_cmd.clone())
    }

    pub fn set_delivery_cmd(&self, cmd: String) {
        self.inner.lock().unwrap().delivery_cmd_override = Some(cmd);
    }

    pub fn log_error(&self, msg: impl Into<String>) {
        self.inner.lock().unwrap().errs.push(msg);
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner.lock().unwrap().errs.snapshot()
    }

    /// Reserve the queue for one incoming handshake. Returns an error
    /// string (beginning with `Error`) when the queue cannot accept.
    pub fn begin_incoming(
        &self,
        slot: std::path::PathBuf,
        free_space: u64,
        size: u64,
        min_free: u64,
    ) -> std::result::Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            QueueState::Paused => {
                return Err(format!("Error: Queue '{}' is paused", self.cfg.name))
            }
            QueueState::Shutdown | QueueState::Killed => {
                return Err(format!("Error: Queue '{}' is shut down", self.cfg.name))
            }
            _ => {}
        }
        if let Some(incoming) = &inner.incoming {
            if incoming.started.elapsed() < INCOMING_STALE {
                return Err(format!(
                    "Error: Queue '{}' is busy with an incoming transfer",
                    self.cfg.name
                ));
            }
            tracing::warn!(
                "{}: reclaiming stale incoming handshake for {:?}",
                self.cfg.name,
                incoming.slot
            );
        }
        if self.cfg.ceiling > 0 && self.pending_slots.load(Ordering::Acquire) >= self.cfg.ceiling {
            return Err(format!(
                "Error: Queue '{}' is over its pending limit",
                self.cfg.name
            ));
        }
        if free_space < min_free.saturating_add(size) {
            return Err(format!(
                "Error: Queue '{}' spool free space too low",
                self.cfg.name
            ));
        }
        inner.incoming = Some(IncomingXfer {
            slot,
            started: std::time::Instant::now(),
        });
        self.pending_slots.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn clear_incoming(&self) -> Option<IncomingXfer> {
        self.inner.lock().unwrap().incoming.take()
    }

    pub fn incoming(&self) -> Option<IncomingXfer> {
        self.inner.lock().unwrap().incoming.clone()
    }

    /// Record a terminal entry for endTransfer retry safety.
    pub fn mark_completed(&self, slot: std::path::PathBuf) {
        let mut inner = self.inner.lock().unwrap();
        if inner.completed.len() >= common::stats::MAX_ERROR_MSGS {
            inner.completed.pop_front();
        }
        inner.completed.push_back(slot);
    }

    pub fn was_completed(&self, slot: &std::path::Path) -> bool {
        self.inner.lock().unwrap().completed.iter().any(|p| p == slot)
    }

    pub fn is_queued(&self, slot: &std::path::Path) -> bool {
        self.work.lock().unwrap().iter().any(|p| p == slot)
    }

    fn set_active_slot(&self, slot: Option<std::path::PathBuf>) {
        self.inner.lock().unwrap().active_slot = slot;
    }

    pub fn is_active_slot(&self, slot: &std::path::Path) -> bool {
        self.inner
            .lock()
            .unwrap()
            .active_slot
            .as_deref()
            .map(|p| p == slot)
            .unwrap_or(false)
    }
}

/// Run a queue's manager until shutdown, restarting it through the
/// respawn states if an iteration dies.
pub async fn manager_task(node: Arc<Node>, queue: Arc<Queue>) {
    // re-queue spool entries that survived a daemon restart
    if let Err(e) = rescan_spool(&node, &queue).await {
        tracing::warn!("{}: spool rescan failed: {:#}", queue.cfg.name, e);
    }
    queue.set_state(QueueState::Running);
    loop {
        match run_manager(&node, &queue).await {
            Ok(()) => break,
            Err(e) => {
                if node.shutdown.is_cancelled() {
                    break;
                }
                node.log_error(format!("queue '{}' manager died: {e:#}", queue.cfg.name));
                queue.set_state(QueueState::Respawn);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                queue.set_state(QueueState::Respawning);
                queue.poke();
                queue.set_state(QueueState::Running);
            }
        }
    }
    queue.set_state(QueueState::Shutdown);
}

async fn rescan_spool(node: &Arc<Node>, queue: &Arc<Queue>) -> Result<()> {
    let spool = node.spool_dir(&queue.cfg.name);
    for (_, slot) in common::fileutil::numbered_subdirs(&spool).await? {
        if slot.join("_control").exists() && !queue.is_queued(&slot) {
            tracing::info!("{}: re-queueing spool entry {:?}", queue.cfg.name, slot);
            queue.pending_slots.fetch_add(1, Ordering::AcqRel);
            queue.enqueue_work(slot);
        }
    }
    Ok(())
}

async fn run_manager(node: &Arc<Node>, queue: &Arc<Queue>) -> Result<()> {
    loop {
        // respect a pause (admin or self-inflicted) before draining more
        if queue.state() == QueueState::Paused {
            let s = queue
                .wait_state(|s| s != QueueState::Paused && s != QueueState::Respawning)
                .await;
            if s == QueueState::Shutdown {
                return Ok(());
            }
        }
        queue.set_state(QueueState::Waiting);
        let slot = tokio::select! {
            _ = node.shutdown.cancelled() => return Ok(()),
            slot = queue.next_work() => slot,
        };
        if node.shutdown.is_cancelled() || queue.state() == QueueState::Shutdown {
            return Ok(());
        }
        // a poke can wake us with no entry to process
        let Some(slot) = slot else { continue };

        // hold the entry through a pause instead of dropping it
        if queue.state() == QueueState::Paused {
            let s = queue
                .wait_state(|s| s != QueueState::Paused && s != QueueState::Respawning)
                .await;
            if s == QueueState::Shutdown {
                queue.requeue_front(slot);
                return Ok(());
            }
        }
        if queue.cfg.qtype == QueueType::Scheduled && !queue.take_flush() {
            wait_schedule(node, queue).await;
            if node.shutdown.is_cancelled() {
                queue.requeue_front(slot);
                return Ok(());
            }
        }

        queue.set_state(QueueState::Active);
        queue.set_active_slot(Some(slot.clone()));
        let outcome = process_entry(node, queue, &slot).await;
        queue.set_active_slot(None);
        match outcome {
            EntryOutcome::Done => {
                release_slot(queue);
                queue.mark_completed(slot.clone());
                if queue.cfg.auto_purge {
                    if let Err(e) = common::fileutil::remove_any(&slot).await {
                        tracing::warn!("cannot purge spool entry {slot:?}: {e:#}");
                    }
                }
            }
            EntryOutcome::RejectFile(msg) => {
                // the file is rejected but the queue keeps running; the
                // entry is set aside for forensic inspection
                release_slot(queue);
                queue.mark_completed(slot.clone());
                let full = format!("queue '{}': rejected {:?}: {msg}", queue.cfg.name, slot);
                node.log_error(full.clone());
                queue.log_error(full);
                set_aside(&slot).await;
            }
            EntryOutcome::FatalQueue(msg) => {
                let full = format!("queue '{}': entry {:?} failed: {msg}", queue.cfg.name, slot);
                node.log_error(full.clone());
                queue.log_error(full);
                // the retry budget is spent; pause with the entry back at
                // the head so startQueue retries it
                queue.requeue_front(slot);
                queue.set_state(QueueState::Paused);
            }
        }
    }
}

fn release_slot(queue: &Arc<Queue>) {
    let _ = queue
        .pending_slots
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(v.saturating_sub(1))
        });
}

/// Rename a failed spool entry out of the numbered namespace so the
/// at-rest count invariant holds while the payload stays inspectable.
async fn set_aside(slot: &std::path::Path) {
    let bad = slot.with_extension("bad");
    if let Err(e) = tokio::fs::rename(slot, &bad).await {
        tracing::warn!("cannot set aside failed entry {slot:?}: {e:#}");
    }
}

/// Sleep until the next interval boundary for a scheduled queue, or until
/// a flush/shutdown interrupts.
async fn wait_schedule(node: &Arc<Node>, queue: &Arc<Queue>) {
    let Some(interval) = queue.cfg.interval.filter(|i| *i > 0) else {
        return;
    };
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let stime = queue.cfg.stime.unwrap_or(0);
    let elapsed = now.saturating_sub(stime) % interval;
    let delay = interval - elapsed;
    tracing::debug!(
        "{}: scheduled queue sleeping {delay}s to its interval boundary",
        queue.cfg.name
    );
    let sleep = tokio::time::sleep(std::time::Duration::from_secs(delay));
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = node.shutdown.cancelled() => return,
            _ = &mut sleep => return,
            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                if queue.take_flush() {
                    return;
                }
            }
        }
    }
}

/// Terminal classification of one spool entry.
pub enum EntryOutcome {
    Done,
    /// Reject this file, keep the queue running.
    RejectFile(String),
    /// Pause the queue; the entry is retried after `startQueue`.
    FatalQueue(String),
}

/// Execute the node role for one completed spool entry.
async fn process_entry(
    node: &Arc<Node>,
    queue: &Arc<Queue>,
    slot: &std::path::Path,
) -> EntryOutcome {
    let mut ctrl = match ControlRecord::load(slot).await {
        Ok(c) => c,
        Err(e) => {
            return EntryOutcome::RejectFile(format!(
                "spool entry has no readable control record: {e:#}"
            ))
        }
    };
    queue.set_infile(&ctrl.filename);
    if let Some(rec) = node.shm_record(queue.shm_idx) {
        rec.set_infile(&ctrl.filename);
        rec.set_xfer_size(ctrl.fsize);
        rec.xfer_start();
    }
    let outcome = match queue.cfg.node {
        QueueRole::Endpoint => crate::deliver::deliver(node, queue, &mut ctrl, slot).await,
        QueueRole::Ingest | QueueRole::Transfer => match forward(node, queue, &ctrl, slot).await {
            Ok(()) => EntryOutcome::Done,
            Err(e) => EntryOutcome::FatalQueue(format!("{e:#}")),
        },
    };
    if let Some(rec) = node.shm_record(queue.shm_idx) {
        let stats = queue.stats();
        rec.xfer_end(matches!(outcome, EntryOutcome::Done), stats.tput_mb as f32);
    }
    outcome
}

/// Forward a spool entry to the configured downstream peer with the
/// four-step handshake, retrying before the queue pauses.
async fn forward(
    node: &Arc<Node>,
    queue: &Arc<Queue>,
    ctrl: &ControlRecord,
    slot: &std::path::Path,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=FORWARD_MAX_TRIES {
        match forward_once(node, queue, ctrl, slot).await {
            Ok(stat) => {
                queue.update_stats(&stat);
                node.monitor.stat(&queue.cfg.name, stat);
                return Ok(());
            }
            Err(e) if node.shutdown.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "{}: forward attempt {}/{} failed: {:#}",
                    queue.cfg.name,
                    attempt,
                    FORWARD_MAX_TRIES,
                    e
                );
                last_err = Some(e);
                if attempt < FORWARD_MAX_TRIES {
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
    let mut stats = queue.stats();
    stats.failed += 1;
    queue.set_stats(stats);
    Err(last_err.unwrap_or_else(|| anyhow!("forwarding failed")))
}

async fn forward_once(
    node: &Arc<Node>,
    queue: &Arc<Queue>,
    ctrl: &ControlRecord,
    slot: &std::path::Path,
) -> Result<XferStat> {
    let peer = node
        .peer(&queue.cfg.dest)
        .ok_or_else(|| anyhow!("no peer named '{}' for queue '{}'", queue.cfg.dest, queue.cfg.name))?;
    let client = peer.client();
    let fname = if ctrl.xfer_name.is_empty() {
        &ctrl.filename
    } else {
        &ctrl.xfer_name
    };
    let fsize = ctrl.fsize;
    queue.set_outfile(fname);
    if let Some(rec) = node.shm_record(queue.shm_idx) {
        rec.set_outfile(fname);
    }

    // step 1: reserve a spool slot downstream
    let reply = client
        .call(&Request::InitTransfer {
            qname: queue.cfg.name.clone(),
            size: fsize,
        })
        .await
        .context("initTransfer call failed")?;
    let qpath = match reply {
        Response::Str(s) if !s.starts_with("Error") => s,
        Response::Str(s) => bail!("{s}"),
        other => bail!("initTransfer returned {other:?}"),
    };

    // the reservation downstream must not outlive a failed attempt
    match forward_steps(node, queue, ctrl, peer, &client, fname, fsize, slot, &qpath).await {
        Ok(stat) => Ok(stat),
        Err(e) => {
            let _ = client
                .call(&Request::CancelTransfer {
                    qname: queue.cfg.name.clone(),
                })
                .await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_steps(
    node: &Arc<Node>,
    queue: &Arc<Queue>,
    ctrl: &ControlRecord,
    peer: &crate::node::PeerClient,
    client: &remote::Client,
    fname: &str,
    fsize: u64,
    slot: &std::path::Path,
    qpath: &str,
) -> Result<XferStat> {
    let remote_path = format!("{qpath}/{fname}");
    let local_path = slot.join(fname);

    let cancel = tokio_util::sync::CancellationToken::new();
    *queue.xfer_cancel.lock().unwrap() = Some(cancel.clone());
    let params = xfer::XferParams {
        path: local_path,
        fsize,
        nthreads: queue.cfg.nthreads,
        checksum_policy: queue.cfg.checksum_policy,
        rate_mbps: queue.cfg.udt_rate,
        direction: common::stats::Direction::Push,
        cancel,
    };

    // step 2: bulk transfer into the reserved slot
    if let Some(rec) = node.shm_record(queue.shm_idx) {
        rec.phase_start(common::shm::Phase::Net);
    }
    let stat = match queue.cfg.mode {
        QueueMode::Push => {
            // downstream listens, we connect
            let mut session = client
                .session(&Request::ReceiveFile {
                    args: XferArgs {
                        path: remote_path.clone(),
                        fsize,
                        nthreads: queue.cfg.nthreads,
                        base_port: queue.cfg.port,
                        peer_host: node.host.clone(),
                        mode: ConnMode::Listen,
                        method: queue.cfg.method,
                        checksum_policy: queue.cfg.checksum_policy,
                        rate_mbps: queue.cfg.udt_rate,
                    },
                })
                .await?;
            let base = session.recv().await?.into_int()? as u16;
            let stat = xfer::send_file(
                &params,
                xfer::Endpoint::Connect {
                    host: peer.host.clone(),
                    base_port: base,
                },
            )
            .await?;
            let peer_reply = session.recv().await?;
            check_peer_xfer(peer_reply)?;
            stat
        }
        QueueMode::Give => {
            // we listen, downstream is told to pull from us
            let (base, listeners) =
                xfer::bind_endpoint(&node.bulk_range, queue.cfg.port, fsize, queue.cfg.nthreads)
                    .await?;
            let mut session = client
                .session(&Request::ReceiveFile {
                    args: XferArgs {
                        path: remote_path.clone(),
                        fsize,
                        nthreads: queue.cfg.nthreads,
                        base_port: base,
                        peer_host: node.host.clone(),
                        mode: ConnMode::Connect,
                        method: queue.cfg.method,
                        checksum_policy: queue.cfg.checksum_policy,
                        rate_mbps: queue.cfg.udt_rate,
                    },
                })
                .await?;
            let _ready = session.recv().await?;
            let stat = xfer::send_file(&params, xfer::Endpoint::Listen(listeners)).await?;
            let peer_reply = session.recv().await?;
            check_peer_xfer(peer_reply)?;
            stat
        }
    };
    *queue.xfer_cancel.lock().unwrap() = None;
    if let Some(rec) = node.shm_record(queue.shm_idx) {
        rec.phase_end(
            common::shm::Phase::Net,
            stat.status == XferStatus::Ok,
            stat.tput_mb as f32,
        );
    }
    if stat.status != XferStatus::Ok {
        bail!("bulk transfer of {fname} to {} failed", peer.name);
    }

    // step 3: ship the control record
    let reply = client
        .call(&Request::QueueSetControl {
            qpath: qpath.to_string(),
            ctrl: Box::new(ctrl.clone()),
        })
        .await?;
    if reply.is_error() {
        bail!("queueSetControl failed: {reply:?}");
    }

    // step 4: complete the handshake downstream
    let reply = client
        .call(&Request::EndTransfer {
            qname: queue.cfg.name.clone(),
            qpath: qpath.to_string(),
        })
        .await?
        .into_string()?;
    if reply != "OK" {
        bail!("endTransfer returned '{reply}'");
    }
    // let the downstream queue record see our transfer stats
    let _ = client
        .call(&Request::QueueUpdateStats {
            qname: queue.cfg.name.clone(),
            stat,
        })
        .await;
    tracing::info!(
        "{}: forwarded {} ({} bytes) to {}",
        queue.cfg.name,
        fname,
        fsize,
        peer.name
    );
    Ok(stat)
}

fn check_peer_xfer(reply: Response) -> Result<()> {
    match reply {
        Response::Xfer(stat) if stat.status == XferStatus::Ok => Ok(()),
        Response::Xfer(stat) => Err(anyhow!("peer transfer ended {:?}", stat.status)),
        Response::Error(e) => Err(anyhow!(e)),
        other => Err(anyhow!("unexpected bulk reply {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::{ChecksumPolicy, DeliveryPolicy, Method};

    fn queue_cfg(name: &str) -> QueueConfig {
        QueueConfig {
            name: name.to_string(),
            node: QueueRole::Transfer,
            qtype: QueueType::Normal,
            mode: QueueMode::Push,
            method: Method::Dts,
            port: 3005,
            nthreads: 2,
            keepalive: false,
            auto_purge: true,
            src: "start".to_string(),
            dest: "other".to_string(),
            delivery_dir: String::new(),
            delivery_cmd: String::new(),
            deliver_as: String::new(),
            delivery_policy: DeliveryPolicy::Replace,
            checksum_policy: ChecksumPolicy::Stripe,
            udt_rate: 0,
            interval: None,
            stime: None,
            ceiling: 2,
        }
    }

    #[test]
    fn shutdown_keeps_its_sentinel_value() {
        assert_eq!(QueueState::Shutdown as u8, 90);
        assert_eq!(QueueState::Paused as u8, 0);
        assert_eq!(QueueState::Waiting as u8, 3);
    }

    #[tokio::test]
    async fn work_queue_preserves_completion_order() {
        let q = Queue::new(queue_cfg("sci"), 0);
        q.enqueue_work("a".into());
        q.enqueue_work("b".into());
        q.enqueue_work("c".into());
        assert_eq!(q.next_work().await.unwrap(), std::path::PathBuf::from("a"));
        assert_eq!(q.next_work().await.unwrap(), std::path::PathBuf::from("b"));
        q.requeue_front("b".into());
        assert_eq!(q.next_work().await.unwrap(), std::path::PathBuf::from("b"));
        assert_eq!(q.next_work().await.unwrap(), std::path::PathBuf::from("c"));
    }

    #[tokio::test]
    async fn poke_restores_the_semaphore() {
        let q = Queue::new(queue_cfg("sci"), 0);
        q.enqueue_work("a".into());
        // an admin draining the semaphore without touching the list
        q.count.acquire().await.unwrap().forget();
        assert_eq!(q.count.available_permits(), 0);
        q.poke();
        assert_eq!(q.count.available_permits(), 1);
        // poking again is a no-op
        q.poke();
        assert_eq!(q.count.available_permits(), 1);
    }

    #[test]
    fn begin_incoming_enforces_backpressure() {
        let q = Queue::new(queue_cfg("sci"), 0);
        q.set_state(QueueState::Running);
        // paused queue refuses
        q.set_state(QueueState::Paused);
        let err = q
            .begin_incoming("s1".into(), u64::MAX, 0, 0)
            .unwrap_err();
        assert!(err.starts_with("Error"));
        q.set_state(QueueState::Running);
        // low disk refuses
        let err = q.begin_incoming("s1".into(), 100, 1000, 64).unwrap_err();
        assert!(err.contains("free space"));
        // accepted, then busy until cleared
        q.begin_incoming("s1".into(), u64::MAX, 0, 0).unwrap();
        let err = q.begin_incoming("s2".into(), u64::MAX, 0, 0).unwrap_err();
        assert!(err.contains("busy"));
        q.clear_incoming();
        // ceiling of 2 pending slots
        q.begin_incoming("s2".into(), u64::MAX, 0, 0).unwrap();
        q.clear_incoming();
        let err = q.begin_incoming("s3".into(), u64::MAX, 0, 0).unwrap_err();
        assert!(err.contains("pending limit"));
    }

    #[test]
    fn completed_entries_are_remembered() {
        let q = Queue::new(queue_cfg("sci"), 0);
        q.mark_completed("spool/sci/0000".into());
        assert!(q.was_completed(std::path::Path::new("spool/sci/0000")));
        assert!(!q.was_completed(std::path::Path::new("spool/sci/0001")));
    }
}
