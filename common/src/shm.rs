//! Cross-process statistics page.
//!
//! A mapped shared-memory segment holding one record per queue so
//! out-of-process monitors see live progress without polling the daemon.
//! Every field is atomic; writers are one-queue-per-task so no lock is
//! needed and readers see eventually-consistent values.

use anyhow::{anyhow, Context, Result};
use shared_memory::{Shmem, ShmemConf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Fixed queue-slot count; keeps the segment size static across
/// cooperating processes.
pub const MAX_SHM_QUEUES: usize = 16;
pub const SHM_MSG_LINES: usize = 40;
pub const SHM_MSG_LEN: usize = 256;
pub const SHM_NAME_LEN: usize = 256;

const SHM_MAGIC: u64 = 0x4454_5353_5441_5401; // "DTSSTAT" + version

/// Transfer phase tracked separately in the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Net,
    Disk,
    Dlvr,
}

#[repr(C)]
pub struct PhaseSlot {
    pub start_us: AtomicU64,
    pub end_us: AtomicU64,
    /// Rate in Mb/s, stored as f32 bits.
    pub rate_bits: AtomicU32,
    /// 0 = unknown, 1 = OK, 2 = ERR.
    pub stat: AtomicU32,
}

impl PhaseSlot {
    pub fn rate(&self) -> f32 {
        f32::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }
}

#[repr(C)]
pub struct ShmQueueRecord {
    pub num_flushes: AtomicU32,
    pub canceled_xfers: AtomicU32,
    pub failed_xfers: AtomicU32,
    pub nerrs: AtomicU32,

    pub xfer_size: AtomicU64,
    pub xfer: PhaseSlot,
    pub net: PhaseSlot,
    pub disk: PhaseSlot,
    pub dlvr: PhaseSlot,

    pub msg_line: AtomicU32,
    qname: [AtomicU8; SHM_NAME_LEN],
    infile: [AtomicU8; SHM_NAME_LEN],
    outfile: [AtomicU8; SHM_NAME_LEN],
    msgs: [[AtomicU8; SHM_MSG_LEN]; SHM_MSG_LINES],
}

fn store_str(dst: &[AtomicU8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len() - 1);
    for (i, slot) in dst.iter().enumerate() {
        let b = if i < n { bytes[i] } else { 0 };
        slot.store(b, Ordering::Relaxed);
    }
}

fn load_str(src: &[AtomicU8]) -> String {
    let mut out = Vec::with_capacity(src.len());
    for slot in src {
        let b = slot.load(Ordering::Relaxed);
        if b == 0 {
            break;
        }
        out.push(b);
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl ShmQueueRecord {
    pub fn set_qname(&self, name: &str) {
        store_str(&self.qname, name);
    }

    pub fn qname(&self) -> String {
        load_str(&self.qname)
    }

    pub fn set_infile(&self, name: &str) {
        store_str(&self.infile, name);
    }

    pub fn infile(&self) -> String {
        load_str(&self.infile)
    }

    pub fn set_outfile(&self, name: &str) {
        store_str(&self.outfile, name);
    }

    pub fn outfile(&self) -> String {
        load_str(&self.outfile)
    }

    pub fn set_xfer_size(&self, size: u64) {
        self.xfer_size.store(size, Ordering::Relaxed);
    }

    fn slot(&self, phase: Phase) -> &PhaseSlot {
        match phase {
            Phase::Net => &self.net,
            Phase::Disk => &self.disk,
            Phase::Dlvr => &self.dlvr,
        }
    }

    pub fn phase_start(&self, phase: Phase) {
        let slot = self.slot(phase);
        slot.start_us.store(now_us(), Ordering::Relaxed);
        slot.end_us.store(0, Ordering::Relaxed);
        slot.stat.store(0, Ordering::Relaxed);
    }

    pub fn phase_end(&self, phase: Phase, ok: bool, rate_mb: f32) {
        let slot = self.slot(phase);
        slot.end_us.store(now_us(), Ordering::Relaxed);
        slot.rate_bits.store(rate_mb.to_bits(), Ordering::Relaxed);
        slot.stat.store(if ok { 1 } else { 2 }, Ordering::Relaxed);
    }

    pub fn xfer_start(&self) {
        self.xfer.start_us.store(now_us(), Ordering::Relaxed);
        self.xfer.end_us.store(0, Ordering::Relaxed);
        self.xfer.stat.store(0, Ordering::Relaxed);
    }

    pub fn xfer_end(&self, ok: bool, rate_mb: f32) {
        self.xfer.end_us.store(now_us(), Ordering::Relaxed);
        self.xfer.rate_bits.store(rate_mb.to_bits(), Ordering::Relaxed);
        self.xfer.stat.store(if ok { 1 } else { 2 }, Ordering::Relaxed);
        if !ok {
            self.failed_xfers.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Append a log line to the bounded message ring.
    pub fn push_msg(&self, line: &str) {
        let idx = self.msg_line.fetch_add(1, Ordering::Relaxed) as usize % SHM_MSG_LINES;
        store_str(&self.msgs[idx], line);
    }

    pub fn msg(&self, idx: usize) -> String {
        load_str(&self.msgs[idx % SHM_MSG_LINES])
    }
}

#[repr(C)]
struct ShmHeader {
    magic: AtomicU64,
    nqueues: AtomicU32,
    _pad: AtomicU32,
    records: [ShmQueueRecord; MAX_SHM_QUEUES],
}

/// Handle on the shared statistics segment.
pub struct StatsPage {
    _shmem: Shmem,
    header: *const ShmHeader,
}

// one writer per queue slot, all fields atomic
unsafe impl Send for StatsPage {}
unsafe impl Sync for StatsPage {}

impl StatsPage {
    fn segment_size() -> usize {
        std::mem::size_of::<ShmHeader>()
    }

    /// Create (or re-create) the segment for a daemon with `nqueues`
    /// queues.
    pub fn create(os_id: &str, nqueues: usize) -> Result<Self> {
        if nqueues > MAX_SHM_QUEUES {
            return Err(anyhow!(
                "too many queues for the stats page: {nqueues} > {MAX_SHM_QUEUES}"
            ));
        }
        let shmem = match ShmemConf::new()
            .size(Self::segment_size())
            .os_id(os_id)
            .create()
        {
            Ok(m) => m,
            Err(shared_memory::ShmemError::LinkExists)
            | Err(shared_memory::ShmemError::MappingIdExists) => {
                // a previous daemon left the segment behind; reuse it
                ShmemConf::new()
                    .os_id(os_id)
                    .open()
                    .with_context(|| format!("cannot reopen stats segment '{os_id}'"))?
            }
            Err(e) => return Err(anyhow!("cannot create stats segment '{os_id}': {e}")),
        };
        let header = shmem.as_ptr() as *mut ShmHeader;
        unsafe {
            std::ptr::write_bytes(shmem.as_ptr(), 0, Self::segment_size());
            (*header).nqueues.store(nqueues as u32, Ordering::Relaxed);
            (*header).magic.store(SHM_MAGIC, Ordering::Release);
        }
        Ok(Self {
            _shmem: shmem,
            header,
        })
    }

    /// Open an existing segment as an observer.
    pub fn open(os_id: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .os_id(os_id)
            .open()
            .with_context(|| format!("cannot open stats segment '{os_id}'"))?;
        if shmem.len() < Self::segment_size() {
            return Err(anyhow!("stats segment '{os_id}' is too small"));
        }
        let header = shmem.as_ptr() as *const ShmHeader;
        let magic = unsafe { (*header).magic.load(Ordering::Acquire) };
        if magic != SHM_MAGIC {
            return Err(anyhow!("stats segment '{os_id}' has bad magic {magic:#x}"));
        }
        Ok(Self {
            _shmem: shmem,
            header,
        })
    }

    pub fn nqueues(&self) -> usize {
        unsafe { (*self.header).nqueues.load(Ordering::Relaxed) as usize }
    }

    pub fn queue(&self, idx: usize) -> &ShmQueueRecord {
        assert!(idx < MAX_SHM_QUEUES);
        unsafe { &(*self.header).records[idx] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_id(tag: &str) -> String {
        format!("dts_test_{}_{}", tag, std::process::id())
    }

    #[test]
    fn create_write_open_read() -> Result<()> {
        let id = unique_id("rw");
        let page = StatsPage::create(&id, 2)?;
        let rec = page.queue(0);
        rec.set_qname("sci");
        rec.set_infile("obs001.fits");
        rec.set_xfer_size(16 << 20);
        rec.phase_start(Phase::Net);
        rec.phase_end(Phase::Net, true, 800.0);
        rec.push_msg("transfer complete");

        let observer = StatsPage::open(&id)?;
        assert_eq!(observer.nqueues(), 2);
        let seen = observer.queue(0);
        assert_eq!(seen.qname(), "sci");
        assert_eq!(seen.infile(), "obs001.fits");
        assert_eq!(seen.xfer_size.load(Ordering::Relaxed), 16 << 20);
        assert_eq!(seen.net.stat.load(Ordering::Relaxed), 1);
        assert!((seen.net.rate() - 800.0).abs() < f32::EPSILON);
        assert_eq!(seen.msg(0), "transfer complete");
        Ok(())
    }

    #[test]
    fn message_ring_wraps() -> Result<()> {
        let id = unique_id("ring");
        let page = StatsPage::create(&id, 1)?;
        let rec = page.queue(0);
        for i in 0..(SHM_MSG_LINES + 5) {
            rec.push_msg(&format!("line {i}"));
        }
        // the ring wrapped; slot 0 now holds line SHM_MSG_LINES
        assert_eq!(rec.msg(0), format!("line {SHM_MSG_LINES}"));
        Ok(())
    }

    #[test]
    fn too_many_queues_is_rejected() {
        let id = unique_id("cap");
        assert!(StatsPage::create(&id, MAX_SHM_QUEUES + 1).is_err());
    }
}
