//! Transfer and queue statistics.
//!
//! Throughput conventions, fixed here for every reporting site:
//! MB/s = bytes / 2^20 per second, Mb/s = bits / 1e6 per second.

use serde::{Deserialize, Serialize};

pub const MEGABYTE: f64 = 1048576.0;
pub const MEGABIT: f64 = 1000000.0;

/// Bound on the per-queue and per-node error rings.
pub const MAX_ERROR_MSGS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum XferStatus {
    #[default]
    Ok,
    Err,
    Aborted,
}

/// Which side opens the data connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Direction {
    #[default]
    Push,
    Pull,
}

/// Which end of the data this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EndpointRole {
    #[default]
    Source,
    Sink,
}

/// Per-transfer statistics, returned by the bulk-transfer RPCs and rolled
/// into the queue stats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct XferStat {
    pub direction: Direction,
    pub role: EndpointRole,
    pub base_port: u16,
    pub nthreads: u32,
    pub status: XferStatus,
    pub fsize: u64,
    pub bytes: u64,
    /// Elapsed first-byte to last-byte, seconds.
    pub time_sec: f64,
    /// Megabits per second.
    pub tput_mb: f64,
    /// Megabytes per second.
    pub tput_mbyte: f64,
    pub valid: bool,
}

impl XferStat {
    /// Fill in the throughput fields from a byte count and elapsed time.
    pub fn finish(mut self, bytes: u64, elapsed: std::time::Duration) -> Self {
        self.bytes = bytes;
        self.time_sec = elapsed.as_secs_f64();
        if self.time_sec > 0.0 {
            self.tput_mb = (bytes as f64 * 8.0) / MEGABIT / self.time_sec;
            self.tput_mbyte = bytes as f64 / MEGABYTE / self.time_sec;
        }
        self.valid = true;
        self
    }

    pub fn failed(mut self) -> Self {
        self.status = XferStatus::Err;
        self.valid = true;
        self
    }
}

/// Rolling per-queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct QueueStats {
    /// Average transfer rate, Mb/s.
    pub avg_rate: f64,
    /// Average file size, MB.
    pub avg_size: f64,
    /// Average transfer time, seconds.
    pub avg_time: f64,
    /// Total data moved on this queue, GB.
    pub tot_xfer_gb: f64,
    /// Throughput of the last transfer, Mb/s.
    pub tput_mb: f64,
    pub nfiles: u64,
    pub pending: u64,
    pub canceled: u64,
    pub failed: u64,
    pub flushes: u64,
}

impl QueueStats {
    /// Roll one finished transfer into the moving averages.
    pub fn update(&mut self, xs: &XferStat) {
        if xs.status != XferStatus::Ok {
            self.failed += 1;
            return;
        }
        let n = self.nfiles as f64;
        let size_mb = xs.fsize as f64 / MEGABYTE;
        self.avg_rate = (self.avg_rate * n + xs.tput_mb) / (n + 1.0);
        self.avg_size = (self.avg_size * n + size_mb) / (n + 1.0);
        self.avg_time = (self.avg_time * n + xs.time_sec) / (n + 1.0);
        self.tot_xfer_gb += xs.bytes as f64 / (MEGABYTE * 1024.0);
        self.tput_mb = xs.tput_mb;
        self.nfiles += 1;
    }
}

/// Bounded ring of the most recent error messages.
#[derive(Debug, Default)]
pub struct ErrorRing {
    msgs: std::collections::VecDeque<String>,
}

impl ErrorRing {
    pub fn push(&mut self, msg: impl Into<String>) {
        if self.msgs.len() >= MAX_ERROR_MSGS {
            self.msgs.pop_front();
        }
        self.msgs.push_back(msg.into());
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.msgs.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_definitions() {
        let xs = XferStat::default().finish(MEGABYTE as u64, std::time::Duration::from_secs(1));
        assert!((xs.tput_mbyte - 1.0).abs() < 1e-9);
        assert!((xs.tput_mb - (MEGABYTE * 8.0 / MEGABIT)).abs() < 1e-9);
        assert!(xs.valid);
    }

    #[test]
    fn rolling_average_over_transfers() {
        let mut qs = QueueStats::default();
        for secs in [1u64, 3] {
            let xs = XferStat {
                fsize: 2 * MEGABYTE as u64,
                ..Default::default()
            }
            .finish(2 * MEGABYTE as u64, std::time::Duration::from_secs(secs));
            qs.update(&xs);
        }
        assert_eq!(qs.nfiles, 2);
        assert!((qs.avg_size - 2.0).abs() < 1e-9);
        assert!((qs.avg_time - 2.0).abs() < 1e-9);
        assert!((qs.tot_xfer_gb - 4.0 / 1024.0).abs() < 1e-9);
    }

    #[test]
    fn failed_transfers_do_not_skew_averages() {
        let mut qs = QueueStats::default();
        qs.update(&XferStat::default().failed());
        assert_eq!(qs.nfiles, 0);
        assert_eq!(qs.failed, 1);
    }

    #[test]
    fn error_ring_is_bounded() {
        let mut ring = ErrorRing::default();
        for i in 0..(MAX_ERROR_MSGS + 10) {
            ring.push(format!("err {i}"));
        }
        assert_eq!(ring.len(), MAX_ERROR_MSGS);
        assert_eq!(ring.snapshot()[0], "err 10");
    }
}
