//! Control protocol definitions for node-to-node and client-to-node
//! communication.
//!
//! # Message Flow
//!
//! Every RPC is one request frame answered by one response frame on a
//! fresh connection to the daemon command port. A file moves between two
//! adjacent nodes in four round trips, the upstream side initiating:
//!
//! ```text
//! Upstream                              Downstream
//!   |  ---- InitTransfer(q, size) ----->  |  reserve spool/<q>/NNNN/
//!   |  <--- "spool/<q>/NNNN" -----------  |  (or an "Error ..." string)
//!   |                                     |
//!   |  ~~~~ bulk stripes (xfer) ~~~~~~~>  |  write payload
//!   |                                     |
//!   |  ---- QueueSetControl(path, C) -->  |  write _control
//!   |  <--- Ok -------------------------  |
//!   |                                     |
//!   |  ---- EndTransfer(q, path) ------>  |  revalidate, enqueue
//!   |  <--- "OK" -----------------------  |  (or "ERR ...")
//! ```
//!
//! # Error Communication
//!
//! Handlers never panic across the wire: protocol failures come back as
//! [`Response::Error`], except the handshake verbs which keep the legacy
//! `Error ...` string discipline so upstream nodes can log the reply
//! verbatim into their recovery records.

use serde::{Deserialize, Serialize};

pub use common::config::{ChecksumPolicy, Method};
pub use common::control::ControlRecord;
pub use common::stats::{Direction, EndpointRole, QueueStats, XferStat, XferStatus};

/// How a bulk endpoint obtains its data connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnMode {
    /// Bind the bulk ports and wait for the peer.
    Listen,
    /// Open connections to the peer's bulk ports.
    Connect,
}

/// Stat result for the low-level `stat`/`statVal` verbs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub is_dir: bool,
    pub is_link: bool,
}

/// Checksums of one file, as returned by the `checksum` verb.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChecksumReply {
    pub md5: String,
    pub sum32: u32,
    pub crc32: u32,
}

/// Node status summary returned by `nodeStat`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatReply {
    pub name: String,
    pub host: String,
    pub root: String,
    pub uptime_sec: u64,
    pub nqueues: u32,
    pub queues: Vec<QueueStatReply>,
    /// Most recent error messages, newest last.
    pub errs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatReply {
    pub name: String,
    pub state: String,
    pub pending: u64,
    pub infile: String,
    pub outfile: String,
    pub stats: QueueStats,
}

/// Parameters for the bulk-transport verbs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XferArgs {
    /// Sandbox-relative path of the payload.
    pub path: String,
    pub fsize: u64,
    pub nthreads: u32,
    pub base_port: u16,
    /// Peer to connect to; unused when `mode` is `Listen`.
    pub peer_host: String,
    pub mode: ConnMode,
    pub method: Method,
    pub checksum_policy: ChecksumPolicy,
    /// Mbps cap for the udt method, 0 = uncapped.
    pub rate_mbps: u32,
}

/// One RPC request. Verb names follow the daemon's dispatch table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    // administration
    InitDts,
    ShutdownDts { graceful: bool, passwd: String },
    Abort { passwd: String },
    Cfg,
    DtsList,
    DtsSet { key: String, value: String },
    DtsGet { key: String },
    SubmitLogs { qname: String, log: String, recover: String },
    GetQLog { qname: String },
    EraseQLog { qname: String },
    NodeStat,

    // queue control
    StartQueue { qname: String },
    PauseQueue { qname: String },
    FlushQueue { qname: String },
    RestartQueue { qname: String },
    ShutdownQueue { qname: String },
    PokeQueue { qname: String },
    ListQueue { qname: String },
    AddToQueue { qname: String, path: String },
    RemoveFromQueue { qname: String, slot: u32 },
    GetQueueStat { qname: String },
    SetQueueStat { qname: String, stats: QueueStats },
    GetQueueCount { qname: String },
    SetQueueCount { qname: String, count: u64 },
    GetQueueDir { qname: String },
    SetQueueDir { qname: String, dir: String },
    GetQueueCmd { qname: String },
    SetQueueCmd { qname: String, cmd: String },
    GetCopyDir,
    ExecCmd { cmd: String },
    PrintQueueCfg { qname: String },

    // transfer handshake
    InitTransfer { qname: String, size: u64 },
    DoTransfer { qname: String, qpath: String },
    EndTransfer { qname: String, qpath: String },
    CancelTransfer { qname: String },
    QueueAccept { qname: String, fname: String, size: u64 },
    QueueComplete { qname: String, qpath: String },
    QueueRelease { qname: String },
    QueueValid { qname: String },
    // boxed: the control record dwarfs every other variant
    QueueSetControl { qpath: String, ctrl: Box<ControlRecord> },
    QueueDest { qname: String },
    QueueSrc { qname: String },
    QueueUpdateStats { qname: String, stat: XferStat },

    // sandboxed file utilities
    Access { path: String, mode: i32 },
    Cat { path: String },
    Checksum { path: String },
    Copy { src: String, dst: String },
    Cwd,
    IsDir { path: String },
    Chmod { path: String, mode: u32 },
    Del { path: String, recursive: bool },
    Dir { path: String, long: bool },
    DestDir { qname: String },
    DiskUsed { path: String },
    DiskFree { path: String },
    Echo { text: String },
    Fsize { path: String },
    Fmode { path: String },
    Ftime { path: String },
    Mkdir { path: String },
    Ping,
    PingSleep { sec: u64 },
    PingStr { text: String },
    PingArray,
    RemotePing { host: String, port: u16 },
    Rename { old: String, new: String },
    SetRoot { path: String, passwd: String },
    SetDbg { flag: String },
    Touch { path: String },

    // low-level i/o
    Read { path: String, offset: u64, size: u64 },
    Write { path: String, offset: u64, data: Vec<u8> },
    Prealloc { path: String, size: u64 },
    Stat { path: String },
    StatVal { path: String, field: String },

    // bulk transport
    XferPushFile { path: String, dest: String, nthreads: u32, port: u16 },
    XferPullFile { path: String, src: String, fsize: u64, nthreads: u32, port: u16 },
    SendFile { args: XferArgs },
    ReceiveFile { args: XferArgs },

    // monitor
    Monitor { url: String },
    Console { url: String, passwd: String },
    Detach,
}

/// One RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Str(String),
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<String>),
    Stat(FileStat),
    Checksums(ChecksumReply),
    Xfer(XferStat),
    QueueStats(QueueStats),
    Node(NodeStatReply),
    Error(String),
}

impl Response {
    /// The handshake verbs report failure as a string beginning with
    /// `Error`.
    pub fn is_error(&self) -> bool {
        match self {
            Response::Error(_) => true,
            Response::Str(s) => s.starts_with("Error"),
            _ => false,
        }
    }

    pub fn into_string(self) -> anyhow::Result<String> {
        match self {
            Response::Str(s) => Ok(s),
            Response::Error(e) => Err(anyhow::anyhow!(e)),
            other => Err(anyhow::anyhow!("unexpected response {other:?}")),
        }
    }

    pub fn into_int(self) -> anyhow::Result<i64> {
        match self {
            Response::Int(n) => Ok(n),
            Response::Error(e) => Err(anyhow::anyhow!(e)),
            other => Err(anyhow::anyhow!("unexpected response {other:?}")),
        }
    }
}

/// Stripe preamble exchanged on every data connection before payload.
///
/// The initiating side generates the cookie; the passive side echoes it so
/// both ends know they are wired to the matching stripe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StripeHeader {
    pub file_size: u64,
    pub offset: u64,
    pub length: u64,
    pub cookie: u16,
    /// Expected stripe checksum under the chunk/stripe policies.
    pub expect_sum: Option<u32>,
}

/// Closing exchange on every stripe: observed checksum and byte count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StripeTrailer {
    pub sum: u32,
    pub bytes: u64,
    pub ok: bool,
}

/// Per-packet framing under the packet checksum policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub len: u32,
    pub sum16: u16,
}

/// Event forwarded to an attached monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MonitorEvent {
    Log { host: String, line: String },
    Stat { qname: String, stat: XferStat },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_through_bincode() {
        let reqs = [
            Request::InitTransfer {
                qname: "sci".to_string(),
                size: 1 << 24,
            },
            Request::QueueSetControl {
                qpath: "spool/sci/0000".to_string(),
                ctrl: Box::default(),
            },
            Request::Read {
                path: "copy/x".to_string(),
                offset: 512,
                size: 4096,
            },
            Request::ReceiveFile {
                args: XferArgs {
                    path: "spool/sci/0000/f".to_string(),
                    fsize: 123,
                    nthreads: 4,
                    base_port: 3005,
                    peer_host: "dts-ct".to_string(),
                    mode: ConnMode::Connect,
                    method: Method::Dts,
                    checksum_policy: ChecksumPolicy::Stripe,
                    rate_mbps: 0,
                },
            },
        ];
        for req in reqs {
            let bytes = bincode::serialize(&req).unwrap();
            let back: Request = bincode::deserialize(&bytes).unwrap();
            assert_eq!(req, back);
        }
    }

    #[test]
    fn error_string_discipline() {
        assert!(Response::Str("Error: queue paused".to_string()).is_error());
        assert!(Response::Error("no such queue".to_string()).is_error());
        assert!(!Response::Str("spool/sci/0001".to_string()).is_error());
        assert!(!Response::Ok.is_error());
    }
}
