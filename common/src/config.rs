//! Configuration model and parser.
//!
//! The config file is ASCII, one option per line, indentation
//! significant: top-level options are global, a `dts` line opens a node
//! block and a nested `queue` line opens a queue block. Comments run
//! from `#` to end of line.

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QueueRole {
    Ingest,
    Transfer,
    Endpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QueueType {
    Normal,
    Scheduled,
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QueueMode {
    Push,
    Give,
}

/// Bulk transfer method; `Udt` is the rate-capped single-stripe method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Method {
    Dts,
    Udt,
}

/// What to do when the delivered name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum DeliveryPolicy {
    #[default]
    Replace,
    Number,
    Original,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ChecksumPolicy {
    None,
    Packet,
    Chunk,
    #[default]
    Stripe,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    pub node: QueueRole,
    pub qtype: QueueType,
    pub mode: QueueMode,
    pub method: Method,
    /// Base bulk transfer port.
    pub port: u16,
    pub nthreads: u32,
    pub keepalive: bool,
    pub auto_purge: bool,
    /// Upstream peer name, or the literal "start" for ingest queues.
    pub src: String,
    /// Downstream peer name, or the literal "end" for endpoint queues.
    pub dest: String,
    pub delivery_dir: String,
    pub delivery_cmd: String,
    pub deliver_as: String,
    pub delivery_policy: DeliveryPolicy,
    pub checksum_policy: ChecksumPolicy,
    /// Rate cap in Mbps for the udt method.
    pub udt_rate: u32,
    /// Interval for scheduled queues (seconds).
    pub interval: Option<u64>,
    /// Start time offset for scheduled queues (seconds since midnight).
    pub stime: Option<u64>,
    /// Pending-count ceiling for incoming transfers, 0 = unlimited.
    pub ceiling: u64,
}

impl QueueConfig {
    fn new(name_hint: &str) -> Self {
        Self {
            name: name_hint.to_string(),
            node: QueueRole::Transfer,
            qtype: QueueType::Normal,
            mode: QueueMode::Push,
            method: Method::Dts,
            port: 0,
            nthreads: 1,
            keepalive: false,
            auto_purge: false,
            src: String::new(),
            dest: String::new(),
            delivery_dir: String::new(),
            delivery_cmd: String::new(),
            deliver_as: String::new(),
            delivery_policy: DeliveryPolicy::default(),
            checksum_policy: ChecksumPolicy::default(),
            udt_rate: 0,
            interval: None,
            stime: None,
            ceiling: 0,
        }
    }

    fn validate(mut self) -> Result<Self> {
        if self.name.is_empty() {
            return Err(anyhow!("queue block missing 'name'"));
        }
        if self.port == 0 {
            return Err(anyhow!("queue '{}' missing 'port'", self.name));
        }
        // src=="start" <=> ingest, dest=="end" <=> endpoint
        match self.node {
            QueueRole::Ingest => {
                if self.src.is_empty() {
                    self.src = "start".to_string();
                } else if self.src != "start" {
                    return Err(anyhow!("ingest queue '{}' has src '{}'", self.name, self.src));
                }
            }
            _ => {
                if self.src == "start" {
                    return Err(anyhow!(
                        "queue '{}' has src 'start' but is not an ingest queue",
                        self.name
                    ));
                }
            }
        }
        match self.node {
            QueueRole::Endpoint => {
                if self.dest.is_empty() {
                    self.dest = "end".to_string();
                } else if self.dest != "end" {
                    return Err(anyhow!(
                        "endpoint queue '{}' has dest '{}'",
                        self.name,
                        self.dest
                    ));
                }
            }
            _ => {
                if self.dest.is_empty() || self.dest == "end" {
                    return Err(anyhow!(
                        "queue '{}' needs a downstream 'dest' peer",
                        self.name
                    ));
                }
            }
        }
        // the rate-capped method runs one stripe per file
        if self.method == Method::Udt {
            self.nthreads = 1;
        }
        if self.nthreads == 0 {
            self.nthreads = 1;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub root: std::path::PathBuf,
    pub lo_port: u16,
    pub hi_port: u16,
    pub contact: u16,
    pub network: String,
    pub dbfile: Option<std::path::PathBuf>,
    pub logfile: Option<std::path::PathBuf>,
    pub monitor: Option<String>,
    pub passwd: String,
    pub ops_pass: String,
    /// Free-space floor for accepting new transfers, bytes.
    pub min_free: u64,
    pub queues: Vec<QueueConfig>,
}

impl NodeConfig {
    fn new() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: 3000,
            root: std::path::PathBuf::new(),
            lo_port: 3005,
            hi_port: 3099,
            contact: 3001,
            network: String::new(),
            dbfile: None,
            logfile: None,
            monitor: None,
            passwd: String::new(),
            ops_pass: String::new(),
            min_free: 64 << 20,
            queues: Vec::new(),
        }
    }

    fn validate(self) -> Result<Self> {
        if self.name.is_empty() {
            return Err(anyhow!("dts block missing 'name'"));
        }
        if self.host.is_empty() {
            return Err(anyhow!("dts '{}' missing 'host'", self.name));
        }
        if self.root.as_os_str().is_empty() {
            return Err(anyhow!("dts '{}' missing 'root'", self.name));
        }
        if self.lo_port > self.hi_port {
            return Err(anyhow!(
                "dts '{}' has loPort {} > hiPort {}",
                self.name,
                self.lo_port,
                self.hi_port
            ));
        }
        Ok(self)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }
}

/// A parsed configuration: global options plus one or more node blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DtsConfig {
    pub verbose: u8,
    pub debug: u8,
    pub monitor: Option<String>,
    pub nodes: Vec<NodeConfig>,
}

impl DtsConfig {
    pub fn node_named(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_for_host(&self, host: &str) -> Option<&NodeConfig> {
        self.nodes
            .iter()
            .find(|n| n.host == host || n.host.split('.').next() == Some(host))
    }

    /// All nodes other than `name`, as the peer table.
    pub fn peers_of(&self, name: &str) -> Vec<&NodeConfig> {
        self.nodes.iter().filter(|n| n.name != name).collect()
    }

    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read config file {path:?}"))?;
        Self::parse(&text).with_context(|| format!("in config file {path:?}"))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg = DtsConfig::default();
        let mut node: Option<(usize, NodeConfig)> = None;
        let mut queue: Option<(usize, QueueConfig)> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(idx) => &raw[..idx],
                None => raw,
            };
            if line.trim().is_empty() {
                continue;
            }
            let indent = indent_width(line);
            let mut words = line.split_whitespace();
            let key = words.next().unwrap();
            let value = line[line.find(key).unwrap() + key.len()..].trim();
            let err_ctx = |what: &str| format!("line {}: {}", lineno + 1, what);

            // close blocks the indentation has stepped out of
            let close_queue =
                matches!(queue.as_ref(), Some((qi, _)) if indent <= *qi) && key != "queue";
            if close_queue {
                let (_, q) = queue.take().unwrap();
                let n = node
                    .as_mut()
                    .map(|(_, n)| n)
                    .ok_or_else(|| anyhow!(err_ctx("queue outside dts block")))?;
                n.queues.push(q.validate().context(err_ctx("invalid queue"))?);
            }
            let close_node =
                matches!(node.as_ref(), Some((ni, _)) if indent <= *ni) && key != "dts";
            if close_node {
                let (_, n) = node.take().unwrap();
                cfg.nodes.push(n.validate().context(err_ctx("invalid dts block"))?);
            }

            match key {
                "dts" => {
                    if let Some((_, mut n)) = node.take() {
                        if let Some((_, q)) = queue.take() {
                            n.queues.push(q.validate().context(err_ctx("invalid queue"))?);
                        }
                        cfg.nodes.push(n.validate().context(err_ctx("invalid dts block"))?);
                    }
                    node = Some((indent, NodeConfig::new()));
                }
                "queue" => {
                    let n = node
                        .as_mut()
                        .map(|(_, n)| n)
                        .ok_or_else(|| anyhow!(err_ctx("queue outside dts block")))?;
                    if let Some((_, q)) = queue.take() {
                        n.queues.push(q.validate().context(err_ctx("invalid queue"))?);
                    }
                    queue = Some((indent, QueueConfig::new("")));
                }
                _ if queue.is_some() => {
                    let (_, q) = queue.as_mut().unwrap();
                    parse_queue_key(q, key, value).context(err_ctx("bad queue option"))?;
                }
                _ if node.is_some() => {
                    let (_, n) = node.as_mut().unwrap();
                    parse_node_key(n, key, value).context(err_ctx("bad dts option"))?;
                }
                "verbose" => cfg.verbose = parse_level(value)?,
                "debug" => cfg.debug = parse_level(value)?,
                "monitor" => cfg.monitor = Some(value.to_string()),
                _ => return Err(anyhow!(err_ctx(&format!("unknown global option '{key}'")))),
            }
        }
        if let Some((_, q)) = queue.take() {
            let n = node
                .as_mut()
                .map(|(_, n)| n)
                .ok_or_else(|| anyhow!("queue outside dts block"))?;
            n.queues.push(q.validate()?);
        }
        if let Some((_, n)) = node.take() {
            cfg.nodes.push(n.validate()?);
        }
        Ok(cfg)
    }
}

fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width += 8 - width % 8,
            _ => break,
        }
    }
    width
}

fn parse_level(value: &str) -> Result<u8> {
    match value {
        "" | "yes" | "true" => Ok(1),
        "no" | "false" => Ok(0),
        v => v.parse().with_context(|| format!("bad level '{v}'")),
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "yes" | "true" | "1" | "" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        v => Err(anyhow!("bad boolean '{v}'")),
    }
}

fn parse_node_key(n: &mut NodeConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "name" => n.name = value.to_string(),
        "host" => n.host = value.to_string(),
        "port" => n.port = value.parse().context("bad port")?,
        "root" => n.root = value.into(),
        "loPort" => n.lo_port = value.parse().context("bad loPort")?,
        "hiPort" => n.hi_port = value.parse().context("bad hiPort")?,
        "contact" => n.contact = value.parse().context("bad contact port")?,
        "network" => n.network = value.to_string(),
        "dbfile" => n.dbfile = Some(value.into()),
        "logfile" => n.logfile = Some(value.into()),
        "monitor" => n.monitor = Some(value.to_string()),
        "passwd" => n.passwd = value.to_string(),
        "opsPass" => n.ops_pass = value.to_string(),
        "minFree" => n.min_free = value.parse().context("bad minFree")?,
        _ => return Err(anyhow!("unknown dts option '{key}'")),
    }
    Ok(())
}

fn parse_queue_key(q: &mut QueueConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "name" => q.name = value.to_string(),
        "node" => {
            q.node = match value {
                "ingest" => QueueRole::Ingest,
                "transfer" => QueueRole::Transfer,
                "endpoint" => QueueRole::Endpoint,
                v => return Err(anyhow!("unknown queue node '{v}'")),
            }
        }
        "type" => {
            q.qtype = match value {
                "normal" => QueueType::Normal,
                "scheduled" => QueueType::Scheduled,
                "priority" => QueueType::Priority,
                v => return Err(anyhow!("unknown queue type '{v}'")),
            }
        }
        "mode" => {
            q.mode = match value {
                "push" => QueueMode::Push,
                "give" => QueueMode::Give,
                v => return Err(anyhow!("unknown queue mode '{v}'")),
            }
        }
        "method" => {
            q.method = match value {
                "dts" => Method::Dts,
                "udt" => Method::Udt,
                v => return Err(anyhow!("unknown queue method '{v}'")),
            }
        }
        "port" => q.port = value.parse().context("bad port")?,
        "nthreads" => q.nthreads = value.parse().context("bad nthreads")?,
        "keepalive" => q.keepalive = parse_bool(value)?,
        "purge" => q.auto_purge = parse_bool(value)?,
        "src" => q.src = value.to_string(),
        "dest" => q.dest = value.to_string(),
        "deliveryDir" => q.delivery_dir = value.to_string(),
        "deliveryCmd" => q.delivery_cmd = value.to_string(),
        "deliverAs" => q.deliver_as = value.to_string(),
        "deliveryPolicy" => {
            q.delivery_policy = match value {
                "replace" => DeliveryPolicy::Replace,
                "number" => DeliveryPolicy::Number,
                "original" => DeliveryPolicy::Original,
                v => return Err(anyhow!("unknown delivery policy '{v}'")),
            }
        }
        "checksumPolicy" => {
            q.checksum_policy = match value {
                "none" => ChecksumPolicy::None,
                "packet" => ChecksumPolicy::Packet,
                "chunk" => ChecksumPolicy::Chunk,
                "stripe" => ChecksumPolicy::Stripe,
                v => return Err(anyhow!("unknown checksum policy '{v}'")),
            }
        }
        "udt_rate" => q.udt_rate = value.parse().context("bad udt_rate")?,
        "interval" => q.interval = Some(value.parse().context("bad interval")?),
        "stime" => q.stime = Some(value.parse().context("bad stime")?),
        "ceiling" => q.ceiling = value.parse().context("bad ceiling")?,
        _ => return Err(anyhow!("unknown queue option '{key}'")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
#
#  Two-node test deployment
#

verbose   1
debug     0

dts
    name      dts-ct
    host      dtsct1.example.org
    port      3000
    loPort    3005
    hiPort    3100
    root      /decam/dts/DTS/
    contact   3001
    network   des
    logfile   /decam/dts/DTS/dts.log

    queue \t\t\t\t# entry point from domes
\tname\t      \tsci\t\t# queue name
        node          \tingest\t\t# ingest, transfer, or endpoint
        type          \tnormal\t\t# normal, scheduled, priority
\tmode\t        give\t\t# push or give
\tmethod        \tdts
\tnthreads      \t10
        port\t      \t3005\t\t# base transfer port
        keepalive\tyes
        purge   \tyes
        dest            dts-ls
\tdeliveryDir   \tspool
        deliveryCmd     /decam/dts/istbproc $obsepoch $caldate $FULL $OH $account $D

dts
    name      dts-ls
    host      dsas3.example.org
    port      3000
    root      /data2/dts/DTS/

    queue
\tname\t      \tsci
        node          \tendpoint
        type          \tnormal
\tmode\t        push
\tmethod        \tudt
\tudt_rate      \t800
\tnthreads      \t4
        port\t      \t3005
        src             dts-ct
\tdeliveryDir   \t/data2/archive
";

    #[test]
    fn parses_nested_blocks() {
        let cfg = DtsConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.verbose, 1);
        assert_eq!(cfg.nodes.len(), 2);
        let ct = cfg.node_named("dts-ct").unwrap();
        assert_eq!(ct.host, "dtsct1.example.org");
        assert_eq!(ct.lo_port, 3005);
        assert_eq!(ct.hi_port, 3100);
        assert_eq!(ct.queues.len(), 1);
        let q = &ct.queues[0];
        assert_eq!(q.name, "sci");
        assert_eq!(q.node, QueueRole::Ingest);
        assert_eq!(q.mode, QueueMode::Give);
        assert_eq!(q.nthreads, 10);
        assert!(q.keepalive);
        assert!(q.auto_purge);
        assert_eq!(q.dest, "dts-ls");
        assert!(q.delivery_cmd.contains("$obsepoch"));
        // ingest src defaults to the literal "start"
        assert_eq!(q.src, "start");
    }

    #[test]
    fn endpoint_and_udt_invariants() {
        let cfg = DtsConfig::parse(SAMPLE).unwrap();
        let ls = cfg.node_named("dts-ls").unwrap();
        let q = &ls.queues[0];
        assert_eq!(q.node, QueueRole::Endpoint);
        assert_eq!(q.dest, "end");
        assert_eq!(q.src, "dts-ct");
        // udt forces a single stripe
        assert_eq!(q.method, Method::Udt);
        assert_eq!(q.nthreads, 1);
        assert_eq!(q.udt_rate, 800);
    }

    #[test]
    fn transfer_queue_requires_dest() {
        let text = "\
dts
    name  n1
    host  h1
    root  /r
    queue
        name    q1
        node    transfer
        type    normal
        mode    push
        method  dts
        port    3005
";
        assert!(DtsConfig::parse(text).is_err());
    }

    #[test]
    fn ingest_with_foreign_src_is_rejected() {
        let text = "\
dts
    name  n1
    host  h1
    root  /r
    queue
        name    q1
        node    ingest
        type    normal
        mode    push
        method  dts
        port    3005
        src     other
        dest    n2
";
        assert!(DtsConfig::parse(text).is_err());
    }

    #[test]
    fn peers_excludes_self() {
        let cfg = DtsConfig::parse(SAMPLE).unwrap();
        let peers = cfg.peers_of("dts-ct");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "dts-ls");
    }
}
