use anyhow::{anyhow, Result};
use clap::Parser;

use dts_tools_dts::client::QueueClient;
use dts_tools_dts::recover::{RecoverEntry, RecoveryLog};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dtsq",
    version,
    about = "Submit files to a DTS queue",
    long_about = "`dtsq` submits files to the ingest queue of a DTS node and keeps a \
local recovery record of every submission that could not be completed. Failed \
submissions are replayed with --recover; entries from other hosts are skipped \
unless --all-hosts is given.\n\nArguments containing '=' are passed to the \
pipeline as control-record parameters (e.g. account=des)."
)]
struct Args {
    /// Files to submit; key=value arguments become control parameters
    #[arg(value_name = "FILE|KEY=VALUE")]
    items: Vec<String>,

    /// Destination queue name
    #[arg(short = 'q', long = "queue", value_name = "QUEUE")]
    queue: Option<String>,

    /// DTS daemon host (falls back to the DTSQ_CONFIG file, then localhost)
    #[arg(short = 'H', long, value_name = "HOST")]
    host: Option<String>,

    /// DTS daemon command port
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    // Transfer options
    /// Stripe count for the bulk transfer
    #[arg(
        short = 't',
        long,
        default_value = "4",
        value_name = "N",
        help_heading = "Transfer options"
    )]
    nthreads: u32,

    /// Preferred base bulk port on the daemon
    #[arg(
        short = 'b',
        long,
        default_value = "3005",
        value_name = "PORT",
        help_heading = "Transfer options"
    )]
    base_port: u16,

    // Recovery
    /// Replay the pending entries of the recovery file
    #[arg(short = 'R', long, help_heading = "Recovery")]
    recover: bool,

    /// List the pending entries of the recovery file and exit
    #[arg(short = 'L', long = "list-recover", help_heading = "Recovery")]
    list_recover: bool,

    /// Also replay entries recorded on other hosts
    #[arg(short = 'a', long = "all-hosts", help_heading = "Recovery")]
    all_hosts: bool,

    // Progress & output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(long, help_heading = "Progress & output")]
    quiet: bool,
}

/// Defaults read from the file named by DTSQ_CONFIG: `key value` lines
/// for host, port, queue and nthreads.
#[derive(Debug, Default)]
struct QConfig {
    host: Option<String>,
    port: Option<u16>,
    queue: Option<String>,
    nthreads: Option<u32>,
}

fn load_qconfig() -> QConfig {
    let mut qc = QConfig::default();
    let Some(path) = std::env::var_os("DTSQ_CONFIG") else {
        return qc;
    };
    let Ok(text) = std::fs::read_to_string(&path) else {
        return qc;
    };
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let value = value.trim();
        match key {
            "host" => qc.host = Some(value.to_string()),
            "port" => qc.port = value.parse().ok(),
            "queue" => qc.queue = Some(value.to_string()),
            "nthreads" => qc.nthreads = value.parse().ok(),
            _ => {}
        }
    }
    qc
}

/// The flag set recorded with a recovery entry, so a replay reproduces
/// the original submission exactly.
fn flags_of(args: &Args, host: &str, port: u16, queue: &str, params: &[(String, String)]) -> String {
    let mut flags = format!("-q {queue} -H {host} -p {port} -t {}", args.nthreads);
    for (k, v) in params {
        flags.push_str(&format!(" {k}={v}"));
    }
    flags
}

/// A recovery entry's flag set, re-parsed for replay.
#[derive(Debug, Default)]
struct ReplayFlags {
    queue: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    nthreads: u32,
    params: Vec<(String, String)>,
}

fn parse_flags(flags: &str) -> ReplayFlags {
    let mut parsed = ReplayFlags {
        nthreads: 4,
        ..Default::default()
    };
    let mut words = flags.split_whitespace();
    while let Some(w) = words.next() {
        match w {
            "-q" => parsed.queue = words.next().map(str::to_string),
            "-H" => parsed.host = words.next().map(str::to_string),
            "-p" => parsed.port = words.next().and_then(|p| p.parse().ok()),
            "-t" => {
                parsed.nthreads = words.next().and_then(|t| t.parse().ok()).unwrap_or(4);
            }
            w => {
                if let Some((k, v)) = w.split_once('=') {
                    parsed.params.push((k.to_string(), v.to_string()));
                }
            }
        }
    }
    parsed
}

async fn submit_one(
    client: &QueueClient,
    log: &RecoveryLog,
    path: &std::path::Path,
    params: &[(String, String)],
    nthreads: u32,
    base_port: u16,
    flags: &str,
) -> Result<()> {
    if tokio::fs::metadata(path).await.is_err() {
        log.save(path, flags, "Cannot access file.").await?;
        return Err(anyhow!("cannot access {path:?}"));
    }
    match client.submit(path, params, nthreads, base_port).await {
        Ok(stat) => {
            tracing::info!(
                "submitted {:?}: {} in {:.2}s ({:.1} Mb/s)",
                path,
                bytesize::ByteSize(stat.bytes),
                stat.time_sec,
                stat.tput_mb
            );
            Ok(())
        }
        Err(e) => {
            log.save(path, flags, &format!("{e:#}")).await?;
            Err(e)
        }
    }
}

async fn run_recover(args: &Args, queue: &str, log: &RecoveryLog) -> Result<i32> {
    let entries = log.entries().await?;
    if args.list_recover {
        for e in &entries {
            println!("dtsq {} {}", e.flags, e.path);
        }
        return Ok(0);
    }
    let local_host = common::local_hostname();
    let mut remaining: Vec<RecoverEntry> = Vec::new();
    let mut nfailed = 0;
    for entry in entries {
        // recovery stays on the submitting host unless told otherwise
        if !args.all_hosts && entry.host != local_host {
            remaining.push(entry);
            continue;
        }
        let replay = parse_flags(&entry.flags);
        let host = replay
            .host
            .or_else(|| args.host.clone())
            .unwrap_or_else(|| "localhost".to_string());
        let port = replay.port.or(args.port).unwrap_or(3000);
        let client = QueueClient::new(host, port, replay.queue.unwrap_or_else(|| queue.to_string()));
        let path = std::path::PathBuf::from(&entry.path);
        tracing::info!("Recovering {} ...", entry.path);
        match client
            .submit(&path, &replay.params, replay.nthreads, args.base_port)
            .await
        {
            Ok(_) => {
                let _ = log.upload_offline(&client.client).await;
            }
            Err(e) => {
                tracing::warn!("recovery of {} failed: {e:#}", entry.path);
                remaining.push(entry);
                nfailed += 1;
            }
        }
    }
    log.rewrite(&remaining).await?;
    Ok(if nfailed > 0 { 1 } else { 0 })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = common::init_tracing(&common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose.max(1),
        log_file: None,
    })?;
    let qc = load_qconfig();

    let queue = args
        .queue
        .clone()
        .or(qc.queue)
        .ok_or_else(|| anyhow!("no queue: pass -q or set one in DTSQ_CONFIG"))?;
    let host = args
        .host
        .clone()
        .or(qc.host)
        .unwrap_or_else(|| "localhost".to_string());
    let port = args.port.or(qc.port).unwrap_or(3000);
    let nthreads = qc.nthreads.unwrap_or(args.nthreads);
    let log = RecoveryLog::for_queue(&queue)?;

    if args.recover || args.list_recover {
        let code = run_recover(&args, &queue, &log).await?;
        std::process::exit(code);
    }

    let (files, params): (Vec<_>, Vec<_>) = args.items.iter().partition(|i| !i.contains('='));
    let params: Vec<(String, String)> = params
        .into_iter()
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    if files.is_empty() {
        return Err(anyhow!("no files to submit"));
    }

    let client = QueueClient::new(host.clone(), port, queue.clone());
    let flags = flags_of(&args, &host, port, &queue, &params);
    let mut failed = false;
    for file in files {
        let path = std::path::PathBuf::from(file);
        if submit_one(&client, &log, &path, &params, nthreads, args.base_port, &flags)
            .await
            .is_err()
        {
            failed = true;
        }
    }
    if !failed {
        // connectivity is back; push any offline mirrors up to the daemon
        let _ = log.upload_offline(&client.client).await;
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
