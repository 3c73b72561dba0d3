use anyhow::{anyhow, Context};
use clap::Parser;

use dts_tools_dts::{run_daemon, Node};

#[derive(Parser, Debug)]
#[command(
    name = "dtsd",
    version,
    about = "DTS transport daemon - runs the queues of one pipeline node",
    long_about = "`dtsd` hosts one node of a DTS pipeline: the RPC command port, the \
bulk-transfer port pool, and one manager per configured queue. Point it at a \
configuration file with --config (or the DTS_CONFIG environment variable) and \
name the dts block to run with --name."
)]
struct Args {
    /// Configuration file (falls back to $DTS_CONFIG)
    #[arg(short, long, value_name = "FILE")]
    config: Option<std::path::PathBuf>,

    /// Which dts block of the configuration to run
    ///
    /// Defaults to the block whose host matches this machine, or the only
    /// block in the file
    #[arg(short, long, value_name = "NODE")]
    name: Option<String>,

    // Progress & output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short, long, help_heading = "Progress & output")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var_os("DTS_CONFIG").map(std::path::PathBuf::from))
        .ok_or_else(|| anyhow!("no configuration: pass --config or set DTS_CONFIG"))?;
    let cfg = common::config::DtsConfig::load(&config_path).await?;

    let name = match args.name {
        Some(n) => n,
        None => {
            let hostname = common::local_hostname();
            cfg.node_for_host(&hostname)
                .map(|n| n.name.clone())
                .or_else(|| {
                    if cfg.nodes.len() == 1 {
                        Some(cfg.nodes[0].name.clone())
                    } else {
                        None
                    }
                })
                .ok_or_else(|| {
                    anyhow!("no dts block matches host '{hostname}'; pass --name")
                })?
        }
    };

    let mut verbose = if args.verbose > 0 {
        args.verbose
    } else {
        cfg.verbose
    };
    if common::debug_enabled(common::DebugCategory::Dts) {
        verbose = verbose.max(2);
    }
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose,
        log_file: cfg.node_named(&name).and_then(|n| n.logfile.clone()),
    };
    let _log_guard = common::init_tracing(&output)?;

    let node = Node::from_config(&cfg, &name)
        .with_context(|| format!("cannot initialize node '{name}'"))?;
    if let Some(url) = node.monitor_url.lock().unwrap().clone() {
        node.monitor.attach(url);
    }
    if let Err(e) = run_daemon(node).await {
        tracing::error!("daemon failed: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
