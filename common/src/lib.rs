//! Shared building blocks for the DTS transport tools.
//!
//! Everything in here is consumed by the `remote` wire layer and the `dts`
//! daemon/submitter crates: the integrity codec, the sandboxed path
//! resolver, the control-record format, the configuration model, file
//! utilities and the statistics plumbing.

use anyhow::Context;

pub mod checksum;
pub mod config;
pub mod control;
pub mod fileutil;
pub mod sandbox;
pub mod shm;
pub mod stats;
pub mod testutils;

/// Debug categories raised by environment variables or same-named
/// sentinel files under /tmp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Dts,
    Xfer,
    Ptcp,
    Sem,
    Cmd,
    Time,
}

impl DebugCategory {
    fn name(&self) -> &'static str {
        match self {
            DebugCategory::Dts => "DTS_DBG",
            DebugCategory::Xfer => "XFER_DBG",
            DebugCategory::Ptcp => "PTCP_DBG",
            DebugCategory::Sem => "SEM_DBG",
            DebugCategory::Cmd => "CMD_DBG",
            DebugCategory::Time => "TIME_DBG",
        }
    }
}

/// Check whether a debug category is raised, either through the
/// environment or a sentinel file under /tmp.
pub fn debug_enabled(category: DebugCategory) -> bool {
    let name = category.name();
    if std::env::var_os(name).is_some() {
        return true;
    }
    std::path::Path::new("/tmp").join(name).exists()
}

/// Output and logging configuration shared by the binaries.
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Optional log file the subscriber also writes to
    pub log_file: Option<std::path::PathBuf>,
}

/// Initialize the tracing subscriber for a binary.
///
/// Returns the non-blocking writer guard when a log file is configured;
/// the caller must hold it for the lifetime of the process.
pub fn init_tracing(
    output: &OutputConfig,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if let Some(ref path) = output.log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let fname = path
            .file_name()
            .with_context(|| format!("invalid log file path {path:?}"))?;
        let appender = tracing_appender::rolling::never(dir, fname);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer.and(std::io::stderr))
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(None)
    }
}

/// Local host name, as recorded in control records and recovery logs.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// UTC timestamp in the fixed format used by control-file history lines
/// and the recovery log.
pub fn utc_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_category_from_env() {
        assert!(!debug_enabled(DebugCategory::Sem));
        std::env::set_var("SEM_DBG", "1");
        assert!(debug_enabled(DebugCategory::Sem));
        std::env::remove_var("SEM_DBG");
    }

    #[test]
    fn hostname_is_nonempty() {
        assert!(!local_hostname().is_empty());
    }
}
