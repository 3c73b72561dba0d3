//! Submitter-side recovery: failed submissions are logged locally and
//! replayed on demand.
//!
//! Two files live under the per-queue work directory
//! (`$DTSQ_WORKDIR` or `~/.dtsq/<queue>/`): `Log`, a human-readable error
//! record, and `Recover`, one line per unsent file
//! (`host path flags...`). Each has an `*.offline` mirror uploaded to the
//! daemon's queue log area on the next successful contact. Replaying
//! rewrites `Recover` atomically with only the still-failing entries, so
//! the file shrinks monotonically over successful attempts.

use anyhow::{anyhow, Context, Result};

use remote::protocol::Request;

/// One pending submission from the `Recover` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverEntry {
    pub host: String,
    pub path: String,
    /// Original submission flags, preserved verbatim.
    pub flags: String,
}

impl RecoverEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (host, rest) = line.split_once(' ')?;
        let (path, flags) = match rest.split_once(' ') {
            Some((p, f)) => (p, f.trim()),
            None => (rest, ""),
        };
        Some(Self {
            host: host.to_string(),
            path: path.to_string(),
            flags: flags.to_string(),
        })
    }

    pub fn render(&self) -> String {
        if self.flags.is_empty() {
            format!("{} {}", self.host, self.path)
        } else {
            format!("{} {} {}", self.host, self.path, self.flags)
        }
    }
}

/// The per-queue recovery directory.
#[derive(Debug, Clone)]
pub struct RecoveryLog {
    dir: std::path::PathBuf,
    queue: String,
}

impl RecoveryLog {
    /// `$DTSQ_WORKDIR` wins over `$HOME/.dtsq`.
    pub fn for_queue(queue: &str) -> Result<Self> {
        let base = std::env::var_os("DTSQ_WORKDIR")
            .map(std::path::PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|h| std::path::PathBuf::from(h).join(".dtsq"))
            })
            .ok_or_else(|| anyhow!("neither DTSQ_WORKDIR nor HOME is set"))?;
        Ok(Self {
            dir: base.join(queue),
            queue: queue.to_string(),
        })
    }

    pub fn at(dir: std::path::PathBuf, queue: &str) -> Self {
        Self {
            dir,
            queue: queue.to_string(),
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn recover_path(&self) -> std::path::PathBuf {
        self.dir.join("Recover")
    }

    fn log_path(&self) -> std::path::PathBuf {
        self.dir.join("Log")
    }

    /// Record a failed submission in `Log` and `Recover` and their
    /// offline mirrors.
    pub async fn save(&self, path: &std::path::Path, flags: &str, reason: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("cannot create recovery dir {:?}", self.dir))?;
        let host = common::local_hostname();
        let abs = path
            .canonicalize()
            .unwrap_or_else(|_| {
                std::env::current_dir()
                    .map(|c| c.join(path))
                    .unwrap_or_else(|_| path.to_path_buf())
            })
            .display()
            .to_string();
        let entry = RecoverEntry {
            host: host.clone(),
            path: abs.clone(),
            flags: flags.to_string(),
        };
        let log_line = format!(
            "{} {} queue={} file={} error: {}\n",
            common::utc_timestamp(),
            host,
            self.queue,
            abs,
            reason
        );
        for name in ["Log", "Log.offline"] {
            append(&self.dir.join(name), &log_line).await?;
        }
        let rec_line = format!("{}\n", entry.render());
        for name in ["Recover", "Recover.offline"] {
            append(&self.dir.join(name), &rec_line).await?;
        }
        Ok(())
    }

    /// Pending entries, oldest first.
    pub async fn entries(&self) -> Result<Vec<RecoverEntry>> {
        let text = match tokio::fs::read_to_string(self.recover_path()).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("cannot read {:?}", self.recover_path()))
            }
        };
        Ok(text.lines().filter_map(RecoverEntry::parse).collect())
    }

    /// Atomically replace `Recover` with the still-failing entries.
    pub async fn rewrite(&self, remaining: &[RecoverEntry]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!(".Recover.{}", std::process::id()));
        let mut text = String::new();
        for e in remaining {
            text.push_str(&e.render());
            text.push('\n');
        }
        tokio::fs::write(&tmp, text)
            .await
            .with_context(|| format!("cannot write {tmp:?}"))?;
        tokio::fs::rename(&tmp, self.recover_path())
            .await
            .with_context(|| format!("cannot replace {:?}", self.recover_path()))?;
        Ok(())
    }

    /// Upload the offline mirrors to the daemon's queue log area, then
    /// truncate them. Failure to reach the daemon leaves the mirrors in
    /// place for the next contact.
    pub async fn upload_offline(&self, client: &remote::Client) -> Result<()> {
        let log = tokio::fs::read_to_string(self.dir.join("Log.offline"))
            .await
            .unwrap_or_default();
        let recover = tokio::fs::read_to_string(self.dir.join("Recover.offline"))
            .await
            .unwrap_or_default();
        if log.is_empty() && recover.is_empty() {
            return Ok(());
        }
        let reply = client
            .call(&Request::SubmitLogs {
                qname: self.queue.clone(),
                log,
                recover,
            })
            .await?;
        if reply.is_error() {
            return Err(anyhow!("submitLogs failed: {reply:?}"));
        }
        for name in ["Log.offline", "Recover.offline"] {
            let _ = tokio::fs::remove_file(self.dir.join(name)).await;
        }
        Ok(())
    }
}

async fn append(path: &std::path::Path, text: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("cannot append to {path:?}"))?;
    f.write_all(text.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip() {
        let e = RecoverEntry::parse("hostA /data/x.fits -q sci account=des").unwrap();
        assert_eq!(e.host, "hostA");
        assert_eq!(e.path, "/data/x.fits");
        assert_eq!(e.flags, "-q sci account=des");
        assert_eq!(e.render(), "hostA /data/x.fits -q sci account=des");
        let bare = RecoverEntry::parse("hostA /data/x.fits").unwrap();
        assert_eq!(bare.flags, "");
        assert!(RecoverEntry::parse("").is_none());
    }

    #[tokio::test]
    async fn save_entries_rewrite_shrinks() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let log = RecoveryLog::at(tmp.path().join("sci"), "sci");
        let f1 = tmp.path().join("a.fits");
        let f2 = tmp.path().join("b.fits");
        tokio::fs::write(&f1, b"a").await?;
        tokio::fs::write(&f2, b"b").await?;
        log.save(&f1, "-q sci", "Cannot contact DTS host").await?;
        log.save(&f2, "-q sci", "Cannot contact DTS host").await?;

        let entries = log.entries().await?;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].path.ends_with("a.fits"));
        // the offline mirrors track the live files
        assert!(log.dir().join("Recover.offline").exists());
        assert!(log.dir().join("Log.offline").exists());

        // one succeeded; the file shrinks monotonically
        log.rewrite(&entries[1..]).await?;
        let rest = log.entries().await?;
        assert_eq!(rest.len(), 1);
        assert!(rest[0].path.ends_with("b.fits"));
        log.rewrite(&[]).await?;
        assert!(log.entries().await?.is_empty());
        Ok(())
    }
}
