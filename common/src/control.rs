//! The control record: the per-file manifest that travels with a file
//! through the pipeline.
//!
//! Persisted as a `_control` file of `key = value` lines next to the
//! payload in each spool directory, shipped over the wire at the
//! `queueSetControl` step, and extended with a history line at every
//! delivery.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Upper bound on user parameters carried by one record.
pub const MAX_PARAMS: usize = 64;

const CONTROL_FILE: &str = "_control";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: String,
}

/// Per-file transfer manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlRecord {
    /// Host the file entered the pipeline on.
    pub queue_host: String,
    pub queue_name: String,
    pub filename: String,
    pub xfer_name: String,
    pub delivery_name: String,
    /// Path at the submitting host.
    pub src_path: String,
    /// Full path at the origin (ingest) host.
    pub igst_path: String,
    pub md5: String,
    pub is_dir: bool,
    pub fsize: u64,
    pub fmode: u32,
    pub sum32: u32,
    pub crc32: u32,
    /// Seconds since the epoch at origin.
    pub epoch: u64,
    pub params: Vec<Param>,
    /// Raw history lines, one per hop.
    pub history: Vec<String>,
}

impl ControlRecord {
    /// Add a user parameter, dropping the oldest overflow beyond
    /// [`MAX_PARAMS`].
    pub fn add_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.params.len() >= MAX_PARAMS {
            self.params.remove(0);
        }
        self.params.push(Param {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Render the record in the on-disk `key = value` format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut kv = |k: &str, v: &str| {
            out.push_str(&format!("{:<12} = {}\n", k, v));
        };
        kv("queueHost", &self.queue_host);
        kv("queueName", &self.queue_name);
        kv("filename", &self.filename);
        kv("xferName", &self.xfer_name);
        kv("deliveryName", &self.delivery_name);
        kv("srcPath", &self.src_path);
        kv("igstPath", &self.igst_path);
        kv("md5", &self.md5);
        kv("isDir", if self.is_dir { "1" } else { "0" });
        kv("fsize", &self.fsize.to_string());
        kv("fmode", &format!("{:o}", self.fmode));
        kv("sum32", &self.sum32.to_string());
        kv("crc32", &self.crc32.to_string());
        kv("epoch", &self.epoch.to_string());
        for p in &self.params {
            kv(&format!("param.{}", p.name), &p.value);
        }
        for h in &self.history {
            out.push_str(h);
            out.push('\n');
        }
        out
    }

    /// Parse the on-disk format. Unknown non-param keys are history lines
    /// and are preserved verbatim.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rec = ControlRecord::default();
        for line in text.lines() {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .with_context(|| format!("malformed control line '{line}'"))?;
            match key {
                "queueHost" => rec.queue_host = value.to_string(),
                "queueName" => rec.queue_name = value.to_string(),
                "filename" => rec.filename = value.to_string(),
                "xferName" => rec.xfer_name = value.to_string(),
                "deliveryName" => rec.delivery_name = value.to_string(),
                "srcPath" => rec.src_path = value.to_string(),
                "igstPath" => rec.igst_path = value.to_string(),
                "md5" => rec.md5 = value.to_string(),
                "isDir" => rec.is_dir = value == "1",
                "fsize" => {
                    rec.fsize = value
                        .parse()
                        .with_context(|| format!("bad fsize '{value}'"))?
                }
                "fmode" => {
                    rec.fmode = u32::from_str_radix(value, 8)
                        .with_context(|| format!("bad fmode '{value}'"))?
                }
                "sum32" => {
                    rec.sum32 = value
                        .parse()
                        .with_context(|| format!("bad sum32 '{value}'"))?
                }
                "crc32" => {
                    rec.crc32 = value
                        .parse()
                        .with_context(|| format!("bad crc32 '{value}'"))?
                }
                "epoch" => {
                    rec.epoch = value
                        .parse()
                        .with_context(|| format!("bad epoch '{value}'"))?
                }
                k if k.starts_with("param.") => rec.params.push(Param {
                    name: k["param.".len()..].to_string(),
                    value: value.to_string(),
                }),
                // a queue-name key is a delivery history entry
                _ => rec.history.push(line.to_string()),
            }
        }
        Ok(rec)
    }

    /// Write the record as `<dir>/_control`.
    pub async fn save(&self, dir: &std::path::Path) -> Result<()> {
        let path = dir.join(CONTROL_FILE);
        tokio::fs::write(&path, self.render())
            .await
            .with_context(|| format!("cannot write control file {path:?}"))
    }

    /// Read a record back from `<dir>/_control`.
    pub async fn load(dir: &std::path::Path) -> Result<Self> {
        let path = dir.join(CONTROL_FILE);
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("cannot read control file {path:?}"))?;
        Self::parse(&text)
    }

    pub fn history_line(qname: &str, ok: bool, msg: Option<&str>) -> String {
        let status = if ok { "OK " } else { "ERR" };
        match msg {
            Some(m) => format!("{:<12} = {} {} {}", qname, status, crate::utc_timestamp(), m),
            None => format!("{:<12} = {} {}", qname, status, crate::utc_timestamp()),
        }
    }

    /// Append a delivery history line to an on-disk `_control` file and to
    /// this record.
    pub async fn add_history(
        &mut self,
        dir: &std::path::Path,
        ok: bool,
        msg: Option<&str>,
    ) -> Result<()> {
        let line = Self::history_line(&self.queue_name, ok, msg);
        self.history.push(line.clone());
        let path = dir.join(CONTROL_FILE);
        let mut text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read control file {path:?}"))
            }
        };
        text.push_str(&line);
        text.push('\n');
        tokio::fs::write(&path, text)
            .await
            .with_context(|| format!("cannot append history to {path:?}"))
    }
}

/// Parse a `<qname>.par` parameter file left behind by a delivery command:
/// `key value` lines, whitespace or `=` separated. A `deliveryName` key
/// overrides the delivered name for downstream stages.
pub fn apply_delivery_params(ctrl: &mut ControlRecord, text: &str) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once(|c: char| c.is_whitespace() || c == '=') {
            Some((k, v)) => (k.trim(), v.trim_start_matches(['=', ' ', '\t']).trim()),
            None => (line, ""),
        };
        if key == "deliveryName" {
            ctrl.delivery_name = value.to_string();
        } else {
            ctrl.add_param(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ControlRecord {
        let mut rec = ControlRecord {
            queue_host: "dts-ct.example.org".to_string(),
            queue_name: "sci".to_string(),
            filename: "obs001.fits".to_string(),
            xfer_name: "obs001.fits".to_string(),
            delivery_name: "night1/obs001.fits".to_string(),
            src_path: "/home/obs/obs001.fits".to_string(),
            igst_path: "dts-ct.example.org:/home/obs/obs001.fits".to_string(),
            md5: "900150983cd24fb0d6963f7d28e17f72".to_string(),
            is_dir: false,
            fsize: 16 * 1024 * 1024,
            fmode: 0o644,
            sum32: 48813,
            crc32: 0xCBF43926,
            epoch: 1_722_470_400,
            ..Default::default()
        };
        rec.add_param("account", "des");
        rec.add_param("obsepoch", "2026.58");
        rec
    }

    #[test]
    fn round_trip_is_field_wise_identity() {
        let rec = sample();
        let restored = ControlRecord::parse(&rec.render()).unwrap();
        assert_eq!(rec, restored);
    }

    #[test]
    fn round_trip_preserves_history() {
        let mut rec = sample();
        rec.history
            .push("sci          = OK  2026-08-01T00:00:00Z".to_string());
        rec.history
            .push("sci          = ERR 2026-08-01T01:00:00Z delivery copy failed".to_string());
        let restored = ControlRecord::parse(&rec.render()).unwrap();
        assert_eq!(rec, restored);
    }

    #[test]
    fn param_overflow_drops_oldest() {
        let mut rec = ControlRecord::default();
        for i in 0..(MAX_PARAMS + 3) {
            rec.add_param(format!("p{i}"), "v");
        }
        assert_eq!(rec.params.len(), MAX_PARAMS);
        assert_eq!(rec.params[0].name, "p3");
    }

    #[test]
    fn delivery_params_override_name() {
        let mut rec = sample();
        apply_delivery_params(
            &mut rec,
            "deliveryName renamed.fits\ncaldate 2026-08-01\nflag = raised\n",
        );
        assert_eq!(rec.delivery_name, "renamed.fits");
        assert_eq!(rec.param("caldate"), Some("2026-08-01"));
        assert_eq!(rec.param("flag"), Some("raised"));
    }

    #[tokio::test]
    async fn save_load_and_history_append() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut rec = sample();
        rec.save(dir.path()).await?;
        let mut loaded = ControlRecord::load(dir.path()).await?;
        assert_eq!(rec, loaded);
        loaded.add_history(dir.path(), true, None).await?;
        let again = ControlRecord::load(dir.path()).await?;
        assert_eq!(again.history.len(), 1);
        assert!(again.history[0].contains("= OK"));
        Ok(())
    }
}
