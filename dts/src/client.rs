//! Client-side submission: the four-step handshake as driven by `dtsq`
//! and by host-side tooling.

use anyhow::{anyhow, bail, Context, Result};

use common::checksum;
use common::control::ControlRecord;
use common::stats::{Direction, XferStat, XferStatus};
use remote::protocol::{ConnMode, Request, Response, XferArgs};
use remote::xfer;

/// One queue on one daemon, as seen from a submitter.
#[derive(Debug, Clone)]
pub struct QueueClient {
    pub client: remote::Client,
    pub qname: String,
}

impl QueueClient {
    pub fn new(host: impl Into<String>, port: u16, qname: impl Into<String>) -> Self {
        Self {
            client: remote::Client::new(host, port),
            qname: qname.into(),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let reply = self.client.call(&Request::Ping).await?;
        if reply.is_error() {
            bail!("ping failed: {reply:?}");
        }
        Ok(())
    }

    pub async fn queue_valid(&self) -> Result<()> {
        let reply = self
            .client
            .call(&Request::QueueValid {
                qname: self.qname.clone(),
            })
            .await?
            .into_string()?;
        if reply != "OK" {
            bail!("{reply}");
        }
        Ok(())
    }

    /// Step 1: reserve a spool slot; the reply is the slot path or an
    /// `Error ...` string.
    pub async fn init_transfer(&self, size: u64) -> Result<String> {
        let reply = self
            .client
            .call(&Request::InitTransfer {
                qname: self.qname.clone(),
                size,
            })
            .await
            .context("initTransfer call failed")?;
        match reply {
            Response::Str(s) if !s.starts_with("Error") => Ok(s),
            Response::Str(s) => Err(anyhow!("{s}")),
            other => Err(anyhow!("initTransfer returned {other:?}")),
        }
    }

    /// Step 2: stream the payload into the reserved slot. The daemon
    /// listens on its bulk window; we connect and push.
    pub async fn push_payload(
        &self,
        local: &std::path::Path,
        remote_path: &str,
        fsize: u64,
        nthreads: u32,
        base_port: u16,
    ) -> Result<XferStat> {
        let mut session = self
            .client
            .session(&Request::ReceiveFile {
                args: XferArgs {
                    path: remote_path.to_string(),
                    fsize,
                    nthreads,
                    base_port,
                    peer_host: common::local_hostname(),
                    mode: ConnMode::Listen,
                    method: common::config::Method::Dts,
                    checksum_policy: common::config::ChecksumPolicy::Stripe,
                    rate_mbps: 0,
                },
            })
            .await?;
        let base = session.recv().await?.into_int()? as u16;
        let params = xfer::XferParams {
            path: local.to_path_buf(),
            fsize,
            nthreads,
            checksum_policy: common::config::ChecksumPolicy::Stripe,
            rate_mbps: 0,
            direction: Direction::Push,
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        let stat = xfer::send_file(
            &params,
            xfer::Endpoint::Connect {
                host: self.client.host().to_string(),
                base_port: base,
            },
        )
        .await?;
        match session.recv().await? {
            Response::Xfer(peer) if peer.status == XferStatus::Ok => {}
            Response::Xfer(peer) => bail!("daemon receive ended {:?}", peer.status),
            Response::Error(e) => bail!("{e}"),
            other => bail!("unexpected bulk reply {other:?}"),
        }
        if stat.status != XferStatus::Ok {
            bail!("payload transfer failed");
        }
        Ok(stat)
    }

    /// Step 3: ship the control record.
    pub async fn set_control(&self, qpath: &str, ctrl: &ControlRecord) -> Result<()> {
        let reply = self
            .client
            .call(&Request::QueueSetControl {
                qpath: qpath.to_string(),
                ctrl: Box::new(ctrl.clone()),
            })
            .await?;
        if reply.is_error() {
            bail!("queueSetControl failed: {reply:?}");
        }
        Ok(())
    }

    /// Step 4: complete the handshake.
    pub async fn end_transfer(&self, qpath: &str) -> Result<()> {
        let reply = self
            .client
            .call(&Request::EndTransfer {
                qname: self.qname.clone(),
                qpath: qpath.to_string(),
            })
            .await?
            .into_string()?;
        if reply != "OK" {
            bail!("endTransfer returned '{reply}'");
        }
        Ok(())
    }

    /// Full submission pipeline for one file. `params` land in the
    /// control record as user parameters.
    pub async fn submit(
        &self,
        path: &std::path::Path,
        params: &[(String, String)],
        nthreads: u32,
        base_port: u16,
    ) -> Result<XferStat> {
        let ctrl = build_control(&self.qname, path, params).await?;
        let qpath = self.init_transfer(ctrl.fsize).await?;
        let remote_path = format!("{}/{}", qpath, ctrl.xfer_name);
        let steps = async {
            let stat = self
                .push_payload(path, &remote_path, ctrl.fsize, nthreads, base_port)
                .await?;
            self.set_control(&qpath, &ctrl).await?;
            self.end_transfer(&qpath).await?;
            Ok(stat)
        };
        match steps.await {
            Ok(stat) => Ok(stat),
            Err(e) => {
                // free the daemon's incoming reservation for the next try
                let _ = self
                    .client
                    .call(&Request::CancelTransfer {
                        qname: self.qname.clone(),
                    })
                    .await;
                Err(e)
            }
        }
    }
}

/// Build the control record for a local file about to be submitted.
pub async fn build_control(
    qname: &str,
    path: &std::path::Path,
    params: &[(String, String)],
) -> Result<ControlRecord> {
    use std::os::unix::fs::PermissionsExt;
    let md = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot access {path:?}"))?;
    if md.is_dir() {
        bail!("{path:?} is a directory; submit a bundle instead");
    }
    let fname = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("bad file name {path:?}"))?
        .to_string();
    let abs = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string();
    let host = common::local_hostname();
    let (sum32, crc32) = checksum::file_crc_checksum(path).await?;
    let md5 = checksum::file_md5(path).await?;
    let mut ctrl = ControlRecord {
        queue_host: host.clone(),
        queue_name: qname.to_string(),
        filename: fname.clone(),
        xfer_name: fname,
        src_path: abs.clone(),
        igst_path: format!("{host}:{abs}"),
        md5,
        is_dir: false,
        fsize: md.len(),
        fmode: md.permissions().mode(),
        sum32,
        crc32,
        epoch: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        ..Default::default()
    };
    for (k, v) in params {
        ctrl.add_param(k.clone(), v.clone());
    }
    Ok(ctrl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_record_for_a_local_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let f = tmp.path().join("obs001.fits");
        let data = common::testutils::write_payload(&f, 1000).await?;
        let ctrl = build_control(
            "sci",
            &f,
            &[("account".to_string(), "des".to_string())],
        )
        .await?;
        assert_eq!(ctrl.filename, "obs001.fits");
        assert_eq!(ctrl.fsize, 1000);
        assert_eq!(ctrl.md5, checksum::mem_md5(&data));
        let (sum32, crc32) = checksum::mem_crc_checksum(&data);
        assert_eq!((ctrl.sum32, ctrl.crc32), (sum32, crc32));
        assert_eq!(ctrl.param("account"), Some("des"));
        assert!(ctrl.epoch > 0);
        Ok(())
    }

    #[tokio::test]
    async fn directories_need_bundling() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        assert!(build_control("sci", tmp.path(), &[]).await.is_err());
        Ok(())
    }
}
