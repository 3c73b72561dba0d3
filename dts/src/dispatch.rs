//! RPC dispatch: the daemon's command port.
//!
//! One request frame in, one response frame out, except the bulk verbs
//! (`sendFile`, `receiveFile`) which first answer a ready frame carrying
//! the allocated base port and then the final transfer stat. Every verb
//! that accepts a path resolves it through the sandbox before any
//! filesystem access; handler errors are folded into structured `Error`
//! results, never a dropped connection.

use anyhow::{anyhow, bail, Context, Result};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::Arc;

use crate::node::Node;
use crate::queue::{Queue, QueueState};
use common::checksum;
use common::control::ControlRecord;
use common::fileutil;
use common::stats::Direction;
use remote::protocol::{
    ChecksumReply, ConnMode, FileStat, NodeStatReply, QueueStatReply, Request, Response, XferArgs,
};
use remote::streams::ControlConnection;
use remote::xfer;

/// Accept loop on the command port. Returns when the node shuts down.
pub async fn serve(node: Arc<Node>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", node.port))
        .await
        .with_context(|| format!("cannot bind command port {}", node.port))?;
    tracing::info!("{}: command port {} ready", node.name, node.port);
    loop {
        tokio::select! {
            _ = node.shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed on command port")?;
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_conn(node, stream).await {
                        tracing::debug!("rpc connection from {peer} failed: {e:#}");
                    }
                });
            }
        }
    }
}

async fn handle_conn(node: Arc<Node>, stream: tokio::net::TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut conn = ControlConnection::new(stream);
    let Some(request) = conn.recv_mut().recv_object::<Request>().await? else {
        return Ok(());
    };
    if node.flags.read().unwrap().debug > 1 {
        tracing::debug!("rpc: {request:?}");
    }
    match request {
        Request::SendFile { args } => bulk_verb(node, &mut conn, args, true).await,
        Request::ReceiveFile { args } => bulk_verb(node, &mut conn, args, false).await,
        request => {
            let response = match dispatch(&node, request).await {
                Ok(r) => r,
                Err(e) => Response::Error(format!("Error: {e:#}")),
            };
            conn.send_mut().send_control_message(&response).await
        }
    }
}

/// `sendFile` / `receiveFile`: answer a ready frame with the base port,
/// run the stripe engine, then answer the final stat.
async fn bulk_verb(
    node: Arc<Node>,
    conn: &mut ControlConnection,
    args: XferArgs,
    sending: bool,
) -> Result<()> {
    let path = node.resolve(&args.path);
    let cancel = tokio_util::sync::CancellationToken::new();
    let params = xfer::XferParams {
        path,
        fsize: args.fsize,
        nthreads: args.nthreads,
        checksum_policy: args.checksum_policy,
        rate_mbps: args.rate_mbps,
        direction: if sending == (args.mode == ConnMode::Listen) {
            // our passive side serving a remote puller, or receiving a
            // remote pusher
            Direction::Push
        } else {
            Direction::Pull
        },
        cancel,
    };
    let result = async {
        let endpoint = match args.mode {
            ConnMode::Listen => {
                let (base, listeners) = xfer::bind_endpoint(
                    &node.bulk_range,
                    args.base_port,
                    args.fsize,
                    args.nthreads,
                )
                .await?;
                conn.send_mut()
                    .send_control_message(&Response::Int(base as i64))
                    .await?;
                xfer::Endpoint::Listen(listeners)
            }
            ConnMode::Connect => {
                conn.send_mut()
                    .send_control_message(&Response::Int(0))
                    .await?;
                xfer::Endpoint::Connect {
                    host: args.peer_host.clone(),
                    base_port: args.base_port,
                }
            }
        };
        if sending {
            xfer::send_file(&params, endpoint).await
        } else {
            xfer::recv_file(&params, endpoint).await
        }
    }
    .await;
    let response = match result {
        Ok(stat) => Response::Xfer(stat),
        Err(e) => Response::Error(format!("Error: {e:#}")),
    };
    conn.send_mut().send_control_message(&response).await
}

fn queue_of(node: &Arc<Node>, qname: &str) -> Result<Arc<Queue>> {
    node.queue(qname)
        .ok_or_else(|| anyhow!("no queue named '{qname}'"))
}

fn ok_str() -> Response {
    Response::Str("OK".to_string())
}

async fn dispatch(node: &Arc<Node>, request: Request) -> Result<Response> {
    Ok(match request {
        // ---- administration -------------------------------------------
        Request::InitDts => {
            for q in &node.queues {
                q.poke();
            }
            ok_str()
        }
        Request::ShutdownDts { graceful, passwd } => {
            check_passwd(node, &passwd)?;
            node.graceful
                .store(graceful, std::sync::atomic::Ordering::Release);
            for q in &node.queues {
                q.set_state(QueueState::Shutdown);
            }
            node.shutdown.cancel();
            ok_str()
        }
        Request::Abort { passwd } => {
            check_passwd(node, &passwd)?;
            node.graceful
                .store(false, std::sync::atomic::Ordering::Release);
            for q in &node.queues {
                q.set_state(QueueState::Shutdown);
            }
            node.shutdown.cancel();
            ok_str()
        }
        Request::Cfg => Response::Str(render_cfg(node)),
        Request::DtsList => {
            Response::List(node.queues.iter().map(|q| q.cfg.name.clone()).collect())
        }
        Request::DtsSet { key, value } => {
            match key.as_str() {
                "verbose" => node.flags.write().unwrap().verbose = value.parse().unwrap_or(0),
                "debug" => node.flags.write().unwrap().debug = value.parse().unwrap_or(0),
                _ => {
                    node.kv.lock().unwrap().insert(key, value);
                }
            }
            ok_str()
        }
        Request::DtsGet { key } => {
            let value = match key.as_str() {
                "name" => node.name.clone(),
                "host" => node.host.clone(),
                "root" => node.root().display().to_string(),
                "verbose" => node.flags.read().unwrap().verbose.to_string(),
                "debug" => node.flags.read().unwrap().debug.to_string(),
                _ => node.kv.lock().unwrap().get(&key).cloned().unwrap_or_default(),
            };
            Response::Str(value)
        }
        Request::SubmitLogs { qname, log, recover } => {
            let dir = node.qlog_dir(&qname);
            tokio::fs::create_dir_all(&dir).await?;
            append_file(&dir.join("Log.offline"), &log).await?;
            append_file(&dir.join("Recover.offline"), &recover).await?;
            ok_str()
        }
        Request::GetQLog { qname } => {
            let path = node.qlog_dir(&qname).join("Log");
            Response::Str(tokio::fs::read_to_string(&path).await.unwrap_or_default())
        }
        Request::EraseQLog { qname } => {
            let dir = node.qlog_dir(&qname);
            for name in ["Log", "Log.offline", "Recover.offline"] {
                let _ = tokio::fs::remove_file(dir.join(name)).await;
            }
            ok_str()
        }
        Request::NodeStat => Response::Node(node_stat(node)),

        // ---- queue control --------------------------------------------
        Request::StartQueue { qname } => {
            let q = queue_of(node, &qname)?;
            q.set_state(QueueState::Running);
            q.poke();
            ok_str()
        }
        Request::PauseQueue { qname } => {
            queue_of(node, &qname)?.set_state(QueueState::Paused);
            ok_str()
        }
        Request::FlushQueue { qname } => {
            queue_of(node, &qname)?.request_flush();
            ok_str()
        }
        Request::RestartQueue { qname } => {
            let q = queue_of(node, &qname)?;
            q.set_state(QueueState::Running);
            q.poke();
            ok_str()
        }
        Request::ShutdownQueue { qname } => {
            let q = queue_of(node, &qname)?;
            q.set_state(QueueState::Shutdown);
            q.poke();
            ok_str()
        }
        Request::PokeQueue { qname } => {
            queue_of(node, &qname)?.poke();
            ok_str()
        }
        Request::ListQueue { qname } => {
            let q = queue_of(node, &qname)?;
            let spool = node.spool_dir(&q.cfg.name);
            let mut lines = Vec::new();
            for (n, slot) in fileutil::numbered_subdirs(&spool).await? {
                let ctrl = ControlRecord::load(&slot).await.unwrap_or_default();
                lines.push(format!("{:04}  {}  {}", n, ctrl.fsize, ctrl.filename));
            }
            Response::List(lines)
        }
        Request::AddToQueue { qname, path } => {
            let q = queue_of(node, &qname)?;
            let src = node.resolve(&path);
            Response::Str(add_local_file(node, &q, &src).await?)
        }
        Request::RemoveFromQueue { qname, slot } => {
            let q = queue_of(node, &qname)?;
            let dir = node.spool_dir(&qname).join(format!("{slot:04}"));
            if !q.remove_work(&dir) {
                bail!("spool entry {slot:04} of '{qname}' is not pending");
            }
            fileutil::remove_any(&dir).await?;
            let _ = q.pending_slots.fetch_update(
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
                |v| Some(v.saturating_sub(1)),
            );
            ok_str()
        }
        Request::GetQueueStat { qname } => Response::QueueStats(queue_of(node, &qname)?.stats()),
        Request::SetQueueStat { qname, stats } => {
            queue_of(node, &qname)?.set_stats(stats);
            ok_str()
        }
        Request::GetQueueCount { qname } => {
            Response::Int(queue_of(node, &qname)?.pending() as i64)
        }
        Request::SetQueueCount { qname, count } => {
            // the count derives from the work list here, so this verb
            // reconciles the semaphore rather than forcing a raw value
            let q = queue_of(node, &qname)?;
            q.poke();
            let actual = q.pending();
            if count != actual {
                tracing::warn!(
                    "setQueueCount({count}) reconciled to {actual} queued entries for '{qname}'"
                );
            }
            Response::Int(actual as i64)
        }
        Request::GetQueueDir { qname } => Response::Str(queue_of(node, &qname)?.delivery_dir()),
        Request::SetQueueDir { qname, dir } => {
            queue_of(node, &qname)?.set_delivery_dir(dir);
            ok_str()
        }
        Request::GetQueueCmd { qname } => Response::Str(queue_of(node, &qname)?.delivery_cmd()),
        Request::SetQueueCmd { qname, cmd } => {
            queue_of(node, &qname)?.set_delivery_cmd(cmd);
            ok_str()
        }
        Request::GetCopyDir => Response::Str(node.root().join("copy").display().to_string()),
        Request::ExecCmd { cmd } => {
            let root = node.root();
            Response::Int(crate::deliver::sys_exec(&root, &cmd).await as i64)
        }
        Request::PrintQueueCfg { qname } => {
            let q = queue_of(node, &qname)?;
            Response::Str(format!("{:#?}", q.cfg))
        }

        // ---- transfer handshake ---------------------------------------
        Request::InitTransfer { qname, size } => init_transfer(node, &qname, size).await?,
        Request::DoTransfer { qname, qpath } => {
            let q = queue_of(node, &qname)?;
            let dir = node.resolve(&qpath);
            if !dir.join("_control").exists() {
                bail!("spool entry {qpath} has no control record");
            }
            q.pending_slots
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            q.enqueue_work(dir);
            ok_str()
        }
        Request::EndTransfer { qname, qpath } => end_transfer(node, &qname, &qpath).await?,
        Request::CancelTransfer { qname } => {
            let q = queue_of(node, &qname)?;
            if let Some(incoming) = q.clear_incoming() {
                let _ = fileutil::remove_any(&incoming.slot).await;
                let _ = q.pending_slots.fetch_update(
                    std::sync::atomic::Ordering::AcqRel,
                    std::sync::atomic::Ordering::Acquire,
                    |v| Some(v.saturating_sub(1)),
                );
            }
            if let Some(token) = q.xfer_cancel.lock().unwrap().take() {
                token.cancel();
            }
            let mut stats = q.stats();
            stats.canceled += 1;
            q.set_stats(stats);
            if let Some(rec) = node.shm_record(q.shm_idx) {
                rec.canceled_xfers
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            ok_str()
        }
        Request::QueueAccept { qname, fname, size } => {
            let q = queue_of(node, &qname)?;
            let state = q.state();
            if matches!(
                state,
                QueueState::Paused | QueueState::Shutdown | QueueState::Killed
            ) {
                Response::Str(format!("Error: Queue '{qname}' is {state}"))
            } else if q.cfg.ceiling > 0
                && q.pending_slots.load(std::sync::atomic::Ordering::Acquire) >= q.cfg.ceiling
            {
                Response::Str(format!("Error: Queue '{qname}' is over its pending limit"))
            } else if fileutil::disk_free(&node.root())? < node.min_free.saturating_add(size) {
                Response::Str(format!("Error: Queue '{qname}' spool free space too low"))
            } else {
                tracing::debug!("{qname}: will accept '{fname}' ({size} bytes)");
                ok_str()
            }
        }
        Request::QueueComplete { qname, qpath } => {
            let q = queue_of(node, &qname)?;
            q.mark_completed(node.resolve(&qpath));
            ok_str()
        }
        Request::QueueRelease { qname } => {
            let q = queue_of(node, &qname)?;
            if q.clear_incoming().is_some() {
                let _ = q.pending_slots.fetch_update(
                    std::sync::atomic::Ordering::AcqRel,
                    std::sync::atomic::Ordering::Acquire,
                    |v| Some(v.saturating_sub(1)),
                );
            }
            ok_str()
        }
        Request::QueueValid { qname } => {
            if node.queue(&qname).is_some() {
                ok_str()
            } else {
                Response::Str(format!("Error: no queue named '{qname}'"))
            }
        }
        Request::QueueSetControl { qpath, ctrl } => {
            let dir = node.resolve(&qpath);
            if !dir.is_dir() {
                bail!("no spool entry at {qpath}");
            }
            ctrl.save(&dir).await?;
            ok_str()
        }
        Request::QueueDest { qname } => Response::Str(queue_of(node, &qname)?.cfg.dest.clone()),
        Request::QueueSrc { qname } => Response::Str(queue_of(node, &qname)?.cfg.src.clone()),
        Request::QueueUpdateStats { qname, stat } => {
            queue_of(node, &qname)?.update_stats(&stat);
            ok_str()
        }

        // ---- sandboxed file utilities ---------------------------------
        Request::Access { path, mode } => {
            let p = node.resolve(&path);
            let ok = match mode {
                0 => p.exists(),
                m if m & 0o4 != 0 => std::fs::File::open(&p).is_ok(),
                m if m & 0o2 != 0 => std::fs::OpenOptions::new().write(true).open(&p).is_ok(),
                m if m & 0o1 != 0 => std::fs::metadata(&p)
                    .map(|md| md.permissions().mode() & 0o111 != 0)
                    .unwrap_or(false),
                _ => p.exists(),
            };
            Response::Int(if ok { 0 } else { -1 })
        }
        Request::Cat { path } => {
            let p = node.resolve(&path);
            Response::Bytes(tokio::fs::read(&p).await.with_context(|| format!("cannot read {p:?}"))?)
        }
        Request::Checksum { path } => {
            let p = node.resolve(&path);
            let (sum32, crc32) = checksum::file_crc_checksum(&p).await?;
            let md5 = checksum::file_md5(&p).await?;
            Response::Checksums(ChecksumReply { md5, sum32, crc32 })
        }
        Request::Copy { src, dst } => {
            let s = node.resolve(&src);
            let d = node.resolve(&dst);
            fileutil::copy_any(&s, &d).await?;
            ok_str()
        }
        Request::Cwd => Response::Str(node.root().display().to_string()),
        Request::IsDir { path } => {
            Response::Int(if node.resolve(&path).is_dir() { 1 } else { 0 })
        }
        Request::Chmod { path, mode } => {
            let p = node.resolve(&path);
            tokio::fs::set_permissions(&p, std::fs::Permissions::from_mode(mode)).await?;
            ok_str()
        }
        Request::Del { path, recursive } => {
            let p = node.resolve(&path);
            if p.is_dir() && !recursive {
                bail!("{path} is a directory (use recursive delete)");
            }
            fileutil::remove_any(&p).await?;
            ok_str()
        }
        Request::Dir { path, long } => {
            let p = node.resolve(&path);
            if !p.exists() {
                tokio::fs::create_dir_all(&p).await?;
            }
            let mut entries = tokio::fs::read_dir(&p).await?;
            let mut lines = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if long {
                    let md = entry.metadata().await?;
                    lines.push(format!(
                        "{:o} {:>12} {:>11} {}",
                        md.permissions().mode() & 0o7777,
                        md.len(),
                        md.mtime(),
                        name
                    ));
                } else {
                    lines.push(name);
                }
            }
            lines.sort();
            Response::List(lines)
        }
        Request::DestDir { qname } => {
            let q = queue_of(node, &qname)?;
            Response::Str(q.delivery_dir())
        }
        Request::DiskUsed { path } => {
            let p = node.resolve(&path);
            Response::Int(fileutil::disk_usage(&p).await? as i64)
        }
        Request::DiskFree { path } => {
            let p = node.resolve(&path);
            Response::Int(fileutil::disk_free(&p)? as i64)
        }
        Request::Echo { text } => Response::Str(text),
        Request::Fsize { path } => {
            let p = node.resolve(&path);
            Response::Int(tokio::fs::metadata(&p).await?.len() as i64)
        }
        Request::Fmode { path } => {
            let p = node.resolve(&path);
            let md = tokio::fs::metadata(&p).await?;
            Response::Str(format!("{:o}", md.permissions().mode() & 0o7777))
        }
        Request::Ftime { path } => {
            let p = node.resolve(&path);
            Response::Int(tokio::fs::metadata(&p).await?.mtime())
        }
        Request::Mkdir { path } => {
            let p = node.resolve(&path);
            tokio::fs::create_dir_all(&p).await?;
            ok_str()
        }
        Request::Ping => ok_str(),
        Request::PingSleep { sec } => {
            tokio::time::sleep(std::time::Duration::from_secs(sec)).await;
            ok_str()
        }
        Request::PingStr { text } => Response::Str(text),
        Request::PingArray => Response::List(vec![
            node.name.clone(),
            node.host.clone(),
            node.port.to_string(),
            node.uptime_sec().to_string(),
        ]),
        Request::RemotePing { host, port } => {
            let client = remote::Client::new(host, port);
            match client.call(&Request::Ping).await {
                Ok(_) => ok_str(),
                Err(e) => Response::Str(format!("Error: {e:#}")),
            }
        }
        Request::Rename { old, new } => {
            let o = node.resolve(&old);
            let n = node.resolve(&new);
            tokio::fs::rename(&o, &n).await?;
            ok_str()
        }
        Request::SetRoot { path, passwd } => {
            check_ops_passwd(node, &passwd)?;
            let root = std::path::PathBuf::from(path);
            tokio::fs::create_dir_all(root.join("spool")).await?;
            node.set_root(root);
            ok_str()
        }
        Request::SetDbg { flag } => {
            let mut flags = node.flags.write().unwrap();
            match flag.as_str() {
                "trace" => flags.trace = true,
                "verbose" => flags.verbose += 1,
                _ => flags.debug += 1,
            }
            ok_str()
        }
        Request::Touch { path } => {
            let p = node.resolve(&path);
            match std::fs::OpenOptions::new().append(true).open(&p) {
                Ok(f) => f.set_modified(std::time::SystemTime::now())?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tokio::fs::write(&p, b"").await?;
                }
                Err(e) => return Err(e).with_context(|| format!("cannot touch {p:?}")),
            }
            ok_str()
        }

        // ---- low-level i/o --------------------------------------------
        Request::Read { path, offset, size } => {
            use tokio::io::{AsyncReadExt, AsyncSeekExt};
            let p = node.resolve(&path);
            let mut f = tokio::fs::File::open(&p)
                .await
                .with_context(|| format!("cannot open {p:?}"))?;
            f.seek(std::io::SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0;
            while filled < buf.len() {
                let n = f.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Response::Bytes(buf)
        }
        Request::Write { path, offset, data } => {
            use tokio::io::{AsyncSeekExt, AsyncWriteExt};
            let p = node.resolve(&path);
            let mut f = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&p)
                .await
                .with_context(|| format!("cannot open {p:?} for writing"))?;
            f.seek(std::io::SeekFrom::Start(offset)).await?;
            f.write_all(&data).await?;
            Response::Int(data.len() as i64)
        }
        Request::Prealloc { path, size } => {
            let p = node.resolve(&path);
            fileutil::prealloc(&p, size).await?;
            ok_str()
        }
        Request::Stat { path } => {
            let p = node.resolve(&path);
            Response::Stat(stat_of(&p).await?)
        }
        Request::StatVal { path, field } => {
            let p = node.resolve(&path);
            let st = stat_of(&p).await?;
            let value = match field.as_str() {
                "size" => st.size.to_string(),
                "mode" => format!("{:o}", st.mode),
                "uid" => st.uid.to_string(),
                "gid" => st.gid.to_string(),
                "atime" => st.atime.to_string(),
                "mtime" => st.mtime.to_string(),
                "ctime" => st.ctime.to_string(),
                "isdir" => (st.is_dir as u8).to_string(),
                "islink" => (st.is_link as u8).to_string(),
                _ => bail!("unknown stat field '{field}'"),
            };
            Response::Str(value)
        }

        // ---- bulk orchestration ---------------------------------------
        Request::XferPushFile {
            path,
            dest,
            nthreads,
            port,
        } => {
            let peer = node
                .peer(&dest)
                .ok_or_else(|| anyhow!("no peer named '{dest}'"))?;
            let local = node.resolve(&path);
            let fsize = fileutil::disk_usage(&local).await?;
            let client = peer.client();
            let mut session = client
                .session(&Request::ReceiveFile {
                    args: XferArgs {
                        path: path.clone(),
                        fsize,
                        nthreads,
                        base_port: port,
                        peer_host: node.host.clone(),
                        mode: ConnMode::Listen,
                        method: common::config::Method::Dts,
                        checksum_policy: common::config::ChecksumPolicy::Stripe,
                        rate_mbps: 0,
                    },
                })
                .await?;
            let base = session.recv().await?.into_int()? as u16;
            let params = xfer::XferParams {
                path: local,
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
                    host: peer.host.clone(),
                    base_port: base,
                },
            )
            .await?;
            let _ = session.recv().await?;
            Response::Xfer(stat)
        }
        Request::XferPullFile {
            path,
            src,
            fsize,
            nthreads,
            port,
        } => {
            let peer = node
                .peer(&src)
                .ok_or_else(|| anyhow!("no peer named '{src}'"))?;
            let local = node.resolve(&path);
            let client = peer.client();
            let mut session = client
                .session(&Request::SendFile {
                    args: XferArgs {
                        path: path.clone(),
                        fsize,
                        nthreads,
                        base_port: port,
                        peer_host: node.host.clone(),
                        mode: ConnMode::Listen,
                        method: common::config::Method::Dts,
                        checksum_policy: common::config::ChecksumPolicy::Stripe,
                        rate_mbps: 0,
                    },
                })
                .await?;
            let base = session.recv().await?.into_int()? as u16;
            let params = xfer::XferParams {
                path: local,
                fsize,
                nthreads,
                checksum_policy: common::config::ChecksumPolicy::Stripe,
                rate_mbps: 0,
                direction: Direction::Pull,
                cancel: tokio_util::sync::CancellationToken::new(),
            };
            let stat = xfer::recv_file(
                &params,
                xfer::Endpoint::Connect {
                    host: peer.host.clone(),
                    base_port: base,
                },
            )
            .await?;
            let _ = session.recv().await?;
            Response::Xfer(stat)
        }
        // handled on the connection before dispatch
        Request::SendFile { .. } | Request::ReceiveFile { .. } => {
            Response::Error("Error: bulk verb outside a session".to_string())
        }

        // ---- monitor --------------------------------------------------
        Request::Monitor { url } => {
            *node.monitor_url.lock().unwrap() = Some(url.clone());
            node.monitor.attach(url);
            ok_str()
        }
        Request::Console { url, passwd } => {
            check_ops_passwd(node, &passwd)?;
            *node.monitor_url.lock().unwrap() = Some(url.clone());
            node.monitor.attach(url);
            ok_str()
        }
        Request::Detach => {
            *node.monitor_url.lock().unwrap() = None;
            node.monitor.detach();
            ok_str()
        }
    })
}

fn check_passwd(node: &Arc<Node>, passwd: &str) -> Result<()> {
    if node.passwd.is_empty() || passwd == node.passwd || passwd == node.ops_pass {
        Ok(())
    } else {
        Err(anyhow!("bad password"))
    }
}

fn check_ops_passwd(node: &Arc<Node>, passwd: &str) -> Result<()> {
    if node.ops_pass.is_empty() || passwd == node.ops_pass {
        Ok(())
    } else {
        Err(anyhow!("bad operations password"))
    }
}

async fn append_file(path: &std::path::Path, text: &str) -> Result<()> {
    if text.is_empty() {
        return Ok(());
    }
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

fn render_cfg(node: &Arc<Node>) -> String {
    let mut out = format!(
        "dts\n    name      {}\n    host      {}\n    port      {}\n    root      {}\n",
        node.name,
        node.host,
        node.port,
        node.root().display()
    );
    for q in &node.queues {
        out.push_str(&format!(
            "    queue\n        name      {}\n        node      {:?}\n        port      {}\n",
            q.cfg.name, q.cfg.node, q.cfg.port
        ));
    }
    out
}

fn node_stat(node: &Arc<Node>) -> NodeStatReply {
    NodeStatReply {
        name: node.name.clone(),
        host: node.host.clone(),
        root: node.root().display().to_string(),
        uptime_sec: node.uptime_sec(),
        nqueues: node.queues.len() as u32,
        queues: node
            .queues
            .iter()
            .map(|q| QueueStatReply {
                name: q.cfg.name.clone(),
                state: q.state().to_string(),
                pending: q.pending(),
                infile: q.infile(),
                outfile: q.outfile(),
                stats: q.stats(),
            })
            .collect(),
        errs: node.errs.lock().unwrap().snapshot(),
    }
}

async fn stat_of(path: &std::path::Path) -> Result<FileStat> {
    let md = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("cannot stat {path:?}"))?;
    Ok(FileStat {
        size: md.len(),
        mode: md.permissions().mode(),
        uid: md.uid(),
        gid: md.gid(),
        atime: md.atime(),
        mtime: md.mtime(),
        ctime: md.ctime(),
        is_dir: md.is_dir(),
        is_link: md.file_type().is_symlink(),
    })
}

/// `initTransfer`: reserve a numbered spool slot for an incoming file.
async fn init_transfer(node: &Arc<Node>, qname: &str, size: u64) -> Result<Response> {
    let Some(queue) = node.queue(qname) else {
        return Ok(Response::Str(format!("Error: no queue named '{qname}'")));
    };
    let spool = node.spool_dir(qname);
    tokio::fs::create_dir_all(&spool).await?;
    let free = fileutil::disk_free(&spool)?;
    let (_, slot) = fileutil::alloc_spool_slot(&spool).await?;
    if let Err(msg) = queue.begin_incoming(slot.clone(), free, size, node.min_free) {
        let _ = fileutil::remove_any(&slot).await;
        node.log_error(msg.clone());
        return Ok(Response::Str(msg));
    }
    let root = node.root();
    let qpath = slot
        .strip_prefix(&root)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| slot.display().to_string());
    tracing::debug!("{qname}: reserved spool slot {qpath} for {size} bytes");
    Ok(Response::Str(qpath))
}

/// `endTransfer`: revalidate the completed payload and hand the entry to
/// the queue manager. Safe to reapply: an entry already complete returns
/// OK without a second delivery.
async fn end_transfer(node: &Arc<Node>, qname: &str, qpath: &str) -> Result<Response> {
    let queue = queue_of(node, qname)?;
    let dir = node.resolve(qpath);
    if queue.was_completed(&dir)
        || queue.is_queued(&dir)
        || queue.is_active_slot(&dir)
        || !dir.exists()
    {
        return Ok(Response::Str("OK".to_string()));
    }
    let ctrl = match ControlRecord::load(&dir).await {
        Ok(c) => c,
        Err(e) => {
            queue.clear_incoming();
            return Ok(Response::Str(format!("ERR no control record: {e:#}")));
        }
    };
    let fname = if ctrl.xfer_name.is_empty() {
        &ctrl.filename
    } else {
        &ctrl.xfer_name
    };
    let payload = dir.join(fname);
    if let Err(e) = checksum::validate_file(&payload, ctrl.sum32, ctrl.crc32, &ctrl.md5).await {
        let msg = format!("Error: {e}");
        node.log_error(msg.clone());
        queue.log_error(msg);
        queue.clear_incoming();
        if let Some(rec) = node.shm_record(queue.shm_idx) {
            rec.failed_xfers
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        // keep the payload for forensic inspection, outside the numbered
        // namespace
        let bad = dir.with_extension("bad");
        let _ = tokio::fs::rename(&dir, &bad).await;
        let _ = queue.pending_slots.fetch_update(
            std::sync::atomic::Ordering::AcqRel,
            std::sync::atomic::Ordering::Acquire,
            |v| Some(v.saturating_sub(1)),
        );
        return Ok(Response::Str("ERR integrity validation failed".to_string()));
    }
    queue.clear_incoming();
    queue.enqueue_work(dir);
    tracing::info!("{qname}: transfer complete for {qpath}");
    Ok(Response::Str("OK".to_string()))
}

async fn add_local_file(node: &Arc<Node>, queue: &Arc<Queue>, src: &std::path::Path) -> Result<String> {
    let fname = src
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("bad file name {src:?}"))?
        .to_string();
    let md = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("cannot stat {src:?}"))?;
    let spool = node.spool_dir(&queue.cfg.name);
    let (_, slot) = fileutil::alloc_spool_slot(&spool).await?;
    fileutil::copy_any(src, &slot.join(&fname)).await?;
    let (sum32, crc32) = checksum::file_crc_checksum(&slot.join(&fname)).await?;
    let md5 = checksum::file_md5(&slot.join(&fname)).await?;
    let ctrl = ControlRecord {
        queue_host: node.host.clone(),
        queue_name: queue.cfg.name.clone(),
        filename: fname.clone(),
        xfer_name: fname,
        src_path: src.display().to_string(),
        igst_path: format!("{}:{}", node.host, src.display()),
        md5,
        is_dir: md.is_dir(),
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
    ctrl.save(&slot).await?;
    queue
        .pending_slots
        .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    queue.enqueue_work(slot.clone());
    let root = node.root();
    Ok(slot
        .strip_prefix(&root)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| slot.display().to_string()))
}
