//! Parallel-socket bulk transport.
//!
//! A file of size F moves as N contiguous stripes, each on its own TCP
//! connection, in parallel. Stripe i covers [i*F/N, (i+1)*F/N). Small
//! files degrade to a single stripe. Every stripe carries a framed
//! preamble (sizes, a verify cookie, the expected checksum under the
//! chunk/stripe policies), then raw payload, then a closing trailer
//! exchange of observed checksum and byte count. Any stripe failure
//! aborts the whole transfer and the receiver truncates the partial file.

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::port_ranges::{PortRange, SOCK_MAX_TRY, SOCK_RETRY_PAUSE};
use crate::protocol::{ChecksumPolicy, PacketHeader, StripeHeader, StripeTrailer};
use crate::streams::{RecvStream, SendStream};
use common::checksum::{inet_checksum16, InetSum32};
use common::stats::{Direction, EndpointRole, XferStat, XferStatus};

/// Files below this size always move as one stripe on the base port.
pub const SMALL_FILE_THRESHOLD: u64 = 65536;

/// Payload block size.
const BLOCK_SIZE: usize = 262144;

/// Window for the passive side to wait for its peer's connections; covers
/// the peer's full connect retry budget.
const ACCEPT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Stripe count actually used for a file.
pub fn effective_stripes(fsize: u64, nthreads: u32) -> u32 {
    if fsize < SMALL_FILE_THRESHOLD {
        1
    } else {
        nthreads.max(1)
    }
}

/// Offsets and lengths of each stripe. Lengths always sum to `fsize` and
/// ranges never overlap.
pub fn stripe_ranges(fsize: u64, nthreads: u32) -> Vec<(u64, u64)> {
    let n = effective_stripes(fsize, nthreads) as u64;
    (0..n)
        .map(|i| {
            let start = i * fsize / n;
            let end = (i + 1) * fsize / n;
            (start, end - start)
        })
        .collect()
}

/// Per-transfer parameters shared by both endpoints.
#[derive(Debug, Clone)]
pub struct XferParams {
    pub path: std::path::PathBuf,
    pub fsize: u64,
    pub nthreads: u32,
    pub checksum_policy: ChecksumPolicy,
    /// Mbps cap, 0 = uncapped.
    pub rate_mbps: u32,
    /// Reported in the transfer stat; push unless the pull verbs say
    /// otherwise.
    pub direction: Direction,
    pub cancel: tokio_util::sync::CancellationToken,
}

/// How this endpoint obtains its data connections.
pub enum Endpoint {
    /// Already-bound consecutive listeners, one per stripe.
    Listen(Vec<tokio::net::TcpListener>),
    /// Open connections to the peer's bulk window.
    Connect { host: String, base_port: u16 },
}

/// Bind a listening endpoint for `fsize`/`nthreads` out of the node's
/// bulk window. Returns the chosen base port for the peer.
pub async fn bind_endpoint(
    range: &PortRange,
    preferred_base: u16,
    fsize: u64,
    nthreads: u32,
) -> Result<(u16, Vec<tokio::net::TcpListener>)> {
    let n = effective_stripes(fsize, nthreads);
    let ip = std::net::IpAddr::from(std::net::Ipv4Addr::UNSPECIFIED);
    range.bind_consecutive(ip, preferred_base, n).await
}

/// Transfer the file out. Returns the transfer statistics; `Err` only for
/// setup failures, a failed transfer comes back as an ERR stat.
pub async fn send_file(params: &XferParams, endpoint: Endpoint) -> Result<XferStat> {
    let ranges = stripe_ranges(params.fsize, params.nthreads);
    if common::debug_enabled(common::DebugCategory::Xfer) {
        tracing::info!(
            "sending {:?}: {} bytes over {} stripe(s)",
            params.path,
            params.fsize,
            ranges.len()
        );
    }
    let (base_port, conns) = establish(endpoint, ranges.len() as u32).await?;
    let stat = XferStat {
        direction: params.direction,
        role: EndpointRole::Source,
        base_port,
        nthreads: ranges.len() as u32,
        fsize: params.fsize,
        ..Default::default()
    };
    // under the chunk/stripe policies the preamble carries each stripe's
    // expected checksum, which costs one pre-scan
    let expect_sums = match params.checksum_policy {
        ChecksumPolicy::Chunk | ChecksumPolicy::Stripe => {
            Some(stripe_sums(&params.path, &ranges).await?)
        }
        _ => None,
    };
    let gate = std::sync::Arc::new(throttle::RateGate::mbps(params.rate_mbps));
    let started = std::time::Instant::now();
    let mut tasks = tokio::task::JoinSet::new();
    for (i, (conn, (offset, length))) in conns.into_iter().zip(ranges.iter().copied()).enumerate()
    {
        let params = params.clone();
        let expect = expect_sums.as_ref().map(|v| v[i]);
        let gate = gate.clone();
        tasks.spawn(async move { send_stripe(&params, conn, offset, length, expect, gate).await });
    }
    let (bytes, failure, cancelled) = join_stripes(&mut tasks, &params.cancel).await;
    if let Some(e) = failure {
        tracing::error!("transfer of {:?} failed: {:#}", params.path, e);
        let mut stat = stat.failed();
        if cancelled {
            stat.status = XferStatus::Aborted;
        }
        return Ok(stat);
    }
    Ok(stat.finish(bytes, started.elapsed()))
}

/// Receive the file into `params.path`. The file is pre-allocated to its
/// final size; each stripe writes only its own region. A failed stripe
/// aborts the transfer and truncates the partial file.
pub async fn recv_file(params: &XferParams, endpoint: Endpoint) -> Result<XferStat> {
    let ranges = stripe_ranges(params.fsize, params.nthreads);
    let (base_port, conns) = establish(endpoint, ranges.len() as u32).await?;
    let stat = XferStat {
        direction: params.direction,
        role: EndpointRole::Sink,
        base_port,
        nthreads: ranges.len() as u32,
        fsize: params.fsize,
        ..Default::default()
    };
    common::fileutil::prealloc(&params.path, params.fsize).await?;
    let started = std::time::Instant::now();
    let mut tasks = tokio::task::JoinSet::new();
    for conn in conns {
        let params = params.clone();
        tasks.spawn(async move { recv_stripe(&params, conn).await });
    }
    let (bytes, failure, cancelled) = join_stripes(&mut tasks, &params.cancel).await;
    if let Some(e) = failure {
        tracing::error!("receive of {:?} failed: {:#}", params.path, e);
        // keep nothing of a corrupt payload
        if let Ok(f) = tokio::fs::OpenOptions::new().write(true).open(&params.path).await {
            let _ = f.set_len(0).await;
        }
        let mut stat = stat.failed();
        if cancelled {
            stat.status = XferStatus::Aborted;
        }
        return Ok(stat);
    }
    Ok(stat.finish(bytes, started.elapsed()))
}

/// Collect stripe results. The first failure cancels the remaining
/// stripes; the returned flag says whether an outside cancellation came
/// first (ABORTED) rather than a stripe error (ERR).
async fn join_stripes(
    tasks: &mut tokio::task::JoinSet<Result<u64>>,
    cancel: &tokio_util::sync::CancellationToken,
) -> (u64, Option<anyhow::Error>, bool) {
    let mut bytes = 0u64;
    let mut failure: Option<anyhow::Error> = None;
    let mut externally_cancelled = false;
    while let Some(res) = tasks.join_next().await {
        let err = match res {
            Ok(Ok(n)) => {
                bytes += n;
                continue;
            }
            Ok(Err(e)) => e,
            Err(e) => anyhow!("stripe task panicked: {e}"),
        };
        if failure.is_none() {
            externally_cancelled = cancel.is_cancelled();
            cancel.cancel();
            failure = Some(err);
        }
    }
    (bytes, failure, externally_cancelled)
}

async fn establish(
    endpoint: Endpoint,
    nstripes: u32,
) -> Result<(u16, Vec<tokio::net::TcpStream>)> {
    match endpoint {
        Endpoint::Listen(listeners) => {
            if listeners.len() != nstripes as usize {
                bail!(
                    "endpoint has {} listeners for {} stripes",
                    listeners.len(),
                    nstripes
                );
            }
            let base = listeners[0].local_addr()?.port();
            let mut conns = Vec::with_capacity(listeners.len());
            for listener in &listeners {
                let (stream, peer) = tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept())
                    .await
                    .with_context(|| {
                        format!(
                            "timed out waiting for peer on port {}",
                            listener.local_addr().map(|a| a.port()).unwrap_or(0)
                        )
                    })??;
                tracing::trace!("accepted stripe connection from {peer}");
                stream.set_nodelay(true)?;
                conns.push(stream);
            }
            Ok((base, conns))
        }
        Endpoint::Connect { host, base_port } => {
            let mut conns = Vec::with_capacity(nstripes as usize);
            for i in 0..nstripes {
                let port = base_port + i as u16;
                conns.push(connect_with_retry(&host, port).await?);
            }
            Ok((base_port, conns))
        }
    }
}

async fn connect_with_retry(host: &str, port: u16) -> Result<tokio::net::TcpStream> {
    let mut last_err = None;
    for attempt in 1..=SOCK_MAX_TRY {
        match tokio::net::TcpStream::connect((host, port)).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!("connect to {}:{} failed (try {}): {}", host, port, attempt, e);
                last_err = Some(e);
                if attempt < SOCK_MAX_TRY {
                    tokio::time::sleep(SOCK_RETRY_PAUSE).await;
                }
            }
        }
    }
    Err(anyhow!(
        "cannot connect to {}:{} after {} attempts: {}",
        host,
        port,
        SOCK_MAX_TRY,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// Checksums of each stripe region, one scan per stripe.
async fn stripe_sums(path: &std::path::Path, ranges: &[(u64, u64)]) -> Result<Vec<u32>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {path:?} for stripe checksums"))?;
    let mut sums = Vec::with_capacity(ranges.len());
    let mut buf = vec![0u8; BLOCK_SIZE];
    for (offset, length) in ranges.iter().copied() {
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut sum = InetSum32::default();
        let mut left = length;
        while left > 0 {
            let want = buf.len().min(left as usize);
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                bail!("short read computing stripe checksum of {path:?}");
            }
            sum.update(&buf[..n]);
            left -= n as u64;
        }
        sums.push(sum.finish());
    }
    Ok(sums)
}

async fn send_stripe(
    params: &XferParams,
    conn: tokio::net::TcpStream,
    offset: u64,
    length: u64,
    expect_sum: Option<u32>,
    gate: std::sync::Arc<Option<throttle::RateGate>>,
) -> Result<u64> {
    let (rh, wh) = conn.into_split();
    let mut send = SendStream::new(wh);
    let mut recv = RecvStream::new(rh);

    let cookie: u16 = rand::random();
    let header = StripeHeader {
        file_size: params.fsize,
        offset,
        length,
        cookie,
        expect_sum,
    };
    send.send_control_message(&header).await?;
    let echo: StripeHeader = recv
        .recv_object()
        .await?
        .ok_or_else(|| anyhow!("peer closed during stripe handshake"))?;
    if echo.cookie != cookie || echo.offset != offset || echo.length != length {
        bail!(
            "stripe handshake mismatch: sent {:?}, peer echoed {:?}",
            header,
            echo
        );
    }

    let std_file = std::fs::File::open(&params.path)
        .with_context(|| format!("cannot open {:?} for sending", params.path))?;
    #[cfg(target_os = "linux")]
    {
        let _ = nix::fcntl::posix_fadvise(
            std::os::unix::io::AsRawFd::as_raw_fd(&std_file),
            offset as i64,
            length as i64,
            nix::fcntl::PosixFadviseAdvice::POSIX_FADV_SEQUENTIAL,
        );
    }
    let mut file = tokio::fs::File::from_std(std_file);
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut sum = InetSum32::default();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut sent = 0u64;
    while sent < length {
        if params.cancel.is_cancelled() {
            bail!("transfer cancelled");
        }
        let want = buf.len().min((length - sent) as usize);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            bail!("short read at offset {} of {:?}", offset + sent, params.path);
        }
        if let Some(gate) = gate.as_ref() {
            gate.acquire(n as u64).await;
        }
        if params.checksum_policy == ChecksumPolicy::Packet {
            let packet = PacketHeader {
                len: n as u32,
                sum16: inet_checksum16(&buf[..n]),
            };
            send.send_control_message(&packet).await?;
        }
        if params.checksum_policy != ChecksumPolicy::None {
            sum.update(&buf[..n]);
        }
        send.send_raw(&buf[..n]).await?;
        sent += n as u64;
    }
    send.flush().await?;

    let observed = sum.finish();
    send.send_control_message(&StripeTrailer {
        sum: observed,
        bytes: sent,
        ok: true,
    })
    .await?;
    let peer: StripeTrailer = recv
        .recv_object()
        .await?
        .ok_or_else(|| anyhow!("peer closed before stripe trailer"))?;
    if !peer.ok {
        bail!("peer rejected stripe at offset {offset}");
    }
    if peer.bytes != length {
        bail!("peer wrote {} of {} bytes at offset {}", peer.bytes, length, offset);
    }
    if params.checksum_policy != ChecksumPolicy::None && peer.sum != observed {
        bail!(
            "stripe checksum mismatch at offset {}: {} != {}",
            offset,
            observed,
            peer.sum
        );
    }
    Ok(sent)
}

async fn recv_stripe(params: &XferParams, conn: tokio::net::TcpStream) -> Result<u64> {
    let (rh, wh) = conn.into_split();
    let mut send = SendStream::new(wh);
    let mut recv = RecvStream::new(rh);

    let header: StripeHeader = recv
        .recv_object()
        .await?
        .ok_or_else(|| anyhow!("peer closed before stripe header"))?;
    if header.file_size != params.fsize {
        bail!(
            "stripe header for a {}-byte file, expected {}",
            header.file_size,
            params.fsize
        );
    }
    send.send_control_message(&header).await?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&params.path)
        .await
        .with_context(|| format!("cannot open {:?} for writing", params.path))?;
    file.seek(std::io::SeekFrom::Start(header.offset)).await?;

    let mut sum = InetSum32::default();
    let mut received = 0u64;
    if params.checksum_policy == ChecksumPolicy::Packet {
        let mut packet_buf = Vec::with_capacity(BLOCK_SIZE);
        while received < header.length {
            if params.cancel.is_cancelled() {
                bail!("transfer cancelled");
            }
            let packet: PacketHeader = recv
                .recv_object()
                .await?
                .ok_or_else(|| anyhow!("peer closed mid-stripe"))?;
            packet_buf.clear();
            recv.copy_exact_to(&mut packet_buf, packet.len as u64, BLOCK_SIZE, |_| {})
                .await?;
            if inet_checksum16(&packet_buf) != packet.sum16 {
                bail!("packet checksum failed at offset {}", header.offset + received);
            }
            sum.update(&packet_buf);
            file.write_all(&packet_buf).await?;
            received += packet.len as u64;
        }
    } else {
        received = recv
            .copy_exact_to(&mut file, header.length, BLOCK_SIZE, |block| {
                if params.checksum_policy != ChecksumPolicy::None {
                    sum.update(block);
                }
            })
            .await?;
    }
    file.flush().await?;

    let observed = sum.finish();
    let mut ok = true;
    if let Some(expect) = header.expect_sum {
        if observed != expect {
            tracing::error!(
                "Error: checksum failed for stripe at offset {}, {} != {}",
                header.offset,
                expect,
                observed
            );
            ok = false;
        }
    }
    let peer: StripeTrailer = recv
        .recv_object()
        .await?
        .ok_or_else(|| anyhow!("peer closed before stripe trailer"))?;
    if params.checksum_policy != ChecksumPolicy::None && peer.sum != observed {
        tracing::error!(
            "Error: checksum failed for stripe at offset {}, {} != {}",
            header.offset,
            peer.sum,
            observed
        );
        ok = false;
    }
    send.send_control_message(&StripeTrailer {
        sum: observed,
        bytes: received,
        ok,
    })
    .await?;
    if !ok {
        bail!("stripe at offset {} failed verification", header.offset);
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripe_geometry_covers_the_file() {
        for (fsize, n) in [(0u64, 4u32), (1, 4), (65535, 8), (65536, 3), (1 << 24, 7)] {
            let ranges = stripe_ranges(fsize, n);
            let total: u64 = ranges.iter().map(|(_, len)| len).sum();
            assert_eq!(total, fsize, "fsize={fsize} n={n}");
            // contiguity implies no overlap
            let mut expect_off = 0;
            for (off, len) in ranges {
                assert_eq!(off, expect_off);
                expect_off = off + len;
            }
        }
    }

    #[test]
    fn small_files_use_one_stripe() {
        assert_eq!(effective_stripes(SMALL_FILE_THRESHOLD - 1, 8), 1);
        assert_eq!(effective_stripes(SMALL_FILE_THRESHOLD, 8), 8);
        assert_eq!(effective_stripes(1 << 20, 0), 1);
    }

    async fn loopback_transfer(
        size: usize,
        nthreads: u32,
        policy: ChecksumPolicy,
        rate_mbps: u32,
    ) -> anyhow::Result<(XferStat, XferStat)> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src.dat");
        let dst = tmp.path().join("dst.dat");
        let data = common::testutils::write_payload(&src, size).await?;

        let send_params = XferParams {
            path: src.clone(),
            fsize: size as u64,
            nthreads,
            checksum_policy: policy,
            rate_mbps,
            direction: Direction::Push,
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        let recv_params = XferParams {
            path: dst.clone(),
            ..send_params.clone()
        };

        let range = PortRange::new(43100, 43180)?;
        let (base, listeners) =
            bind_endpoint(&range, 43100, size as u64, nthreads).await?;
        let recv_task = tokio::spawn(async move {
            recv_file(&recv_params, Endpoint::Listen(listeners)).await
        });
        let send_stat = send_file(
            &send_params,
            Endpoint::Connect {
                host: "127.0.0.1".to_string(),
                base_port: base,
            },
        )
        .await?;
        let recv_stat = recv_task.await??;

        if send_stat.status == XferStatus::Ok {
            assert_eq!(tokio::fs::read(&dst).await?, data);
        }
        Ok((send_stat, recv_stat))
    }

    #[tokio::test]
    async fn multi_stripe_transfer_is_bit_exact() -> anyhow::Result<()> {
        let (s, r) = loopback_transfer(300_000, 4, ChecksumPolicy::Stripe, 0).await?;
        assert_eq!(s.status, XferStatus::Ok);
        assert_eq!(r.status, XferStatus::Ok);
        assert_eq!(s.nthreads, 4);
        assert_eq!(s.bytes, 300_000);
        assert!(s.time_sec > 0.0);
        assert!(s.tput_mb > 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn small_file_degrades_to_single_stripe() -> anyhow::Result<()> {
        let (s, r) = loopback_transfer(4096, 8, ChecksumPolicy::Stripe, 0).await?;
        assert_eq!(s.status, XferStatus::Ok);
        assert_eq!(s.nthreads, 1);
        assert_eq!(r.nthreads, 1);
        Ok(())
    }

    #[tokio::test]
    async fn packet_policy_round_trips() -> anyhow::Result<()> {
        let (s, r) = loopback_transfer(200_000, 2, ChecksumPolicy::Packet, 0).await?;
        assert_eq!(s.status, XferStatus::Ok);
        assert_eq!(r.status, XferStatus::Ok);
        Ok(())
    }

    #[tokio::test]
    async fn rate_capped_transfer_still_delivers() -> anyhow::Result<()> {
        // 400 Mbps cap on a 128 KiB file; pacing must not corrupt data
        let (s, r) = loopback_transfer(131072, 1, ChecksumPolicy::Stripe, 400).await?;
        assert_eq!(s.status, XferStatus::Ok);
        assert_eq!(r.status, XferStatus::Ok);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_stripe_aborts_and_truncates() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src.dat");
        let dst = tmp.path().join("dst.dat");
        common::testutils::write_payload(&src, 200_000).await?;

        let params = XferParams {
            path: src.clone(),
            fsize: 200_000,
            nthreads: 2,
            checksum_policy: ChecksumPolicy::Stripe,
            rate_mbps: 0,
            direction: Direction::Push,
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        let mut recv_params = params.clone();
        recv_params.path = dst.clone();

        let range = PortRange::new(43200, 43260)?;
        let (base, listeners) = bind_endpoint(&range, 43200, 200_000, 2).await?;
        let recv_task =
            tokio::spawn(async move { recv_file(&recv_params, Endpoint::Listen(listeners)).await });

        // a sender whose advertised stripe checksums are wrong
        let ranges = stripe_ranges(200_000, 2);
        let mut handles = Vec::new();
        for (i, (offset, length)) in ranges.into_iter().enumerate() {
            let params = params.clone();
            let port = base + i as u16;
            handles.push(tokio::spawn(async move {
                let conn = connect_with_retry("127.0.0.1", port).await?;
                send_stripe(
                    &params,
                    conn,
                    offset,
                    length,
                    Some(0xDEADBEEF), // never the real checksum
                    std::sync::Arc::new(None),
                )
                .await
            }));
        }
        let recv_stat = recv_task.await??;
        assert_eq!(recv_stat.status, XferStatus::Err);
        // the partial file was truncated for forensic clarity
        assert_eq!(tokio::fs::metadata(&dst).await?.len(), 0);
        for h in handles {
            assert!(h.await?.is_err());
        }
        Ok(())
    }
}
