//! End-to-end pipeline tests: in-process daemons wired over loopback.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use dts_tools_dts::client::QueueClient;
use dts_tools_dts::queue::QueueState;
use dts_tools_dts::recover::RecoveryLog;
use dts_tools_dts::{run_daemon, Node};
use remote::protocol::{Request, Response};

async fn start_node(cfg_text: &str, name: &str) -> Result<Arc<Node>> {
    let cfg = common::config::DtsConfig::parse(cfg_text)?;
    let node = Node::from_config(&cfg, name)?;
    let n = node.clone();
    tokio::spawn(async move {
        if let Err(e) = run_daemon(n).await {
            eprintln!("daemon failed: {e:#}");
        }
    });
    // wait for the command port
    let client = remote::Client::new("127.0.0.1", node.port);
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while client.call(&Request::Ping).await.is_err() {
        if std::time::Instant::now() > deadline {
            return Err(anyhow!("daemon '{name}' did not come up"));
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    Ok(node)
}

async fn wait_for(ms: u64, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(ms);
    loop {
        if cond() {
            return Ok(());
        }
        if std::time::Instant::now() > deadline {
            return Err(anyhow!("condition not met within {ms}ms"));
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

fn node_block(name: &str, port: u16, lo: u16, hi: u16, root: &std::path::Path) -> String {
    format!(
        "dts\n    name      {name}\n    host      127.0.0.1\n    port      {port}\n    loPort    {lo}\n    hiPort    {hi}\n    root      {}\n    minFree   1024\n",
        root.display()
    )
}

fn queue_block(
    name: &str,
    role: &str,
    src: &str,
    dest: &str,
    port: u16,
    extra: &str,
) -> String {
    let mut out = format!(
        "    queue\n        name      {name}\n        node      {role}\n        type      normal\n        mode      push\n        method    dts\n        nthreads  2\n        port      {port}\n        purge     yes\n"
    );
    if !src.is_empty() {
        out.push_str(&format!("        src       {src}\n"));
    }
    if !dest.is_empty() {
        out.push_str(&format!("        dest      {dest}\n"));
    }
    out.push_str(extra);
    out
}

#[tokio::test]
async fn three_hop_pipeline_delivers_bit_exact() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dlvr = tmp.path().join("archive");
    let roots = ["an1", "bn1", "cn1"].map(|n| tmp.path().join(n));
    let cfg = format!(
        "{}{}{}{}{}{}",
        node_block("an1", 35010, 35100, 35140, &roots[0]),
        queue_block("sci", "ingest", "", "bn1", 35150, ""),
        node_block("bn1", 35011, 35150, 35190, &roots[1]),
        queue_block("sci", "transfer", "an1", "cn1", 35200, ""),
        node_block("cn1", 35012, 35200, 35240, &roots[2]),
        queue_block(
            "sci",
            "endpoint",
            "bn1",
            "",
            35200,
            &format!("        deliveryDir {}\n", dlvr.display())
        ),
    );
    let a = start_node(&cfg, "an1").await?;
    let b = start_node(&cfg, "bn1").await?;
    let c = start_node(&cfg, "cn1").await?;

    // a 1 MB striped payload through all three hops
    let payload = tmp.path().join("obs001.fits");
    let data = common::testutils::write_payload(&payload, 1 << 20).await?;
    let client = QueueClient::new("127.0.0.1", a.port, "sci");
    let stat = client
        .submit(&payload, &[("account".to_string(), "des".to_string())], 2, 35100)
        .await?;
    assert!(stat.time_sec > 0.0);
    assert!(stat.tput_mb > 0.0);

    let delivered = dlvr.join("obs001.fits");
    wait_for(60_000, || delivered.exists()).await?;
    assert_eq!(tokio::fs::read(&delivered).await?, data);

    // spools drain back to empty everywhere
    for node in [&a, &b, &c] {
        wait_for(60_000, || {
            node.queue("sci").map(|q| q.pending() == 0).unwrap_or(false)
        })
        .await?;
        let slots = common::fileutil::numbered_subdirs(&node.spool_dir("sci")).await?;
        assert!(slots.is_empty(), "{} spool not empty", node.name);
    }

    // delivery history records the hop
    let history = tokio::fs::read_to_string(dlvr.join("_control")).await?;
    assert!(history.contains("sci"));
    assert!(history.contains("= OK"));

    // downstream queue count is visible over RPC
    let count = remote::Client::new("127.0.0.1", c.port)
        .call(&Request::GetQueueCount {
            qname: "sci".to_string(),
        })
        .await?
        .into_int()?;
    assert_eq!(count, 0);
    Ok(())
}

#[tokio::test]
async fn give_mode_forwarding_pulls_from_the_source() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dlvr = tmp.path().join("archive");
    let roots = ["dn1", "en1"].map(|n| tmp.path().join(n));
    let give_queue = queue_block("raw", "ingest", "", "en1", 35250, "")
        .replace("mode      push", "mode      give");
    let cfg = format!(
        "{}{}{}{}",
        node_block("dn1", 35013, 35250, 35290, &roots[0]),
        give_queue,
        node_block("en1", 35014, 35300, 35340, &roots[1]),
        queue_block(
            "raw",
            "endpoint",
            "dn1",
            "",
            35300,
            &format!("        deliveryDir {}\n", dlvr.display())
        ),
    );
    let d = start_node(&cfg, "dn1").await?;
    let _e = start_node(&cfg, "en1").await?;

    let payload = tmp.path().join("frame.dat");
    let data = common::testutils::write_payload(&payload, 200_000).await?;
    let client = QueueClient::new("127.0.0.1", d.port, "raw");
    client.submit(&payload, &[], 2, 35250).await?;

    let delivered = dlvr.join("frame.dat");
    wait_for(60_000, || delivered.exists()).await?;
    assert_eq!(tokio::fs::read(&delivered).await?, data);
    Ok(())
}

#[tokio::test]
async fn corrupted_spool_file_fails_end_transfer() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dlvr = tmp.path().join("archive");
    let root = tmp.path().join("fn1");
    let cfg = format!(
        "{}{}",
        node_block("fn1", 35015, 35350, 35390, &root),
        queue_block(
            "sci",
            "endpoint",
            "",
            "",
            35350,
            &format!("        deliveryDir {}\n", dlvr.display())
        ),
    );
    let f = start_node(&cfg, "fn1").await?;

    let payload = tmp.path().join("x.fits");
    common::testutils::write_payload(&payload, 100_000).await?;
    let client = QueueClient::new("127.0.0.1", f.port, "sci");
    let ctrl = dts_tools_dts::client::build_control("sci", &payload, &[]).await?;
    let qpath = client.init_transfer(ctrl.fsize).await?;
    let remote_path = format!("{}/{}", qpath, ctrl.xfer_name);
    client
        .push_payload(&payload, &remote_path, ctrl.fsize, 2, 35350)
        .await?;
    client.set_control(&qpath, &ctrl).await?;

    // corrupt one byte of the spooled payload between steps 3 and 4
    let rpc = remote::Client::new("127.0.0.1", f.port);
    let reply = rpc
        .call(&Request::Write {
            path: remote_path.clone(),
            offset: 1234,
            data: vec![0xFF],
        })
        .await?;
    assert!(!reply.is_error());

    let err = client.end_transfer(&qpath).await.unwrap_err();
    assert!(err.to_string().contains("ERR"), "got: {err:#}");

    // the payload stays in the spool for forensic inspection, set aside
    // from the numbered namespace
    let spool = f.spool_dir("sci");
    let mut found_bad = false;
    let mut entries = tokio::fs::read_dir(&spool).await?;
    while let Some(e) = entries.next_entry().await? {
        if e.path().extension().map(|x| x == "bad").unwrap_or(false) {
            found_bad = true;
        }
    }
    assert!(found_bad, "no .bad entry kept in the spool");
    assert!(common::fileutil::numbered_subdirs(&spool).await?.is_empty());

    // a node error mentioning the failed checksum is preserved
    let Response::Node(stat) = rpc.call(&Request::NodeStat).await? else {
        panic!("nodeStat did not return a node reply");
    };
    assert!(stat
        .errs
        .iter()
        .any(|e| e.contains("CRC") || e.contains("checksum") || e.contains("SUM32")));
    Ok(())
}

#[tokio::test]
async fn end_transfer_is_retry_safe() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dlvr = tmp.path().join("archive");
    let root = tmp.path().join("gn2");
    let cfg = format!(
        "{}{}",
        node_block("gn2", 35020, 35550, 35590, &root),
        queue_block(
            "sci",
            "endpoint",
            "",
            "",
            35550,
            &format!("        deliveryDir {}\n", dlvr.display())
        ),
    );
    let g = start_node(&cfg, "gn2").await?;

    let payload = tmp.path().join("y.fits");
    common::testutils::write_payload(&payload, 70_000).await?;
    let client = QueueClient::new("127.0.0.1", g.port, "sci");
    let ctrl = dts_tools_dts::client::build_control("sci", &payload, &[]).await?;
    let qpath = client.init_transfer(ctrl.fsize).await?;
    let remote_path = format!("{}/{}", qpath, ctrl.xfer_name);
    client
        .push_payload(&payload, &remote_path, ctrl.fsize, 1, 35550)
        .await?;
    client.set_control(&qpath, &ctrl).await?;
    client.end_transfer(&qpath).await?;
    // reapplying endTransfer on a completed entry is OK and does not
    // deliver twice
    client.end_transfer(&qpath).await?;
    client.end_transfer(&qpath).await?;

    wait_for(30_000, || dlvr.join("y.fits").exists()).await?;
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let mut entries = tokio::fs::read_dir(&dlvr).await?;
    let mut names = Vec::new();
    while let Some(e) = entries.next_entry().await? {
        names.push(e.file_name().to_string_lossy().into_owned());
    }
    names.retain(|n| n != "_control");
    assert_eq!(names, ["y.fits".to_string()]);
    Ok(())
}

#[tokio::test]
async fn back_pressure_rejects_over_the_ceiling() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dlvr = tmp.path().join("archive");
    let root = tmp.path().join("gn1");
    // slow delivery keeps entries pending; ceiling of 2
    let cfg = format!(
        "{}{}",
        node_block("gn1", 35016, 35400, 35440, &root),
        queue_block(
            "slow",
            "endpoint",
            "",
            "",
            35400,
            &format!(
                "        ceiling   2\n        deliveryDir {}\n        deliveryCmd /bin/sh -c 'sleep 3'\n",
                dlvr.display()
            )
        ),
    );
    let g = start_node(&cfg, "gn1").await?;

    let client = QueueClient::new("127.0.0.1", g.port, "slow");
    let mut accepted = 0;
    let mut rejected = Vec::new();
    for i in 0..5 {
        let payload = tmp.path().join(format!("f{i}.dat"));
        common::testutils::write_payload(&payload, 70_000).await?;
        match client.submit(&payload, &[], 1, 35400).await {
            Ok(_) => accepted += 1,
            Err(e) => rejected.push(e.to_string()),
        }
    }
    assert_eq!(accepted, 2, "rejects: {rejected:?}");
    assert_eq!(rejected.len(), 3);
    for e in &rejected {
        assert!(e.starts_with("Error: Queue"), "unexpected error: {e}");
    }
    // nothing was lost: the accepted two eventually deliver
    wait_for(60_000, || {
        g.queue("slow").map(|q| q.pending() == 0).unwrap_or(false)
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn fatal_delivery_exit_pauses_the_queue() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dlvr = tmp.path().join("archive");
    let root = tmp.path().join("hn1");
    let cfg = format!(
        "{}{}",
        node_block("hn1", 35017, 35450, 35490, &root),
        queue_block(
            "sci",
            "endpoint",
            "",
            "",
            35450,
            &format!(
                "        deliveryDir {}\n        deliveryCmd /bin/sh -c 'exit 3'\n",
                dlvr.display()
            )
        ),
    );
    let h = start_node(&cfg, "hn1").await?;

    let payload = tmp.path().join("z.fits");
    common::testutils::write_payload(&payload, 70_000).await?;
    let client = QueueClient::new("127.0.0.1", h.port, "sci");
    client.submit(&payload, &[], 1, 35450).await?;

    let q = h.queue("sci").unwrap();
    wait_for(30_000, || q.state() == QueueState::Paused).await?;

    // nodeStat reports the pause
    let Response::Node(stat) = remote::Client::new("127.0.0.1", h.port)
        .call(&Request::NodeStat)
        .await?
    else {
        panic!("nodeStat did not return a node reply");
    };
    assert_eq!(stat.queues[0].state, "paused");

    // and new submissions are refused until startQueue
    let payload2 = tmp.path().join("z2.fits");
    common::testutils::write_payload(&payload2, 70_000).await?;
    let err = client.submit(&payload2, &[], 1, 35450).await.unwrap_err();
    assert!(err.to_string().starts_with("Error: Queue"));
    Ok(())
}

#[tokio::test]
async fn sandbox_scopes_escape_attempts() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("in1");
    let cfg = format!(
        "{}{}",
        node_block("in1", 35018, 35495, 35499, &root),
        queue_block("sci", "endpoint", "", "", 35495, ""),
    );
    let node = start_node(&cfg, "in1").await?;

    let rpc = remote::Client::new("127.0.0.1", node.port);
    let reply = rpc
        .call(&Request::Dir {
            path: "/../../etc".to_string(),
            long: false,
        })
        .await?;
    let Response::List(entries) = reply else {
        panic!("dir did not return a listing: {reply:?}");
    };
    // scoped inside the sandbox: a fresh empty directory, not /etc
    assert!(entries.is_empty());
    assert!(node.root().join("etc").is_dir());
    Ok(())
}

#[tokio::test]
async fn offline_recovery_replays_pending_files() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dlvr = tmp.path().join("archive");
    let root = tmp.path().join("jn1");
    let qdir = tmp.path().join("dtsq-work");

    let payload = tmp.path().join("x.fits");
    let data = common::testutils::write_payload(&payload, 100_000).await?;

    // the daemon is down: submission fails and lands in the recovery log
    let log = RecoveryLog::at(qdir.join("sci"), "sci");
    let client = QueueClient::new("127.0.0.1", 35019, "sci");
    let err = client.submit(&payload, &[], 1, 35500).await;
    assert!(err.is_err());
    log.save(&payload, "-q sci -H 127.0.0.1 -p 35019", "Cannot contact DTS host")
        .await?;
    let entries = log.entries().await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].host, common::local_hostname());
    assert!(entries[0].path.ends_with("x.fits"));

    // daemon comes back; the replay drains the recovery file
    let cfg = format!(
        "{}{}",
        node_block("jn1", 35019, 35500, 35540, &root),
        queue_block(
            "sci",
            "endpoint",
            "",
            "",
            35500,
            &format!("        deliveryDir {}\n", dlvr.display())
        ),
    );
    let _node = start_node(&cfg, "jn1").await?;

    let mut remaining = Vec::new();
    for entry in log.entries().await? {
        let path = std::path::PathBuf::from(&entry.path);
        if client.submit(&path, &[], 1, 35500).await.is_err() {
            remaining.push(entry);
        }
    }
    log.rewrite(&remaining).await?;
    assert!(log.entries().await?.is_empty());

    wait_for(30_000, || dlvr.join("x.fits").exists()).await?;
    assert_eq!(tokio::fs::read(dlvr.join("x.fits")).await?, data);

    // the offline mirrors upload on the next successful contact
    log.upload_offline(&client.client).await?;
    assert!(!log.dir().join("Recover.offline").exists());
    Ok(())
}
