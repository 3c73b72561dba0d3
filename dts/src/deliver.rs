//! Endpoint delivery: copy the spooled file to the delivery directory and
//! run the configured delivery command.
//!
//! The delivery command's exit status classifies failures: 0 OK, 1 minor
//! (continue), 2 fatal for this file, 3 fatal for the queue; a missing
//! command counts as 2. A `<qname>.par` file left behind by the command
//! feeds parameters (and a `deliveryName` override) back into the control
//! record.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

use crate::node::Node;
use crate::queue::{EntryOutcome, Queue};
use common::config::DeliveryPolicy;
use common::control::ControlRecord;
use common::shm::Phase;

/// Copy attempts before the delivery is declared failed.
const DELIVERY_MAX_TRIES: u32 = 3;

/// Built-in command: delete the delivered file/tree and report OK.
const CMD_NULL: &str = "dts.null";

/// Deliver one spool entry on an endpoint queue.
pub async fn deliver(
    node: &Arc<Node>,
    queue: &Arc<Queue>,
    ctrl: &mut ControlRecord,
    slot: &std::path::Path,
) -> EntryOutcome {
    let configured = queue.delivery_dir();
    if configured.is_empty() {
        tracing::info!("{}: DLVR status=OK [No delivery directory]", queue.cfg.name);
        return EntryOutcome::Done;
    }
    let ddir = delivery_dir(node, &configured);
    match deliver_inner(node, queue, ctrl, slot, &ddir).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let msg = format!("{e:#}");
            let _ = ctrl.add_history(&ddir, false, Some(&msg)).await;
            if let Some(rec) = node.shm_record(queue.shm_idx) {
                rec.phase_end(Phase::Dlvr, false, 0.0);
            }
            EntryOutcome::FatalQueue(msg)
        }
    }
}

fn delivery_dir(node: &Arc<Node>, configured: &str) -> std::path::PathBuf {
    let p = std::path::Path::new(configured);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        node.root().join(p)
    }
}

/// Delivered file name per the deliverAs template: `$F` means the original
/// filename, `$D` the upstream deliveryName, anything else is literal;
/// with no template the deliveryName wins over the filename.
fn delivered_name(queue: &Queue, ctrl: &ControlRecord) -> String {
    let deliver_as = queue.cfg.deliver_as.as_str();
    if !deliver_as.is_empty() {
        if deliver_as.len() >= 2 && deliver_as[..2].eq_ignore_ascii_case("$F") {
            return ctrl.filename.clone();
        }
        if deliver_as.len() >= 2 && deliver_as[..2].eq_ignore_ascii_case("$D") {
            return ctrl.delivery_name.clone();
        }
        return deliver_as.to_string();
    }
    if !ctrl.delivery_name.is_empty() {
        ctrl.delivery_name.clone()
    } else {
        ctrl.filename.clone()
    }
}

/// Apply the name-collision policy to the target path.
fn resolve_collision(
    queue: &Queue,
    ctrl: &ControlRecord,
    ddir: &std::path::Path,
    name: &str,
) -> std::path::PathBuf {
    match queue.cfg.delivery_policy {
        DeliveryPolicy::Replace => ddir.join(name),
        DeliveryPolicy::Original => ddir.join(&ctrl.filename),
        DeliveryPolicy::Number => {
            let plain = ddir.join(name);
            if !plain.exists() {
                return plain;
            }
            for n in 1.. {
                let numbered = ddir.join(format!("{name}.{n}"));
                if !numbered.exists() {
                    return numbered;
                }
            }
            unreachable!()
        }
    }
}

async fn deliver_inner(
    node: &Arc<Node>,
    queue: &Arc<Queue>,
    ctrl: &mut ControlRecord,
    slot: &std::path::Path,
    ddir: &std::path::Path,
) -> Result<EntryOutcome> {
    common::fileutil::test_delivery_dir(ddir, true)
        .await
        .map_err(|e| anyhow!("Delivery directory check failed: {e:#}"))?;

    let payload_name = if ctrl.xfer_name.is_empty() {
        ctrl.filename.clone()
    } else {
        ctrl.xfer_name.clone()
    };
    let payload = slot.join(&payload_name);
    let name = delivered_name(queue, ctrl);
    let target = resolve_collision(queue, ctrl, ddir, &name);
    if !queue.cfg.deliver_as.is_empty() {
        tracing::info!("{}: DLVR deliverAs = '{}'", queue.cfg.name, name);
    }

    if let Some(rec) = node.shm_record(queue.shm_idx) {
        rec.phase_start(Phase::Disk);
    }
    common::fileutil::copy_with_retries(&payload, &target, DELIVERY_MAX_TRIES)
        .await
        .map_err(|e| anyhow!("Delivery file copy failed: {e:#}"))?;
    if let Some(rec) = node.shm_record(queue.shm_idx) {
        rec.phase_end(Phase::Disk, true, 0.0);
        rec.phase_start(Phase::Dlvr);
    }

    let mut outcome = EntryOutcome::Done;
    let delivery_cmd = queue.delivery_cmd();
    if !delivery_cmd.is_empty() {
        if delivery_cmd == CMD_NULL {
            if let Err(e) = common::fileutil::remove_any(&target).await {
                tracing::error!("{}: failed to delete '{:?}': {e:#}", queue.cfg.name, target);
            } else {
                tracing::info!("{}: DLVR auto-removed '{:?}'", queue.cfg.name, target);
            }
        } else {
            let cmd = format_delivery_cmd(&delivery_cmd, ctrl, &target, ddir);
            let status = sys_exec(ddir, &cmd).await;
            tracing::info!(
                "{}: DLVR cmd file={:?}, status={}",
                queue.cfg.name,
                target,
                status
            );
            match status {
                0 | 1 => {}
                2 => outcome = EntryOutcome::RejectFile("delivery command rejected file".into()),
                3 => {
                    let msg = "delivery command declared the queue fatal".to_string();
                    let _ = ctrl.add_history(ddir, false, Some(&msg)).await;
                    if let Some(rec) = node.shm_record(queue.shm_idx) {
                        rec.phase_end(Phase::Dlvr, false, 0.0);
                    }
                    return Ok(EntryOutcome::FatalQueue(msg));
                }
                s => {
                    outcome = EntryOutcome::RejectFile(format!(
                        "Unknown delivery cmd error, status={s}"
                    ))
                }
            }
        }
    }

    // parameters left behind by the delivery application
    let parfile = ddir.join(format!("{}.par", queue.cfg.name));
    if let Ok(text) = tokio::fs::read_to_string(&parfile).await {
        common::control::apply_delivery_params(ctrl, &text);
        let _ = tokio::fs::remove_file(&parfile).await;
        // persist the new parameters for downstream stages
        let _ = ctrl.save(slot).await;
    }

    let ok = matches!(outcome, EntryOutcome::Done);
    let msg = match &outcome {
        EntryOutcome::Done => None,
        EntryOutcome::RejectFile(m) | EntryOutcome::FatalQueue(m) => Some(m.clone()),
    };
    ctrl.add_history(ddir, ok, msg.as_deref())
        .await
        .with_context(|| format!("cannot append delivery history in {ddir:?}"))?;
    if let Some(rec) = node.shm_record(queue.shm_idx) {
        rec.phase_end(Phase::Dlvr, ok, 0.0);
    }
    tracing::info!(
        "{}: DLVR status={} file={:?}",
        queue.cfg.name,
        if ok { "OK" } else { "ERR" },
        target
    );
    Ok(outcome)
}

/// Substitute the command template tokens from the control record.
fn format_delivery_cmd(
    template: &str,
    ctrl: &ControlRecord,
    target: &std::path::Path,
    ddir: &std::path::Path,
) -> String {
    let full = target
        .canonicalize()
        .unwrap_or_else(|_| target.to_path_buf())
        .display()
        .to_string();
    let mut subs: Vec<(String, String)> = vec![
        ("$FULL".to_string(), full),
        ("$MD5".to_string(), ctrl.md5.clone()),
        ("$OH".to_string(), ctrl.queue_host.clone()),
        ("$S".to_string(), ctrl.fsize.to_string()),
        ("$F".to_string(), ctrl.filename.clone()),
        ("$D".to_string(), target.display().to_string()),
        ("$DIR".to_string(), ddir.display().to_string()),
    ];
    for p in &ctrl.params {
        subs.push((format!("${}", p.name), p.value.clone()));
    }
    // longest token first so $FULL never degrades into a $F substitution
    subs.sort_by_key(|(tok, _)| std::cmp::Reverse(tok.len()));
    let mut out = template.to_string();
    for (tok, val) in subs {
        out = out.replace(&tok, &val);
    }
    out
}

/// Execute a command string from `ewd`, honouring `<`, `>` and `>>`
/// redirection tokens. Returns the classification status: the command's
/// exit code, or 2 when the command cannot be found or died on a signal.
pub(crate) async fn sys_exec(ewd: &std::path::Path, cmd: &str) -> i32 {
    if common::debug_enabled(common::DebugCategory::Cmd) {
        tracing::info!("sysExec Cmd: {cmd}");
    } else {
        tracing::debug!("sysExec Cmd: {cmd}");
    }
    let words = match tokenize(cmd) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!("sysExec: bad command '{cmd}': {e}");
            return 2;
        }
    };
    let mut argv: Vec<String> = Vec::new();
    let mut inname: Option<String> = None;
    let mut outname: Option<(String, bool)> = None;
    let mut iter = words.into_iter();
    while let Some(w) = iter.next() {
        if let Some(rest) = w.strip_prefix(">>") {
            let name = if rest.is_empty() { iter.next() } else { Some(rest.to_string()) };
            outname = name.map(|n| (n, true));
        } else if let Some(rest) = w.strip_prefix('>') {
            let name = if rest.is_empty() { iter.next() } else { Some(rest.to_string()) };
            outname = name.map(|n| (n, false));
        } else if let Some(rest) = w.strip_prefix('<') {
            let name = if rest.is_empty() { iter.next() } else { Some(rest.to_string()) };
            inname = name;
        } else {
            argv.push(w);
        }
    }
    if argv.is_empty() {
        return 2;
    }
    let mut command = tokio::process::Command::new(&argv[0]);
    command.args(&argv[1..]).current_dir(ewd);
    if let Some(inname) = inname {
        match std::fs::File::open(ewd.join(&inname)) {
            Ok(f) => {
                command.stdin(std::process::Stdio::from(f));
            }
            Err(e) => {
                tracing::error!("sysExec: cannot open input '{inname}': {e}");
                return 2;
            }
        }
    }
    if let Some((outname, append)) = outname {
        let res = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(ewd.join(&outname));
        match res {
            Ok(f) => {
                command.stdout(std::process::Stdio::from(f));
            }
            Err(e) => {
                tracing::error!("sysExec: cannot open output '{outname}': {e}");
                return 2;
            }
        }
    }
    match command.status().await {
        Ok(status) => status.code().unwrap_or(2),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::error!("sysExec: No such command '{}'", argv[0]);
            2
        }
        Err(e) => {
            tracing::error!("sysExec: cannot run '{}': {e}", argv[0]);
            2
        }
    }
}

/// Split a command line on whitespace with single/double quote support.
fn tokenize(cmd: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    for c in cmd.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    cur.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut cur));
                        in_word = false;
                    }
                }
                c => {
                    cur.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        words.push(cur);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_handles_quotes_and_redirection() {
        assert_eq!(
            tokenize("/bin/sh -c 'exit 3'").unwrap(),
            ["/bin/sh", "-c", "exit 3"]
        );
        assert_eq!(
            tokenize("cmd a >out <in").unwrap(),
            ["cmd", "a", ">out", "<in"]
        );
        assert!(tokenize("cmd 'unterminated").is_err());
    }

    #[test]
    fn substitution_longest_token_first() {
        let mut ctrl = ControlRecord {
            filename: "obs001.fits".to_string(),
            md5: "abc123".to_string(),
            queue_host: "dts-ct".to_string(),
            fsize: 42,
            ..Default::default()
        };
        ctrl.add_param("account", "des");
        ctrl.add_param("obsepoch", "2026.58");
        let cmd = format_delivery_cmd(
            "/opt/proc $obsepoch $FULL $OH $account $F $S",
            &ctrl,
            std::path::Path::new("/dlvr/obs001.fits"),
            std::path::Path::new("/dlvr"),
        );
        assert_eq!(
            cmd,
            "/opt/proc 2026.58 /dlvr/obs001.fits dts-ct des obs001.fits 42"
        );
    }

    #[tokio::test]
    async fn sys_exec_exit_codes_and_redirection() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(sys_exec(tmp.path(), "/bin/sh -c 'exit 0'").await, 0);
        assert_eq!(sys_exec(tmp.path(), "/bin/sh -c 'exit 3'").await, 3);
        assert_eq!(sys_exec(tmp.path(), "/no/such/command_xyz").await, 2);
        assert_eq!(sys_exec(tmp.path(), "/bin/echo delivered >out.txt").await, 0);
        let out = std::fs::read_to_string(tmp.path().join("out.txt")).unwrap();
        assert_eq!(out.trim(), "delivered");
        // append mode
        assert_eq!(sys_exec(tmp.path(), "/bin/echo again >>out.txt").await, 0);
        let out = std::fs::read_to_string(tmp.path().join("out.txt")).unwrap();
        assert_eq!(out.lines().count(), 2);
    }
}
