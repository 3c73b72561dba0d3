//! Asynchronous forwarding of log and stat events to an attached monitor.
//!
//! The daemon never blocks on the monitor: events go through an unbounded
//! channel to a forwarder task that owns the (re)connection. A dead or
//! absent monitor simply drops events.

use remote::protocol::MonitorEvent;
use remote::streams::SendStream;

enum Cmd {
    Attach(String),
    Detach,
    Event(MonitorEvent),
}

#[derive(Clone)]
pub struct MonitorHandle {
    tx: tokio::sync::mpsc::UnboundedSender<Cmd>,
}

impl MonitorHandle {
    /// Spawn the forwarder task. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(run_forwarder(rx));
        Self { tx }
    }

    pub fn attach(&self, url: String) {
        let _ = self.tx.send(Cmd::Attach(url));
    }

    pub fn detach(&self) {
        let _ = self.tx.send(Cmd::Detach);
    }

    pub fn log(&self, host: &str, line: impl Into<String>) {
        let _ = self.tx.send(Cmd::Event(MonitorEvent::Log {
            host: host.to_string(),
            line: line.into(),
        }));
    }

    pub fn stat(&self, qname: &str, stat: common::stats::XferStat) {
        let _ = self.tx.send(Cmd::Event(MonitorEvent::Stat {
            qname: qname.to_string(),
            stat,
        }));
    }
}

impl Default for MonitorHandle {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_forwarder(mut rx: tokio::sync::mpsc::UnboundedReceiver<Cmd>) {
    let mut sink: Option<SendStream<tokio::net::tcp::OwnedWriteHalf>> = None;
    let mut url: Option<String> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Cmd::Attach(u) => {
                url = Some(u);
                sink = None;
            }
            Cmd::Detach => {
                if let Some(mut s) = sink.take() {
                    let _ = s.close().await;
                }
                url = None;
            }
            Cmd::Event(event) => {
                if url.is_none() {
                    continue;
                }
                if sink.is_none() {
                    sink = connect(url.as_deref().unwrap()).await;
                }
                if let Some(s) = sink.as_mut() {
                    if s.send_control_message(&event).await.is_err() {
                        tracing::debug!("monitor connection lost, will reconnect");
                        sink = None;
                    }
                }
            }
        }
    }
}

async fn connect(url: &str) -> Option<SendStream<tokio::net::tcp::OwnedWriteHalf>> {
    let addr = url.strip_prefix("dts://").unwrap_or(url);
    match tokio::net::TcpStream::connect(addr).await {
        Ok(stream) => {
            let (_, wh) = stream.into_split();
            Some(SendStream::new(wh))
        }
        Err(e) => {
            tracing::debug!("cannot reach monitor at {addr}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote::streams::RecvStream;

    #[tokio::test]
    async fn events_reach_an_attached_monitor() -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = MonitorHandle::new();
        handle.attach(addr.to_string());
        handle.log("alpha", "queue started");

        let (stream, _) = listener.accept().await?;
        let (rh, _) = stream.into_split();
        let mut recv = RecvStream::new(rh);
        let event: MonitorEvent = recv.recv_object().await?.unwrap();
        match event {
            MonitorEvent::Log { host, line } => {
                assert_eq!(host, "alpha");
                assert_eq!(line, "queue started");
            }
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn detached_monitor_drops_events() {
        let handle = MonitorHandle::new();
        // no monitor attached; nothing to assert beyond "does not hang"
        handle.log("alpha", "dropped");
        handle.detach();
    }
}
