//! Control protocol and bulk transport for the DTS daemon and its
//! clients.
//!
//! - [`protocol`] - typed request/response messages for every RPC verb
//! - [`streams`] - framed message streams shared by control and bulk ports
//! - [`port_ranges`] - consecutive bulk-port allocation out of a node's
//!   configured window
//! - [`xfer`] - the parallel-socket stripe engine
//!
//! An RPC is one request frame answered by one response frame. The bulk
//! verbs (`sendFile`, `receiveFile`) answer with an extra ready frame
//! first so the caller learns the allocated base port before payload
//! flows; [`RpcSession`] models that exchange.

use anyhow::{anyhow, Context, Result};

pub mod port_ranges;
pub mod protocol;
pub mod streams;
pub mod xfer;

pub use port_ranges::PortRange;

/// Default port layout; every one of these is configurable.
pub const DEF_COMMAND_PORT: u16 = 3000;
pub const DEF_CONTACT_PORT: u16 = 3001;
pub const DEF_LO_PORT: u16 = 3005;
pub const DEF_HI_PORT: u16 = 3099;
pub const DEF_MONITOR_PORT: u16 = 2999;
pub const DEF_SHELL_PORT: u16 = 2998;
pub const DEF_COPY_PORT: u16 = 2997;
pub const DEF_SUBMIT_PORT: u16 = 3100;

const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// RPC client for one daemon command port. Each call opens a fresh
/// connection, like the reference client library.
#[derive(Debug, Clone)]
pub struct Client {
    host: String,
    port: u16,
}

impl Client {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn connect(&self) -> Result<streams::ControlConnection> {
        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio::net::TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| anyhow!("connect to {}:{} timed out", self.host, self.port))?
        .with_context(|| format!("cannot connect to {}:{}", self.host, self.port))?;
        stream.set_nodelay(true)?;
        Ok(streams::ControlConnection::new(stream))
    }

    /// One synchronous request/response round trip.
    pub async fn call(&self, request: &protocol::Request) -> Result<protocol::Response> {
        let mut conn = self.connect().await?;
        conn.send_mut().send_control_message(request).await?;
        conn.recv_mut()
            .recv_object::<protocol::Response>()
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "daemon at {}:{} closed the connection without replying",
                    self.host,
                    self.port
                )
            })
    }

    /// Open a session for the multi-frame bulk verbs.
    pub async fn session(&self, request: &protocol::Request) -> Result<RpcSession> {
        let mut conn = self.connect().await?;
        conn.send_mut().send_control_message(request).await?;
        Ok(RpcSession { conn })
    }
}

/// An in-flight multi-frame RPC: the bulk verbs reply with a ready frame
/// carrying the allocated base port, then the final transfer stat.
pub struct RpcSession {
    conn: streams::ControlConnection,
}

impl RpcSession {
    pub async fn recv(&mut self) -> Result<protocol::Response> {
        self.conn
            .recv_mut()
            .recv_object::<protocol::Response>()
            .await?
            .ok_or_else(|| anyhow!("peer closed mid-session"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_round_trips_over_loopback() -> Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = streams::ControlConnection::new(stream);
            let req: protocol::Request = conn.recv_mut().recv_object().await.unwrap().unwrap();
            let resp = match req {
                protocol::Request::Echo { text } => protocol::Response::Str(text),
                _ => protocol::Response::Error("unexpected verb".to_string()),
            };
            conn.send_mut().send_control_message(&resp).await.unwrap();
        });
        let client = Client::new("127.0.0.1", addr.port());
        let resp = client
            .call(&protocol::Request::Echo {
                text: "hello".to_string(),
            })
            .await?;
        assert_eq!(resp, protocol::Response::Str("hello".to_string()));
        server.await?;
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_daemon_is_an_error() {
        let client = Client::new("127.0.0.1", 1);
        assert!(client.call(&protocol::Request::Ping).await.is_err());
    }
}
