//! Bulk-port window allocation.
//!
//! A transfer of N stripes needs N consecutive ports out of the node's
//! configured [lo, hi] window, each probeable by actually binding it.
//! Allocation retries for a bounded number of rounds before the transfer
//! is declared failed.

use anyhow::{anyhow, Context};

/// Socket retry budget: rounds x pause, applied both to port allocation
/// and to stripe connects.
pub const SOCK_MAX_TRY: u32 = 5;
pub const SOCK_RETRY_PAUSE: std::time::Duration = std::time::Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn new(lo: u16, hi: u16) -> anyhow::Result<Self> {
        if lo == 0 {
            return Err(anyhow!("Port 0 is not allowed in ranges"));
        }
        if lo > hi {
            return Err(anyhow!("Invalid port range: start port {lo} > end port {hi}"));
        }
        Ok(Self { lo, hi })
    }

    /// Parse a range from a string like "3005-3099" or a single port.
    pub fn parse(range_str: &str) -> anyhow::Result<Self> {
        let range_str = range_str.trim();
        if let Some((start_str, end_str)) = range_str.split_once('-') {
            let start: u16 = start_str
                .trim()
                .parse()
                .with_context(|| format!("Invalid start port in range: {start_str}"))?;
            let end: u16 = end_str
                .trim()
                .parse()
                .with_context(|| format!("Invalid end port in range: {end_str}"))?;
            Self::new(start, end)
        } else {
            let port: u16 = range_str
                .parse()
                .with_context(|| format!("Invalid port: {range_str}"))?;
            Self::new(port, port)
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.lo..=self.hi).contains(&port)
    }

    /// Bind `count` consecutive ports inside the window, preferring the
    /// given base port. Listeners stay bound; the caller accepts on them.
    ///
    /// Scans the window once per round, up to [`SOCK_MAX_TRY`] rounds with
    /// a pause between rounds.
    pub async fn bind_consecutive(
        &self,
        ip: std::net::IpAddr,
        preferred_base: u16,
        count: u32,
    ) -> anyhow::Result<(u16, Vec<tokio::net::TcpListener>)> {
        if count == 0 {
            return Err(anyhow!("cannot allocate zero bulk ports"));
        }
        let mut attempts = 0u32;
        for round in 0..SOCK_MAX_TRY {
            // candidate bases: the preferred base first, then the rest of
            // the window
            let last_base = (self.hi as u32).saturating_sub(count - 1).max(self.lo as u32) as u16;
            let mut bases: Vec<u16> = Vec::new();
            if self.contains(preferred_base) && preferred_base <= last_base {
                bases.push(preferred_base);
            }
            bases.extend((self.lo..=last_base).filter(|b| *b != preferred_base));
            for base in bases {
                attempts += 1;
                match try_bind_window(ip, base, count).await {
                    Ok(listeners) => {
                        tracing::debug!(
                            "bound {} bulk ports at {}:{} after {} attempts",
                            count,
                            ip,
                            base,
                            attempts
                        );
                        return Ok((base, listeners));
                    }
                    Err(e) => {
                        tracing::trace!("bulk window {}+{} unavailable: {}", base, count, e);
                    }
                }
            }
            if round + 1 < SOCK_MAX_TRY {
                tracing::debug!(
                    "no free bulk window of {} ports in {}-{}, retrying (round {}/{})",
                    count,
                    self.lo,
                    self.hi,
                    round + 1,
                    SOCK_MAX_TRY
                );
                tokio::time::sleep(SOCK_RETRY_PAUSE).await;
            }
        }
        Err(anyhow!(
            "Failed to allocate {} consecutive bulk ports in {}-{} after {} attempts",
            count,
            self.lo,
            self.hi,
            attempts
        ))
    }
}

async fn try_bind_window(
    ip: std::net::IpAddr,
    base: u16,
    count: u32,
) -> anyhow::Result<Vec<tokio::net::TcpListener>> {
    let mut listeners = Vec::with_capacity(count as usize);
    for i in 0..count {
        let port = base
            .checked_add(i as u16)
            .ok_or_else(|| anyhow!("port overflow at {base}+{i}"))?;
        let addr = std::net::SocketAddr::new(ip, port);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot bind {addr}"))?;
        listeners.push(listener);
    }
    Ok(listeners)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range_and_single_port() {
        assert_eq!(
            PortRange::parse("3005-3099").unwrap(),
            PortRange { lo: 3005, hi: 3099 }
        );
        assert_eq!(
            PortRange::parse("8080").unwrap(),
            PortRange { lo: 8080, hi: 8080 }
        );
        assert!(PortRange::parse("9000-8000").is_err()); // start > end
        assert!(PortRange::parse("0-100").is_err()); // port 0 not allowed
        assert!(PortRange::parse("abc").is_err()); // non-numeric
    }

    #[tokio::test]
    async fn binds_consecutive_ports() -> anyhow::Result<()> {
        // a private high window to avoid colliding with other tests
        let range = PortRange::new(42345, 42360)?;
        let ip: std::net::IpAddr = "127.0.0.1".parse()?;
        let (base, listeners) = range.bind_consecutive(ip, 42345, 4).await?;
        assert_eq!(listeners.len(), 4);
        for (i, l) in listeners.iter().enumerate() {
            assert_eq!(l.local_addr()?.port(), base + i as u16);
        }
        Ok(())
    }

    #[tokio::test]
    async fn skips_occupied_windows() -> anyhow::Result<()> {
        let range = PortRange::new(42400, 42410)?;
        let ip: std::net::IpAddr = "127.0.0.1".parse()?;
        // occupy the preferred base so allocation must slide forward
        let _blocker = tokio::net::TcpListener::bind((ip, 42400)).await?;
        let (base, listeners) = range.bind_consecutive(ip, 42400, 2).await?;
        assert!(base > 42400);
        assert_eq!(listeners.len(), 2);
        Ok(())
    }
}
