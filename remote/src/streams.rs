//! Framed message streams.
//!
//! Control messages are length-delimited bincode frames; stripe payloads
//! ride raw on the same connection between a header and a trailer frame.
//! Generic over the underlying halves so the control port and the bulk
//! ports share one implementation.

use bytes::Buf;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Framed send stream for length-delimited messages.
#[derive(Debug)]
pub struct SendStream<W = OwnedWriteHalf> {
    framed: tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        let framed = tokio_util::codec::FramedWrite::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    pub async fn send_control_message<T: serde::Serialize>(
        &mut self,
        obj: &T,
    ) -> anyhow::Result<()> {
        let bytes = bincode::serialize(obj)?;
        self.framed.send(bytes::Bytes::from(bytes)).await?;
        self.framed.flush().await?;
        Ok(())
    }

    /// Write raw payload bytes between frames.
    pub async fn send_raw(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let stream = self.framed.get_mut();
        stream.write_all(data).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        self.framed.flush().await?;
        self.framed.get_mut().flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.framed.close().await?;
        Ok(())
    }
}

/// Framed receive stream for length-delimited messages.
#[derive(Debug)]
pub struct RecvStream<R = OwnedReadHalf> {
    framed: tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        let framed = tokio_util::codec::FramedRead::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    pub async fn recv_object<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> anyhow::Result<Option<T>> {
        if let Some(frame) = futures::StreamExt::next(&mut self.framed).await {
            let bytes = frame?;
            let obj = bincode::deserialize(&bytes)?;
            Ok(Some(obj))
        } else {
            Ok(None)
        }
    }

    /// Copies exactly `size` raw bytes to a writer, leaving the stream
    /// open for subsequent frames. `on_block` sees every block as it
    /// lands, for checksum accumulation.
    pub async fn copy_exact_to<W, F>(
        &mut self,
        writer: &mut W,
        size: u64,
        buffer_size: usize,
        mut on_block: F,
    ) -> anyhow::Result<u64>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(&[u8]),
    {
        if size == 0 {
            return Ok(0);
        }
        // first drain any data the framed reader has buffered past the
        // last frame
        let read_buffer = self.framed.read_buffer_mut();
        let buffered = (read_buffer.len() as u64).min(size);
        if buffered > 0 {
            on_block(&read_buffer[..buffered as usize]);
            writer.write_all(&read_buffer[..buffered as usize]).await?;
            read_buffer.advance(buffered as usize);
        }
        let mut total_copied = buffered;
        let data_stream = self.framed.get_mut();
        let mut buf = vec![0u8; buffer_size.min(size as usize).max(1)];
        while total_copied < size {
            let want = buf.len().min((size - total_copied) as usize);
            let n = data_stream.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            on_block(&buf[..n]);
            writer.write_all(&buf[..n]).await?;
            total_copied += n as u64;
        }
        if total_copied != size {
            anyhow::bail!("unexpected EOF: expected {} bytes, got {}", size, total_copied);
        }
        Ok(size)
    }
}

/// Bidirectional control connection on the daemon command port.
#[derive(Debug)]
pub struct ControlConnection {
    send: SendStream,
    recv: RecvStream,
}

impl ControlConnection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            send: SendStream::new(write_half),
            recv: RecvStream::new(read_half),
        }
    }

    pub fn send_mut(&mut self) -> &mut SendStream {
        &mut self.send
    }

    pub fn recv_mut(&mut self) -> &mut RecvStream {
        &mut self.recv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_and_raw_payload_interleave() -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let client = tokio::spawn(async move {
            let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let (_, wh) = stream.into_split();
            let mut send = SendStream::new(wh);
            send.send_control_message(&("header", 5u64)).await.unwrap();
            send.send_raw(b"hello").await.unwrap();
            send.flush().await.unwrap();
            send.send_control_message(&("trailer", 5u64)).await.unwrap();
            send.close().await.unwrap();
        });
        let (stream, _) = listener.accept().await?;
        let (rh, _) = stream.into_split();
        let mut recv = RecvStream::new(rh);
        let header: (String, u64) = recv.recv_object().await?.unwrap();
        assert_eq!(header, ("header".to_string(), 5));
        let mut payload = Vec::new();
        let mut summed = Vec::new();
        recv.copy_exact_to(&mut payload, 5, 1 << 16, |b| summed.extend_from_slice(b))
            .await?;
        assert_eq!(payload, b"hello");
        assert_eq!(summed, b"hello");
        let trailer: (String, u64) = recv.recv_object().await?.unwrap();
        assert_eq!(trailer.0, "trailer");
        client.await?;
        Ok(())
    }
}
