//! Frame-level I/O over the halves of a split transport stream.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transport::packet::Packet;
use crate::utils::error::Result;

const READ_CHUNK: usize = 4 * 1024;

pub struct PacketReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next complete packet. `Ok(None)` means the peer closed the
    /// stream cleanly between frames.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn next(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = Packet::decode(&mut self.buf)? {
                return Ok(Some(packet));
            }
            self.buf.reserve(READ_CHUNK);
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }
}

pub struct PacketWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        self.frame(packet)?;
        self.write_frame().await
    }

    /// Encode `packet` into the write buffer. Nothing reaches the stream
    /// until [`write_frame`](Self::write_frame).
    pub fn frame(&mut self, packet: &Packet) -> Result<()> {
        self.buf.clear();
        let encoded = packet.encode(&mut self.buf);
        if encoded.is_err() {
            self.buf.clear();
        }
        encoded
    }

    pub async fn write_frame(&mut self) -> Result<()> {
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
