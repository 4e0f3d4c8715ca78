use super::error::ProtocolError;
use super::handshake::{decode_header, ExtensionBits, HANDSHAKE_HEADER_LEN};
use super::message::Message;
use crate::constants::MAX_MESSAGE_LENGTH;
use crate::types::{InfoHash, PeerId};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Reads length-prefixed frames from the read half of a peer stream.
///
/// Bytes read past a frame stay buffered for the next call, so the reader
/// can be used for the handshake and then for messages.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(32 * 1024),
            max_len: MAX_MESSAGE_LENGTH,
        }
    }

    async fn fill(&mut self, want: usize) -> Result<(), ProtocolError> {
        while self.buf.len() < want {
            self.buf.reserve(want - self.buf.len());
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
        }
        Ok(())
    }

    pub async fn read_handshake_header(
        &mut self,
    ) -> Result<(ExtensionBits, InfoHash), ProtocolError> {
        self.fill(HANDSHAKE_HEADER_LEN).await?;
        let header = self.buf.split_to(HANDSHAKE_HEADER_LEN);
        decode_header(&header)
    }

    pub async fn read_peer_id(&mut self) -> Result<PeerId, ProtocolError> {
        self.fill(20).await?;
        let raw = self.buf.split_to(20);
        PeerId::from_bytes(&raw).ok_or(ProtocolError::InvalidHandshake)
    }

    /// Reads one message, returning it with its size on the wire.
    pub async fn read_message(&mut self) -> Result<(Message, usize), ProtocolError> {
        self.fill(4).await?;
        let length = (&self.buf[..4]).get_u32() as usize;
        if length > self.max_len {
            return Err(ProtocolError::MessageTooLarge(length));
        }
        self.fill(4 + length).await?;
        self.buf.advance(4);
        let body: Bytes = self.buf.split_to(length).freeze();
        Ok((Message::decode(body)?, 4 + length))
    }
}

/// Buffered writer for the write half of a peer stream.
pub struct FrameWriter<W: AsyncWrite> {
    inner: BufWriter<W>,
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
            scratch: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub async fn write_raw(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.inner.write_all(data).await?;
        Ok(())
    }

    /// Buffers a message, returning the bytes it occupies on the wire.
    pub async fn write_message(&mut self, message: &Message) -> Result<usize, ProtocolError> {
        self.scratch.clear();
        message.encode_into(&mut self.scratch);
        self.inner.write_all(&self.scratch).await?;
        Ok(self.scratch.len())
    }

    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
