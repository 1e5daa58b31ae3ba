//! Chunked message framing.
//!
//! Every Bolt message travels as a sequence of chunks, each prefixed with a
//! 16-bit big-endian length, terminated by a zero-length chunk. A
//! zero-length chunk between messages is a NOOP keep-alive and is skipped.
//!
//! [`FramedIo`] combines the chunker with an injected
//! [`MessageCodec`](crate::bolt::codec::MessageCodec) and an owned transport
//! into the typed message channel the connection drives.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use super::codec::MessageCodec;
use super::error::{BoltError, BoltResult};
use super::handshake::BoltVersion;
use super::message::{BoltRequest, BoltResponse};
use super::BoltIo;

/// Largest chunk payload the framing allows.
pub const MAX_CHUNK_SIZE: usize = 0xFFFF;

/// Splits message payloads into chunks and reassembles them.
#[derive(Debug, Default)]
pub struct ChunkCodec {
    partial: BytesMut,
}

impl ChunkCodec {
    /// Create a chunk codec.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ChunkCodec {
    type Item = Bytes;
    type Error = BoltError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, BoltError> {
        loop {
            if src.len() < 2 {
                return Ok(None);
            }
            let size = u16::from_be_bytes([src[0], src[1]]) as usize;
            if size == 0 {
                src.advance(2);
                if self.partial.is_empty() {
                    // NOOP chunk between messages
                    continue;
                }
                return Ok(Some(self.partial.split().freeze()));
            }
            if src.len() < 2 + size {
                src.reserve(2 + size - src.len());
                return Ok(None);
            }
            src.advance(2);
            self.partial.extend_from_slice(&src[..size]);
            src.advance(size);
        }
    }
}

impl Encoder<&[u8]> for ChunkCodec {
    type Error = BoltError;

    fn encode(&mut self, message: &[u8], dst: &mut BytesMut) -> Result<(), BoltError> {
        dst.reserve(message.len() + (message.len() / MAX_CHUNK_SIZE + 1) * 2 + 2);
        for chunk in message.chunks(MAX_CHUNK_SIZE) {
            dst.put_u16(chunk.len() as u16);
            dst.extend_from_slice(chunk);
        }
        dst.put_u16(0);
        Ok(())
    }
}

/// Typed message channel over a framed transport.
///
/// Owns the transport, the chunker, the injected message codec and the
/// read/write buffers. A message is always emitted as a single flush unit.
pub struct FramedIo<S> {
    stream: S,
    version: BoltVersion,
    codec: Box<dyn MessageCodec>,
    chunker: ChunkCodec,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    message_buffer: BytesMut,
    read_timeout: Option<Duration>,
}

impl<S> FramedIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a transport that has already completed the handshake.
    pub fn new(stream: S, version: BoltVersion, codec: Box<dyn MessageCodec>) -> Self {
        Self {
            stream,
            version,
            codec,
            chunker: ChunkCodec::new(),
            read_buffer: BytesMut::with_capacity(8192),
            write_buffer: BytesMut::with_capacity(8192),
            message_buffer: BytesMut::with_capacity(1024),
            read_timeout: None,
        }
    }
}

impl<S> BoltIo for FramedIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn version(&self) -> BoltVersion {
        self.version
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    async fn send(&mut self, request: BoltRequest) -> BoltResult<()> {
        tracing::trace!(target: "grafite::bolt", message = request.name(), "C:");

        self.message_buffer.clear();
        self.codec.encode(&request, &mut self.message_buffer)?;

        self.write_buffer.clear();
        self.chunker
            .encode(&self.message_buffer[..], &mut self.write_buffer)?;

        self.stream.write_all(&self.write_buffer).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> BoltResult<BoltResponse> {
        loop {
            if let Some(message) = self.chunker.decode(&mut self.read_buffer)? {
                let response = self.codec.decode(&message)?;
                tracing::trace!(target: "grafite::bolt", message = response.name(), "S:");
                return Ok(response);
            }

            let read = self.stream.read_buf(&mut self.read_buffer);
            let n = match self.read_timeout {
                Some(limit) => tokio::time::timeout(limit, read)
                    .await
                    .map_err(|_| BoltError::Timeout)??,
                None => read.await?,
            };
            if n == 0 {
                return Err(BoltError::ConnectionClosed);
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl<S> std::fmt::Debug for FramedIo<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedIo")
            .field("version", &self.version)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::codec::CodecError;
    use crate::bolt::message::SuccessMessage;

    #[test]
    fn test_chunk_roundtrip() {
        let mut codec = ChunkCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(b"hello".as_slice(), &mut wire).unwrap();

        // 2-byte length + payload + zero terminator
        assert_eq!(&wire[..], &[0, 5, b'h', b'e', b'l', b'l', b'o', 0, 0]);

        let mut decoder = ChunkCodec::new();
        let message = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(&message[..], b"hello");
        assert!(wire.is_empty());
    }

    #[test]
    fn test_chunk_split_large_message() {
        let payload = vec![0xAB; MAX_CHUNK_SIZE + 10];
        let mut codec = ChunkCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(&payload[..], &mut wire).unwrap();

        // First chunk is maximal, second carries the remainder
        assert_eq!(u16::from_be_bytes([wire[0], wire[1]]) as usize, MAX_CHUNK_SIZE);
        let tail = 2 + MAX_CHUNK_SIZE;
        assert_eq!(u16::from_be_bytes([wire[tail], wire[tail + 1]]), 10);

        let mut decoder = ChunkCodec::new();
        let message = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(message.len(), payload.len());
    }

    #[test]
    fn test_chunk_partial_input() {
        let mut codec = ChunkCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(b"abcdef".as_slice(), &mut wire).unwrap();

        let mut decoder = ChunkCodec::new();
        let mut first = wire.split_to(4);
        assert!(decoder.decode(&mut first).unwrap().is_none());

        first.unsplit(wire);
        let message = decoder.decode(&mut first).unwrap().unwrap();
        assert_eq!(&message[..], b"abcdef");
    }

    #[test]
    fn test_chunk_noop_skipped() {
        let mut wire = BytesMut::new();
        // Two NOOP chunks, then a real message
        wire.put_u16(0);
        wire.put_u16(0);
        let mut codec = ChunkCodec::new();
        codec.encode(b"x".as_slice(), &mut wire).unwrap();

        let mut decoder = ChunkCodec::new();
        let message = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(&message[..], b"x");
    }

    /// Minimal codec for exercising the framing: requests encode to their
    /// name, every payload decodes to an empty SUCCESS.
    struct NameCodec;

    impl MessageCodec for NameCodec {
        fn encode(&mut self, request: &BoltRequest, dst: &mut BytesMut) -> Result<(), CodecError> {
            dst.extend_from_slice(request.name().as_bytes());
            Ok(())
        }

        fn decode(&mut self, _src: &[u8]) -> Result<BoltResponse, CodecError> {
            Ok(BoltResponse::Success(SuccessMessage::default()))
        }
    }

    #[tokio::test]
    async fn test_framed_io_send_recv() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut io = FramedIo::new(client, BoltVersion::new(5, 0), Box::new(NameCodec));

        io.send(BoltRequest::Reset).await.unwrap();

        // The server sees one chunked message spelling the request name
        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0, 5, b'R', b'E', b'S', b'E', b'T', 0, 0]);

        // Reply with a chunked payload
        server.write_all(&[0, 2, b'o', b'k', 0, 0]).await.unwrap();
        let response = io.recv().await.unwrap();
        assert!(matches!(response, BoltResponse::Success(_)));
    }

    #[tokio::test]
    async fn test_framed_io_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);

        let mut io = FramedIo::new(client, BoltVersion::new(5, 0), Box::new(NameCodec));
        let err = io.recv().await.unwrap_err();
        assert!(matches!(err, BoltError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_framed_io_read_timeout() {
        let (client, _server) = tokio::io::duplex(64);
        let mut io = FramedIo::new(client, BoltVersion::new(5, 0), Box::new(NameCodec));
        io.set_read_timeout(Some(Duration::from_secs(42)));

        let err = io.recv().await.unwrap_err();
        assert!(matches!(err, BoltError::Timeout));
    }
}
