//! Wire protocols: how packets are framed on a byte stream.
//!
//! The default [`LengthPrefixed`] protocol uses the following frame layout:
//!
//! ```text
//! +----------------+--------+------------------------+
//! | length: u32 BE | type:u8| body: length - 1 bytes |
//! +----------------+--------+------------------------+
//! ```
//!
//! `length` counts the type byte plus the body, never itself.
//!
//! Other framings plug in by implementing [`Protocol`].

use crate::error::{Error, Result};
use crate::packet::Packet;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Maximum frame size used by the demo binary when nothing is configured.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 1024 << 10;

/// A codec that moves whole packets on and off a byte stream.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Read exactly one packet.
    ///
    /// Returns [`Error::Eof`] if the stream ends before the first byte of a
    /// frame. A stream ending part way through a frame is an I/O error.
    async fn read_packet(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<Packet>;

    /// Write exactly one packet and flush it.
    async fn write_packet(
        &self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        packet: &Packet,
    ) -> Result<()>;

    /// Set the largest frame accepted on read. Zero disables the check.
    fn set_max_packet_size(&self, size: u32);
}

/// The default length-prefixed framing.
#[derive(Debug, Default)]
pub struct LengthPrefixed {
    max_packet_size: AtomicU32,
}

impl LengthPrefixed {
    /// Create a protocol with no frame size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a protocol rejecting frames longer than `size`.
    pub fn with_max_packet_size(size: u32) -> Self {
        Self {
            max_packet_size: AtomicU32::new(size),
        }
    }

    /// Currently configured limit (zero = unbounded).
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size.load(Ordering::Relaxed)
    }

    /// Read one packet using `limit` instead of the configured maximum.
    pub async fn read_packet_limit(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        limit: u32,
    ) -> Result<Packet> {
        let mut head = [0u8; HEADER_LEN];

        // A zero-length first read is a clean end of stream; anything after
        // that must complete the frame.
        let n = reader.read(&mut head).await?;
        if n == 0 {
            return Err(Error::Eof);
        }
        reader.read_exact(&mut head[n..]).await?;

        let length = u32::from_be_bytes(head);
        if limit != 0 && length > limit {
            return Err(Error::PacketTooLarge {
                size: u64::from(length),
                max: u64::from(limit),
            });
        }
        if length == 0 {
            return Err(Error::MalformedFrame { length });
        }

        let mut buf = BytesMut::zeroed(length as usize);
        reader.read_exact(&mut buf[..]).await?;

        let body = buf.split_off(1).freeze();
        Ok(Packet::new(buf[0], body))
    }
}

#[async_trait]
impl Protocol for LengthPrefixed {
    async fn read_packet(&self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<Packet> {
        self.read_packet_limit(reader, self.max_packet_size()).await
    }

    async fn write_packet(
        &self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        packet: &Packet,
    ) -> Result<()> {
        let frame = encode_frame(packet)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn set_max_packet_size(&self, size: u32) {
        self.max_packet_size.store(size, Ordering::Relaxed);
    }
}

/// Encode a packet into one contiguous frame.
fn encode_frame(packet: &Packet) -> Result<BytesMut> {
    let frame_len = packet.len() as u64 + 1;
    let length = u32::try_from(frame_len).map_err(|_| Error::PacketTooLarge {
        size: frame_len,
        max: u64::from(u32::MAX),
    })?;

    let mut frame = BytesMut::with_capacity(HEADER_LEN + length as usize);
    frame.put_u32(length);
    frame.put_u8(packet.kind());
    frame.extend_from_slice(packet.body());
    Ok(frame)
}
