//! Header-delimited packet I/O over a byte stream
//!
//! The reader never relies on transport message boundaries: it reads a
//! header, then exactly `payload_length` bytes. A damaged header makes it
//! scan forward for the next magic instead of giving up on the connection.

use bytes::Bytes;
use log::warn;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::StreamError;
use crate::net::protocol::{ChannelHeader, HEADER_LEN, MAGIC};
use crate::pipeline::types::{MediaKind, Timestamp};

/// A framed payload as read off the socket
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: ChannelHeader,
    pub payload: Bytes,
    pub received_at: Instant,
}

/// Offset of the first position that could start a new header
fn resync_offset(raw: &[u8; HEADER_LEN]) -> usize {
    (1..HEADER_LEN)
        .find(|&p| {
            let n = (HEADER_LEN - p).min(MAGIC.len());
            raw[p..p + n] == MAGIC[..n]
        })
        .unwrap_or(HEADER_LEN)
}

pub struct PacketReader<R> {
    inner: R,
    max_payload: u32,
    max_consecutive_errors: u32,
    consecutive_errors: u32,
    framing_errors: u64,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R, max_payload: u32, max_consecutive_errors: u32) -> Self {
        Self {
            inner,
            max_payload,
            max_consecutive_errors: max_consecutive_errors.max(1),
            consecutive_errors: 0,
            framing_errors: 0,
        }
    }

    /// Total headers rejected since the reader was created
    pub fn framing_errors(&self) -> u64 {
        self.framing_errors
    }

    /// Read the next packet. `Ok(None)` means the peer closed cleanly
    /// between two packets.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>, StreamError> {
        let mut raw = [0u8; HEADER_LEN];
        let mut filled = 0usize;

        let header = loop {
            while filled < HEADER_LEN {
                let n = self.inner.read(&mut raw[filled..]).await?;
                if n == 0 {
                    if filled == 0 {
                        return Ok(None);
                    }
                    return Err(StreamError::transport("connection closed mid-header"));
                }
                filled += n;
            }

            match ChannelHeader::decode(&raw, self.max_payload) {
                Ok(header) => break header,
                Err(e) => {
                    self.framing_errors += 1;
                    self.consecutive_errors += 1;
                    if self.consecutive_errors >= self.max_consecutive_errors {
                        return Err(StreamError::transport(format!(
                            "{} consecutive framing errors (last: {})",
                            self.consecutive_errors, e
                        )));
                    }
                    if self.framing_errors % 30 == 1 {
                        warn!(
                            "PacketReader: rejected header ({}), resynchronizing ({} total)",
                            e, self.framing_errors
                        );
                    }
                    let skip = resync_offset(&raw);
                    raw.copy_within(skip.., 0);
                    filled = HEADER_LEN - skip;
                }
            }
        };

        let mut payload = vec![0u8; header.payload_length as usize];
        if let Err(e) = self.inner.read_exact(&mut payload).await {
            return Err(StreamError::transport(format!(
                "connection lost while receiving payload: {}",
                e
            )));
        }
        self.consecutive_errors = 0;

        Ok(Some(Packet {
            header,
            payload: Bytes::from(payload),
            received_at: Instant::now(),
        }))
    }
}

pub struct PacketWriter<W> {
    inner: W,
    write_timeout: Duration,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W, write_timeout: Duration) -> Self {
        Self {
            inner,
            write_timeout,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write header and payload; a stalled socket becomes a transport error
    pub async fn send(
        &mut self,
        kind: MediaKind,
        sequence: u64,
        timestamp: Timestamp,
        payload: &[u8],
    ) -> Result<(), StreamError> {
        let header = ChannelHeader {
            kind,
            sequence,
            timestamp,
            payload_length: payload.len() as u32,
        }
        .encode();

        let inner = &mut self.inner;
        let write = async {
            inner.write_all(&header).await?;
            inner.write_all(payload).await?;
            inner.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                self.bytes_written += (header.len() + payload.len()) as u64;
                Ok(())
            }
            Ok(Err(e)) => Err(StreamError::transport(format!("write failed: {}", e))),
            Err(_) => Err(StreamError::transport("write timed out")),
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), StreamError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
