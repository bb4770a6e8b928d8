//! Wire format shared by sender and receiver
//!
//! Every payload is preceded by a fixed 25 byte little endian header:
//!
//! ```text
//! magic "SYNC" | stream_type u8 | sequence u64 | timestamp_us u64 | payload_length u32
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::StreamError;
use crate::pipeline::types::{AudioChunk, Frame, MediaKind, Timestamp};

pub const MAGIC: [u8; 4] = *b"SYNC";
pub const HEADER_LEN: usize = 25;
pub const VIDEO_PREFIX_LEN: usize = 13;
pub const AUDIO_PREFIX_LEN: usize = 10;

/// On-wire descriptor in front of every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHeader {
    pub kind: MediaKind,
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub payload_length: u32,
}

/// Why a header could not be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    BadMagic,
    UnknownStream(u8),
    Oversize(u32),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::BadMagic => write!(f, "bad magic"),
            HeaderError::UnknownStream(t) => write!(f, "unknown stream type 0x{:02x}", t),
            HeaderError::Oversize(len) => write!(f, "payload of {} bytes over limit", len),
        }
    }
}

impl ChannelHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(&MAGIC);
        buf.put_u8(self.kind.wire_tag());
        buf.put_u64_le(self.sequence);
        buf.put_u64_le(self.timestamp.as_wire());
        buf.put_u32_le(self.payload_length);
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN], max_payload: u32) -> Result<Self, HeaderError> {
        if raw[..4] != MAGIC {
            return Err(HeaderError::BadMagic);
        }
        let kind = MediaKind::from_wire_tag(raw[4]).ok_or(HeaderError::UnknownStream(raw[4]))?;
        let mut buf = &raw[5..];
        let sequence = buf.get_u64_le();
        let timestamp = Timestamp::from_wire(buf.get_u64_le());
        let payload_length = buf.get_u32_le();
        if payload_length > max_payload {
            return Err(HeaderError::Oversize(payload_length));
        }
        Ok(Self {
            kind,
            sequence,
            timestamp,
            payload_length,
        })
    }
}

/// Messages on the control sub-channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    SetResolution { width: u32, height: u32 },
    SetQuality { level: u8 },
    Pause,
    Resume,
    Stop,
    /// Capture format announced before the first audio chunk
    AudioFormat {
        sample_rate: u32,
        channels: u16,
        bits: u16,
    },
}

/// Which end of the connection originates a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl ControlMessage {
    /// Resolution and quality are sender-authoritative; a receiver may only stop.
    pub fn may_originate_from(&self, role: Role) -> bool {
        match role {
            Role::Sender => true,
            Role::Receiver => matches!(self, ControlMessage::Stop),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        match *self {
            ControlMessage::SetResolution { width, height } => {
                buf.put_u8(0x01);
                buf.put_u32_le(width);
                buf.put_u32_le(height);
            }
            ControlMessage::SetQuality { level } => {
                buf.put_u8(0x02);
                buf.put_u8(level);
            }
            ControlMessage::Pause => buf.put_u8(0x03),
            ControlMessage::Resume => buf.put_u8(0x04),
            ControlMessage::Stop => buf.put_u8(0x05),
            ControlMessage::AudioFormat {
                sample_rate,
                channels,
                bits,
            } => {
                buf.put_u8(0x06);
                buf.put_u32_le(sample_rate);
                buf.put_u16_le(channels);
                buf.put_u16_le(bits);
            }
        }
        buf.freeze()
    }

    pub fn decode(sequence: u64, payload: &[u8]) -> Result<Self, StreamError> {
        let truncated = || StreamError::corrupt(sequence, "truncated control message");
        let (&opcode, mut rest) = payload.split_first().ok_or_else(truncated)?;
        let msg = match opcode {
            0x01 => {
                if rest.len() < 8 {
                    return Err(truncated());
                }
                ControlMessage::SetResolution {
                    width: rest.get_u32_le(),
                    height: rest.get_u32_le(),
                }
            }
            0x02 => {
                if rest.is_empty() {
                    return Err(truncated());
                }
                let level = rest.get_u8();
                if !(1..=100).contains(&level) {
                    return Err(StreamError::corrupt(
                        sequence,
                        format!("quality {} out of range", level),
                    ));
                }
                ControlMessage::SetQuality { level }
            }
            0x03 => ControlMessage::Pause,
            0x04 => ControlMessage::Resume,
            0x05 => ControlMessage::Stop,
            0x06 => {
                if rest.len() < 8 {
                    return Err(truncated());
                }
                ControlMessage::AudioFormat {
                    sample_rate: rest.get_u32_le(),
                    channels: rest.get_u16_le(),
                    bits: rest.get_u16_le(),
                }
            }
            other => {
                return Err(StreamError::corrupt(
                    sequence,
                    format!("unknown control opcode 0x{:02x}", other),
                ));
            }
        };
        Ok(msg)
    }
}

/// Video payload: `width u32, height u32, quality u8, crc32 u32` then JPEG bytes
pub fn encode_video_payload(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(VIDEO_PREFIX_LEN + frame.payload.len());
    buf.put_u32_le(frame.width);
    buf.put_u32_le(frame.height);
    buf.put_u8(frame.quality);
    buf.put_u32_le(crc32fast::hash(&frame.payload));
    buf.put_slice(&frame.payload);
    buf.freeze()
}

pub fn decode_video_payload(header: &ChannelHeader, payload: Bytes) -> Result<Frame, StreamError> {
    let seq = header.sequence;
    if payload.len() < VIDEO_PREFIX_LEN {
        return Err(StreamError::corrupt(seq, "video payload shorter than prefix"));
    }
    let mut prefix = &payload[..VIDEO_PREFIX_LEN];
    let width = prefix.get_u32_le();
    let height = prefix.get_u32_le();
    let quality = prefix.get_u8();
    let crc = prefix.get_u32_le();
    let body = payload.slice(VIDEO_PREFIX_LEN..);
    if crc32fast::hash(&body) != crc {
        return Err(StreamError::corrupt(seq, "video checksum mismatch"));
    }
    if width == 0 || height == 0 {
        return Err(StreamError::corrupt(seq, "zero sized frame"));
    }
    Ok(Frame {
        sequence: seq,
        timestamp: header.timestamp,
        width,
        height,
        quality,
        payload: body,
    })
}

/// Audio payload: `sample_rate u32, channels u16, crc32 u32` then i16 PCM
pub fn encode_audio_payload(chunk: &AudioChunk) -> Bytes {
    let mut buf = BytesMut::with_capacity(AUDIO_PREFIX_LEN + chunk.pcm.len());
    buf.put_u32_le(chunk.sample_rate);
    buf.put_u16_le(chunk.channels);
    buf.put_u32_le(crc32fast::hash(&chunk.pcm));
    buf.put_slice(&chunk.pcm);
    buf.freeze()
}

pub fn decode_audio_payload(
    header: &ChannelHeader,
    payload: Bytes,
) -> Result<AudioChunk, StreamError> {
    let seq = header.sequence;
    if payload.len() < AUDIO_PREFIX_LEN {
        return Err(StreamError::corrupt(seq, "audio payload shorter than prefix"));
    }
    let mut prefix = &payload[..AUDIO_PREFIX_LEN];
    let sample_rate = prefix.get_u32_le();
    let channels = prefix.get_u16_le();
    let crc = prefix.get_u32_le();
    let pcm = payload.slice(AUDIO_PREFIX_LEN..);
    if crc32fast::hash(&pcm) != crc {
        return Err(StreamError::corrupt(seq, "audio checksum mismatch"));
    }
    if sample_rate == 0 || channels == 0 || pcm.len() % (2 * channels as usize) != 0 {
        return Err(StreamError::corrupt(seq, "malformed pcm block"));
    }
    Ok(AudioChunk {
        sequence: seq,
        timestamp: header.timestamp,
        sample_rate,
        channels,
        pcm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_bit_exact() {
        let header = ChannelHeader {
            kind: MediaKind::Audio,
            sequence: 0x0102030405060708,
            timestamp: Timestamp::from_micros(42),
            payload_length: 7,
        };
        let raw = header.encode();
        assert_eq!(&raw[..4], b"SYNC");
        assert_eq!(raw[4], b'A');
        assert_eq!(raw[5], 0x08);
        assert_eq!(raw[12], 0x01);
        assert_eq!(raw[13], 42);
        assert_eq!(raw[21], 7);
        assert_eq!(ChannelHeader::decode(&raw, 1024), Ok(header));
    }

    #[test]
    fn test_header_rejections() {
        let mut raw = ChannelHeader {
            kind: MediaKind::Video,
            sequence: 1,
            timestamp: Timestamp::from_micros(0),
            payload_length: 2048,
        }
        .encode();
        assert_eq!(
            ChannelHeader::decode(&raw, 1024),
            Err(HeaderError::Oversize(2048))
        );
        raw[4] = b'I';
        assert_eq!(
            ChannelHeader::decode(&raw, 4096),
            Err(HeaderError::UnknownStream(b'I'))
        );
        raw[0] = b'X';
        assert_eq!(ChannelHeader::decode(&raw, 4096), Err(HeaderError::BadMagic));
    }

    #[test]
    fn test_control_messages() {
        let msgs = [
            ControlMessage::SetResolution {
                width: 1280,
                height: 720,
            },
            ControlMessage::SetQuality { level: 75 },
            ControlMessage::Pause,
            ControlMessage::Resume,
            ControlMessage::Stop,
            ControlMessage::AudioFormat {
                sample_rate: 44100,
                channels: 2,
                bits: 16,
            },
        ];
        for msg in msgs {
            assert_eq!(ControlMessage::decode(0, &msg.encode()).unwrap(), msg);
        }
        assert!(ControlMessage::decode(0, &[0x02, 0]).is_err());
        assert!(ControlMessage::decode(0, &[0x01, 1, 2]).is_err());
        assert!(ControlMessage::decode(0, &[0x7f]).is_err());
        assert!(ControlMessage::decode(0, &[]).is_err());
    }

    #[test]
    fn test_receiver_may_only_stop() {
        assert!(ControlMessage::Stop.may_originate_from(Role::Receiver));
        assert!(!ControlMessage::Pause.may_originate_from(Role::Receiver));
        assert!(!ControlMessage::SetQuality { level: 50 }.may_originate_from(Role::Receiver));
        assert!(ControlMessage::Pause.may_originate_from(Role::Sender));
    }

    #[test]
    fn test_video_payload_detects_corruption() {
        let frame = Frame {
            sequence: 9,
            timestamp: Timestamp::from_micros(1000),
            width: 4,
            height: 2,
            quality: 80,
            payload: Bytes::from_static(b"\xff\xd8jpeg-bytes\xff\xd9"),
        };
        let header = ChannelHeader {
            kind: MediaKind::Video,
            sequence: 9,
            timestamp: frame.timestamp,
            payload_length: 0,
        };
        let payload = encode_video_payload(&frame);
        assert_eq!(decode_video_payload(&header, payload.clone()).unwrap(), frame);

        let mut damaged = payload.to_vec();
        let last = damaged.len() - 3;
        damaged[last] ^= 0x55;
        let err = decode_video_payload(&header, Bytes::from(damaged)).unwrap_err();
        assert_eq!(err.kind(), "CorruptPayload");
    }

    #[test]
    fn test_audio_payload_rejects_odd_pcm() {
        let header = ChannelHeader {
            kind: MediaKind::Audio,
            sequence: 3,
            timestamp: Timestamp::from_micros(0),
            payload_length: 0,
        };
        let chunk = AudioChunk::from_samples(3, header.timestamp, 48000, 2, &[1, -1, 2, -2]);
        let decoded = decode_audio_payload(&header, encode_audio_payload(&chunk)).unwrap();
        assert_eq!(decoded.samples(), vec![1, -1, 2, -2]);

        let mut odd = BytesMut::new();
        odd.put_u32_le(48000);
        odd.put_u16_le(2);
        odd.put_u32_le(crc32fast::hash(&[1, 2, 3]));
        odd.put_slice(&[1, 2, 3]);
        assert!(decode_audio_payload(&header, odd.freeze()).is_err());
    }
}
