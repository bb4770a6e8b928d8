//! Error taxonomy for the streaming pipeline
//!
//! Stages return `anyhow::Result`; the variants below travel inside it and are
//! recovered with `downcast_ref` wherever the session needs the cause.

use thiserror::Error;

/// Typed failure causes surfaced by the pipeline
#[derive(Error, Debug)]
pub enum StreamError {
    /// A capture backend cannot deliver frames
    #[error("Capture unavailable on {backend}: {reason}")]
    CaptureUnavailable { backend: String, reason: String },

    /// An opened audio device disappeared
    #[error("Audio device lost: {device}")]
    DeviceLost { device: String },

    /// An audio device could not be opened
    #[error("Audio device {device} not available: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    /// A frame could not be compressed; the frame is dropped
    #[error("Encode failed ({width}x{height}): {reason}")]
    EncodeFailed {
        width: u32,
        height: u32,
        reason: String,
    },

    /// Payload failed validation or decoding
    #[error("Corrupt payload (seq {sequence}): {reason}")]
    CorruptPayload { sequence: u64, reason: String },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    pub fn transport(msg: impl Into<String>) -> Self {
        StreamError::TransportError(msg.into())
    }

    pub fn corrupt(sequence: u64, reason: impl Into<String>) -> Self {
        StreamError::CorruptPayload {
            sequence,
            reason: reason.into(),
        }
    }

    /// Whether this error ends the session without any retry
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::NegotiationFailed(_) | StreamError::Config(_)
        )
    }

    /// Whether the pipeline has a recovery path for this error
    ///
    /// Capture falls back to another backend and devices fall back to the
    /// default. Corrupt payloads and frames that fail to encode are dropped;
    /// transport errors reconnect.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StreamError::CaptureUnavailable { .. }
                | StreamError::DeviceLost { .. }
                | StreamError::CorruptPayload { .. }
                | StreamError::EncodeFailed { .. }
                | StreamError::TransportError(_)
                | StreamError::Io(_)
        )
    }

    /// Short stable label used in logs and the close cause
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::CaptureUnavailable { .. } => "CaptureUnavailable",
            StreamError::DeviceLost { .. } => "DeviceLost",
            StreamError::DeviceUnavailable { .. } => "DeviceUnavailable",
            StreamError::CorruptPayload { .. } => "CorruptPayload",
            StreamError::EncodeFailed { .. } => "EncodeFailed",
            StreamError::TransportError(_) | StreamError::Io(_) => "TransportError",
            StreamError::NegotiationFailed(_) => "NegotiationFailed",
            StreamError::Config(_) => "Config",
        }
    }
}

/// Find the typed cause inside an `anyhow` chain
pub fn stream_cause(err: &anyhow::Error) -> Option<&StreamError> {
    err.chain().find_map(|e| e.downcast_ref::<StreamError>())
}
