//! Sender pipeline components
//!
//! - CaptureStage: screen frames at the target rate
//! - AudioCaptureStage: PCM chunks from the selected input
//! - EncodeStage: JPEG encoding with adaptive quality
//! - TransmitStage: framed packets onto the connection, audio first
//! - ControlStage: the receiver's `Stop`
//!
//! ```text
//! Capture → Encode ─┐
//!                   ├→ Transmit → Network
//! AudioCapture ─────┘
//! ```

pub mod audio_stage;
pub mod capture_stage;
pub mod control_stage;
pub mod coordinator;
pub mod encode_stage;
pub mod transmit_stage;

pub use audio_stage::{AudioCaptureStage, AudioCapturer, AudioChunks};
pub use capture_stage::{CaptureSettings, CaptureStage};
pub use control_stage::ControlStage;
pub use coordinator::{SenderCommand, SenderCoordinator};
pub use encode_stage::{AdaptiveQuality, EncodeStage};
pub use transmit_stage::TransmitStage;
