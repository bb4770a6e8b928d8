//! Receiver pipeline components
//!
//! - ReceiveStage: framed packets off the connection, checksum validation
//! - ReorderStage: per-stream reorder window, one for video and one for audio
//! - DecodeStage: JPEG decoding
//! - SyncStage: presents frames against the audio clock
//! - RenderStage: paced hand-off to the renderer
//! - PlaybackStage: PCM to the output device
//!
//! ```text
//!            ┌→ Reorder → Decode → Sync → Render
//! Network → Receive            ↑
//!            └→ Reorder → Playback (clock)
//! ```

pub mod coordinator;
pub mod decode_stage;
pub mod playback_stage;
pub mod receive_stage;
pub mod render_stage;
pub mod reorder_stage;
pub mod sync_stage;

pub use coordinator::{ReceiverCommand, ReceiverCoordinator};
pub use decode_stage::DecodeStage;
pub use playback_stage::PlaybackStage;
pub use receive_stage::ReceiveStage;
pub use render_stage::RenderStage;
pub use reorder_stage::{Arrival, ReorderBuffer, ReorderStage};
pub use sync_stage::{SyncStage, SyncState, Synchronizer};
