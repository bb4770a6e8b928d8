//! Streaming pipelines
//!
//! Both roles are built from the same pieces:
//! - Stages implement [`PipelineStage`] and run on their own task
//! - Stages talk through bounded channels or [`DropOldestQueue`]s, so a slow
//!   stage costs old data, never the ones upstream of it
//! - A coordinator per role chains the stages and owns the [`StreamSession`]
//! - [`MediaClock`] stamps media so the receiver can line audio and video up
//! - [`PipelineHealth`] counts what went wrong for the periodic summary
//!
//! Closing a stage's input makes it drain and exit; cancellation is only used
//! to abandon a connection.

pub mod clock;
pub mod health;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stage;
pub mod state;
pub mod types;

pub use clock::MediaClock;
pub use health::{HealthMonitor, PipelineHealth};
pub use queue::DropOldestQueue;
pub use session::{CloseCause, SessionEvent, StreamSession};
pub use stage::{PipelineStage, StageExit, StageRunner};
pub use state::SessionState;
pub use types::{AudioChunk, DecodedFrame, Frame, MediaKind, Resolution, Timestamp};
