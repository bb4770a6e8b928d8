//! Frame presentation and receiver key handling

pub mod renderer;
pub mod window;

pub use renderer::{
    HeadlessSurface, KeyCommand, PresentedFrame, PresentedLog, RenderStats, RenderSurface,
    Renderer, SnapshotSurface,
};
pub use window::{FrameSlot, ViewerWindow, WindowSurface};
