//! Screen and audio streaming between two machines on the same LAN
//!
//! The sender captures the desktop and an audio input, encodes frames as
//! JPEG and pushes both streams over one TCP connection. The receiver
//! reorders, decodes, lines video up against the audio it is playing and
//! presents the result.

pub mod audio;
pub mod capture;
pub mod config;
pub mod decoder;
pub mod display;
pub mod encoder;
pub mod error;
pub mod net;
pub mod pipeline;
pub mod preferences;

pub use config::Config;
pub use error::StreamError;
pub use preferences::{PreferencesStore, StreamPreferences};
