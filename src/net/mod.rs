//! LAN transport: wire format, framing and connection setup

pub mod connect;
pub mod framing;
pub mod protocol;

pub use connect::{Connector, Listener};
pub use framing::{Packet, PacketReader, PacketWriter};
pub use protocol::{ChannelHeader, ControlMessage, Role};
