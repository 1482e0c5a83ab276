//! Wire protocol shared by the master and agents
//!
//! Every connection (agent to master, agent to agent) carries the same
//! framed [`Message`] type. Control fields travel as a JSON header; parameter
//! vectors travel as a raw little-endian `f32` tail so large models are never
//! routed through JSON.

pub mod codec;
pub mod messages;
pub mod version;

pub use codec::{read_message, write_message, FrameCodec, DEFAULT_MAX_FRAME_BYTES};
pub use messages::*;
pub use version::{ProtocolVersion, PROTOCOL_VERSION};
