//! Tunnel control protocol
//!
//! Message definitions, the tagged binary message codec and the
//! length-prefixed frame codec shared by the control and proxy channels.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{tags, CodecError, DecodeError, MessageCodec};
pub use frame::{FrameCodec, FrameError};
pub use messages::*;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
