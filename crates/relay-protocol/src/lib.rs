//! Relay Protocol - Wire protocol for relay server communication
//!
//! This crate provides the framing, command and reply types spoken
//! between relay clients and the daemon:
//! - `frame` - length-prefixed control lines plus raw exact-length payloads
//! - `command` - client → server commands and their parsing
//! - `reply` - server → client replies and their wire text

pub mod command;
pub mod frame;
pub mod reply;

pub use command::{Command, CommandError, CommandTag};
pub use frame::{ChannelError, Delivery, FrameReader, FrameWriter, MAX_FRAME_SIZE};
pub use reply::Reply;
