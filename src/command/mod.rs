//! Command/response correlation over the link
//!
//! The adapter answers commands strictly in order, one frame per command.
//! This module pairs each outbound command with the next inbound frame.

mod channel;

pub use channel::CommandChannel;
