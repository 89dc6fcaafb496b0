//! Collaborator traits at the edge of the session core.
//!
//! The session core hands inbound traffic to a [`ConversationEngine`] and
//! exposes outbound delivery through [`ChannelOutbound`]. Health checks go
//! through [`ChannelStatus`].

pub mod plugin;

pub use plugin::{ChannelHealthSnapshot, ChannelOutbound, ChannelStatus, ConversationEngine};
