//! Types shared between the session core, the collaborator traits and the binary.

pub mod types;

pub use types::{DeliveryReceipt, InboundMessage, now_ms};
