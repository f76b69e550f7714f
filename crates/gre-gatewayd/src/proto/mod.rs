//! Wire formats spoken by the engine.

pub mod provision;
pub mod signaling;

pub use provision::{MessageKind, ProvisionMessage, SessionBody, SubBody, SubMessage, SubType};
pub use signaling::{ErrorCode, MessageType, Messages, SignalMessage};
