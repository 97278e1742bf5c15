//! VTX: message-oriented socket semantics (request/reply, pub/sub,
//! push/pull, dealer/router, exclusive pair) over transports that do not
//! natively provide them. Ships a UDP driver speaking the NOM-1 peering
//! protocol and a reference TCP driver carrying length-prefixed frames.

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod mailbox;
pub mod pattern;
pub mod peering;
pub mod queue;
pub mod registry;
pub mod tcp;
pub mod udp;
pub mod vocket;

pub use config::DriverConfig;
pub use error::VtxError;
pub use frame::{Frame, Message};
pub use pattern::Pattern;
pub use registry::{Vtx, VtxSocket};
