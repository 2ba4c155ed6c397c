//! NTunnel Shared Library
//!
//! Envelope codec, identities and sealing, the transport abstraction and the
//! agent's duplicate filter.

pub mod crypto;
pub mod dedup;
pub mod error;
pub mod frame;
pub mod memory;
pub mod protocol;
pub mod transport;

pub use error::{Error, Result};
