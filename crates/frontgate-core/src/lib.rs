//! frontgate-core: Shared protocol library for the frontgate gateway.
//!
//! Provides the error taxonomy and wire rejection codes, the AES address
//! cipher, the copy-on-write address cache, and the WebSocket frame codec and
//! opening handshake used by the server's front ends.

pub mod cache;
pub mod cipher;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use cache::AddressCache;
pub use cipher::{AddressCipher, CipherMode};
pub use error::{GateError, GateResult};
pub use frame::{read_frame, read_message, Frame};
pub use handshake::{accept_key, read_upgrade_key, upgrade_response};
pub use protocol::{RejectCode, RESERVED_SENTINEL};
