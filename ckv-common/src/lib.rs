// ckv-common - Shared types and wire codec for ClusterKV
//
// This crate defines the value types exchanged between the driver and the
// cluster nodes, plus the RESP2 framing both sides speak.

pub mod error;
pub mod protocol;
pub mod status;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use status::*;
pub use types::*;
