//! # ClusterKV Node
//!
//! Purpose: A single cluster node speaking the ClusterKV RESP dialect. It is
//! small on purpose: one record store, a static peer list that tending
//! clients use for discovery, and server-side filter evaluation.
//!
//! ## Design Principles
//! 1. **Task per Connection**: Each socket gets its own Tokio task.
//! 2. **Explicit Shutdown**: `NodeHandle::shutdown` stops the listener and
//!    every open connection, so clients observe the node going away.
//! 3. **Runtime Membership**: Peers can be added and removed while running
//!    to drive topology changes.

mod filter;
mod node;
mod server;
mod store;

pub use node::{NodeConfig, NodeHandle, NodeServer};
pub use store::Store;
