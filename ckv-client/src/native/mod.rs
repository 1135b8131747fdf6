//! Blocking cluster substrate: node table, tend thread, connection pools
//! and the wire calls made from worker threads.

pub(crate) mod batch;
pub(crate) mod cluster;
pub(crate) mod node;
pub(crate) mod ops;
pub(crate) mod pool;

pub use cluster::active_tend_threads;
