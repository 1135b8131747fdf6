//! # ClusterKV Client Driver
//!
//! Purpose: Connect application processes to a ClusterKV cluster, run
//! single-key and batch commands on worker threads and deliver every outcome
//! asynchronously through callbacks or [`Deferred`] futures.
//!
//! ## Design Principles
//! 1. **Asynchronous Completions**: A completion never runs before the call
//!    that issued it has returned, whatever the outcome.
//! 2. **Owned Results**: Data produced on worker threads is copied into owned
//!    values before it reaches the caller.
//! 3. **Partial Failure**: Batch results keep one entry per key; only a total
//!    failure collapses into a single error.
//! 4. **Typed Policies**: Per-command policies are validated once, while the
//!    command is prepared.

mod batch;
mod bridge;
mod client;
mod command;
mod completion;
mod config;
mod error;
mod events;
mod logging;
mod native;
mod policy;

pub use batch::BatchResult;
pub use client::Client;
pub use completion::{Callback, Deferred};
pub use config::{ClientConfig, ConfigError, DefaultPolicies, Host, LogConfig, LogLevel};
pub use error::{CallSite, Error, ErrorKind, Result};
pub use events::{EventHandler, EventName, SubscriptionId, TopologyEvent};
pub use native::active_tend_threads;
pub use policy::{
    BasePolicy, BatchPolicy, Consistency, ExecOptions, FilterExpression, Policy, ReadPolicy,
    RemovePolicy, WritePolicy,
};

pub use ckv_common::{Bins, ClusterNode, Key, KeyValue, Record, RecordMeta, Status};
