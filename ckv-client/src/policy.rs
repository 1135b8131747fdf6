//! # Command Policies
//!
//! Typed, per-command-kind configuration. Policies are validated once while a
//! command is prepared and then converted into [`ExecOptions`], the
//! wire-ready form the native layer consumes.
//!
//! JSON field names match the struct fields; unknown fields are rejected.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound for `total_timeout_ms` (one day).
pub const MAX_TOTAL_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Upper bound for `max_retries`.
pub const MAX_RETRIES: u32 = 100;

/// Opaque server-side predicate AST.
///
/// Built by an expression builder outside this crate; the driver only checks
/// that it is a JSON object and forwards it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterExpression(serde_json::Value);

impl FilterExpression {
    pub fn new(ast: serde_json::Value) -> Self {
        FilterExpression(ast)
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    fn validate(&self) -> Result<()> {
        if !self.0.is_object() {
            return Err(Error::param("filter expression must be a JSON object"));
        }
        Ok(())
    }

    fn to_wire(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }
}

/// Read consistency across replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    #[default]
    One,
    All,
}

/// Settings shared by every command kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BasePolicy {
    /// Deadline for the whole command including retries; 0 disables it.
    pub total_timeout_ms: u64,
    /// Extra attempts after a retryable failure.
    pub max_retries: u32,
    /// Optional server-side filter.
    pub filter: Option<FilterExpression>,
}

impl Default for BasePolicy {
    fn default() -> Self {
        BasePolicy {
            total_timeout_ms: 1000,
            max_retries: 2,
            filter: None,
        }
    }
}

impl BasePolicy {
    fn validate(&self, kind: &str) -> Result<()> {
        if self.total_timeout_ms > MAX_TOTAL_TIMEOUT_MS {
            return Err(Error::param(format!(
                "{} policy parameter invalid: total_timeout_ms exceeds {}",
                kind, MAX_TOTAL_TIMEOUT_MS
            )));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(Error::param(format!(
                "{} policy parameter invalid: max_retries exceeds {}",
                kind, MAX_RETRIES
            )));
        }
        if let Some(filter) = &self.filter {
            filter
                .validate()
                .map_err(|err| Error::param(format!("{} policy parameter invalid: {}", kind, err.message())))?;
        }
        Ok(())
    }

    fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            timeout: (self.total_timeout_ms > 0)
                .then(|| Duration::from_millis(self.total_timeout_ms)),
            max_retries: self.max_retries,
            filter: self.filter.as_ref().map(FilterExpression::to_wire),
            consistency: Consistency::One,
            ttl: 0,
            concurrent_nodes: false,
        }
    }
}

/// Policy for single-record reads (`get`, `exists`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadPolicy {
    pub base: BasePolicy,
    pub consistency: Consistency,
}

/// Policy for writes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WritePolicy {
    pub base: BasePolicy,
    /// Record lifetime in seconds; 0 keeps the record forever.
    pub ttl: u32,
}

/// Policy for removes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemovePolicy {
    pub base: BasePolicy,
}

/// Policy for batch reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchPolicy {
    pub base: BasePolicy,
    pub consistency: Consistency,
    /// Query the nodes of one batch in parallel.
    pub concurrent_nodes: bool,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        BatchPolicy {
            base: BasePolicy::default(),
            consistency: Consistency::One,
            concurrent_nodes: true,
        }
    }
}

/// Common surface of the per-kind policies.
pub trait Policy: Clone + Send + 'static {
    /// Name used in validation messages.
    const KIND: &'static str;

    fn base(&self) -> &BasePolicy;

    fn validate(&self) -> Result<()> {
        self.base().validate(Self::KIND)
    }

    /// Converts the policy into the native execution form.
    fn exec_options(&self) -> ExecOptions;
}

impl Policy for ReadPolicy {
    const KIND: &'static str = "Read";

    fn base(&self) -> &BasePolicy {
        &self.base
    }

    fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            consistency: self.consistency,
            ..self.base.exec_options()
        }
    }
}

impl Policy for WritePolicy {
    const KIND: &'static str = "Write";

    fn base(&self) -> &BasePolicy {
        &self.base
    }

    fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            ttl: self.ttl,
            ..self.base.exec_options()
        }
    }
}

impl Policy for RemovePolicy {
    const KIND: &'static str = "Remove";

    fn base(&self) -> &BasePolicy {
        &self.base
    }

    fn exec_options(&self) -> ExecOptions {
        self.base.exec_options()
    }
}

impl Policy for BatchPolicy {
    const KIND: &'static str = "Batch";

    fn base(&self) -> &BasePolicy {
        &self.base
    }

    fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            consistency: self.consistency,
            concurrent_nodes: self.concurrent_nodes,
            ..self.base.exec_options()
        }
    }
}

/// Wire-ready execution settings owned by a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    /// Serialized filter expression.
    pub filter: Option<Vec<u8>>,
    pub consistency: Consistency,
    pub ttl: u32,
    pub concurrent_nodes: bool,
}
