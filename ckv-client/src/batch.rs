//! # Batch Aggregator
//!
//! Collects streamed per-key outcomes of a batch read into owned results,
//! ordered by input position.
//!
//! - Items arrive once per node group in arbitrary order; each is cloned
//!   into the slot of its input index before the listener returns.
//! - `None` from the native layer is a total failure: slots are discarded
//!   and the batch resolves to a single error.
//! - A per-key failure never aborts the batch.

use ckv_common::{Key, Record, Status};
use tracing::debug;

use crate::error::{Error, Result};
use crate::native::batch::NativeBatchRead;

/// Outcome for one key of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub status: Status,
    pub key: Key,
    /// Present only when `status` is `Ok`.
    pub record: Option<Record>,
}

impl BatchResult {
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

pub(crate) struct BatchAggregator {
    slots: Vec<Option<BatchResult>>,
    aborted: bool,
}

impl BatchAggregator {
    pub(crate) fn new(len: usize) -> Self {
        BatchAggregator {
            slots: vec![None; len],
            aborted: false,
        }
    }

    /// Listener body for the native batch call.
    pub(crate) fn on_items(&mut self, items: Option<&[NativeBatchRead<'_>]>) {
        let Some(items) = items else {
            self.aborted = true;
            self.slots.clear();
            return;
        };
        if self.aborted {
            return;
        }

        for item in items {
            let Some(slot) = self.slots.get_mut(item.index) else {
                debug!(index = item.index, "batch item outside request");
                continue;
            };
            let record = if item.status.is_ok() {
                item.record.cloned()
            } else {
                None
            };
            *slot = Some(BatchResult {
                status: item.status,
                key: item.key.clone(),
                record,
            });
        }
    }

    /// Produces the final results once the native call returned.
    pub(crate) fn finish(self, keys: &[Key], outcome: Result<()>) -> Result<Vec<BatchResult>> {
        outcome?;
        if self.aborted {
            return Err(Error::new(Status::ClientFailure, "batch aborted"));
        }
        Ok(self
            .slots
            .into_iter()
            .zip(keys)
            .map(|(slot, key)| {
                slot.unwrap_or_else(|| BatchResult {
                    status: Status::NoResponse,
                    key: key.clone(),
                    record: None,
                })
            })
            .collect())
    }
}
