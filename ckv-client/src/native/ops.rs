//! Blocking single-record operations, run on worker threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use ckv_common::{Bins, Key, Record, RecordMeta, RespValue, Status};

use crate::error::{Error, Result};
use crate::native::cluster::NativeCluster;
use crate::native::node::{unexpected, NativeNode};
use crate::native::pool::PooledConnection;
use crate::policy::{Consistency, ExecOptions};

/// Absolute end of a command, shared by all of its attempts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Deadline(timeout.map(|timeout| Instant::now() + timeout))
    }

    /// Time left for the next socket operation.
    pub(crate) fn remaining(&self) -> Result<Option<Duration>> {
        match self.0 {
            None => Ok(None),
            Some(end) => {
                let now = Instant::now();
                if now >= end {
                    Err(Error::new(Status::Timeout, "command timed out"))
                } else {
                    Ok(Some(end - now))
                }
            }
        }
    }
}

/// Runs `attempt` against the node chosen by `pick`, retrying retryable
/// failures until `max_retries` or the deadline is exhausted.
pub(crate) fn with_retries<T>(
    options: &ExecOptions,
    deadline: Deadline,
    mut pick: impl FnMut() -> Result<Arc<NativeNode>>,
    mut attempt: impl FnMut(&mut PooledConnection) -> Result<T>,
) -> Result<T> {
    let mut retries = 0;
    loop {
        let result = deadline.remaining().and_then(|remaining| {
            let node = pick()?;
            let mut conn = node.pool().acquire()?;
            conn.set_timeout(remaining)?;
            attempt(&mut conn)
        });
        match result {
            Err(err) if err.is_retryable() && retries < options.max_retries => {
                retries += 1;
                debug!(error = %err, retry = retries, "retrying command");
            }
            other => return other,
        }
    }
}

/// Argument list for a read command.
pub(crate) fn read_args(
    command: &[u8],
    key: &Key,
    bins: Option<&[String]>,
    options: &ExecOptions,
) -> Result<Vec<Vec<u8>>> {
    let mut args = vec![command.to_vec(), key.wire_bytes()];
    if let Some(bins) = bins {
        let list = serde_json::to_vec(bins)
            .map_err(|err| Error::new(Status::ClientFailure, err.to_string()))?;
        args.push(b"BINS".to_vec());
        args.push(list);
    }
    push_filter(&mut args, options);
    if options.consistency == Consistency::All {
        args.push(b"CL".to_vec());
        args.push(b"ALL".to_vec());
    }
    Ok(args)
}

fn push_filter(args: &mut Vec<Vec<u8>>, options: &ExecOptions) {
    if let Some(filter) = &options.filter {
        args.push(b"FILTER".to_vec());
        args.push(filter.clone());
    }
}

fn exec_args(conn: &mut PooledConnection, args: &[Vec<u8>]) -> Result<RespValue> {
    let args: Vec<&[u8]> = args.iter().map(Vec::as_slice).collect();
    conn.exec(&args)
}

/// Decodes a `GET` reply. A null reply is `KeyNotFound`.
pub(crate) fn decode_record(reply: RespValue) -> Result<Record> {
    match reply {
        RespValue::Bulk(Some(payload)) => Ok(Record::from_json(&payload)?),
        RespValue::Bulk(None) => Err(Error::new(Status::KeyNotFound, "record not found")),
        other => Err(unexpected("GET", other)),
    }
}

/// Decodes an `EXISTS` reply. A null reply is `None`.
pub(crate) fn decode_meta(reply: RespValue) -> Result<Option<RecordMeta>> {
    match reply {
        RespValue::Bulk(Some(payload)) => Ok(Some(RecordMeta::from_json(&payload)?)),
        RespValue::Bulk(None) => Ok(None),
        other => Err(unexpected("EXISTS", other)),
    }
}

pub(crate) fn get(
    cluster: &NativeCluster,
    key: &Key,
    bins: Option<&[String]>,
    options: &ExecOptions,
) -> Result<Record> {
    let args = read_args(b"GET", key, bins, options)?;
    with_retries(
        options,
        Deadline::new(options.timeout),
        || cluster.node_for(key),
        |conn| decode_record(exec_args(conn, &args)?),
    )
}

pub(crate) fn exists(
    cluster: &NativeCluster,
    key: &Key,
    options: &ExecOptions,
) -> Result<Option<RecordMeta>> {
    let args = read_args(b"EXISTS", key, None, options)?;
    with_retries(
        options,
        Deadline::new(options.timeout),
        || cluster.node_for(key),
        |conn| decode_meta(exec_args(conn, &args)?),
    )
}

/// Writes bins and returns the new record generation.
pub(crate) fn put(
    cluster: &NativeCluster,
    key: &Key,
    bins: &Bins,
    options: &ExecOptions,
) -> Result<u32> {
    let payload = serde_json::to_vec(bins)
        .map_err(|err| Error::new(Status::ClientFailure, err.to_string()))?;
    let mut args = vec![b"PUT".to_vec(), key.wire_bytes(), payload];
    if options.ttl > 0 {
        args.push(b"TTL".to_vec());
        args.push(options.ttl.to_string().into_bytes());
    }
    push_filter(&mut args, options);

    with_retries(
        options,
        Deadline::new(options.timeout),
        || cluster.node_for(key),
        |conn| match exec_args(conn, &args)? {
            RespValue::Integer(generation) => u32::try_from(generation)
                .map_err(|_| Error::new(Status::ClientFailure, "generation out of range")),
            other => Err(unexpected("PUT", other)),
        },
    )
}

/// Deletes a record; a missing record is `KeyNotFound`.
pub(crate) fn remove(cluster: &NativeCluster, key: &Key, options: &ExecOptions) -> Result<()> {
    let mut args = vec![b"DEL".to_vec(), key.wire_bytes()];
    push_filter(&mut args, options);

    with_retries(
        options,
        Deadline::new(options.timeout),
        || cluster.node_for(key),
        |conn| match exec_args(conn, &args)? {
            RespValue::Integer(1) => Ok(()),
            RespValue::Integer(_) => Err(Error::new(Status::KeyNotFound, "record not found")),
            other => Err(unexpected("DEL", other)),
        },
    )
}
