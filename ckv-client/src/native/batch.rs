//! # Native Batch Reads
//!
//! Keys are grouped by owning node. Each group is pipelined over a single
//! pooled connection, optionally with one scoped thread per node. Results are
//! handed to a listener as items borrowing the group's reply buffers; the
//! listener must copy anything it keeps before returning.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use ckv_common::{Key, Record, Status};

use crate::error::{Error, ErrorKind, Result};
use crate::native::cluster::NativeCluster;
use crate::native::node::NativeNode;
use crate::native::ops::{decode_meta, decode_record, read_args, with_retries, Deadline};
use crate::policy::ExecOptions;

/// Kind of batch read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BatchOp {
    /// Metadata only.
    Exists,
    /// Full records, optionally projected to the named bins.
    Get { bins: Option<Vec<String>> },
}

/// One per-key outcome, borrowed from worker buffers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeBatchRead<'a> {
    /// Position of the key in the request.
    pub(crate) index: usize,
    pub(crate) status: Status,
    pub(crate) key: &'a Key,
    /// Present only when `status` is `Ok`.
    pub(crate) record: Option<&'a Record>,
}

/// Listener fed once per node group, or once with `None` on total failure.
pub(crate) type BatchListener<'l> = dyn FnMut(Option<&[NativeBatchRead<'_>]>) + 'l;

struct NodeGroup {
    node: Arc<NativeNode>,
    indices: Vec<usize>,
}

struct GroupReads {
    indices: Vec<usize>,
    outcomes: Vec<(Status, Option<Record>)>,
}

/// Executes a batch read and streams results into `listener`.
///
/// Returns the error that caused a total failure, after reporting `None`.
pub(crate) fn batch_read(
    cluster: &NativeCluster,
    op: &BatchOp,
    keys: &[Key],
    options: &ExecOptions,
    listener: &mut BatchListener<'_>,
) -> Result<()> {
    let groups = match group_by_node(cluster, keys) {
        Ok(groups) => groups,
        Err(err) => {
            listener(None);
            return Err(err);
        }
    };
    let deadline = Deadline::new(options.timeout);
    debug!(keys = keys.len(), nodes = groups.len(), "batch read");

    let outcome = if options.concurrent_nodes && groups.len() > 1 {
        run_concurrent(groups, op, keys, options, deadline, listener)
    } else {
        groups.into_iter().try_for_each(|group| {
            let reads = run_group(group, op, keys, options, deadline)?;
            emit(keys, &reads, listener);
            Ok(())
        })
    };

    if let Err(err) = &outcome {
        warn!(error = %err, "batch read failed");
        listener(None);
    }
    outcome
}

fn group_by_node(cluster: &NativeCluster, keys: &[Key]) -> Result<Vec<NodeGroup>> {
    let mut groups: Vec<NodeGroup> = Vec::new();
    for (index, key) in keys.iter().enumerate() {
        let node = cluster.node_for(key)?;
        match groups.iter_mut().find(|group| Arc::ptr_eq(&group.node, &node)) {
            Some(group) => group.indices.push(index),
            None => groups.push(NodeGroup {
                node,
                indices: vec![index],
            }),
        }
    }
    Ok(groups)
}

fn run_concurrent(
    groups: Vec<NodeGroup>,
    op: &BatchOp,
    keys: &[Key],
    options: &ExecOptions,
    deadline: Deadline,
    listener: &mut BatchListener<'_>,
) -> Result<()> {
    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel();
        let mut first_error = None;
        for group in groups {
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name("ckv-batch".to_string())
                .spawn_scoped(scope, move || {
                    let _ = tx.send(run_group(group, op, keys, options, deadline));
                });
            if let Err(err) = spawned {
                first_error.get_or_insert_with(|| {
                    Error::new(
                        Status::ClientFailure,
                        format!("failed to start batch thread: {}", err),
                    )
                });
            }
        }
        drop(tx);

        // Once a group failed the batch is lost; later groups are drained
        // without being reported.
        for reads in rx {
            match reads {
                Ok(reads) if first_error.is_none() => emit(keys, &reads, listener),
                Ok(_) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    })
}

fn run_group(
    group: NodeGroup,
    op: &BatchOp,
    keys: &[Key],
    options: &ExecOptions,
    deadline: Deadline,
) -> Result<GroupReads> {
    let (command, bins): (&[u8], Option<&[String]>) = match op {
        BatchOp::Exists => (b"EXISTS", None),
        BatchOp::Get { bins } => (b"GET", bins.as_deref()),
    };
    let commands = group
        .indices
        .iter()
        .map(|&index| read_args(command, &keys[index], bins, options))
        .collect::<Result<Vec<_>>>()?;

    let node = group.node;
    let replies = with_retries(
        options,
        deadline,
        || Ok(node.clone()),
        |conn| conn.exec_pipeline(&commands),
    )?;

    let outcomes = replies
        .into_iter()
        .map(|reply| {
            let decoded = match op {
                BatchOp::Exists => decode_meta(reply).and_then(|meta| {
                    meta.map(Record::from_meta)
                        .ok_or_else(|| Error::new(Status::KeyNotFound, "record not found"))
                }),
                BatchOp::Get { .. } => decode_record(reply),
            };
            match decoded {
                Ok(record) => (Status::Ok, Some(record)),
                Err(err) => {
                    if err.kind() != ErrorKind::Server {
                        debug!(error = %err, "batch item failed");
                    }
                    (err.status(), None)
                }
            }
        })
        .collect();

    Ok(GroupReads {
        indices: group.indices,
        outcomes,
    })
}

fn emit(keys: &[Key], reads: &GroupReads, listener: &mut BatchListener<'_>) {
    let items: Vec<NativeBatchRead<'_>> = reads
        .indices
        .iter()
        .zip(&reads.outcomes)
        .map(|(&index, (status, record))| NativeBatchRead {
            index,
            status: *status,
            key: &keys[index],
            record: record.as_ref(),
        })
        .collect();
    listener(Some(items.as_slice()));
}
