//! # Native Cluster
//!
//! Owns the node table and the background tend thread.
//!
//! The tend thread periodically refreshes every node, drops nodes that keep
//! failing, connects peers it learns about and reports every topology
//! transition through an [`EventSink`]. The sink never runs subscriber code;
//! it only forwards events to the dispatch loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use ckv_common::{ClusterNode, Key, Status};

use crate::error::{Error, Result};
use crate::native::node::{NativeNode, NodeSettings};

/// Consecutive failed refreshes before a node leaves the table.
const MAX_TEND_FAILURES: u32 = 2;

static ACTIVE_TEND_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Number of tend threads currently alive in this process.
pub fn active_tend_threads() -> usize {
    ACTIVE_TEND_THREADS.load(Ordering::SeqCst)
}

/// Topology transition observed by the native layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NativeEvent {
    NodeAdded(ClusterNode),
    NodeRemoved(ClusterNode),
    Disconnected,
}

/// Receiver of topology transitions, called from the tend thread.
pub(crate) type EventSink = Arc<dyn Fn(NativeEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct ClusterSettings {
    pub(crate) seeds: Vec<String>,
    pub(crate) node: NodeSettings,
    pub(crate) tend_interval: Duration,
}

struct Tender {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Keeps the live tend thread count accurate however the thread exits.
struct TendThreadGuard;

impl TendThreadGuard {
    fn new() -> Self {
        ACTIVE_TEND_THREADS.fetch_add(1, Ordering::SeqCst);
        TendThreadGuard
    }
}

impl Drop for TendThreadGuard {
    fn drop(&mut self) {
        ACTIVE_TEND_THREADS.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct NativeCluster {
    settings: ClusterSettings,
    /// Sorted by node name.
    nodes: RwLock<Vec<Arc<NativeNode>>>,
    active: AtomicBool,
    closed: AtomicBool,
    sink: EventSink,
    tender: Mutex<Option<Tender>>,
}

impl NativeCluster {
    /// Connects to the seeds, discovers their peers and starts tending.
    ///
    /// Blocking; callers run it on a worker thread.
    pub(crate) fn connect(settings: ClusterSettings, sink: EventSink) -> Result<Arc<Self>> {
        let mut nodes: Vec<Arc<NativeNode>> = Vec::new();
        let mut last_error = None;
        for seed in &settings.seeds {
            match NativeNode::connect(seed, &settings.node) {
                Ok(node) => {
                    if nodes.iter().all(|known| known.name() != node.name()) {
                        nodes.push(Arc::new(node));
                    }
                }
                Err(err) => {
                    debug!(seed = %seed, error = %err, "seed unreachable");
                    last_error = Some(err);
                }
            }
        }

        if nodes.is_empty() {
            let reason = last_error
                .map(|err| err.message().to_string())
                .unwrap_or_else(|| "no seed hosts".to_string());
            return Err(Error::connection(format!(
                "failed to connect to cluster: {}",
                reason
            )));
        }
        nodes.sort_by(|a, b| a.name().cmp(b.name()));

        let cluster = Arc::new(NativeCluster {
            settings,
            nodes: RwLock::new(nodes.clone()),
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            sink,
            tender: Mutex::new(None),
        });
        for node in &nodes {
            info!(node = %node.name(), address = %node.address(), "node added");
            (cluster.sink)(NativeEvent::NodeAdded(node.snapshot()));
        }

        cluster.tend();
        cluster.start_tending()?;
        Ok(cluster)
    }

    fn start_tending(self: &Arc<Self>) -> Result<()> {
        let (stop, stopped) = mpsc::channel::<()>();
        let weak: Weak<NativeCluster> = Arc::downgrade(self);
        let interval = self.settings.tend_interval;
        let guard = TendThreadGuard::new();

        let handle = thread::Builder::new()
            .name("ckv-tend".to_string())
            .spawn(move || {
                let _guard = guard;
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    match weak.upgrade() {
                        Some(cluster) => cluster.tend(),
                        None => break,
                    }
                }
                debug!("tend thread stopped");
            })
            .map_err(|err| {
                Error::new(
                    Status::ClientFailure,
                    format!("failed to start tend thread: {}", err),
                )
            })?;

        *self.tender.lock() = Some(Tender { stop, handle });
        Ok(())
    }

    /// One tend pass: refresh, remove failing nodes, add discovered peers.
    pub(crate) fn tend(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let current = self.nodes.read().clone();
        let mut discovered: Vec<String> = Vec::new();
        let mut removed: Vec<Arc<NativeNode>> = Vec::new();
        for node in &current {
            match node.refresh(&self.settings.node) {
                Ok(peers) => discovered.extend(peers),
                Err(err) => {
                    warn!(node = %node.name(), error = %err, "node refresh failed");
                    if node.failures() >= MAX_TEND_FAILURES || err.status() == Status::InvalidNode
                    {
                        removed.push(node.clone());
                    }
                }
            }
        }

        let surviving = current.len() - removed.len();
        if surviving == 0 {
            discovered.extend(self.settings.seeds.iter().cloned());
        }
        discovered.sort();
        discovered.dedup();

        let mut added: Vec<Arc<NativeNode>> = Vec::new();
        for address in discovered {
            let known = current
                .iter()
                .filter(|node| !removed.iter().any(|gone| Arc::ptr_eq(gone, node)))
                .chain(added.iter())
                .any(|node| node.address() == address);
            if known {
                continue;
            }
            match NativeNode::connect(&address, &self.settings.node) {
                Ok(node) => {
                    let duplicate = current
                        .iter()
                        .filter(|node| !removed.iter().any(|gone| Arc::ptr_eq(gone, node)))
                        .chain(added.iter())
                        .any(|known| known.name() == node.name());
                    if !duplicate {
                        added.push(Arc::new(node));
                    }
                }
                Err(err) => debug!(address = %address, error = %err, "peer unreachable"),
            }
        }

        if removed.is_empty() && added.is_empty() {
            return;
        }

        let (was_active, now_active) = {
            let mut nodes = self.nodes.write();
            let was_active = !nodes.is_empty();
            nodes.retain(|node| !removed.iter().any(|gone| Arc::ptr_eq(gone, node)));
            nodes.extend(added.iter().cloned());
            nodes.sort_by(|a, b| a.name().cmp(b.name()));
            (was_active, !nodes.is_empty())
        };
        self.active.store(now_active, Ordering::SeqCst);

        for node in removed {
            info!(node = %node.name(), address = %node.address(), "node removed");
            node.close();
            (self.sink)(NativeEvent::NodeRemoved(node.snapshot()));
        }
        for node in added {
            info!(node = %node.name(), address = %node.address(), "node added");
            (self.sink)(NativeEvent::NodeAdded(node.snapshot()));
        }
        if was_active && !now_active {
            warn!("cluster disconnected");
            (self.sink)(NativeEvent::Disconnected);
        }
    }

    /// Health primitive: some node answered at the last tend.
    pub(crate) fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.active.load(Ordering::SeqCst)
    }

    /// Snapshot of the node table, ordered by name.
    pub(crate) fn nodes(&self) -> Vec<ClusterNode> {
        self.nodes.read().iter().map(|node| node.snapshot()).collect()
    }

    /// Node owning `key` (placement hash modulo node count).
    pub(crate) fn node_for(&self, key: &Key) -> Result<Arc<NativeNode>> {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return Err(Error::new(Status::InvalidNode, "no cluster node available"));
        }
        let index = (key.placement_hash() % nodes.len() as u64) as usize;
        Ok(nodes[index].clone())
    }

    /// Stops and joins the tend thread. Idempotent.
    ///
    /// The node table stays intact so in-flight commands can finish.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(tender) = self.tender.lock().take() {
            let _ = tender.stop.send(());
            // Skipped when the last handle is dropped on the tend thread itself.
            if tender.handle.thread().id() != thread::current().id()
                && tender.handle.join().is_err()
            {
                warn!("tend thread panicked");
            }
        }
        for node in self.nodes.read().iter() {
            node.close();
        }
        info!("cluster closed");
    }
}

impl Drop for NativeCluster {
    fn drop(&mut self) {
        self.close();
    }
}
