//! # Node Lifecycle
//!
//! Bind a listener, run the accept loop on the current Tokio runtime, and
//! expose a handle for membership changes and shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::server::handle_connection;
use crate::store::Store;

/// Length of a node id in hexadecimal characters.
pub const NODE_ID_LEN: usize = 16;

/// Node startup configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listen address, e.g. "127.0.0.1:0" for an ephemeral port.
    pub bind_addr: String,
    /// Fixed node id; generated when `None`.
    pub node_id: Option<String>,
    /// Cluster this node belongs to.
    pub cluster_name: String,
    /// Addresses of the other nodes, served by `PEERS`.
    pub peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            node_id: None,
            cluster_name: "ckv".to_string(),
            peers: Vec::new(),
        }
    }
}

/// State shared by every connection task of one node.
#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) node_id: String,
    pub(crate) cluster_name: String,
    pub(crate) peers: RwLock<Vec<String>>,
    pub(crate) store: Store,
}

/// Entry point for starting nodes.
pub struct NodeServer;

impl NodeServer {
    /// Binds the listener and spawns the accept loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn bind(config: NodeConfig) -> io::Result<NodeHandle> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let addr = listener.local_addr()?;

        let node_id = match config.node_id {
            Some(id) if is_node_id(&id) => id.to_ascii_uppercase(),
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "node id must be 16 hexadecimal characters",
                ))
            }
            None => format!("{:016X}", RandomState::new().hash_one(addr)),
        };

        let state = Arc::new(NodeState {
            node_id,
            cluster_name: config.cluster_name,
            peers: RwLock::new(config.peers),
            store: Store::new(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, state.clone(), shutdown_rx));

        tracing::info!(%addr, node_id = %state.node_id, "node listening");
        Ok(NodeHandle {
            addr,
            state,
            shutdown_tx,
            accept_task: Some(accept_task),
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<NodeState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let connection_shutdown = shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let state = state.clone();
                    let shutdown = connection_shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, state, shutdown).await {
                            tracing::debug!(%peer, error = %err, "connection closed with error");
                        }
                    });
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

fn is_node_id(id: &str) -> bool {
    id.len() == NODE_ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Handle to a running node. Dropping it shuts the node down.
pub struct NodeHandle {
    addr: SocketAddr,
    state: Arc<NodeState>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address formatted as `host:port`, the form clients use as a seed.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn node_id(&self) -> &str {
        &self.state.node_id
    }

    pub fn store(&self) -> &Store {
        &self.state.store
    }

    /// Advertises another node to clients tending this one.
    pub fn add_peer(&self, addr: impl Into<String>) {
        let addr = addr.into();
        let mut peers = self.state.peers.write();
        if !peers.contains(&addr) {
            peers.push(addr);
        }
    }

    pub fn remove_peer(&self, addr: &str) {
        self.state.peers.write().retain(|peer| peer != addr);
    }

    pub fn peers(&self) -> Vec<String> {
        self.state.peers.read().clone()
    }

    /// Stops accepting, closes every open connection, and waits for the
    /// accept loop to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        tracing::info!(addr = %self.addr, "node stopped");
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
