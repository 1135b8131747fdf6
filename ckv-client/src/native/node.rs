//! One cluster node as seen by the tend thread and by workers.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use ckv_common::{parse_error_reply, ClusterNode, RespValue, Status};

use crate::error::{Error, Result};
use crate::native::pool::{Connection, ConnectionPool, PoolConfig};

/// Length of a node id in hexadecimal characters.
pub(crate) const NODE_NAME_LEN: usize = 16;

/// Settings shared by every node of one cluster.
#[derive(Debug, Clone)]
pub(crate) struct NodeSettings {
    pub(crate) cluster_name: Option<String>,
    pub(crate) max_conns: usize,
    pub(crate) max_idle: usize,
    pub(crate) connect_timeout: Duration,
}

pub(crate) struct NativeNode {
    name: String,
    address: String,
    pool: ConnectionPool,
    /// Dedicated connection for tend traffic; never taken from the pool so a
    /// zero-sized pool still lets the cluster be tended.
    tend_conn: Mutex<Option<Connection>>,
    failures: AtomicU32,
}

impl NativeNode {
    /// Connects to `address`, verifies its identity and returns the node.
    pub(crate) fn connect(address: &str, settings: &NodeSettings) -> Result<NativeNode> {
        let socket_addr = resolve(address)?;
        let mut conn = Connection::connect(socket_addr, settings.connect_timeout)?;
        let name = identify(&mut conn, settings.cluster_name.as_deref())?;

        let pool = ConnectionPool::new(PoolConfig {
            addr: socket_addr,
            max_idle: settings.max_idle,
            max_total: settings.max_conns,
            connect_timeout: settings.connect_timeout,
        });

        Ok(NativeNode {
            name,
            address: address.to_string(),
            pool,
            tend_conn: Mutex::new(Some(conn)),
            failures: AtomicU32::new(0),
        })
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    #[inline]
    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub(crate) fn snapshot(&self) -> ClusterNode {
        ClusterNode {
            name: self.name.clone(),
            address: self.address.clone(),
        }
    }

    /// Checks the node is still the same one and returns its peer list.
    ///
    /// Failures are counted; a success resets the counter.
    pub(crate) fn refresh(&self, settings: &NodeSettings) -> Result<Vec<String>> {
        let result = self.refresh_inner(settings);
        match &result {
            Ok(_) => self.failures.store(0, Ordering::Relaxed),
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Drops the tend connection and idle pooled connections.
    pub(crate) fn close(&self) {
        self.tend_conn.lock().take();
        self.pool.clear();
    }

    fn refresh_inner(&self, settings: &NodeSettings) -> Result<Vec<String>> {
        let mut slot = self.tend_conn.lock();
        if slot.is_none() {
            *slot = Some(Connection::connect(
                resolve(&self.address)?,
                settings.connect_timeout,
            )?);
        }
        let conn = slot
            .as_mut()
            .ok_or_else(|| Error::new(Status::ClientFailure, "tend connection unavailable"))?;

        let outcome = identify(conn, settings.cluster_name.as_deref()).and_then(|name| {
            if name != self.name {
                return Err(Error::new(
                    Status::InvalidNode,
                    format!("node at {} changed id to {}", self.address, name),
                ));
            }
            peers(conn)
        });
        if outcome.is_err() {
            slot.take();
        }
        outcome
    }
}

fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|err| Error::connection(format!("cannot resolve {}: {}", address, err)))?
        .next()
        .ok_or_else(|| Error::connection(format!("cannot resolve {}", address)))
}

fn identify(conn: &mut Connection, expected_cluster: Option<&str>) -> Result<String> {
    let items = match conn.exec(&[b"NODE"])? {
        RespValue::Array(items) => items,
        other => return Err(unexpected("NODE", other)),
    };
    let (name, cluster) = match items.as_slice() {
        [RespValue::Bulk(Some(name)), RespValue::Bulk(Some(cluster))] => (
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(cluster).into_owned(),
        ),
        _ => return Err(Error::new(Status::ClientFailure, "malformed NODE reply")),
    };

    if !is_node_name(&name) {
        return Err(Error::new(
            Status::InvalidNode,
            format!("invalid node id `{}`", name),
        ));
    }
    if let Some(expected) = expected_cluster {
        if expected != cluster {
            return Err(Error::new(
                Status::InvalidNode,
                format!("node {} belongs to cluster `{}`", name, cluster),
            ));
        }
    }
    Ok(name)
}

fn peers(conn: &mut Connection) -> Result<Vec<String>> {
    match conn.exec(&[b"PEERS"])? {
        RespValue::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                RespValue::Bulk(Some(addr)) => Some(String::from_utf8_lossy(&addr).into_owned()),
                _ => None,
            })
            .collect()),
        other => Err(unexpected("PEERS", other)),
    }
}

pub(crate) fn is_node_name(name: &str) -> bool {
    name.len() == NODE_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

/// Maps an unexpected reply to an error, decoding `-ERR` statuses.
pub(crate) fn unexpected(command: &str, reply: RespValue) -> Error {
    match reply {
        RespValue::Error(payload) => {
            let (status, message) = parse_error_reply(&payload);
            Error::new(status, message)
        }
        _ => Error::new(
            Status::ClientFailure,
            format!("unexpected reply to {}", command),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_names_are_uppercase_hex() {
        assert!(is_node_name("00AB34CD56EF7890"));
        assert!(!is_node_name("00ab34cd56ef7890"));
        assert!(!is_node_name("00AB"));
    }

    #[test]
    fn error_replies_keep_their_status() {
        let err = unexpected("GET", RespValue::Error(b"ERR 27 filtered out".to_vec()));
        assert_eq!(err.status(), Status::FilteredOut);
        assert_eq!(err.message(), "filtered out");

        let err = unexpected("GET", RespValue::Integer(1));
        assert_eq!(err.status(), Status::ClientFailure);
    }
}
