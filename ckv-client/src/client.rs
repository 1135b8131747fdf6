//! # Client Façade
//!
//! `Client` owns the connection lifecycle and issues data commands.
//!
//! Every command method returns immediately. Outcomes are delivered either
//! through a callback (`*_with` methods) or a [`Deferred`] future, always
//! from the dispatch loop and always after the issuing method returned.
//! Nothing is reported synchronously, not even a missing connection.

use std::fmt;
use std::mem;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::info;

use ckv_common::{Bins, ClusterNode, Key, Record, Status};

use crate::batch::{BatchAggregator, BatchResult};
use crate::bridge::{Bridge, InvocationGuard};
use crate::command::{call_site, Command};
use crate::completion::{Completion, Deferred};
use crate::config::{ClientConfig, DefaultPolicies};
use crate::error::{Error, Result};
use crate::events::{EventMonitor, EventName, SubscriptionId, TopologyEvent};
use crate::logging;
use crate::native::batch::{batch_read, BatchOp};
use crate::native::cluster::{ClusterSettings, NativeCluster};
use crate::native::node::NodeSettings;
use crate::native::ops;
use crate::policy::{BatchPolicy, ExecOptions, Policy, ReadPolicy, RemovePolicy, WritePolicy};

enum ClientState {
    Disconnected,
    /// A connect is in flight; later connects wait for its outcome.
    Connecting {
        joiners: Vec<oneshot::Sender<Result<()>>>,
    },
    Connected {
        cluster: Arc<NativeCluster>,
    },
    Closing,
    Closed,
}

impl ClientState {
    fn name(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting { .. } => "connecting",
            ClientState::Connected { .. } => "connected",
            ClientState::Closing => "closing",
            ClientState::Closed => "closed",
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    bridge: Arc<Bridge>,
    monitor: Arc<EventMonitor>,
    state: Mutex<ClientState>,
    capture_stack_traces: AtomicBool,
}

/// Handle to a cluster client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

enum ConnectPlan {
    Fresh,
    Join(oneshot::Receiver<Result<()>>),
    Ready,
    Rejected,
}

impl Client {
    /// Validates `config`, installs logging and starts the dispatch loop on
    /// the current Tokio runtime. Does not connect.
    ///
    /// # Errors
    /// Returns a `Param` error for an invalid configuration and a
    /// `ClientFailure` status outside a Tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Client> {
        config.validate()?;
        logging::init(&config.log);

        let runtime = Handle::try_current().map_err(|_| {
            Error::new(
                Status::ClientFailure,
                "a client must be created inside a Tokio runtime",
            )
        })?;
        let monitor = Arc::new(EventMonitor::new());
        let bridge = Bridge::start(runtime, monitor.clone());

        Ok(Client {
            inner: Arc::new(ClientInner {
                capture_stack_traces: AtomicBool::new(config.capture_stack_traces),
                config,
                bridge,
                monitor,
                state: Mutex::new(ClientState::Disconnected),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// True when both handles refer to the same client.
    pub fn ptr_eq(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Connects to the cluster; resolves to this same client.
    #[track_caller]
    pub fn connect(&self) -> Deferred<Client> {
        let (completion, deferred) = Completion::deferred();
        let _guard = self.submit_connect(completion, Location::caller());
        deferred
    }

    #[track_caller]
    pub fn connect_with(&self, callback: impl FnOnce(Result<Client>) + Send + 'static) {
        let _guard = self.submit_connect(Completion::callback(callback), Location::caller());
    }

    /// Disconnects and stops the tend thread. Safe to call repeatedly.
    ///
    /// Commands already executing still complete and invoke their
    /// completions; commands issued afterwards fail with a connection error.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Local connection flag; with `use_health_check` also asks the tend
    /// thread whether any node answered at the last tend.
    pub fn is_connected(&self, use_health_check: bool) -> bool {
        match &*self.inner.state.lock() {
            ClientState::Connected { cluster } => !use_health_check || cluster.is_connected(),
            _ => false,
        }
    }

    /// Current nodes ordered by name; empty when not connected.
    pub fn get_nodes(&self) -> Vec<ClusterNode> {
        match &*self.inner.state.lock() {
            ClientState::Connected { cluster } => cluster.nodes(),
            _ => Vec::new(),
        }
    }

    /// Commands issued after this call snapshot the new mode.
    pub fn set_capture_stack_traces(&self, enabled: bool) {
        self.inner
            .capture_stack_traces
            .store(enabled, Ordering::Relaxed);
    }

    /// Subscribes to a topology event channel.
    pub fn on(
        &self,
        name: EventName,
        handler: impl Fn(&TopologyEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.monitor.subscribe(name, Arc::new(handler))
    }

    /// Removes a subscription; false when it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.monitor.unsubscribe(id)
    }

    /// Reads all bins of a record. A missing record is `KeyNotFound`.
    #[track_caller]
    pub fn get(&self, key: &Key, policy: Option<&ReadPolicy>) -> Deferred<Record> {
        let (completion, deferred) = Completion::deferred();
        let _guard = self.submit_get(key, policy, completion, Location::caller());
        deferred
    }

    #[track_caller]
    pub fn get_with(
        &self,
        key: &Key,
        policy: Option<&ReadPolicy>,
        callback: impl FnOnce(Result<Record>) + Send + 'static,
    ) {
        let _guard = self.submit_get(key, policy, Completion::callback(callback), Location::caller());
    }

    /// Writes (merges) bins into a record.
    #[track_caller]
    pub fn put(&self, key: &Key, bins: &Bins, policy: Option<&WritePolicy>) -> Deferred<()> {
        let (completion, deferred) = Completion::deferred();
        let _guard = self.submit_put(key, bins, policy, completion, Location::caller());
        deferred
    }

    #[track_caller]
    pub fn put_with(
        &self,
        key: &Key,
        bins: &Bins,
        policy: Option<&WritePolicy>,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let _guard = self.submit_put(
            key,
            bins,
            policy,
            Completion::callback(callback),
            Location::caller(),
        );
    }

    /// Deletes a record. A missing record is `KeyNotFound`.
    #[track_caller]
    pub fn remove(&self, key: &Key, policy: Option<&RemovePolicy>) -> Deferred<()> {
        let (completion, deferred) = Completion::deferred();
        let _guard = self.submit_remove(key, policy, completion, Location::caller());
        deferred
    }

    #[track_caller]
    pub fn remove_with(
        &self,
        key: &Key,
        policy: Option<&RemovePolicy>,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let _guard =
            self.submit_remove(key, policy, Completion::callback(callback), Location::caller());
    }

    /// Checks whether a record exists.
    #[track_caller]
    pub fn exists(&self, key: &Key, policy: Option<&ReadPolicy>) -> Deferred<bool> {
        let (completion, deferred) = Completion::deferred();
        let _guard = self.submit_exists(key, policy, completion, Location::caller());
        deferred
    }

    #[track_caller]
    pub fn exists_with(
        &self,
        key: &Key,
        policy: Option<&ReadPolicy>,
        callback: impl FnOnce(Result<bool>) + Send + 'static,
    ) {
        let _guard =
            self.submit_exists(key, policy, Completion::callback(callback), Location::caller());
    }

    /// Metadata of many records; one result per key, in key order.
    #[track_caller]
    pub fn batch_exists(
        &self,
        keys: &[Key],
        policy: Option<&BatchPolicy>,
    ) -> Deferred<Vec<BatchResult>> {
        let (completion, deferred) = Completion::deferred();
        let _guard = self.submit_batch(
            keys,
            BatchOp::Exists,
            policy,
            completion,
            Location::caller(),
        );
        deferred
    }

    #[track_caller]
    pub fn batch_exists_with(
        &self,
        keys: &[Key],
        policy: Option<&BatchPolicy>,
        callback: impl FnOnce(Result<Vec<BatchResult>>) + Send + 'static,
    ) {
        let _guard = self.submit_batch(
            keys,
            BatchOp::Exists,
            policy,
            Completion::callback(callback),
            Location::caller(),
        );
    }

    /// Records of many keys, optionally limited to `bins`.
    #[track_caller]
    pub fn batch_get(
        &self,
        keys: &[Key],
        bins: Option<&[&str]>,
        policy: Option<&BatchPolicy>,
    ) -> Deferred<Vec<BatchResult>> {
        let (completion, deferred) = Completion::deferred();
        let _guard = self.submit_batch(keys, batch_get_op(bins), policy, completion, Location::caller());
        deferred
    }

    #[track_caller]
    pub fn batch_get_with(
        &self,
        keys: &[Key],
        bins: Option<&[&str]>,
        policy: Option<&BatchPolicy>,
        callback: impl FnOnce(Result<Vec<BatchResult>>) + Send + 'static,
    ) {
        let _guard = self.submit_batch(
            keys,
            batch_get_op(bins),
            policy,
            Completion::callback(callback),
            Location::caller(),
        );
    }

    fn submit_connect(
        &self,
        completion: Completion<Client>,
        location: &'static Location<'static>,
    ) -> InvocationGuard {
        let call_site = call_site(self.inner.capture(), location);
        let plan = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                ClientState::Disconnected => {
                    *state = ClientState::Connecting {
                        joiners: Vec::new(),
                    };
                    ConnectPlan::Fresh
                }
                ClientState::Connecting { joiners } => {
                    let (tx, rx) = oneshot::channel();
                    joiners.push(tx);
                    ConnectPlan::Join(rx)
                }
                ClientState::Connected { .. } => ConnectPlan::Ready,
                ClientState::Closing | ClientState::Closed => ConnectPlan::Rejected,
            }
        };

        let client = self.clone();
        let bridge = &self.inner.bridge;
        match plan {
            ConnectPlan::Fresh => {
                let settings = self.inner.cluster_settings();
                let sink = bridge.event_sink();
                let mut command = Command::new(
                    "connect",
                    completion,
                    call_site,
                    move |result: Result<Arc<NativeCluster>>| client.finish_connect(result),
                );
                command.prepare(Ok(move || NativeCluster::connect(settings, sink)));
                bridge.submit(Box::new(command))
            }
            ConnectPlan::Join(rx) => {
                let mut command =
                    Command::new("connect", completion, call_site, move |result: Result<()>| {
                        result.map(|()| client)
                    });
                command.prepare(Ok(move || {
                    rx.blocking_recv()
                        .unwrap_or_else(|_| Err(Error::connection("connect abandoned")))
                }));
                bridge.submit(Box::new(command))
            }
            ConnectPlan::Ready => {
                let mut command = Command::direct("connect", completion, call_site);
                command.set_result(client);
                bridge.submit(Box::new(command))
            }
            ConnectPlan::Rejected => {
                let mut command = Command::direct("connect", completion, call_site);
                command.set_error(Error::connection("client is closed"));
                bridge.submit(Box::new(command))
            }
        }
    }

    /// Respond-time half of a fresh connect; runs in the dispatch loop.
    fn finish_connect(&self, result: Result<Arc<NativeCluster>>) -> Result<Client> {
        let mut state = self.inner.state.lock();
        let joiners = match mem::replace(&mut *state, ClientState::Disconnected) {
            ClientState::Connecting { joiners } => joiners,
            other => {
                // Closed while connecting; the new cluster is not wanted.
                *state = other;
                drop(state);
                if let Ok(cluster) = result {
                    cluster.close();
                }
                return Err(Error::connection("client closed while connecting"));
            }
        };

        let outcome = match result {
            Ok(cluster) => {
                info!(nodes = cluster.nodes().len(), "connected to cluster");
                *state = ClientState::Connected { cluster };
                Ok(())
            }
            Err(err) => {
                info!(error = %err, "connect failed");
                Err(err)
            }
        };
        drop(state);

        for joiner in joiners {
            let _ = joiner.send(outcome.clone());
        }
        outcome.map(|()| self.clone())
    }

    /// Prepares and submits a single data command.
    #[allow(clippy::too_many_arguments)]
    fn submit_data<P, T, F>(
        &self,
        name: &'static str,
        policy: Option<&P>,
        defaults: fn(&DefaultPolicies) -> &P,
        checked: Result<()>,
        completion: Completion<T>,
        location: &'static Location<'static>,
        run: F,
    ) -> InvocationGuard
    where
        P: Policy,
        T: Send + 'static,
        F: FnOnce(&NativeCluster, &ExecOptions) -> Result<T> + Send + 'static,
    {
        let mut command = Command::direct(name, completion, call_site(self.inner.capture(), location));
        let prepared = checked
            .and_then(|()| {
                let policy = policy.unwrap_or_else(|| defaults(&self.inner.config.policies));
                policy.validate()?;
                Ok(policy.exec_options())
            })
            .and_then(|options| {
                let cluster = self.inner.cluster()?;
                Ok(move || run(&cluster, &options))
            });
        command.prepare(prepared);
        self.inner.bridge.submit(Box::new(command))
    }

    fn submit_get(
        &self,
        key: &Key,
        policy: Option<&ReadPolicy>,
        completion: Completion<Record>,
        location: &'static Location<'static>,
    ) -> InvocationGuard {
        let key = key.clone();
        self.submit_data(
            "get",
            policy,
            |defaults| &defaults.read,
            Ok(()),
            completion,
            location,
            move |cluster, options| ops::get(cluster, &key, None, options),
        )
    }

    fn submit_put(
        &self,
        key: &Key,
        bins: &Bins,
        policy: Option<&WritePolicy>,
        completion: Completion<()>,
        location: &'static Location<'static>,
    ) -> InvocationGuard {
        let checked = if bins.is_empty() {
            Err(Error::param("bins must not be empty"))
        } else {
            Ok(())
        };
        let key = key.clone();
        let bins = bins.clone();
        self.submit_data(
            "put",
            policy,
            |defaults| &defaults.write,
            checked,
            completion,
            location,
            move |cluster, options| ops::put(cluster, &key, &bins, options).map(|_| ()),
        )
    }

    fn submit_remove(
        &self,
        key: &Key,
        policy: Option<&RemovePolicy>,
        completion: Completion<()>,
        location: &'static Location<'static>,
    ) -> InvocationGuard {
        let key = key.clone();
        self.submit_data(
            "remove",
            policy,
            |defaults| &defaults.remove,
            Ok(()),
            completion,
            location,
            move |cluster, options| ops::remove(cluster, &key, options),
        )
    }

    fn submit_exists(
        &self,
        key: &Key,
        policy: Option<&ReadPolicy>,
        completion: Completion<bool>,
        location: &'static Location<'static>,
    ) -> InvocationGuard {
        let key = key.clone();
        self.submit_data(
            "exists",
            policy,
            |defaults| &defaults.read,
            Ok(()),
            completion,
            location,
            move |cluster, options| ops::exists(cluster, &key, options).map(|meta| meta.is_some()),
        )
    }

    fn submit_batch(
        &self,
        keys: &[Key],
        op: BatchOp,
        policy: Option<&BatchPolicy>,
        completion: Completion<Vec<BatchResult>>,
        location: &'static Location<'static>,
    ) -> InvocationGuard {
        let checked = if keys.is_empty() {
            Err(Error::param("batch requires at least one key"))
        } else if matches!(&op, BatchOp::Get { bins: Some(bins) } if bins.is_empty()) {
            Err(Error::param("bin list must not be empty"))
        } else {
            Ok(())
        };
        let name = match op {
            BatchOp::Exists => "batch_exists",
            BatchOp::Get { .. } => "batch_get",
        };
        let keys = keys.to_vec();
        self.submit_data(
            name,
            policy,
            |defaults| &defaults.batch,
            checked,
            completion,
            location,
            move |cluster, options| {
                let mut aggregator = BatchAggregator::new(keys.len());
                let outcome = batch_read(cluster, &op, &keys, options, &mut |items| {
                    aggregator.on_items(items)
                });
                aggregator.finish(&keys, outcome)
            },
        )
    }
}

fn batch_get_op(bins: Option<&[&str]>) -> BatchOp {
    BatchOp::Get {
        bins: bins.map(|bins| bins.iter().map(|bin| bin.to_string()).collect()),
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("hosts", &self.inner.config.hosts)
            .field("state", &self.inner.state.lock().name())
            .finish()
    }
}

impl ClientInner {
    fn capture(&self) -> bool {
        self.capture_stack_traces.load(Ordering::Relaxed)
    }

    fn cluster(&self) -> Result<Arc<NativeCluster>> {
        match &*self.state.lock() {
            ClientState::Connected { cluster } => Ok(cluster.clone()),
            ClientState::Closing | ClientState::Closed => Err(Error::connection("client is closed")),
            _ => Err(Error::connection("client is not connected")),
        }
    }

    fn cluster_settings(&self) -> ClusterSettings {
        let config = &self.config;
        ClusterSettings {
            seeds: config.hosts.iter().map(|host| host.address()).collect(),
            node: NodeSettings {
                cluster_name: config.cluster_name.clone(),
                max_conns: config.max_conns_per_node,
                max_idle: config.max_idle_per_node,
                connect_timeout: config.connect_timeout(),
            },
            tend_interval: config.tend_interval(),
        }
    }

    fn close(&self) {
        let previous = mem::replace(&mut *self.state.lock(), ClientState::Closing);
        let (cluster, joiners) = match previous {
            ClientState::Closed => {
                *self.state.lock() = ClientState::Closed;
                return;
            }
            ClientState::Connected { cluster } => (Some(cluster), Vec::new()),
            ClientState::Connecting { joiners } => (None, joiners),
            ClientState::Disconnected | ClientState::Closing => (None, Vec::new()),
        };

        for joiner in joiners {
            let _ = joiner.send(Err(Error::connection("client closed while connecting")));
        }
        if let Some(cluster) = cluster {
            cluster.close();
        }
        *self.state.lock() = ClientState::Closed;
        self.bridge.shutdown();
        info!("client closed");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Host;
    use crate::ErrorKind;

    fn config() -> ClientConfig {
        ClientConfig::with_host(Host::new("127.0.0.1", 1))
    }

    #[test]
    fn new_requires_a_runtime() {
        let err = Client::new(config()).unwrap_err();
        assert_eq!(err.status(), Status::ClientFailure);
    }

    #[tokio::test]
    async fn invalid_config_fails_construction() {
        let err = Client::new(ClientConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Param);
    }

    #[tokio::test]
    async fn commands_before_connect_fail_asynchronously() {
        let client = Client::new(config()).unwrap();
        let key = Key::new("test", "demo", 1).unwrap();

        let err = client.get(&key, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(err.message(), "client is not connected");
        assert!(!client.is_connected(false));
        assert!(client.get_nodes().is_empty());
    }

    #[tokio::test]
    async fn parameter_errors_win_over_connection_errors() {
        let client = Client::new(config()).unwrap();
        let err = client.batch_exists(&[], None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Param);

        let key = Key::new("test", "demo", 1).unwrap();
        let err = client.put(&key, &Bins::new(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Param);
    }

    #[tokio::test]
    async fn connect_after_close_is_rejected() {
        let client = Client::new(config()).unwrap();
        client.close();
        client.close();
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(err.message(), "client is closed");
    }
}
