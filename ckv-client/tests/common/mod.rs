#![allow(dead_code)]

use std::time::Duration;

use ckv_client::{ClientConfig, Host};
use ckv_node::{NodeConfig, NodeHandle, NodeServer};
use tokio::runtime::{Builder, Runtime};

/// Runs test nodes on their own runtime so blocking client threads never
/// wait on the runtime driving the test.
pub struct NodeRuntime {
    runtime: Option<Runtime>,
}

impl NodeRuntime {
    pub fn new() -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("node runtime");
        NodeRuntime {
            runtime: Some(runtime),
        }
    }

    pub async fn start(&self, config: NodeConfig) -> NodeHandle {
        let runtime = self.runtime.as_ref().expect("runtime running");
        runtime
            .spawn(NodeServer::bind(config))
            .await
            .expect("bind task")
            .expect("bind node")
    }

    pub async fn start_default(&self) -> NodeHandle {
        self.start(NodeConfig::default()).await
    }
}

impl Drop for NodeRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

pub fn config_for(nodes: &[&NodeHandle]) -> ClientConfig {
    ClientConfig {
        hosts: nodes
            .iter()
            .map(|node| Host::parse(&node.address()).expect("node address"))
            .collect(),
        tend_interval_ms: 20,
        connect_timeout_ms: 500,
        ..ClientConfig::default()
    }
}

/// Address nothing listens on.
pub fn unused_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);
    addr
}

/// Polls `check` for up to five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
