mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ckv_client::{
    Bins, BatchPolicy, Client, ClientConfig, ErrorKind, EventName, FilterExpression, Host, Key,
    ReadPolicy, Status, TopologyEvent,
};
use ckv_node::NodeConfig;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use common::{config_for, eventually, unused_address, NodeRuntime};

fn key(user_key: &str) -> Key {
    Key::new("test", "demo", user_key).expect("valid key")
}

fn bins(value: serde_json::Value) -> Bins {
    serde_json::from_value(value).expect("bins object")
}

#[tokio::test(flavor = "current_thread")]
async fn callbacks_fire_after_the_issuing_call_returns() -> anyhow::Result<()> {
    let nodes = NodeRuntime::new();
    let node = nodes.start_default().await;
    let client = Client::new(config_for(&[&node]))?;
    client.connect().await?;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();
    let seen = log.clone();
    client.get_with(&key("missing"), None, move |result| {
        seen.lock().unwrap().push("callback");
        let _ = done_tx.send(result.map(|_| ()));
    });
    log.lock().unwrap().push("after");

    let err = done_rx.await?.unwrap_err();
    assert_eq!(err.status(), Status::KeyNotFound);
    assert_eq!(*log.lock().unwrap(), vec!["after", "callback"]);

    client.close();
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn not_connected_errors_are_also_asynchronous() -> anyhow::Result<()> {
    let client = Client::new(ClientConfig::with_host(Host::parse(&unused_address())?))?;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();
    let seen = log.clone();
    client.exists_with(&key("k"), None, move |result| {
        seen.lock().unwrap().push("callback");
        let _ = done_tx.send(result);
    });
    log.lock().unwrap().push("after");

    let err = done_rx.await?.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(*log.lock().unwrap(), vec!["after", "callback"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_is_idempotent_and_close_is_safe() -> anyhow::Result<()> {
    let nodes = NodeRuntime::new();
    let node = nodes.start_default().await;
    let client = Client::new(config_for(&[&node]))?;

    let first = client.connect();
    let second = client.connect();
    let (first, second) = (first.await?, second.await?);
    assert!(first.ptr_eq(&client));
    assert!(second.ptr_eq(&client));
    assert!(client.connect().await?.ptr_eq(&client));
    assert!(client.is_connected(false));
    assert!(client.is_connected(true));

    client.close();
    client.close();
    assert!(!client.is_connected(false));
    assert!(!client.is_connected(true));
    assert!(client.get_nodes().is_empty());

    let err = client.get(&key("k"), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn close_without_connect_is_a_no_op() -> anyhow::Result<()> {
    let client = Client::new(ClientConfig::with_host(Host::new("127.0.0.1", 1)))?;
    client.close();
    client.close();
    assert!(!client.is_connected(false));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_hosts_fail_connect_and_stay_retryable() -> anyhow::Result<()> {
    let client = Client::new(ClientConfig {
        connect_timeout_ms: 200,
        ..ClientConfig::with_host(Host::parse(&unused_address())?)
    })?;

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.message().contains("failed to connect"), "{}", err);
    assert!(!client.is_connected(false));

    let err = client.connect().await.unwrap_err();
    assert!(err.message().contains("failed to connect"));

    client.close();
    client.close();
    let err = client.connect().await.unwrap_err();
    assert_eq!(err.message(), "client is closed");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn nodes_report_hex_names_and_addresses() -> anyhow::Result<()> {
    let nodes = NodeRuntime::new();
    let node = nodes.start_default().await;
    let client = Client::new(config_for(&[&node]))?;
    client.connect().await?;

    let cluster = client.get_nodes();
    assert_eq!(cluster.len(), 1);
    let first = &cluster[0];
    assert_eq!(first.name.len(), 16);
    assert!(first
        .name
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b)));
    assert_eq!(first.name, node.node_id());
    assert!(!first.address.is_empty());

    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn peers_are_discovered_and_ordered() -> anyhow::Result<()> {
    let nodes = NodeRuntime::new();
    let a = nodes.start_default().await;
    let b = nodes.start_default().await;
    a.add_peer(b.address());

    let client = Client::new(config_for(&[&a]))?;
    client.connect().await?;

    let names: Vec<String> = client.get_nodes().into_iter().map(|n| n.name).collect();
    let mut expected = vec![a.node_id().to_string(), b.node_id().to_string()];
    expected.sort();
    assert_eq!(names, expected);

    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn foreign_clusters_are_rejected() -> anyhow::Result<()> {
    let nodes = NodeRuntime::new();
    let node = nodes
        .start(NodeConfig {
            cluster_name: "alpha".to_string(),
            ..NodeConfig::default()
        })
        .await;
    let client = Client::new(ClientConfig {
        cluster_name: Some("beta".to_string()),
        ..config_for(&[&node])
    })?;

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.message().contains("alpha"));
    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_pool_fails_reads_with_io_error() -> anyhow::Result<()> {
    let nodes = NodeRuntime::new();
    let node = nodes.start_default().await;
    let client = Client::new(ClientConfig {
        max_conns_per_node: 0,
        ..config_for(&[&node])
    })?;
    client.connect().await?;

    let err = client.get(&key("k"), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(err.status(), Status::NoMoreConnections);
    assert_eq!(err.message(), "no more connections available");

    let err = client
        .batch_exists(&[key("a"), key("b")], None)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::NoMoreConnections);

    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn records_round_trip() -> anyhow::Result<()> {
    let nodes = NodeRuntime::new();
    let node = nodes.start_default().await;
    let client = Client::new(config_for(&[&node]))?;
    client.connect().await?;

    let k = key("alice");
    client.put(&k, &bins(json!({"name": "alice", "age": 30})), None).await?;
    client.put(&k, &bins(json!({"age": 31})), None).await?;

    let record = client.get(&k, None).await?;
    assert_eq!(record.generation, 2);
    assert_eq!(record.bins["name"], json!("alice"));
    assert_eq!(record.bins["age"], json!(31));
    assert!(client.exists(&k, None).await?);

    client.remove(&k, None).await?;
    assert!(!client.exists(&k, None).await?);
    let err = client.remove(&k, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(err.status(), Status::KeyNotFound);

    let err = client.put(&k, &Bins::new(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Param);

    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_in_flight_at_close_still_complete() -> anyhow::Result<()> {
    const IN_FLIGHT: usize = 50;

    let nodes = NodeRuntime::new();
    let node = nodes.start_default().await;
    let client = Client::new(config_for(&[&node]))?;
    client.connect().await?;
    let k = key("busy");
    client.put(&k, &bins(json!({"n": 1})), None).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for _ in 0..IN_FLIGHT {
        let tx = tx.clone();
        client.get_with(&k, None, move |result| {
            let _ = tx.send(result);
        });
    }
    drop(tx);
    client.close();

    let mut completed = 0;
    while let Some(result) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await? {
        let record = result?;
        assert_eq!(record.bins["n"], json!(1));
        completed += 1;
    }
    assert_eq!(completed, IN_FLIGHT);

    let err = client.get(&k, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn filters_are_evaluated_by_the_node() -> anyhow::Result<()> {
    let nodes = NodeRuntime::new();
    let node = nodes.start_default().await;
    let client = Client::new(config_for(&[&node]))?;
    client.connect().await?;

    let k = key("filtered");
    client.put(&k, &bins(json!({"a": 1})), None).await?;

    let mut policy = ReadPolicy::default();
    policy.base.filter = Some(FilterExpression::new(json!({"op": "eq", "bin": "a", "value": 2})));
    let err = client.get(&k, Some(&policy)).await.unwrap_err();
    assert_eq!(err.status(), Status::FilteredOut);
    assert_eq!(err.kind(), ErrorKind::Server);

    policy.base.filter = Some(FilterExpression::new(json!({"op": "eq", "bin": "a", "value": 1})));
    assert_eq!(client.get(&k, Some(&policy)).await?.bins["a"], json!(1));

    policy.base.filter = Some(FilterExpression::new(json!("not an object")));
    let err = client.get(&k, Some(&policy)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Param);

    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn batches_keep_one_result_per_key() -> anyhow::Result<()> {
    let nodes = NodeRuntime::new();
    let a = nodes.start_default().await;
    let b = nodes.start_default().await;
    a.add_peer(b.address());
    b.add_peer(a.address());

    let client = Client::new(config_for(&[&a]))?;
    client.connect().await?;
    assert_eq!(client.get_nodes().len(), 2);

    let keys: Vec<Key> = (0..20).map(|i| key(&format!("user-{}", i))).collect();
    for (i, k) in keys.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
        client
            .put(k, &bins(json!({"i": i, "even": true})), None)
            .await?;
    }

    for concurrent_nodes in [true, false] {
        let policy = BatchPolicy {
            concurrent_nodes,
            ..BatchPolicy::default()
        };
        let results = client.batch_exists(&keys, Some(&policy)).await?;
        assert_eq!(results.len(), keys.len());
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.key, keys[i]);
            if i % 2 == 0 {
                assert_eq!(result.status, Status::Ok);
                let record = result.record.as_ref().expect("metadata");
                assert_eq!(record.generation, 1);
                assert!(record.bins.is_empty());
            } else {
                assert_eq!(result.status, Status::KeyNotFound);
                assert!(result.record.is_none());
            }
        }
    }

    let results = client.batch_get(&keys, Some(&["i"][..]), None).await?;
    assert_eq!(results.len(), keys.len());
    let record = results[4].record.as_ref().expect("record");
    assert_eq!(record.bins.len(), 1);
    assert_eq!(record.bins["i"], json!(4));

    let err = client.batch_get(&keys, Some(&[][..]), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Param);

    client.close();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn errors_carry_the_call_site_when_enabled() -> anyhow::Result<()> {
    let client = Client::new(ClientConfig::with_host(Host::new("127.0.0.1", 1)))?;

    let err = client.get(&key("k"), None).await.unwrap_err();
    assert!(err.call_site().is_none());

    client.set_capture_stack_traces(true);
    let (line, deferred) = (line!(), client.get(&key("k"), None));
    let err = deferred.await.unwrap_err();
    let site = err.call_site().expect("call site");
    assert!(site.location().file().ends_with("client.rs"));
    assert_eq!(site.location().line(), line);
    assert!(!site.backtrace().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn topology_changes_are_published() -> anyhow::Result<()> {
    let nodes = NodeRuntime::new();
    let a = nodes.start_default().await;
    let client = Client::new(config_for(&[&a]))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for name in [
        EventName::NodeAdded,
        EventName::NodeRemoved,
        EventName::Disconnected,
        EventName::Event,
    ] {
        let tx = tx.clone();
        client.on(name, move |event: &TopologyEvent| {
            let _ = tx.send((name, event.clone()));
        });
    }

    client.connect().await?;
    let b = nodes.start_default().await;
    let b_id = b.node_id().to_string();
    a.add_peer(b.address());

    let events = Arc::new(Mutex::new(Vec::new()));
    let collect = |rx: &mut mpsc::UnboundedReceiver<(EventName, TopologyEvent)>| {
        while let Ok(item) = rx.try_recv() {
            events.lock().unwrap().push(item);
        }
    };
    let has = |events: &[(EventName, TopologyEvent)], wanted: EventName, node: Option<&str>| {
        events.iter().any(|(name, event)| {
            *name == wanted && event.node().map(|n| n.name.as_str()) == node
        })
    };

    assert!(
        eventually(|| {
            collect(&mut rx);
            let events = events.lock().unwrap();
            has(&events, EventName::NodeAdded, Some(b_id.as_str()))
                && has(&events, EventName::Event, Some(b_id.as_str()))
        })
        .await
    );
    assert_eq!(client.get_nodes().len(), 2);

    a.remove_peer(&b.address());
    b.shutdown().await;
    assert!(
        eventually(|| {
            collect(&mut rx);
            has(&events.lock().unwrap(), EventName::NodeRemoved, Some(b_id.as_str()))
        })
        .await
    );
    assert_eq!(client.get_nodes().len(), 1);

    a.shutdown().await;
    assert!(
        eventually(|| {
            collect(&mut rx);
            has(&events.lock().unwrap(), EventName::Disconnected, None)
        })
        .await
    );
    assert!(client.is_connected(false));
    assert!(eventually(|| !client.is_connected(true)).await);

    let events = events.lock().unwrap();
    let generic = events
        .iter()
        .filter(|(name, event)| {
            *name == EventName::Event
                && matches!(event, TopologyEvent::Generic { name: EventName::Disconnected, .. })
        })
        .count();
    assert_eq!(generic, 1);
    drop(events);

    client.close();
    tokio::time::sleep(Duration::from_millis(10)).await;
    Ok(())
}
