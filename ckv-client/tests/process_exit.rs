//! Lives in its own test binary so no other client owns a tend thread.

mod common;

use ckv_client::{active_tend_threads, Client};

use common::{config_for, eventually, NodeRuntime};

#[tokio::test(flavor = "multi_thread")]
async fn closed_clients_leave_no_tend_thread_behind() -> anyhow::Result<()> {
    let nodes = NodeRuntime::new();
    let node = nodes.start_default().await;
    assert_eq!(active_tend_threads(), 0);

    let client = Client::new(config_for(&[&node]))?;
    client.connect().await?;
    assert_eq!(active_tend_threads(), 1);

    let other = Client::new(config_for(&[&node]))?;
    other.connect().await?;
    assert_eq!(active_tend_threads(), 2);

    client.close();
    assert_eq!(active_tend_threads(), 1);
    client.close();
    assert_eq!(active_tend_threads(), 1);

    drop(other);
    assert!(eventually(|| active_tend_threads() == 0).await);
    Ok(())
}
