
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use portmesh::cluster::{Cluster, SimCluster, SimNode};
use portmesh::config::KernelConfig;
use portmesh::database::{Document, DocumentStore, FileStore, MemoryStore};
use portmesh::node::KernelHandle;
use portmesh::transport::Wait;
use portmesh::KernelError;
use test_harness::{assert_eventually, home_cluster, test_config, TestKernel};

#[tokio::test]
async fn test_basic_lock_cycle() {
    let kernel = TestKernel::start(home_cluster(64.0)).await;
    let (_, a) = kernel.client("a");
    let (_, b) = kernel.client("b");

    let lease_a = a.db.lock(Wait::For(Duration::from_secs(2))).await.unwrap();
    assert_eq!(lease_a.document(), &Document::default());

    // B queues behind A and only gets the document A writes
    let b_db = b.db.clone();
    let waiter = tokio::spawn(async move { b_db.lock(Wait::For(Duration::from_secs(5))).await });

    assert_eventually(
        || async { a.db.status().await.unwrap().lock_queue.len() == 1 },
        Duration::from_secs(2),
        "B should be queued",
    )
    .await;
    assert!(!waiter.is_finished());

    let d1 = lease_a.document().clone().with_config_value("round", json!(1));
    a.db.write_and_unlock(lease_a, d1).await.unwrap();

    let lease_b = tokio::time::timeout(Duration::from_secs(3), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(lease_b.document().config_value("round"), Some(&json!(1)));
    b.db.unlock(lease_b).await.unwrap();

    let status = a.db.status().await.unwrap();
    assert!(status.current_lock.is_none());
    assert!(status.lock_queue.is_empty());

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_mutual_exclusion_under_contention() {
    let kernel = TestKernel::start(home_cluster(64.0)).await;
    let mut workers = Vec::new();

    for i in 0..6 {
        let (_, client) = kernel.client(&format!("w{i}"));
        workers.push(tokio::spawn(async move {
            for _ in 0..3 {
                client
                    .db
                    .update(Wait::For(Duration::from_secs(10)), |doc| {
                        let count = doc.config_value("count").and_then(|v| v.as_u64()).unwrap_or(0);
                        Ok((doc.with_config_value("count", json!(count + 1)), ()))
                    })
                    .await
                    .unwrap();
            }
        }));
    }
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(20), worker)
            .await
            .unwrap()
            .unwrap();
    }

    let (_, reader) = kernel.client("reader");
    let doc = reader.db.read().await.unwrap();
    assert_eq!(doc.config_value("count"), Some(&json!(18)));

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_status_reports_holder_and_waiters() {
    let kernel = TestKernel::start(home_cluster(64.0)).await;
    let (_, a) = kernel.client("a");
    let (b_process, b) = kernel.client("b");

    let lease_a = a.db.lock(Wait::For(Duration::from_secs(2))).await.unwrap();
    let b_db = b.db.clone();
    let waiter = tokio::spawn(async move { b_db.lock(Wait::For(Duration::from_secs(5))).await });

    assert_eventually(
        || async { a.db.status().await.unwrap().lock_queue.len() == 1 },
        Duration::from_secs(2),
        "B should be queued",
    )
    .await;

    let (_, observer) = kernel.client("observer");
    let status = observer.db.status().await.unwrap();
    assert_eq!(status.current_lock.as_ref(), Some(lease_a.holder()));
    assert_eq!(status.lock_queue[0].pid, b_process.pid);

    a.db.unlock(lease_a).await.unwrap();
    let lease_b = waiter.await.unwrap().unwrap();
    assert_eq!(lease_b.holder().pid, b_process.pid);
    b.db.unlock(lease_b).await.unwrap();

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_reads_are_not_blocked_by_lock() {
    let kernel = TestKernel::start(home_cluster(64.0)).await;
    let (_, writer) = kernel.client("writer");
    kernel.cluster.add_node(SimNode::new("far", 8.0));
    kernel.cluster.link("home", "far");
    let (_, reader) = kernel.client_on("reader", "far");

    writer
        .db
        .update(Wait::For(Duration::from_secs(2)), |doc| {
            Ok((doc.with_config_value("v", json!("one")), ()))
        })
        .await
        .unwrap();
    let lease = writer.db.lock(Wait::For(Duration::from_secs(2))).await.unwrap();

    let doc = tokio::time::timeout(Duration::from_secs(2), reader.db.read())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.config_value("v"), Some(&json!("one")));
    assert!(doc.meta().is_locked());

    writer.db.unlock(lease).await.unwrap();
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_stale_lock_is_broken_and_passed_on() {
    let kernel = TestKernel::start(home_cluster(64.0)).await;
    let (doomed_process, doomed) = kernel.client("doomed");
    let (_, survivor) = kernel.client("survivor");

    let lease = doomed.db.lock(Wait::For(Duration::from_secs(2))).await.unwrap();

    let survivor_db = survivor.db.clone();
    let waiter = tokio::spawn(async move { survivor_db.lock(Wait::For(Duration::from_secs(5))).await });
    assert_eventually(
        || async { survivor.db.status().await.unwrap().lock_queue.len() == 1 },
        Duration::from_secs(2),
        "survivor should be queued",
    )
    .await;

    kernel.cluster.crash("home", doomed_process.pid);
    drop(lease);

    let granted = tokio::time::timeout(Duration::from_secs(3), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let status = survivor.db.status().await.unwrap();
    assert_eq!(status.current_lock.as_ref(), Some(granted.holder()));
    survivor.db.unlock(granted).await.unwrap();

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_lock_timeout_abandons_the_queue() {
    let kernel = TestKernel::start(home_cluster(64.0)).await;
    let (_, holder) = kernel.client("holder");
    let (_, impatient) = kernel.client("impatient");

    let lease = holder.db.lock(Wait::For(Duration::from_secs(2))).await.unwrap();
    let result = impatient.db.lock(Wait::For(Duration::from_millis(100))).await;
    assert!(matches!(result, Err(KernelError::Timeout(_))));

    let status = holder.db.status().await.unwrap();
    assert!(status.lock_queue.is_empty());
    assert_eq!(status.current_lock.as_ref(), Some(lease.holder()));

    holder.db.unlock(lease).await.unwrap();
    let status = holder.db.status().await.unwrap();
    assert!(status.current_lock.is_none());

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_committed_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let cluster = home_cluster(64.0);

    let config = test_config().with_state_path(path.clone());
    let kernel = KernelHandle::start(
        config.clone(),
        cluster.clone(),
        Arc::new(FileStore::new(path.clone())),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let process = cluster.spawn("client", "home", 1, &[]).unwrap();
    let client = kernel.connect(process.clone());
    client
        .db
        .update(Wait::For(Duration::from_secs(2)), |doc| {
            Ok((doc.with_config_value("persisted", json!(42)), ()))
        })
        .await
        .unwrap();
    kernel.shutdown().await;

    let stored = FileStore::new(path.clone()).load_document().await.unwrap();
    assert_eq!(stored.config_value("persisted"), Some(&json!(42)));
    assert!(!stored.meta().is_locked());

    let kernel = KernelHandle::start(
        config,
        cluster.clone(),
        Arc::new(FileStore::new(path)),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let doc = kernel.connect(process).db.read().await.unwrap();
    assert_eq!(doc.config_value("persisted"), Some(&json!(42)));
    kernel.shutdown().await;
}

#[tokio::test]
async fn test_database_refuses_wrong_host() {
    let cluster = Arc::new(SimCluster::new("home", 64.0, 4));
    cluster.add_node(SimNode::new("away", 64.0));
    cluster.link("home", "away");

    let mut config = KernelConfig::new("away");
    config.database.home_host = "home".into();
    let result = KernelHandle::start(
        config,
        cluster,
        Arc::new(MemoryStore::new()),
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(result, Err(KernelError::Misconfigured(_))));
}
