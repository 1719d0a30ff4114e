
use std::sync::Arc;
use std::time::Duration;

use portmesh::cluster::ProcessTable;
use portmesh::database::MemoryStore;
use portmesh::node::KernelClient;
use portmesh::scheduler::{HostAffinity, ServiceOutcome, ServiceSpec, ServiceState, ServiceStatus};
use test_harness::{assert_eventually, home_cluster, linked_cluster, test_config, TestKernel};

const MONITOR: &str = "monitor.js";
const HACKNET: &str = "hacknet.js";

async fn start_kernel() -> TestKernel {
    let kernel = TestKernel::start(linked_cluster(16.0, &[("n1", 8.0)])).await;
    kernel.cluster.set_cost(MONITOR, 2.0);
    kernel.cluster.set_cost(HACKNET, 1.0);
    kernel
}

async fn service(client: &KernelClient, name: &str) -> Option<ServiceState> {
    client
        .scheduler
        .status()
        .await
        .unwrap()
        .services
        .into_iter()
        .find(|s| s.spec.name == name)
}

#[tokio::test]
async fn test_reload_starts_enabled_services_only() {
    let kernel = start_kernel().await;
    let (_, client) = kernel.client("admin");

    let report = client
        .scheduler
        .reload_services(Some(vec![
            ServiceSpec::new(MONITOR),
            ServiceSpec::new(HACKNET).disabled_by_default(),
        ]))
        .await
        .unwrap();
    assert_eq!(report.added.len(), 2);
    assert!(report.failed.is_empty());

    let monitor = service(&client, MONITOR).await.unwrap();
    assert!(monitor.enabled);
    let process = monitor.process().unwrap();
    assert!(kernel.cluster.is_running(process));
    assert_eq!(process.executable, MONITOR);

    let hacknet = service(&client, HACKNET).await.unwrap();
    assert!(!hacknet.enabled);
    assert_eq!(hacknet.status, ServiceStatus::New);

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_crashed_service_is_restarted_when_enabled() {
    let kernel = start_kernel().await;
    let (_, client) = kernel.client("admin");
    client
        .scheduler
        .reload_services(Some(vec![ServiceSpec::new(MONITOR)]))
        .await
        .unwrap();

    let first = service(&client, MONITOR).await.unwrap().process().cloned().unwrap();
    kernel.cluster.crash(&first.hostname, first.pid);

    assert_eventually(
        || async {
            service(&client, MONITOR)
                .await
                .and_then(|s| s.process().cloned())
                .is_some_and(|p| p.pid != first.pid && kernel.cluster.is_running(&p))
        },
        Duration::from_secs(3),
        "service should be restarted under a new pid",
    )
    .await;

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_crashed_disabled_service_stays_down() {
    let kernel = start_kernel().await;
    let (_, client) = kernel.client("admin");
    client
        .scheduler
        .reload_services(Some(vec![ServiceSpec::new(MONITOR).disabled_by_default()]))
        .await
        .unwrap();

    assert_eq!(client.scheduler.start_service(MONITOR).await.unwrap(), ServiceOutcome::Ok);
    let process = service(&client, MONITOR).await.unwrap().process().cloned().unwrap();
    kernel.cluster.crash(&process.hostname, process.pid);

    assert_eventually(
        || async {
            matches!(
                service(&client, MONITOR).await.map(|s| s.status),
                Some(ServiceStatus::Crashed { .. })
            )
        },
        Duration::from_secs(3),
        "crash should be recorded",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let state = service(&client, MONITOR).await.unwrap();
    assert!(matches!(state.status, ServiceStatus::Crashed { .. }));

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_service_operation_result_codes() {
    let kernel = start_kernel().await;
    let (_, client) = kernel.client("admin");
    client
        .scheduler
        .reload_services(Some(vec![ServiceSpec::new(MONITOR)]))
        .await
        .unwrap();
    let scheduler = &client.scheduler;

    assert_eq!(scheduler.start_service(MONITOR).await.unwrap(), ServiceOutcome::AlreadyRunning);
    assert_eq!(scheduler.enable_service(MONITOR).await.unwrap(), ServiceOutcome::AlreadyEnabled);

    let running = service(&client, MONITOR).await.unwrap().process().cloned().unwrap();
    assert_eq!(scheduler.stop_service(MONITOR).await.unwrap(), ServiceOutcome::Ok);
    assert!(!kernel.cluster.is_running(&running));
    assert_eq!(scheduler.stop_service(MONITOR).await.unwrap(), ServiceOutcome::NotRunning);

    assert_eq!(scheduler.start_service(MONITOR).await.unwrap(), ServiceOutcome::Ok);
    assert_eq!(scheduler.disable_service(MONITOR).await.unwrap(), ServiceOutcome::Ok);
    assert!(!service(&client, MONITOR).await.unwrap().is_running());
    assert_eq!(scheduler.disable_service(MONITOR).await.unwrap(), ServiceOutcome::AlreadyDisabled);

    assert_eq!(scheduler.enable_service(MONITOR).await.unwrap(), ServiceOutcome::Ok);
    assert!(service(&client, MONITOR).await.unwrap().is_running());

    assert_eq!(scheduler.start_service("nope").await.unwrap(), ServiceOutcome::NotFound);
    assert_eq!(scheduler.stop_service("nope").await.unwrap(), ServiceOutcome::NotFound);

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_stopped_service_is_not_restarted() {
    let kernel = start_kernel().await;
    let (_, client) = kernel.client("admin");
    client
        .scheduler
        .reload_services(Some(vec![ServiceSpec::new(MONITOR)]))
        .await
        .unwrap();

    assert_eq!(client.scheduler.stop_service(MONITOR).await.unwrap(), ServiceOutcome::Ok);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let state = service(&client, MONITOR).await.unwrap();
    assert!(state.enabled);
    assert!(matches!(state.status, ServiceStatus::Stopped { .. }));

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_reload_removes_and_restarts_changed_services() {
    let kernel = start_kernel().await;
    let (_, client) = kernel.client("admin");
    client
        .scheduler
        .reload_services(Some(vec![ServiceSpec::new(MONITOR), ServiceSpec::new(HACKNET)]))
        .await
        .unwrap();

    let old_monitor = service(&client, MONITOR).await.unwrap().process().cloned().unwrap();
    let old_hacknet = service(&client, HACKNET).await.unwrap().process().cloned().unwrap();

    let moved = ServiceSpec::new(MONITOR).with_affinity(HostAffinity::MustRunOn { host: "n1".into() });
    let report = client
        .scheduler
        .reload_services(Some(vec![moved]))
        .await
        .unwrap();
    assert_eq!(report.restarted, vec![MONITOR.to_string()]);
    assert_eq!(report.removed, vec![HACKNET.to_string()]);
    assert!(report.added.is_empty());

    assert!(!kernel.cluster.is_running(&old_monitor));
    assert!(!kernel.cluster.is_running(&old_hacknet));
    assert!(service(&client, HACKNET).await.is_none());

    let monitor = service(&client, MONITOR).await.unwrap();
    assert_eq!(monitor.process().unwrap().hostname, "n1");

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_reload_keeps_services_that_survive_the_kill() {
    let kernel = start_kernel().await;
    let (_, client) = kernel.client("admin");
    client
        .scheduler
        .reload_services(Some(vec![ServiceSpec::new(MONITOR), ServiceSpec::new(HACKNET)]))
        .await
        .unwrap();

    let old_monitor = service(&client, MONITOR).await.unwrap().process().cloned().unwrap();
    let old_hacknet = service(&client, HACKNET).await.unwrap().process().cloned().unwrap();
    kernel.cluster.set_killable(&old_monitor.hostname, old_monitor.pid, false);
    kernel.cluster.set_killable(&old_hacknet.hostname, old_hacknet.pid, false);

    let moved = ServiceSpec::new(MONITOR).with_affinity(HostAffinity::MustRunOn { host: "n1".into() });
    let report = client
        .scheduler
        .reload_services(Some(vec![moved.clone()]))
        .await
        .unwrap();
    assert!(report.removed.is_empty());
    assert!(report.restarted.is_empty());
    assert_eq!(report.failed.len(), 2);
    assert!(report.failed.contains(&MONITOR.to_string()));
    assert!(report.failed.contains(&HACKNET.to_string()));

    // Both keep their old process and the monitor keeps its old placement rules
    let hacknet = service(&client, HACKNET).await.unwrap();
    assert_eq!(hacknet.process(), Some(&old_hacknet));
    let monitor = service(&client, MONITOR).await.unwrap();
    assert_eq!(monitor.process(), Some(&old_monitor));
    assert!(monitor.spec.host_affinity.is_none());
    assert!(kernel.cluster.is_running(&old_monitor));

    kernel.cluster.set_killable(&old_monitor.hostname, old_monitor.pid, true);
    kernel.cluster.set_killable(&old_hacknet.hostname, old_hacknet.pid, true);
    let report = client
        .scheduler
        .reload_services(Some(vec![moved]))
        .await
        .unwrap();
    assert_eq!(report.restarted, vec![MONITOR.to_string()]);
    assert_eq!(report.removed, vec![HACKNET.to_string()]);
    assert!(report.failed.is_empty());
    assert_eq!(service(&client, MONITOR).await.unwrap().process().unwrap().hostname, "n1");

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_failed_reload_commit_kills_started_services() {
    let kernel = start_kernel().await;
    let (_, client) = kernel.client("admin");
    let scheduler = kernel.kernel.processes().scheduler.clone();
    kernel.cluster.crash(&scheduler.hostname, scheduler.pid);

    let result = client
        .scheduler
        .reload_services(Some(vec![ServiceSpec::new(MONITOR), ServiceSpec::new(HACKNET)]))
        .await;
    assert!(result.is_err());

    assert_eventually(
        || async { kernel.cluster.used_mem("home") == 0.0 && kernel.cluster.used_mem("n1") == 0.0 },
        Duration::from_secs(3),
        "services started before the failed commit should be killed",
    )
    .await;
    let document = client.db.read().await.unwrap();
    assert!(document.scheduler().services.is_empty());

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_service_without_capacity_fails_to_start() {
    let kernel = TestKernel::start(home_cluster(1.0)).await;
    kernel.cluster.set_cost(MONITOR, 2.0);
    let (_, client) = kernel.client("admin");

    let report = client
        .scheduler
        .reload_services(Some(vec![ServiceSpec::new(MONITOR).disabled_by_default()]))
        .await
        .unwrap();
    assert!(report.failed.is_empty());

    assert_eq!(
        client.scheduler.start_service(MONITOR).await.unwrap(),
        ServiceOutcome::FailedToStart
    );

    kernel.shutdown().await;
}

#[tokio::test]
async fn test_reload_reads_catalog_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("services.json");
    std::fs::write(
        &path,
        format!(r#"[{{"name": "{MONITOR}"}}, {{"name": "{HACKNET}", "enabled_by_default": false}}]"#),
    )
    .unwrap();

    let cluster = linked_cluster(16.0, &[("n1", 8.0)]);
    cluster.set_cost(MONITOR, 2.0);
    cluster.set_cost(HACKNET, 1.0);
    let config = test_config().with_services_path(path);
    let kernel = TestKernel::start_with(cluster, config, Arc::new(MemoryStore::new())).await;
    let (_, client) = kernel.client("admin");

    let report = client.scheduler.reload_services(None).await.unwrap();
    assert_eq!(report.added.len(), 2);
    assert!(service(&client, MONITOR).await.unwrap().is_running());
    assert!(!service(&client, HACKNET).await.unwrap().is_running());

    // A second reload of the same file changes nothing
    let again = client.scheduler.reload_services(None).await.unwrap();
    assert!(again.added.is_empty() && again.removed.is_empty() && again.restarted.is_empty());

    kernel.shutdown().await;
}
