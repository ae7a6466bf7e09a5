//! Reaper sweeps against the in-memory cluster

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use kd_core::traits::MetadataStore;
use kd_core::{Container, Exec, PortSpec};
use kd_orchestrator::cluster::ObjectKind;
use kd_orchestrator::reaper::ReapReport;

use common::{context, test_config, FakeCluster};

fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 3600)
}

#[tokio::test]
async fn test_old_container_is_reaped_with_its_workload() {
    let cluster = Arc::new(FakeCluster::new());
    let ctx = context(Arc::clone(&cluster), test_config());

    let container = ctx.orchestrator.create(Container::new("nginx"));
    ctx.orchestrator.start(container.id.as_str()).await.unwrap();
    let token = container.tasks.register();

    let mut stored = ctx.store.get_container(container.id.as_str()).unwrap();
    stored.created = Utc::now() - chrono::Duration::hours(2);
    ctx.store.save_container(&stored);

    let young = ctx.orchestrator.create(Container::new("redis"));

    let report = ctx.reaper.run_once().await;
    assert_eq!(report.containers, 1);
    assert!(token.is_cancelled());
    assert!(cluster.deployment(container.short_id()).is_none());
    assert!(ctx.store.get_container(container.id.as_str()).is_err());
    assert!(ctx.store.get_container(young.id.as_str()).is_ok());
}

#[tokio::test]
async fn test_sweep_skips_objects_being_deleted() {
    let cluster = Arc::new(FakeCluster::new());
    let ctx = context(Arc::clone(&cluster), test_config());

    cluster.add_object(ObjectKind::Deployment, "stale", hours(3), false);
    cluster.add_object(ObjectKind::Service, "going", hours(3), true);
    cluster.add_object(ObjectKind::ConfigMap, "recent", hours(1), false);

    let report = ctx.reaper.run_once().await;
    assert_eq!(report.objects, 1);
    assert!(!cluster.has_object(ObjectKind::Deployment, "stale"));
    assert!(cluster.has_object(ObjectKind::Service, "going"));
    assert!(cluster.has_object(ObjectKind::ConfigMap, "recent"));
}

#[tokio::test]
async fn test_old_exec_records_are_dropped() {
    let cluster = Arc::new(FakeCluster::new());
    let ctx = context(Arc::clone(&cluster), test_config());

    let container = ctx.orchestrator.create(Container::new("alpine"));
    let mut old = Exec::new(container.id.clone(), vec!["ls".into()]);
    old.created = Utc::now() - chrono::Duration::minutes(10);
    ctx.store.save_exec(&old);
    let fresh = Exec::new(container.id.clone(), vec!["pwd".into()]);
    ctx.store.save_exec(&fresh);

    let report = ctx.reaper.run_once().await;
    assert_eq!(
        report,
        ReapReport {
            execs: 1,
            containers: 0,
            objects: 0
        }
    );
    assert!(ctx.store.get_exec(old.id.as_str()).is_err());
    assert!(ctx.store.get_exec(fresh.id.as_str()).is_ok());
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let cluster = Arc::new(FakeCluster::new());
    let ctx = context(Arc::clone(&cluster), test_config());

    assert!(ctx.reaper.start());
    assert!(!ctx.reaper.start());
    assert!(ctx.reaper.is_running());

    assert!(ctx.reaper.stop());
    assert!(!ctx.reaper.stop());
    assert!(!ctx.reaper.is_running());
}

#[tokio::test]
async fn test_background_loop_sweeps() {
    let cluster = Arc::new(FakeCluster::new());
    let ctx = common::context_with_reap_interval(Arc::clone(&cluster), test_config(), Duration::from_millis(20));
    cluster.add_object(ObjectKind::Deployment, "stale", hours(3), false);

    ctx.reaper.start();
    for _ in 0..100 {
        if !cluster.has_object(ObjectKind::Deployment, "stale") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    ctx.reaper.stop();

    assert!(!cluster.has_object(ObjectKind::Deployment, "stale"));
}

#[tokio::test]
async fn test_reaped_container_releases_its_ports() {
    let cluster = Arc::new(FakeCluster::new());
    let ctx = context(Arc::clone(&cluster), test_config());

    let mut container = Container::new("nginx");
    container.exposed_ports.insert(PortSpec::tcp(80));
    let container = ctx.orchestrator.create(container);
    ctx.orchestrator.start(container.id.as_str()).await.unwrap();
    assert_eq!(ctx.orchestrator.ports().len(), 1);

    let mut stored = ctx.store.get_container(container.id.as_str()).unwrap();
    stored.created = Utc::now() - chrono::Duration::hours(2);
    ctx.store.save_container(&stored);

    let report = ctx.reaper.run_once().await;
    assert_eq!(report.containers, 1);
    assert!(ctx.orchestrator.ports().is_empty());
}
