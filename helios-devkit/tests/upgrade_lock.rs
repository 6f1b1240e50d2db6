use serde_json::json;

use helios_agent::execution::RoutingStatus;
use helios_agent::upgrade::{upgrade_lock_key, upgrade_session_name};
use helios_agent::{AgentError, CyclePhase};
use helios_devkit::{ArchiveFixture, BackendEvent, HostEvent, TestHarness, TestNode};

const SERVICE: &str = "svcA";

fn fixture(version: &str) -> ArchiveFixture {
    ArchiveFixture::new(SERVICE, version, json!({"port": "5432"}))
        .with_template("etc/app.conf.mustache", "port={{port}}\n")
        .with_tcp_check(5432)
}

fn harness(versions: &[&str], desired: &str) -> TestHarness {
    let harness = TestHarness::new().unwrap();
    for version in versions {
        harness.publish(&fixture(version)).unwrap();
    }
    harness.set_version(SERVICE, desired);
    harness
}

fn slow_to_heal(harness: &TestHarness, name: &str) -> TestNode {
    harness.node_with(name, SERVICE, |config| config.timing.health_timeout_secs = Some(1))
}

/// Every acquire of the lock is followed by a release by the same node
/// before anyone else acquires it.
fn assert_serialized(events: &[BackendEvent], key: &str) {
    let mut holder: Option<&str> = None;
    for event in events {
        match event {
            BackendEvent::Acquired { key: k, node } if k == key => {
                assert_eq!(holder, None, "{} acquired while held by {:?}", node, holder);
                holder = Some(node.as_str());
            }
            BackendEvent::Released { key: k, node } if k == key => {
                assert_eq!(holder, Some(node.as_str()));
                holder = None;
            }
            _ => {}
        }
    }
    assert_eq!(holder, None);
}

#[tokio::test]
async fn test_concurrent_upgrades_are_serialized() {
    let harness = harness(&["1.0", "2.0"], "1.0");
    let mut nodes: Vec<TestNode> = ["node-a", "node-b", "node-c"]
        .iter()
        .map(|name| harness.node(name, SERVICE))
        .collect();

    let (a, rest) = nodes.split_at_mut(1);
    let (b, c) = rest.split_at_mut(1);
    let (ra, rb, rc) = tokio::join!(a[0].step(), b[0].step(), c[0].step());
    for report in [ra, rb, rc] {
        assert!(report.unwrap().released_lock);
    }

    harness.set_version(SERVICE, "2.0");
    let (ra, rb, rc) = tokio::join!(a[0].step(), b[0].step(), c[0].step());
    for report in [ra, rb, rc] {
        assert!(report.unwrap().installed);
    }

    let key = upgrade_lock_key(SERVICE);
    assert_serialized(&harness.backend.events(), &key);
    assert_eq!(
        harness
            .backend
            .count_events(|e| matches!(e, BackendEvent::Acquired { key: k, .. } if *k == key)),
        6
    );

    // every extraction happened while that node held the lock
    for node in &nodes {
        for event in node.host.events() {
            if let HostEvent::Extracted { lock_holder, .. } = event {
                assert_eq!(lock_holder.as_deref(), Some(node.name.as_str()));
            }
        }
        assert_eq!(node.current_version().await.as_deref(), Some("2.0"));
    }
}

#[tokio::test]
async fn test_unhealthy_upgrade_keeps_lock_until_healthy() {
    let harness = harness(&["1.0", "2.0"], "1.0");
    let mut node = slow_to_heal(&harness, "node-a");
    node.step().await.unwrap();

    harness.backend.set_unit_healthy("node-a", SERVICE, false);
    harness.set_version(SERVICE, "2.0");

    let result = node.step().await;
    assert!(matches!(result, Err(AgentError::HealthTimeout { .. })));
    assert!(node.agent.pending_lease().is_some());
    assert_eq!(harness.backend.holder(&upgrade_lock_key(SERVICE)).as_deref(), Some("node-a"));
    assert!(harness.backend.in_maintenance("node-a"));

    // another node cannot start its upgrade meanwhile
    let mut other = harness.node("node-b", SERVICE);
    let blocked = tokio::time::timeout(std::time::Duration::from_millis(200), other.step()).await;
    assert!(blocked.is_err());

    harness.backend.set_unit_healthy("node-a", SERVICE, true);
    let report = node.step().await.unwrap();
    assert_eq!(
        report.phases,
        vec![
            CyclePhase::Detect,
            CyclePhase::Configure,
            CyclePhase::Publish,
            CyclePhase::AwaitHealth,
            CyclePhase::Release,
            CyclePhase::Idle
        ]
    );
    assert!(node.agent.pending_lease().is_none());
    assert!(!harness.backend.in_maintenance("node-a"));
    assert_eq!(node.host.routing_changes().last(), Some(&RoutingStatus::Up));

    let report = other.step().await.unwrap();
    assert!(report.installed);
    assert_serialized(&harness.backend.events(), &upgrade_lock_key(SERVICE));
}

#[tokio::test]
async fn test_restarted_agent_adopts_its_upgrade_session() {
    let harness = harness(&["1.0", "2.0"], "1.0");
    let mut node = slow_to_heal(&harness, "node-a");
    node.step().await.unwrap();

    harness.backend.set_unit_healthy("node-a", SERVICE, false);
    harness.set_version(SERVICE, "2.0");
    assert!(node.step().await.is_err());
    let stale = node.agent.pending_lease().cloned().unwrap();

    // agent process dies and comes back
    let mut node = harness.restart(node);
    assert!(node.agent.pending_lease().is_none());

    harness.backend.set_unit_healthy("node-a", SERVICE, true);
    let report = node.step().await.unwrap();

    assert!(report.released_lock);
    assert!(!report.installed);
    assert!(harness.backend.sessions_named(&upgrade_session_name(SERVICE)).is_empty());
    assert_eq!(harness.backend.holder(&upgrade_lock_key(SERVICE)), None);
    assert!(!harness.backend.in_maintenance("node-a"));
    assert!(harness.backend.count_events(
        |e| matches!(e, BackendEvent::SessionDestroyed { id, .. } if *id == stale.session)
    ) == 1);
}

#[tokio::test]
async fn test_reverted_version_after_failed_install_frees_the_lock() {
    let harness = harness(&["1.0"], "1.0");
    let mut node = harness.node("node-a", SERVICE);
    node.step().await.unwrap();

    // 3.0 was never built: the node is drained and stopped when the fetch fails
    harness.set_version(SERVICE, "3.0");
    let result = node.step().await;
    assert!(matches!(result, Err(AgentError::Artifact { .. })));
    assert!(node.agent.pending_lease().is_some());
    assert_eq!(harness.backend.holder(&upgrade_lock_key(SERVICE)).as_deref(), Some("node-a"));
    assert!(harness.backend.in_maintenance("node-a"));

    harness.set_version(SERVICE, "1.0");
    let report = node.step().await.unwrap();

    assert!(!report.installed);
    assert!(report.released_lock);
    assert!(node.agent.pending_lease().is_none());
    assert_eq!(harness.backend.holder(&upgrade_lock_key(SERVICE)), None);
    assert!(harness.backend.sessions_named(&upgrade_session_name(SERVICE)).is_empty());
    assert!(!harness.backend.in_maintenance("node-a"));
    assert_eq!(node.host.routing_changes().last(), Some(&RoutingStatus::Up));
    assert_eq!(node.current_version().await.as_deref(), Some("1.0"));

    let report = node.step().await.unwrap();
    assert_eq!(report.phases, vec![CyclePhase::Detect, CyclePhase::Idle]);
}

#[tokio::test]
async fn test_retry_reuses_the_held_lease() {
    let harness = harness(&["1.0"], "3.0");
    let mut node = harness.node("node-a", SERVICE);
    assert!(node.step().await.is_err());
    let held = node.agent.pending_lease().cloned().unwrap();

    harness.publish(&fixture("3.0")).unwrap();
    let report = node.step().await.unwrap();
    assert!(report.installed && report.released_lock);

    // the lock never went back to the pool between the attempts
    let key = upgrade_lock_key(SERVICE);
    assert_eq!(
        harness
            .backend
            .count_events(|e| matches!(e, BackendEvent::Released { key: k, .. } if *k == key)),
        1
    );
    assert!(harness.backend.count_events(
        |e| matches!(e, BackendEvent::SessionDestroyed { id, .. } if *id == held.session)
    ) == 1);
}

#[tokio::test]
async fn test_restarted_agent_with_local_hostname_adopts_its_session() {
    let harness = harness(&["1.0", "2.0"], "1.0");
    let mut node = harness.node_known_as("node-a", "host-a", SERVICE, |config| {
        config.timing.health_timeout_secs = Some(1)
    });
    node.step().await.unwrap();
    assert_eq!(node.agent.identity().node_name, "node-a");

    harness.backend.set_unit_healthy("node-a", SERVICE, false);
    harness.set_version(SERVICE, "2.0");
    assert!(node.step().await.is_err());

    let mut node = harness.restart(node);
    harness.backend.set_unit_healthy("node-a", SERVICE, true);
    let report = node.step().await.unwrap();

    assert!(report.released_lock);
    assert_eq!(harness.backend.holder(&upgrade_lock_key(SERVICE)), None);
    assert!(harness.backend.sessions_named(&upgrade_session_name(SERVICE)).is_empty());
    assert!(!harness.backend.in_maintenance("node-a"));
}

#[tokio::test]
async fn test_failed_node_frees_the_lock() {
    let harness = harness(&["1.0", "2.0"], "1.0");
    let mut a = slow_to_heal(&harness, "node-a");
    let mut b = harness.node("node-b", SERVICE);
    a.step().await.unwrap();
    b.step().await.unwrap();

    harness.backend.set_unit_healthy("node-a", SERVICE, false);
    harness.set_version(SERVICE, "2.0");
    assert!(a.step().await.is_err());

    // node-a is gone for good: its sessions expire with it
    harness.backend.fail_node("node-a");
    assert_eq!(harness.backend.holder(&upgrade_lock_key(SERVICE)), None);

    let report = b.step().await.unwrap();
    assert!(report.installed);
    assert_eq!(b.current_version().await.as_deref(), Some("2.0"));
}
