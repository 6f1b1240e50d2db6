use serde_json::json;

use helios_agent::leader::{leader_key, leader_session_name, session_record_key, LeaderPhase};
use helios_agent::CyclePhase;
use helios_devkit::{ArchiveFixture, TestHarness, TestNode};

const SERVICE: &str = "svcA";
const NODES: [&str; 3] = ["node-a", "node-b", "node-c"];

fn fixture(version: &str) -> ArchiveFixture {
    ArchiveFixture::new(SERVICE, version, json!({"port": "5432"})).with_tcp_check(5432)
}

async fn converged_cluster(harness: &TestHarness) -> Vec<TestNode> {
    harness.publish(&fixture("1.0")).unwrap();
    harness.publish(&fixture("2.0")).unwrap();
    harness.set_version(SERVICE, "1.0");

    let mut nodes = Vec::new();
    for name in NODES {
        let mut node = harness.primary_node(name, SERVICE);
        node.step().await.unwrap();
        nodes.push(node);
    }
    nodes
}

async fn leaders(nodes: &mut [TestNode]) -> Vec<String> {
    let mut held = Vec::new();
    for node in nodes.iter_mut() {
        let report = node.step().await.unwrap();
        if report.leadership == Some(LeaderPhase::LeaderHeld) {
            held.push(node.name.clone());
        }
    }
    held
}

#[tokio::test]
async fn test_single_leader_among_primaries() {
    let harness = TestHarness::new().unwrap();
    let mut nodes = converged_cluster(&harness).await;

    for _ in 0..3 {
        assert_eq!(leaders(&mut nodes).await, vec!["node-a".to_string()]);
    }
    assert_eq!(harness.backend.holder(&leader_key(SERVICE)).as_deref(), Some("node-a"));
    assert_eq!(harness.backend.value(&leader_key(SERVICE)).as_deref(), Some("node-a"));

    // one session per node, renewed rather than recreated
    assert_eq!(harness.backend.sessions_named(&leader_session_name(SERVICE)).len(), 3);
    for node in &nodes {
        let session = node.agent.leader_session().unwrap();
        assert_eq!(
            harness.backend.value(&session_record_key(&node.name, SERVICE)).as_deref(),
            Some(session.as_str())
        );
    }

    let report = nodes[1].step().await.unwrap();
    assert_eq!(
        report.phases,
        vec![CyclePhase::Detect, CyclePhase::Elect, CyclePhase::Idle]
    );
}

#[tokio::test]
async fn test_leadership_moves_when_session_expires() {
    let harness = TestHarness::new().unwrap();
    let mut nodes = converged_cluster(&harness).await;
    assert_eq!(leaders(&mut nodes).await, vec!["node-a".to_string()]);

    let expired = nodes[0].agent.leader_session().cloned().unwrap();
    assert!(harness.backend.expire_session(&expired));
    assert_eq!(harness.backend.holder(&leader_key(SERVICE)), None);

    let report = nodes[1].step().await.unwrap();
    assert_eq!(report.leadership, Some(LeaderPhase::LeaderHeld));

    // the old leader comes back with a new session and stays a follower
    let report = nodes[0].step().await.unwrap();
    assert_eq!(report.leadership, Some(LeaderPhase::NotLeader));
    assert_ne!(nodes[0].agent.leader_session(), Some(&expired));

    assert_eq!(leaders(&mut nodes).await, vec!["node-b".to_string()]);
}

#[tokio::test]
async fn test_unhealthy_leader_loses_leadership() {
    let harness = TestHarness::new().unwrap();
    let mut nodes = converged_cluster(&harness).await;
    assert_eq!(leaders(&mut nodes).await, vec!["node-a".to_string()]);

    harness.backend.set_unit_healthy("node-a", SERVICE, false);
    assert_eq!(harness.backend.holder(&leader_key(SERVICE)), None);

    // a failing node cannot even get a session
    let report = nodes[0].step().await.unwrap();
    assert_eq!(report.leadership, Some(LeaderPhase::NoSession));
    assert!(nodes[0].agent.leader_session().is_none());

    assert_eq!(leaders(&mut nodes).await, vec!["node-b".to_string()]);
}

#[tokio::test]
async fn test_upgrade_replaces_leader_session() {
    let harness = TestHarness::new().unwrap();
    let mut nodes = converged_cluster(&harness).await;
    assert_eq!(leaders(&mut nodes).await, vec!["node-a".to_string()]);
    let before = nodes[0].agent.leader_session().cloned().unwrap();

    harness.set_version(SERVICE, "2.0");
    let report = nodes[0].step().await.unwrap();
    assert!(report.installed);

    let after = nodes[0].agent.leader_session().cloned().unwrap();
    assert_ne!(before, after);
    assert_eq!(
        harness.backend.value(&session_record_key("node-a", SERVICE)).as_deref(),
        Some(after.as_str())
    );
    // exactly one leader session per node
    assert_eq!(harness.backend.sessions_named(&leader_session_name(SERVICE)).len(), 3);
}

#[tokio::test]
async fn test_restart_keeps_recorded_session() {
    let harness = TestHarness::new().unwrap();
    let mut nodes = converged_cluster(&harness).await;
    assert_eq!(leaders(&mut nodes).await, vec!["node-a".to_string()]);
    let session = nodes[0].agent.leader_session().cloned().unwrap();

    let leader = nodes.remove(0);
    let mut leader = harness.restart(leader);
    let report = leader.step().await.unwrap();

    assert_eq!(report.leadership, Some(LeaderPhase::LeaderHeld));
    assert_eq!(leader.agent.leader_session(), Some(&session));
}

#[tokio::test]
async fn test_non_primary_never_campaigns() {
    let harness = TestHarness::new().unwrap();
    harness.publish(&fixture("1.0")).unwrap();
    harness.set_version(SERVICE, "1.0");

    let mut node = harness.node("node-a", SERVICE);
    for _ in 0..2 {
        let report = node.step().await.unwrap();
        assert!(!report.visited(CyclePhase::Elect));
        assert_eq!(report.leadership, None);
    }
    assert!(harness.backend.sessions_named(&leader_session_name(SERVICE)).is_empty());
}
