//! End-to-end tests: control plane -> sync engine -> lists -> backends.
//!
//! External tools are replaced by a recording executor, so these run
//! without root.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use edgeacl::cmd_abstraction::{CommandEnv, CommandExecutor, CommandOutput};
use edgeacl::control_plane::{ControlPlane, ItemDelta};
use edgeacl::enforcer::{ActionContext, ActionDescriptor, ActionManager, ActionRegistry};
use edgeacl::iplist::{ListManager, ListType, Verdict};
use edgeacl::store::ItemStore;
use edgeacl::sync::ListSyncEngine;

#[derive(Default)]
struct RecordingExecutor {
    lines: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        self.lines.lock().push(format!("{} {}", cmd, args.join(" ")));
        Ok(CommandOutput::ok(""))
    }

    async fn execute_with_env(
        &self,
        cmd: &str,
        args: &[String],
        _env: &CommandEnv,
    ) -> Result<CommandOutput> {
        self.execute(cmd, args).await
    }
}

/// Control plane serving pages keyed by the requested cursor.
#[derive(Default)]
struct FakeControlPlane {
    pages: Mutex<Vec<(i64, Vec<ItemDelta>)>>,
    actions: Mutex<Vec<ActionDescriptor>>,
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn fetch_items(&self, version: i64, _size: u32) -> Result<Vec<ItemDelta>> {
        Ok(self
            .pages
            .lock()
            .iter()
            .find(|(cursor, _)| *cursor == version)
            .map(|(_, page)| page.clone())
            .unwrap_or_default())
    }

    async fn fetch_actions(&self) -> Result<Vec<ActionDescriptor>> {
        Ok(self.actions.lock().clone())
    }
}

fn delta(id: u64, version: i64, from: &str, to: &str, list_type: ListType) -> ItemDelta {
    ItemDelta {
        id,
        ip_from: from.to_string(),
        ip_to: to.to_string(),
        item_type: if from.contains(':') { "ipv6" } else { "ipv4" }.to_string(),
        expired_at: 0,
        event_level: "critical".to_string(),
        version,
        is_deleted: false,
        list_id: 0,
        list_type: Some(list_type),
        is_global: true,
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

struct Node {
    executor: Arc<RecordingExecutor>,
    control_plane: Arc<FakeControlPlane>,
    actions: Arc<ActionManager>,
    engine: ListSyncEngine,
}

fn node(state_file: &std::path::Path) -> Node {
    let executor = Arc::new(RecordingExecutor::default());
    let control_plane = Arc::new(FakeControlPlane::default());
    *control_plane.actions.lock() = vec![
        ActionDescriptor::new(
            1,
            "ipset",
            "critical",
            json!({"white_name": "edge_white", "black_name": "edge_black"}),
        ),
        ActionDescriptor::new(2, "html", "critical", json!({"status_code": 451})),
    ];
    let actions = Arc::new(ActionManager::new(ActionRegistry::new(ActionContext::new(
        executor.clone(),
    ))));
    let engine = ListSyncEngine::new(
        control_plane.clone(),
        Arc::new(ListManager::new()),
        actions.clone(),
        ItemStore::open(state_file).unwrap(),
        100,
        Duration::from_secs(60),
    );
    Node {
        executor,
        control_plane,
        actions,
        engine,
    }
}

#[tokio::test]
async fn test_sync_drives_lists_and_backends() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(&dir.path().join("items.json"));
    node.control_plane.pages.lock().push((
        0,
        vec![
            delta(1, 1, "10.0.0.0", "10.0.1.255", ListType::Black),
            delta(2, 2, "10.0.0.77", "", ListType::White),
            delta(3, 3, "2001:db8::1", "", ListType::Black),
        ],
    ));

    let report = node.engine.sync_once().await.unwrap().unwrap();
    assert_eq!(report.added, 3);
    assert_eq!(report.version, 3);
    assert_eq!(node.actions.len().await, 2);

    let lines = node.executor.take();
    assert!(lines.contains(&"ipset add edge_black 10.0.0.0/23 -exist".to_string()));
    assert!(lines.contains(&"ipset add edge_white 10.0.0.77/32 -exist".to_string()));
    // No IPv6 set configured
    assert!(!lines.iter().any(|l| l.contains("2001:db8::1")));

    let lists = node.engine.lists();
    assert_eq!(lists.check(ip("10.0.1.200"), &[]), Verdict::Denied);
    assert_eq!(lists.check(ip("10.0.0.77"), &[]), Verdict::Allowed);
    assert_eq!(lists.check(ip("2001:db8::1"), &[]), Verdict::Denied);

    let page = node.actions.block_page("critical").await.unwrap();
    assert_eq!(page.status_code, 451);
}

#[tokio::test]
async fn test_delete_is_inverse_of_add() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(&dir.path().join("items.json"));
    node.control_plane.pages.lock().push((
        0,
        vec![delta(1, 1, "192.168.1.1", "192.168.1.6", ListType::Black)],
    ));
    node.engine.sync_once().await.unwrap();
    let added: Vec<String> = node
        .executor
        .take()
        .into_iter()
        .filter(|l| l.starts_with("ipset add"))
        .collect();
    assert_eq!(added.len(), 4);

    let mut removal = delta(1, 2, "", "", ListType::Black);
    removal.is_deleted = true;
    node.control_plane.pages.lock().push((1, vec![removal]));
    node.engine.sync_once().await.unwrap();
    let deleted: Vec<String> = node.executor.take();

    let expected: Vec<String> = added
        .iter()
        .map(|l| l.replacen("ipset add", "ipset del", 1))
        .collect();
    assert_eq!(deleted, expected);
    assert_eq!(
        node.engine.lists().check(ip("192.168.1.3"), &[]),
        Verdict::Unlisted
    );
}

#[tokio::test]
async fn test_restart_resumes_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("items.json");
    {
        let node = node(&state_file);
        node.control_plane.pages.lock().push((
            0,
            vec![delta(1, 5, "198.51.100.0", "198.51.100.255", ListType::Black)],
        ));
        node.engine.sync_once().await.unwrap();
    }

    let node = node(&state_file);
    assert_eq!(node.engine.load().await, 1);
    assert_eq!(node.engine.version().await, 5);
    assert_eq!(
        node.engine.lists().check(ip("198.51.100.42"), &[]),
        Verdict::Denied
    );

    // Only deltas past the stored cursor are requested.
    node.control_plane.pages.lock().push((
        5,
        vec![delta(2, 6, "198.51.100.42", "", ListType::White)],
    ));
    let report = node.engine.sync_once().await.unwrap().unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(
        node.engine.lists().check(ip("198.51.100.42"), &[]),
        Verdict::Allowed
    );
}

#[tokio::test]
async fn test_backend_change_rebuilds_instance() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(&dir.path().join("items.json"));
    node.engine.sync_once().await.unwrap();
    node.executor.take();

    *node.control_plane.actions.lock() = vec![ActionDescriptor::new(
        1,
        "ipset",
        "critical",
        json!({"black_name": "edge_black_v2"}),
    )];
    let report = node.engine.sync_once().await.unwrap().unwrap();
    assert_eq!(report.actions.created, 1);
    assert_eq!(report.actions.closed, 2);
    assert!(node.actions.block_page("critical").await.is_none());
    assert!(node
        .executor
        .take()
        .iter()
        .any(|l| l.starts_with("ipset create edge_black_v2 hash:net")));
}
