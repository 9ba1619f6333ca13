//! Cross-component flows through the public API.

use std::fs;
use std::path::Path;

use portal_core::aggregator::Aggregator;
use portal_core::discovery::{Discovery, ServerSource};
use portal_core::events::{EventBus, EventKind};
use portal_core::protocol::ToolDef;
use portal_core::registry::Registry;
use portal_core::session::SessionState;
use serde_json::json;
use tempfile::TempDir;

fn write_config(root: &Path, rel: &str, doc: &serde_json::Value) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_string_pretty(doc).unwrap()).unwrap();
}

fn tool(name: &str) -> ToolDef {
    ToolDef {
        name: name.into(),
        description: Some("a tool".into()),
        input_schema: json!({"type": "object"}),
    }
}

#[test]
fn discovery_precedence_end_to_end() {
    let home = TempDir::new().unwrap();
    let discovery = Discovery::with_roots(home.path(), home.path().join(".mcp-portal"));

    write_config(
        home.path(),
        ".continue/config.json",
        &json!({"mcp": {"servers": {"shared": {"command": "continue-cmd"}}}}),
    );
    write_config(
        home.path(),
        ".windsurf/mcp_servers.json",
        &json!({"mcpServers": {"shared": {"command": "windsurf-cmd"}}}),
    );
    write_config(
        home.path(),
        ".cursor/mcp.json",
        &json!({"mcpServers": {"shared": {"command": "cursor-cmd"}, "extra": {"command": "x"}}}),
    );

    let result = discovery.scan();
    assert_eq!(result.decls.len(), 2);
    let shared = result.decls.iter().find(|d| d.name == "shared").unwrap();
    assert_eq!(shared.source, ServerSource::Cursor);
    assert_eq!(shared.command.as_deref(), Some("cursor-cmd"));
    // Both lower-precedence duplicates were reported.
    assert_eq!(result.dropped.len(), 2);
}

#[tokio::test]
async fn catalog_follows_session_state() {
    let bus = EventBus::new();
    let registry = Registry::new(bus.clone());
    let aggregator = Aggregator::new();

    let home = TempDir::new().unwrap();
    let discovery = Discovery::with_roots(home.path(), home.path().join(".mcp-portal"));
    discovery
        .write_manual(&json!({
            "mcpServers": {
                "alpha": {"command": "alpha-cmd"},
                "beta": {"command": "beta-cmd"}
            }
        }))
        .unwrap();

    for decl in discovery.scan().decls {
        registry.upsert_decl(decl).await;
    }

    registry.set_status("alpha", SessionState::Ready).await;
    registry.set_status("beta", SessionState::Ready).await;
    registry
        .update_inventory("alpha", vec![tool("echo")], vec![])
        .await;
    registry
        .update_inventory("beta", vec![tool("echo")], vec![])
        .await;
    aggregator.rebuild(&registry.inventory_view().await);

    let names: Vec<String> = aggregator
        .list_tools()
        .into_iter()
        .map(|t| t.prefixed_name)
        .collect();
    assert_eq!(names, vec!["alpha.echo", "beta.echo"]);

    // A server that fails disappears from the catalog, the other stays.
    registry.set_status("beta", SessionState::Failed).await;
    aggregator.rebuild(&registry.inventory_view().await);
    assert_eq!(aggregator.resolve_tool("beta.echo"), None);
    assert!(aggregator.resolve_tool("alpha.echo").is_some());

    // Every surviving catalog entry points at a live session.
    for descriptor in aggregator.list_tools() {
        let status = registry.status(&descriptor.server_name).await.unwrap();
        assert!(status.exposes_inventory());
    }
}

#[tokio::test]
async fn registry_events_reach_subscribers() {
    let bus = EventBus::new();
    let registry = Registry::new(bus.clone());
    let mut subscription = bus.subscribe();

    registry.record_event(portal_core::events::Event::new(
        EventKind::ServerEvent,
        json!({"event_type": "connected", "server_name": "alpha"}),
    ));

    let event = subscription.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::ServerEvent);
    assert_eq!(event.data["server_name"], "alpha");
}

#[test]
fn manual_overlay_alone_declares_nothing() {
    let home = TempDir::new().unwrap();
    let discovery = Discovery::with_roots(home.path(), home.path().join(".mcp-portal"));

    write_config(
        home.path(),
        ".cursor/mcp.json",
        &json!({"mcpServers": {"alpha": {"command": "cursor-cmd"}}}),
    );
    discovery.persist_enabled("alpha", false).unwrap();

    let scan = discovery.scan();
    assert_eq!(scan.decls.len(), 1);
    assert!(!scan.decls[0].enabled);

    // The cursor file disappears; the overlay alone declares nothing.
    fs::remove_file(home.path().join(".cursor/mcp.json")).unwrap();
    let scan = discovery.scan();
    assert!(scan.decls.is_empty());
}
