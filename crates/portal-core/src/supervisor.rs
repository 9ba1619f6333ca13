//! Session lifecycle supervision.
//!
//! The supervisor owns every session: it applies discovery reconciliation
//! deltas, starts sessions in parallel, reconnects with jittered exponential
//! backoff after transport loss, and tears everything down on shutdown.
//! Reconciliations are serialized; session starts are not.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::discovery::{Discovery, ReconcileDelta, ScanResult, ServerDecl};
use crate::events::{Event, EventKind};
use crate::registry::Registry;
use crate::session::{Session, SessionMap, SessionSignal, SessionState, PING_INTERVAL};
use crate::{PortalError, PortalResult};

/// Backoff cap between reconnect attempts.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Backoff base; attempt n waits up to `2^n * base`.
const BACKOFF_BASE_MS: u64 = 500;

/// Overall grace period for shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of an enable/disable request.
#[derive(Debug, PartialEq, Eq)]
pub enum ToggleOutcome {
    Applied,
    Noop,
}

/// Owns the lifecycle of all sessions.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    aggregator: Aggregator,
    sessions: SessionMap,
    discovery: Discovery,
    home: PathBuf,
    /// Serializes reconciliations; session starts stay parallel.
    reconcile_lock: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new(
        discovery: Discovery,
        registry: Registry,
        aggregator: Aggregator,
        sessions: SessionMap,
    ) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::with_home(discovery, registry, aggregator, sessions, home)
    }

    pub fn with_home(
        discovery: Discovery,
        registry: Registry,
        aggregator: Aggregator,
        sessions: SessionMap,
        home: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                aggregator,
                sessions,
                discovery,
                home,
                reconcile_lock: tokio::sync::Mutex::new(()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn discovery(&self) -> &Discovery {
        &self.inner.discovery
    }

    /// Initial scan: seed the registry and start every enabled declaration.
    ///
    /// Returns the number of discovered declarations.
    pub async fn bootstrap(&self) -> usize {
        let _guard = self.inner.reconcile_lock.lock().await;
        let scan = self.inner.discovery.scan();
        self.emit_scan_events(&scan);

        for decl in &scan.decls {
            self.inner.registry.upsert_decl(decl.clone()).await;
        }

        let enabled: Vec<String> = scan
            .decls
            .iter()
            .filter(|d| d.enabled)
            .map(|d| d.name.clone())
            .collect();
        info!(
            discovered = scan.decls.len(),
            starting = enabled.len(),
            "bootstrap"
        );

        for name in enabled {
            self.spawn_start(name, false);
        }

        scan.decls.len()
    }

    /// Rescan sources and converge live sessions to the new declaration set.
    ///
    /// Returns the scan size and the applied delta.
    pub async fn refresh(&self) -> (usize, ReconcileDelta) {
        let _guard = self.inner.reconcile_lock.lock().await;
        let scan = self.inner.discovery.scan();
        self.emit_scan_events(&scan);

        let previous = self.inner.registry.decls().await;
        let delta = Discovery::reconcile(&previous, &scan.decls);
        let discovered = scan.decls.len();
        self.apply(&delta).await;
        (discovered, delta)
    }

    fn emit_scan_events(&self, scan: &ScanResult) {
        for (name, source) in &scan.dropped {
            self.inner.registry.record_event(Event::new(
                EventKind::ServerEvent,
                serde_json::json!({
                    "event_type": "config_error",
                    "server_name": name,
                    "message": format!(
                        "duplicate declaration from {}, lower precedence dropped",
                        source.as_str()
                    ),
                }),
            ));
        }
        for (path, reason) in &scan.errors {
            self.inner.registry.record_event(Event::new(
                EventKind::ServerEvent,
                serde_json::json!({
                    "event_type": "config_error",
                    "server_name": serde_json::Value::Null,
                    "message": format!("{}: {reason}", path.display()),
                }),
            ));
        }
    }

    /// Apply one reconciliation delta.
    async fn apply(&self, delta: &ReconcileDelta) {
        for name in &delta.removed {
            self.stop_server(name).await;
            self.inner.registry.remove(name).await;
        }

        for (previous, current) in &delta.changed {
            self.inner.registry.upsert_decl(current.clone()).await;
            if previous.same_except_enabled(current) {
                // Only the enabled bit moved; start or stop accordingly.
                if current.enabled {
                    self.spawn_start(current.name.clone(), false);
                } else {
                    self.stop_server(&current.name).await;
                }
            } else {
                self.stop_server(&current.name).await;
                if current.enabled {
                    self.spawn_start(current.name.clone(), false);
                }
            }
        }

        for decl in &delta.added {
            self.inner.registry.upsert_decl(decl.clone()).await;
            if decl.enabled {
                self.spawn_start(decl.name.clone(), false);
            }
        }

        if !delta.is_empty() {
            self.rebuild_catalog().await;
            self.publish_status().await;
        }
    }

    /// Flip the desired enabled bit, persist the override, and converge.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> PortalResult<ToggleOutcome> {
        let decl = self
            .inner
            .registry
            .decl(name)
            .await
            .ok_or_else(|| PortalError::NotFound(format!("server '{name}'")))?;

        let running = self.inner.sessions.read().await.contains_key(name);
        if decl.enabled == enabled && running == enabled {
            self.inner.registry.record_event(Event::new(
                EventKind::ServerEvent,
                serde_json::json!({
                    "event_type": "enable_noop",
                    "server_name": name,
                    "message": format!(
                        "server already {}",
                        if enabled { "enabled" } else { "disabled" }
                    ),
                }),
            ));
            return Ok(ToggleOutcome::Noop);
        }

        self.inner.registry.set_enabled(name, enabled).await;
        self.inner.discovery.persist_enabled(name, enabled)?;

        if enabled {
            self.spawn_start(name.to_string(), false);
        } else {
            self.stop_server(name).await;
        }
        self.publish_status().await;
        Ok(ToggleOutcome::Applied)
    }

    /// Explicit reconnect request; also revives a `failed` session.
    pub async fn reconnect(&self, name: &str) -> PortalResult<()> {
        if self.inner.registry.decl(name).await.is_none() {
            return Err(PortalError::NotFound(format!("server '{name}'")));
        }
        if let Some(session) = self.inner.sessions.write().await.remove(name) {
            session.stop().await;
        }
        self.inner.registry.set_retry_count(name, 0).await;
        self.spawn_start(name.to_string(), true);
        Ok(())
    }

    /// Stop one session and withdraw its catalog entries.
    pub async fn stop_server(&self, name: &str) {
        let session = self.inner.sessions.write().await.remove(name);
        if let Some(session) = session {
            session.stop().await;
        }
        if self
            .inner
            .registry
            .set_status(name, SessionState::Stopped)
            .await
            .is_some()
        {
            self.inner.registry.clear_inventory(name).await;
            self.rebuild_catalog().await;
            self.emit_server_event(name, "disconnected", "server stopped");
        }
    }

    /// Broadcast cancellation and wait for sessions to wind down.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let sessions: Vec<Arc<Session>> =
            self.inner.sessions.write().await.drain().map(|(_, s)| s).collect();
        info!(count = sessions.len(), "shutting down sessions");

        let stops = sessions.iter().map(|s| s.stop());
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(stops))
            .await
            .is_err()
        {
            warn!("graceful shutdown timed out");
        }
    }

    /// Spawn the periodic status/metrics broadcast task.
    pub fn start_status_updates(&self) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut status = tokio::time::interval(Duration::from_secs(15));
            let mut metrics = tokio::time::interval(Duration::from_secs(60));
            status.tick().await;
            metrics.tick().await;
            loop {
                tokio::select! {
                    _ = status.tick() => supervisor.publish_status().await,
                    _ = metrics.tick() => {
                        let metrics = supervisor.inner.registry.metrics().await;
                        supervisor.inner.registry.record_event(Event::new(
                            EventKind::MetricsUpdate,
                            serde_json::to_value(metrics).unwrap_or_default(),
                        ));
                    }
                }
            }
        })
    }

    async fn publish_status(&self) {
        let summary = self.inner.registry.status_summary().await;
        let servers = self.inner.registry.snapshot().await;
        self.inner.registry.record_event(Event::new(
            EventKind::StatusUpdate,
            serde_json::json!({
                "gateway": summary,
                "servers": servers,
            }),
        ));
    }

    async fn rebuild_catalog(&self) {
        let view = self.inner.registry.inventory_view().await;
        self.inner.aggregator.rebuild(&view);
    }

    fn emit_server_event(&self, name: &str, event_type: &str, message: &str) {
        self.inner.registry.record_event(Event::new(
            EventKind::ServerEvent,
            serde_json::json!({
                "event_type": event_type,
                "server_name": name,
                "message": message,
            }),
        ));
    }

    fn spawn_start(&self, name: String, is_reconnect: bool) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.run_start(name, is_reconnect).await;
        });
    }

    /// Attempt loop: connect, handshake, and register one session, backing
    /// off `min(2^n * 500ms, 30s)` with full jitter between failures until
    /// `max_retries` consecutive failures land the server in `failed`.
    async fn run_start(&self, name: String, is_reconnect: bool) {
        let Some(decl) = self.inner.registry.decl(&name).await else {
            return;
        };
        if !decl.enabled {
            debug!(server = %name, "not starting disabled server");
            return;
        }

        self.inner
            .registry
            .set_status(&name, SessionState::Connecting)
            .await;

        let mut attempt: u32 = 0;
        loop {
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            match self.try_start(&decl).await {
                Ok(()) => {
                    info!(server = %name, "session ready");
                    self.emit_server_event(&name, "connected", "session established");
                    if is_reconnect || attempt > 0 {
                        self.inner.registry.record_event(Event::new(
                            EventKind::ServerReconnection,
                            serde_json::json!({
                                "server_name": name,
                                "success": true,
                                "message": "reconnection successful",
                            }),
                        ));
                    }
                    self.publish_status().await;
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(server = %name, attempt, error = %e, "session start failed");
                    self.inner.registry.set_error(&name, e.to_string()).await;
                    self.inner.registry.set_retry_count(&name, attempt).await;

                    if attempt >= decl.max_retries {
                        self.inner
                            .registry
                            .set_status(&name, SessionState::Failed)
                            .await;
                        self.inner.registry.clear_inventory(&name).await;
                        self.rebuild_catalog().await;
                        self.emit_server_event(&name, "failed", "retries exhausted");
                        if is_reconnect {
                            self.inner.registry.record_event(Event::new(
                                EventKind::ServerReconnection,
                                serde_json::json!({
                                    "server_name": name,
                                    "success": false,
                                    "message": "reconnection failed",
                                }),
                            ));
                        }
                        self.publish_status().await;
                        return;
                    }

                    self.inner
                        .registry
                        .set_status(&name, SessionState::Degraded)
                        .await;
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }

    async fn try_start(&self, decl: &ServerDecl) -> PortalResult<()> {
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (session, inventory) = Session::start(decl, &self.inner.home, signal_tx).await?;
        let session = Arc::new(session);

        self.inner
            .sessions
            .write()
            .await
            .insert(decl.name.clone(), session.clone());
        self.inner
            .registry
            .update_inventory(&decl.name, inventory.tools, inventory.resources)
            .await;
        self.inner
            .registry
            .set_status(&decl.name, SessionState::Ready)
            .await;
        self.inner.registry.touch_ping(&decl.name).await;
        self.rebuild_catalog().await;

        self.spawn_monitor(decl.name.clone(), signal_rx);
        self.spawn_ping_loop(decl.name.clone(), Arc::downgrade(&session));
        Ok(())
    }

    /// Per-session signal consumer: inventory refreshes and transport loss.
    fn spawn_monitor(&self, name: String, mut signal_rx: mpsc::Receiver<SessionSignal>) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                match signal {
                    SessionSignal::InventoryChanged => {
                        let session = supervisor.inner.sessions.read().await.get(&name).cloned();
                        let Some(session) = session else { continue };
                        match session.refresh_inventory().await {
                            Ok(inventory) => {
                                supervisor
                                    .inner
                                    .registry
                                    .update_inventory(&name, inventory.tools, inventory.resources)
                                    .await;
                                supervisor.rebuild_catalog().await;
                                supervisor.emit_server_event(
                                    &name,
                                    "tools_updated",
                                    "inventory refreshed",
                                );
                            }
                            Err(e) => {
                                warn!(server = %name, error = %e, "inventory refresh failed");
                            }
                        }
                    }
                    SessionSignal::TransportClosed { reason } => {
                        if supervisor.inner.shutting_down.load(Ordering::SeqCst) {
                            break;
                        }
                        if supervisor.inner.registry.status(&name).await
                            == Some(SessionState::Stopped)
                        {
                            break;
                        }

                        warn!(server = %name, %reason, "transport lost, scheduling reconnect");
                        let stderr = supervisor
                            .inner
                            .sessions
                            .write()
                            .await
                            .remove(&name)
                            .and_then(|s| s.last_stderr());
                        let error = match stderr {
                            Some(tail) => format!("{reason} | stderr: {tail}"),
                            None => reason,
                        };
                        supervisor.inner.registry.set_error(&name, &error).await;
                        supervisor
                            .inner
                            .registry
                            .set_status(&name, SessionState::Degraded)
                            .await;
                        supervisor.emit_server_event(&name, "disconnected", &error);
                        supervisor.publish_status().await;
                        supervisor.spawn_start(name.clone(), true);
                        break;
                    }
                }
            }
        });
    }

    /// Keepalive loop. Exits once the session is dropped from the map.
    fn spawn_ping_loop(&self, name: String, session: std::sync::Weak<Session>) {
        let registry = self.inner.registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = session.upgrade() else { break };
                match session.ping().await {
                    Ok(()) => registry.touch_ping(&name).await,
                    Err(PortalError::SessionClosed) => break,
                    Err(e) => {
                        debug!(server = %name, error = %e, "ping failed");
                    }
                }
            }
        });
    }
}

/// Full-jitter exponential backoff for attempt `n` (1-based).
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let cap_ms = (BACKOFF_BASE_MS.saturating_mul(1u64 << exp)).min(BACKOFF_CAP.as_millis() as u64);
    let jittered = rand::thread_rng().gen_range(0..=cap_ms);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn fixture(home: &TempDir) -> (Supervisor, EventBus) {
        let bus = EventBus::new();
        let registry = Registry::new(bus.clone());
        let aggregator = Aggregator::new();
        let sessions: SessionMap = Arc::new(tokio::sync::RwLock::new(HashMap::new()));
        let discovery =
            Discovery::with_roots(home.path(), home.path().join(".mcp-portal"));
        let supervisor = Supervisor::with_home(
            discovery,
            registry,
            aggregator,
            sessions,
            home.path().to_path_buf(),
        );
        (supervisor, bus)
    }

    fn seed_cursor_config(home: &TempDir, servers: serde_json::Value) {
        let dir = home.path().join(".cursor");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("mcp.json"),
            serde_json::to_string(&serde_json::json!({ "mcpServers": servers })).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_backoff_is_capped_and_jittered() {
        for attempt in 1..=20 {
            let delay = backoff_delay(attempt);
            assert!(delay <= BACKOFF_CAP, "attempt {attempt} exceeded cap");
        }
        // First attempt stays within the base window.
        assert!(backoff_delay(1) <= Duration::from_millis(BACKOFF_BASE_MS));
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_registry() {
        let home = TempDir::new().unwrap();
        seed_cursor_config(
            &home,
            serde_json::json!({
                "alpha": { "command": "definitely-not-a-real-binary-xyz", "enabled": false }
            }),
        );
        let (supervisor, _bus) = fixture(&home);

        let discovered = supervisor.bootstrap().await;
        assert_eq!(discovered, 1);
        let snapshot = supervisor.registry().snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "alpha");
        // Disabled declaration is registered but never started.
        assert!(!snapshot[0].enabled);
        assert_eq!(snapshot[0].status, SessionState::Init);
    }

    #[tokio::test]
    async fn test_failed_spawn_exhausts_retries() {
        let home = TempDir::new().unwrap();
        seed_cursor_config(
            &home,
            serde_json::json!({
                "ghost": {
                    "command": "definitely-not-a-real-binary-xyz",
                    "timeout": 1,
                    "max_retries": 1
                }
            }),
        );
        let (supervisor, bus) = fixture(&home);
        let mut events = bus.subscribe();

        supervisor.bootstrap().await;

        // With max_retries = 1 the first spawn failure is terminal.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "never failed");
            if supervisor.registry().status("ghost").await == Some(SessionState::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // A `failed` server_event was recorded.
        let mut saw_failed = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), events.recv()).await
        {
            if event.kind == EventKind::ServerEvent && event.data["event_type"] == "failed" {
                saw_failed = true;
                break;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_enable_unknown_server_not_found() {
        let home = TempDir::new().unwrap();
        let (supervisor, _bus) = fixture(&home);
        let err = supervisor.set_enabled("nope", true).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_disable_is_persisted_and_noop_detected() {
        let home = TempDir::new().unwrap();
        seed_cursor_config(
            &home,
            serde_json::json!({
                "alpha": { "command": "definitely-not-a-real-binary-xyz", "enabled": false }
            }),
        );
        let (supervisor, bus) = fixture(&home);
        supervisor.bootstrap().await;

        // Disabling an already-disabled server is a no-op with its event.
        let mut events = bus.subscribe();
        let outcome = supervisor.set_enabled("alpha", false).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Noop);
        let event = events.recv().await.unwrap();
        assert_eq!(event.data["event_type"], "enable_noop");

        // Enabling flips the bit and persists the override.
        let outcome = supervisor.set_enabled("alpha", true).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Applied);
        let manual = supervisor.discovery().read_manual();
        assert_eq!(manual["mcpServers"]["alpha"]["enabled"], true);
    }

    #[tokio::test]
    async fn test_refresh_applies_removals() {
        let home = TempDir::new().unwrap();
        seed_cursor_config(
            &home,
            serde_json::json!({
                "alpha": { "command": "definitely-not-a-real-binary-xyz", "enabled": false }
            }),
        );
        let (supervisor, _bus) = fixture(&home);
        supervisor.bootstrap().await;
        assert_eq!(supervisor.registry().snapshot().await.len(), 1);

        seed_cursor_config(&home, serde_json::json!({}));
        let (discovered, delta) = supervisor.refresh().await;
        assert_eq!(discovered, 0);
        assert_eq!(delta.removed, vec!["alpha".to_string()]);
        assert!(supervisor.registry().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_declaration_emits_config_error() {
        let home = TempDir::new().unwrap();
        seed_cursor_config(
            &home,
            serde_json::json!({
                "alpha": { "command": "cursor-cmd", "enabled": false }
            }),
        );
        let windsurf = home.path().join(".windsurf");
        std::fs::create_dir_all(&windsurf).unwrap();
        std::fs::write(
            windsurf.join("mcp_servers.json"),
            serde_json::to_string(&serde_json::json!({
                "mcpServers": { "alpha": { "command": "windsurf-cmd" } }
            }))
            .unwrap(),
        )
        .unwrap();

        let (supervisor, bus) = fixture(&home);
        let mut events = bus.subscribe();
        supervisor.bootstrap().await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ServerEvent);
        assert_eq!(event.data["event_type"], "config_error");
        assert_eq!(event.data["server_name"], "alpha");

        // The cursor variant is the one registered.
        let decl = supervisor.registry().decl("alpha").await.unwrap();
        assert_eq!(decl.command.as_deref(), Some("cursor-cmd"));
    }
}
