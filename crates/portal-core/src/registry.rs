//! Authoritative in-memory server state.
//!
//! The registry is the only shared mutable structure in the portal. A
//! single `RwLock` with short critical sections guards it: reads observe a
//! consistent snapshot and partial updates are never visible.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::discovery::{ServerDecl, ServerSource, TransportHint};
use crate::events::{Event, EventBus};
use crate::protocol::{ResourceDef, ToolDef};
use crate::session::SessionState;

/// Everything the registry tracks for one declared server.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub decl: ServerDecl,
    pub status: SessionState,
    pub last_error: Option<String>,
    pub last_ping: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub tools: Vec<ToolDef>,
    pub resources: Vec<ResourceDef>,
    pub stats: CallStats,
}

impl ServerEntry {
    fn new(decl: ServerDecl) -> Self {
        Self {
            decl,
            status: SessionState::Init,
            last_error: None,
            last_ping: None,
            retry_count: 0,
            tools: Vec::new(),
            resources: Vec::new(),
            stats: CallStats::default(),
        }
    }
}

/// Per-server call counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_duration_ms: f64,
}

impl CallStats {
    fn record(&mut self, success: bool, duration_ms: u64) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        let n = self.total_requests as f64;
        self.average_duration_ms =
            (self.average_duration_ms * (n - 1.0) + duration_ms as f64) / n;
    }
}

/// Externally visible view of one server. Env *values* are never exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub source: ServerSource,
    pub transport: TransportHint,
    pub status: SessionState,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub tools_count: usize,
    pub resources_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub stats: CallStats,
}

impl ServerStatus {
    fn from_entry(entry: &ServerEntry) -> Self {
        let mut env_keys: Vec<String> = entry.decl.env.keys().cloned().collect();
        env_keys.sort();
        Self {
            name: entry.decl.name.clone(),
            source: entry.decl.source,
            transport: entry.decl.transport,
            status: entry.status,
            enabled: entry.decl.enabled,
            command: entry.decl.command.clone(),
            args: entry.decl.args.clone(),
            env_keys,
            url: entry.decl.url.clone(),
            tools_count: entry.tools.len(),
            resources_count: entry.resources.len(),
            last_error: entry.last_error.clone(),
            last_ping: entry.last_ping,
            retry_count: entry.retry_count,
            max_retries: entry.decl.max_retries,
            stats: entry.stats.clone(),
        }
    }
}

/// Gateway-wide status summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub total_servers: usize,
    pub active_servers: usize,
    pub failed_servers: usize,
    pub total_tools: usize,
    pub total_resources: usize,
    pub uptime_seconds: u64,
}

/// Gateway-wide call metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_duration_ms: f64,
    pub per_server: HashMap<String, CallStats>,
}

/// Inventory slice handed to the aggregator on rebuild.
#[derive(Debug, Clone)]
pub struct InventoryView {
    pub server_name: String,
    pub status: SessionState,
    pub tools: Vec<ToolDef>,
    pub resources: Vec<ResourceDef>,
}

struct State {
    servers: HashMap<String, ServerEntry>,
    started_at: Instant,
}

/// Shared registry handle.
#[derive(Clone)]
pub struct Registry {
    state: Arc<RwLock<State>>,
    bus: EventBus,
}

impl Registry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                servers: HashMap::new(),
                started_at: Instant::now(),
            })),
            bus,
        }
    }

    /// Insert or replace a declaration, preserving runtime state when the
    /// declaration is unchanged.
    pub async fn upsert_decl(&self, decl: ServerDecl) {
        let mut state = self.state.write().await;
        match state.servers.get_mut(&decl.name) {
            Some(entry) => entry.decl = decl,
            None => {
                state
                    .servers
                    .insert(decl.name.clone(), ServerEntry::new(decl));
            }
        }
    }

    pub async fn remove(&self, name: &str) -> Option<ServerEntry> {
        self.state.write().await.servers.remove(name)
    }

    pub async fn decl(&self, name: &str) -> Option<ServerDecl> {
        self.state
            .read()
            .await
            .servers
            .get(name)
            .map(|e| e.decl.clone())
    }

    pub async fn decls(&self) -> Vec<ServerDecl> {
        let mut decls: Vec<ServerDecl> = self
            .state
            .read()
            .await
            .servers
            .values()
            .map(|e| e.decl.clone())
            .collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    pub async fn status(&self, name: &str) -> Option<SessionState> {
        self.state.read().await.servers.get(name).map(|e| e.status)
    }

    /// Transition a server's state; returns the previous state.
    pub async fn set_status(&self, name: &str, status: SessionState) -> Option<SessionState> {
        let mut state = self.state.write().await;
        let entry = state.servers.get_mut(name)?;
        let previous = entry.status;
        entry.status = status;
        if status == SessionState::Ready {
            entry.retry_count = 0;
            entry.last_error = None;
        }
        Some(previous)
    }

    pub async fn set_error(&self, name: &str, error: impl Into<String>) {
        if let Some(entry) = self.state.write().await.servers.get_mut(name) {
            entry.last_error = Some(error.into());
        }
    }

    pub async fn set_retry_count(&self, name: &str, retries: u32) {
        if let Some(entry) = self.state.write().await.servers.get_mut(name) {
            entry.retry_count = retries;
        }
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Option<bool> {
        let mut state = self.state.write().await;
        let entry = state.servers.get_mut(name)?;
        let previous = entry.decl.enabled;
        entry.decl.enabled = enabled;
        Some(previous)
    }

    pub async fn touch_ping(&self, name: &str) {
        if let Some(entry) = self.state.write().await.servers.get_mut(name) {
            entry.last_ping = Some(Utc::now());
        }
    }

    /// Atomic swap of one server's inventory slice.
    pub async fn update_inventory(
        &self,
        name: &str,
        tools: Vec<ToolDef>,
        resources: Vec<ResourceDef>,
    ) {
        if let Some(entry) = self.state.write().await.servers.get_mut(name) {
            entry.tools = tools;
            entry.resources = resources;
        }
    }

    pub async fn clear_inventory(&self, name: &str) {
        if let Some(entry) = self.state.write().await.servers.get_mut(name) {
            entry.tools.clear();
            entry.resources.clear();
        }
    }

    pub async fn record_call(&self, name: &str, success: bool, duration_ms: u64) {
        if let Some(entry) = self.state.write().await.servers.get_mut(name) {
            entry.stats.record(success, duration_ms);
        }
    }

    /// Append an event to the bus.
    pub fn record_event(&self, event: Event) {
        self.bus.publish(event);
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Consistent snapshot of every server, sorted by name.
    pub async fn snapshot(&self) -> Vec<ServerStatus> {
        let state = self.state.read().await;
        let mut servers: Vec<ServerStatus> =
            state.servers.values().map(ServerStatus::from_entry).collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    /// Inventory slices for the aggregator.
    pub async fn inventory_view(&self) -> Vec<InventoryView> {
        let state = self.state.read().await;
        let mut view: Vec<InventoryView> = state
            .servers
            .values()
            .map(|e| InventoryView {
                server_name: e.decl.name.clone(),
                status: e.status,
                tools: e.tools.clone(),
                resources: e.resources.clone(),
            })
            .collect();
        view.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        view
    }

    pub async fn status_summary(&self) -> GatewayStatus {
        let state = self.state.read().await;
        let servers = &state.servers;
        GatewayStatus {
            total_servers: servers.len(),
            active_servers: servers
                .values()
                .filter(|e| e.status == SessionState::Ready)
                .count(),
            failed_servers: servers
                .values()
                .filter(|e| e.status == SessionState::Failed)
                .count(),
            total_tools: servers
                .values()
                .filter(|e| e.status.exposes_inventory())
                .map(|e| e.tools.len())
                .sum(),
            total_resources: servers
                .values()
                .filter(|e| e.status.exposes_inventory())
                .map(|e| e.resources.len())
                .sum(),
            uptime_seconds: state.started_at.elapsed().as_secs(),
        }
    }

    pub async fn metrics(&self) -> GatewayMetrics {
        let state = self.state.read().await;
        let mut metrics = GatewayMetrics {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_duration_ms: 0.0,
            per_server: HashMap::new(),
        };
        let mut weighted = 0.0;
        for entry in state.servers.values() {
            metrics.total_requests += entry.stats.total_requests;
            metrics.successful_requests += entry.stats.successful_requests;
            metrics.failed_requests += entry.stats.failed_requests;
            weighted += entry.stats.average_duration_ms * entry.stats.total_requests as f64;
            metrics
                .per_server
                .insert(entry.decl.name.clone(), entry.stats.clone());
        }
        if metrics.total_requests > 0 {
            metrics.average_duration_ms = weighted / metrics.total_requests as f64;
        }
        metrics
    }

    pub async fn uptime_seconds(&self) -> u64 {
        self.state.read().await.started_at.elapsed().as_secs()
    }
}
