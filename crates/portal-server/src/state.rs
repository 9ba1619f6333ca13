//! Application state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use portal_core::aggregator::Aggregator;
use portal_core::config::PortalConfig;
use portal_core::discovery::Discovery;
use portal_core::dispatcher::Dispatcher;
use portal_core::events::EventBus;
use portal_core::registry::Registry;
use portal_core::session::SessionMap;
use portal_core::supervisor::Supervisor;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PortalConfig>,
    pub bus: EventBus,
    pub registry: Registry,
    pub aggregator: Aggregator,
    pub dispatcher: Dispatcher,
    pub supervisor: Supervisor,
}

impl AppState {
    pub fn new(config: PortalConfig) -> Self {
        let discovery = Discovery::new(&config);
        let home = dirs_home();
        Self::build(config, discovery, home)
    }

    /// Build state rooted at an explicit home directory (tests, relocated
    /// deployments).
    pub fn with_home(config: PortalConfig, home: PathBuf) -> Self {
        let discovery = Discovery::with_roots(home.clone(), config.config_dir.clone());
        Self::build(config, discovery, home)
    }

    fn build(config: PortalConfig, discovery: Discovery, home: PathBuf) -> Self {
        let bus = EventBus::new();
        let registry = Registry::new(bus.clone());
        let aggregator = Aggregator::new();
        let sessions: SessionMap = Arc::new(tokio::sync::RwLock::new(HashMap::new()));

        let dispatcher =
            Dispatcher::new(aggregator.clone(), sessions.clone(), registry.clone());
        let supervisor = Supervisor::with_home(
            discovery,
            registry.clone(),
            aggregator.clone(),
            sessions,
            home,
        );

        Self {
            config: Arc::new(config),
            bus,
            registry,
            aggregator,
            dispatcher,
            supervisor,
        }
    }

    /// Discover declarations and start enabled sessions.
    pub async fn bootstrap(&self) -> usize {
        self.supervisor.bootstrap().await
    }

    /// Launch the heartbeat and periodic status broadcasters.
    pub fn start_background_tasks(&self) {
        self.bus.start_heartbeat();
        self.supervisor.start_status_updates();
    }
}

fn dirs_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}
