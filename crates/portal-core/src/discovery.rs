//! MCP server discovery.
//!
//! Scans the known IDE configuration locations plus the gateway-owned manual
//! document, normalizes every declaration into a [`ServerDecl`], and
//! deduplicates by name with source precedence
//! `manual > cursor > vscode > claude > windsurf > continue`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::PortalConfig;
use crate::{PortalError, PortalResult};

/// File name of the gateway-owned manual source.
const MANUAL_FILE: &str = "servers.json";

/// Configuration source a declaration was recovered from.
///
/// Variants are ordered by ascending precedence; `Manual` wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerSource {
    Continue,
    Windsurf,
    Claude,
    Vscode,
    Cursor,
    Manual,
}

impl ServerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerSource::Continue => "continue",
            ServerSource::Windsurf => "windsurf",
            ServerSource::Claude => "claude",
            ServerSource::Vscode => "vscode",
            ServerSource::Cursor => "cursor",
            ServerSource::Manual => "manual",
        }
    }
}

/// How to reach the upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportHint {
    Stdio,
    HttpSse,
}

/// A declared MCP server, normalized from whichever source declared it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDecl {
    pub name: String,
    pub source: ServerSource,
    pub transport: TransportHint,
    /// Spawn command (stdio transport).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Endpoint URL (http_sse transport).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub enabled: bool,
}

impl ServerDecl {
    /// True when the two declarations differ only in the enabled bit.
    pub fn same_except_enabled(&self, other: &ServerDecl) -> bool {
        self.name == other.name
            && self.transport == other.transport
            && self.command == other.command
            && self.args == other.args
            && self.env == other.env
            && self.url == other.url
            && self.timeout_seconds == other.timeout_seconds
            && self.max_retries == other.max_retries
    }
}

/// Raw per-server entry as found on disk. Schema varies per IDE; every
/// field is optional and unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawServerEntry {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    url: Option<String>,
    #[serde(rename = "type")]
    _transport: Option<String>,
    enabled: Option<bool>,
    timeout: Option<u64>,
    max_retries: Option<u32>,
}

impl RawServerEntry {
    /// A manual entry with neither command nor url is an overlay: it adjusts
    /// an existing declaration (currently just the enabled bit) instead of
    /// declaring a new server.
    fn is_overlay(&self) -> bool {
        self.command.is_none() && self.url.is_none()
    }
}

/// Outcome of a full scan.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Deduplicated declarations, precedence applied.
    pub decls: Vec<ServerDecl>,
    /// `(name, losing source)` for duplicates dropped by precedence.
    pub dropped: Vec<(String, ServerSource)>,
    /// Per-file parse failures, as `(path, reason)`.
    pub errors: Vec<(PathBuf, String)>,
}

/// Difference between two scans, applied by the supervisor.
#[derive(Debug, Default)]
pub struct ReconcileDelta {
    pub added: Vec<ServerDecl>,
    /// `(previous, current)` pairs for declarations that changed in place.
    pub changed: Vec<(ServerDecl, ServerDecl)>,
    pub removed: Vec<String>,
}

impl ReconcileDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Scans config locations and produces normalized declarations.
#[derive(Debug, Clone)]
pub struct Discovery {
    home: PathBuf,
    config_dir: PathBuf,
    default_timeout: u64,
    default_retries: u32,
}

impl Discovery {
    pub fn new(config: &PortalConfig) -> Self {
        Self {
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            config_dir: config.config_dir.clone(),
            default_timeout: config.timeout_seconds,
            default_retries: config.max_retries,
        }
    }

    /// Build a discovery rooted at explicit directories. Used by tests and
    /// by deployments that relocate the home directory.
    pub fn with_roots(home: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            config_dir: config_dir.into(),
            default_timeout: PortalConfig::default_timeout_seconds(),
            default_retries: PortalConfig::default_max_retries(),
        }
    }

    /// Path of the gateway-owned manual document.
    pub fn manual_path(&self) -> PathBuf {
        self.config_dir.join(MANUAL_FILE)
    }

    /// Candidate config files for one source, in the order they are tried.
    fn source_paths(&self, source: ServerSource) -> Vec<PathBuf> {
        match source {
            ServerSource::Cursor => vec![self.home.join(".cursor").join("mcp.json")],
            ServerSource::Vscode => {
                let mut paths = vec![self.home.join(".vscode").join("settings.json")];
                if let Some(config) = dirs::config_dir() {
                    paths.push(config.join("Code").join("User").join("settings.json"));
                }
                paths
            }
            ServerSource::Claude => {
                let mut paths = vec![self.home.join(".claude").join("claude_desktop_config.json")];
                if let Some(config) = dirs::config_dir() {
                    paths.push(config.join("Claude").join("claude_desktop_config.json"));
                }
                paths
            }
            ServerSource::Windsurf => {
                vec![self.home.join(".windsurf").join("mcp_servers.json")]
            }
            ServerSource::Continue => vec![self.home.join(".continue").join("config.json")],
            ServerSource::Manual => vec![self.manual_path()],
        }
    }

    /// Extract the server map out of one parsed document.
    ///
    /// Cursor, Claude, Windsurf, and the manual source use a top-level
    /// `mcpServers` map; VS Code and Continue nest it under `mcp.servers`.
    fn server_map(source: ServerSource, doc: &Value) -> Option<&serde_json::Map<String, Value>> {
        match source {
            ServerSource::Vscode | ServerSource::Continue => doc
                .get("mcp")
                .and_then(|m| m.get("servers"))
                .and_then(Value::as_object),
            _ => doc.get("mcpServers").and_then(Value::as_object),
        }
    }

    fn normalize(
        &self,
        name: &str,
        source: ServerSource,
        raw: RawServerEntry,
    ) -> PortalResult<ServerDecl> {
        let transport = if raw.url.is_some() {
            TransportHint::HttpSse
        } else if raw.command.is_some() {
            TransportHint::Stdio
        } else {
            return Err(PortalError::ConfigInvalid(format!(
                "server '{name}' has neither command nor url"
            )));
        };

        Ok(ServerDecl {
            name: name.to_string(),
            source,
            transport,
            command: raw.command,
            args: raw.args,
            env: raw.env,
            url: raw.url,
            timeout_seconds: raw.timeout.unwrap_or(self.default_timeout),
            max_retries: raw.max_retries.unwrap_or(self.default_retries),
            enabled: raw.enabled.unwrap_or(true),
        })
    }

    /// Synchronous full rescan.
    ///
    /// Fails per file: a malformed document is logged and skipped, never
    /// aborting the scan. Sources are visited in ascending precedence so a
    /// later (higher-precedence) declaration replaces an earlier one.
    pub fn scan(&self) -> ScanResult {
        let mut result = ScanResult::default();
        let mut by_name: HashMap<String, ServerDecl> = HashMap::new();
        let sources = [
            ServerSource::Continue,
            ServerSource::Windsurf,
            ServerSource::Claude,
            ServerSource::Vscode,
            ServerSource::Cursor,
            ServerSource::Manual,
        ];

        for source in sources {
            for path in self.source_paths(source) {
                if !path.exists() {
                    continue;
                }
                let doc: Value = match fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
                {
                    Ok(doc) => doc,
                    Err(reason) => {
                        warn!(path = %path.display(), %reason, "skipping unreadable config");
                        result.errors.push((path, reason));
                        continue;
                    }
                };

                let Some(servers) = Self::server_map(source, &doc) else {
                    debug!(path = %path.display(), "no server map in config");
                    continue;
                };

                for (name, entry) in servers {
                    let raw: RawServerEntry = match serde_json::from_value(entry.clone()) {
                        Ok(raw) => raw,
                        Err(e) => {
                            warn!(server = %name, error = %e, "skipping unparsable declaration");
                            result
                                .errors
                                .push((path.clone(), format!("server '{name}': {e}")));
                            continue;
                        }
                    };

                    if source == ServerSource::Manual && raw.is_overlay() {
                        match by_name.get_mut(name.as_str()) {
                            Some(decl) => {
                                if let Some(enabled) = raw.enabled {
                                    decl.enabled = enabled;
                                }
                            }
                            None => warn!(
                                server = %name,
                                "manual overlay references a server no source declares"
                            ),
                        }
                        continue;
                    }

                    match self.normalize(name, source, raw) {
                        Ok(decl) => {
                            if let Some(previous) = by_name.insert(name.clone(), decl) {
                                debug!(
                                    server = %name,
                                    dropped = previous.source.as_str(),
                                    kept = source.as_str(),
                                    "duplicate declaration, lower precedence dropped"
                                );
                                result.dropped.push((name.clone(), previous.source));
                            }
                        }
                        Err(e) => {
                            result.errors.push((path.clone(), e.to_string()));
                        }
                    }
                }
            }
        }

        let mut decls: Vec<ServerDecl> = by_name.into_values().collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        info!(count = decls.len(), "discovery scan complete");
        result.decls = decls;
        result
    }

    /// Diff a fresh scan against the currently known declarations.
    pub fn reconcile(previous: &[ServerDecl], current: &[ServerDecl]) -> ReconcileDelta {
        let old: HashMap<&str, &ServerDecl> =
            previous.iter().map(|d| (d.name.as_str(), d)).collect();
        let new: HashMap<&str, &ServerDecl> =
            current.iter().map(|d| (d.name.as_str(), d)).collect();

        let mut delta = ReconcileDelta::default();

        for decl in current {
            match old.get(decl.name.as_str()) {
                None => delta.added.push(decl.clone()),
                Some(prev) if *prev != decl => {
                    delta.changed.push(((*prev).clone(), decl.clone()));
                }
                Some(_) => {}
            }
        }

        for decl in previous {
            if !new.contains_key(decl.name.as_str()) {
                delta.removed.push(decl.name.clone());
            }
        }

        delta
    }

    /// Replace the manual document atomically (temp file + rename).
    ///
    /// Returns the number of server entries in the new document.
    pub fn write_manual(&self, doc: &Value) -> PortalResult<usize> {
        let servers = doc
            .get("mcpServers")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                PortalError::ConfigInvalid("document must contain an 'mcpServers' map".into())
            })?;
        let count = servers.len();

        fs::create_dir_all(&self.config_dir)
            .map_err(|e| PortalError::ConfigInvalid(format!("cannot create config dir: {e}")))?;

        let target = self.manual_path();
        let tmp = target.with_extension("json.tmp");
        let rendered = serde_json::to_string_pretty(doc)
            .map_err(|e| PortalError::ConfigInvalid(e.to_string()))?;

        let mut file = fs::File::create(&tmp)
            .map_err(|e| PortalError::ConfigInvalid(format!("cannot write manual source: {e}")))?;
        file.write_all(rendered.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| PortalError::ConfigInvalid(format!("cannot write manual source: {e}")))?;
        drop(file);

        fs::rename(&tmp, &target)
            .map_err(|e| PortalError::ConfigInvalid(format!("cannot replace manual source: {e}")))?;

        info!(path = %target.display(), servers = count, "manual source replaced");
        Ok(count)
    }

    /// Read the manual document, or an empty `{"mcpServers": {}}` skeleton.
    pub fn read_manual(&self) -> Value {
        fs::read_to_string(self.manual_path())
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_else(|| serde_json::json!({ "mcpServers": {} }))
    }

    /// Persist an enabled override for one server into the manual source.
    ///
    /// If the server is declared in the manual document the bit is set in
    /// place; otherwise an overlay entry carrying only `enabled` is merged
    /// in, which also pins the declaration across source removal.
    pub fn persist_enabled(&self, name: &str, enabled: bool) -> PortalResult<()> {
        let mut doc = self.read_manual();
        let servers = doc
            .get_mut("mcpServers")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| PortalError::ConfigInvalid("manual source is not a map".into()))?;

        match servers.get_mut(name) {
            Some(Value::Object(entry)) => {
                entry.insert("enabled".to_string(), Value::Bool(enabled));
            }
            _ => {
                servers.insert(
                    name.to_string(),
                    serde_json::json!({ "enabled": enabled }),
                );
            }
        }

        self.write_manual(&doc).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_config(root: &Path, rel: &str, content: &Value) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_string_pretty(content).unwrap()).unwrap();
    }

    fn stdio_entry(command: &str) -> Value {
        serde_json::json!({ "command": command, "args": ["-y", "server"] })
    }

    fn discovery(home: &TempDir) -> Discovery {
        Discovery::with_roots(home.path(), home.path().join(".mcp-portal"))
    }

    #[test]
    fn test_scan_empty_home() {
        let home = TempDir::new().unwrap();
        let result = discovery(&home).scan();
        assert!(result.decls.is_empty());
        assert!(result.dropped.is_empty());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_scan_cursor_config() {
        let home = TempDir::new().unwrap();
        write_config(
            home.path(),
            ".cursor/mcp.json",
            &serde_json::json!({ "mcpServers": { "alpha": stdio_entry("echo-tool") } }),
        );

        let result = discovery(&home).scan();
        assert_eq!(result.decls.len(), 1);
        let decl = &result.decls[0];
        assert_eq!(decl.name, "alpha");
        assert_eq!(decl.source, ServerSource::Cursor);
        assert_eq!(decl.transport, TransportHint::Stdio);
        assert_eq!(decl.command.as_deref(), Some("echo-tool"));
        assert!(decl.enabled);
        assert_eq!(decl.timeout_seconds, 30);
    }

    #[test]
    fn test_vscode_nested_schema() {
        let home = TempDir::new().unwrap();
        write_config(
            home.path(),
            ".vscode/settings.json",
            &serde_json::json!({
                "editor.fontSize": 14,
                "mcp": { "servers": { "files": { "command": "mcp-files" } } }
            }),
        );

        let result = discovery(&home).scan();
        assert_eq!(result.decls.len(), 1);
        assert_eq!(result.decls[0].source, ServerSource::Vscode);
    }

    #[test]
    fn test_url_declaration_is_http_sse() {
        let home = TempDir::new().unwrap();
        write_config(
            home.path(),
            ".windsurf/mcp_servers.json",
            &serde_json::json!({
                "mcpServers": { "remote": { "url": "http://localhost:3001/sse" } }
            }),
        );

        let result = discovery(&home).scan();
        assert_eq!(result.decls[0].transport, TransportHint::HttpSse);
        assert_eq!(result.decls[0].url.as_deref(), Some("http://localhost:3001/sse"));
    }

    #[test]
    fn test_precedence_cursor_beats_windsurf() {
        let home = TempDir::new().unwrap();
        write_config(
            home.path(),
            ".cursor/mcp.json",
            &serde_json::json!({ "mcpServers": { "alpha": stdio_entry("cursor-cmd") } }),
        );
        write_config(
            home.path(),
            ".windsurf/mcp_servers.json",
            &serde_json::json!({ "mcpServers": { "alpha": stdio_entry("windsurf-cmd") } }),
        );

        let result = discovery(&home).scan();
        assert_eq!(result.decls.len(), 1);
        assert_eq!(result.decls[0].command.as_deref(), Some("cursor-cmd"));
        assert_eq!(result.decls[0].source, ServerSource::Cursor);
        assert_eq!(
            result.dropped,
            vec![("alpha".to_string(), ServerSource::Windsurf)]
        );
    }

    #[test]
    fn test_manual_beats_cursor() {
        let home = TempDir::new().unwrap();
        let disc = discovery(&home);
        write_config(
            home.path(),
            ".cursor/mcp.json",
            &serde_json::json!({ "mcpServers": { "alpha": stdio_entry("cursor-cmd") } }),
        );
        disc.write_manual(&serde_json::json!({
            "mcpServers": { "alpha": stdio_entry("manual-cmd") }
        }))
        .unwrap();

        let result = disc.scan();
        assert_eq!(result.decls[0].source, ServerSource::Manual);
        assert_eq!(result.decls[0].command.as_deref(), Some("manual-cmd"));
    }

    #[test]
    fn test_manual_overlay_flips_enabled() {
        let home = TempDir::new().unwrap();
        let disc = discovery(&home);
        write_config(
            home.path(),
            ".cursor/mcp.json",
            &serde_json::json!({ "mcpServers": { "alpha": stdio_entry("cursor-cmd") } }),
        );
        disc.persist_enabled("alpha", false).unwrap();

        let result = disc.scan();
        assert_eq!(result.decls.len(), 1);
        // Overlay only flips the bit; the declaration stays cursor's.
        assert_eq!(result.decls[0].source, ServerSource::Cursor);
        assert!(!result.decls[0].enabled);
    }

    #[test]
    fn test_malformed_file_is_skipped_not_fatal() {
        let home = TempDir::new().unwrap();
        let cursor = home.path().join(".cursor");
        fs::create_dir_all(&cursor).unwrap();
        fs::write(cursor.join("mcp.json"), "{ not json").unwrap();
        write_config(
            home.path(),
            ".windsurf/mcp_servers.json",
            &serde_json::json!({ "mcpServers": { "beta": stdio_entry("ok") } }),
        );

        let result = discovery(&home).scan();
        assert_eq!(result.decls.len(), 1);
        assert_eq!(result.decls[0].name, "beta");
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_declaration_without_command_or_url_dropped() {
        let home = TempDir::new().unwrap();
        write_config(
            home.path(),
            ".cursor/mcp.json",
            &serde_json::json!({ "mcpServers": { "ghost": { "enabled": true } } }),
        );

        let result = discovery(&home).scan();
        assert!(result.decls.is_empty());
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_reconcile_classifies_changes() {
        let home = TempDir::new().unwrap();
        let disc = discovery(&home);
        write_config(
            home.path(),
            ".cursor/mcp.json",
            &serde_json::json!({
                "mcpServers": {
                    "keep": stdio_entry("same"),
                    "mutate": stdio_entry("before"),
                    "gone": stdio_entry("bye")
                }
            }),
        );
        let old = disc.scan().decls;

        write_config(
            home.path(),
            ".cursor/mcp.json",
            &serde_json::json!({
                "mcpServers": {
                    "keep": stdio_entry("same"),
                    "mutate": stdio_entry("after"),
                    "fresh": stdio_entry("hello")
                }
            }),
        );
        let new = disc.scan().decls;

        let delta = Discovery::reconcile(&old, &new);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].name, "fresh");
        assert_eq!(delta.changed.len(), 1);
        assert_eq!(delta.changed[0].1.command.as_deref(), Some("after"));
        assert_eq!(delta.removed, vec!["gone".to_string()]);
    }

    #[test]
    fn test_config_roundtrip_is_noop() {
        let home = TempDir::new().unwrap();
        let disc = discovery(&home);
        disc.write_manual(&serde_json::json!({
            "mcpServers": { "alpha": stdio_entry("tool") }
        }))
        .unwrap();

        let before = disc.scan().decls;
        let doc = disc.read_manual();
        disc.write_manual(&doc).unwrap();
        let after = disc.scan().decls;

        let delta = Discovery::reconcile(&before, &after);
        assert!(delta.is_empty());
    }

    #[test]
    fn test_write_manual_rejects_bad_document() {
        let home = TempDir::new().unwrap();
        let disc = discovery(&home);
        let err = disc
            .write_manual(&serde_json::json!({ "servers": [] }))
            .unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
    }

    #[test]
    fn test_same_except_enabled() {
        let home = TempDir::new().unwrap();
        let disc = discovery(&home);
        write_config(
            home.path(),
            ".cursor/mcp.json",
            &serde_json::json!({ "mcpServers": { "alpha": stdio_entry("tool") } }),
        );
        let a = disc.scan().decls.remove(0);
        let mut b = a.clone();
        b.enabled = false;
        assert!(a.same_except_enabled(&b));
        b.args.push("extra".into());
        assert!(!a.same_except_enabled(&b));
    }
}
