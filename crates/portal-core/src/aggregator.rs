//! Tool and resource aggregation.
//!
//! Merges per-session inventories into a single namespaced catalog. Tools
//! get `<server>.<name>` identifiers, resources `mcp://<server>/<uri>`;
//! both are unique across the catalog at every observable instant and
//! resolve back to `(server, original)` in O(1).

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::registry::InventoryView;

/// A tool in the aggregated catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub original_name: String,
    /// Public identifier: `<server_name>.<original_name>`.
    pub prefixed_name: String,
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema subtree, forwarded untouched.
    pub parameters: Value,
}

/// A resource in the aggregated catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub original_uri: String,
    /// Public identifier: `mcp://<server_name>/<uri>`, or the original URI
    /// verbatim when it is already absolute http(s).
    pub prefixed_uri: String,
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Default)]
struct Catalog {
    tools: BTreeMap<String, ToolDescriptor>,
    resources: BTreeMap<String, ResourceDescriptor>,
}

/// Derived catalog state, rebuilt whenever a session's inventory or state
/// changes. Cheap to clone; clones share the catalog.
#[derive(Clone, Default)]
pub struct Aggregator {
    catalog: Arc<RwLock<Catalog>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full rebuild from the registry's inventory view.
    ///
    /// Only sessions whose state exposes inventory (`ready`/`degraded`)
    /// contribute entries; everything else is absent from the catalog.
    pub fn rebuild(&self, view: &[InventoryView]) {
        let mut catalog = Catalog::default();

        for slice in view {
            if !slice.status.exposes_inventory() {
                continue;
            }

            for tool in &slice.tools {
                let base = format!("{}.{}", slice.server_name, tool.name);
                let prefixed = disambiguate(&base, |key| catalog.tools.contains_key(key));
                catalog.tools.insert(
                    prefixed.clone(),
                    ToolDescriptor {
                        original_name: tool.name.clone(),
                        prefixed_name: prefixed,
                        server_name: slice.server_name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    },
                );
            }

            for resource in &slice.resources {
                let base = prefix_uri(&slice.server_name, &resource.uri);
                let prefixed = disambiguate(&base, |key| catalog.resources.contains_key(key));
                catalog.resources.insert(
                    prefixed.clone(),
                    ResourceDescriptor {
                        original_uri: resource.uri.clone(),
                        prefixed_uri: prefixed,
                        server_name: slice.server_name.clone(),
                        name: resource.name.clone(),
                        description: resource.description.clone(),
                        mime_type: resource.mime_type.clone(),
                    },
                );
            }
        }

        debug!(
            tools = catalog.tools.len(),
            resources = catalog.resources.len(),
            "catalog rebuilt"
        );
        *self.catalog.write().expect("catalog poisoned") = catalog;
    }

    /// Resolve a prefixed tool name to `(server_name, original_name)`.
    pub fn resolve_tool(&self, prefixed_name: &str) -> Option<(String, String)> {
        self.catalog
            .read()
            .expect("catalog poisoned")
            .tools
            .get(prefixed_name)
            .map(|t| (t.server_name.clone(), t.original_name.clone()))
    }

    /// Resolve a prefixed resource URI to `(server_name, original_uri)`.
    pub fn resolve_resource(&self, prefixed_uri: &str) -> Option<(String, String)> {
        self.catalog
            .read()
            .expect("catalog poisoned")
            .resources
            .get(prefixed_uri)
            .map(|r| (r.server_name.clone(), r.original_uri.clone()))
    }

    /// Full tool descriptor lookup.
    pub fn tool(&self, prefixed_name: &str) -> Option<ToolDescriptor> {
        self.catalog
            .read()
            .expect("catalog poisoned")
            .tools
            .get(prefixed_name)
            .cloned()
    }

    /// Stable-ordered tool listing (sorted by prefixed name).
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.catalog
            .read()
            .expect("catalog poisoned")
            .tools
            .values()
            .cloned()
            .collect()
    }

    /// Stable-ordered resource listing (sorted by prefixed URI).
    pub fn list_resources(&self) -> Vec<ResourceDescriptor> {
        self.catalog
            .read()
            .expect("catalog poisoned")
            .resources
            .values()
            .cloned()
            .collect()
    }

    pub fn tool_count(&self) -> usize {
        self.catalog.read().expect("catalog poisoned").tools.len()
    }

    pub fn resource_count(&self) -> usize {
        self.catalog
            .read()
            .expect("catalog poisoned")
            .resources
            .len()
    }
}

/// Append `#2`, `#3`, … until the key no longer collides.
fn disambiguate(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}#{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Build the public URI for one resource.
///
/// Absolute http(s) URIs are preserved verbatim; everything else is
/// rewritten under the `mcp://<server>/` namespace with its scheme removed.
fn prefix_uri(server_name: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_string();
    }
    let without_scheme = match uri.split_once("://") {
        Some((_, rest)) => rest,
        None => uri,
    };
    format!("mcp://{}/{}", server_name, without_scheme.trim_start_matches('/'))
}
