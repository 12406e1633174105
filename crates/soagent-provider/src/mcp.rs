//! Read-only MCP server configuration.
//!
//! `~/.soagent/mcp.json` holds the catalogue; each `/chat/send` names the
//! subset of servers to enable by id. Editing the catalogue is out of scope
//! here, the file is maintained by hand or by the client.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Transport for one MCP server, in the shape the provider CLI accepts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpServerEntry {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub config: McpServerConfig,
}

fn default_enabled() -> bool {
    true
}

#[derive(Default, Deserialize)]
struct McpFile {
    #[serde(default)]
    servers: HashMap<String, McpServerEntry>,
}

pub struct McpConfigStore {
    path: PathBuf,
}

impl McpConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// All catalogued servers. Missing or corrupt file degrades to empty.
    pub fn load(&self) -> HashMap<String, McpServerEntry> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return HashMap::new(),
        };
        match serde_json::from_str::<McpFile>(&content) {
            Ok(file) => file.servers,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt mcp config");
                HashMap::new()
            }
        }
    }

    /// Resolve the requested server ids into provider-ready configs.
    /// Unknown and disabled ids are silently skipped.
    pub fn load_enabled(&self, ids: &[String]) -> Map<String, Value> {
        let catalogue = self.load();
        let mut resolved = Map::new();
        for id in ids {
            let Some(entry) = catalogue.get(id) else {
                continue;
            };
            if !entry.enabled {
                continue;
            }
            if let Ok(value) = serde_json::to_value(&entry.config) {
                resolved.insert(id.clone(), value);
            }
        }
        resolved
    }
}
