//! `scriptorium.json` loading (§6), grounded on the teacher's `ConfigLoader`
//! preceddence style (`src/config/loader.rs`) but simplified to the single
//! canonical path the spec names, with every field optional and defaulted.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub architect: String,
    pub coding: String,
    pub manager: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            architect: "codex-default".to_string(),
            coding: "codex-default".to_string(),
            manager: "codex-default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReasoningEffortConfig {
    pub architect: String,
    pub coding: String,
    pub manager: String,
}

impl Default for ReasoningEffortConfig {
    fn default() -> Self {
        Self {
            architect: "medium".to_string(),
            coding: "medium".to_string(),
            manager: "medium".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub local: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            local: "http://127.0.0.1:8097".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ScriptoriumConfig {
    pub models: ModelsConfig,
    #[serde(rename = "reasoningEffort")]
    pub reasoning_effort: ReasoningEffortConfig,
    pub endpoints: EndpointsConfig,
}

impl ScriptoriumConfig {
    /// Loads `scriptorium.json` from `repo_root` if present; every absent
    /// field (or the whole file) falls back to documented defaults.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = repo_root.join("scriptorium.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| Error::InvalidInput(format!("malformed scriptorium.json: {e}")))?;
        Ok(config)
    }
}

/// A parsed MCP/health endpoint: scheme+host required, port defaulted per
/// scheme, `[1, 65535]` enforced (P10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

pub fn parse_endpoint(raw: &str) -> Result<Endpoint> {
    let url = url::Url::parse(raw).map_err(|e| Error::InvalidInput(format!("invalid endpoint {raw:?}: {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidInput(format!("endpoint {raw:?} is missing a host")))?
        .to_string();

    let default_port = match url.scheme() {
        "https" => 443,
        "http" => 80,
        _ => {
            return Err(Error::InvalidInput(format!(
                "endpoint {raw:?} has unsupported scheme {:?}",
                url.scheme()
            )))
        }
    };
    let port = url.port().unwrap_or(default_port);
    if port == 0 {
        return Err(Error::InvalidInput(format!("endpoint {raw:?} has port out of range")));
    }

    Ok(Endpoint {
        scheme: url.scheme().to_string(),
        host,
        port,
    })
}
