//! Load config from file and environment.

use std::path::PathBuf;
use std::str::FromStr;

use mesh_core::{DispatcherConfig, RadioParams};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// KISS bridge between a host on the TCP port and the air.
    Modem,
    /// Interactive chat node on stdin.
    Chat,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "modem" => Ok(Role::Modem),
            "chat" => Ok(Role::Chat),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// Node configuration. File: ~/.config/meshnode/config.toml or /etc/meshnode/config.toml.
/// Env overrides: MESHNODE_HOST_PORT, MESHNODE_AIR_PORT, MESHNODE_ROLE, MESHNODE_DATA_DIR,
/// MESHNODE_NODE_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_role")]
    pub role: Role,
    /// KISS host link TCP port, modem role (default 4000).
    #[serde(default = "default_host_port")]
    pub host_port: u16,
    /// Simulated air UDP multicast port (default 45680).
    #[serde(default = "default_air_port")]
    pub air_port: u16,
    /// Identity, contacts and prefs live here.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Overrides the name stored in prefs.
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub radio: RadioParams,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

fn default_role() -> Role {
    Role::Chat
}
fn default_host_port() -> u16 {
    4000
}
fn default_air_port() -> u16 {
    45680
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/meshnode"),
        None => PathBuf::from("/var/lib/meshnode"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            host_port: default_host_port(),
            air_port: default_air_port(),
            data_dir: default_data_dir(),
            node_name: None,
            radio: RadioParams::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("MESHNODE_HOST_PORT").and_then(|s| s.parse().ok()) {
        c.host_port = p;
    }
    if let Some(p) = var("MESHNODE_AIR_PORT").and_then(|s| s.parse().ok()) {
        c.air_port = p;
    }
    if let Some(r) = var("MESHNODE_ROLE").and_then(|s| s.parse().ok()) {
        c.role = r;
    }
    if let Some(d) = var("MESHNODE_DATA_DIR") {
        c.data_dir = PathBuf::from(d);
    }
    if let Some(n) = var("MESHNODE_NODE_NAME").filter(|n| !n.is_empty()) {
        c.node_name = Some(n);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshnode/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshnode/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "bad config file ignored"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "config file unreadable"),
            }
            break;
        }
    }
    None
}
