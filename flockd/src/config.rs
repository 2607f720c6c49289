use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use flock_core::ProtoConfig;

const DEFAULT_CONFIG_PATH: &str = "/etc/flock/flockd.toml";
const ENV_CONFIG_PATH: &str = "FLOCKD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub proto: ProtoConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `FLOCKD_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load(path_override: Option<&PathBuf>) -> Self {
        let path = match path_override {
            Some(p) => p.clone(),
            None => PathBuf::from(
                std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
            ),
        };
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetConfig {
    /// Multicast group address the whole cluster agrees on.
    #[serde(default = "default_group")]
    pub group: String,
    /// Local bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            bind: default_bind(),
        }
    }
}

fn default_name() -> String {
    "flock".to_string()
}
fn default_group() -> String {
    "239.255.7.1:14700".to_string()
}
fn default_bind() -> String {
    "0.0.0.0:14700".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.node.name, "flock");
        assert_eq!(c.net.group, "239.255.7.1:14700");
        assert_eq!(c.proto.seqno_max, 0x8000_0000);
    }

    #[test]
    fn partial_file_overrides() {
        let c: Config = toml::from_str(
            "[node]\nname = \"n1\"\n\n[proto]\nresend_period_ms = 50\n",
        )
        .unwrap();
        assert_eq!(c.node.name, "n1");
        assert_eq!(c.proto.resend_period_ms, 50);
        assert_eq!(c.net.bind, "0.0.0.0:14700");
    }
}
