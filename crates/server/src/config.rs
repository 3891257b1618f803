use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use zona_engine::DEFAULT_FEED_CAPACITY;
use zona_live::DEFAULT_ADMIN_PASSWORD;

pub const DEFAULT_PORT: u16 = 39333;

/// Server settings. Read from an optional YAML file; command-line flags win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub admin_password: String,
    /// Insert the demo factions and areas into an empty database.
    pub seed_demo: bool,
    /// Serve peers outside loopback and Tailscale.
    pub allow_remote: bool,
    pub feed_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            db_path: default_db_path(),
            admin_password: DEFAULT_ADMIN_PASSWORD.to_string(),
            seed_demo: true,
            allow_remote: false,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parse config")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".zona")
        .join("zona.db")
}
