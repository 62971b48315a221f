use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/global.toml";
pub const CONFIG_ENV: &str = "MCMAN_CONFIG";

/// Daemon-wide settings (`config/global.toml`).
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    /// Parent directory of all instance directories
    pub servers_dir: PathBuf,
    /// Bind address of the HTTP control API
    pub ipc_listen: String,
    /// Overrides java detection when set
    pub java_path: Option<PathBuf>,
    /// Default tracing filter; RUST_LOG wins
    pub log_level: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            servers_dir: PathBuf::from("./servers"),
            ipc_listen: "127.0.0.1:57480".to_string(),
            java_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl GlobalConfig {
    /// `$MCMAN_CONFIG`, else `config/global.toml`. A missing file means defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(anyhow::anyhow!("Failed to read {}: {}", path.display(), e)),
        };
        let cfg: Self =
            toml::from_str(&s).map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
        Ok(cfg)
    }
}
