use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{BridgeError, Result},
    platform::{BackendKind, Layout},
    provisioner::default_download_url,
};

/// Prefix of every environment key read by [`BridgeConfig::from_env`].
pub const ENV_PREFIX: &str = "XNODE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub backend: BackendKind,
    pub install_dir: PathBuf,
    pub binary_name: String,
    pub download_url: String,
    pub config_dir: PathBuf,
    pub registry_path: PathBuf,
    pub active_config: PathBuf,
    pub agents_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub log_to_stdout: bool,
    /// Identifiers reset retires; `None` means the backend's defaults.
    pub reset_nodes: Option<Vec<String>>,
    pub tray_poll_ms: u64,
    pub worker_threads: usize,
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let home = home_dir();
        let (install_dir, config_dir) = if cfg!(target_os = "windows") {
            let program_files = env::var_os("ProgramFiles")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"));
            let root = program_files.join("Xstream");
            (root.clone(), root)
        } else if cfg!(target_os = "macos") {
            let support = home.join("Library").join("Application Support").join("xstream");
            (support.join("bin"), support)
        } else {
            (
                home.join(".local").join("share").join("xstream").join("bin"),
                home.join(".config").join("xstream"),
            )
        };
        let binary_name = if cfg!(windows) { "xray.exe" } else { "xray" };

        BridgeConfig {
            backend: BackendKind::native(),
            active_config: install_dir.join("config.json"),
            install_dir,
            binary_name: binary_name.to_string(),
            download_url: default_download_url(),
            registry_path: config_dir.join("vpn_nodes.json"),
            log_dir: config_dir.join("logs"),
            config_dir,
            agents_dir: home.join("Library").join("LaunchAgents"),
            log_level: "info".to_string(),
            log_to_stdout: false,
            reset_nodes: None,
            tray_poll_ms: 500,
            worker_threads: 2,
        }
    }
}

/// Load a `.env` file into the process environment. Variables that are
/// already set win over the file.
pub fn load_env_file(env_file: &Path) -> bool {
    if env_file.exists() {
        match dotenvy::from_path(env_file) {
            Ok(()) => {
                info!("Loaded .env from {}", env_file.display());
                return true;
            }
            Err(err) => info!("could not load .env from {}: {err}", env_file.display()),
        }
    } else {
        debug!("no .env at {}", env_file.display());
    }
    false
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| BridgeError::InvalidSetting {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(BridgeError::InvalidSetting {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
        }),
    }
}

impl BridgeConfig {
    /// Defaults, then an optional `.env` file, then `XNODE_*` variables.
    ///
    /// The file is `XNODE_ENV_FILE` when set, otherwise `.env` inside the
    /// config directory.
    pub fn from_env() -> Result<Self> {
        let env_file = match env::var_os("XNODE_ENV_FILE") {
            Some(path) => PathBuf::from(path),
            None => env::var_os("XNODE_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| BridgeConfig::default().config_dir)
                .join(".env"),
        };
        load_env_file(&env_file);

        let mut config = BridgeConfig::default();
        config.apply(|key| env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        Ok(config)
    }

    /// Override fields from `lookup(KEY)` (keys without the prefix). Paths
    /// derived from a directory follow it unless set themselves.
    pub fn apply(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("BACKEND") {
            self.backend = parse("BACKEND", &v)?;
        }
        if let Some(v) = lookup("INSTALL_DIR") {
            self.install_dir = PathBuf::from(v);
            self.active_config = self.install_dir.join("config.json");
        }
        if let Some(v) = lookup("CONFIG_DIR") {
            self.config_dir = PathBuf::from(v);
            self.registry_path = self.config_dir.join("vpn_nodes.json");
            self.log_dir = self.config_dir.join("logs");
        }
        if let Some(v) = lookup("BINARY_NAME") {
            self.binary_name = v;
        }
        if let Some(v) = lookup("DOWNLOAD_URL") {
            self.download_url = v;
        }
        if let Some(v) = lookup("REGISTRY_PATH") {
            self.registry_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ACTIVE_CONFIG") {
            self.active_config = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTS_DIR") {
            self.agents_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("LOG_STDOUT") {
            self.log_to_stdout = parse_bool("LOG_STDOUT", &v)?;
        }
        if let Some(v) = lookup("RESET_NODES") {
            let ids: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            self.reset_nodes = Some(ids);
        }
        if let Some(v) = lookup("TRAY_POLL_MS") {
            self.tray_poll_ms = parse("TRAY_POLL_MS", &v)?;
        }
        if let Some(v) = lookup("WORKER_THREADS") {
            self.worker_threads = parse::<usize>("WORKER_THREADS", &v)?.max(1);
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout {
            install_dir: self.install_dir.clone(),
            binary_name: self.binary_name.clone(),
            config_dir: self.config_dir.clone(),
            active_config: self.active_config.clone(),
            agents_dir: self.agents_dir.clone(),
        }
    }

    /// Same layout, everything under `root`. Used by tests and the CLI's
    /// `--root` flag.
    pub fn rooted(root: &Path) -> Self {
        let install_dir = root.join("bin");
        let config_dir = root.join("etc");
        BridgeConfig {
            backend: BackendKind::Process,
            active_config: install_dir.join("config.json"),
            install_dir,
            registry_path: config_dir.join("vpn_nodes.json"),
            log_dir: root.join("logs"),
            agents_dir: root.join("agents"),
            config_dir,
            ..BridgeConfig::default()
        }
    }
}
