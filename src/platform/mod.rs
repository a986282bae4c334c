//! OS service-management backends.
//!
//! Every backend maps the same start/stop/status contract onto one native
//! primitive. Which one is used is decided once, from configuration or the
//! target OS, when the controller is built.
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    error::{BridgeError, Result},
    node::{NodeId, NodeStatus, NodeTarget},
    registry::NodeHandle,
};

pub mod command;
pub mod launchd;
pub mod process;
pub mod schtasks;
pub mod systemd;

/// File name prefix of per-node worker configs: `xray-vpn-node-<code>.json`.
pub const NODE_CONFIG_PREFIX: &str = "xray-vpn-node-";

/// Node codes a fresh install ships with; reset retires these.
pub const DEFAULT_NODE_CODES: [&str; 3] = ["jp", "ca", "us"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Process,
    Systemd,
    Schtasks,
    Launchd,
}

impl BackendKind {
    /// The service manager native to the build target.
    pub fn native() -> Self {
        if cfg!(target_os = "linux") {
            BackendKind::Systemd
        } else if cfg!(target_os = "windows") {
            BackendKind::Schtasks
        } else if cfg!(target_os = "macos") {
            BackendKind::Launchd
        } else {
            BackendKind::Process
        }
    }
}

/// Where things live on disk, shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub install_dir: PathBuf,
    pub binary_name: String,
    pub config_dir: PathBuf,
    /// The single config the scheduled-task worker reads.
    pub active_config: PathBuf,
    /// Per-user launch agent plists.
    pub agents_dir: PathBuf,
}

impl Layout {
    pub fn binary_path(&self) -> PathBuf {
        self.install_dir.join(&self.binary_name)
    }

    pub fn node_config(&self, code: &str) -> PathBuf {
        self.config_dir.join(format!("{NODE_CONFIG_PREFIX}{code}.json"))
    }
}

#[async_trait]
pub trait ServiceBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    fn layout(&self) -> &Layout;

    /// Suffix stripped from an identifier before deriving its code.
    fn unit_suffix(&self) -> &'static str {
        ""
    }

    /// Map an identifier to its unit name and config path.
    fn resolve(&self, id: &NodeId) -> NodeTarget {
        NodeTarget {
            id: id.clone(),
            unit: id.to_string(),
            config_path: self.layout().node_config(id.code(self.unit_suffix())),
        }
    }

    /// Backends that run one shared worker config return its path; the
    /// node's own config is copied over it before every start.
    fn active_config(&self) -> Option<&Path> {
        None
    }

    /// Whether the unit has to be registered before it can be started.
    async fn unit_exists(&self, _target: &NodeTarget) -> Result<bool> {
        Ok(true)
    }

    /// Register a unit that runs `executable run -c config` at system start.
    async fn create_unit(&self, _name: &str, _executable: &Path, _config: &Path) -> Result<()> {
        Err(BridgeError::Unsupported)
    }

    async fn launch(&self, target: &NodeTarget) -> Result<NodeHandle>;

    /// Native stop, used when the registry holds nothing to terminate.
    async fn halt(&self, target: &NodeTarget) -> Result<()>;

    async fn query(&self, target: &NodeTarget) -> NodeStatus;

    /// Stop and unregister a unit during reset. A unit that is not there is
    /// already retired.
    async fn retire(&self, target: &NodeTarget) -> Result<()> {
        if self.query(target).await == NodeStatus::Stopped {
            return Ok(());
        }
        self.halt(target).await
    }

    /// Identifiers reset retires even when the registry never saw them.
    fn default_node_ids(&self) -> Vec<NodeId>;
}

pub fn backend_for(kind: BackendKind, layout: Layout) -> Arc<dyn ServiceBackend> {
    match kind {
        BackendKind::Process => Arc::new(process::ProcessBackend::new(layout)),
        BackendKind::Systemd => Arc::new(systemd::SystemdBackend::new(layout)),
        BackendKind::Schtasks => Arc::new(schtasks::SchtasksBackend::new(layout)),
        BackendKind::Launchd => Arc::new(launchd::LaunchdBackend::new(layout)),
    }
}

pub(crate) fn ids_from_codes(format: impl Fn(&str) -> String) -> Vec<NodeId> {
    DEFAULT_NODE_CODES
        .iter()
        .filter_map(|code| NodeId::parse(&format(code)).ok())
        .collect()
}

#[cfg(test)]
pub(crate) fn test_layout(root: &Path) -> Layout {
    Layout {
        install_dir: root.join("bin"),
        binary_name: "xray".into(),
        config_dir: root.join("etc"),
        active_config: root.join("bin").join("config.json"),
        agents_dir: root.join("agents"),
    }
}
