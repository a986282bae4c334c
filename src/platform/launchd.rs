use std::{ffi::OsStr, io, path::PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    BackendKind, Layout, ServiceBackend,
    command::{run, run_checked},
    ids_from_codes,
};
use crate::{
    error::{BridgeError, Result},
    node::{NodeId, NodeStatus, NodeTarget},
    registry::NodeHandle,
};

const LAUNCHCTL: &str = "launchctl";

/// Per-user launch agents. The unit name is the agent label and the plist
/// lives at `<agents_dir>/<label>.plist`.
#[derive(Debug)]
pub struct LaunchdBackend {
    layout: Layout,
}

impl LaunchdBackend {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    fn plist(&self, target: &NodeTarget) -> PathBuf {
        self.layout.agents_dir.join(format!("{}.plist", target.unit))
    }
}

/// `launchctl list <label>` prints a dictionary; a `"PID"` key is only
/// present while the job has a live process.
pub(crate) fn parse_list(output: &str) -> NodeStatus {
    if output.contains("\"PID\"") {
        NodeStatus::Running
    } else {
        NodeStatus::Stopped
    }
}

#[async_trait]
impl ServiceBackend for LaunchdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Launchd
    }

    fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn launch(&self, target: &NodeTarget) -> Result<NodeHandle> {
        let plist = self.plist(target);
        if !plist.is_file() {
            return Err(BridgeError::read(plist, io::Error::from(io::ErrorKind::NotFound)));
        }
        run_checked(LAUNCHCTL, &[OsStr::new("load"), OsStr::new("-w"), plist.as_os_str()]).await?;
        info!(label = %target.unit, "launch agent loaded");
        Ok(NodeHandle::Managed)
    }

    async fn halt(&self, target: &NodeTarget) -> Result<()> {
        let plist = self.plist(target);
        run_checked(LAUNCHCTL, &[OsStr::new("unload"), plist.as_os_str()]).await?;
        info!(label = %target.unit, "launch agent unloaded");
        Ok(())
    }

    async fn query(&self, target: &NodeTarget) -> NodeStatus {
        match run(LAUNCHCTL, &["list", target.unit.as_str()]).await {
            Ok(out) if out.success => parse_list(&out.combined),
            // not loaded at all
            Ok(_) => NodeStatus::Stopped,
            Err(err) => {
                warn!(label = %target.unit, error = %err, "launch agent query failed");
                NodeStatus::Unknown
            }
        }
    }

    /// Remove the job from launchd whether or not it is running.
    async fn retire(&self, target: &NodeTarget) -> Result<()> {
        if !run(LAUNCHCTL, &["list", target.unit.as_str()]).await?.success {
            return Ok(());
        }
        run_checked(LAUNCHCTL, &["remove", target.unit.as_str()]).await?;
        info!(label = %target.unit, "launch agent removed");
        Ok(())
    }

    fn default_node_ids(&self) -> Vec<NodeId> {
        ids_from_codes(|code| format!("com.xstream.xray-node-{code}"))
    }
}
