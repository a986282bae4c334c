use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    BackendKind, Layout, ServiceBackend,
    command::{run, run_checked},
    ids_from_codes,
};
use crate::{
    error::Result,
    node::{NodeId, NodeStatus, NodeTarget},
    registry::NodeHandle,
};

const SYSTEMCTL: &str = "systemctl";

/// User-session units managed through `systemctl --user`.
#[derive(Debug)]
pub struct SystemdBackend {
    layout: Layout,
}

impl SystemdBackend {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }
}

/// Map the first line of `systemctl is-active` to a status.
///
/// Only the exact word `active` is running; `inactive` merely contains it.
pub(crate) fn parse_is_active(output: &str) -> NodeStatus {
    match output.lines().next().map(str::trim) {
        Some("active") => NodeStatus::Running,
        Some("inactive" | "failed" | "activating" | "deactivating" | "reloading" | "unknown") => {
            NodeStatus::Stopped
        }
        _ => NodeStatus::Unknown,
    }
}

#[async_trait]
impl ServiceBackend for SystemdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Systemd
    }

    fn layout(&self) -> &Layout {
        &self.layout
    }

    fn unit_suffix(&self) -> &'static str {
        ".service"
    }

    async fn launch(&self, target: &NodeTarget) -> Result<NodeHandle> {
        run_checked(SYSTEMCTL, &["--user", "start", target.unit.as_str()]).await?;
        info!(unit = %target.unit, "user unit started");
        Ok(NodeHandle::Managed)
    }

    async fn halt(&self, target: &NodeTarget) -> Result<()> {
        run_checked(SYSTEMCTL, &["--user", "stop", target.unit.as_str()]).await?;
        info!(unit = %target.unit, "user unit stopped");
        Ok(())
    }

    async fn query(&self, target: &NodeTarget) -> NodeStatus {
        // is-active exits non-zero for anything but active, so read the
        // output rather than the exit code
        match run(SYSTEMCTL, &["--user", "is-active", target.unit.as_str()]).await {
            Ok(out) => parse_is_active(&out.combined),
            Err(err) => {
                warn!(unit = %target.unit, error = %err, "status query failed");
                NodeStatus::Unknown
            }
        }
    }

    fn default_node_ids(&self) -> Vec<NodeId> {
        ids_from_codes(|code| format!("xray-node-{code}"))
    }
}
