use std::{ffi::OsStr, process::Stdio};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    BackendKind, Layout, ServiceBackend,
    command::{command, describe},
    ids_from_codes,
};
use crate::{
    error::{BridgeError, Result},
    node::{NodeId, NodeStatus, NodeTarget},
    registry::NodeHandle,
};

/// Runs the worker as a direct child of this process.
///
/// The registry owns every child this backend spawns, so a stop or status
/// for an identifier the registry does not know has nothing to act on.
#[derive(Debug)]
pub struct ProcessBackend {
    layout: Layout,
}

impl ProcessBackend {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl ServiceBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn launch(&self, target: &NodeTarget) -> Result<NodeHandle> {
        let binary = self.layout.binary_path();
        if !binary.is_file() {
            return Err(BridgeError::BinaryMissing(binary));
        }
        let program = binary.to_string_lossy().into_owned();
        let args: [&OsStr; 3] = [
            OsStr::new("run"),
            OsStr::new("-c"),
            target.config_path.as_os_str(),
        ];

        let child = command(&program, &args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                command: describe(&program, &args),
                source,
            })?;
        info!(node = %target.id, pid = ?child.id(), "worker process spawned");
        Ok(NodeHandle::from_child(child))
    }

    async fn halt(&self, target: &NodeTarget) -> Result<()> {
        debug!(node = %target.id, "no tracked worker process, nothing to stop");
        Ok(())
    }

    async fn query(&self, _target: &NodeTarget) -> NodeStatus {
        NodeStatus::Stopped
    }

    fn default_node_ids(&self) -> Vec<NodeId> {
        ids_from_codes(|code| format!("xray-node-{code}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test_layout;

    #[tokio::test]
    async fn launch_without_binary_reports_install_path() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(test_layout(dir.path()));
        let target = backend.resolve(&NodeId::parse("xray-node-jp").unwrap());

        let err = backend.launch(&target).await.unwrap_err();
        match err {
            BridgeError::BinaryMissing(path) => assert_eq!(path, dir.path().join("bin").join("xray")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn miss_is_stopped_and_stop_is_benign() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(test_layout(dir.path()));
        let target = backend.resolve(&NodeId::parse("xray-node-us").unwrap());

        assert_eq!(backend.query(&target).await, NodeStatus::Stopped);
        backend.halt(&target).await.unwrap();
    }
}
