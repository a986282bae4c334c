use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, warn};

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

const SCHTASKS: &str = "schtasks";
const TASKKILL: &str = "taskkill";

/// Windows scheduled tasks. All tasks share one worker executable reading one
/// active config, so a start copies the node's config over it first.
#[derive(Debug)]
pub struct SchtasksBackend {
    layout: Layout,
    schtasks: String,
    taskkill: String,
}

impl SchtasksBackend {
    pub fn new(layout: Layout) -> Self {
        Self::with_tools(layout, SCHTASKS, TASKKILL)
    }

    /// Use the given `schtasks` and `taskkill` executables.
    pub fn with_tools(layout: Layout, schtasks: impl Into<String>, taskkill: impl Into<String>) -> Self {
        Self {
            layout,
            schtasks: schtasks.into(),
            taskkill: taskkill.into(),
        }
    }
}

/// The `/TR` value: quoted executable, then `run -c` and the quoted config.
pub(crate) fn task_command(executable: &Path, config: &Path) -> String {
    format!(
        "\"{}\" run -c \"{}\"",
        executable.display(),
        config.display()
    )
}

/// `/Query` output lists the task state; the localized Chinese label is
/// matched too.
pub(crate) fn parse_query(output: &str) -> NodeStatus {
    let lower = output.to_lowercase();
    if lower.contains("running") || output.contains("正在运行") {
        NodeStatus::Running
    } else {
        NodeStatus::Stopped
    }
}

/// A failed `/Query` caused by the task not being registered, in English or
/// Chinese output.
pub(crate) fn is_missing_task(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("cannot find") || lower.contains("does not exist") || output.contains("找不到")
}

#[async_trait]
impl ServiceBackend for SchtasksBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Schtasks
    }

    fn layout(&self) -> &Layout {
        &self.layout
    }

    fn unit_suffix(&self) -> &'static str {
        ".schtasks"
    }

    fn active_config(&self) -> Option<&Path> {
        Some(&self.layout.active_config)
    }

    async fn unit_exists(&self, target: &NodeTarget) -> Result<bool> {
        Ok(run(&self.schtasks, &["/Query", "/TN", target.unit.as_str()]).await?.success)
    }

    async fn create_unit(&self, name: &str, executable: &Path, config: &Path) -> Result<()> {
        if run(&self.schtasks, &["/Query", "/TN", name]).await?.success {
            debug!(task = name, "scheduled task already registered");
            return Ok(());
        }
        let action = task_command(executable, config);
        run_checked(
            &self.schtasks,
            &["/Create", "/TN", name, "/SC", "ONSTART", "/RL", "HIGHEST", "/TR", action.as_str(), "/F"],
        )
        .await?;
        info!(task = name, "scheduled task registered");
        Ok(())
    }

    async fn launch(&self, target: &NodeTarget) -> Result<NodeHandle> {
        run_checked(&self.schtasks, &["/Run", "/TN", target.unit.as_str()]).await?;
        info!(task = %target.unit, "scheduled task started");
        Ok(NodeHandle::Managed)
    }

    /// End, delete, then sweep the worker image. Each step runs whatever the
    /// previous one reported, so a task that is already gone still gets its
    /// orphaned worker killed. Only a tool that cannot be launched fails.
    async fn halt(&self, target: &NodeTarget) -> Result<()> {
        let unit = target.unit.as_str();
        // every task runs the same executable: the sweep stops all of them
        let image = self.layout.binary_name.as_str();
        let steps: [(&str, Vec<&str>); 3] = [
            (self.schtasks.as_str(), vec!["/End", "/TN", unit]),
            (self.schtasks.as_str(), vec!["/Delete", "/TN", unit, "/F"]),
            (self.taskkill.as_str(), vec!["/F", "/IM", image]),
        ];

        let mut spawn_failure = None;
        for (program, args) in steps {
            match run(program, args.as_slice()).await {
                Ok(out) if !out.success => {
                    debug!(task = unit, step = args[0], output = %out.combined, "stop step had nothing to do");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(task = unit, error = %err, "stop step could not run");
                    spawn_failure.get_or_insert(err);
                }
            }
        }
        if let Some(err) = spawn_failure {
            return Err(err);
        }
        info!(task = unit, "scheduled task stopped and removed");
        Ok(())
    }

    async fn query(&self, target: &NodeTarget) -> NodeStatus {
        match run(&self.schtasks, &["/Query", "/TN", target.unit.as_str()]).await {
            Ok(out) if out.success => parse_query(&out.combined),
            Ok(out) if is_missing_task(&out.combined) => NodeStatus::Stopped,
            Ok(out) => {
                warn!(task = %target.unit, output = %out.combined, "task query failed");
                NodeStatus::Unknown
            }
            Err(err) => {
                warn!(task = %target.unit, error = %err, "task query failed");
                NodeStatus::Unknown
            }
        }
    }

    async fn retire(&self, target: &NodeTarget) -> Result<()> {
        if !self.unit_exists(target).await? {
            return Ok(());
        }
        self.halt(target).await
    }

    fn default_node_ids(&self) -> Vec<NodeId> {
        ids_from_codes(|code| format!("ray-node-{code}.schtasks"))
    }
}
