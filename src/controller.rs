//! NodeController: the start/stop/status/reset façade over one backend.
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use crate::{
    error::{BridgeError, Result},
    node::{NodeId, NodeStatus, NodeTarget},
    persistence::{ConfigStore, ConfigWrite},
    platform::{NODE_CONFIG_PREFIX, ServiceBackend},
    privileged::{PrivilegedWriter, writer_for},
    provisioner::{InstallOutcome, Provisioner},
    registry::{NativeUnit, NodeRegistry},
};

/// What a full reset removes besides the units themselves.
#[derive(Debug, Clone)]
pub struct ResetPlan {
    /// Units retired even if this process never started them.
    pub node_ids: Vec<NodeId>,
    pub install_dir: PathBuf,
    pub config_dir: PathBuf,
    pub registry_path: PathBuf,
}

/// One backend target seen through the registry's `NativeUnit` seam.
struct BoundUnit<'a> {
    backend: &'a dyn ServiceBackend,
    target: &'a NodeTarget,
}

#[async_trait]
impl NativeUnit for BoundUnit<'_> {
    async fn query(&self) -> NodeStatus {
        self.backend.query(self.target).await
    }

    async fn halt(&self) -> Result<()> {
        self.backend.halt(self.target).await
    }
}

#[derive(Debug)]
pub struct NodeController {
    backend: Arc<dyn ServiceBackend>,
    registry: NodeRegistry,
    store: ConfigStore,
    provisioner: Provisioner,
    reset_plan: ResetPlan,
}

impl NodeController {
    pub fn new(backend: Arc<dyn ServiceBackend>, provisioner: Provisioner, reset_plan: ResetPlan) -> Self {
        Self {
            backend,
            registry: NodeRegistry::new(),
            store: ConfigStore::new(),
            provisioner,
            reset_plan,
        }
    }

    pub fn backend(&self) -> &dyn ServiceBackend {
        self.backend.as_ref()
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub async fn write_configs(&self, request: &ConfigWrite<'_>, credential: Option<&str>) -> Result<usize> {
        let writer = writer_for(credential);
        self.store.write_node_configs(request, writer.as_ref()).await
    }

    pub async fn start(&self, raw_id: &str) -> Result<()> {
        let id = NodeId::parse(raw_id)?;
        let backend = self.backend.as_ref();
        let target = backend.resolve(&id);
        let unit = BoundUnit { backend, target: &target };

        self.registry
            .start(&id, &unit, || async {
                let config = match backend.active_config() {
                    Some(active) => {
                        copy_config(&target.config_path, active).await?;
                        active
                    }
                    None => target.config_path.as_path(),
                };
                if !backend.unit_exists(&target).await? {
                    let executable = backend.layout().binary_path();
                    backend.create_unit(&target.unit, &executable, config).await?;
                }
                backend.launch(&target).await
            })
            .await
    }

    pub async fn stop(&self, raw_id: &str) -> Result<()> {
        let id = NodeId::parse(raw_id)?;
        let target = self.backend.resolve(&id);
        let unit = BoundUnit { backend: self.backend.as_ref(), target: &target };
        self.registry.stop(&id, &unit).await?;
        info!(node = %id, "node stopped");
        Ok(())
    }

    pub async fn status(&self, raw_id: &str) -> Result<NodeStatus> {
        let id = NodeId::parse(raw_id)?;
        let target = self.backend.resolve(&id);
        let unit = BoundUnit { backend: self.backend.as_ref(), target: &target };
        Ok(self.registry.status(&id, &unit).await)
    }

    pub async fn create_service_unit(&self, name: &str, executable: &Path, config: &Path) -> Result<()> {
        let id = NodeId::parse(name)?;
        self.backend.create_unit(id.as_str(), executable, config).await
    }

    pub fn ensure_installed(&self) -> InstallOutcome {
        self.provisioner.ensure_installed()
    }

    pub fn update(&self) -> InstallOutcome {
        self.provisioner.update()
    }

    pub fn is_downloading(&self) -> bool {
        self.provisioner.is_in_progress()
    }

    /// Best-effort teardown. Every step runs; failures are reported together.
    pub async fn reset(&self, credential: Option<&str>) -> Result<()> {
        let writer = writer_for(credential);
        let mut failures = Vec::new();

        let drained = self.registry.drain().await;
        failures.extend(drained.failures);

        let mut ids = drained.managed;
        for id in &self.reset_plan.node_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        let retired = join_all(ids.iter().map(|id| async move {
            let target = self.backend.resolve(id);
            (id, self.backend.retire(&target).await)
        }))
        .await;
        for (id, result) in retired {
            if let Err(err) = result {
                warn!(node = %id, error = %err, "could not retire node");
                failures.push(err);
            }
        }

        let plan = &self.reset_plan;
        if let Err(err) = writer.remove(&plan.install_dir).await {
            failures.push(err);
        }
        if let Some(active) = self.backend.active_config() {
            if let Err(err) = writer.remove(active).await {
                failures.push(err);
            }
        }
        failures.extend(remove_node_configs(&plan.config_dir, writer.as_ref()).await);
        if let Err(err) = self.store.remove_registry(&plan.registry_path, writer.as_ref()).await {
            failures.push(err);
        }

        match failures.len() {
            0 => {
                info!("reset complete");
                Ok(())
            }
            1 => Err(failures.remove(0)),
            _ => Err(BridgeError::Many(failures)),
        }
    }

    /// Terminate everything this process still owns.
    pub async fn shutdown(&self) {
        let drained = self.registry.drain().await;
        for err in drained.failures {
            warn!(error = %err, "worker did not terminate cleanly");
        }
    }
}

async fn copy_config(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BridgeError::write(parent, e))?;
    }
    match tokio::fs::copy(from, to).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(BridgeError::read(from, e)),
        Err(e) => Err(BridgeError::write(to, e)),
    }
}

async fn remove_node_configs(dir: &Path, writer: &dyn PrivilegedWriter) -> Vec<BridgeError> {
    let mut failures = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return failures,
        Err(e) => return vec![BridgeError::read(dir, e)],
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                failures.push(BridgeError::read(dir, e));
                break;
            }
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(NODE_CONFIG_PREFIX) && name.ends_with(".json") {
            if let Err(err) = writer.remove(&entry.path()).await {
                failures.push(err);
            }
        }
    }
    failures
}
