//! Synchronous façade used by the C ABI and the CLI.
//!
//! Every call blocks on the bridge's own runtime and answers with the
//! sentinel strings the host understands: `success`, `info:…` or
//! `error:<detail>`.
use std::{
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

use crate::{
    config::BridgeConfig,
    controller::{NodeController, ResetPlan},
    error::Result,
    logger::{Telemetry, init_tracing},
    node::{NodeId, NodeStatus},
    persistence::ConfigWrite,
    platform::backend_for,
    provisioner::{ArtifactInstaller, HttpZipInstaller, InstallOutcome, Provisioner},
    tray::{TrayRelay, TraySignal, WindowProbe},
};

pub const SUCCESS: &str = "success";
pub const DOWNLOAD_STARTED: &str = "info:download started";
pub const DOWNLOAD_IN_PROGRESS: &str = "info:downloading in background";
pub const UNKNOWN_ACTION: &str = "error:unknown action";

fn error_reply(err: impl std::fmt::Display) -> String {
    format!("error:{err}")
}

fn reply(result: Result<()>) -> String {
    match result {
        Ok(()) => SUCCESS.to_string(),
        Err(err) => error_reply(err),
    }
}

fn install_reply(outcome: InstallOutcome) -> String {
    match outcome {
        InstallOutcome::AlreadyPresent => SUCCESS,
        InstallOutcome::Started => DOWNLOAD_STARTED,
        InstallOutcome::InProgress => DOWNLOAD_IN_PROGRESS,
    }
    .to_string()
}

pub struct Bridge {
    config: BridgeConfig,
    controller: NodeController,
    telemetry: Telemetry,
    tray: Mutex<Option<TrayRelay>>,
    // declared last so it is dropped after everything spawned on it
    runtime: Runtime,
}

impl Bridge {
    /// Configuration from the environment, logging initialised.
    pub fn from_env() -> anyhow::Result<Self> {
        let config = BridgeConfig::from_env()?;
        init_tracing(&config.log_dir, &config.log_level, config.log_to_stdout)?;
        Self::new(config)
    }

    pub fn new(config: BridgeConfig) -> anyhow::Result<Self> {
        let installer = Arc::new(HttpZipInstaller::new(
            config.download_url.clone(),
            config.binary_name.clone(),
        ));
        Self::with_installer(config, installer)
    }

    pub fn with_installer(config: BridgeConfig, installer: Arc<dyn ArtifactInstaller>) -> anyhow::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("xnode-worker")
            .enable_all()
            .build()
            .context("failed to build bridge runtime")?;

        let layout = config.layout();
        let backend = backend_for(config.backend, layout.clone());
        let node_ids = match &config.reset_nodes {
            Some(raw) => raw
                .iter()
                .filter_map(|id| match NodeId::parse(id) {
                    Ok(id) => Some(id),
                    Err(err) => {
                        warn!(error = %err, "ignoring reset node");
                        None
                    }
                })
                .collect(),
            None => backend.default_node_ids(),
        };
        let plan = ResetPlan {
            node_ids,
            install_dir: layout.install_dir.clone(),
            config_dir: layout.config_dir.clone(),
            registry_path: config.registry_path.clone(),
        };
        let provisioner = Provisioner::new(runtime.handle().clone(), layout.binary_path(), installer);
        let controller = NodeController::new(backend, provisioner, plan);
        info!(backend = %config.backend, install = %layout.install_dir.display(), "bridge ready");

        Ok(Self {
            config,
            controller,
            telemetry: Telemetry::new(),
            tray: Mutex::new(None),
            runtime,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    fn run<F, Fut, T>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.runtime.block_on(self.telemetry.instrument(name, op))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_config_files(
        &self,
        worker_config_path: &str,
        worker_config: &str,
        descriptor_path: &str,
        descriptor: &str,
        registry_path: &str,
        entries: &str,
        credential: Option<&str>,
    ) -> String {
        let request = ConfigWrite {
            worker_config_path: Path::new(worker_config_path),
            worker_config,
            descriptor_path: Path::new(descriptor_path),
            descriptor,
            registry_path: Path::new(registry_path),
            entries,
        };
        reply(self.run("write_config_files", || async {
            self.controller.write_configs(&request, credential).await.map(|_| ())
        }))
    }

    pub fn start_node(&self, id: &str) -> String {
        reply(self.run("start_node", || self.controller.start(id)))
    }

    pub fn stop_node(&self, id: &str) -> String {
        reply(self.run("stop_node", || self.controller.stop(id)))
    }

    /// 1 running, 0 stopped, -1 when the state could not be determined.
    pub fn check_node_status(&self, id: &str) -> i32 {
        self.run("check_node_status", || self.controller.status(id))
            .unwrap_or(NodeStatus::Unknown)
            .code()
    }

    pub fn init_worker_binary(&self) -> String {
        install_reply(self.controller.ensure_installed())
    }

    pub fn update_worker_binary(&self) -> String {
        install_reply(self.controller.update())
    }

    pub fn is_downloading(&self) -> i32 {
        i32::from(self.controller.is_downloading())
    }

    /// Block until no install or update is running.
    pub fn wait_for_download(&self) {
        self.runtime.block_on(self.controller.provisioner().wait_idle());
    }

    pub fn reset_all(&self, credential: Option<&str>) -> String {
        reply(self.run("reset_all", || self.controller.reset(credential)))
    }

    pub fn create_service_unit(&self, name: &str, executable: &str, config: &str) -> String {
        reply(self.run("create_service_unit", || {
            self.controller
                .create_service_unit(name, Path::new(executable), Path::new(config))
        }))
    }

    /// Dispatch by action name; both the snake_case names and the host's
    /// legacy camelCase names are accepted.
    pub fn perform_action(&self, action: &str, credential: Option<&str>) -> String {
        match action {
            "init_worker_binary" | "initXray" => self.init_worker_binary(),
            "update_worker_binary" | "updateXrayCore" => self.update_worker_binary(),
            "is_downloading" | "isXrayDownloading" => self.is_downloading().to_string(),
            "reset_all" | "resetXrayAndConfig" => self.reset_all(credential),
            _ => UNKNOWN_ACTION.to_string(),
        }
    }

    /// Start (or restart) the tray relay.
    pub fn init_tray(&self, probe: Option<Arc<dyn WindowProbe>>) -> String {
        let relay = TrayRelay::spawn(
            self.runtime.handle(),
            probe,
            Duration::from_millis(self.config.tray_poll_ms),
        );
        let mut tray = self.tray.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *tray = Some(relay);
        SUCCESS.to_string()
    }

    pub fn tray_signal(&self, signal: &str) -> String {
        let Ok(signal) = TraySignal::from_str(signal.trim()) else {
            return error_reply(format!("unknown tray signal `{signal}`"));
        };
        let tray = self.tray.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match tray.as_ref() {
            Some(relay) if relay.is_running() => {
                relay.signal(signal);
                SUCCESS.to_string()
            }
            Some(_) => error_reply("tray not running"),
            None => error_reply("tray not initialised"),
        }
    }

    /// `show`, `hide`, `quit`, or empty when nothing is pending.
    pub fn next_tray_intent(&self) -> String {
        let tray = self.tray.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tray.as_ref()
            .and_then(TrayRelay::next_intent)
            .map(|intent| intent.to_string())
            .unwrap_or_default()
    }

    /// Block the calling thread until Ctrl-C.
    pub fn wait_for_interrupt(&self) -> std::io::Result<()> {
        self.runtime.block_on(tokio::signal::ctrl_c())
    }

    /// Stop the tray relay and terminate owned workers.
    pub fn shutdown(&self) {
        if let Some(relay) = self
            .tray
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            relay.signal(TraySignal::Quit);
        }
        self.runtime.block_on(self.controller.shutdown());
    }
}
