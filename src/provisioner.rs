//! Background download and install of the worker binary.
//!
//! At most one install or update task exists per process. The in-progress
//! flag is taken with a compare-and-set before the task is spawned and is
//! released by a guard the task owns, so it goes back to idle exactly once
//! whether the task succeeds, fails or panics.
use std::{
    fmt,
    io::{self, Cursor},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use tokio::{runtime::Handle, sync::Notify};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyPresent,
    Started,
    InProgress,
}

/// Fetch the worker and place it at `dest`.
#[async_trait]
pub trait ArtifactInstaller: Send + Sync + fmt::Debug {
    async fn install(&self, dest: &Path) -> anyhow::Result<()>;
}

const ARTIFACT_BASE: &str = "https://artifact.onwalk.net/xray-core/v25.3.6";

/// Default release archive for the build target.
pub fn default_download_url() -> String {
    let archive = if cfg!(target_os = "windows") {
        "Xray-windows-64.zip"
    } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "Xray-macos-arm64-v8a.zip"
    } else if cfg!(target_os = "macos") {
        "Xray-macos-64.zip"
    } else {
        "Xray-linux-64.zip"
    };
    format!("{ARTIFACT_BASE}/{archive}")
}

/// Downloads a zip release and extracts one executable from it.
#[derive(Debug, Clone)]
pub struct HttpZipInstaller {
    client: reqwest::Client,
    url: String,
    entry: String,
}

impl HttpZipInstaller {
    pub fn new(url: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            entry: entry.into(),
        }
    }
}

#[async_trait]
impl ArtifactInstaller for HttpZipInstaller {
    async fn install(&self, dest: &Path) -> anyhow::Result<()> {
        info!(url = %self.url, "downloading worker archive");
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            bail!("download of {} failed with status {}", self.url, response.status());
        }
        let archive = response.bytes().await?;

        let entry = self.entry.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_entry(&archive, &entry, &dest))
            .await
            .map_err(|e| anyhow!("extract task failed: {e}"))?
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Copy the archive member whose base name is `entry` (ASCII
/// case-insensitive) to `dest`, atomically and executable.
pub fn extract_entry(archive: &[u8], entry: &str, dest: &Path) -> anyhow::Result<()> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).context("not a zip archive")?;
    let name = zip
        .file_names()
        .find(|name| base_name(name).eq_ignore_ascii_case(entry))
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("`{entry}` not found in archive"))?;
    let mut member = zip.by_name(&name)?;

    let dir = dest
        .parent()
        .ok_or_else(|| anyhow!("install path {} has no parent", dest.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    io::copy(&mut member, &mut staged)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))?;
    }

    staged
        .persist(dest)
        .with_context(|| format!("install {}", dest.display()))?;
    info!(path = %dest.display(), "worker binary installed");
    Ok(())
}

#[derive(Debug, Default)]
struct ProvisionState {
    in_progress: AtomicBool,
    idle: Notify,
}

/// Held by the running task; dropping it returns the state to idle.
struct InProgressGuard(Arc<ProvisionState>);

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.0.in_progress.store(false, Ordering::Release);
        self.0.idle.notify_waiters();
    }
}

#[derive(Debug)]
pub struct Provisioner {
    runtime: Handle,
    dest: PathBuf,
    installer: Arc<dyn ArtifactInstaller>,
    state: Arc<ProvisionState>,
}

impl Provisioner {
    pub fn new(runtime: Handle, dest: PathBuf, installer: Arc<dyn ArtifactInstaller>) -> Self {
        Self {
            runtime,
            dest,
            installer,
            state: Arc::default(),
        }
    }

    pub fn install_path(&self) -> &Path {
        &self.dest
    }

    /// Start an install unless the binary is already there.
    pub fn ensure_installed(&self) -> InstallOutcome {
        if self.dest.is_file() {
            return InstallOutcome::AlreadyPresent;
        }
        self.begin("install")
    }

    /// Start a reinstall regardless of what is on disk.
    pub fn update(&self) -> InstallOutcome {
        self.begin("update")
    }

    pub fn is_in_progress(&self) -> bool {
        self.state.in_progress.load(Ordering::Acquire)
    }

    /// Resolve once no install or update is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_in_progress() {
                return;
            }
            notified.await;
        }
    }

    fn begin(&self, kind: &'static str) -> InstallOutcome {
        if self
            .state
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(kind, "worker download already in progress");
            return InstallOutcome::InProgress;
        }
        let guard = InProgressGuard(self.state.clone());
        let installer = self.installer.clone();
        let dest = self.dest.clone();

        self.runtime.spawn(async move {
            let _guard = guard;
            match installer.install(&dest).await {
                Ok(()) => info!(kind, path = %dest.display(), "worker {kind} finished"),
                Err(err) => error!(kind, error = %format!("{err:#}"), "worker {kind} failed"),
            }
        });
        info!(kind, "worker download started");
        InstallOutcome::Started
    }
}
