//! Writing files that may need elevated rights.
//!
//! The sudo path never goes through a shell: content lands in a temp file
//! owned by the current user, then `sudo install -m 0644` puts it in place
//! readable by the unprivileged worker and host. The credential only ever
//! travels over sudo's stdin.
use std::{
    ffi::OsStr,
    fmt,
    io::{ErrorKind, Write},
    path::Path,
    process::Stdio,
};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{
    error::{BridgeError, Result},
    platform::command::{command, describe},
};

#[async_trait]
pub trait PrivilegedWriter: Send + Sync + fmt::Debug {
    /// Write `content` to `path`, creating parent directories.
    async fn write(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Remove a file or a directory tree. A missing path is not an error.
    async fn remove(&self, path: &Path) -> Result<()>;
}

/// Pick the writer for an optional credential. An empty credential, or any
/// credential on Windows, means plain filesystem access.
pub fn writer_for(credential: Option<&str>) -> Box<dyn PrivilegedWriter> {
    match credential {
        Some(secret) if !secret.is_empty() && !cfg!(windows) => {
            Box::new(SudoWriter::new(secret.to_string()))
        }
        _ => Box::new(DirectWriter),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DirectWriter;

#[async_trait]
impl PrivilegedWriter for DirectWriter {
    async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BridgeError::write(parent, e))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| BridgeError::write(path, e))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BridgeError::remove(path, e)),
        };
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match removed {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(BridgeError::remove(path, e)),
            _ => Ok(()),
        }
    }
}

/// Mode of every file written through sudo.
const PRIVILEGED_FILE_MODE: &str = "0644";

/// Elevates through `sudo -S`, feeding the credential on stdin.
pub struct SudoWriter {
    program: String,
    credential: String,
}

impl fmt::Debug for SudoWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SudoWriter")
            .field("program", &self.program)
            .field("credential", &"<redacted>")
            .finish()
    }
}

impl SudoWriter {
    pub fn new(credential: String) -> Self {
        Self::with_program("sudo", credential)
    }

    /// Elevate through `program`, which must accept sudo's `-S -p ""`.
    pub fn with_program(program: impl Into<String>, credential: String) -> Self {
        Self {
            program: program.into(),
            credential,
        }
    }

    async fn sudo(&self, args: &[&OsStr]) -> Result<()> {
        let mut argv: Vec<&OsStr> = vec![OsStr::new("-S"), OsStr::new("-p"), OsStr::new("")];
        argv.extend_from_slice(args);
        let line = describe(&self.program, args);
        debug!(command = %line, "running privileged command");

        let mut child = command(&self.program, &argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BridgeError::Spawn { command: line.clone(), source })?;

        if let Some(mut stdin) = child.stdin.take() {
            // sudo may not read stdin at all when credentials are cached
            let _ = stdin.write_all(self.credential.as_bytes()).await;
            let _ = stdin.write_all(b"\n").await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| BridgeError::Spawn { command: line.clone(), source })?;
        if output.status.success() {
            return Ok(());
        }
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(BridgeError::Command {
            command: line,
            output: combined.trim().to_string(),
        })
    }
}

#[async_trait]
impl PrivilegedWriter for SudoWriter {
    async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut staged = tempfile::NamedTempFile::new().map_err(|e| BridgeError::write(path, e))?;
        staged
            .write_all(content)
            .and_then(|_| staged.flush())
            .map_err(|e| BridgeError::write(staged.path(), e))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.sudo(&[OsStr::new("mkdir"), OsStr::new("-p"), parent.as_os_str()])
                .await?;
        }
        self.sudo(&[
            OsStr::new("install"),
            OsStr::new("-m"),
            OsStr::new(PRIVILEGED_FILE_MODE),
            staged.path().as_os_str(),
            path.as_os_str(),
        ])
        .await
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.sudo(&[OsStr::new("rm"), OsStr::new("-rf"), path.as_os_str()])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_credential_selects_direct_writer() {
        assert_eq!(format!("{:?}", writer_for(None)), "DirectWriter");
        assert_eq!(format!("{:?}", writer_for(Some(""))), "DirectWriter");
    }

    #[cfg(unix)]
    #[test]
    fn credential_selects_sudo_and_is_never_printed() {
        let writer = writer_for(Some("hunter2"));
        let shown = format!("{writer:?}");
        assert!(shown.starts_with("SudoWriter"));
        assert!(!shown.contains("hunter2"));
    }

    #[tokio::test]
    async fn direct_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/node.json");
        DirectWriter.write(&path, b"{}").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[tokio::test]
    async fn direct_remove_handles_files_dirs_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("install");
        std::fs::create_dir_all(tree.join("nested")).unwrap();
        std::fs::write(tree.join("nested/xray"), b"bin").unwrap();
        let file = dir.path().join("vpn_nodes.json");
        std::fs::write(&file, b"[]").unwrap();

        DirectWriter.remove(&tree).await.unwrap();
        DirectWriter.remove(&file).await.unwrap();
        DirectWriter.remove(&dir.path().join("never-existed")).await.unwrap();
        assert!(!tree.exists());
        assert!(!file.exists());
    }

    /// A `sudo` stand-in: records the stdin line and the arguments, drops
    /// `-S -p ""` and runs the rest unprivileged.
    #[cfg(unix)]
    fn fake_sudo(dir: &Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let d = dir.display();
        let path = dir.join("sudo");
        let script = format!(
            r#"#!/bin/sh
IFS= read -r secret
printf '%s\n' "$secret" >> "{d}/stdin.log"
echo "$*" >> "{d}/argv.log"
shift 3
exec "$@"
"#
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sudo_write_is_world_readable_and_credential_stays_on_stdin() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let sudo = fake_sudo(dir.path());
        let writer = SudoWriter::with_program(sudo.to_string_lossy(), "hunter2".into());
        let target = dir.path().join("system/etc/vpn_nodes.json");

        writer.write(&target, b"[]").await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "[]");
        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);

        writer.remove(&target.parent().unwrap().to_path_buf()).await.unwrap();
        assert!(!target.exists());

        let stdin = std::fs::read_to_string(dir.path().join("stdin.log")).unwrap();
        assert_eq!(stdin.lines().collect::<Vec<_>>(), ["hunter2"; 3]);
        let argv = std::fs::read_to_string(dir.path().join("argv.log")).unwrap();
        assert!(!argv.contains("hunter2"));
        assert!(argv.lines().nth(1).unwrap().starts_with("-S -p  install -m 0644 "), "{argv}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_sudo_reports_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SudoWriter::with_program("false", "hunter2".into());
        let err = writer.remove(&dir.path().join("x")).await.unwrap_err();
        assert!(err.to_string().starts_with("`false rm -rf "), "{err}");
        assert!(!err.to_string().contains("hunter2"));
    }
}
