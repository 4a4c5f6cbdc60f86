//! Device control through the `adb` command-line tool.
//!
//! Every operation shells out to `adb -s <serial> ...`. The capture backends
//! only talk to a device through [`DeviceBridge`], which can also be `Direct`
//! when the capture server is already reachable on the local port (a device
//! forwarded by some other process, or a test server).

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Remote path the capture server is pushed to.
pub const REMOTE_SERVER_PATH: &str = "/data/local/tmp/scrcpy-server.jar";

/// Abstract socket name the capture server listens on.
pub const SOCKET_NAME: &str = "scrcpy";

/// `adb` invocations for one device.
#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb_path: PathBuf,
    device_id: String,
}

impl AdbBridge {
    pub fn new(adb_path: impl Into<PathBuf>, device_id: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb_path
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.adb_path);
        cmd.arg("-s").arg(&self.device_id).kill_on_drop(true);
        cmd
    }

    /// Run `adb -s <serial> <args>` to completion and return stdout.
    pub async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.adb_path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            bail!(
                "adb {} failed ({}): {}{}",
                args.join(" "),
                output.status,
                stderr.trim(),
                stdout.trim()
            );
        }
        Ok(output.stdout)
    }

    /// Push the capture server to [`REMOTE_SERVER_PATH`].
    pub async fn push(&self, local: &Path) -> Result<()> {
        let local = local
            .to_str()
            .with_context(|| format!("Non UTF-8 server path: {}", local.display()))?;
        self.run(&["push", local, REMOTE_SERVER_PATH])
            .await
            .context("adb push failed")?;
        tracing::debug!("Capture server pushed to {}", self.device_id);
        Ok(())
    }

    /// Replace all forwards of this device with `tcp:<port> -> localabstract:scrcpy`.
    pub async fn forward(&self, port: u16) -> Result<()> {
        if let Err(e) = self.run(&["forward", "--remove-all"]).await {
            tracing::debug!("forward --remove-all: {}", e);
        }
        let local = format!("tcp:{}", port);
        let remote = format!("localabstract:{}", SOCKET_NAME);
        self.run(&["forward", &local, &remote])
            .await
            .context("adb forward failed")?;
        tracing::debug!("Forward established: {} -> {}", local, remote);
        Ok(())
    }

    /// Remove the forward for `port`. Failures are only logged.
    pub async fn remove_forward(&self, port: u16) {
        let local = format!("tcp:{}", port);
        if let Err(e) = self.run(&["forward", "--remove", &local]).await {
            tracing::debug!("Removing forward {} failed: {}", local, e);
        }
    }

    /// Start `adb shell <command>` in the background. Output is discarded.
    pub fn spawn_shell(&self, command: &str) -> Result<Child> {
        self.command()
            .arg("shell")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn adb shell")
    }

    /// Start `adb shell <args>` with stdout piped back to the caller.
    pub fn spawn_shell_piped(&self, args: &[&str]) -> Result<Child> {
        self.command()
            .arg("shell")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn adb shell")
    }

    /// Run `adb exec-out <args>` and return its binary stdout.
    pub async fn exec_out(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("exec-out");
        full.extend_from_slice(args);
        self.run(&full).await
    }
}

/// How a capture backend reaches the device.
#[derive(Debug, Clone)]
pub enum DeviceBridge {
    /// Manage the device through `adb`.
    Adb(AdbBridge),
    /// The capture server is already listening on the local port; no device
    /// commands are issued.
    Direct,
}

impl DeviceBridge {
    pub fn adb(adb_path: impl Into<PathBuf>, device_id: impl Into<String>) -> Self {
        DeviceBridge::Adb(AdbBridge::new(adb_path, device_id))
    }

    /// The underlying adb bridge, for backends that cannot work without one.
    pub fn require_adb(&self) -> Result<&AdbBridge> {
        match self {
            DeviceBridge::Adb(adb) => Ok(adb),
            DeviceBridge::Direct => bail!("this capture backend requires an adb bridge"),
        }
    }

    pub async fn push_server(&self, local: &Path) -> Result<()> {
        match self {
            DeviceBridge::Adb(adb) => adb.push(local).await,
            DeviceBridge::Direct => Ok(()),
        }
    }

    pub async fn setup_forward(&self, port: u16) -> Result<()> {
        match self {
            DeviceBridge::Adb(adb) => adb.forward(port).await,
            DeviceBridge::Direct => Ok(()),
        }
    }

    pub async fn remove_forward(&self, port: u16) {
        if let DeviceBridge::Adb(adb) = self {
            adb.remove_forward(port).await;
        }
    }

    /// Launch the capture server. `None` for `Direct`.
    pub fn launch_server(&self, command: &str) -> Result<Option<Child>> {
        match self {
            DeviceBridge::Adb(adb) => {
                tracing::debug!("Launching capture server: {}", command);
                adb.spawn_shell(command).map(Some)
            }
            DeviceBridge::Direct => Ok(None),
        }
    }
}
