//! Abstraction over an external container CLI (`docker`, `podman`, ...).

use async_trait::async_trait;
use tokio::process::Command;

use crate::types::VolumeMount;
use crate::{ContainerError, Result};

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn binary(&self) -> &str;

    /// CLI flags (e.g. `-v host:container[:ro]`) for one mount.
    fn mount_flags(&self, mount: &VolumeMount) -> Vec<String>;

    /// Program + args that stop a running container by name.
    fn stop_command(&self, container_name: &str) -> (String, Vec<String>);

    /// Probe the runtime CLI, auto-starting it if the backend supports that and
    /// it isn't already up. Fatal (`ConfigurationError`-equivalent) if it never
    /// becomes reachable.
    async fn ensure_running(&self) -> Result<()>;

    /// Enumerate and stop containers whose name starts with `name_prefix`. Must
    /// degrade gracefully (return an empty list, not an error) when the runtime CLI
    /// itself is unavailable.
    async fn cleanup_orphans(&self, name_prefix: &str) -> Result<Vec<String>>;

    async fn is_running(&self, container_name: &str) -> bool;
}

/// `docker`/`podman`-shaped CLI runtime. Both share the same subcommand surface
/// (`ps`, `stop`, `run -v ...`), so one implementation covers either via
/// `Config::container_binary`.
#[derive(Clone, Debug)]
pub struct CliContainerRuntime {
    binary: String,
}

impl CliContainerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run_capture(&self, args: &[&str]) -> std::io::Result<(bool, String)> {
        let output = Command::new(&self.binary).args(args).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok((output.status.success(), stdout))
    }
}

#[async_trait]
impl ContainerRuntime for CliContainerRuntime {
    fn binary(&self) -> &str {
        &self.binary
    }

    fn mount_flags(&self, mount: &VolumeMount) -> Vec<String> {
        let mode = if mount.read_only { ":ro" } else { "" };
        vec![
            "-v".to_string(),
            format!(
                "{}:{}{}",
                mount.host_path.display(),
                mount.container_path.display(),
                mode
            ),
        ]
    }

    fn stop_command(&self, container_name: &str) -> (String, Vec<String>) {
        (
            self.binary.clone(),
            vec!["stop".to_string(), container_name.to_string()],
        )
    }

    async fn ensure_running(&self) -> Result<()> {
        match self.run_capture(&["info"]).await {
            Ok((true, _)) => Ok(()),
            Ok((false, _)) => Err(ContainerError::RuntimeUnavailable(format!(
                "`{} info` failed; is the container daemon running?",
                self.binary
            ))),
            Err(e) => Err(ContainerError::RuntimeUnavailable(format!(
                "`{}` binary not found: {e}",
                self.binary
            ))),
        }
    }

    async fn cleanup_orphans(&self, name_prefix: &str) -> Result<Vec<String>> {
        let Ok((true, stdout)) = self
            .run_capture(&["ps", "--format", "{{.Names}}"])
            .await
        else {
            // Runtime CLI unreachable: nothing to clean up, not a hard error.
            return Ok(Vec::new());
        };

        let orphans: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|n| n.starts_with(name_prefix))
            .map(str::to_string)
            .collect();

        let mut stopped = Vec::new();
        for name in &orphans {
            let (bin, args) = self.stop_command(name);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            if Command::new(&bin).args(&args).output().await.is_ok() {
                stopped.push(name.clone());
            }
        }
        Ok(stopped)
    }

    async fn is_running(&self, container_name: &str) -> bool {
        matches!(
            self.run_capture(&["inspect", "-f", "{{.State.Running}}", container_name])
                .await,
            Ok((true, out)) if out.trim() == "true"
        )
    }
}
