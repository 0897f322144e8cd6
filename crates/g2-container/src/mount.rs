//! Deterministic mount-set construction (§4.5) and the extra-mount allowlist.

use std::path::{Path, PathBuf};

use g2_core::config::Config;

use crate::types::{GroupMountSpec, VolumeMount};
use crate::{ContainerError, Result};

/// Loaded once at startup from `Config::mount_allowlist_path`. One allowed prefix
/// per non-empty, non-comment line. Lives outside any mount so a container can never
/// read or tamper with its own allowlist.
#[derive(Clone, Debug, Default)]
pub struct MountAllowlist {
    prefixes: Vec<PathBuf>,
}

impl MountAllowlist {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(ContainerError::Io)?;
        let prefixes = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(PathBuf::from)
            .collect();
        Ok(Self { prefixes })
    }

    pub fn allows(&self, path: &Path) -> bool {
        self.prefixes.iter().any(|p| path.starts_with(p))
    }
}

/// Builds the deterministic mount set for a group, and performs the one-time
/// filesystem preparation (`prepare`) those mounts assume exists.
pub struct MountBuilder {
    config: Config,
    allowlist: MountAllowlist,
}

impl MountBuilder {
    pub fn new(config: Config, allowlist: MountAllowlist) -> Self {
        Self { config, allowlist }
    }

    /// Performs all filesystem side effects `build_mounts` assumes are already in
    /// place: group/session/ipc directory creation and the settings snapshot. After
    /// this returns, `build_mounts` is pure.
    pub fn prepare(&self, group: &GroupMountSpec) -> Result<()> {
        let folder = &group.folder.0;

        std::fs::create_dir_all(self.config.group_session_dir(folder)).map_err(ContainerError::Io)?;
        std::fs::create_dir_all(self.config.group_ipc_dir(folder).join("messages"))
            .map_err(ContainerError::Io)?;
        std::fs::create_dir_all(self.config.group_ipc_dir(folder).join("tasks"))
            .map_err(ContainerError::Io)?;
        std::fs::create_dir_all(self.config.group_ipc_dir(folder).join("responses"))
            .map_err(ContainerError::Io)?;
        std::fs::create_dir_all(self.config.group_ipc_dir(folder).join("input"))
            .map_err(ContainerError::Io)?;

        if group.is_main {
            std::fs::create_dir_all(&self.config.project_root).map_err(ContainerError::Io)?;
        }

        let settings_path = self.config.group_session_dir(folder).join("settings.json");
        if !settings_path.exists() {
            std::fs::write(&settings_path, "{}\n").map_err(ContainerError::Io)?;
        }

        Ok(())
    }

    pub fn build_mounts(&self, group: &GroupMountSpec) -> Result<Vec<VolumeMount>> {
        let folder = &group.folder.0;
        let mut mounts = Vec::new();

        if group.is_main {
            mounts.push(VolumeMount::rw(&self.config.project_root, "/workspace"));
            mounts.push(VolumeMount::rw(
                self.config.group_session_dir(folder),
                format!("/workspace/groups/{folder}"),
            ));
        } else {
            mounts.push(VolumeMount::rw(
                self.config.group_session_dir(folder),
                "/workspace",
            ));
            let global = self.config.global_dir();
            if global.exists() {
                mounts.push(VolumeMount::ro(global, "/workspace/global"));
            }
        }

        mounts.push(VolumeMount::rw(
            self.config.group_session_dir(folder),
            "/root/.claude",
        ));
        mounts.push(VolumeMount::rw(
            self.config.group_ipc_dir(folder),
            "/ipc",
        ));
        mounts.push(VolumeMount::ro(
            &self.config.agent_runner_src,
            "/agent-runner",
        ));
        if let Some(creds) = &self.config.credentials_dir {
            if creds.exists() {
                mounts.push(VolumeMount::ro(creds, "/credentials"));
            }
        }

        for extra in &group.additional_mounts {
            if !self.allowlist.allows(&extra.host_path) {
                return Err(ContainerError::MountNotAllowed(extra.host_path.clone()));
            }
            mounts.push(VolumeMount {
                host_path: extra.host_path.clone(),
                container_path: extra.container_path.clone(),
                read_only: extra.read_only,
            });
        }

        Ok(mounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use g2_core::domain::GroupFolder;
    use std::time::Duration;

    fn test_config(dir: &Path) -> Config {
        Config {
            assistant_name: "G2".into(),
            assistant_has_own_number: false,
            data_dir: dir.join("data"),
            main_group_folder: "main".into(),
            poll_interval: Duration::from_secs(1),
            ipc_poll_interval: Duration::from_secs(1),
            scheduler_poll_interval: Duration::from_secs(1),
            container_binary: "docker".into(),
            container_image: "g2-agent".into(),
            container_timeout: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(120),
            container_max_output_size: 1024,
            max_concurrent_containers: 4,
            container_name_prefix: "g2-".into(),
            timezone: "UTC".into(),
            mount_allowlist_path: None,
            project_root: dir.join("project"),
            agent_runner_src: dir.join("agent-runner"),
            credentials_dir: None,
            secrets_file: None,
        }
    }

    #[test]
    fn main_group_mounts_project_root_and_its_own_folder_rw() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let builder = MountBuilder::new(cfg, MountAllowlist::default());
        let spec = GroupMountSpec {
            folder: GroupFolder("main".into()),
            is_main: true,
            additional_mounts: vec![],
        };
        builder.prepare(&spec).unwrap();
        let mounts = builder.build_mounts(&spec).unwrap();

        assert!(mounts
            .iter()
            .any(|m| m.container_path == Path::new("/workspace") && !m.read_only));
        assert!(mounts.iter().any(|m| !m.read_only
            && m.container_path == Path::new("/workspace/groups/main")));
    }

    #[test]
    fn non_main_group_does_not_mount_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let builder = MountBuilder::new(cfg, MountAllowlist::default());
        let spec = GroupMountSpec {
            folder: GroupFolder("other".into()),
            is_main: false,
            additional_mounts: vec![],
        };
        builder.prepare(&spec).unwrap();
        let mounts = builder.build_mounts(&spec).unwrap();

        assert!(!mounts.iter().any(|m| m.host_path == cfg_project_root(dir.path())));
    }

    fn cfg_project_root(dir: &Path) -> PathBuf {
        dir.join("project")
    }

    #[test]
    fn additional_mount_outside_allowlist_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let builder = MountBuilder::new(cfg, MountAllowlist::default());
        let spec = GroupMountSpec {
            folder: GroupFolder("other".into()),
            is_main: false,
            additional_mounts: vec![crate::types::AdditionalMount {
                host_path: PathBuf::from("/etc"),
                container_path: PathBuf::from("/etc-mount"),
                read_only: true,
            }],
        };
        builder.prepare(&spec).unwrap();
        let err = builder.build_mounts(&spec).unwrap_err();
        assert!(matches!(err, ContainerError::MountNotAllowed(_)));
    }
}
