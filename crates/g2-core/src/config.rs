use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for the orchestrator host.
///
/// Loaded from `.env` plus process environment, using the option set described
/// in the system's external interface contract.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub assistant_name: String,
    pub assistant_has_own_number: bool,
    pub data_dir: PathBuf,
    pub main_group_folder: String,

    // Polling cadence
    pub poll_interval: Duration,
    pub ipc_poll_interval: Duration,
    pub scheduler_poll_interval: Duration,

    // Container execution
    pub container_binary: String,
    pub container_image: String,
    pub container_timeout: Duration,
    pub idle_timeout: Duration,
    pub container_max_output_size: u64,
    pub max_concurrent_containers: usize,
    /// Prefix used to recognize this system's own containers during orphan cleanup.
    pub container_name_prefix: String,

    // Scheduling
    pub timezone: String,

    // Mounts
    pub mount_allowlist_path: Option<PathBuf>,
    pub project_root: PathBuf,
    pub agent_runner_src: PathBuf,
    pub credentials_dir: Option<PathBuf>,

    // Secrets (read only by the container runner)
    pub secrets_file: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let assistant_name = env_str("ASSISTANT_NAME").unwrap_or_else(|| "G2".to_string());
        let assistant_has_own_number = env_bool("ASSISTANT_HAS_OWN_NUMBER").unwrap_or(false);

        let data_dir = env_path("DATA_DIR").unwrap_or_else(|| PathBuf::from("./data"));
        let main_group_folder =
            env_str("MAIN_GROUP_FOLDER").unwrap_or_else(|| "main".to_string());

        let poll_interval = Duration::from_millis(env_u64("POLL_INTERVAL").unwrap_or(3_000));
        let ipc_poll_interval =
            Duration::from_millis(env_u64("IPC_POLL_INTERVAL").unwrap_or(2_000));
        let scheduler_poll_interval =
            Duration::from_millis(env_u64("SCHEDULER_POLL_INTERVAL").unwrap_or(15_000));

        let container_binary =
            env_str("CONTAINER_BINARY").unwrap_or_else(|| "docker".to_string());
        let container_image = env_str("CONTAINER_IMAGE").ok_or_else(|| {
            Error::Config("CONTAINER_IMAGE environment variable is required".into())
        })?;

        let container_timeout =
            Duration::from_millis(env_u64("CONTAINER_TIMEOUT").unwrap_or(600_000));
        let idle_timeout = Duration::from_millis(env_u64("IDLE_TIMEOUT").unwrap_or(120_000));
        let container_max_output_size =
            env_u64("CONTAINER_MAX_OUTPUT_SIZE").unwrap_or(2 * 1024 * 1024);
        let max_concurrent_containers =
            env_usize("MAX_CONCURRENT_CONTAINERS").unwrap_or(4).max(1);

        let timezone = env_str("TZ")
            .filter(|tz| tz.parse::<chrono_tz::Tz>().is_ok())
            .unwrap_or_else(|| "UTC".to_string());

        let container_name_prefix =
            env_str("CONTAINER_NAME_PREFIX").unwrap_or_else(|| format!("{}-", assistant_name.to_lowercase()));

        let mount_allowlist_path = env_path("MOUNT_ALLOWLIST_PATH");
        let project_root = env_path("PROJECT_ROOT")
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        if let Some(allowlist) = &mount_allowlist_path {
            if allowlist.starts_with(&project_root) {
                return Err(Error::Config(
                    "MOUNT_ALLOWLIST_PATH must not live under the project root".into(),
                ));
            }
        }
        let agent_runner_src =
            env_path("AGENT_RUNNER_SRC").unwrap_or_else(|| project_root.join("agent-runner"));
        let credentials_dir = env_path("CREDENTIALS_DIR");
        let secrets_file = env_path("SECRETS_FILE");

        Ok(Self {
            assistant_name,
            assistant_has_own_number,
            data_dir,
            main_group_folder,
            poll_interval,
            ipc_poll_interval,
            scheduler_poll_interval,
            container_binary,
            container_image,
            container_timeout,
            idle_timeout,
            container_max_output_size,
            max_concurrent_containers,
            container_name_prefix,
            timezone,
            mount_allowlist_path,
            project_root,
            agent_runner_src,
            credentials_dir,
            secrets_file,
        })
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.data_dir.join("ipc")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store").join("messages.db")
    }

    pub fn group_ipc_dir(&self, folder: &str) -> PathBuf {
        self.ipc_dir().join(folder)
    }

    pub fn ipc_errors_dir(&self) -> PathBuf {
        self.ipc_dir().join("errors")
    }

    pub fn group_session_dir(&self, folder: &str) -> PathBuf {
        self.sessions_dir().join(folder)
    }

    /// Shared read-only directory for non-main groups, if the deployment has one.
    pub fn global_dir(&self) -> PathBuf {
        self.data_dir.join("global")
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_empty)
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotenv_does_not_override_existing_env() {
        let dir = std::env::temp_dir().join(format!("g2-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let env_path = dir.join(".env");
        std::fs::write(&env_path, "EXAMPLE_KEY=from_file\n").unwrap();

        env::set_var("EXAMPLE_KEY", "from_process");
        load_dotenv_if_present(&env_path);
        assert_eq!(env::var("EXAMPLE_KEY").unwrap(), "from_process");
        env::remove_var("EXAMPLE_KEY");
    }

    #[test]
    fn dotenv_strips_quotes() {
        let dir = std::env::temp_dir().join(format!("g2-config-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let env_path = dir.join(".env");
        std::fs::write(&env_path, "QUOTED_KEY=\"hello world\"\n").unwrap();

        env::remove_var("QUOTED_KEY");
        load_dotenv_if_present(&env_path);
        assert_eq!(env::var("QUOTED_KEY").unwrap(), "hello world");
        env::remove_var("QUOTED_KEY");
    }
}
