use std::{collections::HashMap, fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use g2_core::domain::{GroupFolder, Jid};

/// A single bind mount synthesized by `MountBuilder`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn rw(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: false,
        }
    }

    pub fn ro(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: true,
        }
    }
}

/// An operator-requested extra mount (`containerConfig.additionalMounts`), prior to
/// allowlist validation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AdditionalMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

/// What `MountBuilder` needs to know about a group to build its mount set.
#[derive(Clone, Debug)]
pub struct GroupMountSpec {
    pub folder: GroupFolder,
    pub is_main: bool,
    pub additional_mounts: Vec<AdditionalMount>,
}

/// Timeout knobs for one run, already resolved against any group-level override.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutConfig {
    pub container_timeout: Duration,
    pub idle_timeout: Duration,
}

impl TimeoutConfig {
    /// `max(containerTimeout, idleTimeout + 30s)`, per the hard-timeout contract.
    pub fn hard_timeout(&self) -> Duration {
        self.container_timeout
            .max(self.idle_timeout + Duration::from_secs(30))
    }
}

/// Secrets read from the local env file, serialized once into the stdin payload.
/// Never logged: the custom `Debug` impl below redacts every value.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secrets(pub HashMap<String, String>);

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

pub const SECRET_KEYS: &[&str] = &[
    "CLAUDE_CODE_OAUTH_TOKEN",
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_USE_BEDROCK",
    "AWS_REGION",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
];

/// The JSON document written to the container's stdin, followed by EOF.
#[derive(Clone, Serialize)]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "groupFolder")]
    pub group_folder: String,
    #[serde(rename = "chatJid")]
    pub chat_jid: String,
    #[serde(rename = "isMain")]
    pub is_main: bool,
    #[serde(rename = "isScheduledTask")]
    pub is_scheduled_task: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Secrets>,
}

impl fmt::Debug for ContainerInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerInput")
            .field("prompt_len", &self.prompt.len())
            .field("session_id", &self.session_id)
            .field("group_folder", &self.group_folder)
            .field("chat_jid", &self.chat_jid)
            .field("is_main", &self.is_main)
            .field("is_scheduled_task", &self.is_scheduled_task)
            .field("secrets", &self.secrets.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ContainerInput {
    pub fn new(prompt: String, folder: &GroupFolder, chat_jid: &Jid, is_main: bool) -> Self {
        Self {
            prompt,
            session_id: None,
            group_folder: folder.0.clone(),
            chat_jid: chat_jid.0.clone(),
            is_main,
            is_scheduled_task: false,
            secrets: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
}

/// The final outcome of a container run, per the §4.6 outcome table.
#[derive(Clone, Debug)]
pub struct ContainerOutcome {
    pub status: RunStatus,
    pub result: Option<String>,
    pub new_session_id: Option<String>,
    pub error: Option<String>,
}

impl ContainerOutcome {
    pub fn success(result: Option<String>, new_session_id: Option<String>) -> Self {
        Self {
            status: RunStatus::Success,
            result,
            new_session_id,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.into()),
        }
    }
}
