//! Gateway configuration loaded from TOML.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Path of the guest agent binary inside the container image.
pub const DEFAULT_AGENT_PATH: &str = "/usr/bin/containerssh-agent";

/// Lowest Docker Engine API version the gateway will talk to.
pub const MIN_DOCKER_API_VERSION: (usize, usize) = (1, 24);

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// How long live connections get to tear down their containers on shutdown
    pub shutdown_timeout_secs: u64,

    /// Client authentication
    pub auth: AuthConfig,

    /// Container backend
    pub docker: DockerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("sshbox");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key_path: data_dir.join("host_key"),
            shutdown_timeout_secs: 30,
            auth: AuthConfig {
                authorized_keys: data_dir.join("authorized_keys"),
            },
            docker: DockerConfig::default(),
        }
    }
}

/// Public key authentication settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// OpenSSH authorized_keys file listing the keys allowed to connect.
    pub authorized_keys: PathBuf,
}

/// Everything the connection handler needs to drive the container backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub connection: DockerConnectionConfig,
    pub execution: DockerExecutionConfig,
    pub timeouts: DockerTimeoutConfig,
}

/// Where the Docker daemon lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConnectionConfig {
    /// Daemon address: `unix:///var/run/docker.sock`, `tcp://host:2375` or `http://host:2375`
    pub host: String,
}

impl Default for DockerConnectionConfig {
    fn default() -> Self {
        Self {
            host: "unix:///var/run/docker.sock".to_string(),
        }
    }
}

/// How SSH channels map onto containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One container per SSH connection; every channel is an exec inside it.
    #[default]
    Connection,
    /// One container per SSH session channel; the program is the container's main process.
    Session,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Connection => f.write_str("connection"),
            ExecutionMode::Session => f.write_str("session"),
        }
    }
}

/// When to pull the container image before creating a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImagePullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

/// Container execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerExecutionConfig {
    /// Execution mode (connection or session)
    pub mode: ExecutionMode,

    /// Image used for every container
    pub image: String,

    /// Pull policy for `image`
    pub image_pull_policy: ImagePullPolicy,

    /// Main process of connection-mode containers while channels come and go
    pub idle_command: Vec<String>,

    /// Program started for shell requests
    pub shell_command: Vec<String>,

    /// Location of the guest agent inside the image
    pub agent_path: String,

    /// Run without the guest agent (signals and the default idle command stop working)
    pub disable_agent: bool,

    /// Subsystem name -> program (e.g. sftp)
    pub subsystems: BTreeMap<String, String>,

    /// Extra environment variables for every program
    pub env: BTreeMap<String, String>,

    /// Working directory for programs; the image default when unset
    pub working_dir: Option<String>,

    /// Container security configuration
    pub container_security: ContainerSecurityConfig,
}

/// The built-in idle command. It relies on the guest agent acting as init.
pub fn default_idle_command() -> Vec<String> {
    [DEFAULT_AGENT_PATH, "wait-signal", "--signal", "INT", "--signal", "TERM"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for DockerExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Connection,
            image: "containerssh/containerssh-guest-image".to_string(),
            image_pull_policy: ImagePullPolicy::IfNotPresent,
            idle_command: default_idle_command(),
            shell_command: vec!["/bin/bash".to_string()],
            agent_path: DEFAULT_AGENT_PATH.to_string(),
            disable_agent: false,
            subsystems: BTreeMap::from([(
                "sftp".to_string(),
                "/usr/lib/openssh/sftp-server".to_string(),
            )]),
            env: BTreeMap::new(),
            working_dir: None,
            container_security: ContainerSecurityConfig::default(),
        }
    }
}

impl DockerExecutionConfig {
    /// True when the idle command is still the built-in one.
    ///
    /// Explicit comparison against [`default_idle_command`]; anything else that
    /// should count as "still default" must be added here deliberately.
    pub fn idle_command_is_default(&self) -> bool {
        self.idle_command == default_idle_command()
    }
}

/// Container security settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSecurityConfig {
    /// Drop all Linux capabilities
    pub cap_drop_all: bool,

    /// Capabilities to add back (if cap_drop_all is true)
    #[serde(default)]
    pub cap_add: Vec<String>,

    /// Enable no-new-privileges
    pub no_new_privileges: bool,

    /// Use read-only root filesystem
    pub readonly_rootfs: bool,

    /// Memory limit (e.g., "2g")
    pub memory_limit: Option<String>,

    /// CPU quota (e.g., "1.5" for 1.5 CPUs)
    pub cpu_limit: Option<f64>,
}

impl Default for ContainerSecurityConfig {
    fn default() -> Self {
        Self {
            cap_drop_all: true,
            cap_add: vec![
                // Minimal caps needed for normal operation
                "CHOWN".to_string(),
                "DAC_OVERRIDE".to_string(),
                "FOWNER".to_string(),
                "SETGID".to_string(),
                "SETUID".to_string(),
            ],
            no_new_privileges: true,
            readonly_rootfs: false, // Many tools need writable /tmp, /var, etc.
            memory_limit: Some("2g".to_string()),
            cpu_limit: Some(1.0),
        }
    }
}

/// Backend timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerTimeoutConfig {
    pub container_start_secs: u64,
    pub container_stop_secs: u64,
    pub command_start_secs: u64,
    pub signal_secs: u64,
    pub window_secs: u64,
    pub http_secs: u64,
}

impl Default for DockerTimeoutConfig {
    fn default() -> Self {
        Self {
            container_start_secs: 60,
            container_stop_secs: 60,
            command_start_secs: 60,
            signal_secs: 60,
            window_secs: 60,
            http_secs: 15,
        }
    }
}

impl DockerTimeoutConfig {
    pub fn container_start(&self) -> Duration {
        Duration::from_secs(self.container_start_secs)
    }

    pub fn container_stop(&self) -> Duration {
        Duration::from_secs(self.container_stop_secs)
    }

    pub fn command_start(&self) -> Duration {
        Duration::from_secs(self.command_start_secs)
    }

    pub fn signal(&self) -> Duration {
        Duration::from_secs(self.signal_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn http(&self) -> Duration {
        Duration::from_secs(self.http_secs)
    }
}

impl DockerConfig {
    /// Check field ranges and per-mode requirements.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let host = self.connection.host.trim();
        if host.is_empty() {
            return Err(ConfigError::missing("docker.connection.host"));
        }
        if !["unix://", "tcp://", "http://"]
            .iter()
            .any(|scheme| host.starts_with(scheme))
        {
            return Err(ConfigError::invalid(
                "docker.connection.host",
                format!("unsupported scheme in {host:?} (expected unix://, tcp:// or http://)"),
            ));
        }

        let exec = &self.execution;
        if exec.image.trim().is_empty() {
            return Err(ConfigError::missing("docker.execution.image"));
        }
        if exec.shell_command.is_empty() || exec.shell_command[0].is_empty() {
            return Err(ConfigError::missing("docker.execution.shell_command"));
        }
        if exec.mode == ExecutionMode::Connection
            && (exec.idle_command.is_empty() || exec.idle_command[0].is_empty())
        {
            return Err(ConfigError::invalid(
                "docker.execution.idle_command",
                "required in connection mode",
            ));
        }
        if !exec.disable_agent && exec.agent_path.trim().is_empty() {
            return Err(ConfigError::invalid(
                "docker.execution.agent_path",
                "required unless disable_agent is set",
            ));
        }
        for (name, program) in &exec.subsystems {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "docker.execution.subsystems",
                    "subsystem names must not be empty",
                ));
            }
            if program.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("docker.execution.subsystems.{name}"),
                    "program must not be empty",
                ));
            }
        }

        let security = &exec.container_security;
        if let Some(ref memory) = security.memory_limit {
            crate::docker::parse_memory_limit(memory).map_err(|e| {
                ConfigError::invalid("docker.execution.container_security.memory_limit", e)
            })?;
        }
        if let Some(cpu) = security.cpu_limit {
            if !(cpu > 0.0) {
                return Err(ConfigError::invalid(
                    "docker.execution.container_security.cpu_limit",
                    "must be greater than zero",
                ));
            }
        }

        let t = &self.timeouts;
        for (field, value) in [
            ("docker.timeouts.container_start_secs", t.container_start_secs),
            ("docker.timeouts.container_stop_secs", t.container_stop_secs),
            ("docker.timeouts.command_start_secs", t.command_start_secs),
            ("docker.timeouts.signal_secs", t.signal_secs),
            ("docker.timeouts.window_secs", t.window_secs),
            ("docker.timeouts.http_secs", t.http_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        Ok(())
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the whole file, including the docker section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid("listen_addr", e.to_string()))?;
        self.docker.validate()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create host key directory: {}", parent.display())
            })?;
        }

        Ok(())
    }
}
