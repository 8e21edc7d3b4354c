//! Docker Engine backend built on bollard.
//!
//! Handles:
//! - Connecting to the daemon and negotiating the API version
//! - Pulling images according to the pull policy
//! - Applying security hardening to every container
//! - Container and exec lifecycle (create, attach, start, wait, signal, remove)

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    KillContainerOptionsBuilder, RemoveContainerOptionsBuilder, ResizeContainerTTYOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder, WaitContainerOptions,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{
    BackendClient, ContainerSpec, ExecSpec, OutputStream, ProgramIo, ProgramOutput,
};
use super::factory::ClientFactory;
use crate::config::{
    ContainerSecurityConfig, DockerConfig, ImagePullPolicy, MIN_DOCKER_API_VERSION,
};
use crate::error::BackendError;

/// Connects to the configured daemon on every `obtain` call.
pub struct BollardClientFactory {
    host: String,
    http_timeout: Duration,
    security: ContainerSecurityConfig,
}

impl BollardClientFactory {
    pub fn new(config: &DockerConfig) -> Self {
        Self {
            host: config.connection.host.clone(),
            http_timeout: config.timeouts.http(),
            security: config.execution.container_security.clone(),
        }
    }

    fn connect(&self) -> Result<Docker, BollardError> {
        let timeout = self.http_timeout.as_secs();
        match self.host.strip_prefix("unix://") {
            Some(path) => Docker::connect_with_socket(path, timeout, API_DEFAULT_VERSION),
            None => {
                let addr = self.host.replacen("tcp://", "http://", 1);
                Docker::connect_with_http(&addr, timeout, API_DEFAULT_VERSION)
            }
        }
    }

    fn unreachable(&self, reason: impl ToString) -> BackendError {
        BackendError::Unreachable {
            host: self.host.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ClientFactory for BollardClientFactory {
    async fn obtain(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn BackendClient>, BackendError> {
        let docker = self.connect().map_err(|e| self.unreachable(e))?;
        let docker = cancellable(cancel, async {
            docker
                .negotiate_version()
                .await
                .map_err(|e| self.unreachable(e))
        })
        .await?;

        let version = docker.client_version();
        let found = (version.major_version, version.minor_version);
        if found < MIN_DOCKER_API_VERSION {
            return Err(BackendError::UnsupportedVersion {
                found: format!("{}.{}", found.0, found.1),
                required: format!("{}.{}", MIN_DOCKER_API_VERSION.0, MIN_DOCKER_API_VERSION.1),
            });
        }
        debug!("Connected to Docker daemon at {} (API {}.{})", self.host, found.0, found.1);

        Ok(Arc::new(BollardClient {
            docker,
            security: self.security.clone(),
        }))
    }
}

/// A version-negotiated connection to one daemon.
pub struct BollardClient {
    docker: Docker,
    security: ContainerSecurityConfig,
}

impl BollardClient {
    /// Make the image available according to `policy`.
    async fn ensure_image(
        &self,
        image: &str,
        policy: ImagePullPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let present = match self.docker.inspect_image(image).await {
            Ok(_) => true,
            Err(e) if is_not_found(&e) => false,
            Err(e) => return Err(e.into()),
        };

        let pull = match policy {
            ImagePullPolicy::Always => true,
            ImagePullPolicy::IfNotPresent => !present,
            ImagePullPolicy::Never => {
                if !present {
                    return Err(BackendError::ImageUnavailable {
                        image: image.to_string(),
                        reason: "image is not present and the pull policy is never".to_string(),
                    });
                }
                false
            }
        };
        if !pull {
            return Ok(());
        }

        info!("Pulling image {}", image);
        let (from_image, tag) = split_image_reference(image);
        let mut builder = CreateImageOptionsBuilder::new().from_image(from_image);
        if let Some(tag) = tag {
            builder = builder.tag(tag);
        }
        cancellable(cancel, async {
            self.docker
                .create_image(Some(builder.build()), None, None)
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| BackendError::ImageUnavailable {
                    image: image.to_string(),
                    reason: e.to_string(),
                })
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BackendClient for BollardClient {
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        self.ensure_image(&spec.image, spec.pull_policy, cancel)
            .await?;

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(build_host_config(&self.security)?),
            working_dir: spec.working_dir.clone(),
            tty: Some(spec.tty),
            open_stdin: Some(spec.open_stdin),
            stdin_once: Some(spec.open_stdin),
            attach_stdin: Some(spec.open_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let options = CreateContainerOptionsBuilder::new()
            .name(&spec.name)
            .build();

        let response = cancellable(cancel, async {
            Ok(self.docker.create_container(Some(options), config).await?)
        })
        .await?;
        for warning in &response.warnings {
            warn!("Docker warning for container {}: {}", spec.name, warning);
        }
        info!("Created container {} ({})", spec.name, short(&response.id));
        Ok(response.id)
    }

    async fn start_container(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        cancellable(cancel, async {
            Ok(self
                .docker
                .start_container(container_id, None::<StartContainerOptions>)
                .await?)
        })
        .await
    }

    async fn attach_container(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ProgramIo, BackendError> {
        let options = AttachContainerOptionsBuilder::new()
            .stream(true)
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .build();
        let results = cancellable(cancel, async {
            Ok(self
                .docker
                .attach_container(container_id, Some(options))
                .await?)
        })
        .await?;
        Ok(ProgramIo {
            output: program_output(results.output),
            input: results.input,
        })
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64, BackendError> {
        let mut stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(BackendError::Unexpected(format!(
                "wait stream for container {} ended without a status",
                short(container_id)
            ))),
        }
    }

    async fn exec(
        &self,
        container_id: &str,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<(String, ProgramIo), BackendError> {
        let options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(spec.tty),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            ..Default::default()
        };

        cancellable(cancel, async {
            let exec_id = self.docker.create_exec(container_id, options).await?.id;
            let start = StartExecOptions {
                detach: false,
                tty: spec.tty,
                output_capacity: None,
            };
            match self.docker.start_exec(&exec_id, Some(start)).await? {
                StartExecResults::Attached { output, input } => Ok((
                    exec_id,
                    ProgramIo {
                        output: program_output(output),
                        input,
                    },
                )),
                StartExecResults::Detached => Err(BackendError::Unexpected(
                    "exec started in detached mode".to_string(),
                )),
            }
        })
        .await
    }

    async fn wait_exec(&self, exec_id: &str) -> Result<i64, BackendError> {
        // `inspect_exec` may briefly report Running=true after the output stream ends.
        for _ in 0..80 {
            let info = self.docker.inspect_exec(exec_id).await?;
            if info.running.unwrap_or(false) {
                tokio::time::sleep(Duration::from_millis(25)).await;
                continue;
            }
            return Ok(info.exit_code.unwrap_or(0));
        }
        Err(BackendError::Unexpected(format!(
            "exec {} still running after its output ended",
            short(exec_id)
        )))
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), BackendError> {
        let options = ResizeExecOptions {
            width: cols,
            height: rows,
        };
        Ok(self.docker.resize_exec(exec_id, options).await?)
    }

    async fn resize_container(
        &self,
        container_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), BackendError> {
        let options = ResizeContainerTTYOptionsBuilder::new()
            .w(i32::from(cols))
            .h(i32::from(rows))
            .build();
        Ok(self
            .docker
            .resize_container_tty(container_id, options)
            .await?)
    }

    async fn signal_container(
        &self,
        container_id: &str,
        signal: &str,
    ) -> Result<(), BackendError> {
        let options = KillContainerOptionsBuilder::new()
            .signal(&format!("SIG{signal}"))
            .build();
        Ok(self
            .docker
            .kill_container(container_id, Some(options))
            .await?)
    }

    async fn remove_container(
        &self,
        container_id: &str,
        stop_timeout: Duration,
    ) -> Result<(), BackendError> {
        let t = i32::try_from(stop_timeout.as_secs()).unwrap_or(i32::MAX);
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptionsBuilder::new().t(t).build()),
            )
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => return Ok(()),
            // Already stopped containers answer 304.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => warn!("Failed to stop container {}: {}", short(container_id), e),
        }

        let options = RemoveContainerOptionsBuilder::new()
            .force(true)
            .v(true)
            .link(false)
            .build();
        match self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run `fut` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackendError::Cancelled),
        result = fut => result,
    }
}

fn program_output(
    output: std::pin::Pin<
        Box<dyn futures::Stream<Item = Result<LogOutput, BollardError>> + Send>,
    >,
) -> OutputStream {
    Box::pin(output.map(|item| match item {
        Ok(LogOutput::StdErr { message }) => Ok(ProgramOutput::Stderr(message.to_vec())),
        Ok(LogOutput::StdOut { message })
        | Ok(LogOutput::StdIn { message })
        | Ok(LogOutput::Console { message }) => Ok(ProgramOutput::Stdout(message.to_vec())),
        Err(e) => Err(BackendError::from(e)),
    }))
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn short(id: &str) -> &str {
    super::handler::short_id(id)
}

/// Split `repo[:tag]` for the pull API. Digest references are passed through whole.
pub(crate) fn split_image_reference(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    // A colon before the last slash belongs to a registry port.
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&image[..split], Some(&image[split + 1..]))
        }
        None => (image, Some("latest")),
    }
}

/// Build the HostConfig with security settings.
fn build_host_config(security: &ContainerSecurityConfig) -> Result<HostConfig, BackendError> {
    let mut host_config = HostConfig {
        // Never run privileged
        privileged: Some(false),
        network_mode: Some("bridge".to_string()),
        ..Default::default()
    };

    if security.cap_drop_all {
        host_config.cap_drop = Some(vec!["ALL".to_string()]);
        if !security.cap_add.is_empty() {
            host_config.cap_add = Some(security.cap_add.clone());
        }
    }

    if security.no_new_privileges {
        host_config.security_opt = Some(vec!["no-new-privileges:true".to_string()]);
    }

    if security.readonly_rootfs {
        host_config.readonly_rootfs = Some(true);
        host_config.tmpfs = Some(HashMap::from([
            ("/tmp".to_string(), "rw,noexec,nosuid,size=1g".to_string()),
            ("/run".to_string(), "rw,noexec,nosuid,size=64m".to_string()),
        ]));
    }

    if let Some(ref memory) = security.memory_limit {
        host_config.memory = Some(parse_memory_limit(memory).map_err(|e| {
            BackendError::Unexpected(format!("invalid memory limit {memory:?}: {e}"))
        })?);
    }

    if let Some(cpu) = security.cpu_limit {
        // 1 CPU = 1e9 nano CPUs
        host_config.nano_cpus = Some((cpu * 1_000_000_000.0) as i64);
    }

    Ok(host_config)
}

/// Parse a memory limit string (e.g., "4g", "512m") to bytes.
///
/// The result is always a positive byte count that fits in an `i64`.
pub fn parse_memory_limit(s: &str) -> Result<i64, String> {
    let s = s.trim().to_lowercase();
    let (num, mult): (&str, i64) = if let Some(n) = s.strip_suffix('g') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('k') {
        (n, 1024)
    } else {
        (s.as_str(), 1)
    };
    let num = num.parse::<i64>().map_err(|e| e.to_string())?;
    if num <= 0 {
        return Err("must be greater than zero".to_string());
    }
    num.checked_mul(mult)
        .ok_or_else(|| format!("{s} does not fit in 64 bits"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("4g").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024k").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_limit("1000").unwrap(), 1000);
        assert_eq!(parse_memory_limit("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_memory_limit("lots").is_err());
    }

    #[test]
    fn test_parse_memory_limit_rejects_out_of_range() {
        assert!(parse_memory_limit("9999999999g").is_err());
        assert!(parse_memory_limit("9223372036854775807k").is_err());
        assert!(parse_memory_limit("-1g").is_err());
        assert!(parse_memory_limit("0").is_err());
        assert_eq!(
            parse_memory_limit("8589934591g").unwrap(),
            8_589_934_591 * 1024 * 1024 * 1024
        );
    }

    #[test]
    fn test_split_image_reference() {
        assert_eq!(split_image_reference("alpine"), ("alpine", Some("latest")));
        assert_eq!(split_image_reference("alpine:3.20"), ("alpine", Some("3.20")));
        assert_eq!(
            split_image_reference("registry.local:5000/team/shell"),
            ("registry.local:5000/team/shell", Some("latest"))
        );
        assert_eq!(
            split_image_reference("registry.local:5000/team/shell:v2"),
            ("registry.local:5000/team/shell", Some("v2"))
        );
        assert_eq!(
            split_image_reference("alpine@sha256:0123abcd"),
            ("alpine@sha256:0123abcd", None)
        );
    }

    #[test]
    fn test_build_host_config_applies_security() {
        let config = build_host_config(&ContainerSecurityConfig::default()).unwrap();
        assert_eq!(config.privileged, Some(false));
        assert_eq!(config.cap_drop, Some(vec!["ALL".to_string()]));
        assert!(config.cap_add.unwrap().contains(&"SETUID".to_string()));
        assert_eq!(
            config.security_opt,
            Some(vec!["no-new-privileges:true".to_string()])
        );
        assert_eq!(config.memory, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(config.nano_cpus, Some(1_000_000_000));
        assert_eq!(config.readonly_rootfs, None);
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable(&cancel, async { Ok(1) }).await;
        assert!(matches!(result, Err(BackendError::Cancelled)));

        let live = CancellationToken::new();
        assert_eq!(cancellable(&live, async { Ok(2) }).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_daemon() {
        let mut config = DockerConfig::default();
        config.connection.host = "unix:///nonexistent/sshbox-test.sock".to_string();
        let factory = BollardClientFactory::new(&config);
        let result = factory.obtain(&CancellationToken::new()).await;
        assert!(matches!(result, Err(BackendError::Unreachable { .. })));
    }
}
