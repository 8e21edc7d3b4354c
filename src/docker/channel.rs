//! Session channels: one SSH "session" channel and the program it runs.

use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::agent::capture_pid;
use super::client::{BackendClient, ExecSpec, ProgramIo};
use super::handler::{HandlerInner, ScopedContainer, launch_container, short_id, with_timeout};
use crate::error::{BackendError, HandlerError};
use crate::logging::{Message, codes};

/// Where a channel's program runs.
pub(crate) enum ChannelBackend {
    /// Connection mode: exec into the connection's container.
    Shared(ScopedContainer),
    /// Session mode: a dedicated container created when the program starts.
    Dedicated(Arc<dyn BackendClient>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pty {
    term: String,
    cols: u32,
    rows: u32,
}

/// The running program, as the backend knows it.
#[derive(Clone)]
enum ProgramTarget {
    Exec {
        client: Arc<dyn BackendClient>,
        container_id: String,
        exec_id: String,
    },
    Container {
        client: Arc<dyn BackendClient>,
        container_id: String,
    },
}

/// Removes a session container exactly once: on channel close or connection teardown.
struct ContainerGuard {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ContainerGuard {
    /// Trigger the removal and wait for it.
    async fn release(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct RunningProgram {
    target: ProgramTarget,
    pid: Arc<OnceLock<u32>>,
    guard: Option<ContainerGuard>,
}

/// Awaits a program's exit status.
pub struct ExitWatcher {
    target: ProgramTarget,
}

impl ExitWatcher {
    /// Exit status as SSH reports it; negative codes become 255.
    pub async fn wait(self) -> Result<u32, HandlerError> {
        let code = match self.target {
            ProgramTarget::Exec {
                client, exec_id, ..
            } => client.wait_exec(&exec_id).await,
            ProgramTarget::Container {
                client,
                container_id,
            } => client.wait_container(&container_id).await,
        }
        .map_err(HandlerError::backend)?;
        Ok(if code < 0 { 255 } else { code as u32 })
    }
}

/// One SSH session channel on a [`super::ConnectionHandler`].
pub struct SessionChannel {
    inner: Arc<HandlerInner>,
    channel_id: u32,
    backend: ChannelBackend,
    env: Vec<(String, String)>,
    pty: Option<Pty>,
    program: Option<RunningProgram>,
    closed: bool,
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("connection_id", &self.inner.connection_id)
            .field("channel_id", &self.channel_id)
            .field("container_id", &self.container_id())
            .field("pty", &self.pty)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SessionChannel {
    pub(crate) fn new(
        inner: Arc<HandlerInner>,
        channel_id: u32,
        backend: ChannelBackend,
    ) -> Self {
        Self {
            inner,
            channel_id,
            backend,
            env: Vec::new(),
            pty: None,
            program: None,
            closed: false,
        }
    }

    /// Container the program runs (or will run) in, if it exists yet.
    pub fn container_id(&self) -> Option<&str> {
        match (&self.backend, &self.program) {
            (ChannelBackend::Shared(container), _) => Some(container.id.as_str()),
            (ChannelBackend::Dedicated(_), Some(program)) => match &program.target {
                ProgramTarget::Container { container_id, .. }
                | ProgramTarget::Exec { container_id, .. } => Some(container_id.as_str()),
            },
            (ChannelBackend::Dedicated(_), None) => None,
        }
    }

    /// Set an environment variable for the program. Only before it starts.
    pub async fn set_env(&mut self, name: &str, value: &str) -> Result<(), HandlerError> {
        self.ensure_not_started("env")?;
        self.inner.ensure_active().await?;
        self.env.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Ask for a TTY. Only before the program starts.
    pub async fn request_pty(
        &mut self,
        term: &str,
        cols: u32,
        rows: u32,
    ) -> Result<(), HandlerError> {
        self.ensure_not_started("pty")?;
        self.inner.ensure_active().await?;
        let term = if term.is_empty() { "xterm-256color" } else { term };
        self.pty = Some(Pty {
            term: term.to_string(),
            cols,
            rows,
        });
        Ok(())
    }

    /// Run `command` through `/bin/sh -c`.
    pub async fn exec(&mut self, command: &str) -> Result<ProgramIo, HandlerError> {
        self.start(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ])
        .await
    }

    /// Run the configured shell.
    pub async fn shell(&mut self) -> Result<ProgramIo, HandlerError> {
        let shell = self.inner.config.execution.shell_command.clone();
        self.start(shell).await
    }

    /// Run a configured subsystem such as `sftp`.
    pub async fn subsystem(&mut self, name: &str) -> Result<ProgramIo, HandlerError> {
        let Some(program) = self.inner.config.execution.subsystems.get(name) else {
            return Err(HandlerError::Unsupported(format!("subsystem {name:?}")));
        };
        let program = vec![program.clone()];
        self.start(program).await
    }

    /// Handle for awaiting the program's exit status.
    pub fn exit_watcher(&self) -> Result<ExitWatcher, HandlerError> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| HandlerError::protocol("no program running on this channel"))?;
        Ok(ExitWatcher {
            target: program.target.clone(),
        })
    }

    /// Terminal size changed.
    pub async fn window_change(&mut self, cols: u32, rows: u32) -> Result<(), HandlerError> {
        self.inner.ensure_active().await?;
        let Some(ref mut pty) = self.pty else {
            return Ok(());
        };
        pty.cols = cols;
        pty.rows = rows;
        match self.program {
            Some(ref program) => resize(&self.inner, &program.target, cols, rows).await,
            None => Ok(()),
        }
    }

    /// Deliver `signal` (e.g. `TERM`, `INT`) to the running program.
    pub async fn signal(&self, signal: &str) -> Result<(), HandlerError> {
        self.inner.ensure_active().await?;
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| HandlerError::protocol("no program running on this channel"))?;
        let inner = &self.inner;
        let limit = inner.config.timeouts.signal();

        match &program.target {
            ProgramTarget::Container {
                client,
                container_id,
            } => with_timeout(
                "signal",
                limit,
                client.signal_container(container_id, signal),
            )
            .await
            .map_err(HandlerError::backend),
            ProgramTarget::Exec {
                client,
                container_id,
                ..
            } => {
                let command = program
                    .pid
                    .get()
                    .and_then(|pid| inner.agent.signal_command(*pid, signal));
                let Some(cmd) = command else {
                    let reason = if inner.agent.supports_signals() {
                        "program PID not known yet"
                    } else {
                        "guest agent is disabled"
                    };
                    inner.logger.warning(Message::new(
                        codes::DOCKER_SIGNAL_UNSUPPORTED,
                        format!(
                            "cannot deliver {signal} on channel {}: {reason}",
                            self.channel_id
                        ),
                    ));
                    return Err(HandlerError::Unsupported(format!(
                        "signal {signal}: {reason}"
                    )));
                };
                let spec = ExecSpec {
                    cmd,
                    ..Default::default()
                };
                with_timeout("signal", limit, async {
                    let (exec_id, mut io) =
                        client.exec(container_id, &spec, &inner.done).await?;
                    while let Some(chunk) = io.output.next().await {
                        chunk?;
                    }
                    match client.wait_exec(&exec_id).await? {
                        0 => Ok(()),
                        code => Err(BackendError::Unexpected(format!(
                            "signal helper exited with {code}"
                        ))),
                    }
                })
                .await
                .map_err(HandlerError::backend)
            }
        }
    }

    /// Release the channel's backend resources. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(guard) = self.program.as_mut().and_then(|p| p.guard.take()) {
            guard.release().await;
        }
    }

    fn ensure_not_started(&self, what: &str) -> Result<(), HandlerError> {
        if self.closed {
            return Err(HandlerError::protocol("channel already closed"));
        }
        if self.program.is_some() {
            return Err(HandlerError::protocol(format!(
                "{what} request after the program started"
            )));
        }
        Ok(())
    }

    fn program_env(&self) -> Vec<String> {
        let mut env: Vec<String> = self
            .inner
            .config
            .execution
            .env
            .iter()
            .chain(self.env.iter().map(|(k, v)| (k, v)))
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if let Some(ref pty) = self.pty {
            env.push(format!("TERM={}", pty.term));
        }
        env
    }

    async fn start(&mut self, program: Vec<String>) -> Result<ProgramIo, HandlerError> {
        self.ensure_not_started("program")?;
        self.inner.ensure_active().await?;

        let inner = self.inner.clone();
        let tty = self.pty.is_some();
        let env = self.program_env();

        let (running, io) = match &self.backend {
            ChannelBackend::Shared(container) => {
                let spec = ExecSpec {
                    cmd: inner.agent.wrap_program(program),
                    env,
                    tty,
                    working_dir: inner.config.execution.working_dir.clone(),
                };
                let (exec_id, io) = with_timeout(
                    "command start",
                    inner.config.timeouts.command_start(),
                    container.client.exec(&container.id, &spec, &inner.done),
                )
                .await
                .map_err(HandlerError::backend)?;

                let pid = Arc::new(OnceLock::new());
                let io = if inner.agent.reports_pid() {
                    ProgramIo {
                        output: capture_pid(io.output, pid.clone()),
                        input: io.input,
                    }
                } else {
                    io
                };
                let running = RunningProgram {
                    target: ProgramTarget::Exec {
                        client: container.client.clone(),
                        container_id: container.id.clone(),
                        exec_id,
                    },
                    pid,
                    guard: None,
                };
                (running, io)
            }
            ChannelBackend::Dedicated(client) => {
                let username = inner.username().await;
                let spec = inner.container_spec(
                    Some(self.channel_id),
                    program,
                    env,
                    tty,
                    username.as_deref(),
                );
                let (container_id, io) = inner
                    .factory
                    .provision_with(&inner.done, async {
                        let (id, io) =
                            launch_container(&inner, client.as_ref(), &spec, true).await?;
                        match io {
                            Some(io) => Ok((id, io)),
                            None => Err(BackendError::Unexpected(
                                "attach returned no streams".to_string(),
                            )),
                        }
                    })
                    .await
                    .inspect_err(|err| {
                        if !matches!(err, HandlerError::Cancelled) {
                            inner.logger.warning(Message::new(
                                codes::DOCKER_PROVISION_FAILED,
                                format!(
                                    "failed to provision container for channel {}: {err}",
                                    self.channel_id
                                ),
                            ));
                        }
                    })?;
                inner.logger.info(Message::new(
                    codes::DOCKER_CONTAINER_STARTED,
                    format!(
                        "started container {} for channel {}",
                        short_id(&container_id),
                        self.channel_id
                    ),
                ));

                let guard = spawn_guard(inner.clone(), client.clone(), container_id.clone());
                if inner.done.is_cancelled() {
                    // Teardown won the race.
                    guard.release().await;
                    return Err(HandlerError::Cancelled);
                }
                let running = RunningProgram {
                    target: ProgramTarget::Container {
                        client: client.clone(),
                        container_id,
                    },
                    pid: Arc::new(OnceLock::new()),
                    guard: Some(guard),
                };
                (running, io)
            }
        };

        inner.logger.debug(Message::new(
            codes::DOCKER_PROGRAM_STARTED,
            format!("program started on channel {}", self.channel_id),
        ));
        if let Some(ref pty) = self.pty {
            if let Err(e) = resize(&inner, &running.target, pty.cols, pty.rows).await {
                inner.logger.warning(Message::new(
                    codes::DOCKER_RESIZE_FAILED,
                    format!(
                        "could not set terminal size on channel {}: {e}",
                        self.channel_id
                    ),
                ));
            }
        }
        self.program = Some(running);
        Ok(io)
    }
}

async fn resize(
    inner: &HandlerInner,
    target: &ProgramTarget,
    cols: u32,
    rows: u32,
) -> Result<(), HandlerError> {
    let cols = u16::try_from(cols).unwrap_or(u16::MAX);
    let rows = u16::try_from(rows).unwrap_or(u16::MAX);
    let limit = inner.config.timeouts.window();
    match target {
        ProgramTarget::Exec {
            client, exec_id, ..
        } => with_timeout("resize", limit, client.resize_exec(exec_id, cols, rows)).await,
        ProgramTarget::Container {
            client,
            container_id,
        } => with_timeout("resize", limit, client.resize_container(container_id, cols, rows)).await,
    }
    .map_err(HandlerError::backend)
}

/// Remove the container when the channel closes or the connection is torn down.
///
/// The removal runs on the handler's task tracker so disconnect can wait for it.
fn spawn_guard(
    inner: Arc<HandlerInner>,
    client: Arc<dyn BackendClient>,
    container_id: String,
) -> ContainerGuard {
    let token = inner.done.child_token();
    let wait = token.clone();
    let tasks = inner.tasks.clone();
    let task = tasks.spawn(async move {
        wait.cancelled().await;
        inner.remove_container(client.as_ref(), &container_id).await;
    });
    ContainerGuard {
        token,
        task: Some(task),
    }
}
