//! Guest agent coordination.
//!
//! The guest agent is an optional helper binary inside the container image.
//! In connection mode it is the init process (via the default idle command),
//! it reports the PID of every program it starts, and it delivers signals to
//! those PIDs. Without it the gateway still runs programs but cannot signal
//! them.

use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use futures::stream;

use super::client::{OutputStream, ProgramOutput};
use crate::config::{DockerExecutionConfig, ExecutionMode};
use crate::logging::{Logger, Message, codes};

/// What the guest agent can do for one handler, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestAgent {
    mode: ExecutionMode,
    path: Option<String>,
}

impl GuestAgent {
    pub fn from_config(config: &DockerExecutionConfig) -> Self {
        Self {
            mode: config.mode,
            path: (!config.disable_agent).then(|| config.agent_path.clone()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Warn about configurations that rely on an agent that is switched off.
    ///
    /// Returns the number of warnings emitted.
    pub fn check_configuration(config: &DockerExecutionConfig, logger: &dyn Logger) -> usize {
        if !config.disable_agent {
            return 0;
        }
        logger.warning(Message::new(
            codes::DOCKER_GUEST_AGENT_DISABLED,
            "Guest agent support is disabled. Some functions will not work.",
        ));
        if config.mode == ExecutionMode::Connection && config.idle_command_is_default() {
            logger.warning(Message::new(
                codes::DOCKER_GUEST_AGENT_DISABLED,
                "Guest agent support is disabled, but the execution mode is set to connection \
                 and the idle command still points to the guest agent to provide an init program. \
                 This is very likely to break since you most likely don't have the guest agent installed.",
            ));
            return 2;
        }
        1
    }

    /// Whether programs started by this handler report their PID.
    pub fn reports_pid(&self) -> bool {
        self.enabled() && self.mode == ExecutionMode::Connection
    }

    /// Whether a running program can be signalled.
    pub fn supports_signals(&self) -> bool {
        match self.mode {
            ExecutionMode::Session => true,
            ExecutionMode::Connection => self.enabled(),
        }
    }

    /// Command line to run for `program`, wrapped by the agent when it reports PIDs.
    pub fn wrap_program(&self, program: Vec<String>) -> Vec<String> {
        match (&self.path, self.reports_pid()) {
            (Some(agent), true) => {
                let mut cmd = vec![
                    agent.clone(),
                    "console".to_string(),
                    "--pid".to_string(),
                    "--".to_string(),
                ];
                cmd.extend(program);
                cmd
            }
            _ => program,
        }
    }

    /// Command line that delivers `signal` to `pid` inside the container.
    pub fn signal_command(&self, pid: u32, signal: &str) -> Option<Vec<String>> {
        let agent = self.path.as_ref()?;
        Some(vec![
            agent.clone(),
            "signal".to_string(),
            "--pid".to_string(),
            pid.to_string(),
            "--signal".to_string(),
            signal.to_string(),
        ])
    }
}

/// Strip the agent's 4-byte little-endian PID prefix from stdout, storing it in `pid`.
///
/// The prefix may arrive split across chunks. Everything after it, and all of
/// stderr, passes through untouched.
pub fn capture_pid(output: OutputStream, pid: Arc<OnceLock<u32>>) -> OutputStream {
    let state = (output, Vec::with_capacity(4), pid);
    Box::pin(stream::unfold(
        state,
        |(mut inner, mut prefix, pid)| async move {
            loop {
                let item = inner.next().await?;
                match item {
                    Ok(ProgramOutput::Stdout(data)) if pid.get().is_none() => {
                        let take = (4 - prefix.len()).min(data.len());
                        prefix.extend_from_slice(&data[..take]);
                        if prefix.len() == 4 {
                            let _ = pid.set(u32::from_le_bytes([
                                prefix[0], prefix[1], prefix[2], prefix[3],
                            ]));
                        }
                        if take == data.len() {
                            continue;
                        }
                        let rest = data[take..].to_vec();
                        return Some((Ok(ProgramOutput::Stdout(rest)), (inner, prefix, pid)));
                    }
                    other => return Some((other, (inner, prefix, pid))),
                }
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_idle_command;
    use crate::docker::testing::RecordingLogger;
    use crate::error::BackendError;

    fn exec_config(mode: ExecutionMode, disable_agent: bool) -> DockerExecutionConfig {
        DockerExecutionConfig {
            mode,
            disable_agent,
            ..Default::default()
        }
    }

    #[test]
    fn test_check_configuration_warnings() {
        let logger = RecordingLogger::default();
        let config = exec_config(ExecutionMode::Connection, false);
        assert_eq!(GuestAgent::check_configuration(&config, &logger), 0);
        assert!(logger.messages().is_empty());

        let logger = RecordingLogger::default();
        let config = exec_config(ExecutionMode::Connection, true);
        assert_eq!(GuestAgent::check_configuration(&config, &logger), 2);
        assert_eq!(logger.warnings(codes::DOCKER_GUEST_AGENT_DISABLED), 2);

        let logger = RecordingLogger::default();
        let mut config = exec_config(ExecutionMode::Connection, true);
        config.idle_command = vec!["/bin/sleep".to_string(), "infinity".to_string()];
        assert_eq!(GuestAgent::check_configuration(&config, &logger), 1);
        assert_eq!(logger.warnings(codes::DOCKER_GUEST_AGENT_DISABLED), 1);

        let logger = RecordingLogger::default();
        let config = exec_config(ExecutionMode::Session, true);
        assert_eq!(config.idle_command, default_idle_command());
        assert_eq!(GuestAgent::check_configuration(&config, &logger), 1);
    }

    #[test]
    fn test_wrap_program() {
        let program = vec!["/bin/sh".to_string(), "-c".to_string(), "id".to_string()];

        let agent = GuestAgent::from_config(&exec_config(ExecutionMode::Connection, false));
        assert_eq!(
            agent.wrap_program(program.clone()),
            vec![
                "/usr/bin/containerssh-agent",
                "console",
                "--pid",
                "--",
                "/bin/sh",
                "-c",
                "id"
            ]
        );
        assert!(agent.supports_signals());

        let agent = GuestAgent::from_config(&exec_config(ExecutionMode::Connection, true));
        assert_eq!(agent.wrap_program(program.clone()), program);
        assert!(!agent.supports_signals());
        assert_eq!(agent.signal_command(42, "TERM"), None);

        // Session mode runs the program as the main process; signals go through the daemon.
        let agent = GuestAgent::from_config(&exec_config(ExecutionMode::Session, true));
        assert_eq!(agent.wrap_program(program.clone()), program);
        assert!(agent.supports_signals());
    }

    #[test]
    fn test_signal_command() {
        let agent = GuestAgent::from_config(&exec_config(ExecutionMode::Connection, false));
        assert_eq!(
            agent.signal_command(1234, "INT").unwrap(),
            vec![
                "/usr/bin/containerssh-agent",
                "signal",
                "--pid",
                "1234",
                "--signal",
                "INT"
            ]
        );
    }

    #[tokio::test]
    async fn test_capture_pid_across_chunks() {
        let chunks: Vec<Result<ProgramOutput, BackendError>> = vec![
            Ok(ProgramOutput::Stdout(vec![0x39, 0x30])),
            Ok(ProgramOutput::Stderr(b"warn".to_vec())),
            Ok(ProgramOutput::Stdout(vec![0x00, 0x00, b'h', b'i'])),
            Ok(ProgramOutput::Stdout(b"!".to_vec())),
        ];
        let pid = Arc::new(OnceLock::new());
        let output = capture_pid(Box::pin(stream::iter(chunks)), pid.clone());
        let items: Vec<_> = output.map(|item| item.unwrap()).collect().await;

        assert_eq!(pid.get(), Some(&12345));
        assert_eq!(
            items,
            vec![
                ProgramOutput::Stderr(b"warn".to_vec()),
                ProgramOutput::Stdout(b"hi".to_vec()),
                ProgramOutput::Stdout(b"!".to_vec()),
            ]
        );
    }
}
