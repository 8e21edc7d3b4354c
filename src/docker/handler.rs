//! Per-connection handler.
//!
//! One [`ConnectionHandler`] exists per accepted SSH connection. It owns the
//! connection's state guard (disconnected flag plus the connection-scoped
//! container), the cancellation signal every backend call observes, and the
//! metered client factory. Cloning the handler is cheap; every clone drives the
//! same connection.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::agent::GuestAgent;
use super::channel::{ChannelBackend, SessionChannel};
use super::client::{BackendClient, ContainerSpec, ProgramIo};
use super::factory::MeteredFactory;
use crate::config::{DockerConfig, ExecutionMode};
use crate::error::{BackendError, HandlerError};
use crate::logging::{Logger, Message, codes};

/// Label marking containers owned by the gateway.
pub const LABEL_MANAGED: &str = "sshbox.managed";
pub const LABEL_CONNECTION_ID: &str = "sshbox.connection_id";
pub const LABEL_USERNAME: &str = "sshbox.username";
pub const LABEL_CHANNEL: &str = "sshbox.channel";
pub const LABEL_CREATED_AT: &str = "sshbox.created_at";

/// A container plus the client that created it.
#[derive(Clone)]
pub(crate) struct ScopedContainer {
    pub client: Arc<dyn BackendClient>,
    pub id: String,
}

/// Everything guarded by the handler's single mutex.
#[derive(Default)]
struct ConnectionState {
    disconnected: bool,
    username: Option<String>,
    /// Connection mode only: the container every channel execs into.
    container: Option<ScopedContainer>,
}

pub(crate) struct HandlerInner {
    pub client_addr: SocketAddr,
    pub connection_id: String,
    pub config: DockerConfig,
    pub logger: Arc<dyn Logger>,
    pub factory: MeteredFactory,
    pub agent: GuestAgent,
    /// Fires once, when teardown begins.
    pub done: CancellationToken,
    /// Session container removals still in flight.
    pub tasks: TaskTracker,
    state: Mutex<ConnectionState>,
}

/// Lifecycle operations the SSH transport drives for one network connection.
#[derive(Clone)]
pub struct ConnectionHandler {
    inner: Arc<HandlerInner>,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("connection_id", &self.inner.connection_id)
            .field("client_addr", &self.inner.client_addr)
            .field("mode", &self.inner.config.execution.mode)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandler {
    /// Build a handler from an already validated configuration.
    pub(crate) fn new(
        client_addr: SocketAddr,
        connection_id: String,
        config: DockerConfig,
        logger: Arc<dyn Logger>,
        factory: MeteredFactory,
    ) -> Self {
        let agent = GuestAgent::from_config(&config.execution);
        Self {
            inner: Arc::new(HandlerInner {
                client_addr,
                connection_id,
                config,
                logger,
                factory,
                agent,
                done: CancellationToken::new(),
                tasks: TaskTracker::new(),
                state: Mutex::new(ConnectionState::default()),
            }),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.inner.client_addr
    }

    pub fn mode(&self) -> ExecutionMode {
        self.inner.config.execution.mode
    }

    pub async fn is_disconnected(&self) -> bool {
        self.inner.state.lock().await.disconnected
    }

    /// Record the authenticated username; it is attached to containers as a label.
    pub async fn on_handshake_success(&self, username: &str) -> Result<(), HandlerError> {
        let mut state = self.inner.state.lock().await;
        if state.disconnected {
            return Err(HandlerError::protocol(
                "handshake completed on a disconnected connection",
            ));
        }
        state.username = Some(username.to_string());
        Ok(())
    }

    /// Open a session channel, provisioning backend resources for it.
    ///
    /// Connection mode: the first call creates the shared container, later
    /// calls reuse it. Session mode: every call obtains a dedicated client; the
    /// container is created once the channel requests a program.
    pub async fn open_session_channel(
        &self,
        channel_id: u32,
    ) -> Result<SessionChannel, HandlerError> {
        let backend = match self.mode() {
            ExecutionMode::Connection => ChannelBackend::Shared(self.shared_container().await?),
            ExecutionMode::Session => ChannelBackend::Dedicated(self.dedicated_client().await?),
        };
        Ok(SessionChannel::new(self.inner.clone(), channel_id, backend))
    }

    /// The network connection is gone. Returns true if this call performed the teardown.
    ///
    /// Returns once every container of the connection has been removed,
    /// session containers included.
    pub async fn on_disconnect(&self) -> bool {
        // Cancel before taking the lock so a provisioning call holding it gives up.
        self.inner.done.cancel();
        let first = {
            let mut state = self.inner.state.lock().await;
            self.inner.teardown_locked(&mut state, "client disconnected").await
        };
        // Cancelling `done` released every session container guard.
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        first
    }

    /// The gateway is stopping. Tear down, but give up after `deadline`.
    pub async fn on_shutdown(&self, deadline: Duration) {
        if tokio::time::timeout(deadline, self.on_disconnect())
            .await
            .is_err()
        {
            self.inner.logger.warning(Message::new(
                codes::DOCKER_SHUTDOWN_TIMEOUT,
                format!(
                    "teardown did not finish within {}s, containers may be left behind",
                    deadline.as_secs()
                ),
            ));
        }
    }

    async fn shared_container(&self) -> Result<ScopedContainer, HandlerError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.disconnected {
            return Err(HandlerError::protocol(
                "channel opened on a disconnected connection",
            ));
        }
        if let Some(ref container) = state.container {
            return Ok(container.clone());
        }

        // The lock is held across provisioning so concurrent first channels share one container.
        let spec = inner.container_spec(
            None,
            inner.config.execution.idle_command.clone(),
            Vec::new(),
            false,
            state.username.as_deref(),
        );
        let result = inner
            .factory
            .provision(&inner.done, |client| async move {
                let (id, _) = launch_container(inner, client.as_ref(), &spec, false).await?;
                Ok(ScopedContainer { client, id })
            })
            .await;

        match result {
            Ok(container) => {
                inner.logger.info(Message::new(
                    codes::DOCKER_CONTAINER_STARTED,
                    format!("started connection container {}", short_id(&container.id)),
                ));
                state.container = Some(container.clone());
                Ok(container)
            }
            // Only a close cancels provisioning, and the close owns the teardown.
            Err(HandlerError::Cancelled) => Err(HandlerError::Cancelled),
            Err(err) => {
                inner.logger.warning(Message::new(
                    codes::DOCKER_PROVISION_FAILED,
                    format!("failed to provision connection container: {err}"),
                ));
                // Every channel of this connection depends on that container.
                inner
                    .teardown_locked(&mut state, "connection container unavailable")
                    .await;
                Err(err)
            }
        }
    }

    async fn dedicated_client(&self) -> Result<Arc<dyn BackendClient>, HandlerError> {
        let inner = &self.inner;
        inner.ensure_active().await?;

        let client = inner
            .factory
            .provision(&inner.done, |client| async move { Ok(client) })
            .await
            .inspect_err(|err| {
                if !matches!(err, HandlerError::Cancelled) {
                    inner.logger.warning(Message::new(
                        codes::DOCKER_PROVISION_FAILED,
                        format!("failed to obtain backend client: {err}"),
                    ));
                }
            })?;

        // Close may have completed while we were talking to the daemon.
        if inner.state.lock().await.disconnected {
            return Err(HandlerError::Cancelled);
        }
        Ok(client)
    }
}

impl HandlerInner {
    /// Fail with a protocol violation once the connection is disconnected.
    pub(crate) async fn ensure_active(&self) -> Result<(), HandlerError> {
        if self.state.lock().await.disconnected {
            return Err(HandlerError::protocol("connection already closed"));
        }
        Ok(())
    }

    pub(crate) async fn username(&self) -> Option<String> {
        self.state.lock().await.username.clone()
    }

    /// The single teardown path. Runs at most once per handler.
    async fn teardown_locked(&self, state: &mut ConnectionState, reason: &str) -> bool {
        if state.disconnected {
            return false;
        }
        state.disconnected = true;
        self.done.cancel();

        if let Some(container) = state.container.take() {
            self.remove_container(container.client.as_ref(), &container.id)
                .await;
        }
        self.logger.info(Message::new(
            codes::DOCKER_DISCONNECTED,
            format!("connection torn down: {reason}"),
        ));
        true
    }

    /// Stop and remove a container, logging instead of failing.
    pub(crate) async fn remove_container(&self, client: &dyn BackendClient, id: &str) {
        match client
            .remove_container(id, self.config.timeouts.container_stop())
            .await
        {
            Ok(()) => self.logger.debug(Message::new(
                codes::DOCKER_CONTAINER_REMOVED,
                format!("removed container {}", short_id(id)),
            )),
            Err(e) => self.logger.warning(Message::new(
                codes::DOCKER_CONTAINER_REMOVE_FAILED,
                format!("failed to remove container {}: {e}", short_id(id)),
            )),
        }
    }

    /// Container definition for this connection (or one of its channels).
    pub(crate) fn container_spec(
        &self,
        channel_id: Option<u32>,
        cmd: Vec<String>,
        env: Vec<String>,
        tty: bool,
        username: Option<&str>,
    ) -> ContainerSpec {
        let exec = &self.config.execution;
        let short = short_id(&self.connection_id);

        let mut labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_CONNECTION_ID.to_string(), self.connection_id.clone()),
            (LABEL_CREATED_AT.to_string(), Utc::now().to_rfc3339()),
        ]);
        if let Some(user) = username {
            labels.insert(LABEL_USERNAME.to_string(), user.to_string());
        }
        let name = match channel_id {
            Some(channel) => {
                labels.insert(LABEL_CHANNEL.to_string(), channel.to_string());
                format!("sshbox-{short}-{channel}")
            }
            None => format!("sshbox-{short}"),
        };

        ContainerSpec {
            name,
            image: exec.image.clone(),
            pull_policy: exec.image_pull_policy,
            cmd,
            env,
            labels,
            working_dir: exec.working_dir.clone(),
            tty,
            open_stdin: channel_id.is_some(),
        }
    }
}

/// Create a container, optionally attach to it, and start it.
///
/// A container that was created but could not be attached or started is
/// removed again before the error is returned. So is one whose creation was
/// cancelled mid-request, by name, since the daemon may have created it anyway.
pub(crate) async fn launch_container(
    inner: &HandlerInner,
    client: &dyn BackendClient,
    spec: &ContainerSpec,
    attach: bool,
) -> Result<(String, Option<ProgramIo>), BackendError> {
    let timeouts = &inner.config.timeouts;
    let id = match client.create_container(spec, &inner.done).await {
        Ok(id) => id,
        Err(BackendError::Cancelled) => {
            inner.remove_container(client, &spec.name).await;
            return Err(BackendError::Cancelled);
        }
        Err(err) => return Err(err),
    };

    let started = async {
        let io = if attach {
            Some(client.attach_container(&id, &inner.done).await?)
        } else {
            None
        };
        with_timeout(
            "container start",
            timeouts.container_start(),
            client.start_container(&id, &inner.done),
        )
        .await?;
        Ok(io)
    }
    .await;

    match started {
        Ok(io) => Ok((id, io)),
        Err(err) => {
            inner.remove_container(client, &id).await;
            Err(err)
        }
    }
}

/// Bound a backend call by `limit`.
pub(crate) async fn with_timeout<T>(
    operation: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout {
            operation,
            seconds: limit.as_secs(),
        }),
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::testing::{FakeClient, FakeFactory, RecordingLogger};
    use crate::metrics::BackendMetrics;

    fn handler_with(
        mode: ExecutionMode,
        factory: Arc<FakeFactory>,
    ) -> (ConnectionHandler, BackendMetrics, Arc<RecordingLogger>) {
        let mut config = DockerConfig::default();
        config.execution.mode = mode;
        let metrics = BackendMetrics::default();
        let logger = Arc::new(RecordingLogger::default());
        let handler = ConnectionHandler::new(
            "127.0.0.1:40022".parse().unwrap(),
            "0123456789abcdef0123".to_string(),
            config,
            logger.clone(),
            MeteredFactory::new(factory, metrics.clone()),
        );
        (handler, metrics, logger)
    }

    #[tokio::test]
    async fn test_connection_mode_provisions_once() {
        let factory = Arc::new(FakeFactory::new());
        let (handler, metrics, _) = handler_with(ExecutionMode::Connection, factory.clone());
        handler.on_handshake_success("alice").await.unwrap();

        let first = handler.open_session_channel(0).await.unwrap();
        assert_eq!(factory.obtain_calls(), 1);
        let second = handler.open_session_channel(1).await.unwrap();
        assert_eq!(factory.obtain_calls(), 1);
        assert_eq!(first.container_id(), second.container_id());
        assert_eq!(metrics.requests.value(), 1);
        assert_eq!(metrics.failures.value(), 0);

        let created = factory.client.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        let spec = &created[0];
        assert_eq!(spec.name, "sshbox-0123456789ab");
        assert_eq!(spec.cmd, crate::config::default_idle_command());
        assert_eq!(spec.labels[LABEL_USERNAME], "alice");
        assert_eq!(spec.labels[LABEL_CONNECTION_ID], "0123456789abcdef0123");
        assert!(!spec.labels.contains_key(LABEL_CHANNEL));
        assert_eq!(factory.client.started.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_channels_share_one_container() {
        let factory = Arc::new(FakeFactory::new());
        let (handler, metrics, _) = handler_with(ExecutionMode::Connection, factory.clone());

        let mut tasks = Vec::new();
        for id in 0..16 {
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                handler.open_session_channel(id).await.map(|_| ())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(factory.obtain_calls(), 1);
        assert_eq!(factory.client.created_count(), 1);
        assert_eq!(metrics.requests.value(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let factory = Arc::new(FakeFactory::new());
        let (handler, _, logger) = handler_with(ExecutionMode::Connection, factory.clone());
        handler.open_session_channel(0).await.unwrap();

        assert!(handler.on_disconnect().await);
        assert!(!handler.on_disconnect().await);
        assert!(handler.is_disconnected().await);
        assert_eq!(factory.client.removed(), vec!["container-0".to_string()]);
        assert_eq!(logger.count(codes::DOCKER_DISCONNECTED), 1);
    }

    #[tokio::test]
    async fn test_disconnect_without_channels_touches_nothing() {
        let factory = Arc::new(FakeFactory::new());
        let (handler, metrics, _) = handler_with(ExecutionMode::Connection, factory.clone());
        assert!(handler.on_disconnect().await);
        assert_eq!(factory.obtain_calls(), 0);
        assert!(factory.client.removed().is_empty());
        assert_eq!(metrics.requests.value(), 0);
    }

    #[tokio::test]
    async fn test_open_after_disconnect_is_a_protocol_violation() {
        for mode in [ExecutionMode::Connection, ExecutionMode::Session] {
            let factory = Arc::new(FakeFactory::new());
            let (handler, metrics, _) = handler_with(mode, factory.clone());
            handler.on_disconnect().await;

            let err = handler.open_session_channel(3).await.unwrap_err();
            assert!(matches!(err, HandlerError::ProtocolViolation(_)), "{mode}: {err}");
            assert!(matches!(
                handler.on_handshake_success("bob").await,
                Err(HandlerError::ProtocolViolation(_))
            ));
            assert_eq!(metrics.requests.value(), 0);
            assert_eq!(factory.obtain_calls(), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_session_opens_count_exactly() {
        const ATTEMPTS: u32 = 64;
        const FAILURES: usize = 17;

        let factory = Arc::new(FakeFactory::failing(FAILURES));
        let (handler, metrics, logger) = handler_with(ExecutionMode::Session, factory.clone());

        let mut tasks = Vec::new();
        for id in 0..ATTEMPTS {
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                handler.open_session_channel(id).await.is_ok()
            }));
        }
        let mut ok = 0;
        for task in tasks {
            if task.await.unwrap() {
                ok += 1;
            }
        }

        assert_eq!(ok, ATTEMPTS as usize - FAILURES);
        assert_eq!(metrics.requests.value(), ATTEMPTS as u64);
        assert_eq!(metrics.failures.value(), FAILURES as u64);
        assert_eq!(logger.warnings(codes::DOCKER_PROVISION_FAILED), FAILURES);
        // Session mode survives individual failures.
        assert!(!handler.is_disconnected().await);
        assert!(handler.open_session_channel(ATTEMPTS).await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_mode_failure_disconnects() {
        let factory = Arc::new(FakeFactory::with_client(FakeClient::failing_create()));
        let (handler, metrics, logger) = handler_with(ExecutionMode::Connection, factory.clone());

        let err = handler.open_session_channel(0).await.unwrap_err();
        assert!(matches!(err, HandlerError::Provisioning(_)));
        assert_eq!(metrics.requests.value(), 1);
        assert_eq!(metrics.failures.value(), 1);
        assert_eq!(logger.warnings(codes::DOCKER_PROVISION_FAILED), 1);
        assert!(handler.is_disconnected().await);

        assert!(matches!(
            handler.open_session_channel(1).await,
            Err(HandlerError::ProtocolViolation(_))
        ));
        assert_eq!(metrics.requests.value(), 1);
        // Already torn down by the failure.
        assert!(!handler.on_disconnect().await);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_provisioning() {
        let factory = Arc::new(FakeFactory::hanging());
        let (handler, metrics, _) = handler_with(ExecutionMode::Connection, factory.clone());

        let opener = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.open_session_channel(0).await })
        };
        while factory.obtain_calls() == 0 {
            tokio::task::yield_now().await;
        }

        let first = tokio::time::timeout(Duration::from_secs(5), handler.on_disconnect())
            .await
            .expect("disconnect must not wait on a hung backend");
        assert!(first);
        let result = opener.await.unwrap();
        assert!(matches!(result, Err(HandlerError::Cancelled)));
        assert_eq!(metrics.requests.value(), 1);
        assert_eq!(metrics.failures.value(), 0);
        assert!(factory.client.removed().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_create_removes_container_by_name() {
        let factory = Arc::new(FakeFactory::with_client(FakeClient::hanging_after_create()));
        let (handler, metrics, logger) = handler_with(ExecutionMode::Connection, factory.clone());

        let opener = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.open_session_channel(0).await })
        };
        while factory.client.created_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(handler.on_disconnect().await);
        assert!(matches!(opener.await.unwrap(), Err(HandlerError::Cancelled)));
        assert_eq!(factory.client.removed(), vec!["sshbox-0123456789ab".to_string()]);
        assert_eq!(metrics.requests.value(), 1);
        assert_eq!(metrics.failures.value(), 0);
        assert_eq!(logger.count(codes::DOCKER_PROVISION_FAILED), 0);

        let messages = logger.messages();
        let teardown: Vec<_> = messages
            .iter()
            .filter(|(_, m)| m.code() == codes::DOCKER_DISCONNECTED)
            .collect();
        assert_eq!(teardown.len(), 1);
        assert!(teardown[0].1.text().contains("client disconnected"));
    }

    #[tokio::test]
    async fn test_shutdown_tears_down() {
        let factory = Arc::new(FakeFactory::new());
        let (handler, _, _) = handler_with(ExecutionMode::Connection, factory.clone());
        handler.open_session_channel(0).await.unwrap();
        handler.on_shutdown(Duration::from_secs(5)).await;
        assert!(handler.is_disconnected().await);
        assert_eq!(factory.client.removed().len(), 1);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
