//! Fakes for handler tests: a scriptable factory, an in-memory client and a
//! logger that records what it was told.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use super::client::{BackendClient, ContainerSpec, ExecSpec, ProgramIo, ProgramOutput};
use super::factory::ClientFactory;
use crate::error::BackendError;
use crate::logging::{Logger, Message};

#[derive(Default)]
pub struct RecordingLogger {
    messages: Mutex<Vec<(Level, Message)>>,
}

impl RecordingLogger {
    pub fn messages(&self) -> Vec<(Level, Message)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn warnings(&self, code: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(level, msg)| *level == Level::WARN && msg.code() == code)
            .count()
    }

    pub fn count(&self, code: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, msg)| msg.code() == code)
            .count()
    }
}

impl Logger for RecordingLogger {
    fn log(&self, level: Level, message: &Message) {
        self.messages.lock().unwrap().push((level, message.clone()));
    }
}

/// Records every call; optionally fails container creation.
#[derive(Default)]
pub struct FakeClient {
    next_id: AtomicUsize,
    pub fail_create: bool,
    /// Creation registers the container, then hangs until cancelled.
    pub hang_after_create: bool,
    pub fail_resize: bool,
    pub exit_code: i64,
    /// Bytes the program writes to stdout.
    pub stdout: Vec<u8>,
    pub created: Mutex<Vec<ContainerSpec>>,
    pub started: Mutex<Vec<String>>,
    pub execs: Mutex<Vec<(String, ExecSpec)>>,
    pub removed: Mutex<Vec<String>>,
    pub signals: Mutex<Vec<(String, String)>>,
    pub resizes: Mutex<Vec<(String, u16, u16)>>,
}

impl FakeClient {
    /// Every container creation fails as if the image could not be pulled.
    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Default::default()
        }
    }

    /// The daemon creates the container but the reply never arrives.
    pub fn hanging_after_create() -> Self {
        Self {
            hang_after_create: true,
            ..Default::default()
        }
    }

    pub fn failing_resize() -> Self {
        Self {
            fail_resize: true,
            ..Default::default()
        }
    }

    /// Programs print `stdout` and exit with `exit_code`.
    pub fn with_output(stdout: &[u8], exit_code: i64) -> Self {
        Self {
            stdout: stdout.to_vec(),
            exit_code,
            ..Default::default()
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn execs(&self) -> Vec<(String, ExecSpec)> {
        self.execs.lock().unwrap().clone()
    }

    fn io(&self) -> ProgramIo {
        let chunks: Vec<Result<ProgramOutput, BackendError>> = if self.stdout.is_empty() {
            Vec::new()
        } else {
            vec![Ok(ProgramOutput::Stdout(self.stdout.clone()))]
        };
        ProgramIo {
            output: Box::pin(stream::iter(chunks)),
            input: Box::pin(tokio::io::sink()),
        }
    }
}

#[async_trait]
impl BackendClient for FakeClient {
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        if self.fail_create {
            return Err(BackendError::ImageUnavailable {
                image: spec.image.clone(),
                reason: "pull access denied".to_string(),
            });
        }
        self.created.lock().unwrap().push(spec.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        if self.hang_after_create {
            cancel.cancelled().await;
            return Err(BackendError::Cancelled);
        }
        Ok(format!("container-{n}"))
    }

    async fn start_container(
        &self,
        container_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        self.started.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn attach_container(
        &self,
        _container_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<ProgramIo, BackendError> {
        Ok(self.io())
    }

    async fn wait_container(&self, _container_id: &str) -> Result<i64, BackendError> {
        Ok(self.exit_code)
    }

    async fn exec(
        &self,
        container_id: &str,
        spec: &ExecSpec,
        _cancel: &CancellationToken,
    ) -> Result<(String, ProgramIo), BackendError> {
        let mut execs = self.execs.lock().unwrap();
        execs.push((container_id.to_string(), spec.clone()));
        let exec_id = format!("exec-{}", execs.len());
        drop(execs);
        Ok((exec_id, self.io()))
    }

    async fn wait_exec(&self, _exec_id: &str) -> Result<i64, BackendError> {
        Ok(self.exit_code)
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), BackendError> {
        if self.fail_resize {
            return Err(BackendError::Unexpected("exec is gone".to_string()));
        }
        self.resizes
            .lock()
            .unwrap()
            .push((exec_id.to_string(), cols, rows));
        Ok(())
    }

    async fn resize_container(
        &self,
        container_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), BackendError> {
        if self.fail_resize {
            return Err(BackendError::Unexpected("container is gone".to_string()));
        }
        self.resizes
            .lock()
            .unwrap()
            .push((container_id.to_string(), cols, rows));
        Ok(())
    }

    async fn signal_container(
        &self,
        container_id: &str,
        signal: &str,
    ) -> Result<(), BackendError> {
        self.signals
            .lock()
            .unwrap()
            .push((container_id.to_string(), signal.to_string()));
        Ok(())
    }

    async fn remove_container(
        &self,
        container_id: &str,
        _stop_timeout: Duration,
    ) -> Result<(), BackendError> {
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }
}

/// Hands out one shared [`FakeClient`]; fails the first `failures` calls.
pub struct FakeFactory {
    pub client: Arc<FakeClient>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    block_until_cancelled: bool,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::with_client(FakeClient::default())
    }

    pub fn with_client(client: FakeClient) -> Self {
        Self {
            client: Arc::new(client),
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            block_until_cancelled: false,
        }
    }

    /// Fail exactly `n` obtain calls, whichever arrive first.
    pub fn failing(n: usize) -> Self {
        let factory = Self::new();
        factory.failures_left.store(n, Ordering::SeqCst);
        factory
    }

    /// Every obtain call hangs until the handler cancels it.
    pub fn hanging() -> Self {
        Self {
            block_until_cancelled: true,
            ..Self::new()
        }
    }

    pub fn obtain_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn obtain(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn BackendClient>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.block_until_cancelled {
            cancel.cancelled().await;
            return Err(BackendError::Cancelled);
        }
        // Yield so concurrent callers interleave.
        tokio::task::yield_now().await;
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BackendError::Unreachable {
                host: "unix:///fake.sock".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.client.clone())
    }
}
