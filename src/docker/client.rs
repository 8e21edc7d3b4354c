//! The backend client contract the connection handler drives.
//!
//! Implemented by [`super::bollard_client::BollardClient`] for a real daemon
//! and by fakes in tests. Every call that may block on the daemon before a
//! resource exists takes the handler's cancellation token.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::config::ImagePullPolicy;
use crate::error::BackendError;

/// One chunk of program output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type OutputStream = Pin<Box<dyn Stream<Item = Result<ProgramOutput, BackendError>> + Send>>;
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Attached standard streams of a running program.
pub struct ProgramIo {
    pub output: OutputStream,
    pub input: InputSink,
}

impl std::fmt::Debug for ProgramIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramIo").finish_non_exhaustive()
    }
}

/// What to create.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub pull_policy: ImagePullPolicy,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub working_dir: Option<String>,
    /// Allocate a TTY for the main process.
    pub tty: bool,
    /// Keep stdin open so the main process can be attached to.
    pub open_stdin: bool,
}

/// A program to run inside an existing container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub tty: bool,
    pub working_dir: Option<String>,
}

/// A versioned client for one container daemon.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Make sure the image is available (per pull policy) and create a container. Returns its ID.
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError>;

    async fn start_container(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError>;

    /// Attach to the main process of a created (not yet started) container.
    async fn attach_container(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ProgramIo, BackendError>;

    /// Wait for the main process to exit and return its exit code.
    async fn wait_container(&self, container_id: &str) -> Result<i64, BackendError>;

    /// Start a program in a running container. Returns the exec ID and its streams.
    async fn exec(
        &self,
        container_id: &str,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<(String, ProgramIo), BackendError>;

    /// Exit code of a finished exec.
    async fn wait_exec(&self, exec_id: &str) -> Result<i64, BackendError>;

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), BackendError>;

    async fn resize_container(
        &self,
        container_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), BackendError>;

    /// Deliver a signal (e.g. `TERM`) to the container's main process.
    async fn signal_container(&self, container_id: &str, signal: &str)
    -> Result<(), BackendError>;

    /// Stop (waiting up to `stop_timeout`) and remove a container. A missing container is not an error.
    async fn remove_container(
        &self,
        container_id: &str,
        stop_timeout: Duration,
    ) -> Result<(), BackendError>;
}
