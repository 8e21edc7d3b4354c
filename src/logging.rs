//! Diagnostic messages with stable codes.
//!
//! The connection handler never talks to `tracing` directly. It is handed a
//! [`Logger`] at construction and emits [`Message`]s through it, so the
//! transport decides where they go and tests can record them.

use std::fmt;
use std::net::SocketAddr;

use tracing::Level;

/// Stable message codes, grep-able in operator logs.
pub mod codes {
    /// The guest agent is disabled; some features will not work.
    pub const DOCKER_GUEST_AGENT_DISABLED: &str = "DOCKER_GUEST_AGENT_DISABLED";
    /// The configuration was rejected before a handler existed.
    pub const DOCKER_CONFIG_ERROR: &str = "DOCKER_CONFIG_ERROR";
    /// A provisioning attempt failed.
    pub const DOCKER_PROVISION_FAILED: &str = "DOCKER_PROVISION_FAILED";
    /// A container was created and started.
    pub const DOCKER_CONTAINER_STARTED: &str = "DOCKER_CONTAINER_STARTED";
    /// A container was stopped and removed.
    pub const DOCKER_CONTAINER_REMOVED: &str = "DOCKER_CONTAINER_REMOVED";
    /// Removing a container failed; it may have leaked.
    pub const DOCKER_CONTAINER_REMOVE_FAILED: &str = "DOCKER_CONTAINER_REMOVE_FAILED";
    /// A program was started in a container.
    pub const DOCKER_PROGRAM_STARTED: &str = "DOCKER_PROGRAM_STARTED";
    /// The terminal of a started program could not be resized.
    pub const DOCKER_RESIZE_FAILED: &str = "DOCKER_RESIZE_FAILED";
    /// A signal could not be delivered with this configuration.
    pub const DOCKER_SIGNAL_UNSUPPORTED: &str = "DOCKER_SIGNAL_UNSUPPORTED";
    /// The connection was torn down.
    pub const DOCKER_DISCONNECTED: &str = "DOCKER_DISCONNECTED";
    /// Teardown did not finish before the shutdown deadline.
    pub const DOCKER_SHUTDOWN_TIMEOUT: &str = "DOCKER_SHUTDOWN_TIMEOUT";
}

/// A diagnostic message: a stable code plus text for humans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    code: &'static str,
    text: String,
}

impl Message {
    pub fn new(code: &'static str, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.text, self.code)
    }
}

/// Sink for diagnostic messages.
pub trait Logger: Send + Sync {
    /// Emit `message` at `level`.
    fn log(&self, level: Level, message: &Message);

    fn warning(&self, message: Message) {
        self.log(Level::WARN, &message);
    }

    fn info(&self, message: Message) {
        self.log(Level::INFO, &message);
    }

    fn debug(&self, message: Message) {
        self.log(Level::DEBUG, &message);
    }
}

/// Logger that forwards to `tracing`, tagged with the connection identity.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    connection_id: String,
    remote: SocketAddr,
}

impl TracingLogger {
    pub fn new(connection_id: impl Into<String>, remote: SocketAddr) -> Self {
        Self {
            connection_id: connection_id.into(),
            remote,
        }
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &Message) {
        let code = message.code();
        let connection_id = self.connection_id.as_str();
        let remote = self.remote;
        let text = message.text();
        match level {
            Level::ERROR => tracing::error!(code, connection_id, %remote, "{}", text),
            Level::WARN => tracing::warn!(code, connection_id, %remote, "{}", text),
            Level::INFO => tracing::info!(code, connection_id, %remote, "{}", text),
            Level::DEBUG => tracing::debug!(code, connection_id, %remote, "{}", text),
            _ => tracing::trace!(code, connection_id, %remote, "{}", text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_display_includes_code() {
        let msg = Message::new(codes::DOCKER_DISCONNECTED, "connection closed");
        assert_eq!(msg.to_string(), "connection closed (DOCKER_DISCONNECTED)");
        assert_eq!(msg.code(), "DOCKER_DISCONNECTED");
    }
}
