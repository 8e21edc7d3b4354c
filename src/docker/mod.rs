//! Docker-backed connection handling.
//!
//! [`new`] turns a validated [`DockerConfig`] into a [`ConnectionHandler`] for
//! one SSH connection. The handler provisions containers lazily through a
//! [`ClientFactory`]; nothing touches the daemon until the first channel opens.

mod agent;
mod bollard_client;
mod channel;
mod client;
mod factory;
mod handler;
#[cfg(test)]
pub(crate) mod testing;

use std::net::SocketAddr;
use std::sync::Arc;

pub use bollard_client::parse_memory_limit;
pub use channel::{ExitWatcher, SessionChannel};
pub use client::{ProgramIo, ProgramOutput};
pub use handler::ConnectionHandler;

use self::agent::GuestAgent;
use self::bollard_client::BollardClientFactory;
use self::factory::{ClientFactory, MeteredFactory};
use crate::config::DockerConfig;
use crate::error::ConfigError;
use crate::logging::{Logger, Message, codes};
use crate::metrics::{BackendMetrics, SimpleCounter};

/// Build the handler for one accepted connection.
///
/// An invalid configuration is logged and returned before any backend call
/// or counter update. A disabled guest agent only produces warnings.
pub fn new(
    client: SocketAddr,
    connection_id: String,
    config: DockerConfig,
    logger: Arc<dyn Logger>,
    requests: Arc<SimpleCounter>,
    failures: Arc<SimpleCounter>,
) -> Result<ConnectionHandler, ConfigError> {
    config.validate().inspect_err(|e| {
        logger.warning(Message::new(codes::DOCKER_CONFIG_ERROR, e.to_string()));
    })?;
    let factory = Arc::new(BollardClientFactory::new(&config));
    Ok(new_with_factory(
        client,
        connection_id,
        config,
        logger,
        factory,
        BackendMetrics::new(requests, failures),
    ))
}

/// Construction past validation, with the factory supplied by the caller.
pub(crate) fn new_with_factory(
    client: SocketAddr,
    connection_id: String,
    config: DockerConfig,
    logger: Arc<dyn Logger>,
    factory: Arc<dyn ClientFactory>,
    metrics: BackendMetrics,
) -> ConnectionHandler {
    GuestAgent::check_configuration(&config.execution, logger.as_ref());
    ConnectionHandler::new(
        client,
        connection_id,
        config,
        logger,
        MeteredFactory::new(factory, metrics),
    )
}
