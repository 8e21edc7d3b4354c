//! Client factory: hands out versioned backend clients.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::client::BackendClient;
use crate::error::{BackendError, HandlerError};
use crate::metrics::BackendMetrics;

/// Produces backend clients, hiding API version selection from the caller.
///
/// Implementations hold no per-connection state and may be shared by every
/// handler. Each `obtain` call is independent.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn obtain(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn BackendClient>, BackendError>;
}

/// A factory bound to the backend request/failure counters.
///
/// One call to [`MeteredFactory::provision`] is one provisioning attempt: it
/// bumps `requests` once and, if the attempt fails, `failures` once.
#[derive(Clone)]
pub struct MeteredFactory {
    inner: Arc<dyn ClientFactory>,
    metrics: BackendMetrics,
}

impl MeteredFactory {
    pub fn new(inner: Arc<dyn ClientFactory>, metrics: BackendMetrics) -> Self {
        Self { inner, metrics }
    }

    /// Obtain a client and run `step` with it as a single counted attempt.
    ///
    /// Refuses without touching the counters if `cancel` has already fired.
    /// A cancelled attempt is counted as a request but not as a failure.
    pub async fn provision<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        step: F,
    ) -> Result<T, HandlerError>
    where
        F: FnOnce(Arc<dyn BackendClient>) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        if cancel.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        self.metrics.requests.increment();

        let result = match self.inner.obtain(cancel).await {
            Ok(client) => step(client).await,
            Err(e) => Err(e),
        };
        self.settle(result)
    }

    /// Run a further provisioning step on a client obtained earlier, counted the same way.
    pub async fn provision_with<T, Fut>(
        &self,
        cancel: &CancellationToken,
        step: Fut,
    ) -> Result<T, HandlerError>
    where
        Fut: Future<Output = Result<T, BackendError>>,
    {
        if cancel.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        self.metrics.requests.increment();
        self.settle(step.await)
    }

    fn settle<T>(&self, result: Result<T, BackendError>) -> Result<T, HandlerError> {
        result.map_err(|e| {
            if !e.is_cancelled() {
                self.metrics.failures.increment();
            }
            HandlerError::provisioning(e)
        })
    }
}
