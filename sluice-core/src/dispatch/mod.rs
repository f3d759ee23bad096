//! Turning discovered objects into function invocations.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::{
    consumer::ConsumerIdentity,
    error::Result,
    types::{DiscoveredObject, FunctionTarget},
};

pub mod http;
pub mod pool;

pub use http::HttpFunctionInvoker;
pub use pool::DispatchPool;

/// Invocation collaborator. One call per discovered object; an `Err` is a
/// failed delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(
        &self,
        target: &FunctionTarget,
        object: &DiscoveredObject,
    ) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchStatus {
    Delivered,
    Failed { error: String },
}

impl DispatchStatus {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchStatus::Delivered)
    }
}

/// Binds an invoker to the function and consumer it serves.
#[derive(Clone)]
pub struct Dispatcher {
    invoker: Arc<dyn FunctionInvoker>,
    target: FunctionTarget,
    consumer: ConsumerIdentity,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("target", &self.target)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        invoker: Arc<dyn FunctionInvoker>,
        target: FunctionTarget,
        consumer: ConsumerIdentity,
    ) -> Self {
        Self {
            invoker,
            target,
            consumer,
        }
    }

    pub fn target(&self) -> &FunctionTarget {
        &self.target
    }

    pub fn consumer(&self) -> &ConsumerIdentity {
        &self.consumer
    }

    /// Invoke once. Failures are logged and reported, never retried.
    pub async fn dispatch(&self, object: &DiscoveredObject) -> DispatchStatus {
        match self.invoker.invoke(&self.target, object).await {
            Ok(()) => {
                debug!(
                    target: "sluice::dispatch",
                    function = %self.target,
                    trigger = %self.consumer.trigger_key(),
                    bucket = %object.bucket,
                    key = %object.key,
                    "function invoked"
                );
                DispatchStatus::Delivered
            }
            Err(err) if err.is_transient() => {
                warn!(
                    target: "sluice::dispatch",
                    function = %self.target,
                    trigger = %self.consumer.trigger_key(),
                    bucket = %object.bucket,
                    key = %object.key,
                    error = %err,
                    "function invocation failed"
                );
                DispatchStatus::Failed {
                    error: err.to_string(),
                }
            }
            Err(err) => {
                error!(
                    target: "sluice::dispatch",
                    function = %self.target,
                    trigger = %self.consumer.trigger_key(),
                    bucket = %object.bucket,
                    key = %object.key,
                    error = %err,
                    "function invocation rejected"
                );
                DispatchStatus::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}
