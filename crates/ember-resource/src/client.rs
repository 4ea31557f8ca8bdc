//! Capability traits for the external control planes.
//!
//! Every call may take seconds. The traits return boxed `Send` futures so
//! implementations can be held behind `Arc<dyn …>` and swapped for the
//! in-memory simulation in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ember_core::ResourceResult;

/// Boxed future returned by every resource-client call.
pub type ResourceFuture<'a, T> = Pin<Box<dyn Future<Output = ResourceResult<T>> + Send + 'a>>;

/// Scales the GPU compute group backing the executor.
pub trait ComputeScaler: Send + Sync {
    /// Request `n` compute instances. Returns once the request is accepted,
    /// not once capacity is in service.
    fn set_capacity(&self, n: u32) -> ResourceFuture<'_, ()>;

    /// Number of compute instances currently in service.
    fn current_capacity(&self) -> ResourceFuture<'_, u32>;
}

/// Places the executor container service onto the compute group.
pub trait ServiceController: Send + Sync {
    /// Request `n` running executor tasks.
    fn set_desired_tasks(&self, n: u32) -> ResourceFuture<'_, ()>;

    /// Number of executor tasks currently running.
    fn running_tasks(&self) -> ResourceFuture<'_, u32>;
}

/// Toggles the outbound default route used for model downloads.
pub trait RouteController: Send + Sync {
    fn attach(&self) -> ResourceFuture<'_, ()>;

    fn detach(&self) -> ResourceFuture<'_, ()>;

    fn is_attached(&self) -> ResourceFuture<'_, bool>;
}

/// The three clients the lifecycle sequences, bundled for injection.
#[derive(Clone)]
pub struct ResourceClients {
    pub scaler: Arc<dyn ComputeScaler>,
    pub service: Arc<dyn ServiceController>,
    pub route: Arc<dyn RouteController>,
}

impl ResourceClients {
    pub fn new(
        scaler: Arc<dyn ComputeScaler>,
        service: Arc<dyn ServiceController>,
        route: Arc<dyn RouteController>,
    ) -> Self {
        Self {
            scaler,
            service,
            route,
        }
    }
}
