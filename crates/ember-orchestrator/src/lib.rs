//! ember-orchestrator — the externally visible entry point.
//!
//! [`Orchestrator`] owns the single executor [`Lifecycle`] and the
//! [`InferenceProxy`] gated on it, and exposes the operation set the HTTP
//! layer calls into:
//!
//! | Operation | Effect |
//! |---|---|
//! | `start_executor` | begin bringing the executor up |
//! | `stop_executor` | begin tearing it down |
//! | `status` | current lifecycle snapshot |
//! | `generate` | stream output from a ready executor |
//! | `pull_model` | stream download progress |
//! | `list_models` | executor models plus the static catalog |
//! | `check_model` / `delete_model` | manage models on the executor |

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use ember_core::{ClusterStatus, EmberConfig, GenerateRequest, LifecycleState, ModelInfo};
use ember_health::{ExecutorProber, ReadinessProbe};
use ember_lifecycle::{Lifecycle, WaitError};
use ember_proxy::{GenerateStream, InferenceProxy, ProxyResult, PullStream};
use ember_resource::ResourceClients;

/// Answer to `start_executor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartReceipt {
    pub state: LifecycleState,
    /// Unix timestamp (seconds) the executor is expected to be ready by.
    /// Absent once ready.
    pub estimated_ready_by: Option<u64>,
}

/// Answer to `stop_executor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopReceipt {
    pub state: LifecycleState,
}

/// Lifecycle plus proxy for one executor cluster.
#[derive(Clone)]
pub struct Orchestrator {
    lifecycle: Lifecycle,
    proxy: InferenceProxy,
}

impl Orchestrator {
    pub fn new(lifecycle: Lifecycle, proxy: InferenceProxy) -> Self {
        Self { lifecycle, proxy }
    }

    /// Wire a lifecycle and proxy from config, probing readiness through
    /// the service controller and the executor's health endpoint.
    pub fn from_config(config: &EmberConfig, clients: ResourceClients) -> Self {
        let probe = ExecutorProber::from_config(
            clients.service.clone(),
            &config.executor,
            config.lifecycle.desired_capacity,
        );
        Self::with_probe(config, clients, Arc::new(probe))
    }

    /// Like [`Orchestrator::from_config`] with a caller-supplied probe.
    pub fn with_probe(
        config: &EmberConfig,
        clients: ResourceClients,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        let lifecycle = Lifecycle::new(clients, probe, config.lifecycle.clone());
        let proxy = InferenceProxy::new(lifecycle.observer(), &config.executor, &config.catalog);
        info!(
            executor = %config.executor.address,
            desired_capacity = config.lifecycle.desired_capacity,
            "orchestrator assembled"
        );
        Self::new(lifecycle, proxy)
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Re-derive the lifecycle state from the live resources.
    pub async fn reconcile(&self) -> ClusterStatus {
        self.lifecycle.reconcile().await
    }

    pub fn start_executor(&self) -> StartReceipt {
        let status = self.lifecycle.start();
        StartReceipt {
            state: status.state,
            estimated_ready_by: status.estimated_ready_by,
        }
    }

    pub fn stop_executor(&self) -> StopReceipt {
        StopReceipt {
            state: self.lifecycle.stop().state,
        }
    }

    pub fn status(&self) -> ClusterStatus {
        self.lifecycle.status()
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<ClusterStatus, WaitError> {
        self.lifecycle.wait_ready(timeout).await
    }

    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: serde_json::Value,
    ) -> ProxyResult<GenerateStream> {
        let request = GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            options,
        };
        self.proxy.generate(&request).await
    }

    pub async fn pull_model(&self, name: &str) -> ProxyResult<PullStream> {
        self.proxy.pull(name).await
    }

    pub async fn list_models(&self) -> Vec<ModelInfo> {
        self.proxy.list().await
    }

    pub async fn check_model(&self, name: &str) -> ProxyResult<Option<ModelInfo>> {
        self.proxy.check_model(name).await
    }

    pub async fn delete_model(&self, name: &str) -> ProxyResult<()> {
        self.proxy.delete_model(name).await
    }
}
