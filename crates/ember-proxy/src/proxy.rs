//! Gated inference pass-through.

use std::time::Duration;

use http::Method;
use serde_json::json;
use tracing::{debug, info, warn};

use ember_core::{
    BackendPaths, CatalogConfig, ExecutorConfig, GenerateChunk, GenerateRequest, LifecycleState,
    ModelInfo, ModelList, PullProgress,
};
use ember_lifecycle::LifecycleObserver;

use crate::error::{ProxyError, ProxyResult};
use crate::upstream::{GenerateStream, PullStream, Upstream};

/// Forwards inference calls to the executor once the lifecycle allows it.
///
/// Holds only a read-only view of the lifecycle.
#[derive(Clone)]
pub struct InferenceProxy {
    gate: LifecycleObserver,
    upstream: Upstream,
    paths: BackendPaths,
    stream_buffer: usize,
    stream_idle: Duration,
    catalog: Vec<ModelInfo>,
}

impl InferenceProxy {
    pub fn new(gate: LifecycleObserver, executor: &ExecutorConfig, catalog: &CatalogConfig) -> Self {
        Self {
            gate,
            upstream: Upstream::new(&executor.address, executor.request_timeout),
            paths: executor.paths.clone(),
            stream_buffer: executor.stream_buffer,
            stream_idle: executor.stream_idle_timeout,
            catalog: catalog.models.clone(),
        }
    }

    pub fn executor_address(&self) -> &str {
        self.upstream.address()
    }

    fn require_ready(&self) -> ProxyResult<()> {
        match self.gate.state() {
            LifecycleState::Ready => Ok(()),
            state => Err(ProxyError::NotReady { state }),
        }
    }

    /// Stream generated output for `request`.
    ///
    /// Fails with `NotReady` unless the executor is `Ready`, without any
    /// network call.
    pub async fn generate(&self, request: &GenerateRequest) -> ProxyResult<GenerateStream> {
        self.require_ready()?;

        let mut body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": true,
        });
        if !request.options.is_null() {
            body["options"] = request.options.clone();
        }

        debug!(model = %request.model, "forwarding generate");
        let exchange = self
            .upstream
            .send(Method::POST, &self.paths.generate, Some(body))
            .await?;
        Ok(exchange.into_stream(self.stream_buffer, self.stream_idle, |c: &GenerateChunk| {
            c.done
        }))
    }

    /// Stream download progress for `model`.
    ///
    /// Needs the executor on its way up or ready, with the download route
    /// confirmed attached. An attach still in flight is refused.
    pub async fn pull(&self, model: &str) -> ProxyResult<PullStream> {
        let state = self.gate.state();
        if !state.is_up() || !self.gate.route_usable() {
            return Err(ProxyError::NotReady { state });
        }

        info!(model, "pulling model onto executor");
        let exchange = self
            .upstream
            .send(
                Method::POST,
                &self.paths.pull,
                Some(json!({ "name": model, "stream": true })),
            )
            .await?;
        Ok(exchange.into_stream(self.stream_buffer, self.stream_idle, PullProgress::is_final))
    }

    /// Models on the executor, if it is ready, followed by the catalog.
    ///
    /// Best effort: a stopped executor or a failed listing contributes
    /// nothing instead of an error.
    pub async fn list(&self) -> Vec<ModelInfo> {
        let mut models = if self.gate.state() == LifecycleState::Ready {
            match self.executor_models().await {
                Ok(models) => models,
                Err(e) => {
                    warn!(error = %e, "could not list executor models");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        for entry in &self.catalog {
            if !models.iter().any(|m| m.name == entry.name) {
                models.push(entry.clone());
            }
        }
        models
    }

    /// Whether `name` is present on the executor.
    pub async fn check_model(&self, name: &str) -> ProxyResult<Option<ModelInfo>> {
        self.require_ready()?;
        let found = self
            .executor_models()
            .await?
            .into_iter()
            .find(|m| m.name == name);
        debug!(model = name, available = found.is_some(), "checked model");
        Ok(found)
    }

    /// Remove `name` from the executor's local store.
    pub async fn delete_model(&self, name: &str) -> ProxyResult<()> {
        self.require_ready()?;
        self.upstream
            .send(
                Method::DELETE,
                &self.paths.delete,
                Some(json!({ "name": name })),
            )
            .await?
            .bytes()
            .await?;
        info!(model = name, "deleted model from executor");
        Ok(())
    }

    async fn executor_models(&self) -> ProxyResult<Vec<ModelInfo>> {
        let list: ModelList = self
            .upstream
            .send(Method::GET, &self.paths.list, None)
            .await?
            .json()
            .await?;
        Ok(list.models)
    }
}
