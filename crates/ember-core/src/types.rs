//! Domain types for the executor lifecycle and the inference wire format.
//!
//! Lifecycle types describe the single executor cluster the orchestrator
//! drives. Wire types are the JSON records exchanged with the inference
//! engine and handed back to callers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ErrorRecord;

// ── Lifecycle ──────────────────────────────────────────────────────

/// Lifecycle state of the executor cluster.
///
/// Up states run `ScalingUp → RouteAttaching → ServiceStarting → WarmingUp
/// → Ready`; down states run `RouteDetaching → ServiceStopping →
/// ScalingDown → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    ScalingUp,
    RouteAttaching,
    ServiceStarting,
    WarmingUp,
    Ready,
    RouteDetaching,
    ServiceStopping,
    ScalingDown,
    Failed,
}

impl LifecycleState {
    /// Any state on the way up, including `Ready`.
    pub fn is_up(self) -> bool {
        matches!(
            self,
            LifecycleState::ScalingUp
                | LifecycleState::RouteAttaching
                | LifecycleState::ServiceStarting
                | LifecycleState::WarmingUp
                | LifecycleState::Ready
        )
    }

    /// Any in-progress state on the way down.
    pub fn is_down(self) -> bool {
        matches!(
            self,
            LifecycleState::RouteDetaching
                | LifecycleState::ServiceStopping
                | LifecycleState::ScalingDown
        )
    }

    /// States the cluster rests in once no transition is in flight.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            LifecycleState::Stopped | LifecycleState::Ready | LifecycleState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::ScalingUp => "scaling_up",
            LifecycleState::RouteAttaching => "route_attaching",
            LifecycleState::ServiceStarting => "service_starting",
            LifecycleState::WarmingUp => "warming_up",
            LifecycleState::Ready => "ready",
            LifecycleState::RouteDetaching => "route_detaching",
            LifecycleState::ServiceStopping => "service_stopping",
            LifecycleState::ScalingDown => "scaling_down",
            LifecycleState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the executor cluster, as returned by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub state: LifecycleState,
    pub last_error: Option<ErrorRecord>,
    /// Milliseconds spent in `state` so far.
    pub elapsed_in_state_ms: u64,
    /// Unix timestamp (seconds) of the last state change.
    pub last_transition_at: u64,
    /// Executor count the cluster is driven towards when up.
    pub desired_capacity: u32,
    /// Whether the outbound download route may currently be attached.
    pub route_attached: bool,
    /// Unix timestamp (seconds) the executor is expected to be ready by,
    /// while an up-sequence is in flight.
    pub estimated_ready_by: Option<u64>,
}

impl ClusterStatus {
    pub fn elapsed_in_state(&self) -> Duration {
        Duration::from_millis(self.elapsed_in_state_ms)
    }
}

// ── Inference wire types ───────────────────────────────────────────

/// A generate call as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    /// Engine-specific options (temperature, num_ctx, ...), passed through.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            options: serde_json::Value::Null,
        }
    }
}

/// One streamed piece of generated output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateChunk {
    #[serde(default, alias = "response")]
    pub chunk: String,
    #[serde(default)]
    pub done: bool,
}

/// One streamed model download progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default, alias = "completed")]
    pub bytes_downloaded: u64,
    #[serde(default, alias = "total")]
    pub total_bytes: u64,
    #[serde(default)]
    pub done: bool,
}

impl PullProgress {
    /// Engines signal the end of a pull either with `done` or a final
    /// `"success"` status line.
    pub fn is_final(&self) -> bool {
        self.done || self.status == "success"
    }
}

/// A model known to the executor or the static catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, alias = "modified_at")]
    pub modified: String,
}

/// Body returned by the executor's list endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_and_down_partition() {
        use LifecycleState::*;
        for s in [ScalingUp, RouteAttaching, ServiceStarting, WarmingUp, Ready] {
            assert!(s.is_up(), "{s} should be up");
            assert!(!s.is_down());
        }
        for s in [RouteDetaching, ServiceStopping, ScalingDown] {
            assert!(s.is_down(), "{s} should be down");
            assert!(!s.is_up());
        }
        for s in [Stopped, Failed] {
            assert!(!s.is_up() && !s.is_down());
        }
    }

    #[test]
    fn settled_states() {
        assert!(LifecycleState::Stopped.is_settled());
        assert!(LifecycleState::Ready.is_settled());
        assert!(LifecycleState::Failed.is_settled());
        assert!(!LifecycleState::WarmingUp.is_settled());
        assert!(!LifecycleState::ScalingDown.is_settled());
    }

    #[test]
    fn state_serializes_as_snake_case() {
        let json = serde_json::to_string(&LifecycleState::RouteAttaching).unwrap();
        assert_eq!(json, "\"route_attaching\"");
        assert_eq!(LifecycleState::WarmingUp.to_string(), "warming_up");
    }

    #[test]
    fn generate_chunk_accepts_engine_field_names() {
        let chunk: GenerateChunk =
            serde_json::from_str(r#"{"model":"llama3","response":"Hel","done":false}"#).unwrap();
        assert_eq!(chunk.chunk, "Hel");
        assert!(!chunk.done);
    }

    #[test]
    fn pull_progress_final_on_success_status() {
        let p: PullProgress =
            serde_json::from_str(r#"{"status":"pulling abc","completed":10,"total":100}"#).unwrap();
        assert_eq!(p.bytes_downloaded, 10);
        assert_eq!(p.total_bytes, 100);
        assert!(!p.is_final());

        let p: PullProgress = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert!(p.is_final());
    }

    #[test]
    fn model_list_accepts_modified_at() {
        let list: ModelList = serde_json::from_str(
            r#"{"models":[{"name":"llama3:8b","size":4661224676,"modified_at":"2024-05-01T10:00:00Z"}]}"#,
        )
        .unwrap();
        assert_eq!(list.models.len(), 1);
        assert_eq!(list.models[0].modified, "2024-05-01T10:00:00Z");
    }

    #[test]
    fn generate_request_omits_null_options() {
        let req = GenerateRequest::new("llama3", "hi");
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("options").is_none());
    }
}
