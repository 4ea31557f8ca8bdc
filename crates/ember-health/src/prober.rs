//! Executor readiness: running tasks plus engine liveness.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use ember_core::{ExecutorConfig, ResourceError};
use ember_resource::ServiceController;

use crate::liveness::{Liveness, liveness_probe};

/// Result of one readiness poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    /// Not yet; worth polling again. Carries a short reason for logs.
    NotReady(String),
    /// Terminal: polling again will not help.
    Error(String),
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'a>>;

/// Something the lifecycle can poll while warming up.
pub trait ReadinessProbe: Send + Sync {
    fn poll(&self) -> ProbeFuture<'_>;
}

/// Polls the service controller and the executor's health endpoint.
pub struct ExecutorProber {
    service: Arc<dyn ServiceController>,
    address: String,
    health_path: String,
    expected_tasks: u32,
    timeout: Duration,
}

impl ExecutorProber {
    pub fn new(
        service: Arc<dyn ServiceController>,
        address: &str,
        health_path: &str,
        expected_tasks: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            address: address.to_string(),
            health_path: health_path.to_string(),
            expected_tasks,
            timeout,
        }
    }

    /// Build a prober from the `[executor]` config section.
    pub fn from_config(
        service: Arc<dyn ServiceController>,
        config: &ExecutorConfig,
        expected_tasks: u32,
    ) -> Self {
        Self::new(
            service,
            &config.address,
            &config.paths.health,
            expected_tasks,
            config.probe_timeout,
        )
    }

    async fn check(&self) -> ProbeOutcome {
        match self.service.running_tasks().await {
            Ok(running) if running >= self.expected_tasks => {}
            Ok(running) => {
                return ProbeOutcome::NotReady(format!(
                    "{running}/{} tasks running",
                    self.expected_tasks
                ));
            }
            Err(ResourceError::Transient(msg)) => {
                debug!(error = %msg, "task count unavailable");
                return ProbeOutcome::NotReady(format!("task count unavailable: {msg}"));
            }
            Err(ResourceError::Permanent(msg)) => {
                warn!(error = %msg, "service controller rejected readiness query");
                return ProbeOutcome::Error(msg);
            }
        }

        match liveness_probe(&self.address, &self.health_path, self.timeout).await {
            Liveness::Alive => ProbeOutcome::Ready,
            Liveness::Unreachable => {
                ProbeOutcome::NotReady(format!("executor {} unreachable", self.address))
            }
            Liveness::Starting(status) => {
                ProbeOutcome::NotReady(format!("executor answered {status}"))
            }
            Liveness::Malformed(msg) => ProbeOutcome::Error(msg),
        }
    }
}

impl ReadinessProbe for ExecutorProber {
    fn poll(&self) -> ProbeFuture<'_> {
        Box::pin(self.check())
    }
}

/// Probe that replays a scripted sequence of outcomes, then repeats a
/// fallback. Used to drive the lifecycle without a real executor.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeOutcome>>,
    fallback: Mutex<ProbeOutcome>,
    polls: Mutex<u32>,
}

impl ScriptedProbe {
    /// A probe that always answers `outcome`.
    pub fn always(outcome: ProbeOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(outcome),
            polls: Mutex::new(0),
        }
    }

    /// A probe that answers `script` in order, then `fallback` forever.
    pub fn sequence(script: Vec<ProbeOutcome>, fallback: ProbeOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Mutex::new(fallback),
            polls: Mutex::new(0),
        }
    }

    /// Change the answer given once the script runs out.
    pub fn set_fallback(&self, outcome: ProbeOutcome) {
        *self.fallback.lock().expect("probe lock") = outcome;
    }

    pub fn polls(&self) -> u32 {
        *self.polls.lock().expect("probe lock")
    }
}

impl ReadinessProbe for ScriptedProbe {
    fn poll(&self) -> ProbeFuture<'_> {
        *self.polls.lock().expect("probe lock") += 1;
        let outcome = self
            .script
            .lock()
            .expect("probe lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().expect("probe lock").clone());
        Box::pin(async move { outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::tests::canned_server;
    use ember_resource::memory::Simulation;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn not_ready_until_tasks_run() {
        let sim = Simulation::new();
        let addr = canned_server("HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n").await;
        let prober = ExecutorProber::new(sim.service.clone(), &addr, "/health", 1, TIMEOUT);

        assert!(matches!(prober.poll().await, ProbeOutcome::NotReady(_)));

        sim.service.set_observed(1);
        assert_eq!(prober.poll().await, ProbeOutcome::Ready);
    }

    #[tokio::test]
    async fn unreachable_executor_is_not_ready_not_error() {
        let sim = Simulation::new();
        sim.service.set_observed(1);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let prober = ExecutorProber::new(sim.service.clone(), &addr, "/health", 1, TIMEOUT);
        match prober.poll().await {
            ProbeOutcome::NotReady(reason) => assert!(reason.contains("unreachable")),
            other => panic!("expected NotReady, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_controller_error_is_not_ready() {
        let sim = Simulation::new();
        sim.service.fail_next_read(ResourceError::transient("throttled"));
        let prober = ExecutorProber::new(sim.service.clone(), "127.0.0.1:1", "/health", 1, TIMEOUT);
        assert!(matches!(prober.poll().await, ProbeOutcome::NotReady(_)));
    }

    #[tokio::test]
    async fn permanent_controller_error_is_error() {
        let sim = Simulation::new();
        sim.service.fail_next_read(ResourceError::permanent("ServiceNotFoundException"));
        let prober = ExecutorProber::new(sim.service.clone(), "127.0.0.1:1", "/health", 1, TIMEOUT);
        assert!(matches!(prober.poll().await, ProbeOutcome::Error(_)));
    }

    #[tokio::test]
    async fn malformed_health_answer_is_error() {
        let sim = Simulation::new();
        sim.service.set_observed(1);
        let addr = canned_server("HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n").await;
        let prober = ExecutorProber::new(sim.service.clone(), &addr, "/health", 1, TIMEOUT);
        assert!(matches!(prober.poll().await, ProbeOutcome::Error(_)));
    }

    #[tokio::test]
    async fn scripted_probe_replays_then_falls_back() {
        let probe = ScriptedProbe::sequence(
            vec![
                ProbeOutcome::NotReady("loading".into()),
                ProbeOutcome::NotReady("loading".into()),
            ],
            ProbeOutcome::Ready,
        );
        assert!(matches!(probe.poll().await, ProbeOutcome::NotReady(_)));
        assert!(matches!(probe.poll().await, ProbeOutcome::NotReady(_)));
        assert_eq!(probe.poll().await, ProbeOutcome::Ready);
        assert_eq!(probe.poll().await, ProbeOutcome::Ready);
        assert_eq!(probe.polls(), 4);
    }
}
