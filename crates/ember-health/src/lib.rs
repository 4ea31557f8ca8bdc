//! ember-health — decides when a started executor can actually serve.
//!
//! A running container is not the same as a loaded inference engine, so
//! readiness needs two signals:
//!
//! ```text
//! ExecutorProber::poll()
//!   ├── ServiceController::running_tasks() >= expected
//!   └── liveness_probe(GET /health) → Alive
//! ```
//!
//! An unreachable endpoint is expected while the executor's network comes
//! up and is reported as `NotReady`. Only a terminal answer (4xx, a
//! malformed body, a permanent control-plane error) is an `Error`.

pub mod liveness;
pub mod prober;

pub use liveness::{Liveness, liveness_probe};
pub use prober::{ExecutorProber, ProbeFuture, ProbeOutcome, ReadinessProbe, ScriptedProbe};
