//! ember-lifecycle — the executor lifecycle state machine.
//!
//! Drives one executor cluster between `Stopped` and `Ready` by
//! sequencing the resource clients:
//!
//! ```text
//! start: ScalingUp → RouteAttaching → ServiceStarting → WarmingUp → Ready
//! stop:  RouteDetaching → ServiceStopping → ScalingDown → Stopped
//! ```
//!
//! # Concurrency
//!
//! `start()` and `stop()` only record the caller's intent and return.
//! A single driver task per cluster executes the steps, so at most one
//! transition is ever in flight. The driver picks each step from the
//! current intent and what has been applied so far; flipping the intent
//! mid-sequence reverses direction at the next step boundary and only
//! undoes what was actually applied.
//!
//! Status reads go through a `watch` channel and never wait on the
//! driver; callers may observe intermediate states.
//!
//! # Failure
//!
//! Each step is one mutating resource call followed by confirmation
//! polling, bounded by a per-step timeout. Transient errors and timeouts
//! are retried with exponential backoff; permanent errors and exhausted
//! retries move the cluster to `Failed`, which only an explicit `start`
//! or `stop` leaves.

pub mod machine;
pub mod step;

pub use machine::{Lifecycle, LifecycleObserver, WaitError};
pub use step::{Flags, Intent, Progress, Step, next_step};
