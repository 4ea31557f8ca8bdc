//! In-process simulation of the three control planes.
//!
//! Each simulated resource keeps a requested target and an observed value.
//! The observed value catches up with the target after a configurable lag,
//! which mimics capacity or tasks taking time to come into service.
//! Mutating calls are recorded in a shared [`CallJournal`] so tests can
//! assert on exactly which external calls a lifecycle made, in order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use ember_core::{ResourceError, ResourceResult};

use crate::client::{ComputeScaler, ResourceClients, ResourceFuture, RouteController, ServiceController};

/// A mutating call made against a simulated control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceCall {
    SetCapacity(u32),
    SetDesiredTasks(u32),
    AttachRoute,
    DetachRoute,
}

/// Ordered record of successful mutating calls, shared across simulators.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    calls: Arc<Mutex<Vec<ResourceCall>>>,
}

impl CallJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: ResourceCall) {
        self.calls.lock().expect("journal lock").push(call);
    }

    pub fn calls(&self) -> Vec<ResourceCall> {
        self.calls.lock().expect("journal lock").clone()
    }

    pub fn count(&self, call: ResourceCall) -> usize {
        self.calls
            .lock()
            .expect("journal lock")
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().expect("journal lock").clear();
    }
}

/// Shared knobs and state for one simulated resource.
#[derive(Debug)]
struct SimState<T> {
    observed: T,
    target: T,
    settle_at: Option<Instant>,
    lag: Duration,
    call_delay: Duration,
    stalled: bool,
    failures: VecDeque<ResourceError>,
    read_failures: VecDeque<ResourceError>,
    mutations: u32,
}

impl<T: Copy + PartialEq + std::fmt::Debug> SimState<T> {
    fn new(initial: T) -> Self {
        Self {
            observed: initial,
            target: initial,
            settle_at: None,
            lag: Duration::ZERO,
            call_delay: Duration::ZERO,
            stalled: false,
            failures: VecDeque::new(),
            read_failures: VecDeque::new(),
            mutations: 0,
        }
    }

    fn request(&mut self, target: T) {
        self.mutations += 1;
        self.target = target;
        self.settle_at = Some(Instant::now() + self.lag);
    }

    fn observe(&mut self) -> T {
        if !self.stalled
            && let Some(at) = self.settle_at
            && Instant::now() >= at
        {
            self.observed = self.target;
            self.settle_at = None;
        }
        self.observed
    }
}

/// One simulated resource with the scripting API shared by all three kinds.
#[derive(Debug)]
struct Sim<T> {
    state: Mutex<SimState<T>>,
}

impl<T: Copy + PartialEq + std::fmt::Debug + Send> Sim<T> {
    fn new(initial: T) -> Self {
        Self {
            state: Mutex::new(SimState::new(initial)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState<T>> {
        self.state.lock().expect("sim lock")
    }

    async fn mutate(&self, target: T, journal: &CallJournal, call: ResourceCall) -> ResourceResult<()> {
        let delay = self.lock().call_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(err) = state.failures.pop_front() {
            debug!(?call, error = %err, "simulated call failed");
            return Err(err);
        }
        state.request(target);
        drop(state);

        journal.record(call);
        debug!(?call, "simulated call accepted");
        Ok(())
    }

    fn read(&self) -> ResourceResult<T> {
        let mut state = self.lock();
        if let Some(err) = state.read_failures.pop_front() {
            return Err(err);
        }
        Ok(state.observe())
    }
}

macro_rules! sim_knobs {
    ($ty:ty, $val:ty) => {
        impl $ty {
            /// Delay between a mutating call and the observed value catching up.
            pub fn set_lag(&self, lag: Duration) {
                self.sim.lock().lag = lag;
            }

            /// Time each mutating call takes before it returns.
            pub fn set_call_delay(&self, delay: Duration) {
                self.sim.lock().call_delay = delay;
            }

            /// While stalled, requested changes never become observable.
            pub fn set_stalled(&self, stalled: bool) {
                self.sim.lock().stalled = stalled;
            }

            /// Fail the next mutating call with `err`.
            pub fn fail_next(&self, err: ResourceError) {
                self.sim.lock().failures.push_back(err);
            }

            /// Fail the next read with `err`.
            pub fn fail_next_read(&self, err: ResourceError) {
                self.sim.lock().read_failures.push_back(err);
            }

            /// Force both the observed value and the target, as if set out of band.
            pub fn set_observed(&self, value: $val) {
                let mut state = self.sim.lock();
                state.observed = value;
                state.target = value;
                state.settle_at = None;
            }

            /// The value a read would currently return.
            pub fn observed(&self) -> $val {
                self.sim.lock().observe()
            }

            /// The most recently requested value.
            pub fn target(&self) -> $val {
                self.sim.lock().target
            }

            /// Number of accepted mutating calls.
            pub fn mutations(&self) -> u32 {
                self.sim.lock().mutations
            }
        }
    };
}

// ── Simulated resources ────────────────────────────────────────────

/// Simulated compute group.
#[derive(Debug)]
pub struct MemoryScaler {
    sim: Sim<u32>,
    journal: CallJournal,
}

impl MemoryScaler {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            sim: Sim::new(0),
            journal,
        }
    }
}

sim_knobs!(MemoryScaler, u32);

impl ComputeScaler for MemoryScaler {
    fn set_capacity(&self, n: u32) -> ResourceFuture<'_, ()> {
        Box::pin(self.sim.mutate(n, &self.journal, ResourceCall::SetCapacity(n)))
    }

    fn current_capacity(&self) -> ResourceFuture<'_, u32> {
        Box::pin(async move { self.sim.read() })
    }
}

/// Simulated container service.
#[derive(Debug)]
pub struct MemoryService {
    sim: Sim<u32>,
    journal: CallJournal,
}

impl MemoryService {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            sim: Sim::new(0),
            journal,
        }
    }
}

sim_knobs!(MemoryService, u32);

impl ServiceController for MemoryService {
    fn set_desired_tasks(&self, n: u32) -> ResourceFuture<'_, ()> {
        Box::pin(self.sim.mutate(n, &self.journal, ResourceCall::SetDesiredTasks(n)))
    }

    fn running_tasks(&self) -> ResourceFuture<'_, u32> {
        Box::pin(async move { self.sim.read() })
    }
}

/// Simulated route table.
#[derive(Debug)]
pub struct MemoryRoute {
    sim: Sim<bool>,
    journal: CallJournal,
}

impl MemoryRoute {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            sim: Sim::new(false),
            journal,
        }
    }
}

sim_knobs!(MemoryRoute, bool);

impl RouteController for MemoryRoute {
    fn attach(&self) -> ResourceFuture<'_, ()> {
        Box::pin(self.sim.mutate(true, &self.journal, ResourceCall::AttachRoute))
    }

    fn detach(&self) -> ResourceFuture<'_, ()> {
        Box::pin(self.sim.mutate(false, &self.journal, ResourceCall::DetachRoute))
    }

    fn is_attached(&self) -> ResourceFuture<'_, bool> {
        Box::pin(async move { self.sim.read() })
    }
}

/// A full set of simulated control planes sharing one journal.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub journal: CallJournal,
    pub scaler: Arc<MemoryScaler>,
    pub service: Arc<MemoryService>,
    pub route: Arc<MemoryRoute>,
}

impl Simulation {
    pub fn new() -> Self {
        let journal = CallJournal::new();
        Self {
            scaler: Arc::new(MemoryScaler::new(journal.clone())),
            service: Arc::new(MemoryService::new(journal.clone())),
            route: Arc::new(MemoryRoute::new(journal.clone())),
            journal,
        }
    }

    /// Apply the same confirmation lag to every resource.
    pub fn with_lag(self, lag: Duration) -> Self {
        self.scaler.set_lag(lag);
        self.service.set_lag(lag);
        self.route.set_lag(lag);
        self
    }

    pub fn clients(&self) -> ResourceClients {
        ResourceClients::new(
            self.scaler.clone(),
            self.service.clone(),
            self.route.clone(),
        )
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mutation_is_journaled_and_observed() {
        let sim = Simulation::new();
        let clients = sim.clients();

        clients.scaler.set_capacity(1).await.unwrap();
        clients.route.attach().await.unwrap();

        assert_eq!(clients.scaler.current_capacity().await.unwrap(), 1);
        assert!(clients.route.is_attached().await.unwrap());
        assert_eq!(
            sim.journal.calls(),
            vec![ResourceCall::SetCapacity(1), ResourceCall::AttachRoute]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lag_delays_observation() {
        let sim = Simulation::new().with_lag(Duration::from_secs(10));
        sim.service.set_desired_tasks(1).await.unwrap();

        assert_eq!(sim.service.running_tasks().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(sim.service.running_tasks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let sim = Simulation::new();
        sim.scaler.fail_next(ResourceError::transient("throttled"));
        sim.scaler.fail_next(ResourceError::permanent("denied"));

        assert!(sim.scaler.set_capacity(1).await.unwrap_err().is_transient());
        assert!(!sim.scaler.set_capacity(1).await.unwrap_err().is_transient());
        sim.scaler.set_capacity(1).await.unwrap();

        // Failed calls are not journaled.
        assert_eq!(sim.journal.calls(), vec![ResourceCall::SetCapacity(1)]);
        assert_eq!(sim.scaler.mutations(), 1);
    }

    #[tokio::test]
    async fn stalled_resource_never_settles() {
        let sim = Simulation::new();
        sim.route.set_stalled(true);
        sim.route.attach().await.unwrap();
        assert!(!sim.route.is_attached().await.unwrap());
        assert!(sim.route.target());

        sim.route.set_stalled(false);
        assert!(sim.route.is_attached().await.unwrap());
    }

    #[tokio::test]
    async fn read_failures_do_not_touch_state() {
        let sim = Simulation::new();
        sim.scaler.set_observed(1);
        sim.scaler.fail_next_read(ResourceError::transient("timeout"));

        assert!(sim.scaler.current_capacity().await.is_err());
        assert_eq!(sim.scaler.current_capacity().await.unwrap(), 1);
        assert!(sim.journal.calls().is_empty());
    }

    #[test]
    fn journal_counts_matching_calls() {
        let journal = CallJournal::new();
        journal.record(ResourceCall::SetDesiredTasks(1));
        journal.record(ResourceCall::SetDesiredTasks(0));
        journal.record(ResourceCall::SetDesiredTasks(1));
        assert_eq!(journal.count(ResourceCall::SetDesiredTasks(1)), 2);
        journal.clear();
        assert!(journal.calls().is_empty());
    }
}
