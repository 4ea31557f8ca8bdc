//! The lifecycle driver.
//!
//! [`Lifecycle`] is cheap to clone; every clone drives the same cluster.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use ember_core::{
    ClusterStatus, ErrorKind, ErrorRecord, LifecycleConfig, LifecycleState, ResourceError,
    ResourceResult, epoch_secs,
};
use ember_health::{ProbeOutcome, ReadinessProbe};
use ember_resource::ResourceClients;

use crate::step::{Flags, Intent, Progress, Step, next_step};

/// Published view of the cluster. Only the driver and the intent calls
/// write it; everyone else reads a clone.
#[derive(Debug, Clone)]
struct Snapshot {
    state: LifecycleState,
    last_error: Option<ErrorRecord>,
    entered_at: Instant,
    last_transition_at: u64,
    desired_capacity: u32,
    route_attached: bool,
    /// The route is confirmed in place, not just requested.
    route_usable: bool,
    estimated_ready_by: Option<u64>,
}

impl Snapshot {
    fn to_status(&self) -> ClusterStatus {
        ClusterStatus {
            state: self.state,
            last_error: self.last_error.clone(),
            elapsed_in_state_ms: u64::try_from(self.entered_at.elapsed().as_millis())
                .unwrap_or(u64::MAX),
            last_transition_at: self.last_transition_at,
            desired_capacity: self.desired_capacity,
            route_attached: self.route_attached,
            estimated_ready_by: self.estimated_ready_by,
        }
    }
}

/// Mutable control state, guarded by the per-cluster lock. The lock is
/// never held across an await.
#[derive(Debug)]
struct Control {
    intent: Intent,
    driver_active: bool,
    /// Set while `reconcile` reads the resources. Intent calls arriving
    /// meanwhile are queued in `requested` and applied when it finishes.
    reconciling: bool,
    requested: Option<Intent>,
    progress: Progress,
}

/// Why a step stopped before completing.
enum Abort {
    /// The caller reversed direction.
    Cancelled,
    Failed(ErrorRecord),
}

/// Outcome of one attempt at a step.
enum AttemptError {
    Cancelled,
    Retryable(ErrorRecord),
    Fatal(ErrorRecord),
}

impl From<ResourceError> for AttemptError {
    fn from(err: ResourceError) -> Self {
        let record = ErrorRecord::from(&err);
        if err.is_transient() {
            AttemptError::Retryable(record)
        } else {
            AttemptError::Fatal(record)
        }
    }
}

/// Error from [`Lifecycle::wait_ready`] and [`Lifecycle::wait_settled`].
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("executor not settled within {timeout:?} (state: {})", .status.state)]
    Timeout {
        timeout: Duration,
        status: ClusterStatus,
    },

    #[error("executor settled in {} instead of ready", .status.state)]
    Settled { status: ClusterStatus },
}

impl WaitError {
    pub fn status(&self) -> &ClusterStatus {
        match self {
            WaitError::Timeout { status, .. } | WaitError::Settled { status } => status,
        }
    }
}

struct Inner {
    clients: ResourceClients,
    probe: Arc<dyn ReadinessProbe>,
    config: LifecycleConfig,
    control: Mutex<Control>,
    intent_tx: watch::Sender<Intent>,
    status_tx: watch::Sender<Snapshot>,
}

/// Drives one executor cluster between `Stopped` and `Ready`.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new(
        clients: ResourceClients,
        probe: Arc<dyn ReadinessProbe>,
        config: LifecycleConfig,
    ) -> Self {
        let snapshot = Snapshot {
            state: LifecycleState::Stopped,
            last_error: None,
            entered_at: Instant::now(),
            last_transition_at: epoch_secs(),
            desired_capacity: config.desired_capacity,
            route_attached: false,
            route_usable: false,
            estimated_ready_by: None,
        };
        let (status_tx, _) = watch::channel(snapshot);
        let (intent_tx, _) = watch::channel(Intent::Down);

        Self {
            inner: Arc::new(Inner {
                clients,
                probe,
                config,
                control: Mutex::new(Control {
                    intent: Intent::Down,
                    driver_active: false,
                    reconciling: false,
                    requested: None,
                    progress: Progress::default(),
                }),
                intent_tx,
                status_tx,
            }),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    /// Ask for the executor to be up. Returns at once with the new status.
    ///
    /// A no-op while already going up or ready. While going down, the
    /// driver reverses at its next step boundary. From `Stopped` or
    /// `Failed` the up-sequence starts from the beginning.
    pub fn start(&self) -> ClusterStatus {
        let inner = &self.inner;
        let mut control = inner.control();
        let state = inner.state();

        match (control.intent, control.driver_active) {
            _ if control.reconciling => {
                info!(%state, "start requested during reconciliation, queued");
                control.requested = Some(Intent::Up);
                inner.set_intent(&mut control, Intent::Up);
            }
            (Intent::Up, true) => debug!(%state, "start ignored, already starting"),
            (Intent::Up, false) if state == LifecycleState::Ready => {
                debug!("start ignored, executor ready");
            }
            (Intent::Down, true) => {
                info!(%state, "start requested while stopping, reversing");
                inner.set_intent(&mut control, Intent::Up);
            }
            (_, false) => {
                info!(%state, "starting executor");
                control.progress.confirmed = Flags::default();
                inner.set_intent(&mut control, Intent::Up);
                inner.launch(&mut control);
            }
        }

        drop(control);
        inner.status()
    }

    /// Ask for the executor to be down. Returns at once with the new status.
    ///
    /// A no-op while already stopping or stopped. Mid start-up, the driver
    /// unwinds whatever it applied. From `Failed` the full down-sequence
    /// runs.
    pub fn stop(&self) -> ClusterStatus {
        let inner = &self.inner;
        let mut control = inner.control();
        let state = inner.state();

        match (control.intent, control.driver_active) {
            _ if control.reconciling => {
                info!(%state, "stop requested during reconciliation, queued");
                control.requested = Some(Intent::Down);
                inner.set_intent(&mut control, Intent::Down);
            }
            (Intent::Down, true) => debug!(%state, "stop ignored, already stopping"),
            (Intent::Down, false) if state == LifecycleState::Stopped => {
                debug!("stop ignored, executor stopped");
            }
            (Intent::Up, true) => {
                info!(%state, "stop requested during start-up, unwinding");
                inner.set_intent(&mut control, Intent::Down);
            }
            (_, false) => {
                info!(%state, "stopping executor");
                if state == LifecycleState::Failed {
                    control.progress.applied = Flags::all();
                }
                inner.set_intent(&mut control, Intent::Down);
                inner.launch(&mut control);
            }
        }

        drop(control);
        inner.status()
    }

    /// Current status. Never waits on an in-flight transition.
    pub fn status(&self) -> ClusterStatus {
        self.inner.status()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    /// A read-only handle for components that gate on the lifecycle.
    pub fn observer(&self) -> LifecycleObserver {
        LifecycleObserver {
            rx: self.inner.status_tx.subscribe(),
        }
    }

    /// Wait until the cluster settles in `Ready`, `Stopped` or `Failed`.
    pub async fn wait_settled(&self, timeout: Duration) -> Result<ClusterStatus, WaitError> {
        let mut rx = self.inner.status_tx.subscribe();
        let settled = tokio::time::timeout(timeout, async {
            rx.wait_for(|snap| snap.state.is_settled())
                .await
                .map(|snap| snap.to_status())
        })
        .await;

        match settled {
            Ok(Ok(status)) => Ok(status),
            _ => Err(WaitError::Timeout {
                timeout,
                status: self.status(),
            }),
        }
    }

    /// Wait until the cluster is `Ready`. Settling anywhere else is an error.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<ClusterStatus, WaitError> {
        let status = self.wait_settled(timeout).await?;
        if status.state == LifecycleState::Ready {
            Ok(status)
        } else {
            Err(WaitError::Settled { status })
        }
    }

    /// Derive the lifecycle state from the resources as they are right now.
    ///
    /// Meant for process start, before any `start`/`stop`. Nothing up means
    /// `Stopped`; everything up means `Ready`, or `WarmingUp` if the probe
    /// does not pass yet; anything in between is `Failed` and needs an
    /// explicit `start` or `stop`.
    ///
    /// A `start` or `stop` made while the reads are in flight is held back
    /// and then driven from the observed resources.
    pub async fn reconcile(&self) -> ClusterStatus {
        let inner = &self.inner;
        {
            let mut control = inner.control();
            if control.driver_active || control.reconciling {
                warn!("reconcile skipped, a transition is in flight");
                drop(control);
                return inner.status();
            }
            control.reconciling = true;
            control.requested = None;
        }

        let observed = inner.observe_all().await;
        let ready = match &observed {
            Ok((capacity, tasks, true)) if *capacity > 0 && *tasks > 0 => {
                matches!(inner.probe.poll().await, ProbeOutcome::Ready)
            }
            _ => false,
        };

        let mut control = inner.control();
        control.reconciling = false;
        let requested = control.requested.take();

        let (capacity, tasks, route) = match observed {
            Ok(observed) => observed,
            Err(e) => {
                error!(error = %e, "could not read executor resources during reconcile");
                control.progress.applied = Flags::all();
                inner.set_error(Some(ErrorRecord::from(&e)));
                match requested {
                    Some(intent) => {
                        inner.set_intent(&mut control, intent);
                        inner.launch(&mut control);
                    }
                    None => inner.enter(&control, LifecycleState::Failed),
                }
                drop(control);
                return inner.status();
            }
        };

        let found = Flags {
            capacity: capacity > 0,
            route,
            service: tasks > 0,
            warm: false,
        };
        let all_up = found.capacity && found.route && found.service;
        info!(capacity, tasks, route, "reconciling executor resources");

        control.progress = Progress {
            applied: found,
            confirmed: if all_up {
                Flags {
                    warm: ready,
                    ..found
                }
            } else {
                Flags::default()
            },
        };

        if let Some(intent) = requested {
            info!(?intent, "applying request made during reconciliation");
            inner.set_intent(&mut control, intent);
            inner.launch(&mut control);
        } else if found == Flags::default() {
            inner.set_intent(&mut control, Intent::Down);
            inner.enter(&control, LifecycleState::Stopped);
        } else if all_up {
            inner.set_intent(&mut control, Intent::Up);
            if ready {
                inner.enter(&control, LifecycleState::Ready);
            } else {
                info!("executor resources up but not ready, resuming warm-up");
                inner.launch(&mut control);
            }
        } else {
            let message = format!(
                "inconsistent executor resources at boot: capacity={capacity}, \
                 running tasks={tasks}, route attached={route}"
            );
            warn!("{message}");
            inner.set_intent(&mut control, Intent::Down);
            inner.set_error(Some(ErrorRecord::new(ErrorKind::PermanentResource, message)));
            inner.enter(&control, LifecycleState::Failed);
        }

        drop(control);
        inner.status()
    }
}

/// Read-only view of a [`Lifecycle`]; holds no authority to change it.
#[derive(Clone)]
pub struct LifecycleObserver {
    rx: watch::Receiver<Snapshot>,
}

impl LifecycleObserver {
    pub fn state(&self) -> LifecycleState {
        self.rx.borrow().state
    }

    pub fn status(&self) -> ClusterStatus {
        self.rx.borrow().to_status()
    }

    /// An attach has been issued and not yet undone. Over-reports while the
    /// attach is in flight.
    pub fn route_attached(&self) -> bool {
        self.rx.borrow().route_attached
    }

    /// The route is confirmed attached and downloads can use it.
    pub fn route_usable(&self) -> bool {
        self.rx.borrow().route_usable
    }
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().expect("lifecycle lock")
    }

    fn state(&self) -> LifecycleState {
        self.status_tx.borrow().state
    }

    fn status(&self) -> ClusterStatus {
        self.status_tx.borrow().to_status()
    }

    fn set_intent(&self, control: &mut Control, intent: Intent) {
        control.intent = intent;
        self.intent_tx.send_replace(intent);
    }

    fn set_error(&self, record: Option<ErrorRecord>) {
        self.status_tx.send_modify(|snap| snap.last_error = record);
    }

    /// Publish `state`. The state clock restarts only on an actual change.
    fn enter(&self, control: &Control, state: LifecycleState) {
        let route_attached = control.progress.applied.route;
        let route_usable = control.progress.confirmed.route;
        let starting = state.is_up() && state != LifecycleState::Ready;
        let estimate = self.config.ready_estimate.as_secs();

        let mut previous = None;
        self.status_tx.send_modify(|snap| {
            snap.route_attached = route_attached;
            snap.route_usable = route_usable;
            if snap.state != state {
                previous = Some(snap.state);
                snap.state = state;
                snap.entered_at = Instant::now();
                snap.last_transition_at = epoch_secs();
            }
            snap.estimated_ready_by = match (starting, snap.estimated_ready_by) {
                (true, Some(at)) => Some(at),
                (true, None) => Some(epoch_secs() + estimate),
                (false, _) => None,
            };
        });

        if let Some(from) = previous {
            info!(%from, to = %state, "executor lifecycle transition");
        }
    }

    fn update_progress(&self, f: impl FnOnce(&mut Progress)) {
        let mut control = self.control();
        f(&mut control.progress);
        let attached = control.progress.applied.route;
        let usable = control.progress.confirmed.route;
        drop(control);
        self.status_tx.send_if_modified(|snap| {
            let changed = snap.route_attached != attached || snap.route_usable != usable;
            snap.route_attached = attached;
            snap.route_usable = usable;
            changed
        });
    }

    /// Spawn the driver for the current intent, or settle at once if there
    /// is nothing to do. Caller holds the control lock.
    fn launch(self: &Arc<Self>, control: &mut Control) {
        match next_step(control.intent, &control.progress) {
            Some(step) => {
                control.driver_active = true;
                self.enter(control, step.state());
                tokio::spawn(Arc::clone(self).drive());
            }
            None => {
                let settled = match control.intent {
                    Intent::Up => LifecycleState::Ready,
                    Intent::Down => LifecycleState::Stopped,
                };
                self.enter(control, settled);
            }
        }
    }

    async fn drive(self: Arc<Self>) {
        loop {
            let step = {
                let mut control = self.control();
                match next_step(control.intent, &control.progress) {
                    Some(step) => {
                        self.enter(&control, step.state());
                        step
                    }
                    None => {
                        control.driver_active = false;
                        let settled = match control.intent {
                            Intent::Up => LifecycleState::Ready,
                            Intent::Down => LifecycleState::Stopped,
                        };
                        self.enter(&control, settled);
                        return;
                    }
                }
            };

            match self.run_step(step).await {
                Ok(()) => self.set_error(None),
                Err(Abort::Cancelled) => debug!(%step, "step abandoned, intent changed"),
                Err(Abort::Failed(record)) => {
                    let mut control = self.control();
                    self.set_error(Some(record.clone()));
                    if control.intent == step.intent() {
                        control.driver_active = false;
                        self.enter(&control, LifecycleState::Failed);
                        error!(
                            %step,
                            kind = %record.kind,
                            error = %record.message,
                            "executor lifecycle failed"
                        );
                        return;
                    }
                    warn!(
                        %step,
                        error = %record.message,
                        "step failed after intent changed, continuing"
                    );
                }
            }
        }
    }

    fn bounds(&self, step: Step) -> (Duration, u32) {
        let c = &self.config;
        match step {
            Step::ScaleUp | Step::ScaleDown => (c.capacity_timeout, c.max_attempts),
            Step::AttachRoute | Step::DetachRoute => (c.route_timeout, c.max_attempts),
            Step::StartService | Step::StopService => (c.service_timeout, c.max_attempts),
            Step::WarmUp => (c.warmup_timeout, 1),
        }
    }

    /// Run `step` with its timeout, retrying retryable failures with
    /// exponential backoff.
    async fn run_step(&self, step: Step) -> Result<(), Abort> {
        let (timeout, max_attempts) = self.bounds(step);
        let mut backoff = self.config.backoff_base;
        let mut attempt = 1;

        loop {
            let outcome = match tokio::time::timeout(timeout, self.attempt(step)).await {
                Ok(result) => result,
                Err(_) => Err(AttemptError::Retryable(ErrorRecord::new(
                    ErrorKind::Timeout,
                    format!("{step} not confirmed within {timeout:?}"),
                ))),
            };

            match outcome {
                Ok(()) => {
                    if attempt > 1 {
                        info!(%step, attempt, "step succeeded after retry");
                    }
                    return Ok(());
                }
                Err(AttemptError::Cancelled) => return Err(Abort::Cancelled),
                Err(AttemptError::Fatal(record)) => return Err(Abort::Failed(record)),
                Err(AttemptError::Retryable(record)) => {
                    if attempt >= max_attempts {
                        return Err(Abort::Failed(record));
                    }
                    warn!(
                        %step,
                        attempt,
                        max_attempts,
                        kind = %record.kind,
                        error = %record.message,
                        backoff_ms = backoff.as_millis() as u64,
                        "step failed, retrying"
                    );
                    if self.pause(backoff, step.intent()).await.is_err() {
                        return Err(Abort::Cancelled);
                    }
                    backoff = backoff.saturating_mul(2).min(self.config.backoff_max);
                    attempt += 1;
                }
            }
        }
    }

    /// One mutating call, then poll until the change is observed.
    async fn attempt(&self, step: Step) -> Result<(), AttemptError> {
        let direction = step.intent();
        if self.control().intent != direction {
            return Err(AttemptError::Cancelled);
        }

        self.update_progress(|p| match step {
            Step::ScaleUp => p.applied.capacity = true,
            Step::AttachRoute => p.applied.route = true,
            Step::StartService => p.applied.service = true,
            Step::WarmUp => {}
            Step::DetachRoute => {
                p.confirmed.warm = false;
                p.confirmed.route = false;
            }
            Step::StopService => {
                p.confirmed.warm = false;
                p.confirmed.service = false;
            }
            Step::ScaleDown => {
                p.confirmed.warm = false;
                p.confirmed.capacity = false;
            }
        });

        self.mutate(step).await?;

        let interval = match step {
            Step::WarmUp => self.config.probe_interval,
            _ => self.config.confirm_interval,
        };
        loop {
            match self.confirmed(step).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    debug!(%step, error = %e, "confirmation read failed");
                }
                Err(e) => return Err(AttemptError::Fatal(ErrorRecord::from(&e))),
            }
            self.pause(interval, direction).await?;
        }

        self.update_progress(|p| match step {
            Step::ScaleUp => p.confirmed.capacity = true,
            Step::AttachRoute => p.confirmed.route = true,
            Step::StartService => p.confirmed.service = true,
            Step::WarmUp => p.confirmed.warm = true,
            Step::DetachRoute => p.applied.route = false,
            Step::StopService => p.applied.service = false,
            Step::ScaleDown => p.applied.capacity = false,
        });
        Ok(())
    }

    async fn mutate(&self, step: Step) -> ResourceResult<()> {
        let n = self.config.desired_capacity;
        let clients = &self.clients;
        match step {
            Step::ScaleUp => clients.scaler.set_capacity(n).await,
            Step::AttachRoute => clients.route.attach().await,
            Step::StartService => clients.service.set_desired_tasks(n).await,
            Step::WarmUp => Ok(()),
            Step::DetachRoute => clients.route.detach().await,
            Step::StopService => clients.service.set_desired_tasks(0).await,
            Step::ScaleDown => clients.scaler.set_capacity(0).await,
        }
    }

    /// Whether the effect of `step` is observable yet.
    async fn confirmed(&self, step: Step) -> ResourceResult<bool> {
        let n = self.config.desired_capacity;
        let clients = &self.clients;
        Ok(match step {
            Step::ScaleUp => clients.scaler.current_capacity().await? >= n,
            Step::AttachRoute => clients.route.is_attached().await?,
            Step::StartService => clients.service.running_tasks().await? >= n,
            Step::WarmUp => match self.probe.poll().await {
                ProbeOutcome::Ready => true,
                ProbeOutcome::NotReady(reason) => {
                    debug!(%reason, "executor not ready yet");
                    false
                }
                ProbeOutcome::Error(msg) => {
                    return Err(ResourceError::permanent(format!(
                        "executor health check failed: {msg}"
                    )));
                }
            },
            Step::DetachRoute => !clients.route.is_attached().await?,
            Step::StopService => clients.service.running_tasks().await? == 0,
            Step::ScaleDown => clients.scaler.current_capacity().await? == 0,
        })
    }

    async fn observe_all(&self) -> ResourceResult<(u32, u32, bool)> {
        let capacity = self.clients.scaler.current_capacity().await?;
        let tasks = self.clients.service.running_tasks().await?;
        let route = self.clients.route.is_attached().await?;
        Ok((capacity, tasks, route))
    }

    /// Sleep for `wait`, cut short if the intent moves away from `direction`.
    async fn pause(&self, wait: Duration, direction: Intent) -> Result<(), AttemptError> {
        let mut intent = self.intent_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = intent.wait_for(|i| *i != direction) => Err(AttemptError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_health::ScriptedProbe;
    use ember_resource::memory::{MemoryScaler, ResourceCall, Simulation};
    use ember_resource::{ComputeScaler, ResourceFuture};

    const SETTLE: Duration = Duration::from_secs(600);

    fn config() -> LifecycleConfig {
        LifecycleConfig {
            desired_capacity: 1,
            capacity_timeout: Duration::from_secs(60),
            route_timeout: Duration::from_secs(60),
            service_timeout: Duration::from_secs(60),
            warmup_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_secs(1),
            confirm_interval: Duration::from_secs(1),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            ready_estimate: Duration::from_secs(120),
        }
    }

    fn fixture_with(
        sim: &Simulation,
        probe: ScriptedProbe,
        config: LifecycleConfig,
    ) -> (Arc<ScriptedProbe>, Lifecycle) {
        let probe = Arc::new(probe);
        let lifecycle = Lifecycle::new(sim.clients(), probe.clone(), config);
        (probe, lifecycle)
    }

    fn fixture(sim: &Simulation) -> Lifecycle {
        fixture_with(sim, ScriptedProbe::always(ProbeOutcome::Ready), config()).1
    }

    async fn reach(lifecycle: &Lifecycle, state: LifecycleState) {
        for _ in 0..6000 {
            if lifecycle.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("never reached {state}, stuck in {}", lifecycle.state());
    }

    fn assert_torn_down(sim: &Simulation) {
        assert_eq!(sim.scaler.target(), 0, "capacity left up");
        assert_eq!(sim.service.target(), 0, "tasks left running");
        assert!(!sim.route.target(), "route left attached");
    }

    const UP: [ResourceCall; 3] = [
        ResourceCall::SetCapacity(1),
        ResourceCall::AttachRoute,
        ResourceCall::SetDesiredTasks(1),
    ];

    const DOWN: [ResourceCall; 3] = [
        ResourceCall::DetachRoute,
        ResourceCall::SetDesiredTasks(0),
        ResourceCall::SetCapacity(0),
    ];

    #[tokio::test(start_paused = true)]
    async fn start_reaches_ready() {
        let sim = Simulation::new().with_lag(Duration::from_secs(2));
        let lifecycle = fixture(&sim);

        let status = lifecycle.start();
        assert_eq!(status.state, LifecycleState::ScalingUp);
        assert!(status.estimated_ready_by.is_some());

        let status = lifecycle.wait_ready(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Ready);
        assert!(status.route_attached);
        assert!(status.last_error.is_none());
        assert!(status.estimated_ready_by.is_none());
        assert_eq!(sim.journal.calls(), UP.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_runs_one_sequence() {
        let sim = Simulation::new().with_lag(Duration::from_secs(2));
        let lifecycle = fixture(&sim);

        lifecycle.start();
        let again = lifecycle.start();
        assert!(again.state.is_up());
        lifecycle.wait_ready(SETTLE).await.unwrap();

        let ready = lifecycle.start();
        assert_eq!(ready.state, LifecycleState::Ready);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sim.journal.calls(), UP.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_from_ready_tears_down_in_order() {
        let sim = Simulation::new().with_lag(Duration::from_secs(2));
        let lifecycle = fixture(&sim);
        lifecycle.start();
        lifecycle.wait_ready(SETTLE).await.unwrap();
        sim.journal.clear();

        let status = lifecycle.stop();
        assert_eq!(status.state, LifecycleState::RouteDetaching);
        // Idempotent while in flight.
        lifecycle.stop();

        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Stopped);
        assert!(!status.route_attached);
        assert_eq!(sim.journal.calls(), DOWN.to_vec());
        assert_torn_down(&sim);

        assert_eq!(lifecycle.stop().state, LifecycleState::Stopped);
        assert_eq!(sim.journal.calls(), DOWN.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_service_start_skips_service() {
        let sim = Simulation::new();
        sim.route.set_lag(Duration::from_secs(10));
        let lifecycle = fixture(&sim);

        lifecycle.start();
        reach(&lifecycle, LifecycleState::RouteAttaching).await;
        let observer = lifecycle.observer();
        assert!(observer.route_attached());
        assert!(!observer.route_usable());
        lifecycle.stop();

        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Stopped);
        assert!(!observer.route_usable());
        assert_eq!(
            sim.journal.calls(),
            vec![
                ResourceCall::SetCapacity(1),
                ResourceCall::AttachRoute,
                ResourceCall::DetachRoute,
                ResourceCall::SetCapacity(0),
            ]
        );
        assert_eq!(sim.service.mutations(), 0);
        assert_torn_down(&sim);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_service_start_reverts_tasks() {
        let sim = Simulation::new();
        sim.service.set_lag(Duration::from_secs(10));
        let lifecycle = fixture(&sim);

        lifecycle.start();
        reach(&lifecycle, LifecycleState::ServiceStarting).await;
        lifecycle.stop();

        lifecycle.wait_settled(SETTLE).await.unwrap();
        let calls = sim.journal.calls();
        let task_calls: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, ResourceCall::SetDesiredTasks(_)))
            .collect();
        assert_eq!(task_calls.last(), Some(&&ResourceCall::SetDesiredTasks(0)));
        assert_eq!(calls.last(), Some(&ResourceCall::SetCapacity(0)));
        assert_torn_down(&sim);
    }

    #[tokio::test(start_paused = true)]
    async fn interleaved_calls_settle_on_last_intent() {
        let sim = Simulation::new().with_lag(Duration::from_secs(3));
        let lifecycle = fixture(&sim);

        lifecycle.start();
        tokio::time::sleep(Duration::from_secs(2)).await;
        lifecycle.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;
        lifecycle.start();
        tokio::time::sleep(Duration::from_secs(7)).await;
        lifecycle.stop();
        lifecycle.start();

        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Ready);

        lifecycle.stop();
        tokio::time::sleep(Duration::from_secs(4)).await;
        lifecycle.start();
        lifecycle.stop();

        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Stopped);
        assert_torn_down(&sim);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_scaler_errors_are_retried_quietly() {
        let sim = Simulation::new();
        sim.scaler.fail_next(ResourceError::transient("throttled"));
        sim.scaler.fail_next(ResourceError::transient("throttled"));
        let lifecycle = fixture(&sim);

        lifecycle.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let early = lifecycle.status();
        assert_eq!(early.state, LifecycleState::ScalingUp);
        assert!(early.last_error.is_none());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let later = lifecycle.status();
        assert_eq!(later.state, LifecycleState::ScalingUp);
        assert!(later.last_error.is_none());
        assert!(later.elapsed_in_state_ms > early.elapsed_in_state_ms);

        let status = lifecycle.wait_ready(SETTLE).await.unwrap();
        assert!(status.last_error.is_none());
        assert_eq!(sim.journal.count(ResourceCall::SetCapacity(1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_with_last_error() {
        let sim = Simulation::new();
        for _ in 0..3 {
            sim.scaler.fail_next(ResourceError::transient("throttled"));
        }
        let lifecycle = fixture(&sim);

        lifecycle.start();
        let err = lifecycle.wait_ready(SETTLE).await.unwrap_err();
        let status = err.status();
        assert_eq!(status.state, LifecycleState::Failed);
        let last = status.last_error.as_ref().unwrap();
        assert_eq!(last.kind, ErrorKind::TransientResource);
        assert!(sim.journal.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_fails_without_retry() {
        let sim = Simulation::new();
        sim.scaler.fail_next(ResourceError::permanent("AccessDenied"));
        sim.scaler.fail_next(ResourceError::permanent("AccessDenied"));
        let lifecycle = fixture(&sim);

        lifecycle.start();
        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(
            status.last_error.unwrap().kind,
            ErrorKind::PermanentResource
        );

        // Only the first scripted failure was consumed.
        sim.scaler.set_capacity(2).await.unwrap_err();
        assert_eq!(sim.scaler.mutations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_capacity_times_out() {
        let sim = Simulation::new();
        sim.scaler.set_stalled(true);
        let config = LifecycleConfig {
            capacity_timeout: Duration::from_secs(5),
            max_attempts: 2,
            ..config()
        };
        let (_, lifecycle) =
            fixture_with(&sim, ScriptedProbe::always(ProbeOutcome::Ready), config);

        lifecycle.start();
        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(status.last_error.unwrap().kind, ErrorKind::Timeout);
        assert_eq!(sim.scaler.mutations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_fails_then_stop_unwinds() {
        let sim = Simulation::new();
        let (probe, lifecycle) = fixture_with(
            &sim,
            ScriptedProbe::always(ProbeOutcome::NotReady("loading".into())),
            config(),
        );

        lifecycle.start();
        let err = lifecycle.wait_ready(SETTLE).await.unwrap_err();
        let status = err.status();
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(
            status.last_error.as_ref().unwrap().kind,
            ErrorKind::Timeout
        );
        assert!(probe.polls() > 1);

        sim.journal.clear();
        lifecycle.stop();
        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Stopped);
        assert!(status.last_error.is_none());
        assert_eq!(sim.journal.calls(), DOWN.to_vec());
        assert_torn_down(&sim);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_error_is_not_retried() {
        let sim = Simulation::new();
        let (probe, lifecycle) = fixture_with(
            &sim,
            ScriptedProbe::always(ProbeOutcome::Error("bad health answer".into())),
            config(),
        );

        lifecycle.start();
        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(
            status.last_error.unwrap().kind,
            ErrorKind::PermanentResource
        );
        assert_eq!(probe.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_failure_retries_from_the_top() {
        let sim = Simulation::new();
        sim.route.fail_next(ResourceError::permanent("InvalidRouteTableID.NotFound"));
        let lifecycle = fixture(&sim);

        lifecycle.start();
        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Failed);

        let status = lifecycle.start();
        assert_eq!(status.state, LifecycleState::ScalingUp);
        // The failure stays visible until a step succeeds.
        assert!(status.last_error.is_some());

        let status = lifecycle.wait_ready(SETTLE).await.unwrap();
        assert!(status.last_error.is_none());
        assert_eq!(sim.journal.count(ResourceCall::SetCapacity(1)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_times_out_while_warming() {
        let sim = Simulation::new();
        let config = LifecycleConfig {
            warmup_timeout: Duration::from_secs(600),
            ..config()
        };
        let (_, lifecycle) = fixture_with(
            &sim,
            ScriptedProbe::always(ProbeOutcome::NotReady("loading".into())),
            config,
        );

        lifecycle.start();
        let err = lifecycle.wait_ready(Duration::from_secs(20)).await.unwrap_err();
        assert!(matches!(err, WaitError::Timeout { .. }));
        assert_eq!(err.status().state, LifecycleState::WarmingUp);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_follows_transitions() {
        let sim = Simulation::new();
        let lifecycle = fixture(&sim);
        let observer = lifecycle.observer();
        assert_eq!(observer.state(), LifecycleState::Stopped);

        lifecycle.start();
        assert_eq!(observer.state(), LifecycleState::ScalingUp);
        lifecycle.wait_ready(SETTLE).await.unwrap();
        assert_eq!(observer.state(), LifecycleState::Ready);
        assert!(observer.route_attached());
        assert!(observer.route_usable());
        assert_eq!(observer.status().state, LifecycleState::Ready);

        lifecycle.stop();
        reach(&lifecycle, LifecycleState::ServiceStopping).await;
        assert!(!observer.route_usable());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_down_step_error_fails_then_stop_finishes() {
        let sim = Simulation::new();
        let lifecycle = fixture(&sim);
        lifecycle.start();
        lifecycle.wait_ready(SETTLE).await.unwrap();

        sim.route.fail_next(ResourceError::permanent("UnauthorizedOperation"));
        lifecycle.stop();
        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Failed);
        let record = status.last_error.unwrap();
        assert_eq!(record.kind, ErrorKind::PermanentResource);
        assert!(record.message.contains("UnauthorizedOperation"));
        assert_eq!(sim.route.mutations(), 1);

        sim.journal.clear();
        lifecycle.stop();
        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Stopped);
        assert!(status.last_error.is_none());
        assert_eq!(sim.journal.calls(), DOWN.to_vec());
        assert_torn_down(&sim);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_down_step_error_is_retried() {
        let sim = Simulation::new();
        let lifecycle = fixture(&sim);
        lifecycle.start();
        lifecycle.wait_ready(SETTLE).await.unwrap();
        sim.journal.clear();

        sim.service.fail_next(ResourceError::transient("ThrottlingException"));
        lifecycle.stop();
        reach(&lifecycle, LifecycleState::ServiceStopping).await;
        assert!(lifecycle.status().last_error.is_none());

        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Stopped);
        assert!(status.last_error.is_none());
        assert_eq!(sim.journal.calls(), DOWN.to_vec());
        assert_torn_down(&sim);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_nothing_running_is_stopped() {
        let sim = Simulation::new();
        let lifecycle = fixture(&sim);
        let status = lifecycle.reconcile().await;
        assert_eq!(status.state, LifecycleState::Stopped);
        assert!(sim.journal.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_running_executor_is_ready() {
        let sim = Simulation::new();
        sim.scaler.set_observed(1);
        sim.service.set_observed(1);
        sim.route.set_observed(true);
        let lifecycle = fixture(&sim);

        let status = lifecycle.reconcile().await;
        assert_eq!(status.state, LifecycleState::Ready);
        assert!(status.route_attached);
        assert!(sim.journal.calls().is_empty());

        lifecycle.stop();
        lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(sim.journal.calls(), DOWN.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_resumes_warm_up() {
        let sim = Simulation::new();
        sim.scaler.set_observed(1);
        sim.service.set_observed(1);
        sim.route.set_observed(true);
        let (_, lifecycle) = fixture_with(
            &sim,
            ScriptedProbe::sequence(
                vec![
                    ProbeOutcome::NotReady("loading".into()),
                    ProbeOutcome::NotReady("loading".into()),
                ],
                ProbeOutcome::Ready,
            ),
            config(),
        );

        let status = lifecycle.reconcile().await;
        assert_eq!(status.state, LifecycleState::WarmingUp);
        lifecycle.wait_ready(SETTLE).await.unwrap();
        assert!(sim.journal.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_partial_resources_fail() {
        let sim = Simulation::new();
        sim.scaler.set_observed(1);
        let lifecycle = fixture(&sim);

        let status = lifecycle.reconcile().await;
        assert_eq!(status.state, LifecycleState::Failed);
        let record = status.last_error.unwrap();
        assert_eq!(record.kind, ErrorKind::PermanentResource);
        assert!(record.message.contains("capacity=1"));

        lifecycle.stop();
        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Stopped);
        assert_torn_down(&sim);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_read_failure_is_failed() {
        let sim = Simulation::new();
        sim.scaler.fail_next_read(ResourceError::permanent("AccessDenied"));
        let lifecycle = fixture(&sim);

        let status = lifecycle.reconcile().await;
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(
            status.last_error.unwrap().kind,
            ErrorKind::PermanentResource
        );
    }

    /// Scaler whose reads take `delay`, to hold `reconcile` mid-flight.
    struct SlowReads {
        inner: Arc<MemoryScaler>,
        delay: Duration,
    }

    impl ComputeScaler for SlowReads {
        fn set_capacity(&self, n: u32) -> ResourceFuture<'_, ()> {
            self.inner.set_capacity(n)
        }

        fn current_capacity(&self) -> ResourceFuture<'_, u32> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.inner.current_capacity().await
            })
        }
    }

    fn slow_read_fixture(sim: &Simulation) -> Lifecycle {
        let clients = ResourceClients::new(
            Arc::new(SlowReads {
                inner: sim.scaler.clone(),
                delay: Duration::from_secs(3),
            }),
            sim.service.clone(),
            sim.route.clone(),
        );
        Lifecycle::new(
            clients,
            Arc::new(ScriptedProbe::always(ProbeOutcome::Ready)),
            config(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn start_during_reconcile_runs_one_sequence() {
        let sim = Simulation::new();
        let lifecycle = slow_read_fixture(&sim);

        let reconciling = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move { lifecycle.reconcile().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        lifecycle.start();
        // A second reconcile does not interleave with the first.
        assert_eq!(lifecycle.reconcile().await.state, LifecycleState::Stopped);

        let status = reconciling.await.unwrap();
        assert!(status.state.is_up());

        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Ready);
        assert_eq!(sim.journal.calls(), UP.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_reconcile_tears_down_found_resources() {
        let sim = Simulation::new();
        sim.scaler.set_observed(1);
        sim.service.set_observed(1);
        sim.route.set_observed(true);
        let lifecycle = slow_read_fixture(&sim);

        let reconciling = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move { lifecycle.reconcile().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        lifecycle.stop();
        reconciling.await.unwrap();

        let status = lifecycle.wait_settled(SETTLE).await.unwrap();
        assert_eq!(status.state, LifecycleState::Stopped);
        assert_eq!(sim.journal.calls(), DOWN.to_vec());
        assert_torn_down(&sim);
    }
}
