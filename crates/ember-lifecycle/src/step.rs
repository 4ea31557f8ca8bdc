//! Steps of the up and down sequences, and how the next one is chosen.

use ember_core::LifecycleState;

/// Direction the caller last asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Up,
    Down,
}

/// One lifecycle step: a single mutating resource call plus confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ScaleUp,
    AttachRoute,
    StartService,
    WarmUp,
    DetachRoute,
    StopService,
    ScaleDown,
}

impl Step {
    /// The state reported while this step is in flight.
    pub fn state(self) -> LifecycleState {
        match self {
            Step::ScaleUp => LifecycleState::ScalingUp,
            Step::AttachRoute => LifecycleState::RouteAttaching,
            Step::StartService => LifecycleState::ServiceStarting,
            Step::WarmUp => LifecycleState::WarmingUp,
            Step::DetachRoute => LifecycleState::RouteDetaching,
            Step::StopService => LifecycleState::ServiceStopping,
            Step::ScaleDown => LifecycleState::ScalingDown,
        }
    }

    pub fn intent(self) -> Intent {
        match self {
            Step::ScaleUp | Step::AttachRoute | Step::StartService | Step::WarmUp => Intent::Up,
            Step::DetachRoute | Step::StopService | Step::ScaleDown => Intent::Down,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::ScaleUp => "scale_up",
            Step::AttachRoute => "attach_route",
            Step::StartService => "start_service",
            Step::WarmUp => "warm_up",
            Step::DetachRoute => "detach_route",
            Step::StopService => "stop_service",
            Step::ScaleDown => "scale_down",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One flag per resource the sequences touch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Compute group scaled to the desired capacity.
    pub capacity: bool,
    /// Download route attached.
    pub route: bool,
    /// Executor tasks running.
    pub service: bool,
    /// Executor passed its health probe.
    pub warm: bool,
}

impl Flags {
    /// Every resource set.
    pub fn all() -> Self {
        Self {
            capacity: true,
            route: true,
            service: true,
            warm: true,
        }
    }
}

/// What the driver has done to the outside world.
///
/// `applied` is set just before a mutating up-call is issued and cleared
/// once the matching down-step confirms, so it over-approximates what may
/// be in effect and the unwind never leaves anything behind. `confirmed`
/// records which up-steps this run has verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub applied: Flags,
    pub confirmed: Flags,
}

/// Pick the step to run for `intent` given `progress`, or `None` once the
/// cluster has reached the intended end state.
///
/// Going down only undoes what was applied, in reverse order.
pub fn next_step(intent: Intent, progress: &Progress) -> Option<Step> {
    let Progress { applied, confirmed } = progress;
    match intent {
        Intent::Up => {
            if !confirmed.capacity {
                Some(Step::ScaleUp)
            } else if !confirmed.route {
                Some(Step::AttachRoute)
            } else if !confirmed.service {
                Some(Step::StartService)
            } else if !confirmed.warm {
                Some(Step::WarmUp)
            } else {
                None
            }
        }
        Intent::Down => {
            if applied.route {
                Some(Step::DetachRoute)
            } else if applied.service {
                Some(Step::StopService)
            } else if applied.capacity {
                Some(Step::ScaleDown)
            } else {
                None
            }
        }
    }
}
