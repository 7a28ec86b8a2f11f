//! Per-pool autoscaling state machine.
//!
//! ```text
//!            every sample > upper              change applied
//!   Stable ────────────────────▶ ScalingOut ───────────────▶ Cooldown
//!     ▲  └───────────────────▶ ScalingIn  ──────────────────▶   │
//!     │      every sample < lower     │  change failed          │
//!     ├───────────────────────────────┘                         │
//!     └──────────────────── cooldown elapsed ───────────────────┘
//! ```
//!
//! [`Autoscaler::observe`] is pure with respect to time: the caller passes
//! `now`, which keeps the machine testable without a clock.

use std::collections::VecDeque;
use std::time::Instant;

use edge_core::topology::{PoolSpec, ScalingPolicy};
use edge_core::PoolName;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Out,
    In,
}

/// A capacity change the loop must carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleDecision {
    pub direction: Direction,
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingState {
    Stable,
    ScalingOut { target: u32 },
    ScalingIn { target: u32 },
    Cooldown { until: Instant },
}

/// Scaling brain for one pool. Holds no reference to any other pool.
#[derive(Debug)]
pub struct Autoscaler {
    pool: PoolName,
    policy: ScalingPolicy,
    min: u32,
    max: u32,
    current: u32,
    state: ScalingState,
    window: VecDeque<f64>,
}

impl Autoscaler {
    #[must_use]
    pub fn new(pool: PoolName, policy: ScalingPolicy, min: u32, desired: u32, max: u32) -> Self {
        Self {
            pool,
            policy,
            min,
            max,
            current: desired.clamp(min, max),
            state: ScalingState::Stable,
            window: VecDeque::with_capacity(policy.evaluation_samples),
        }
    }

    #[must_use]
    pub fn for_pool(spec: &PoolSpec) -> Self {
        Self::new(
            spec.name.clone(),
            spec.scaling,
            spec.min_capacity,
            spec.desired_capacity,
            spec.max_capacity,
        )
    }

    #[must_use]
    pub fn pool(&self) -> &PoolName {
        &self.pool
    }

    #[must_use]
    pub fn state(&self) -> ScalingState {
        self.state
    }

    /// Capacity the pool is believed to run at.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Feed one utilization sample (percent). Returns a decision when the
    /// window agrees and the bound allows a change; the machine then waits
    /// in `ScalingOut`/`ScalingIn` until [`Self::applied`] or [`Self::failed`].
    pub fn observe(&mut self, now: Instant, utilization: f64) -> Option<ScaleDecision> {
        match self.state {
            ScalingState::Cooldown { until } if now < until => return None,
            ScalingState::Cooldown { .. } => {
                tracing::debug!(pool = %self.pool, "cooldown over");
                self.state = ScalingState::Stable;
            }
            ScalingState::ScalingOut { .. } | ScalingState::ScalingIn { .. } => return None,
            ScalingState::Stable => {}
        }
        if !utilization.is_finite() || utilization < 0.0 {
            return None;
        }

        self.window.push_back(utilization);
        while self.window.len() > self.policy.evaluation_samples {
            self.window.pop_front();
        }
        if self.window.len() < self.policy.evaluation_samples {
            return None;
        }

        let decision = if self.window.iter().all(|u| *u > self.policy.upper_threshold) {
            let to = self.scale_out_target();
            (to > self.current).then_some(ScaleDecision {
                direction: Direction::Out,
                from: self.current,
                to,
            })
        } else if self.window.iter().all(|u| *u < self.policy.lower_threshold) {
            let to = self.current.saturating_sub(1).max(self.min);
            (to < self.current).then_some(ScaleDecision {
                direction: Direction::In,
                from: self.current,
                to,
            })
        } else {
            None
        };

        if let Some(d) = decision {
            self.state = match d.direction {
                Direction::Out => ScalingState::ScalingOut { target: d.to },
                Direction::In => ScalingState::ScalingIn { target: d.to },
            };
        }
        decision
    }

    /// No instance of the pool is healthy, so there is nothing to sample.
    ///
    /// Re-asserts `max(current, min, 1)` so the orchestrator replaces what
    /// was lost. Goes through the same pending and cooldown states as a
    /// sampled decision, so it repeats at most once per cooldown.
    pub fn observe_empty(&mut self, now: Instant) -> Option<ScaleDecision> {
        match self.state {
            ScalingState::Cooldown { until } if now < until => return None,
            ScalingState::ScalingOut { .. } | ScalingState::ScalingIn { .. } => return None,
            ScalingState::Cooldown { .. } | ScalingState::Stable => {}
        }
        self.window.clear();
        let to = self.current.max(self.min).max(1).min(self.max);
        if to == 0 {
            self.state = ScalingState::Stable;
            return None;
        }
        self.state = ScalingState::ScalingOut { target: to };
        Some(ScaleDecision { direction: Direction::Out, from: 0, to })
    }

    /// The pending change took effect; start the cooldown.
    pub fn applied(&mut self, now: Instant) {
        let target = match self.state {
            ScalingState::ScalingOut { target } | ScalingState::ScalingIn { target } => target,
            ScalingState::Stable | ScalingState::Cooldown { .. } => return,
        };
        self.current = target;
        self.window.clear();
        self.state = ScalingState::Cooldown { until: now + self.policy.cooldown };
    }

    /// The pending change was not carried out; evaluate again next sample.
    pub fn failed(&mut self) {
        if matches!(self.state, ScalingState::ScalingOut { .. } | ScalingState::ScalingIn { .. }) {
            self.state = ScalingState::Stable;
        }
    }

    fn mean(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let n = self.window.len().max(1) as f64;
        self.window.iter().sum::<f64>() / n
    }

    /// Target tracking toward the upper threshold, at least one step, at
    /// most `max_step`, never above `max`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn scale_out_target(&self) -> u32 {
        let ceiling = self.max.min(self.current.saturating_add(self.policy.max_step));
        let floor = self.current.saturating_add(1).min(ceiling);
        let wanted = (f64::from(self.current) * self.mean() / self.policy.upper_threshold).ceil();
        wanted.clamp(f64::from(floor), f64::from(ceiling)) as u32
    }
}
