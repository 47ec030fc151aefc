//! Jog engine (spec §4.7): free-running, velocity-targeted motion driven
//! by per-axis normalized inputs in [-1, +1], independent of the queued
//! G-code program, with soft-limit deceleration.

use num_traits::float::Float;

use crate::config::{AxisConfig, MachineConfig, AXES};
use crate::executor::SEGMENT_TIME_MIN;
use crate::scurve::stopping_distance;
use crate::util::clamp;

/// Minimum creep velocity used when a jogging axis is inside the small
/// pre-limit margin of a soft limit (spec §6).
pub const MIN_VELOCITY: f32 = 10.; // mm/min

/// Fraction of the stopping distance used as the "pre-limit margin" inside
/// which the axis is forced down to `MIN_VELOCITY` rather than stopped
/// outright (spec §4.7 step 2).
const PRE_LIMIT_MARGIN_FRACTION: f32 = 0.1;

/// Per-axis normalized velocity input in [-1, +1]. Writer-flag protected
/// per spec §5 "Shared-resource policy": the host sets `updating=true`,
/// writes `values`, then clears the flag; the jog engine's reader skips a
/// pass rather than blocking when it observes `updating==true` mid-write
/// (acceptable because jog updates are continuous).
#[derive(Clone, Copy, Debug, Default)]
pub struct JogInput {
    pub values: [f32; AXES],
    pub updating: bool,
}

impl JogInput {
    /// Reads a consistent snapshot, or `None` if a write is in progress.
    pub fn try_read(&self) -> Option<[f32; AXES]> {
        if self.updating {
            None
        } else {
            Some(self.values)
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct AxisJogState {
    velocity: f32,
    accel: f32,
}

#[derive(Default)]
pub struct JogEngine {
    axes: [AxisJogState; AXES],
}

impl JogEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.axes = [AxisJogState::default(); AXES];
    }

    pub fn velocity(&self, axis: usize) -> f32 {
        self.axes[axis].velocity
    }

    /// Soft-limit-aware target velocity for one axis (spec §4.7 step 2, P8).
    fn limited_target_velocity(axis: &AxisConfig, position: f32, v: f32, a: f32, requested: f32) -> f32 {
        let mut target = requested * axis.velocity_max;

        // If the requested direction reverses current motion, hold at zero
        // until velocity actually crosses zero (spec §4.7 step 1).
        if v != 0. && target != 0. && v.signum() != target.signum() {
            target = 0.;
        }

        if !axis.soft_limits_active() {
            return target;
        }

        let stop_dist = stopping_distance(v, a, axis.accel_max, axis.jerk_max);
        let margin = stop_dist * PRE_LIMIT_MARGIN_FRACTION + 1e-6;

        if target > 0. {
            let dist_to_max = axis.soft_limit_max - position;
            if dist_to_max <= stop_dist {
                return 0.;
            } else if dist_to_max <= stop_dist + margin {
                return target.min(MIN_VELOCITY);
            }
        } else if target < 0. {
            let dist_to_min = position - axis.soft_limit_min;
            if dist_to_min <= stop_dist {
                return 0.;
            } else if dist_to_min <= stop_dist + margin {
                return target.max(-MIN_VELOCITY);
            }
        } else if v > 0. {
            // Coasting toward the max limit with zero input: still must stop.
            let dist_to_max = axis.soft_limit_max - position;
            if dist_to_max <= stop_dist {
                return 0.;
            }
        } else if v < 0. {
            let dist_to_min = position - axis.soft_limit_min;
            if dist_to_min <= stop_dist {
                return 0.;
            }
        }

        target
    }

    /// Jerk-limited step of `accel` toward whatever constant accel would
    /// bring `velocity` to `target_velocity` (spec §4.7 step 3).
    fn next_accel(velocity: f32, target_velocity: f32, accel: f32, accel_max: f32, jerk_max: f32, dt: f32) -> f32 {
        let dv = target_velocity - velocity;
        let desired = if dv.abs() < 1e-6 { 0. } else { clamp(accel_max * dv.signum(), -accel_max, accel_max) };
        let max_step = jerk_max * dt;

        if accel < desired {
            (accel + max_step).min(desired).min(accel_max)
        } else if accel > desired {
            (accel - max_step).max(desired).max(-accel_max)
        } else {
            accel
        }
    }

    /// One jog tick (spec §4.7), called every `SEGMENT_TIME` while
    /// `State::Jogging`. Advances `position` in place and returns the
    /// published planar velocity. `all_idle` reports whether every axis has
    /// reached zero velocity with zero input (caller should then call
    /// `StateMachine::end_jog` and `JogEngine::reset`).
    pub fn tick(&mut self, cfg: &MachineConfig, position: &mut [f32; AXES], input: &[f32; AXES]) -> (f32, bool) {
        let dt = SEGMENT_TIME_MIN;
        let mut sum_sq = 0.;
        let mut all_idle = true;

        for i in 0..AXES {
            let axis = cfg.axis(i);
            if !axis.enabled {
                continue;
            }
            let st = &mut self.axes[i];

            let target_v = Self::limited_target_velocity(axis, position[i], st.velocity, st.accel, input[i]);
            st.accel = Self::next_accel(st.velocity, target_v, st.accel, axis.accel_max, axis.jerk_max, dt);

            let mut v_new = st.velocity + st.accel * dt;
            // Snap once within a jerk-limited step of the target to avoid
            // perpetual small oscillation around it.
            if (v_new - target_v).abs() < (axis.jerk_max * dt * dt).max(1e-4) && st.accel.abs() < 1e-3 {
                v_new = target_v;
            }
            st.velocity = v_new;

            position[i] += st.velocity * dt;
            sum_sq += st.velocity * st.velocity;

            if st.velocity.abs() > 1e-3 || input[i].abs() > 1e-3 {
                all_idle = false;
            }
        }

        (sum_sq.sqrt(), all_idle)
    }
}
