//! Seven-phase jerk-limited S-curve kinematics (spec §4.4).
//!
//! Pure math: given a phase's constant jerk `j` and the accel/velocity at
//! phase entry, integrate distance and velocity over an elapsed time `t`
//! within the phase. No knowledge of axes, segments, or the queue lives
//! here — `executor.rs` drives this module one phase, one sub-segment, at
//! a time.

use num_traits::float::Float;

/// One of the seven constant-jerk intervals of a move's velocity profile.
/// Phases with zero duration are skipped by the caller; this type only
/// orders the sequence.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
#[repr(u8)]
pub enum Phase {
    /// J+: jerk up from rest (or cruise) accel.
    JerkUp0 = 0,
    /// A+ cruise: constant positive acceleration.
    AccelCruise = 1,
    /// J-: jerk down to zero accel at cruise velocity.
    JerkDown0 = 2,
    /// V cruise: constant velocity.
    VelocityCruise = 3,
    /// J-: jerk down, beginning deceleration.
    JerkDown1 = 4,
    /// A- cruise: constant negative acceleration.
    DecelCruise = 5,
    /// J+: jerk up, bringing accel back to zero at the end velocity.
    JerkUp1 = 6,
}

impl Phase {
    pub const COUNT: usize = 7;

    pub fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(Phase::JerkUp0),
            1 => Some(Phase::AccelCruise),
            2 => Some(Phase::JerkDown0),
            3 => Some(Phase::VelocityCruise),
            4 => Some(Phase::JerkDown1),
            5 => Some(Phase::DecelCruise),
            6 => Some(Phase::JerkUp1),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::from_index(self as usize + 1)
    }
}

/// Durations of each of the seven phases, in the same time units as the
/// velocity/accel/jerk magnitudes use (minutes, to match mm/min feed rates,
/// or any consistent unit system the caller chooses).
#[derive(Clone, Copy, Debug, Default, defmt::Format)]
pub struct PhaseTimes(pub [f32; Phase::COUNT]);

impl PhaseTimes {
    pub fn total(&self) -> f32 {
        self.0.iter().sum()
    }
}

/// The (jerk, entry-accel) pair that applies during a given phase, as a
/// function of `jerk_max` and the duration of the jerk phases (spec §4.4).
///
/// `t0` is phase 0's duration (used to derive phase 1's constant accel,
/// `Jmax*T0`); `t4` is phase 4's duration (used for phase 5's constant
/// accel, `-Jmax*T4`).
pub fn phase_jerk_and_accel(phase: Phase, jerk_max: f32, t0: f32, t4: f32) -> (f32, f32) {
    match phase {
        Phase::JerkUp0 => (jerk_max, 0.),
        Phase::AccelCruise => (0., jerk_max * t0),
        Phase::JerkDown0 => (-jerk_max, jerk_max * t0),
        Phase::VelocityCruise => (0., 0.),
        Phase::JerkDown1 => (-jerk_max, 0.),
        Phase::DecelCruise => (0., -jerk_max * t4),
        Phase::JerkUp1 => (jerk_max, -jerk_max * t4),
    }
}

/// Closed-form distance integrated over elapsed time `t` within a phase,
/// given entry velocity `v`, entry accel `a`, and the phase's constant
/// jerk `j` (spec §4.4): `d(t) = t*(v + t*(a/2 + j*t/6))`.
pub fn integrate_distance(t: f32, v: f32, a: f32, j: f32) -> f32 {
    t * (v + t * (a / 2. + j * t / 6.))
}

/// Closed-form velocity at elapsed time `t` within a phase (spec §4.4):
/// `v(t) = v + t*(a + j*t/2)`. Note the entry velocity `v` is added
/// explicitly here (the spec's per-phase formula gives the *delta*;
/// callers that already fold `v` in should use `integrate_velocity_delta`).
pub fn integrate_velocity(t: f32, v: f32, a: f32, j: f32) -> f32 {
    v + integrate_velocity_delta(t, a, j)
}

/// `t*(a + j*t/2)`, the velocity delta accumulated over elapsed time `t`.
pub fn integrate_velocity_delta(t: f32, a: f32, j: f32) -> f32 {
    t * (a + j * t / 2.)
}

/// Accel at elapsed time `t` within a phase of constant jerk `j`, given
/// entry accel `a`.
pub fn integrate_accel(t: f32, a: f32, j: f32) -> f32 {
    a + j * t
}

/// A single moment along the profile: distance traveled, velocity, and
/// acceleration, snapped to the closed-form integral rather than
/// accumulated by repeated addition (spec §9 "Floating-point determinism").
#[derive(Clone, Copy, Debug, Default, defmt::Format)]
pub struct State {
    pub distance: f32,
    pub velocity: f32,
    pub accel: f32,
}

/// Integrates one phase fully, returning the state at its end, given the
/// state at its start.
pub fn phase_end_state(start: State, phase: Phase, duration: f32, jerk_max: f32, t0: f32, t4: f32) -> State {
    let (j, a_entry) = phase_jerk_and_accel(phase, jerk_max, t0, t4);
    State {
        distance: start.distance + integrate_distance(duration, start.velocity, a_entry, j),
        velocity: integrate_velocity(duration, start.velocity, a_entry, j),
        accel: integrate_accel(duration, a_entry, j),
    }
}

/// Solves the two-phase closed-form "bring accel to zero, then reverse
/// accel to bring velocity to zero" deceleration used by the jog engine
/// (spec §4.7) and soft-limit stopping distance estimate (spec §4.1/§8 P8).
///
/// Returns the distance traveled to come to rest from `(v, a)` under
/// `accel_max`/`jerk_max`, assuming we immediately begin decelerating.
pub fn stopping_distance(v: f32, a: f32, accel_max: f32, jerk_max: f32) -> f32 {
    if v.abs() < 1e-6 && a.abs() < 1e-6 {
        return 0.;
    }

    let dir = if v != 0. { v.signum() } else { a.signum() };
    let v = v.abs();
    let a = a * dir.signum() * dir; // accel expressed along direction of travel, signed

    // Phase A: bring |accel| to accel_max (if not already there) while
    // increasing deceleration magnitude; approximate by jerking accel from
    // its current value down to -accel_max.
    let a0 = a;
    let t_a = ((-accel_max - a0) / -jerk_max).abs();
    let v_after_a = v + integrate_velocity_delta(t_a, a0, -jerk_max);
    let d_a = integrate_distance(t_a, v, a0, -jerk_max);

    let v_after_a = v_after_a.max(0.);

    // Phase B: cruise at -accel_max until velocity would cross zero if we
    // kept decelerating at a constant rate, then phase C undoes the accel
    // the same way phase A built it.
    let t_c = (accel_max / jerk_max).abs();
    let v_at_c_start = {
        // Solve v_after_a + t_b*(-accel_max) - (velocity lost ramping accel
        // back to 0 during phase C) = 0 for t_b.
        let v_lost_in_c = integrate_velocity_delta(t_c, -accel_max, jerk_max).abs();
        (v_after_a - v_lost_in_c).max(0.)
    };
    let t_b = if accel_max > 1e-9 {
        v_at_c_start / accel_max
    } else {
        0.
    };
    let d_b = integrate_distance(t_b, v_after_a, -accel_max, 0.);

    let v_b_end = v_after_a - accel_max * t_b;
    let d_c = integrate_distance(t_c, v_b_end, -accel_max, jerk_max);

    d_a + d_b + d_c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_sequence_order() {
        assert_eq!(Phase::JerkUp0.next(), Some(Phase::AccelCruise));
        assert_eq!(Phase::JerkUp1.next(), None);
    }

    #[test]
    fn distance_and_velocity_match_p4_closed_form() {
        // P4: integrated velocity at the end of a phase equals v + T*(a + j*T/2)
        // within 1e-6*Vmax.
        let v0 = 100.;
        let a0 = 500.;
        let j = 2_000.;
        let t = 0.2;
        let v_end = integrate_velocity(t, v0, a0, j);
        let expected = v0 + t * (a0 + j * t / 2.);
        assert!((v_end - expected).abs() < 1e-6 * 3_000.);
    }

    #[test]
    fn zero_jerk_constant_velocity_phase_is_linear() {
        let d = integrate_distance(2., 50., 0., 0.);
        assert!((d - 100.).abs() < 1e-6);
    }

    #[test]
    fn stopping_distance_from_rest_is_zero() {
        assert_eq!(stopping_distance(0., 0., 1000., 10_000.), 0.);
    }

    #[test]
    fn stopping_distance_is_positive_when_moving() {
        let d = stopping_distance(3_000., 0., 100_000., 10_000_000.);
        assert!(d > 0.);
    }
}
