//! Segment executor (spec §4.4): drains the planner queue, plans each
//! feed/rapid move as a seven-phase S-curve, and hands fixed-duration
//! sub-segments to the stepper back-end. Non-motion commands (dwell,
//! tool change, spindle, coolant, work-offset sync, set-home) are applied
//! at the exact cumulative position they were queued at.

use num_traits::float::Float;

use crate::config::{MachineConfig, AXES};
use crate::drivers::{DigitalOutput, SpindleOutput};
use crate::error::AlarmReason;
use crate::gcode_state::SpindleMode;
use crate::planner::{Payload, Queue, Tag};
use crate::scurve::{self, Phase, State};
use crate::state_machine::HoldReason;
use crate::stepper::{StepPulseOutput, StepperBackend};

/// Number of numbered output pins (spec §11 "Output pins", `outputs.c`'s
/// `OUTS`).
pub const NUM_OUTPUTS: usize = 5;

/// Fixed segment clock (spec §4.4 "Segment clock"), in minutes to match
/// mm/min feed-rate units used throughout the kinematics.
pub const SEGMENT_TIME_MS: f32 = 5.;
pub const SEGMENT_TIME_MIN: f32 = SEGMENT_TIME_MS / 60_000.;

pub const EXEC_DELAY_MS: u32 = 50;
pub const EXEC_FILL_TARGET: usize = 4;

/// Step-timer tick rate used to convert `SEGMENT_TIME_MIN` and move
/// durations into `prep_line`'s ticks-per-step units.
pub const TIMER_CLOCK_TICKS_PER_MIN: f32 = 64_000. * 60.;
pub const PULSE_WIDTH_TICKS: u32 = 2;

/// Result of one `exec_next` call (spec §5 "Suspension points").
#[derive(Clone, Copy, PartialEq, Debug, defmt::Format)]
pub enum ExecResult {
    /// Nothing to do (queue empty, or waiting out the restart delay).
    Noop,
    /// A logical step ran but no segment was queued to the stepper
    /// (e.g. a non-motion command was applied); safe to call again.
    Eagain,
    /// A segment was queued to the stepper back-end.
    Ok,
    /// The current move decelerated to rest (hold completed).
    Pause,
    /// A queued `Tag::Pause` (program-stop family: M0/M1/M60/tool change)
    /// was reached; the caller should latch this as a hold request on the
    /// state machine at the exact queue position it occurred.
    HoldRequested(HoldReason),
    Error(AlarmReason),
}

/// Runtime-introspection snapshot (spec §6 "Runtime introspection":
/// "velocity, acceleration, jerk; line number"). `velocity`/`accel` are
/// zero and `jerk_max` reflects the last-planned move when nothing is
/// active.
#[derive(Clone, Copy, Debug, Default, defmt::Format)]
pub struct MotionStatus {
    pub velocity: f32,
    pub accel: f32,
    pub jerk_max: f32,
    pub line_number: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct PhasePlan {
    times: [f32; Phase::COUNT],
    t0: f32,
    t4: f32,
    jerk_max: f32,
}

/// Plans a symmetric, rest-to-rest seven-phase profile for `distance` at
/// up to `target_velocity`, limited by `accel_max`/`jerk_max`. Moves are
/// always planned from and to zero velocity; no look-ahead junction
/// velocity blending between consecutive queued moves (see DESIGN.md).
fn plan_move(distance: f32, target_velocity: f32, accel_max: f32, jerk_max: f32) -> PhasePlan {
    let jerk_max = jerk_max.max(1.);
    let accel_max = accel_max.max(1.);
    let target_velocity = target_velocity.max(0.);

    let tj_full = accel_max / jerk_max;
    let v_no_cruise_accel = jerk_max * tj_full * tj_full;

    let (tj, ta) = if target_velocity >= v_no_cruise_accel {
        let ta = (target_velocity - v_no_cruise_accel) / accel_max;
        (tj_full, ta)
    } else {
        let tj = (target_velocity / jerk_max).sqrt();
        (tj, 0.)
    };

    let ramp_distance = |tj: f32, ta: f32| -> f32 {
        let s0 = scurve::phase_end_state(State::default(), Phase::JerkUp0, tj, jerk_max, tj, tj);
        let s1 = scurve::phase_end_state(s0, Phase::AccelCruise, ta, jerk_max, tj, tj);
        let s2 = scurve::phase_end_state(s1, Phase::JerkDown0, tj, jerk_max, tj, tj);
        s2.distance
    };

    let ramp = ramp_distance(tj, ta);

    let (t0, t1, t3) = if 2. * ramp <= distance {
        let cruise_velocity = if ta > 0. { target_velocity } else { jerk_max * tj * tj };
        let remaining = distance - 2. * ramp;
        (tj, ta, remaining / cruise_velocity.max(1e-6))
    } else {
        // Triangular profile: the full target velocity isn't reachable in
        // the available distance. Scale the jerk-phase duration down and
        // drop the constant-accel cruise entirely.
        let scale = (distance / (2. * ramp).max(1e-9)).max(0.).sqrt();
        (tj * scale, 0., 0.)
    };

    PhasePlan {
        times: [t0, t1, t0, t3, t0, t1, t0],
        t0,
        t4: t0,
        jerk_max,
    }
}

#[derive(Clone, Copy, Debug)]
struct ActiveMove {
    start: [f32; AXES],
    unit: [f32; AXES],
    length: f32,
    plan: PhasePlan,
    phase: Phase,
    phase_elapsed: f32,
    leftover: f32,
    state: State,
    line_number: u32,
    exact_stop: bool,
    seek_switch: Option<(u8, bool, bool)>, // (switch_id, expect_active, error_if_not_found)
    final_target: [f32; AXES],
}

pub struct Executor {
    active: Option<ActiveMove>,
    position: [f32; AXES],
    queued_line_number: u32,
    queued_velocity: Option<f32>,
    busy: bool,
    last_empty_ms: Option<u32>,
    /// Set while a queued `Dwell` is being timed out (spec §4.5 "Dwell"):
    /// the `now_ms` tick at which the dwell is done and the head of queue
    /// can be popped. No motion occurs while this is armed.
    dwell_deadline_ms: Option<u32>,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            active: None,
            position: [0.; AXES],
            queued_line_number: 0,
            queued_velocity: None,
            busy: false,
            last_empty_ms: None,
            dwell_deadline_ms: None,
        }
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> [f32; AXES] {
        self.position
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Current velocity/accel/jerk/line-number for host status reports
    /// (spec §6 "Runtime introspection").
    pub fn status(&self) -> MotionStatus {
        match &self.active {
            Some(mv) => MotionStatus {
                velocity: mv.state.velocity,
                accel: mv.state.accel,
                jerk_max: mv.plan.jerk_max,
                line_number: mv.line_number,
            },
            None => MotionStatus {
                line_number: self.queued_line_number,
                ..Default::default()
            },
        }
    }

    /// Feeds one jog-engine sub-segment to the stepper back-end as a
    /// regular segment (spec §4.7 step 4) and adopts `target` as the new
    /// authoritative position. Bypasses the planner queue entirely; the
    /// caller (spec §4.4 "Jog dispatch") only calls this while
    /// `STATE=JOGGING`, in place of the normal `exec_next` segment machine.
    pub fn jog_exec<O: StepPulseOutput>(
        &mut self,
        cfg: &MachineConfig,
        stepper: &mut StepperBackend,
        target: [f32; AXES],
        dt: f32,
        outputs: &mut [&mut O],
    ) {
        for (motor_idx, out) in outputs.iter_mut().enumerate() {
            let motor_cfg = &cfg.motors[motor_idx];
            stepper.prep_line(
                motor_idx,
                cfg,
                target[motor_cfg.axis],
                dt,
                TIMER_CLOCK_TICKS_PER_MIN,
                PULSE_WIDTH_TICKS,
            );
            stepper.load(motor_idx, *out);
        }
        self.position = target;
    }

    fn axis_limited(unit: &[f32; AXES], per_axis: impl Fn(usize) -> f32) -> f32 {
        let mut limit = f32::MAX;
        for i in 0..AXES {
            if unit[i].abs() > 1e-9 {
                limit = limit.min(per_axis(i) / unit[i].abs());
            }
        }
        if limit == f32::MAX {
            0.
        } else {
            limit
        }
    }

    fn begin_move(&mut self, cfg: &MachineConfig, target: [f32; AXES], feed_velocity: f32, rapid: bool) {
        let start = self.position;
        let mut delta = [0.; AXES];
        let mut length_sq = 0.;
        for i in 0..AXES {
            delta[i] = target[i] - start[i];
            length_sq += delta[i] * delta[i];
        }
        let length = length_sq.sqrt();
        let mut unit = [0.; AXES];
        if length > 1e-9 {
            for i in 0..AXES {
                unit[i] = delta[i] / length;
            }
        }

        let accel_max = Self::axis_limited(&unit, |i| cfg.axis(i).accel_max);
        let jerk_max = Self::axis_limited(&unit, |i| cfg.axis(i).jerk_max);
        let velocity_max = Self::axis_limited(&unit, |i| cfg.axis(i).velocity_max);

        let target_velocity = if rapid { velocity_max } else { feed_velocity.min(velocity_max) };

        let plan = plan_move(length, target_velocity.max(0.), accel_max, jerk_max);

        self.active = Some(ActiveMove {
            start,
            unit,
            length,
            plan,
            phase: Phase::JerkUp0,
            phase_elapsed: 0.,
            leftover: 0.,
            state: State::default(),
            line_number: self.queued_line_number,
            exact_stop: true,
            seek_switch: None,
            final_target: target,
        });
        self.busy = true;
        self.last_empty_ms = None;
    }

    /// Drives the already-active move forward by one fixed sub-segment,
    /// preparing every motor for the resulting axis targets. Returns
    /// `true` once the move has reached its final phase end.
    fn step_active_move<O: StepPulseOutput>(
        &mut self,
        cfg: &MachineConfig,
        stepper: &mut StepperBackend,
        outputs: &mut [&mut O],
        switch_active: &dyn Fn(u8) -> bool,
    ) -> (bool, Option<AlarmReason>) {
        let mut mv = self.active.take().expect("step_active_move called without an active move");

        let phase_duration = mv.plan.times[mv.phase as usize];
        let remaining_in_phase = (phase_duration - mv.phase_elapsed).max(0.);
        let mut dt = SEGMENT_TIME_MIN.min(remaining_in_phase.max(mv.leftover));
        if dt <= 0. && remaining_in_phase <= 0. {
            // Zero-duration phase: advance to the next one without emitting.
            mv.leftover = 0.;
            if let Some(next) = mv.phase.next() {
                mv.phase = next;
                mv.phase_elapsed = 0.;
                self.active = Some(mv);
                return (false, None);
            } else {
                self.position = mv.final_target;
                self.busy = false;
                return (true, None);
            }
        }
        if dt < 0.5 * SEGMENT_TIME_MIN && remaining_in_phase > dt {
            // Fold a too-small residual into the next sub-segment rather
            // than emitting a degenerate one (spec §4.4 step 4).
            mv.leftover = dt;
            dt = remaining_in_phase.min(SEGMENT_TIME_MIN + dt);
        } else {
            mv.leftover = 0.;
        }

        let end_of_phase = dt >= remaining_in_phase - 1e-9;
        let next_state = scurve::phase_end_state(mv.state, mv.phase, dt, mv.plan.jerk_max, mv.plan.t0, mv.plan.t4);

        let is_last_phase = mv.phase == Phase::JerkUp1;
        let last_sub_segment = end_of_phase && is_last_phase;

        let mut target = [0.; AXES];
        if last_sub_segment && mv.exact_stop {
            target = mv.final_target;
        } else {
            for i in 0..AXES {
                target[i] = mv.start[i] + mv.unit[i] * next_state.distance;
            }
        }

        // Snap to the exact closed-form phase-end state to kill
        // accumulated floating-point drift (spec §4.4 step 3).
        mv.state = if end_of_phase {
            scurve::phase_end_state(mv.state, mv.phase, phase_duration - mv.phase_elapsed, mv.plan.jerk_max, mv.plan.t0, mv.plan.t4)
        } else {
            next_state
        };
        mv.phase_elapsed += dt;

        for (motor_idx, out) in outputs.iter_mut().enumerate() {
            let motor_cfg = &cfg.motors[motor_idx];
            stepper.prep_line(
                motor_idx,
                cfg,
                target[motor_cfg.axis],
                dt,
                TIMER_CLOCK_TICKS_PER_MIN,
                PULSE_WIDTH_TICKS,
            );
            stepper.load(motor_idx, *out);
        }

        if let Some((switch_id, expect_active, error_if_not_found)) = mv.seek_switch {
            if switch_active(switch_id) == expect_active {
                self.position = target;
                self.busy = false;
                return (true, None);
            }
            if last_sub_segment && error_if_not_found {
                self.position = target;
                self.busy = false;
                return (true, Some(AlarmReason::SeekNotFound));
            }
        }

        if last_sub_segment {
            self.position = target;
            self.busy = false;
            return (true, None);
        }

        if end_of_phase {
            if let Some(next) = mv.phase.next() {
                mv.phase = next;
                mv.phase_elapsed = 0.;
            }
        }

        self.active = Some(mv);
        (false, None)
    }

    /// One iteration of `exec_next` (spec §4.4, §5). `outputs` is one
    /// `StepPulseOutput` per motor, same order as `cfg.motors`. `spindle`,
    /// `coolant`, and `output_pins` are the non-motion side-effect seams
    /// (spec §9 "spindle_set_speed/mode", §11 "Output pins"): queued
    /// `SpindleSpeed`/`SpindleMode`/`CoolantSet`/`Output` commands are
    /// dispatched to them at the exact cumulative position they were
    /// queued at, same as any other non-motion command.
    #[allow(clippy::too_many_arguments)]
    pub fn exec_next<O: StepPulseOutput>(
        &mut self,
        cfg: &MachineConfig,
        queue: &mut Queue,
        stepper: &mut StepperBackend,
        outputs: &mut [&mut O],
        spindle: &mut dyn SpindleOutput,
        coolant: &mut dyn DigitalOutput,
        output_pins: &mut [&mut dyn DigitalOutput; NUM_OUTPUTS],
        now_ms: u32,
        switch_active: &dyn Fn(u8) -> bool,
    ) -> ExecResult {
        if let Some(_mv) = &self.active {
            let (done, alarm) = self.step_active_move(cfg, stepper, outputs, switch_active);
            if let Some(reason) = alarm {
                return ExecResult::Error(reason);
            }
            return if done { ExecResult::Pause } else { ExecResult::Ok };
        }

        if queue.empty() {
            if self.last_empty_ms.is_none() {
                self.last_empty_ms = Some(now_ms);
            }
            return ExecResult::Noop;
        }

        // Starvation guard: once the queue has gone empty, wait out
        // EXEC_DELAY and refill to EXEC_FILL_TARGET before resuming
        // steady-state execution (spec §4.4 "Completion").
        if let Some(empty_since) = self.last_empty_ms {
            if now_ms.saturating_sub(empty_since) < EXEC_DELAY_MS && queue.fill() < EXEC_FILL_TARGET {
                return ExecResult::Noop;
            }
            self.last_empty_ms = None;
        }

        let cmd = match queue.head() {
            Some(c) => *c,
            None => return ExecResult::Noop,
        };

        match cmd.tag {
            Tag::LineNumber => {
                if let Payload::Int(n) = cmd.payload {
                    self.queued_line_number = n as u32;
                }
                queue.pop();
                ExecResult::Eagain
            }
            Tag::Velocity => {
                if let Payload::Float(v) = cmd.payload {
                    self.queued_velocity = Some(v);
                }
                queue.pop();
                ExecResult::Eagain
            }
            Tag::Target => {
                if let Payload::Vector(target) = cmd.payload {
                    queue.pop();
                    let rapid = self.queued_velocity.is_none();
                    self.begin_move(cfg, target, self.queued_velocity.unwrap_or(0.), rapid);
                    self.queued_velocity = None;
                    ExecResult::Ok
                } else {
                    queue.pop();
                    ExecResult::Error(AlarmReason::InternalError)
                }
            }
            Tag::Seek => {
                if let Payload::Seek(desc) = cmd.payload {
                    queue.pop();
                    if let Some(Payload::Vector(target)) = queue.head().map(|c| c.payload) {
                        queue.pop();
                        let rapid = false;
                        self.begin_move(cfg, target, self.queued_velocity.unwrap_or(0.), rapid);
                        self.queued_velocity = None;
                        if let Some(mv) = self.active.as_mut() {
                            mv.seek_switch = Some((desc.switch_id, desc.expect_active, desc.error_if_not_found));
                        }
                        ExecResult::Ok
                    } else {
                        ExecResult::Error(AlarmReason::InternalError)
                    }
                } else {
                    queue.pop();
                    ExecResult::Error(AlarmReason::InternalError)
                }
            }
            Tag::Dwell => {
                // Holds the queue head in place, timing out against `now_ms`
                // rather than a fixed sub-segment decrement, so the dwell
                // duration tracks wall-clock time regardless of how often
                // `exec_next` is polled (spec §4.5 "Dwell": "each step-timer
                // tick subtracts 1 ms from the dwell; no motion occurs").
                if self.dwell_deadline_ms.is_none() {
                    let ms = if let Payload::Float(seconds) = cmd.payload {
                        (seconds.max(0.) * 1000.) as u32
                    } else {
                        0
                    };
                    self.dwell_deadline_ms = Some(now_ms.wrapping_add(ms));
                    self.busy = true;
                }
                if now_ms >= self.dwell_deadline_ms.unwrap() {
                    self.dwell_deadline_ms = None;
                    self.busy = false;
                    queue.pop();
                    ExecResult::Eagain
                } else {
                    ExecResult::Ok
                }
            }
            Tag::SetHome => {
                if let Payload::Vector(pos) = cmd.payload {
                    self.position = pos;
                }
                queue.pop();
                ExecResult::Eagain
            }
            Tag::SpindleSpeed => {
                if let Payload::Float(rpm) = cmd.payload {
                    spindle.set_speed(rpm);
                }
                queue.pop();
                ExecResult::Eagain
            }
            Tag::SpindleMode => {
                if let Payload::Int(v) = cmd.payload {
                    let mode = match v {
                        1 => SpindleMode::Cw,
                        2 => SpindleMode::Ccw,
                        _ => SpindleMode::Off,
                    };
                    spindle.set_mode(mode);
                }
                queue.pop();
                ExecResult::Eagain
            }
            Tag::CoolantSet => {
                if let Payload::Bool(on) = cmd.payload {
                    coolant.set(on);
                }
                queue.pop();
                ExecResult::Eagain
            }
            Tag::Output => {
                if let Payload::Output { index, level } = cmd.payload {
                    if (index as usize) < NUM_OUTPUTS {
                        output_pins[index as usize].set(level);
                    }
                }
                queue.pop();
                ExecResult::Eagain
            }
            Tag::Pause => {
                let reason = if let Payload::Int(v) = cmd.payload {
                    HoldReason::try_from(v as u8).ok()
                } else {
                    None
                };
                queue.pop();
                match reason {
                    Some(r) => ExecResult::HoldRequested(r),
                    None => ExecResult::Eagain,
                }
            }
            Tag::UpdateWorkOffsets | Tag::ToolChange | Tag::JogSync | Tag::ScurvePhase | Tag::Data => {
                queue.pop();
                ExecResult::Eagain
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::drivers::sim::{FakeDigitalOutput, FakeSpindle};

    struct FakeOutput {
        period: Option<u32>,
        emitted: u32,
    }

    impl Default for FakeOutput {
        fn default() -> Self {
            Self { period: None, emitted: 0 }
        }
    }

    impl StepPulseOutput for FakeOutput {
        fn set_period(&mut self, ticks_per_step: Option<u32>) {
            self.period = ticks_per_step;
        }
        fn set_direction(&mut self, _dir: crate::stepper::Direction) {}
        fn set_enabled(&mut self, _enabled: bool) {}
        fn take_emitted_steps(&mut self) -> u32 {
            let v = self.emitted;
            self.emitted = 0;
            v
        }
    }

    #[test]
    fn plan_move_reaches_target_velocity_on_long_moves() {
        let plan = plan_move(1000., 3000., 100_000., 10_000_000.);
        assert!(plan.times[3] > 0.); // has a velocity-cruise phase
    }

    #[test]
    fn plan_move_short_distance_is_triangular() {
        let plan = plan_move(0.01, 3000., 100_000., 10_000_000.);
        assert_eq!(plan.times[3], 0.);
    }

    #[test]
    fn exec_next_on_empty_queue_is_noop() {
        let cfg = MachineConfig::default();
        let mut exec = Executor::new();
        let mut q = Queue::new();
        let mut stepper = StepperBackend::new();
        let mut o0 = FakeOutput::default();
        let mut o1 = FakeOutput::default();
        let mut o2 = FakeOutput::default();
        let mut o3 = FakeOutput::default();
        let mut outputs: [&mut FakeOutput; 4] = [&mut o0, &mut o1, &mut o2, &mut o3];
        let no_switch = |_: u8| false;
        let mut spindle = FakeSpindle::default();
        let mut coolant = FakeDigitalOutput::default();
        let (mut p0, mut p1, mut p2, mut p3, mut p4) = (
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
        );
        let mut output_pins: [&mut dyn DigitalOutput; NUM_OUTPUTS] = [&mut p0, &mut p1, &mut p2, &mut p3, &mut p4];
        assert_eq!(
            exec.exec_next(
                &cfg,
                &mut q,
                &mut stepper,
                &mut outputs,
                &mut spindle,
                &mut coolant,
                &mut output_pins,
                0,
                &no_switch
            ),
            ExecResult::Noop
        );
    }

    #[test]
    fn feed_move_runs_to_completion() {
        let cfg = MachineConfig::default();
        let mut exec = Executor::new();
        let mut q = Queue::new();
        q.push(Tag::Velocity, Payload::Float(3000.), 1);
        let mut target = [0.; AXES];
        target[0] = 10.;
        q.push(Tag::Target, Payload::Vector(target), 1);

        let mut stepper = StepperBackend::new();
        let mut o0 = FakeOutput::default();
        let mut o1 = FakeOutput::default();
        let mut o2 = FakeOutput::default();
        let mut o3 = FakeOutput::default();
        let mut outputs: [&mut FakeOutput; 4] = [&mut o0, &mut o1, &mut o2, &mut o3];
        let no_switch = |_: u8| false;
        let mut spindle = FakeSpindle::default();
        let mut coolant = FakeDigitalOutput::default();
        let (mut p0, mut p1, mut p2, mut p3, mut p4) = (
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
        );
        let mut output_pins: [&mut dyn DigitalOutput; NUM_OUTPUTS] = [&mut p0, &mut p1, &mut p2, &mut p3, &mut p4];

        let mut result = ExecResult::Noop;
        for _ in 0..100_000 {
            result = exec.exec_next(
                &cfg,
                &mut q,
                &mut stepper,
                &mut outputs,
                &mut spindle,
                &mut coolant,
                &mut output_pins,
                0,
                &no_switch,
            );
            if result == ExecResult::Pause {
                break;
            }
        }
        assert_eq!(result, ExecResult::Pause);
        assert!((exec.position()[0] - 10.).abs() < 1e-3);
        // Motion has finished: status reports rest and the move's line.
        let status = exec.status();
        assert_eq!(status.velocity, 0.);
        assert_eq!(status.line_number, 1);
    }

    #[test]
    fn status_reports_nonzero_velocity_mid_move() {
        let cfg = MachineConfig::default();
        let mut exec = Executor::new();
        let mut q = Queue::new();
        q.push(Tag::Velocity, Payload::Float(3000.), 7);
        let mut target = [0.; AXES];
        target[0] = 1000.;
        q.push(Tag::Target, Payload::Vector(target), 7);

        let mut stepper = StepperBackend::new();
        let mut o0 = FakeOutput::default();
        let mut o1 = FakeOutput::default();
        let mut o2 = FakeOutput::default();
        let mut o3 = FakeOutput::default();
        let mut outputs: [&mut FakeOutput; 4] = [&mut o0, &mut o1, &mut o2, &mut o3];
        let no_switch = |_: u8| false;
        let mut spindle = FakeSpindle::default();
        let mut coolant = FakeDigitalOutput::default();
        let (mut p0, mut p1, mut p2, mut p3, mut p4) = (
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
        );
        let mut output_pins: [&mut dyn DigitalOutput; NUM_OUTPUTS] = [&mut p0, &mut p1, &mut p2, &mut p3, &mut p4];

        for _ in 0..50 {
            exec.exec_next(
                &cfg,
                &mut q,
                &mut stepper,
                &mut outputs,
                &mut spindle,
                &mut coolant,
                &mut output_pins,
                0,
                &no_switch,
            );
        }
        let status = exec.status();
        assert!(status.velocity > 0.);
        assert_eq!(status.line_number, 7);
    }

    #[test]
    fn dwell_holds_the_queue_head_for_the_full_duration() {
        // S3: a dwell command must not complete until its full duration
        // elapses, and must not move any axis in the meantime.
        let cfg = MachineConfig::default();
        let mut exec = Executor::new();
        let mut q = Queue::new();
        q.push(Tag::Dwell, Payload::Float(0.5), 1); // 500ms
        let mut target = [0.; AXES];
        target[0] = 10.;
        q.push(Tag::Target, Payload::Vector(target), 1);

        let mut stepper = StepperBackend::new();
        let mut o0 = FakeOutput::default();
        let mut o1 = FakeOutput::default();
        let mut o2 = FakeOutput::default();
        let mut o3 = FakeOutput::default();
        let mut outputs: [&mut FakeOutput; 4] = [&mut o0, &mut o1, &mut o2, &mut o3];
        let no_switch = |_: u8| false;
        let mut spindle = FakeSpindle::default();
        let mut coolant = FakeDigitalOutput::default();
        let (mut p0, mut p1, mut p2, mut p3, mut p4) = (
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
        );

        let mut now_ms = 0u32;
        let mut dwell_done_at = None;
        for _ in 0..600 {
            now_ms += 1;
            let mut output_pins: [&mut dyn DigitalOutput; NUM_OUTPUTS] = [&mut p0, &mut p1, &mut p2, &mut p3, &mut p4];
            let result = exec.exec_next(
                &cfg,
                &mut q,
                &mut stepper,
                &mut outputs,
                &mut spindle,
                &mut coolant,
                &mut output_pins,
                now_ms,
                &no_switch,
            );
            if dwell_done_at.is_none() && result != ExecResult::Ok {
                dwell_done_at = Some(now_ms);
            }
            if dwell_done_at.is_some() {
                break;
            }
        }
        let done = dwell_done_at.expect("dwell should complete within the simulated window");
        assert!((done as i64 - 500).abs() <= 1, "dwell finished at {done}ms, expected ~500ms");
        assert_eq!(exec.position()[0], 0.); // no motion occurred during the dwell
    }

    #[test]
    fn spindle_coolant_and_output_commands_dispatch_to_seams() {
        let cfg = MachineConfig::default();
        let mut exec = Executor::new();
        let mut q = Queue::new();
        q.push(Tag::SpindleMode, Payload::Int(1), 1); // Cw
        q.push(Tag::SpindleSpeed, Payload::Float(12_000.), 1);
        q.push(Tag::CoolantSet, Payload::Bool(true), 1);
        q.push(Tag::Output, Payload::Output { index: 2, level: true }, 1);

        let mut stepper = StepperBackend::new();
        let mut o0 = FakeOutput::default();
        let mut o1 = FakeOutput::default();
        let mut o2 = FakeOutput::default();
        let mut o3 = FakeOutput::default();
        let mut outputs: [&mut FakeOutput; 4] = [&mut o0, &mut o1, &mut o2, &mut o3];
        let no_switch = |_: u8| false;
        let mut spindle = FakeSpindle::default();
        let mut coolant = FakeDigitalOutput::default();
        let (mut p0, mut p1, mut p2, mut p3, mut p4) = (
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
        );

        for _ in 0..4 {
            let mut output_pins: [&mut dyn DigitalOutput; NUM_OUTPUTS] = [&mut p0, &mut p1, &mut p2, &mut p3, &mut p4];
            exec.exec_next(
                &cfg,
                &mut q,
                &mut stepper,
                &mut outputs,
                &mut spindle,
                &mut coolant,
                &mut output_pins,
                0,
                &no_switch,
            );
        }

        assert_eq!(spindle.mode, Some(crate::gcode_state::SpindleMode::Cw));
        assert!((spindle.rpm - 12_000.).abs() < 1e-3);
        assert!(coolant.level);
        assert!(p2.level);
        assert!(!p0.level);
    }

    #[test]
    fn pause_command_decodes_its_hold_reason_and_pops() {
        let cfg = MachineConfig::default();
        let mut exec = Executor::new();
        let mut q = Queue::new();
        q.push(Tag::Pause, Payload::Int(u8::from(HoldReason::ProgramPause) as i32), 1);

        let mut stepper = StepperBackend::new();
        let mut o0 = FakeOutput::default();
        let mut o1 = FakeOutput::default();
        let mut o2 = FakeOutput::default();
        let mut o3 = FakeOutput::default();
        let mut outputs: [&mut FakeOutput; 4] = [&mut o0, &mut o1, &mut o2, &mut o3];
        let no_switch = |_: u8| false;
        let mut spindle = FakeSpindle::default();
        let mut coolant = FakeDigitalOutput::default();
        let (mut p0, mut p1, mut p2, mut p3, mut p4) = (
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
            FakeDigitalOutput::default(),
        );
        let mut output_pins: [&mut dyn DigitalOutput; NUM_OUTPUTS] = [&mut p0, &mut p1, &mut p2, &mut p3, &mut p4];

        let result = exec.exec_next(
            &cfg,
            &mut q,
            &mut stepper,
            &mut outputs,
            &mut spindle,
            &mut coolant,
            &mut output_pins,
            0,
            &no_switch,
        );
        assert_eq!(result, ExecResult::HoldRequested(HoldReason::ProgramPause));
        assert!(q.empty());
    }
}
