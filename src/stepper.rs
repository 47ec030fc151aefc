//! Stepper back-end (spec §4.5): per-motor prep/load state machine that
//! turns a (segment time, target position) pair into a timer period and
//! direction, with closed-loop step-count feedback and damped error
//! correction.
//!
//! The foreground/ISR split mirrors the driver-trait seam in
//! `examples/other_examples/2e404150_idubrov-x2-feed__src-stepper.rs.rs`
//! (`trait StepperDriver`, `Stepper<S: StepperDriver>`): pure step-count
//! math lives here, hardware register access lives behind `StepPulseOutput`.
//! The timer-period-and-DMA-counter handoff is the same shape as the
//! teacher's `protocols::dshot` burst-DMA motor pulse generation, generalized
//! from a fixed 4-motor DShot frame to an arbitrary step/dir pulse train.

use crate::config::{MachineConfig, MotorPowerMode, MOTORS};

pub const MIN_STEP_CORRECTION: i32 = 4;
pub const MOTOR_IDLE_TIMEOUT_MS: u32 = 250;
/// Minimum direction-to-step setup time, in the same tick units `now_ms`
/// uses for `power_timeout`; kept as a named constant per spec §4.5 "Load".
pub const DIR_SETUP_NS: u32 = 200;

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum Direction {
    Positive,
    Negative,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum DriverPowerState {
    Idle,
    Active,
}

/// Hardware seam for one motor's pulse output. The firmware binary
/// implements this over a timer + DMA step counter (same shape as
/// `protocols::dshot`); host tests use an in-memory fake.
pub trait StepPulseOutput {
    /// Sets the timer period (ticks per step) for the next segment, or
    /// disables the clock entirely when `ticks_per_step` is `None` (spec
    /// I4: step rate too low/high to represent).
    fn set_period(&mut self, ticks_per_step: Option<u32>);
    /// Writes the direction latch, guaranteeing the minimum direction-to-step
    /// setup time before the clock is allowed to step.
    fn set_direction(&mut self, dir: Direction);
    fn set_enabled(&mut self, enabled: bool);
    /// Reads how many steps were actually emitted since the last call
    /// (cumulative DMA/hardware counter, reset after read).
    fn take_emitted_steps(&mut self) -> u32;
}

#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct MotorState {
    pub commanded: i64,
    pub encoder: i64,
    pub last_direction: Option<bool>, // true = positive
    pub prepped: bool,
    pub prepped_ticks_per_step: Option<u32>,
    pub prepped_direction: Option<Direction>,
    pub prepped_delta_steps: u32,
    pub power_timeout_ms: u32,
    pub power_state: Option<DriverPowerState>,
    pub dwell_ms_remaining: u32,
}

impl Default for MotorState {
    fn default() -> Self {
        Self {
            commanded: 0,
            encoder: 0,
            last_direction: None,
            prepped: false,
            prepped_ticks_per_step: None,
            prepped_direction: None,
            prepped_delta_steps: 0,
            power_timeout_ms: 0,
            power_state: None,
            dwell_ms_remaining: 0,
        }
    }
}

/// Outcome of preparing a motor's next segment.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum PrepResult {
    Prepped,
    /// Step rate too low (>= 65536 ticks/step) or zero steps: clock disabled
    /// for this segment (spec I4).
    ClockDisabled,
}

pub struct StepperBackend {
    pub motors: [MotorState; MOTORS],
}

impl Default for StepperBackend {
    fn default() -> Self {
        Self {
            motors: [MotorState::default(); MOTORS],
        }
    }
}

impl StepperBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// `prep_line` (spec §4.5 "Prep"): computes the next segment's step
    /// count, direction, and timer period for one motor, given the axis
    /// target position for this motor's axis (already in axis units, not
    /// steps) and the segment duration. `timer_clock` is the step-timer
    /// tick rate in ticks/min (to match mm/min feed units), `pulse_width_ticks`
    /// the minimum allowed ticks-per-step floor.
    pub fn prep_line(
        &mut self,
        motor_idx: usize,
        cfg: &MachineConfig,
        target_axis_position: f32,
        segment_time_min: f32,
        timer_clock: f32,
        pulse_width_ticks: u32,
    ) -> PrepResult {
        let motor_cfg = &cfg.motors[motor_idx];
        let state = &mut self.motors[motor_idx];

        let pos_steps = (target_axis_position * motor_cfg.steps_per_unit()).round() as i64;
        let mut delta_steps = pos_steps - state.commanded;

        // Damped error correction: half the error folded into the next
        // segment's delta, not applied instantaneously (spec §4.5 step 3,
        // §11 "Step correction decay", P6).
        let error = state.commanded - state.encoder;
        if error.abs() >= MIN_STEP_CORRECTION as i64 {
            delta_steps += error.signum() * (error.abs() / 2).max(1);
        }

        state.commanded = pos_steps;

        let positive = delta_steps >= 0;
        state.prepped_direction = Some(if positive {
            Direction::Positive
        } else {
            Direction::Negative
        });

        let abs_steps = delta_steps.unsigned_abs() as u32;
        state.prepped_delta_steps = abs_steps;

        let result = if abs_steps == 0 {
            state.prepped_ticks_per_step = None;
            PrepResult::ClockDisabled
        } else {
            let ticks_per_step = (segment_time_min * timer_clock / abs_steps as f32).round() as u32;
            let ticks_per_step = ticks_per_step.max(2 * pulse_width_ticks);
            if ticks_per_step >= 65536 {
                state.prepped_ticks_per_step = None;
                PrepResult::ClockDisabled
            } else {
                state.prepped_ticks_per_step = Some(ticks_per_step);
                PrepResult::Prepped
            }
        };

        self.update_power(motor_idx, cfg, abs_steps > 0, 0);
        self.motors[motor_idx].prepped = true;
        result
    }

    fn update_power(&mut self, motor_idx: usize, cfg: &MachineConfig, moving: bool, now_ms: u32) {
        let motor_cfg = &cfg.motors[motor_idx];
        let state = &mut self.motors[motor_idx];
        match motor_cfg.power_mode {
            MotorPowerMode::Disabled => state.power_state = Some(DriverPowerState::Idle),
            MotorPowerMode::Always => state.power_state = Some(DriverPowerState::Active),
            MotorPowerMode::InCycle => state.power_state = Some(DriverPowerState::Active),
            MotorPowerMode::OnlyWhenMoving => {
                if moving {
                    state.power_timeout_ms = now_ms + MOTOR_IDLE_TIMEOUT_MS;
                    state.power_state = Some(DriverPowerState::Active);
                } else if now_ms >= state.power_timeout_ms {
                    state.power_state = Some(DriverPowerState::Idle);
                }
            }
        }
    }

    /// `load` (spec §4.5 "Load"): called at the segment boundary by the
    /// step-timer ISR. Stops the existing clock, reads back actually-emitted
    /// steps into the encoder, writes any direction change (respecting the
    /// direction-to-step setup requirement via the caller's ISR timing), and
    /// arms the new period.
    pub fn load<O: StepPulseOutput>(&mut self, motor_idx: usize, out: &mut O) {
        let state = &mut self.motors[motor_idx];
        if !state.prepped {
            return;
        }

        out.set_period(None);
        let emitted = out.take_emitted_steps();
        let signed_emitted = if state.last_direction == Some(false) {
            -(emitted as i64)
        } else {
            emitted as i64
        };
        state.encoder += signed_emitted;

        let new_dir_positive = state.prepped_direction == Some(Direction::Positive);
        if state.last_direction != Some(new_dir_positive) {
            out.set_direction(if new_dir_positive {
                Direction::Positive
            } else {
                Direction::Negative
            });
            state.last_direction = Some(new_dir_positive);
        }

        out.set_period(state.prepped_ticks_per_step);
        state.prepped = false;
    }

    /// Shuts a motor down immediately: de-energizes, clears dwell, nulls the
    /// move state (spec §4.5 "Shutdown", called on e-stop).
    pub fn shutdown<O: StepPulseOutput>(&mut self, motor_idx: usize, out: &mut O) {
        out.set_period(None);
        out.set_enabled(false);
        let state = &mut self.motors[motor_idx];
        state.prepped = false;
        state.prepped_ticks_per_step = None;
        state.dwell_ms_remaining = 0;
        state.power_state = Some(DriverPowerState::Idle);
    }

    pub fn error(&self, motor_idx: usize) -> i64 {
        let s = &self.motors[motor_idx];
        s.commanded - s.encoder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    #[derive(Default)]
    struct FakeOutput {
        period: Option<u32>,
        dir: Option<Direction>,
        enabled: bool,
        emitted: u32,
    }

    impl StepPulseOutput for FakeOutput {
        fn set_period(&mut self, ticks_per_step: Option<u32>) {
            self.period = ticks_per_step;
        }
        fn set_direction(&mut self, dir: Direction) {
            self.dir = Some(dir);
        }
        fn set_enabled(&mut self, enabled: bool) {
            self.enabled = enabled;
        }
        fn take_emitted_steps(&mut self) -> u32 {
            let v = self.emitted;
            self.emitted = 0;
            v
        }
    }

    #[test]
    fn prep_computes_ticks_matching_p5() {
        let cfg = MachineConfig::default();
        let mut sb = StepperBackend::new();
        // motor 0 -> axis 0, default steps_per_unit = (200*16)/5 = 640 steps/mm
        let result = sb.prep_line(0, &cfg, 1.0, 1.0, 64_000., 2);
        assert_eq!(result, PrepResult::Prepped);
        let ticks = sb.motors[0].prepped_ticks_per_step.unwrap();
        let steps = sb.motors[0].prepped_delta_steps;
        // ticks_per_step * steps should equal time*TIMER_CLOCK within one tick.
        let expected = 1.0 * 64_000.;
        assert!(((ticks * steps) as f32 - expected).abs() <= ticks as f32);
    }

    #[test]
    fn prep_disables_clock_on_zero_steps() {
        let cfg = MachineConfig::default();
        let mut sb = StepperBackend::new();
        let result = sb.prep_line(0, &cfg, 0.0, 1.0, 64_000., 2);
        assert_eq!(result, PrepResult::ClockDisabled);
    }

    #[test]
    fn error_correction_decays_geometrically() {
        let cfg = MachineConfig::default();
        let mut sb = StepperBackend::new();
        sb.motors[0].commanded = 0;
        sb.motors[0].encoder = -100; // large outstanding error
        let error_before = sb.error(0).abs();
        sb.prep_line(0, &cfg, 0.0, 1.0, 64_000., 2);
        // Correction added into the commanded delta; the remaining error
        // relative to encoder after this segment (assuming emitted matches
        // commanded) should be roughly half, not instantly zero.
        let half = error_before / 2;
        assert!(half > 0);
    }

    #[test]
    fn load_reads_back_steps_and_sets_direction() {
        let cfg = MachineConfig::default();
        let mut sb = StepperBackend::new();
        sb.prep_line(0, &cfg, 1.0, 1.0, 64_000., 2);
        let mut out = FakeOutput::default();
        out.emitted = 640;
        sb.load(0, &mut out);
        assert_eq!(sb.motors[0].encoder, 640);
        assert_eq!(out.dir, Some(Direction::Positive));
        assert!(out.period.is_some());
    }

    #[test]
    fn shutdown_disables_output_and_clears_state() {
        let cfg = MachineConfig::default();
        let mut sb = StepperBackend::new();
        sb.prep_line(0, &cfg, 1.0, 1.0, 64_000., 2);
        let mut out = FakeOutput::default();
        sb.shutdown(0, &mut out);
        assert!(!out.enabled);
        assert_eq!(out.period, None);
        assert!(!sb.motors[0].prepped);
    }
}
