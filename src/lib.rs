//! Motion-control firmware core: the pipeline that turns interpreted
//! G-code motion commands into precisely timed stepper-motor pulses.
//!
//! `no_std` in the firmware build, but links `std` under `cargo test` (the
//! `not(test)` gate below) so every module's `#[cfg(test)]` block runs on
//! the host against the hardware-seam fakes in `drivers::sim`, exactly as
//! the teacher's algorithmic core is exercised independent of real
//! peripherals.

#![cfg_attr(not(test), no_std)]

pub mod arc;
pub mod config;
#[cfg(feature = "firmware")]
pub mod cfg_storage;
pub mod drivers;
pub mod error;
pub mod executor;
pub mod gcode_state;
pub mod jog;
pub mod planner;
pub mod scurve;
pub mod state_machine;
pub mod stepper;
pub mod switches;
pub mod util;

use crate::config::MachineConfig;
use crate::drivers::{DigitalOutput, SpindleOutput};
use crate::error::AlarmReason;
use crate::executor::{ExecResult, Executor, NUM_OUTPUTS};
use crate::gcode_state::GcodeState;
use crate::jog::JogEngine;
use crate::planner::Queue;
use crate::state_machine::{State, StateMachine};
use crate::switches::Debouncer;

/// Owns every piece of the §2 component graph as an explicit, owned
/// context struct (spec §9 "Global state -> explicit contexts"): the
/// firmware binary's `#[shared]`/`#[local]` RTIC resources hold one of
/// these, installed once at `#[init]`, rather than module-scope statics.
pub struct MachineContext {
    pub config: MachineConfig,
    pub gcode_state: GcodeState,
    pub arc_state: arc::ArcState,
    pub queue: Queue,
    pub executor: Executor,
    pub stepper: stepper::StepperBackend,
    pub state_machine: StateMachine,
    pub jog: JogEngine,
    pub jog_input: jog::JogInput,
    pub debouncer: Debouncer,
}

impl MachineContext {
    /// Boot-time construction (spec §3 "Lifecycle"): machining layer
    /// defaults, cleared offsets, the stepper back-end's motor/axis map,
    /// and the persisted e-stop reason loaded from non-volatile storage.
    pub fn boot(config: MachineConfig, persisted_estop_reason: AlarmReason) -> Self {
        Self {
            config,
            gcode_state: GcodeState::new(),
            arc_state: arc::ArcState::default(),
            queue: Queue::new(),
            executor: Executor::new(),
            stepper: stepper::StepperBackend::new(),
            state_machine: StateMachine::boot(persisted_estop_reason),
            jog: JogEngine::new(),
            jog_input: jog::JogInput::default(),
            debouncer: Debouncer::new(),
        }
    }

    /// Runs the arc callback (if an arc is active) followed by one
    /// `exec_next` iteration, then feeds the result into the state machine
    /// (spec §5 "Suspension points": "state callback, arc callback, command
    /// dispatch, executor request, and report"). Returns the executor
    /// result so the caller (foreground loop or a test) can react to
    /// `ExecResult::Error` by raising an e-stop.
    #[allow(clippy::too_many_arguments)]
    pub fn tick<O: stepper::StepPulseOutput>(
        &mut self,
        outputs: &mut [&mut O],
        spindle: &mut dyn SpindleOutput,
        coolant: &mut dyn DigitalOutput,
        output_pins: &mut [&mut dyn DigitalOutput; NUM_OUTPUTS],
        now_ms: u32,
        switch_active: &dyn Fn(u8) -> bool,
    ) -> ExecResult {
        if self.state_machine.is_estopped() {
            return ExecResult::Noop;
        }

        if self.state_machine.state == State::Jogging {
            if let Some(input) = self.jog_input.try_read() {
                let mut pos = self.executor.position();
                let (_, all_idle) = self.jog.tick(&self.config, &mut pos, &input);
                self.executor.jog_exec(
                    &self.config,
                    &mut self.stepper,
                    pos,
                    crate::executor::SEGMENT_TIME_MIN,
                    outputs,
                );
                if all_idle {
                    self.jog.reset();
                    self.state_machine.end_jog();
                }
            }
            return ExecResult::Noop;
        }

        self.arc_state.callback(&mut self.queue);

        let result = self.executor.exec_next(
            &self.config,
            &mut self.queue,
            &mut self.stepper,
            outputs,
            spindle,
            coolant,
            output_pins,
            now_ms,
            switch_active,
        );

        if let ExecResult::Error(reason) = result {
            self.state_machine.raise_estop(reason);
            return result;
        }

        if let ExecResult::HoldRequested(reason) = result {
            self.state_machine.request_hold(reason);
        }

        let should_flush = self
            .state_machine
            .evaluate(result, self.queue.empty(), self.executor.is_busy());
        if should_flush {
            self.queue.flush();
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::drivers::sim::{FakeDigitalOutput, FakeSpindle, FakeStepOutput};
    use crate::planner::{Payload, Tag};

    struct SideEffects {
        spindle: FakeSpindle,
        coolant: FakeDigitalOutput,
        pins: [FakeDigitalOutput; NUM_OUTPUTS],
    }

    impl Default for SideEffects {
        fn default() -> Self {
            Self {
                spindle: FakeSpindle::default(),
                coolant: FakeDigitalOutput::default(),
                pins: core::array::from_fn(|_| FakeDigitalOutput::default()),
            }
        }
    }


    #[test]
    fn boots_ready_and_runs_a_queued_move_to_completion() {
        // End-to-end smoke test composing gcode_state -> queue -> executor
        // -> stepper, matching S1's shape (single-axis linear feed).
        let mut ctx = MachineContext::boot(MachineConfig::default(), AlarmReason::None);
        ctx.config.axes[0].enabled = true;
        ctx.config.axes[0].velocity_max = 3_000.;
        ctx.config.axes[0].accel_max = 100_000.;
        ctx.config.axes[0].jerk_max = 10_000_000.;
        ctx.gcode_state.feed_rate = 3_000.;

        let values = [100., 0., 0., 0., 0., 0.];
        let flags = [true, false, false, false, false, false];
        ctx.gcode_state
            .feed(&ctx.config, &mut ctx.queue, &values, &flags, false)
            .unwrap();

        let mut o0 = FakeStepOutput::new();
        let mut o1 = FakeStepOutput::new();
        let mut o2 = FakeStepOutput::new();
        let mut o3 = FakeStepOutput::new();
        let no_switch = |_: u8| false;
        let mut fx = SideEffects::default();

        let mut last = ExecResult::Noop;
        for _ in 0..200_000 {
            let mut outs: [&mut FakeStepOutput; 4] = [&mut o0, &mut o1, &mut o2, &mut o3];
            let SideEffects { spindle, coolant, pins } = &mut fx;
            let [p0, p1, p2, p3, p4] = pins;
            let mut output_pins: [&mut dyn DigitalOutput; NUM_OUTPUTS] = [p0, p1, p2, p3, p4];
            last = ctx.tick(&mut outs, spindle, coolant, &mut output_pins, 0, &no_switch);
            if last == ExecResult::Pause {
                break;
            }
        }
        assert_eq!(last, ExecResult::Pause);
        assert!((ctx.executor.position()[0] - 100.).abs() < 1e-3);
    }

    #[test]
    fn estop_freezes_further_ticks() {
        let mut ctx = MachineContext::boot(MachineConfig::default(), AlarmReason::None);
        ctx.queue.push(Tag::Dwell, Payload::Float(1.), 1);
        ctx.state_machine.raise_estop(AlarmReason::EstopSwitch);

        let mut o0 = FakeStepOutput::new();
        let mut o1 = FakeStepOutput::new();
        let mut o2 = FakeStepOutput::new();
        let mut o3 = FakeStepOutput::new();
        let no_switch = |_: u8| false;
        let mut outs: [&mut FakeStepOutput; 4] = [&mut o0, &mut o1, &mut o2, &mut o3];
        let mut fx = SideEffects::default();
        let SideEffects { spindle, coolant, pins } = &mut fx;
        let [p0, p1, p2, p3, p4] = pins;
        let mut output_pins: [&mut dyn DigitalOutput; NUM_OUTPUTS] = [p0, p1, p2, p3, p4];

        assert_eq!(
            ctx.tick(&mut outs, spindle, coolant, &mut output_pins, 0, &no_switch),
            ExecResult::Noop
        );
        assert!(!ctx.queue.empty()); // frozen: the dwell was never popped
    }

    #[test]
    fn jogging_drives_the_stepper_and_ends_jog_on_release() {
        // spec §4.4 "Jog dispatch": while STATE=JOGGING, tick() must call
        // the jog engine instead of the normal segment machine.
        let mut ctx = MachineContext::boot(MachineConfig::default(), AlarmReason::None);
        ctx.config.axes[0].enabled = true;
        ctx.config.axes[0].velocity_max = 3_000.;
        ctx.config.axes[0].accel_max = 100_000.;
        ctx.config.axes[0].jerk_max = 10_000_000.;
        ctx.state_machine.begin_jog();
        ctx.jog_input.values[0] = 1.;

        let mut o0 = FakeStepOutput::new();
        let mut o1 = FakeStepOutput::new();
        let mut o2 = FakeStepOutput::new();
        let mut o3 = FakeStepOutput::new();
        let no_switch = |_: u8| false;
        let mut fx = SideEffects::default();

        for _ in 0..500 {
            let mut outs: [&mut FakeStepOutput; 4] = [&mut o0, &mut o1, &mut o2, &mut o3];
            let SideEffects { spindle, coolant, pins } = &mut fx;
            let [p0, p1, p2, p3, p4] = pins;
            let mut output_pins: [&mut dyn DigitalOutput; NUM_OUTPUTS] = [p0, p1, p2, p3, p4];
            ctx.tick(&mut outs, spindle, coolant, &mut output_pins, 0, &no_switch);
        }
        assert_eq!(ctx.state_machine.state, State::Jogging);
        assert!(ctx.executor.position()[0] > 0.);

        ctx.jog_input.values[0] = 0.;
        for _ in 0..2_000 {
            let mut outs: [&mut FakeStepOutput; 4] = [&mut o0, &mut o1, &mut o2, &mut o3];
            let SideEffects { spindle, coolant, pins } = &mut fx;
            let [p0, p1, p2, p3, p4] = pins;
            let mut output_pins: [&mut dyn DigitalOutput; NUM_OUTPUTS] = [p0, p1, p2, p3, p4];
            ctx.tick(&mut outs, spindle, coolant, &mut output_pins, 0, &no_switch);
            if ctx.state_machine.state == State::Ready {
                break;
            }
        }
        assert_eq!(ctx.state_machine.state, State::Ready);
    }
}
