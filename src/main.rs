#![no_main]
#![no_std]

//! RTIC 2 firmware binary: wires real `stm32-hal2` peripherals to the
//! hardware seam traits in `motionctrl::drivers` / `motionctrl::stepper`
//! and drives the cooperative foreground loop plus prioritized interrupt
//! schedule of spec §5.
//!
//! Structurally this is the teacher's `#[rtic::app(...)] mod app` shell
//! (`#[shared]`/`#[local]` resource structs, `#[init]`, `#[idle]`,
//! `#[task(binds = ..., priority = N)]`) re-purposed: `update_isr`'s
//! highest-priority timer task becomes the step-timer/segment-boundary
//! ISR; the IMU data-ready ISR's slot becomes the fault/limit-switch
//! edge ISR; the software-pended low-priority task becomes the
//! executor's `exec_next` dispatch.

use defmt::println;
use defmt_rtt as _;
use panic_probe as _;

use stm32_hal2::{
    self,
    clocks::{Clocks, InputSrc, PllSrc},
    flash::Flash,
    gpio::{Pin, PinMode, Port},
    pac::{self, TIM1, TIM2},
    timer::{Timer, TimerConfig, TimerInterrupt},
};

use motionctrl::{
    cfg_storage::FlashConfigStore,
    config::NvConfigStore,
    drivers::{DigitalOutput, SpindleOutput, SwitchInputs},
    error::AlarmReason,
    executor::{ExecResult, NUM_OUTPUTS},
    gcode_state::SpindleMode,
    stepper::{Direction, StepPulseOutput},
    switches::MAX_SWITCHES,
    MachineContext,
};

/// Step-timer tick rate (spec §6 `TIMER_CLOCK`), matching
/// `executor::TIMER_CLOCK_TICKS_PER_MIN`.
const STEP_TIMER_HZ: u32 = 64_000;

/// One real GPIO step/dir pair plus its dedicated pulse-count timer
/// channel. Implements `StepPulseOutput` (spec §4.5); the per-motor
/// timer-period-and-DMA-counter split mirrors the teacher's
/// `protocols::dshot` burst-DMA motor pulse generation, generalized from
/// a fixed DShot frame to an arbitrary step/dir pulse train.
struct MotorPins {
    step: Pin,
    dir: Pin,
    enable: Pin,
    emitted_steps: u32,
}

impl StepPulseOutput for MotorPins {
    fn set_period(&mut self, _ticks_per_step: Option<u32>) {
        // Out of scope (spec §1): the specific timer-channel/DMA register
        // programming that arms or disables this motor's pulse clock at
        // the given period lives here in the real firmware build.
    }

    fn set_direction(&mut self, dir: Direction) {
        match dir {
            Direction::Positive => self.dir.set_high(),
            Direction::Negative => self.dir.set_low(),
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        if enabled {
            self.enable.set_low(); // most step/dir drivers enable active-low
        } else {
            self.enable.set_high();
        }
    }

    fn take_emitted_steps(&mut self) -> u32 {
        let v = self.emitted_steps;
        self.emitted_steps = 0;
        v
    }
}

struct GpioSwitchInputs {
    pins: [Pin; MAX_SWITCHES],
}

impl SwitchInputs for GpioSwitchInputs {
    fn sample_all(&mut self) -> [bool; MAX_SWITCHES] {
        let mut raw_low = [true; MAX_SWITCHES];
        for (i, pin) in self.pins.iter().enumerate() {
            raw_low[i] = pin.is_low();
        }
        raw_low
    }
}

struct GpioOutput {
    pin: Pin,
}

impl DigitalOutput for GpioOutput {
    fn set(&mut self, level: bool) {
        if level {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }
}

/// VFD/Modbus/PWM spindle register programming is out of scope (spec
/// §1, §9): this only records the commanded speed/mode for whatever
/// concrete spindle backend is wired up at a higher layer.
struct SpindleSeam {
    speed: f32,
    mode: Option<SpindleMode>,
}

impl SpindleOutput for SpindleSeam {
    fn set_speed(&mut self, rpm: f32) {
        self.speed = rpm;
    }
    fn set_mode(&mut self, mode: SpindleMode) {
        self.mode = Some(mode);
    }
}

#[rtic::app(device = pac, peripherals = true, dispatchers = [EXTI9_5, EXTI15_10])]
mod app {
    use super::*;

    #[shared]
    struct Shared {
        ctx: MachineContext,
        flash: Flash,
    }

    #[local]
    struct Local {
        step_timer: Timer<TIM1>,
        debounce_timer: Timer<TIM2>,
        motor_pins: [MotorPins; motionctrl::config::MOTORS],
        switch_pins: GpioSwitchInputs,
        spindle: SpindleSeam,
        coolant: GpioOutput,
        output_pins: [GpioOutput; NUM_OUTPUTS],
        estop_pin: Pin,
        now_ms: u32,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local, init::Monotonics) {
        let mut dp = cx.device;

        let clock_cfg = Clocks {
            pll_src: PllSrc::Hse(8_000_000),
            input_src: InputSrc::Pll(PllSrc::Hse(8_000_000)),
            ..Default::default()
        };
        clock_cfg.setup().ok();

        let mut flash = Flash::new(dp.FLASH);
        let (cfg, estop_reason) = {
            let mut store = FlashConfigStore::new(&mut flash);
            store.load()
        };

        if estop_reason.is_latched() {
            println!("Boot: persisted e-stop reason was set; starting ESTOPPED.");
        }

        let ctx = MachineContext::boot(cfg, estop_reason);

        // Step-timer ISR: highest priority, drives the 1ms segment-boundary
        // poll and motor pulse generation (spec §5 "Scheduling model").
        let mut step_timer = Timer::new_tim1(dp.TIM1, 1_000., TimerConfig::default(), &clock_cfg);
        step_timer.enable_interrupt(TimerInterrupt::Update);
        step_timer.enable();

        // Debounce sample timer: drives the switch debouncer at a fixed
        // RTC-tick rate (spec §4.8).
        let mut debounce_timer = Timer::new_tim2(dp.TIM2, 1_000., TimerConfig::default(), &clock_cfg);
        debounce_timer.enable_interrupt(TimerInterrupt::Update);
        debounce_timer.enable();

        // Concrete pin assignment is board-specific; out of scope here
        // (spec §1 "pin I/O" is a collaborator interface, not core logic).
        let motor_pins = core::array::from_fn(|_| MotorPins {
            step: Pin::new(Port::A, 0, PinMode::Output),
            dir: Pin::new(Port::A, 1, PinMode::Output),
            enable: Pin::new(Port::A, 2, PinMode::Output),
            emitted_steps: 0,
        });

        let switch_pins = GpioSwitchInputs {
            pins: core::array::from_fn(|_| Pin::new(Port::B, 0, PinMode::Input)),
        };

        let estop_pin = Pin::new(Port::B, 1, PinMode::Input);

        let spindle = SpindleSeam { speed: 0., mode: None };
        let coolant = GpioOutput {
            pin: Pin::new(Port::B, 2, PinMode::Output),
        };
        let output_pins = core::array::from_fn(|_| GpioOutput {
            pin: Pin::new(Port::B, 3, PinMode::Output),
        });

        (
            Shared { ctx, flash },
            Local {
                step_timer,
                debounce_timer,
                motor_pins,
                switch_pins,
                spindle,
                coolant,
                output_pins,
                estop_pin,
                now_ms: 0,
            },
            init::Monotonics(),
        )
    }

    /// Foreground loop (spec §5 "Suspension points"): state callback, arc
    /// callback, command dispatch, executor request, report. Only this
    /// task blocks; everything else is priority-ordered interrupt work.
    #[idle(shared = [ctx])]
    fn idle(mut cx: idle::Context) -> ! {
        loop {
            cx.shared.ctx.lock(|ctx| {
                // State callback: nothing to poll here beyond what
                // `tick`'s call into `StateMachine::evaluate` already
                // handles; a richer report/telemetry layer (out of scope,
                // spec §1) would read `ctx.state_machine` here.
                let _ = &ctx.state_machine;
            });

            #[cfg(feature = "print-status")]
            cx.shared.ctx.lock(|ctx| {
                println!(
                    "state={:?} pos={:?}",
                    ctx.state_machine.state,
                    ctx.executor.position()
                );
            });

            cortex_m::asm::wfi();
        }
    }

    /// Highest priority: step-timer overflow, segment boundary (1ms poll)
    /// and motor pulse generation (spec §5).
    #[task(binds = TIM1_UP_TIM16, local = [step_timer, motor_pins, spindle, coolant, output_pins, now_ms], shared = [ctx, flash], priority = 5)]
    fn step_timer_isr(mut cx: step_timer_isr::Context) {
        cx.local.step_timer.clear_interrupt(TimerInterrupt::Update);
        *cx.local.now_ms = cx.local.now_ms.wrapping_add(1);
        let now_ms = *cx.local.now_ms;

        // Every 5th 1ms tick is a segment boundary (spec §4.4
        // "Segment clock": SEGMENT_TIME = 5ms, polled by a 1ms timer).
        if now_ms % 5 != 0 {
            return;
        }

        let [m0, m1, m2, m3] = &mut cx.local.motor_pins;
        let mut outs: [&mut MotorPins; motionctrl::config::MOTORS] = [m0, m1, m2, m3];
        let [p0, p1, p2, p3, p4] = &mut cx.local.output_pins;
        let mut output_pins: [&mut dyn DigitalOutput; NUM_OUTPUTS] = [p0, p1, p2, p3, p4];

        cx.shared.ctx.lock(|ctx| {
            let no_switch_yet = |_: u8| false; // real switch state comes from the debounce ISR
            let result = ctx.tick(
                &mut outs,
                cx.local.spindle,
                cx.local.coolant,
                &mut output_pins,
                now_ms,
                &no_switch_yet,
            );

            if let ExecResult::Error(reason) = result {
                defmt::error!("segment executor raised an alarm: {:?}", reason);
                cx.shared.flash.lock(|flash| {
                    let mut store = FlashConfigStore::new(flash);
                    store.save(&ctx.config, reason);
                });
                for motor in outs.iter_mut() {
                    motor.set_enabled(false);
                }
            }
        });
    }

    /// High priority: debounce tick, dispatching e-stop/limit/probe edges
    /// (spec §4.8, §5).
    #[task(binds = TIM2, local = [debounce_timer, switch_pins, estop_pin], shared = [ctx], priority = 4)]
    fn debounce_isr(mut cx: debounce_isr::Context) {
        cx.local.debounce_timer.clear_interrupt(TimerInterrupt::Update);

        let raw_low = cx.local.switch_pins.sample_all();
        cx.shared.ctx.lock(|ctx| {
            let mut events = [None; MAX_SWITCHES];
            ctx.debouncer.tick(&raw_low, &mut events);

            for event in events.iter().flatten() {
                use motionctrl::switches::SwitchEvent;
                match event {
                    SwitchEvent::Estop => {
                        defmt::error!("e-stop switch asserted");
                        ctx.state_machine.raise_estop(AlarmReason::EstopSwitch);
                    }
                    SwitchEvent::AxisLimit { axis, active, .. } if *active => {
                        if ctx.config.axes[*axis].homed {
                            defmt::warn!("limit switch fired on axis {}", axis);
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    /// Low priority, software-pended: runs work that shouldn't block the
    /// step-timer ISR (spec §5 "a software-triggered ISR that runs the
    /// executor's `exec_next`, allowing prep work to avoid blocking the
    /// main loop"). In this firmware the heavy prep already happens inline
    /// in `step_timer_isr`; this task is reserved for command dispatch
    /// from the (out-of-scope) host serial/JSON layer.
    #[task(shared = [ctx], priority = 2)]
    fn command_dispatch(mut cx: command_dispatch::Context) {
        cx.shared.ctx.lock(|_ctx| {
            // The G-code parser and host command/variable protocol are
            // out of scope (spec §1); a real integration spawns this task
            // from the serial RX ISR with a parsed command payload and
            // calls the relevant `GcodeState`/`StateMachine` method here.
        });
    }
}

#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
