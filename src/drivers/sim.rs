//! Fake hardware implementations of the `drivers` seam traits plus
//! `stepper::StepPulseOutput` and `config::NvConfigStore`, for host-side
//! tests of the executor/stepper/state-machine interaction (spec §8
//! scenarios S1-S6). No real peripheral access.

use crate::config::{MachineConfig, NvConfigStore};
use crate::error::AlarmReason;
use crate::gcode_state::SpindleMode;
use crate::stepper::{Direction, StepPulseOutput};
use crate::switches::MAX_SWITCHES;

use super::{DigitalOutput, SpindleOutput, SwitchInputs};

#[derive(Default)]
pub struct FakeStepOutput {
    pub period: Option<u32>,
    pub direction: Option<Direction>,
    pub enabled: bool,
    pub emitted_steps: u32,
    /// What fraction of `period`-clocked steps actually arrive before the
    /// next `load()` call; tests set this to simulate stall/slip.
    pub step_yield: f32,
}

impl FakeStepOutput {
    pub fn new() -> Self {
        Self {
            step_yield: 1.,
            ..Default::default()
        }
    }

    /// Test helper: simulate the ISR emitting steps for `elapsed_ticks`
    /// at the currently armed period.
    pub fn simulate_ticks(&mut self, elapsed_ticks: u32) {
        if let Some(period) = self.period {
            if period > 0 {
                let full_steps = elapsed_ticks / period;
                self.emitted_steps += (full_steps as f32 * self.step_yield) as u32;
            }
        }
    }
}

impl StepPulseOutput for FakeStepOutput {
    fn set_period(&mut self, ticks_per_step: Option<u32>) {
        self.period = ticks_per_step;
    }
    fn set_direction(&mut self, dir: Direction) {
        self.direction = Some(dir);
    }
    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
    fn take_emitted_steps(&mut self) -> u32 {
        let v = self.emitted_steps;
        self.emitted_steps = 0;
        v
    }
}

#[derive(Default)]
pub struct FakeDigitalOutput {
    pub level: bool,
}

impl DigitalOutput for FakeDigitalOutput {
    fn set(&mut self, level: bool) {
        self.level = level;
    }
}

#[derive(Default)]
pub struct FakeSpindle {
    pub rpm: f32,
    pub mode: Option<SpindleMode>,
}

impl SpindleOutput for FakeSpindle {
    fn set_speed(&mut self, rpm: f32) {
        self.rpm = rpm;
    }
    fn set_mode(&mut self, mode: SpindleMode) {
        self.mode = Some(mode);
    }
}

/// All switches read as inactive (active-low: `true` means the electrical
/// level is idle) unless a test flips a specific index.
pub struct FakeSwitchInputs {
    pub raw_low: [bool; MAX_SWITCHES],
}

impl Default for FakeSwitchInputs {
    fn default() -> Self {
        Self {
            raw_low: [true; MAX_SWITCHES],
        }
    }
}

impl SwitchInputs for FakeSwitchInputs {
    fn sample_all(&mut self) -> [bool; MAX_SWITCHES] {
        self.raw_low
    }
}

/// In-memory stand-in for the flash-backed `NvConfigStore`; round-trips
/// whatever was last saved instead of persisting across reboots.
#[derive(Default)]
pub struct FakeConfigStore {
    saved: Option<(MachineConfig, AlarmReason)>,
}

impl NvConfigStore for FakeConfigStore {
    fn save(&mut self, cfg: &MachineConfig, alarm: AlarmReason) {
        self.saved = Some((*cfg, alarm));
    }

    fn load(&mut self) -> (MachineConfig, AlarmReason) {
        self.saved.unwrap_or_else(|| (MachineConfig::default(), AlarmReason::None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_config_store_round_trips() {
        let mut store = FakeConfigStore::default();
        let cfg = MachineConfig::default();
        store.save(&cfg, AlarmReason::SoftLimit);
        let (loaded_cfg, loaded_alarm) = store.load();
        assert_eq!(loaded_alarm, AlarmReason::SoftLimit);
        assert_eq!(loaded_cfg.axes[0].velocity_max, cfg.axes[0].velocity_max);
    }

    #[test]
    fn fake_config_store_defaults_before_any_save() {
        let mut store = FakeConfigStore::default();
        let (_, alarm) = store.load();
        assert_eq!(alarm, AlarmReason::None);
    }
}
