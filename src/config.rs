//! Machine configuration: per-axis and per-motor parameters, and the
//! non-volatile persistence seam. Generalizes the teacher's `UserCfg` +
//! `cfg_storage.rs` flash round-trip (`reference_firmware/firmware/src/cfg_storage.rs`)
//! from a single flight-controller settings blob to a per-axis/per-motor
//! machine description plus the persisted alarm reason.

use crate::error::AlarmReason;

pub const AXES: usize = 6; // X, Y, Z, A, B, C
pub const MOTORS: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum MotorPowerMode {
    Disabled,
    Always,
    InCycle,
    OnlyWhenMoving,
}

#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct AxisConfig {
    pub enabled: bool,
    pub velocity_max: f32,   // mm/min (or deg/min for rotary)
    pub accel_max: f32,      // mm/min^2
    pub jerk_max: f32,       // mm/min^3
    /// Non-zero selects rotary radius mode: linear mm input is converted to
    /// degrees about this radius (spec §4.1 "Target resolution").
    pub radius: f32,
    pub soft_limit_min: f32,
    pub soft_limit_max: f32,
    pub feedrate_max_for_arc: f32,
    pub is_rotary: bool,
    pub homed: bool,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            velocity_max: 3_000.,
            accel_max: 100_000.,
            jerk_max: 10_000_000.,
            radius: 0.,
            soft_limit_min: 0.,
            soft_limit_max: 0.,
            feedrate_max_for_arc: 3_000.,
            is_rotary: false,
            homed: false,
        }
    }
}

impl AxisConfig {
    /// Soft limits only apply once the axis has been homed; an un-homed
    /// axis has no known machine-coordinate reference (spec §11, from
    /// `axis.c`).
    pub fn soft_limits_active(&self) -> bool {
        self.homed && self.soft_limit_max > self.soft_limit_min
    }
}

#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct MotorConfig {
    pub axis: usize, // index into AxisConfig table; multiple motors may share an axis (gantry)
    pub microsteps: u16,
    pub step_angle_deg: f32,
    pub travel_per_rev: f32, // mm or deg per revolution
    pub reversed: bool,
    pub power_mode: MotorPowerMode,
}

impl MotorConfig {
    /// Steps commanded per unit of axis travel (mm or degree).
    pub fn steps_per_unit(&self) -> f32 {
        let steps_per_rev = (360. / self.step_angle_deg) * self.microsteps as f32;
        steps_per_rev / self.travel_per_rev
    }
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            axis: 0,
            microsteps: 16,
            step_angle_deg: 1.8,
            travel_per_rev: 5.,
            reversed: false,
            power_mode: MotorPowerMode::OnlyWhenMoving,
        }
    }
}

#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct MachineConfig {
    pub axes: [AxisConfig; AXES],
    pub motors: [MotorConfig; MOTORS],
}

impl Default for MachineConfig {
    fn default() -> Self {
        let mut axes = [AxisConfig::default(); AXES];
        for (i, axis) in axes.iter_mut().enumerate() {
            axis.enabled = i < 3; // X, Y, Z enabled by default
            axis.is_rotary = i >= 3; // A, B, C are rotary
            axis.soft_limit_max = 300.;
        }

        let mut motors = [MotorConfig::default(); MOTORS];
        for (i, motor) in motors.iter_mut().enumerate() {
            motor.axis = i.min(AXES - 1);
        }

        Self { axes, motors }
    }
}

impl MachineConfig {
    pub fn axis(&self, i: usize) -> &AxisConfig {
        &self.axes[i]
    }

    pub fn motors_for_axis(&self, axis: usize) -> impl Iterator<Item = (usize, &MotorConfig)> {
        self.motors
            .iter()
            .enumerate()
            .filter(move |(_, m)| m.axis == axis)
    }
}

/// Non-volatile persistence seam. The firmware binary implements this over
/// `stm32_hal2::flash::Flash` (see `src/cfg_storage.rs`); host-side tests use
/// an in-memory fake.
pub trait NvConfigStore {
    fn save(&mut self, cfg: &MachineConfig, alarm: AlarmReason);
    fn load(&mut self) -> (MachineConfig, AlarmReason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_three_linear_axes_enabled() {
        let cfg = MachineConfig::default();
        assert!(cfg.axes[0].enabled && !cfg.axes[0].is_rotary);
        assert!(cfg.axes[2].enabled && !cfg.axes[2].is_rotary);
        assert!(!cfg.axes[3].enabled);
    }

    #[test]
    fn steps_per_unit_matches_hand_calc() {
        let m = MotorConfig {
            microsteps: 16,
            step_angle_deg: 1.8,
            travel_per_rev: 8.,
            ..Default::default()
        };
        // 200 full steps/rev * 16 microsteps / 8mm travel = 400 steps/mm
        assert!((m.steps_per_unit() - 400.).abs() < 1e-3);
    }
}
