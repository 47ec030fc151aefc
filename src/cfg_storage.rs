//! Flash-backed `NvConfigStore` (spec §6 "Persisted state", §10.4):
//! round-trips `MachineConfig` plus the persisted `AlarmReason` through a
//! single flash page/sector. Firmware-only (`stm32_hal2::flash`); host
//! tests use `drivers::sim::FakeConfigStore` instead.
//!
//! Generalizes the teacher's `cfg_storage.rs` (`UserCfg::save`, a single
//! settings blob written with `erase_write_page`/`erase_write_sector`)
//! into a manual byte-packed layout for the machine description plus the
//! one-byte alarm reason, read back with `Flash::read`.

use stm32_hal2::flash::{Bank, Flash};

use crate::config::{
    AxisConfig, MachineConfig, MotorConfig, MotorPowerMode, NvConfigStore, AXES, MOTORS,
};
use crate::error::AlarmReason;

/// Single flash page reserved for machine config + alarm reason. The
/// teacher's single-MCU-target simplification (DESIGN.md) means there is
/// one constant here rather than a `g4`/`h7` cfg-if pair.
const FLASH_CFG_PAGE: u8 = 127;

const AXIS_BYTES: usize = 4 * 7 + 1; // 7 f32 fields + 1 flags byte
const MOTOR_BYTES: usize = 1 + 2 + 4 + 4 + 1; // axis idx, microsteps, step_angle, travel_per_rev, flags
const CFG_BYTES: usize = AXIS_BYTES * AXES + MOTOR_BYTES * MOTORS + 1; // + alarm reason byte

fn encode_axis(axis: &AxisConfig, out: &mut [u8]) {
    out[0..4].copy_from_slice(&axis.velocity_max.to_le_bytes());
    out[4..8].copy_from_slice(&axis.accel_max.to_le_bytes());
    out[8..12].copy_from_slice(&axis.jerk_max.to_le_bytes());
    out[12..16].copy_from_slice(&axis.radius.to_le_bytes());
    out[16..20].copy_from_slice(&axis.soft_limit_min.to_le_bytes());
    out[20..24].copy_from_slice(&axis.soft_limit_max.to_le_bytes());
    out[24..28].copy_from_slice(&axis.feedrate_max_for_arc.to_le_bytes());
    let mut flags = 0u8;
    if axis.enabled {
        flags |= 0b001;
    }
    if axis.is_rotary {
        flags |= 0b010;
    }
    if axis.homed {
        flags |= 0b100;
    }
    out[28] = flags;
}

fn decode_axis(buf: &[u8]) -> AxisConfig {
    let f = |r: core::ops::Range<usize>| f32::from_le_bytes(buf[r].try_into().unwrap());
    let flags = buf[28];
    AxisConfig {
        enabled: flags & 0b001 != 0,
        velocity_max: f(0..4),
        accel_max: f(4..8),
        jerk_max: f(8..12),
        radius: f(12..16),
        soft_limit_min: f(16..20),
        soft_limit_max: f(20..24),
        feedrate_max_for_arc: f(24..28),
        is_rotary: flags & 0b010 != 0,
        homed: flags & 0b100 != 0,
    }
}

fn power_mode_to_u8(mode: MotorPowerMode) -> u8 {
    match mode {
        MotorPowerMode::Disabled => 0,
        MotorPowerMode::Always => 1,
        MotorPowerMode::InCycle => 2,
        MotorPowerMode::OnlyWhenMoving => 3,
    }
}

fn power_mode_from_u8(v: u8) -> MotorPowerMode {
    match v {
        0 => MotorPowerMode::Disabled,
        1 => MotorPowerMode::Always,
        2 => MotorPowerMode::InCycle,
        _ => MotorPowerMode::OnlyWhenMoving,
    }
}

fn encode_motor(motor: &MotorConfig, out: &mut [u8]) {
    out[0] = motor.axis as u8;
    out[1..3].copy_from_slice(&motor.microsteps.to_le_bytes());
    out[3..7].copy_from_slice(&motor.step_angle_deg.to_le_bytes());
    out[7..11].copy_from_slice(&motor.travel_per_rev.to_le_bytes());
    let mut flags = power_mode_to_u8(motor.power_mode);
    if motor.reversed {
        flags |= 0b1000_0000;
    }
    out[11] = flags;
}

fn decode_motor(buf: &[u8]) -> MotorConfig {
    let flags = buf[11];
    MotorConfig {
        axis: buf[0] as usize,
        microsteps: u16::from_le_bytes(buf[1..3].try_into().unwrap()),
        step_angle_deg: f32::from_le_bytes(buf[3..7].try_into().unwrap()),
        travel_per_rev: f32::from_le_bytes(buf[7..11].try_into().unwrap()),
        reversed: flags & 0b1000_0000 != 0,
        power_mode: power_mode_from_u8(flags & 0b0111_1111),
    }
}

fn encode(cfg: &MachineConfig, alarm: AlarmReason) -> [u8; CFG_BYTES] {
    let mut buf = [0u8; CFG_BYTES];
    let mut offset = 0;
    for axis in cfg.axes.iter() {
        encode_axis(axis, &mut buf[offset..offset + AXIS_BYTES]);
        offset += AXIS_BYTES;
    }
    for motor in cfg.motors.iter() {
        encode_motor(motor, &mut buf[offset..offset + MOTOR_BYTES]);
        offset += MOTOR_BYTES;
    }
    buf[offset] = alarm.into();
    buf
}

fn decode(buf: &[u8; CFG_BYTES]) -> (MachineConfig, AlarmReason) {
    let mut cfg = MachineConfig::default();
    let mut offset = 0;
    for axis in cfg.axes.iter_mut() {
        *axis = decode_axis(&buf[offset..offset + AXIS_BYTES]);
        offset += AXIS_BYTES;
    }
    for motor in cfg.motors.iter_mut() {
        *motor = decode_motor(&buf[offset..offset + MOTOR_BYTES]);
        offset += MOTOR_BYTES;
    }
    let alarm = AlarmReason::try_from(buf[offset]).unwrap_or(AlarmReason::None);
    (cfg, alarm)
}

pub struct FlashConfigStore<'a> {
    flash: &'a mut Flash,
}

impl<'a> FlashConfigStore<'a> {
    pub fn new(flash: &'a mut Flash) -> Self {
        Self { flash }
    }
}

impl<'a> NvConfigStore for FlashConfigStore<'a> {
    fn save(&mut self, cfg: &MachineConfig, alarm: AlarmReason) {
        let data = encode(cfg, alarm);
        self.flash.erase_write_page(Bank::B1, FLASH_CFG_PAGE, &data).ok();
    }

    fn load(&mut self) -> (MachineConfig, AlarmReason) {
        let mut buf = [0u8; CFG_BYTES];
        self.flash.read(Bank::B1, FLASH_CFG_PAGE, 0, &mut buf);
        // All-0xFF is the erased-flash pattern; treat it as "never saved"
        // and fall back to defaults rather than decoding garbage.
        if buf.iter().all(|b| *b == 0xFF) {
            return (MachineConfig::default(), AlarmReason::None);
        }
        decode(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_round_trips_through_byte_encoding() {
        let axis = AxisConfig {
            enabled: true,
            velocity_max: 3_456.,
            accel_max: 98_765.,
            jerk_max: 1_234_567.,
            radius: 12.5,
            soft_limit_min: -10.,
            soft_limit_max: 310.,
            feedrate_max_for_arc: 2_500.,
            is_rotary: true,
            homed: true,
        };
        let mut buf = [0u8; AXIS_BYTES];
        encode_axis(&axis, &mut buf);
        let back = decode_axis(&buf);
        assert_eq!(back.enabled, axis.enabled);
        assert_eq!(back.is_rotary, axis.is_rotary);
        assert_eq!(back.homed, axis.homed);
        assert!((back.velocity_max - axis.velocity_max).abs() < 1e-3);
        assert!((back.soft_limit_min - axis.soft_limit_min).abs() < 1e-3);
    }

    #[test]
    fn motor_round_trips_through_byte_encoding() {
        let motor = MotorConfig {
            axis: 2,
            microsteps: 32,
            step_angle_deg: 0.9,
            travel_per_rev: 40.,
            reversed: true,
            power_mode: MotorPowerMode::InCycle,
        };
        let mut buf = [0u8; MOTOR_BYTES];
        encode_motor(&motor, &mut buf);
        let back = decode_motor(&buf);
        assert_eq!(back.axis, motor.axis);
        assert_eq!(back.microsteps, motor.microsteps);
        assert_eq!(back.reversed, motor.reversed);
        assert_eq!(back.power_mode, motor.power_mode);
    }

    #[test]
    fn full_config_round_trips_with_alarm_reason() {
        let cfg = MachineConfig::default();
        let buf = encode(&cfg, AlarmReason::SoftLimit);
        let (back_cfg, back_alarm) = decode(&buf);
        assert_eq!(back_alarm, AlarmReason::SoftLimit);
        assert_eq!(back_cfg.axes[0].enabled, cfg.axes[0].enabled);
        assert_eq!(back_cfg.motors[0].microsteps, cfg.motors[0].microsteps);
    }
}
