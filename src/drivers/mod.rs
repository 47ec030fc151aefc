//! Hardware seam traits. The firmware binary implements these over real
//! `stm32-hal2` peripherals (timers, DMA, GPIO); host-side tests drive the
//! core against the `sim` fakes instead.
//!
//! Re-purposed from the teacher's per-peripheral driver module list
//! (`baro_dps310`, `imu_icm426xx`, ...): one file per hardware concern,
//! `pub mod` per seam, same layout.

use crate::switches::MAX_SWITCHES;

/// A single boolean-level hardware output (spindle enable, coolant valve,
/// a numbered output pin, spindle mode relay).
pub trait DigitalOutput {
    fn set(&mut self, level: bool);
}

/// Raw electrical readings for every configured switch, sampled once per
/// RTC tick and fed to `switches::Debouncer::tick`.
pub trait SwitchInputs {
    fn sample_all(&mut self) -> [bool; MAX_SWITCHES];
}

/// A variable-speed spindle output (spec §9 "spindle_set_speed/mode" seam).
/// Out of scope: the specific VFD/Modbus/PWM register programming behind
/// an implementation of this trait.
pub trait SpindleOutput {
    fn set_speed(&mut self, rpm: f32);
    fn set_mode(&mut self, mode: crate::gcode_state::SpindleMode);
}

pub mod sim;
