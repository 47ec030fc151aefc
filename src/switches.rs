//! Switch input debouncer (spec §4.8). Samples digital inputs at a fixed
//! rate, debounces against a stable-sample-count, and fires edge callbacks
//! for e-stop, limit, and probe switches.
//!
//! The debounce-counter discipline is the same style as the teacher's
//! `safety::handle_arm_status`, which requires `NUM_ARM_DISARM_SIGNALS_REQUIRED`
//! consecutive matching signals before committing a state change.

use crate::error::AlarmReason;

pub const SWITCH_DEBOUNCE: u8 = 5;
pub const MAX_SWITCHES: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum SwitchType {
    Disabled,
    NormallyOpen,
    NormallyClosed,
}

/// One switch's debounced state. `raw` readings are active-low at the
/// electrical level; `active` folds in `SwitchType` to get logical polarity.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct Switch {
    pub kind: SwitchType,
    active: bool,
    pending: bool,
    pending_level: bool,
    count: u8,
}

impl Default for Switch {
    fn default() -> Self {
        Self {
            kind: SwitchType::Disabled,
            active: false,
            pending: false,
            pending_level: false,
            count: 0,
        }
    }
}

impl Switch {
    pub fn new(kind: SwitchType) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn active(&self) -> bool {
        self.kind != SwitchType::Disabled && self.active
    }

    /// Converts a raw active-low electrical reading into this switch's
    /// logical level, per its configured type.
    fn logical_from_raw(&self, raw_low: bool) -> bool {
        match self.kind {
            SwitchType::Disabled => false,
            SwitchType::NormallyOpen => raw_low,
            SwitchType::NormallyClosed => !raw_low,
        }
    }

    /// Feeds one RTC-tick sample. Returns `Some(new_active)` exactly when a
    /// debounced edge fires (P10: a transient shorter than `SWITCH_DEBOUNCE`
    /// ticks never fires a callback). Any sample that disagrees with the
    /// currently-pending level resets the counter rather than decrementing
    /// it, matching the original firmware's per-switch debounce behavior.
    pub fn sample(&mut self, raw_low: bool) -> Option<bool> {
        if self.kind == SwitchType::Disabled {
            return None;
        }

        let level = self.logical_from_raw(raw_low);

        if level == self.active {
            self.pending = false;
            self.count = 0;
            return None;
        }

        if self.pending && level == self.pending_level {
            self.count += 1;
        } else {
            self.pending = true;
            self.pending_level = level;
            self.count = 1;
        }

        if self.count >= SWITCH_DEBOUNCE {
            self.active = level;
            self.pending = false;
            self.count = 0;
            return Some(self.active);
        }

        None
    }
}

/// Owns the full switch table and dispatches debounced edges to e-stop,
/// limit, and probe handling.
pub struct Debouncer {
    pub switches: [Switch; MAX_SWITCHES],
}

impl Default for Debouncer {
    fn default() -> Self {
        Self {
            switches: [Switch::default(); MAX_SWITCHES],
        }
    }
}

pub const ESTOP_SWITCH: usize = 0;
pub const PROBE_SWITCH: usize = 1;
// Axis limit switches occupy indices 2..2+2*AXES (min, max per axis).
pub const AXIS_LIMIT_BASE: usize = 2;

#[derive(Clone, Copy, Debug, defmt::Format)]
pub enum SwitchEvent {
    Estop,
    Probe(bool),
    AxisLimit { axis: usize, is_max: bool, active: bool },
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples every switch once and returns any fired edges this tick.
    /// `raw_low[i]` is the raw active-low electrical reading for switch `i`.
    pub fn tick(&mut self, raw_low: &[bool; MAX_SWITCHES], events: &mut [Option<SwitchEvent>; MAX_SWITCHES]) {
        for i in 0..MAX_SWITCHES {
            events[i] = None;
            if let Some(active) = self.switches[i].sample(raw_low[i]) {
                events[i] = Some(self.classify(i, active));
            }
        }
    }

    fn classify(&self, idx: usize, active: bool) -> SwitchEvent {
        if idx == ESTOP_SWITCH {
            SwitchEvent::Estop
        } else if idx == PROBE_SWITCH {
            SwitchEvent::Probe(active)
        } else {
            let rel = idx - AXIS_LIMIT_BASE;
            SwitchEvent::AxisLimit {
                axis: rel / 2,
                is_max: rel % 2 == 1,
                active,
            }
        }
    }

    pub fn estop_active(&self) -> bool {
        self.switches[ESTOP_SWITCH].active()
    }
}

/// Maps a fired e-stop edge into the persisted alarm reason, for callers
/// that need to latch the state machine directly from the debouncer.
pub fn estop_alarm_reason() -> AlarmReason {
    AlarmReason::EstopSwitch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_shorter_than_debounce_does_not_fire() {
        let mut sw = Switch::new(SwitchType::NormallyOpen);
        for _ in 0..(SWITCH_DEBOUNCE - 1) {
            assert_eq!(sw.sample(true), None);
        }
        // Flicker back before reaching the threshold.
        assert_eq!(sw.sample(false), None);
        assert!(!sw.active());
    }

    #[test]
    fn stable_signal_for_debounce_count_fires_once() {
        let mut sw = Switch::new(SwitchType::NormallyOpen);
        let mut fired = None;
        for _ in 0..SWITCH_DEBOUNCE {
            if let Some(a) = sw.sample(true) {
                fired = Some(a);
            }
        }
        assert_eq!(fired, Some(true));
        assert!(sw.active());
    }

    #[test]
    fn normally_closed_inverts_polarity() {
        let mut sw = Switch::new(SwitchType::NormallyClosed);
        // raw_low=false means switch not tripped electrically for NC wiring
        // at rest (circuit intact => raw high => raw_low=false => active=false).
        for _ in 0..SWITCH_DEBOUNCE {
            sw.sample(false);
        }
        assert!(!sw.active());
        let mut fired = None;
        for _ in 0..SWITCH_DEBOUNCE {
            if let Some(a) = sw.sample(true) {
                fired = Some(a);
            }
        }
        assert_eq!(fired, Some(true));
    }

    #[test]
    fn disabled_switch_never_fires() {
        let mut sw = Switch::new(SwitchType::Disabled);
        for _ in 0..20 {
            assert_eq!(sw.sample(true), None);
        }
        assert!(!sw.active());
    }
}
