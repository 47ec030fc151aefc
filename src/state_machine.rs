//! State machine (spec §4.6): coordinates hold/resume/flush/step requests
//! and the e-stop latch. Small `Clone, Copy, PartialEq` enums in the same
//! style as the teacher's `safety::ArmStatus`; transitions are driven by
//! the foreground loop from the executor's result and the debouncer's
//! e-stop edge, not from direct external mutation.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::AlarmReason;
use crate::executor::ExecResult;

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum State {
    Ready,
    Estopped,
    Running,
    Stopping,
    Holding,
    Jogging,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum Cycle {
    Machining,
    Homing,
    Probing,
    Jogging,
}

/// Wire-friendly repr (spec §9 "data-driven codecs"): a queued `Tag::Pause`
/// command carries one of these as a `Payload::Int`, so a program-stop
/// family command (M0/M1/M60/tool change) takes effect at the exact
/// cumulative queue position it was emitted at rather than immediately.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HoldReason {
    UserPause,
    ProgramPause,
    ProgramEnd,
    PalletChange,
    ToolChange,
    Stepping,
    Seek,
}

/// Operator/host request flags (spec §3 "State machine"). Latched by
/// request methods, consumed by `evaluate`.
#[derive(Clone, Copy, Default, Debug, defmt::Format)]
pub struct Requests {
    pub hold: Option<HoldReason>,
    pub start: bool,
    pub flush: bool,
    pub resume: bool,
    pub optional_pause: bool,
    pub step: bool,
}

pub struct StateMachine {
    pub state: State,
    pub cycle: Cycle,
    pub hold_reason: Option<HoldReason>,
    pub estop_reason: AlarmReason,
    pub requests: Requests,
    pub queue_paused: bool,
}

impl StateMachine {
    /// Boots into `Estopped` if a nonzero reason was persisted (spec §3
    /// "Lifecycle", §6 "Persisted state"); otherwise `Ready`.
    pub fn boot(persisted_estop_reason: AlarmReason) -> Self {
        let state = if persisted_estop_reason.is_latched() {
            State::Estopped
        } else {
            State::Ready
        };
        Self {
            state,
            cycle: Cycle::Machining,
            hold_reason: None,
            estop_reason: persisted_estop_reason,
            requests: Requests::default(),
            queue_paused: false,
        }
    }

    pub fn is_estopped(&self) -> bool {
        self.state == State::Estopped
    }

    /// Immediate, unconditional shutdown latch (spec §7 "User-visible
    /// behavior", I5, I11). Idempotent and sticky: calling this again while
    /// already `Estopped` just overwrites the reason shown, never clears it.
    pub fn raise_estop(&mut self, reason: AlarmReason) {
        self.state = State::Estopped;
        self.hold_reason = None;
        self.estop_reason = reason;
        self.queue_paused = true;
    }

    /// Clears the e-stop latch (I5): only permitted when no e-stop switch
    /// is currently active. On success the caller must perform a hard
    /// reset; this method only clears the in-memory latch so tests can
    /// observe the precondition independent of the reset mechanism.
    pub fn clear_estop(&mut self, estop_switch_active: bool) -> bool {
        if estop_switch_active || self.state != State::Estopped {
            return false;
        }
        self.state = State::Ready;
        self.estop_reason = AlarmReason::None;
        self.queue_paused = false;
        true
    }

    pub fn request_hold(&mut self, reason: HoldReason) {
        if self.state == State::Running || self.state == State::Ready {
            self.requests.hold = Some(reason);
        }
    }

    pub fn request_start(&mut self) {
        self.requests.start = true;
    }

    pub fn request_flush(&mut self) {
        self.requests.flush = true;
    }

    pub fn request_resume(&mut self) {
        self.requests.resume = true;
    }

    pub fn request_step(&mut self) {
        self.requests.step = true;
    }

    pub fn begin_jog(&mut self) {
        if self.state == State::Ready || self.state == State::Running {
            self.state = State::Jogging;
            self.cycle = Cycle::Jogging;
        }
    }

    pub fn end_jog(&mut self) {
        if self.state == State::Jogging {
            self.state = State::Ready;
            self.cycle = Cycle::Machining;
        }
    }

    /// One state-evaluation step (spec §4.6 "Transitions"), called once per
    /// foreground-loop iteration with the latest executor result and queue
    /// fill. Returns `true` if a flush should be performed by the caller
    /// right now (queue drop + spindle stop), which only happens once the
    /// system is quiescent (spec §4.6 "Flush rules").
    pub fn evaluate(&mut self, exec_result: ExecResult, queue_empty: bool, executor_busy: bool) -> bool {
        if self.state == State::Estopped || self.state == State::Jogging {
            return false;
        }

        match self.state {
            State::Ready => {
                if exec_result == ExecResult::Ok {
                    self.state = State::Running;
                }
            }
            State::Running => {
                if let Some(reason) = self.requests.hold.take() {
                    self.hold_reason = Some(reason);
                    self.state = State::Stopping;
                }
            }
            State::Stopping => {
                if exec_result == ExecResult::Pause && !executor_busy {
                    self.state = State::Holding;
                }
            }
            State::Holding => {
                let quiescent = !executor_busy;
                if quiescent && self.requests.flush {
                    self.requests.flush = false;
                    self.hold_reason = None;
                    if self.requests.resume {
                        self.requests.resume = false;
                        self.requests.start = true;
                    }
                    return true;
                }
                if self.requests.start {
                    self.requests.start = false;
                    self.hold_reason = None;
                    self.state = if queue_empty { State::Ready } else { State::Running };
                }
            }
            _ => {}
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boots_ready_when_no_estop_persisted() {
        let sm = StateMachine::boot(AlarmReason::None);
        assert_eq!(sm.state, State::Ready);
    }

    #[test]
    fn boots_estopped_when_reason_persisted() {
        let sm = StateMachine::boot(AlarmReason::SoftLimit);
        assert_eq!(sm.state, State::Estopped);
        assert_eq!(sm.estop_reason, AlarmReason::SoftLimit);
    }

    #[test]
    fn ready_to_running_on_first_move_picked_up() {
        let mut sm = StateMachine::boot(AlarmReason::None);
        sm.evaluate(ExecResult::Ok, false, true);
        assert_eq!(sm.state, State::Running);
    }

    #[test]
    fn hold_requested_during_running_reaches_holding_with_no_runtime_velocity() {
        // P9
        let mut sm = StateMachine::boot(AlarmReason::None);
        sm.evaluate(ExecResult::Ok, false, true);
        sm.request_hold(HoldReason::UserPause);
        sm.evaluate(ExecResult::Ok, false, true);
        assert_eq!(sm.state, State::Stopping);
        sm.evaluate(ExecResult::Pause, false, false);
        assert_eq!(sm.state, State::Holding);
        assert_eq!(sm.hold_reason, Some(HoldReason::UserPause));
    }

    #[test]
    fn start_from_holding_goes_to_running_iff_queue_nonempty() {
        // P9
        let mut sm = StateMachine::boot(AlarmReason::None);
        sm.state = State::Holding;
        sm.request_start();
        sm.evaluate(ExecResult::Noop, false, false);
        assert_eq!(sm.state, State::Running);

        let mut sm2 = StateMachine::boot(AlarmReason::None);
        sm2.state = State::Holding;
        sm2.request_start();
        sm2.evaluate(ExecResult::Noop, true, false);
        assert_eq!(sm2.state, State::Ready);
    }

    #[test]
    fn estop_is_sticky_and_idempotent() {
        // P11
        let mut sm = StateMachine::boot(AlarmReason::None);
        sm.raise_estop(AlarmReason::MotorFault);
        assert!(sm.is_estopped());
        sm.raise_estop(AlarmReason::MotorFault);
        assert!(sm.is_estopped());
        assert_eq!(sm.estop_reason, AlarmReason::MotorFault);
    }

    #[test]
    fn clear_estop_fails_while_switch_active() {
        // P11
        let mut sm = StateMachine::boot(AlarmReason::None);
        sm.raise_estop(AlarmReason::EstopSwitch);
        assert!(!sm.clear_estop(true));
        assert!(sm.is_estopped());
        assert!(sm.clear_estop(false));
        assert_eq!(sm.state, State::Ready);
    }

    #[test]
    fn flush_is_deferred_until_quiescent() {
        let mut sm = StateMachine::boot(AlarmReason::None);
        sm.state = State::Holding;
        sm.request_flush();
        // Still busy: flush must not fire yet.
        assert!(!sm.evaluate(ExecResult::Noop, false, true));
        assert!(sm.requests.flush);
        // Quiescent now: flush fires.
        assert!(sm.evaluate(ExecResult::Noop, false, false));
        assert!(!sm.requests.flush);
    }

    #[test]
    fn jog_round_trip_from_ready() {
        let mut sm = StateMachine::boot(AlarmReason::None);
        sm.begin_jog();
        assert_eq!(sm.state, State::Jogging);
        sm.end_jog();
        assert_eq!(sm.state, State::Ready);
    }
}
