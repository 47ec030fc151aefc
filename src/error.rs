//! Error taxonomy for the motion-control core.
//!
//! Two families, matching the propagation split: `CommandError` is returned
//! synchronously from machining-layer entry points (validation and G-code
//! semantic errors; the call fails and state is unchanged). `AlarmReason` is
//! latched into the state machine asynchronously, and persists across a
//! reboot until cleared.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Returned synchronously by machining-layer entry points. State is
/// unchanged whenever one of these is returned.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum CommandError {
    /// A numeric argument was out of range or malformed.
    BadValue,
    /// Too few or too many arguments supplied for the command.
    ArgCount,
    /// An axis name wasn't recognized or isn't enabled.
    UnknownAxis,
    /// Inverse-time feed mode requires a non-zero F word in the same block.
    FeedRateMissing,
    /// An arc was specified without the offsets/radius the active plane needs.
    ArcAxisMissingForPlane,
    /// Radius-mode arc where the endpoint equals the start point.
    ArcEndpointEqualsStart,
    /// Computed end radius differs from start radius by more than tolerance.
    ArcRadiusOutOfTolerance,
    /// A move resolved to zero displacement on every axis.
    ZeroLengthMove,
    /// The resolved target violates a configured soft limit.
    SoftLimitExceeded,
    /// A seek/probe move specified no moving axis.
    SeekNoAxis,
    /// A seek/probe move specified more than one moving axis.
    SeekMultipleAxes,
    /// A seek/probe move was requested on a disabled switch.
    SeekSwitchDisabled,
    /// The planner queue has no room for another command right now.
    QueueFull,
    /// The command is not valid while the machine is in its current state
    /// (e.g. issuing a feed move while ESTOPPED).
    InvalidInState,
}

/// Latched into the state machine on any hazard; persists in non-volatile
/// storage across a reboot (spec §6 "Persisted state").
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AlarmReason {
    /// No alarm is latched; this is the persisted value on a clean boot.
    None = 0,
    /// A soft limit was exceeded by an enabled, homed axis.
    SoftLimit = 1,
    /// An internal consistency check failed (assertion, expected-move-not-queued).
    InternalError = 2,
    /// A hardware e-stop switch was asserted.
    EstopSwitch = 3,
    /// A motor driver reported a fault (stall, overcurrent, disconnected).
    MotorFault = 4,
    /// A seek/probe move declared `error` ran to its endpoint without
    /// detecting the expected switch edge.
    SeekNotFound = 5,
    /// Communication with a required peripheral was lost.
    CommunicationLoss = 6,
}

impl AlarmReason {
    pub fn is_latched(self) -> bool {
        !matches!(self, AlarmReason::None)
    }
}

impl Default for AlarmReason {
    fn default() -> Self {
        AlarmReason::None
    }
}
