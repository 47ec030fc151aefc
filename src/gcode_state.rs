//! Machining layer (spec §4.1): maintains modal G-code state, resolves
//! user-supplied target vectors into machine coordinates, and dispatches
//! canonical operations into the planner queue.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::arc::{self, PlaneAxes, Rotation};
use crate::config::{MachineConfig, AXES};
use crate::error::CommandError;
use crate::planner::{Payload, Queue, SeekDescriptor, Tag};
use crate::state_machine::HoldReason;

pub const COORDS: usize = 6; // G54..G59

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum Plane {
    Xy,
    Xz,
    Yz,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum Units {
    Inch,
    Mm,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum DistanceMode {
    Absolute,
    Incremental,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum FeedMode {
    UnitsPerMinute,
    InverseTime,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum PathMode {
    ExactStop,
    Continuous,
    ExactPath,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum MotionMode {
    Rapid,
    Feed,
    CwArc,
    CcwArc,
    SeekOpenNoError,
    SeekOpenError,
    SeekCloseNoError,
    SeekCloseError,
    Cancel,
}

/// Wire-friendly repr (spec §9 "data-driven codecs" redesign note): the
/// queued `Tag::SpindleMode` command carries this as a `Payload::Int`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SpindleMode {
    Off,
    Cw,
    Ccw,
}

/// Per-axis flags indicating which axes were addressed in the current
/// block.
pub type AxisFlags = [bool; AXES];

#[derive(Clone, Copy, Debug)]
pub struct GcodeState {
    pub line_number: u32,
    pub feed_rate: f32,
    pub feed_mode: FeedMode,
    pub motion_mode: MotionMode,
    pub plane: Plane,
    pub units: Units,
    pub distance_mode: DistanceMode,
    pub arc_distance_incremental: bool,
    pub coord_system: usize, // 0..COORDS, selects `offsets[coord_system]`
    pub absolute_override: bool,
    pub path_mode: PathMode,
    pub tool: u8,
    pub feed_override: f32,
    pub spindle_override: f32,
    pub overrides_enabled: bool,
    pub spindle_mode: SpindleMode,
    pub spindle_speed: f32,
    pub coolant_on: bool,

    pub offsets: [[f32; AXES]; COORDS],
    pub origin_offset: [f32; AXES],
    pub origin_enable: bool,
    pub g28_position: [f32; AXES],
    pub g30_position: [f32; AXES],

    pub position: [f32; AXES],
    applied_offsets: [f32; AXES],
}

impl Default for GcodeState {
    fn default() -> Self {
        Self {
            line_number: 0,
            feed_rate: 0.,
            feed_mode: FeedMode::UnitsPerMinute,
            motion_mode: MotionMode::Rapid,
            plane: Plane::Xy,
            units: Units::Mm,
            distance_mode: DistanceMode::Absolute,
            arc_distance_incremental: true,
            coord_system: 0,
            absolute_override: false,
            path_mode: PathMode::ExactStop,
            tool: 0,
            feed_override: 1.,
            spindle_override: 1.,
            overrides_enabled: true,
            spindle_mode: SpindleMode::Off,
            spindle_speed: 0.,
            coolant_on: false,
            offsets: [[0.; AXES]; COORDS],
            origin_offset: [0.; AXES],
            origin_enable: false,
            g28_position: [0.; AXES],
            g30_position: [0.; AXES],
            position: [0.; AXES],
            applied_offsets: [0.; AXES],
        }
    }
}

fn to_mm(v: f32, units: Units) -> f32 {
    match units {
        Units::Mm => v,
        Units::Inch => v * 25.4,
    }
}

impl GcodeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active coord offset for axis `i` (spec §4.1 "Active coord offset").
    fn active_coord_offset(&self, i: usize) -> f32 {
        if self.absolute_override {
            0.
        } else {
            self.offsets[self.coord_system][i] + if self.origin_enable { self.origin_offset[i] } else { 0. }
        }
    }

    /// Resolves a user-supplied target vector into a machine-coordinate
    /// position (spec §4.1 "Target resolution").
    pub fn resolve_target(
        &self,
        cfg: &MachineConfig,
        values: &[f32; AXES],
        flags: &AxisFlags,
    ) -> Result<[f32; AXES], CommandError> {
        let mut target = self.position;

        for i in 0..AXES {
            if !flags[i] {
                continue;
            }
            let axis = cfg.axis(i);
            if !axis.enabled {
                return Err(CommandError::UnknownAxis);
            }

            let delta = if axis.radius != 0. {
                to_mm(values[i], self.units) * 360. / (2. * core::f32::consts::PI * axis.radius)
            } else if axis.is_rotary {
                values[i] // degrees, no unit scaling
            } else {
                to_mm(values[i], self.units)
            };

            target[i] = if self.distance_mode == DistanceMode::Absolute {
                self.active_coord_offset(i) + delta
            } else {
                self.position[i] + delta
            };
        }

        Ok(target)
    }

    /// Tests the resolved target against configured soft limits (spec I7).
    pub fn check_soft_limits(&self, cfg: &MachineConfig, target: &[f32; AXES]) -> Result<(), CommandError> {
        for i in 0..AXES {
            let axis = cfg.axis(i);
            if axis.soft_limits_active() && (target[i] < axis.soft_limit_min || target[i] > axis.soft_limit_max) {
                return Err(CommandError::SoftLimitExceeded);
            }
        }
        Ok(())
    }

    /// Pushes an `UPDATE_WORK_OFFSETS` command if the resolved offsets
    /// changed since the last push (spec §4.1 "Work offsets").
    fn sync_work_offsets(&mut self, queue: &mut Queue) {
        let mut current = [0.; AXES];
        for i in 0..AXES {
            current[i] = self.active_coord_offset(i);
        }
        if current != self.applied_offsets {
            self.applied_offsets = current;
            queue.push(Tag::UpdateWorkOffsets, Payload::Vector(current), self.line_number);
        }
    }

    fn zero_length(target: &[f32; AXES], current: &[f32; AXES]) -> bool {
        target.iter().zip(current.iter()).all(|(t, c)| (t - c).abs() < 1e-9)
    }

    /// Queues a rapid move directly to a machine-coordinate `target`,
    /// skipping unit/offset resolution (the target is already resolved).
    /// Used by `goto_g28`/`goto_g30`'s two legs. A zero-length leg is a
    /// silent no-op rather than an error, since a stored reference point
    /// may legitimately coincide with the current or intermediate position.
    fn queue_rapid_to(&mut self, cfg: &MachineConfig, queue: &mut Queue, target: [f32; AXES]) -> Result<(), CommandError> {
        if Self::zero_length(&target, &self.position) {
            return Ok(());
        }
        self.check_soft_limits(cfg, &target)?;
        self.sync_work_offsets(queue);
        if !queue.push(Tag::LineNumber, Payload::Int(self.line_number as i32), self.line_number) {
            return Err(CommandError::QueueFull);
        }
        queue.push(Tag::Target, Payload::Vector(target), self.line_number);
        self.position = target;
        Ok(())
    }

    /// `rapid`/`feed` (spec §4.1 "Feed move"). `inverse_time` requires a
    /// non-zero feed rate in the same block.
    pub fn feed(
        &mut self,
        cfg: &MachineConfig,
        queue: &mut Queue,
        values: &[f32; AXES],
        flags: &AxisFlags,
        is_rapid: bool,
    ) -> Result<(), CommandError> {
        if !is_rapid && self.feed_mode == FeedMode::InverseTime && self.feed_rate <= 0. {
            return Err(CommandError::FeedRateMissing);
        }

        let target = self.resolve_target(cfg, values, flags)?;
        if Self::zero_length(&target, &self.position) {
            return Err(CommandError::ZeroLengthMove);
        }
        self.check_soft_limits(cfg, &target)?;

        self.sync_work_offsets(queue);

        if !queue.push(Tag::LineNumber, Payload::Int(self.line_number as i32), self.line_number) {
            return Err(CommandError::QueueFull);
        }
        let effective_feed = self.feed_rate * if self.overrides_enabled { self.feed_override } else { 1. };
        if !is_rapid {
            queue.push(Tag::Velocity, Payload::Float(effective_feed), self.line_number);
        }
        queue.push(Tag::Target, Payload::Vector(target), self.line_number);

        self.position = target;
        Ok(())
    }

    /// `arc` (spec §4.1, §4.2). Computes center/radius, checks consistency,
    /// and hands off to `ArcState::start`; the caller drives `arc_callback`
    /// from the foreground loop thereafter.
    #[allow(clippy::too_many_arguments)]
    pub fn arc(
        &mut self,
        cfg: &MachineConfig,
        arc_state: &mut crate::arc::ArcState,
        values: &[f32; AXES],
        flags: &AxisFlags,
        offsets_ij: (f32, f32),
        radius: Option<f32>,
        rotations: u32,
        clockwise: bool,
    ) -> Result<(), CommandError> {
        let axes = PlaneAxes::for_plane(self.plane);
        let target = self.resolve_target(cfg, values, flags)?;
        self.check_soft_limits(cfg, &target)?;

        let start_first = self.position[axes.first];
        let start_second = self.position[axes.second];
        let end_first = target[axes.first];
        let end_second = target[axes.second];

        let full_circle = !flags[axes.first] && !flags[axes.second];
        let rotation = if clockwise { Rotation::Cw } else { Rotation::Ccw };

        let center = match radius {
            Some(r) => {
                let disp = (end_first - start_first, end_second - start_second);
                arc::radius_to_center(disp, r, rotation)?
            }
            None => {
                if offsets_ij.0 == 0. && offsets_ij.1 == 0. {
                    return Err(CommandError::ArcAxisMissingForPlane);
                }
                (start_first + offsets_ij.0, start_second + offsets_ij.1)
            }
        };

        let start_radius = crate::util::hypot(start_first - center.0, start_second - center.1);
        if start_radius < arc::MIN_ARC_RADIUS {
            return Err(CommandError::ArcAxisMissingForPlane);
        }
        if radius.is_none() {
            let end_radius = crate::util::hypot(end_first - center.0, end_second - center.1);
            arc::check_radius_consistency(start_radius, end_radius)?;
        }

        let start_to_center = (center.0 - start_first, center.1 - start_second);
        let center_to_end = (end_first - center.0, end_second - center.1);
        let travel = arc::angular_travel(
            start_to_center,
            center_to_end,
            rotation,
            axes.g18_correction,
            full_circle,
            rotations,
        );

        arc_state.start(
            cfg,
            axes,
            start_first,
            start_second,
            center,
            self.position[axes.linear],
            target[axes.linear],
            0.,
            travel,
            self.feed_rate,
            self.feed_mode,
            self.line_number,
            self.path_mode == PathMode::ExactStop,
        );

        self.motion_mode = if clockwise { MotionMode::CwArc } else { MotionMode::CcwArc };
        self.position = target;
        Ok(())
    }

    // --- Modal setters (spec §6 "Command pipeline to the machining layer")
    // ---
    // The parser calls these directly per completed G-code word; none of
    // them touch the queue themselves (a subsequent `feed`/`arc`/`dwell`
    // call picks up the new modal state), matching how `offsets`/`plane`/
    // `units` are read, not pushed, by `resolve_target`/`arc`.

    pub fn set_plane(&mut self, plane: Plane) {
        self.plane = plane;
    }

    pub fn set_units(&mut self, units: Units) {
        self.units = units;
    }

    pub fn set_distance_mode(&mut self, mode: DistanceMode) {
        self.distance_mode = mode;
    }

    pub fn set_arc_distance_mode(&mut self, incremental: bool) {
        self.arc_distance_incremental = incremental;
    }

    pub fn set_feed_mode(&mut self, mode: FeedMode) {
        self.feed_mode = mode;
    }

    pub fn set_path_mode(&mut self, mode: PathMode) {
        self.path_mode = mode;
    }

    /// Selects the active coordinate system (G54..G59); `index` is
    /// 0-based and clamped into `0..COORDS`.
    pub fn set_coord_system(&mut self, index: usize) {
        self.coord_system = index.min(COORDS - 1);
    }

    pub fn set_feed_override(&mut self, value: f32) {
        self.feed_override = value.max(0.);
    }

    pub fn set_spindle_override(&mut self, value: f32) {
        self.spindle_override = value.max(0.);
    }

    pub fn set_overrides_enabled(&mut self, enabled: bool) {
        self.overrides_enabled = enabled;
    }

    /// G10 L2/L20-style work-offset table update for one coordinate
    /// system. Takes effect for moves queued after this call via
    /// `sync_work_offsets`'s usual `UPDATE_WORK_OFFSETS` mechanism (I8).
    pub fn set_work_offset(
        &mut self,
        cfg: &MachineConfig,
        coord_system: usize,
        values: &[f32; AXES],
        flags: &AxisFlags,
    ) {
        let coord_system = coord_system.min(COORDS - 1);
        for i in 0..AXES {
            if !flags[i] {
                continue;
            }
            let axis = cfg.axis(i);
            self.offsets[coord_system][i] = if axis.is_rotary {
                values[i]
            } else {
                to_mm(values[i], self.units)
            };
        }
    }

    /// `G92`: sets the origin offset so the current machine position reads
    /// as `values` on each flagged axis in the active coordinate system
    /// (spec §4.1 "Active coord offset"), and enables the origin offset.
    pub fn set_origin_offset(&mut self, cfg: &MachineConfig, values: &[f32; AXES], flags: &AxisFlags) {
        for i in 0..AXES {
            if !flags[i] {
                continue;
            }
            let axis = cfg.axis(i);
            let desired = if axis.radius != 0. {
                to_mm(values[i], self.units) * 360. / (2. * core::f32::consts::PI * axis.radius)
            } else if axis.is_rotary {
                values[i]
            } else {
                to_mm(values[i], self.units)
            };
            self.origin_offset[i] = self.position[i] - self.offsets[self.coord_system][i] - desired;
        }
        self.origin_enable = true;
    }

    /// `G92.1`/`G92.2`: clears the origin offset (G92.1 additionally zeroes
    /// it; G92.2 only disables it, preserving the stored values for a
    /// later G92.3). `zero` selects which.
    pub fn reset_origin_offset(&mut self, zero: bool) {
        self.origin_enable = false;
        if zero {
            self.origin_offset = [0.; AXES];
        }
    }

    /// `G92.3`: re-enables the previously stored (and not zeroed) origin
    /// offset.
    pub fn restore_origin_offset(&mut self) {
        self.origin_enable = true;
    }

    pub fn dwell(&mut self, queue: &mut Queue, seconds: f32) -> Result<(), CommandError> {
        if !queue.push(Tag::Dwell, Payload::Float(seconds), self.line_number) {
            return Err(CommandError::QueueFull);
        }
        Ok(())
    }

    /// `seek`/`probe` (spec §4.1 "Seek (G38 / probe)"). Exactly one axis
    /// must move.
    pub fn seek(
        &mut self,
        cfg: &MachineConfig,
        queue: &mut Queue,
        values: &[f32; AXES],
        flags: &AxisFlags,
        switch_id: u8,
        switch_enabled: bool,
        open_mode: bool,
        error_if_not_found: bool,
    ) -> Result<(), CommandError> {
        let moving = flags.iter().filter(|f| **f).count();
        if moving == 0 {
            return Err(CommandError::SeekNoAxis);
        }
        if moving > 1 {
            return Err(CommandError::SeekMultipleAxes);
        }
        if !switch_enabled {
            return Err(CommandError::SeekSwitchDisabled);
        }

        let target = self.resolve_target(cfg, values, flags)?;
        if Self::zero_length(&target, &self.position) {
            return Err(CommandError::ZeroLengthMove);
        }
        self.check_soft_limits(cfg, &target)?;

        // SEEK_OPEN modes invert the expected edge (spec §4.1).
        let expect_active = !open_mode;

        self.sync_work_offsets(queue);
        if !queue.push(Tag::LineNumber, Payload::Int(self.line_number as i32), self.line_number) {
            return Err(CommandError::QueueFull);
        }
        let effective_feed = self.feed_rate * if self.overrides_enabled { self.feed_override } else { 1. };
        queue.push(Tag::Velocity, Payload::Float(effective_feed), self.line_number);
        queue.push(
            Tag::Seek,
            Payload::Seek(SeekDescriptor {
                switch_id,
                expect_active,
                error_if_not_found,
            }),
            self.line_number,
        );
        queue.push(Tag::Target, Payload::Vector(target), self.line_number);

        self.position = target;
        Ok(())
    }

    /// `probe` (G38.2-G38.5, spec §6 "probe(target, flags, mode)"): a thin
    /// entry point over `seek` fixed to the probe switch
    /// (`switches::PROBE_SWITCH`), matching how the same G38 family maps
    /// onto one mechanism distinguished only by which switch and edge
    /// direction is expected.
    pub fn probe(
        &mut self,
        cfg: &MachineConfig,
        queue: &mut Queue,
        values: &[f32; AXES],
        flags: &AxisFlags,
        switch_enabled: bool,
        open_mode: bool,
        error_if_not_found: bool,
    ) -> Result<(), CommandError> {
        self.seek(
            cfg,
            queue,
            values,
            flags,
            crate::switches::PROBE_SWITCH as u8,
            switch_enabled,
            open_mode,
            error_if_not_found,
        )
    }

    /// `set_home`/`clear_home` (spec §11, from `machine.c`). Applied
    /// immediately to machine position and also queued so the executor's
    /// internal tracking stays in sync without racing in-flight segments.
    pub fn set_home(&mut self, queue: &mut Queue, origin: &[f32; AXES], flags: &AxisFlags) {
        for i in 0..AXES {
            if flags[i] {
                self.position[i] = origin[i];
            }
        }
        queue.push(Tag::SetHome, Payload::Vector(self.position), self.line_number);
    }

    /// Clears the homed flag for flagged axes (spec §6, §11 "Homing"):
    /// soft limits (I7) stop applying to an axis the moment it's cleared,
    /// since its machine-coordinate reference is no longer trustworthy.
    pub fn clear_home(&mut self, cfg: &mut MachineConfig, flags: &AxisFlags) {
        for i in 0..AXES {
            if flags[i] {
                cfg.axes[i].homed = false;
            }
        }
    }

    /// `set_g28_position`/`set_g30_position` (spec §6): records the current
    /// machine position as the stored reference point.
    pub fn set_g28_position(&mut self) {
        self.g28_position = self.position;
    }

    pub fn set_g30_position(&mut self) {
        self.g30_position = self.position;
    }

    /// `goto_g28`/`goto_g30` (spec §4.1 "G28/G30"): moves first through the
    /// supplied intermediate point (if any flags are set) in absolute
    /// coordinates, then rapids to the stored reference vector.
    fn goto_stored(
        &mut self,
        cfg: &MachineConfig,
        queue: &mut Queue,
        values: &[f32; AXES],
        flags: &AxisFlags,
        stored: [f32; AXES],
    ) -> Result<(), CommandError> {
        if flags.iter().any(|f| *f) {
            let intermediate = self.resolve_target(cfg, values, flags)?;
            self.queue_rapid_to(cfg, queue, intermediate)?;
        }
        self.queue_rapid_to(cfg, queue, stored)
    }

    pub fn goto_g28(
        &mut self,
        cfg: &MachineConfig,
        queue: &mut Queue,
        values: &[f32; AXES],
        flags: &AxisFlags,
    ) -> Result<(), CommandError> {
        self.goto_stored(cfg, queue, values, flags, self.g28_position)
    }

    pub fn goto_g30(
        &mut self,
        cfg: &MachineConfig,
        queue: &mut Queue,
        values: &[f32; AXES],
        flags: &AxisFlags,
    ) -> Result<(), CommandError> {
        self.goto_stored(cfg, queue, values, flags, self.g30_position)
    }

    /// `change_tool` (M6, spec §4.1). Queues the tool swap itself followed
    /// by a hold request, so the executor drains up to this point and then
    /// suspends the cycle for the operator before the next block runs.
    pub fn change_tool(&mut self, queue: &mut Queue, tool: u8) -> Result<(), CommandError> {
        self.tool = tool;
        if !queue.push(Tag::ToolChange, Payload::Int(tool as i32), self.line_number) {
            return Err(CommandError::QueueFull);
        }
        self.request_hold(queue, HoldReason::ToolChange)
    }

    /// Queues a `Tag::Pause` carrying `reason` (spec §6 external
    /// interfaces): takes effect only once the executor reaches this exact
    /// queue position, not immediately on call.
    fn request_hold(&mut self, queue: &mut Queue, reason: HoldReason) -> Result<(), CommandError> {
        if !queue.push(Tag::Pause, Payload::Int(u8::from(reason) as i32), self.line_number) {
            return Err(CommandError::QueueFull);
        }
        Ok(())
    }

    /// `program_stop` (M0, spec §6): unconditional pause at this point in
    /// the program, resumed only by an explicit operator start request.
    pub fn program_stop(&mut self, queue: &mut Queue) -> Result<(), CommandError> {
        self.request_hold(queue, HoldReason::ProgramPause)
    }

    /// `optional_program_stop` (M1, spec §6): pauses only if the operator
    /// has the optional-stop switch enabled; otherwise a no-op, matching
    /// the "ignored unless enabled" semantics of the other stop family.
    pub fn optional_program_stop(&mut self, queue: &mut Queue, optional_stop_enabled: bool) -> Result<(), CommandError> {
        if !optional_stop_enabled {
            return Ok(());
        }
        self.request_hold(queue, HoldReason::ProgramPause)
    }

    /// `pallet_change_stop` (M60, spec §6): like `program_stop` but tagged
    /// with its own hold reason so the host can distinguish the two in a
    /// status report.
    pub fn pallet_change_stop(&mut self, queue: &mut Queue) -> Result<(), CommandError> {
        self.request_hold(queue, HoldReason::PalletChange)
    }

    pub fn set_spindle(&mut self, queue: &mut Queue, mode: SpindleMode, speed: f32) {
        self.spindle_mode = mode;
        self.spindle_speed = speed;
        queue.push(Tag::SpindleMode, Payload::Int(u8::from(mode) as i32), self.line_number);
        queue.push(Tag::SpindleSpeed, Payload::Float(speed), self.line_number);
    }

    /// Sets a numbered output pin (spec §11 "Output pins", from
    /// `outputs.c`), dispatched by the executor at the exact queue
    /// position like spindle/coolant.
    pub fn set_output(&mut self, queue: &mut Queue, index: u8, level: bool) -> Result<(), CommandError> {
        if !queue.push(Tag::Output, Payload::Output { index, level }, self.line_number) {
            return Err(CommandError::QueueFull);
        }
        Ok(())
    }

    pub fn set_coolant(&mut self, queue: &mut Queue, on: bool) {
        self.coolant_on = on;
        queue.push(Tag::CoolantSet, Payload::Bool(on), self.line_number);
    }

    /// `program_end` (M2/M30, spec §4.1). Resets modal state to defaults.
    pub fn program_end(&mut self, queue: &mut Queue) {
        self.origin_offset = [0.; AXES];
        self.origin_enable = false;
        self.coord_system = 0;
        self.plane = Plane::Xy;
        self.distance_mode = DistanceMode::Absolute;
        self.arc_distance_incremental = true;
        self.feed_mode = FeedMode::UnitsPerMinute;
        self.motion_mode = MotionMode::Cancel;
        self.set_spindle(queue, SpindleMode::Off, 0.);
        self.set_coolant(queue, false);
    }
}
