//! Arc generator (spec §4.2): decomposes a circular/helical motion into
//! short line segments, enqueued incrementally as queue room allows.

use num_traits::float::Float;

use crate::config::MachineConfig;
use crate::error::CommandError;
use crate::gcode_state::{FeedMode, Plane};
use crate::planner::{Payload, Queue, Tag};
use crate::util::hypot;

pub const ARC_SEGMENT_LENGTH: f32 = 0.1; // mm
pub const MIN_ARC_RADIUS: f32 = 0.1; // mm
pub const MIN_ARC_SEGMENT_USEC: f32 = 10_000.;
pub const CHORDAL_TOLERANCE: f32 = 0.002; // mm, small chord tolerance
pub const ARC_RADIUS_ERROR_MAX: f32 = 0.5; // mm
pub const ARC_RADIUS_ERROR_MIN: f32 = 0.005; // mm
pub const ARC_RADIUS_ERROR_TOLERANCE: f32 = 0.001; // fraction of radius

/// The two in-plane axis indices and the one linear (helical) axis index,
/// selected by the active plane (spec §4.2 "Geometry").
#[derive(Clone, Copy, Debug)]
pub struct PlaneAxes {
    pub first: usize,
    pub second: usize,
    pub linear: usize,
    /// -1 for G18 (XZ), matching the sign-correction the spec calls
    /// `g18_correction`.
    pub g18_correction: f32,
}

impl PlaneAxes {
    pub fn for_plane(plane: Plane) -> Self {
        match plane {
            Plane::Xy => PlaneAxes {
                first: 0,
                second: 1,
                linear: 2,
                g18_correction: 1.,
            },
            Plane::Xz => PlaneAxes {
                first: 2,
                second: 0,
                linear: 1,
                g18_correction: -1.,
            },
            Plane::Yz => PlaneAxes {
                first: 1,
                second: 2,
                linear: 0,
                g18_correction: 1.,
            },
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum Rotation {
    Cw,
    Ccw,
}

/// Converts a radius-mode arc spec into center offsets in the plane (spec
/// §4.2 "Radius → center"). `disp` is the endpoint displacement (x,y) in
/// plane coordinates; `radius` is signed (negative selects the major arc).
pub fn radius_to_center(disp: (f32, f32), radius: f32, rotation: Rotation) -> Result<(f32, f32), CommandError> {
    let (x, y) = disp;
    if x == 0. && y == 0. {
        return Err(CommandError::ArcEndpointEqualsStart);
    }

    let r = radius.abs();
    let disc = 4. * r * r - (x * x + y * y);
    let d = hypot(x, y);

    let mut h_over_d = if disc <= 0. { 0. } else { -(disc.sqrt()) / d };

    if rotation == Rotation::Ccw {
        h_over_d = -h_over_d;
    }
    if radius < 0. {
        h_over_d = -h_over_d;
    }

    let cx = (x - y * h_over_d) / 2.;
    let cy = (y + x * h_over_d) / 2.;
    Ok((cx, cy))
}

/// Checks the end radius (computed from endpoint + center) against the
/// start radius within tolerance (spec §4.2 "Radius consistency", I2).
pub fn check_radius_consistency(start_radius: f32, end_radius: f32) -> Result<(), CommandError> {
    let tol = (ARC_RADIUS_ERROR_MIN).max((ARC_RADIUS_ERROR_MAX).min(ARC_RADIUS_ERROR_TOLERANCE * start_radius));
    if (end_radius - start_radius).abs() > tol {
        Err(CommandError::ArcRadiusOutOfTolerance)
    } else {
        Ok(())
    }
}

/// Computes signed angular travel (spec §4.2 "Angular travel"). `start_ij`
/// is (-I, -J) i.e. the vector from the start point to the center;
/// `end_ij` is (end_i, end_j), the vector from the center to the endpoint.
/// `rotations` is the G-code P parameter (P>=1 adds full turns).
pub fn angular_travel(
    start_to_center: (f32, f32),
    center_to_end: (f32, f32),
    rotation: Rotation,
    g18_correction: f32,
    full_circle: bool,
    rotations: u32,
) -> f32 {
    let theta_start = (-start_to_center.0).atan2(-start_to_center.1);
    let theta_end = center_to_end.0.atan2(center_to_end.1);

    const TAU: f32 = core::f32::consts::PI * 2.;

    if full_circle {
        let rotations = rotations.max(1); // P==0 on a full circle means 1 (open question decision)
        return match rotation {
            Rotation::Cw => -TAU * rotations as f32 * g18_correction,
            Rotation::Ccw => TAU * rotations as f32 * g18_correction,
        };
    }

    let travel = match rotation {
        Rotation::Cw => {
            let mut end = theta_end;
            if end < theta_start {
                end += TAU * g18_correction;
            }
            end - theta_start
        }
        Rotation::Ccw => {
            let mut end = theta_end;
            if end > theta_start {
                end -= TAU * g18_correction;
            }
            end - theta_start
        }
    };

    let extra_rotations = rotations.saturating_sub(1);
    let sign = match rotation {
        Rotation::Cw => -1.,
        Rotation::Ccw => 1.,
    };

    travel + sign * TAU * extra_rotations as f32 * g18_correction
}

#[derive(Clone, Copy, Debug)]
pub struct SavedMoveContext {
    pub line_number: u32,
    pub feed_rate: f32,
    pub exact_stop: bool,
}

/// Singleton arc runtime state (spec §3 "Arc state"). At most one active
/// arc; `arc_callback` is driven from the foreground loop.
pub struct ArcState {
    pub active: bool,
    pub axes: PlaneAxes,
    pub center: (f32, f32),
    pub radius: f32,
    pub theta: f32,
    pub angular_travel: f32,
    pub linear_travel: f32,
    pub linear_start: f32,
    pub segment_count: u32,
    pub segment_index: u32,
    pub angular_increment: f32,
    pub linear_increment: f32,
    pub saved: SavedMoveContext,
}

impl Default for ArcState {
    fn default() -> Self {
        Self {
            active: false,
            axes: PlaneAxes::for_plane(Plane::Xy),
            center: (0., 0.),
            radius: 0.,
            theta: 0.,
            angular_travel: 0.,
            linear_travel: 0.,
            linear_start: 0.,
            segment_count: 0,
            segment_index: 0,
            angular_increment: 0.,
            linear_increment: 0.,
            saved: SavedMoveContext {
                line_number: 0,
                feed_rate: 0.,
                exact_stop: true,
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
impl ArcState {
    /// Computes segmentation and primes the arc to begin emission (spec
    /// §4.2 "Segmentation").
    pub fn start(
        &mut self,
        cfg: &MachineConfig,
        axes: PlaneAxes,
        start_first: f32,
        start_second: f32,
        center: (f32, f32),
        linear_start: f32,
        linear_end: f32,
        theta_start: f32,
        angular_travel: f32,
        feed_rate: f32,
        feed_mode: FeedMode,
        line_number: u32,
        exact_stop: bool,
    ) {
        let radius = hypot(start_first - center.0, start_second - center.1);
        let linear_travel = linear_end - linear_start;
        let planar_travel = angular_travel.abs() * radius;
        let length = hypot(planar_travel, linear_travel);

        let arc_time = match feed_mode {
            FeedMode::InverseTime => 1. / feed_rate.max(1e-6),
            FeedMode::UnitsPerMinute => length / feed_rate.max(1e-6),
        };

        let plane_max_feed = cfg.axis(axes.first).feedrate_max_for_arc;
        let linear_max_feed = cfg.axis(axes.linear).velocity_max;

        let arc_time = arc_time
            .max(planar_travel / plane_max_feed.max(1e-6))
            .max(linear_travel.abs() / linear_max_feed.max(1e-6));

        let by_chord = if radius > 0. {
            length / (4. * CHORDAL_TOLERANCE * (2. * radius - CHORDAL_TOLERANCE)).max(1e-9).sqrt()
        } else {
            f32::MAX
        };
        let by_segment_len = length / ARC_SEGMENT_LENGTH;
        let by_time = arc_time * 60_000_000. / MIN_ARC_SEGMENT_USEC;

        let segments = by_chord.min(by_segment_len).min(by_time).floor().max(1.) as u32;

        self.active = true;
        self.axes = axes;
        self.center = center;
        self.radius = radius;
        self.theta = theta_start;
        self.angular_travel = angular_travel;
        self.linear_travel = linear_travel;
        self.linear_start = linear_start;
        self.segment_count = segments;
        self.segment_index = 0;
        self.angular_increment = angular_travel / segments as f32;
        self.linear_increment = linear_travel / segments as f32;
        self.saved = SavedMoveContext {
            line_number,
            feed_rate,
            exact_stop,
        };
    }

    /// `arc_callback`: while active and the queue has room, push the next
    /// segment. Returns `true` while the arc has more segments to emit.
    pub fn callback(&mut self, queue: &mut Queue) -> bool {
        if !self.active {
            return false;
        }

        // Each segment needs a `Velocity` slot alongside its `Target`: a bare
        // `Target` leaves the executor's `queued_velocity` at `None`, which
        // reads as a rapid move rather than the programmed feed (spec S2).
        while queue.room() >= 2 && self.segment_index < self.segment_count {
            self.segment_index += 1;
            let is_last = self.segment_index == self.segment_count;

            self.theta += self.angular_increment;
            let first = self.center.0 + self.theta.sin() * self.radius;
            let second = self.center.1 + self.theta.cos() * self.radius;
            let linear = self.linear_start + self.linear_increment * self.segment_index as f32;

            let mut target = [0.0f32; crate::config::AXES];
            target[self.axes.first] = first;
            target[self.axes.second] = second;
            target[self.axes.linear] = linear;

            queue.push(Tag::Velocity, Payload::Float(self.saved.feed_rate), self.saved.line_number);
            queue.push(Tag::Target, Payload::Vector(target), self.saved.line_number);

            if is_last {
                self.active = false;
                return false;
            }
        }

        self.active
    }

    /// Discards remaining segments without touching already-queued ones
    /// (spec §4.2 "Abort").
    pub fn abort(&mut self) {
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radius_to_center_quarter_circle() {
        // Start (10,0), end (0,10), CCW, R=10: center should be at origin.
        let disp = (-10., 10.);
        let (cx, cy) = radius_to_center(disp, 10., Rotation::Ccw).unwrap();
        assert!(cx.abs() < 1e-3);
        assert!(cy.abs() < 1e-3);
    }

    #[test]
    fn radius_to_center_rejects_start_equals_end() {
        assert!(radius_to_center((0., 0.), 10., Rotation::Cw).is_err());
    }

    #[test]
    fn full_circle_cw_travel_is_negative_tau() {
        let t = angular_travel((10., 0.), (10., 0.), Rotation::Cw, 1., true, 1);
        assert!((t + core::f32::consts::PI * 2.).abs() < 1e-4);
    }

    #[test]
    fn full_circle_p_zero_treated_as_one_rotation() {
        let t = angular_travel((10., 0.), (10., 0.), Rotation::Cw, 1., true, 0);
        assert!((t + core::f32::consts::PI * 2.).abs() < 1e-4);
    }

    #[test]
    fn cw_quarter_arc_travel_is_in_range() {
        // P3: CW arc travel should land in (0, 2pi].
        let t = angular_travel((10., 0.), (0., -10.), Rotation::Cw, 1., false, 1);
        assert!(t > 0. && t <= core::f32::consts::PI * 2. + 1e-4);
    }

    #[test]
    fn radius_consistency_accepts_matching_radius() {
        assert!(check_radius_consistency(10., 10.0001).is_ok());
    }

    #[test]
    fn radius_consistency_rejects_large_drift() {
        assert!(check_radius_consistency(10., 11.).is_err());
    }
}
