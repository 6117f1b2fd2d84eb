// THEORY:
// The `stage_protocol` module is the pure translation layer between world-space
// motion and the controller's ASCII wire dialect. It performs no I/O at all, which
// keeps every byte the rig will ever send reproducible in a unit test.
//
// Key principles:
// 1.  **Units Boundary**: Callers think in real-world units. The controller thinks
//     in integer steps. `AxisScale` is the only bridge, and conversion truncates
//     toward zero, so a tiny displacement can legitimately vanish into a no-op.
// 2.  **Magnitude + Direction**: A move command never carries signed deltas. It
//     carries non-negative magnitudes per axis plus a single direction letter
//     (`P` increase, `D` decrease) applied to all of them.
// 3.  **Sparse Layout**: Axes whose unit value is zero are omitted. The velocity
//     block and the displacement block use the same comma layout: one slot per
//     axis, empty for absent axes, trailing empty slots dropped. That rule yields
//     the seven distinct layouts; the all-zero case is the bare `0` sentinel.
// 4.  **Mixed Signs**: A request whose axes disagree in sign cannot be expressed
//     with one direction letter, so `plan_moves` splits it into a positive group
//     followed by a negative group.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::DecodeError;

/// Queries the controller for its current per-axis position.
pub const POLL_COMMAND: &str = "/1?aA\r\n";
/// Sent in place of a move whose every axis scales to zero units.
pub const NO_OP_COMMAND: &str = "0";
/// Marks the start of the position triple in a controller reply.
pub const POSITION_DELIMITER: char = '`';

const MOVE_PREFIX: &str = "/1V";
const MOVE_SUFFIX: &str = "R\r\n";

/// A triple of real numbers, one per stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Axes {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Axes {
    pub const ZERO: Axes = Axes { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The same velocity on every axis.
    pub fn splat(v: f64) -> Self {
        Self { x: v, y: v, z: v }
    }

    pub fn only_x(x: f64) -> Self {
        Self { x, ..Self::ZERO }
    }

    pub fn only_y(y: f64) -> Self {
        Self { y, ..Self::ZERO }
    }

    pub fn only_z(z: f64) -> Self {
        Self { z, ..Self::ZERO }
    }

    fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    fn from_array(a: [f64; 3]) -> Self {
        Self { x: a[0], y: a[1], z: a[2] }
    }
}

/// Stage position in real-world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Displacement that would carry the stage from `self` to `target`.
    pub fn delta_to(&self, target: &Position) -> Axes {
        Axes::new(target.x - self.x, target.y - self.y, target.z - self.z)
    }
}

/// Controller units per real-world unit, per axis. Fixed for the life of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisScale {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for AxisScale {
    fn default() -> Self {
        Self {
            x: 88.0 / 1000.0,
            y: 88.0 / 1000.0,
            z: 1260.0 / 1000.0,
        }
    }
}

impl AxisScale {
    /// Real-world values to controller units, truncated toward zero.
    pub fn to_units(&self, values: Axes) -> [i64; 3] {
        [
            (values.x * self.x) as i64,
            (values.y * self.y) as i64,
            (values.z * self.z) as i64,
        ]
    }

    pub fn to_position(&self, units: [i64; 3]) -> Position {
        Position {
            x: units[0] as f64 / self.x,
            y: units[1] as f64 / self.y,
            z: units[2] as f64 / self.z,
        }
    }
}

/// One queued relative move: displacement and per-axis velocity, real-world units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub displacement: Axes,
    pub velocity: Axes,
}

impl MoveRequest {
    pub fn new(displacement: Axes, velocity: Axes) -> Self {
        Self {
            displacement,
            velocity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    pub fn wire_char(self) -> char {
        match self {
            Direction::Increase => 'P',
            Direction::Decrease => 'D',
        }
    }

    fn from_wire_char(c: char) -> Option<Self> {
        match c {
            'P' => Some(Direction::Increase),
            'D' => Some(Direction::Decrease),
            _ => None,
        }
    }

    pub fn sign(self) -> i64 {
        match self {
            Direction::Increase => 1,
            Direction::Decrease => -1,
        }
    }
}

/// A move already reduced to controller units, together with its wire line.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMove {
    pub direction: Direction,
    /// Unsigned step counts; the direction applies to all three.
    pub displacement_units: [i64; 3],
    pub velocity_units: [i64; 3],
    pub line: String,
}

impl EncodedMove {
    pub fn is_no_op(&self) -> bool {
        self.displacement_units.iter().all(|&u| u == 0)
    }

    /// How long to let the stage travel before polling it.
    ///
    /// Each axis needs `|units| / (velocity - 1)` seconds; the slowest axis wins
    /// and `margin` is added on top. Axes whose velocity is one unit or less do not
    /// contribute, so a mis-set velocity produces no wait rather than an infinite one.
    /// A no-op move waits for nothing, margin included.
    pub fn settle_time(&self, margin: Duration) -> Duration {
        if self.is_no_op() {
            return Duration::ZERO;
        }
        let longest = self
            .displacement_units
            .iter()
            .zip(self.velocity_units.iter())
            .filter(|(_, v)| **v > 1)
            .map(|(u, v)| (*u as f64 / (*v - 1) as f64).abs())
            .fold(0.0_f64, f64::max);
        Duration::from_secs_f64(longest) + margin
    }
}

/// Encodes a single-direction move. `magnitudes` must be non-negative.
pub fn encode(
    magnitudes: Axes,
    velocity: Axes,
    direction: Direction,
    scale: &AxisScale,
) -> EncodedMove {
    let displacement_units = scale.to_units(magnitudes);
    let velocity_units = scale.to_units(velocity);

    let line = if displacement_units.iter().all(|&u| u == 0) {
        NO_OP_COMMAND.to_string()
    } else {
        let present = displacement_units.map(|u| u != 0);
        format!(
            "{MOVE_PREFIX}{}{}{}{MOVE_SUFFIX}",
            axis_fields(&velocity_units, &present),
            direction.wire_char(),
            axis_fields(&displacement_units, &present),
        )
    };

    EncodedMove {
        direction,
        displacement_units,
        velocity_units,
        line,
    }
}

/// One slot per axis, blank when the axis is absent, trailing blanks dropped.
fn axis_fields(values: &[i64; 3], present: &[bool; 3]) -> String {
    let last = present.iter().rposition(|&p| p).unwrap_or(0);
    (0..=last)
        .map(|i| {
            if present[i] {
                values[i].to_string()
            } else {
                String::new()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Turns a signed request into the wire moves that execute it, in order.
///
/// Same-sign requests (zeros count as either sign) become one move. Mixed-sign
/// requests become the positive axes with `P` followed by the negative axes with
/// `D`. Groups that scale to zero units are dropped; if nothing survives, a
/// single no-op is returned so the worker still polls.
pub fn plan_moves(request: &MoveRequest, scale: &AxisScale) -> Vec<EncodedMove> {
    let d = request.displacement.to_array();
    let has_positive = d.iter().any(|&v| v > 0.0);
    let has_negative = d.iter().any(|&v| v < 0.0);

    if !(has_positive && has_negative) {
        let direction = if has_negative {
            Direction::Decrease
        } else {
            Direction::Increase
        };
        let magnitudes = Axes::from_array(d.map(f64::abs));
        return vec![encode(magnitudes, request.velocity, direction, scale)];
    }

    let positive = Axes::from_array(d.map(|v| if v > 0.0 { v } else { 0.0 }));
    let negative = Axes::from_array(d.map(|v| if v < 0.0 { -v } else { 0.0 }));
    let moves: Vec<EncodedMove> = [
        encode(positive, request.velocity, Direction::Increase, scale),
        encode(negative, request.velocity, Direction::Decrease, scale),
    ]
    .into_iter()
    .filter(|m| !m.is_no_op())
    .collect();

    if moves.is_empty() {
        vec![encode(Axes::ZERO, request.velocity, Direction::Increase, scale)]
    } else {
        moves
    }
}

/// Parses the leading integer of `token` the way a lenient C parser would:
/// optional minus, then at least one digit, stopping at the first non-digit.
fn leading_int(token: &str) -> Option<i64> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude: i64 = digits[..end].parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

/// Extracts the raw unit triple from a poll reply.
pub fn decode_units(response: &str) -> Result<[i64; 3], DecodeError> {
    let (_, tail) = response
        .split_once(POSITION_DELIMITER)
        .ok_or(DecodeError::MissingDelimiter)?;

    let mut values = Vec::with_capacity(3);
    for token in tail.split(',') {
        if values.len() == 3 {
            break;
        }
        let cleaned: String = token
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '-')
            .collect();
        if cleaned.is_empty() {
            continue;
        }
        match leading_int(&cleaned) {
            Some(v) => values.push(v),
            None => break,
        }
    }

    match values[..] {
        [x, y, z] => Ok([x, y, z]),
        _ => Err(DecodeError::TooFewValues {
            found: values.len(),
        }),
    }
}

/// Decodes a poll reply into a real-world position.
pub fn decode_position(response: &str, scale: &AxisScale) -> Result<Position, DecodeError> {
    decode_units(response).map(|units| scale.to_position(units))
}

/// The reply a controller gives to `POLL_COMMAND` when it sits at `units`.
pub fn format_position_reply(units: [i64; 3]) -> String {
    format!(
        "/0{POSITION_DELIMITER}{},{},{}\r\n",
        units[0], units[1], units[2]
    )
}

/// A move command as read back off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedMove {
    pub direction: Direction,
    pub displacement_units: [i64; 3],
    pub velocity_units: [i64; 3],
}

/// Inverse of `encode`. Returns `Ok(None)` for the no-op sentinel.
pub fn parse_move_command(line: &str) -> Result<Option<ParsedMove>, DecodeError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed == NO_OP_COMMAND {
        return Ok(None);
    }
    let bad = || DecodeError::BadCommand(trimmed.to_string());

    let body = trimmed
        .strip_prefix(MOVE_PREFIX)
        .and_then(|rest| rest.strip_suffix('R'))
        .ok_or_else(bad)?;
    let split_at = body.find(['P', 'D']).ok_or_else(bad)?;
    let direction = body[split_at..]
        .chars()
        .next()
        .and_then(Direction::from_wire_char)
        .ok_or_else(bad)?;

    let parse_fields = |s: &str| -> Result<[i64; 3], DecodeError> {
        let mut out = [0i64; 3];
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() > 3 {
            return Err(bad());
        }
        for (slot, field) in out.iter_mut().zip(fields) {
            if !field.is_empty() {
                *slot = field.parse().map_err(|_| bad())?;
            }
        }
        Ok(out)
    };

    Ok(Some(ParsedMove {
        direction,
        velocity_units: parse_fields(&body[..split_at])?,
        displacement_units: parse_fields(&body[split_at + 1..])?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_scale() -> AxisScale {
        AxisScale {
            x: 1.0,
            y: 1.0,
            z: 1.0,
        }
    }

    fn line(dx: f64, dy: f64, dz: f64) -> String {
        encode(
            Axes::new(dx, dy, dz),
            Axes::new(7.0, 8.0, 9.0),
            Direction::Increase,
            &unit_scale(),
        )
        .line
    }

    #[test]
    fn every_axis_subset_has_its_own_layout() {
        assert_eq!(line(0.0, 0.0, 0.0), "0");
        assert_eq!(line(1.0, 0.0, 0.0), "/1V7P1R\r\n");
        assert_eq!(line(0.0, 2.0, 0.0), "/1V,8P,2R\r\n");
        assert_eq!(line(0.0, 0.0, 3.0), "/1V,,9P,,3R\r\n");
        assert_eq!(line(1.0, 2.0, 0.0), "/1V7,8P1,2R\r\n");
        assert_eq!(line(1.0, 0.0, 3.0), "/1V7,,9P1,,3R\r\n");
        assert_eq!(line(0.0, 2.0, 3.0), "/1V,8,9P,2,3R\r\n");
        assert_eq!(line(1.0, 2.0, 3.0), "/1V7,8,9P1,2,3R\r\n");
    }

    #[test]
    fn decrease_direction_uses_d() {
        let m = encode(
            Axes::only_x(1000.0),
            Axes::splat(10000.0),
            Direction::Decrease,
            &AxisScale::default(),
        );
        assert_eq!(m.line, "/1V880D88R\r\n");
    }

    #[test]
    fn small_displacement_truncates_to_no_op() {
        // 5 * 0.088 = 0.44 truncates to zero units.
        let m = encode(
            Axes::only_x(5.0),
            Axes::splat(10000.0),
            Direction::Increase,
            &AxisScale::default(),
        );
        assert_eq!(m.displacement_units, [0, 0, 0]);
        assert_eq!(m.line, NO_OP_COMMAND);
        assert!(m.is_no_op());
    }

    #[test]
    fn same_sign_request_is_one_move() {
        let req = MoveRequest::new(Axes::new(-10.0, -20.0, 0.0), Axes::splat(100.0));
        let moves = plan_moves(&req, &unit_scale());
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].direction, Direction::Decrease);
        assert_eq!(moves[0].line, "/1V100,100D10,20R\r\n");
    }

    #[test]
    fn mixed_sign_request_is_split_positive_first() {
        let req = MoveRequest::new(Axes::new(10.0, -20.0, 5.0), Axes::splat(100.0));
        let moves = plan_moves(&req, &unit_scale());
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].line, "/1V100,,100P10,,5R\r\n");
        assert_eq!(moves[1].line, "/1V,100D,20R\r\n");
    }

    #[test]
    fn mixed_sign_group_that_vanishes_is_dropped() {
        let req = MoveRequest::new(Axes::new(1000.0, -5.0, 0.0), Axes::splat(10000.0));
        let moves = plan_moves(&req, &AxisScale::default());
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].direction, Direction::Increase);
    }

    #[test]
    fn all_zero_request_still_plans_a_no_op() {
        let req = MoveRequest::new(Axes::ZERO, Axes::splat(10000.0));
        let moves = plan_moves(&req, &AxisScale::default());
        assert_eq!(moves.len(), 1);
        assert!(moves[0].is_no_op());
    }

    #[test]
    fn settle_time_takes_slowest_axis_plus_margin() {
        let m = encode(
            Axes::new(100.0, 10.0, 0.0),
            Axes::new(51.0, 11.0, 0.0),
            Direction::Increase,
            &unit_scale(),
        );
        // x: 100/50 = 2s, y: 10/10 = 1s.
        let t = m.settle_time(Duration::from_millis(500));
        assert_relative_eq!(t.as_secs_f64(), 2.5, epsilon = 1e-9);
    }

    #[test]
    fn unit_velocity_contributes_no_wait() {
        let m = encode(
            Axes::only_x(100.0),
            Axes::splat(1.0),
            Direction::Increase,
            &unit_scale(),
        );
        assert_eq!(m.settle_time(Duration::from_millis(500)), Duration::from_millis(500));
        assert_eq!(
            encode(Axes::ZERO, Axes::splat(1.0), Direction::Increase, &unit_scale())
                .settle_time(Duration::from_millis(500)),
            Duration::ZERO
        );
    }

    #[test]
    fn decode_reads_three_values_after_delimiter() {
        let scale = AxisScale::default();
        let p = decode_position("/0`4400,-880,1260\x03\r\n", &scale).unwrap();
        assert_relative_eq!(p.x, 50000.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, -10000.0, epsilon = 1e-6);
        assert_relative_eq!(p.z, 1000.0, epsilon = 1e-6);
    }

    #[test]
    fn decode_round_trips_a_formatted_reply() {
        let scale = AxisScale::default();
        let units = [-123, 0, 98765];
        let reply = format_position_reply(units);
        assert_eq!(decode_units(&reply).unwrap(), units);
        let p = decode_position(&reply, &scale).unwrap();
        assert_relative_eq!(p.x, -123.0 / scale.x, epsilon = 1e-9);
        assert_relative_eq!(p.y, 0.0);
        assert_relative_eq!(p.z, 98765.0 / scale.z, epsilon = 1e-9);
    }

    #[test]
    fn decode_failures() {
        assert_eq!(
            decode_units("1,2,3\r\n"),
            Err(DecodeError::MissingDelimiter)
        );
        assert_eq!(
            decode_units("/0`1,2\r\n"),
            Err(DecodeError::TooFewValues { found: 2 })
        );
        assert_eq!(decode_units(""), Err(DecodeError::MissingDelimiter));
    }

    #[test]
    fn decode_skips_empty_tokens_and_stops_on_garbage() {
        assert_eq!(decode_units("`a,1,,2,3").unwrap(), [1, 2, 3]);
        assert_eq!(
            decode_units("`1,-,2,3"),
            Err(DecodeError::TooFewValues { found: 1 })
        );
    }

    #[test]
    fn parse_inverts_encode() {
        let m = encode(
            Axes::new(1.0, 0.0, 3.0),
            Axes::new(7.0, 8.0, 9.0),
            Direction::Decrease,
            &unit_scale(),
        );
        let parsed = parse_move_command(&m.line).unwrap().unwrap();
        assert_eq!(parsed.direction, Direction::Decrease);
        assert_eq!(parsed.displacement_units, [1, 0, 3]);
        assert_eq!(parsed.velocity_units, [7, 0, 9]);
        assert_eq!(parse_move_command("0").unwrap(), None);
        assert!(parse_move_command("/1?aA\r\n").is_err());
    }
}
