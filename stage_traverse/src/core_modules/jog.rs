// Manual jogging, the operator's fine-tuning controls while a traversal is paused.

use crate::core_modules::stage_protocol::Axes;

const COARSE_FACTOR: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogSpeed {
    /// One step.
    Fine,
    /// Ten steps.
    Coarse,
}

impl JogSpeed {
    fn factor(self) -> f64 {
        match self {
            JogSpeed::Fine => 1.0,
            JogSpeed::Coarse => COARSE_FACTOR,
        }
    }
}

/// Screen-oriented jog directions. "Up" on screen is decreasing stage Y.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jog {
    Left,
    Right,
    Up,
    Down,
    ZUp,
    ZDown,
    UpLeft,
    UpRight,
    DownRight,
    DownLeft,
}

impl Jog {
    /// The queued displacements for this jog, in order.
    ///
    /// `UpLeft` and `DownRight` move both axes in one request because both
    /// components share a sign. `UpRight` and `DownLeft` are issued as an X move
    /// followed by a Y move.
    pub fn displacements(self, step: f64, speed: JogSpeed) -> Vec<Axes> {
        let s = step * speed.factor();
        match self {
            Jog::Left => vec![Axes::only_x(-s)],
            Jog::Right => vec![Axes::only_x(s)],
            Jog::Up => vec![Axes::only_y(-s)],
            Jog::Down => vec![Axes::only_y(s)],
            Jog::ZUp => vec![Axes::only_z(s)],
            Jog::ZDown => vec![Axes::only_z(-s)],
            Jog::UpLeft => vec![Axes::new(-s, -s, 0.0)],
            Jog::DownRight => vec![Axes::new(s, s, 0.0)],
            Jog::UpRight => vec![Axes::only_x(s), Axes::only_y(-s)],
            Jog::DownLeft => vec![Axes::only_x(-s), Axes::only_y(s)],
        }
    }
}

impl std::str::FromStr for Jog {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "left" => Jog::Left,
            "right" => Jog::Right,
            "up" => Jog::Up,
            "down" => Jog::Down,
            "z-up" | "zup" => Jog::ZUp,
            "z-down" | "zdown" => Jog::ZDown,
            "up-left" => Jog::UpLeft,
            "up-right" => Jog::UpRight,
            "down-right" => Jog::DownRight,
            "down-left" => Jog::DownLeft,
            other => return Err(format!("unknown jog direction '{other}'")),
        })
    }
}
