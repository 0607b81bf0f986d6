use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// The closed set of actions an agent accepts.
///
/// Each action is bound to one input symbol and serializes under its
/// snake_case wire name (`"rotate_counterclockwise"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Up,
    Down,
    Left,
    Right,
    RotateCounterclockwise,
    RotateClockwise,
}

impl Action {
    /// Every action, in symbol-table order.
    pub const ALL: [Action; 6] = [
        Action::Up,
        Action::Down,
        Action::Left,
        Action::Right,
        Action::RotateCounterclockwise,
        Action::RotateClockwise,
    ];

    /// Map an input symbol to its action. Symbols are upper-case.
    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            'W' => Some(Action::Up),
            'S' => Some(Action::Down),
            'A' => Some(Action::Left),
            'D' => Some(Action::Right),
            'Q' => Some(Action::RotateCounterclockwise),
            'E' => Some(Action::RotateClockwise),
            _ => None,
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Action::Up => 'W',
            Action::Down => 'S',
            Action::Left => 'A',
            Action::Right => 'D',
            Action::RotateCounterclockwise => 'Q',
            Action::RotateClockwise => 'E',
        }
    }

    /// Wire name of the action.
    pub fn name(self) -> &'static str {
        match self {
            Action::Up => "up",
            Action::Down => "down",
            Action::Left => "left",
            Action::Right => "right",
            Action::RotateCounterclockwise => "rotate_counterclockwise",
            Action::RotateClockwise => "rotate_clockwise",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.name() == name)
    }
}

impl TryFrom<char> for Action {
    type Error = EnvelopeError;

    fn try_from(symbol: char) -> Result<Self, Self::Error> {
        Action::from_symbol(symbol).ok_or(EnvelopeError::UnknownAction(symbol))
    }
}

impl FromStr for Action {
    type Err = EnvelopeError;

    /// Accepts either a wire name (`"up"`) or a single symbol (`"W"`).
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if let Some(action) = Action::from_name(input) {
            return Ok(action);
        }
        let mut chars = input.chars();
        match (chars.next(), chars.next()) {
            (Some(symbol), None) => Action::try_from(symbol),
            _ => Err(EnvelopeError::MalformedEnvelope(format!(
                "unknown action name '{input}'"
            ))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
