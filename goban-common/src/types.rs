//! Canonical stone, point and move types for the project.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::coord::{format_gtp_move, parse_gtp_move, CoordError};

/// Largest board GTP letter coordinates can address (`A`..`Z` without `I`).
pub const MAX_BOARD_SIZE: u8 = 25;

/// Stone color / player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Color {
    #[serde(rename = "B")]
    Black,
    #[serde(rename = "W")]
    White,
}

impl Color {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Black => "B",
            Self::White => "W",
        }
    }

    pub fn opponent(self) -> Self {
        match self {
            Self::Black => Self::White,
            Self::White => Self::Black,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An intersection on the board.
///
/// `col` is zero-based from the left edge, `row` is one-based from the bottom
/// edge, matching how GTP coordinates are written (`C4` = col 2, row 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub col: u8,
    pub row: u8,
}

impl Point {
    pub fn new(col: u8, row: u8) -> Self {
        Self { col, row }
    }

    /// Whether the point lies on a board of the given size.
    pub fn fits(self, board_size: u8) -> bool {
        self.col < board_size && self.row >= 1 && self.row <= board_size
    }
}

/// A move as engines report it: a stone on a point, or a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BoardMove {
    Play(Point),
    Pass,
}

impl fmt::Display for BoardMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_gtp_move(*self))
    }
}

impl std::str::FromStr for BoardMove {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_gtp_move(s)
    }
}

impl TryFrom<String> for BoardMove {
    type Error = CoordError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        parse_gtp_move(&s)
    }
}

impl From<BoardMove> for String {
    fn from(mv: BoardMove) -> Self {
        format_gtp_move(mv)
    }
}
