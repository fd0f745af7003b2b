//! GTP coordinate parsing and formatting.
//!
//! Columns are letters `A`..`Z` with `I` skipped, rows are numbers counted
//! from the bottom edge. `pass` is accepted in any case.

use crate::types::{BoardMove, Point, MAX_BOARD_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    #[error("Empty coordinate")]
    Empty,
    #[error("Invalid column in coordinate: {0}")]
    InvalidColumn(String),
    #[error("Invalid row in coordinate: {0}")]
    InvalidRow(String),
}

/// Parse a GTP vertex (`Q16`, `c4`, `pass`).
pub fn parse_gtp_move(s: &str) -> Result<BoardMove, CoordError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CoordError::Empty);
    }
    if s.eq_ignore_ascii_case("pass") {
        return Ok(BoardMove::Pass);
    }

    let mut chars = s.chars();
    let letter = chars
        .next()
        .ok_or(CoordError::Empty)?
        .to_ascii_uppercase();
    let col = column_index(letter).ok_or_else(|| CoordError::InvalidColumn(s.to_string()))?;

    let row: u8 = chars
        .as_str()
        .parse()
        .map_err(|_| CoordError::InvalidRow(s.to_string()))?;
    if row == 0 || row > MAX_BOARD_SIZE {
        return Err(CoordError::InvalidRow(s.to_string()));
    }

    Ok(BoardMove::Play(Point::new(col, row)))
}

/// Format a move as a GTP vertex (`C4`, `pass`).
pub fn format_gtp_move(mv: BoardMove) -> String {
    match mv {
        BoardMove::Pass => "pass".to_string(),
        BoardMove::Play(p) => format!("{}{}", column_letter(p.col), p.row),
    }
}

fn column_index(letter: char) -> Option<u8> {
    match letter {
        'A'..='H' => Some(letter as u8 - b'A'),
        'J'..='Z' => Some(letter as u8 - b'A' - 1),
        _ => None,
    }
}

fn column_letter(col: u8) -> char {
    // I is not a GTP column
    if col < 8 {
        (b'A' + col) as char
    } else {
        (b'A' + col + 1) as char
    }
}
