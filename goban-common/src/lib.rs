//! Common Go vocabulary for Goban
//!
//! This crate provides the stone colors, board points and GTP coordinate
//! helpers shared by the engine layer and the CLI.

pub mod coord;
pub mod types;

// Re-export commonly used items
pub use coord::{format_gtp_move, parse_gtp_move, CoordError};
pub use types::{BoardMove, Color, Point, MAX_BOARD_SIZE};
