//! Queries sent to engines and the normalized results they produce.

use goban_common::{BoardMove, Color};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::EncodingError;

/// Correlation id linking an analysis command to its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(RequestId)
    }
}

/// A stone placed by a player, serialized as `["B", "Q16"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement(pub Color, pub BoardMove);

/// Opaque position descriptor handed over by the game-state collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[serde(default = "default_board_size")]
    pub board_size: u8,
    #[serde(default)]
    pub rules: Option<String>,
    #[serde(default = "default_komi")]
    pub komi: f64,
    /// Setup stones (handicap, problem diagrams).
    #[serde(default)]
    pub initial_stones: Vec<Placement>,
    /// Move history, needed by engines for ko and superko.
    #[serde(default)]
    pub moves: Vec<Placement>,
    #[serde(default)]
    pub player_to_move: Option<Color>,
}

fn default_board_size() -> u8 {
    19
}

fn default_komi() -> f64 {
    7.5
}

impl Default for Position {
    fn default() -> Self {
        Self {
            board_size: default_board_size(),
            rules: None,
            komi: default_komi(),
            initial_stones: Vec::new(),
            moves: Vec::new(),
            player_to_move: None,
        }
    }
}

impl Position {
    pub fn empty(board_size: u8) -> Self {
        Self {
            board_size,
            ..Default::default()
        }
    }

    /// Append a move to the history.
    pub fn with_move(mut self, color: Color, mv: BoardMove) -> Self {
        self.moves.push(Placement(color, mv));
        self
    }

    /// The player the engine should analyse for.
    pub fn next_player(&self) -> Color {
        if let Some(color) = self.player_to_move {
            return color;
        }
        self.natural_next_player()
    }

    /// The player who moves next when turns simply alternate.
    pub fn natural_next_player(&self) -> Color {
        self.moves
            .last()
            .map(|Placement(color, _)| color.opponent())
            .unwrap_or(Color::Black)
    }

    /// Check that every stone fits on the board.
    pub fn validate(&self) -> Result<(), EncodingError> {
        if !(2..=goban_common::MAX_BOARD_SIZE).contains(&self.board_size) {
            return Err(EncodingError::InvalidPosition(format!(
                "unsupported board size {}",
                self.board_size
            )));
        }
        if !self.komi.is_finite() {
            return Err(EncodingError::InvalidPosition("komi is not finite".into()));
        }
        let stones = self.initial_stones.iter().chain(self.moves.iter());
        for Placement(_, mv) in stones {
            if let BoardMove::Play(point) = mv {
                if !point.fits(self.board_size) {
                    return Err(EncodingError::InvalidPosition(format!(
                        "{} is off a {}x{} board",
                        mv, self.board_size, self.board_size
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Search budget and output shape for one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisOptions {
    pub max_visits: Option<u32>,
    pub max_time: Option<Duration>,
    /// Number of candidate moves to return.
    pub max_candidates: Option<usize>,
    /// How often streaming engines report progress.
    pub report_interval: Option<Duration>,
    /// Fail the request if no final record arrives in time.
    pub timeout: Option<Duration>,
    /// Re-rank candidates by visit count instead of the engine's order.
    pub order_by_visits: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisQuery {
    pub position: Position,
    pub options: AnalysisOptions,
}

impl AnalysisQuery {
    pub fn new(position: Position) -> Self {
        Self {
            position,
            options: AnalysisOptions::default(),
        }
    }

    pub fn with_options(mut self, options: AnalysisOptions) -> Self {
        self.options = options;
        self
    }
}

/// One engine-suggested move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMove {
    #[serde(rename = "move")]
    pub mv: BoardMove,
    pub visits: u32,
    /// Canonical [0,1] once normalized; `None` if the engine omitted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winrate: Option<f64>,
    /// 0 is the engine's top choice.
    pub order: u32,
    #[serde(default)]
    pub pv: Vec<BoardMove>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_lead: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lcb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_lost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winrate_lost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_share: Option<f64>,
}

impl CandidateMove {
    pub fn new(mv: BoardMove, visits: u32, order: u32) -> Self {
        Self {
            mv,
            visits,
            winrate: None,
            order,
            pv: Vec::new(),
            score_lead: None,
            prior: None,
            lcb: None,
            points_lost: None,
            winrate_lost: None,
            visit_share: None,
        }
    }
}

/// Normalized output of one decode cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub candidates: Vec<CandidateMove>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winrate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_lead: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visits: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_number: Option<u32>,
    /// Final record for the query, as opposed to a progress update.
    pub is_terminal: bool,
}

impl AnalysisResult {
    pub fn best(&self) -> Option<&CandidateMove> {
        self.candidates.first()
    }

    pub fn candidate_visits(&self) -> u64 {
        self.candidates.iter().map(|c| u64::from(c.visits)).sum()
    }

    /// Root visits if the engine reported them, otherwise the candidate sum.
    pub fn total_visits(&self) -> u64 {
        self.visits.unwrap_or_else(|| self.candidate_visits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goban_common::Point;

    fn c(col: u8, row: u8) -> BoardMove {
        BoardMove::Play(Point::new(col, row))
    }

    #[test]
    fn test_next_player_alternates() {
        let pos = Position::empty(19);
        assert_eq!(pos.next_player(), Color::Black);

        let pos = pos.with_move(Color::Black, c(3, 4));
        assert_eq!(pos.next_player(), Color::White);
    }

    #[test]
    fn test_next_player_override() {
        let mut pos = Position::empty(19).with_move(Color::Black, c(3, 4));
        pos.player_to_move = Some(Color::Black);
        assert_eq!(pos.next_player(), Color::Black);
        assert_eq!(pos.natural_next_player(), Color::White);
    }

    #[test]
    fn test_validate_rejects_off_board_stone() {
        let pos = Position::empty(9).with_move(Color::Black, c(9, 5));
        assert!(matches!(
            pos.validate(),
            Err(EncodingError::InvalidPosition(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_board_size() {
        assert!(Position::empty(1).validate().is_err());
        assert!(Position::empty(26).validate().is_err());
        assert!(Position::empty(13).validate().is_ok());
    }

    #[test]
    fn test_position_deserializes_with_defaults() {
        let pos: Position =
            serde_json::from_str(r#"{"moves":[["B","Q16"],["W","pass"]]}"#).unwrap();
        assert_eq!(pos.board_size, 19);
        assert_eq!(pos.komi, 7.5);
        assert_eq!(pos.moves.len(), 2);
        assert_eq!(pos.moves[1], Placement(Color::White, BoardMove::Pass));
    }

    #[test]
    fn test_total_visits_falls_back_to_candidates() {
        let mut result = AnalysisResult {
            candidates: vec![CandidateMove::new(c(2, 3), 10, 0), CandidateMove::new(c(3, 3), 5, 1)],
            ..Default::default()
        };
        assert_eq!(result.total_visits(), 15);
        result.visits = Some(40);
        assert_eq!(result.total_visits(), 40);
    }
}
