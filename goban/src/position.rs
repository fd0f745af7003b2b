//! Building the position to analyse from command-line arguments.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use engine::{Placement, Position};
use goban_common::parse_gtp_move;

#[derive(Args, Debug, Clone)]
pub struct PositionArgs {
    /// JSON position file (`boardSize`, `komi`, `rules`, `moves`, ...).
    #[arg(short, long)]
    pub position: Option<PathBuf>,

    /// Extra moves in GTP coordinates, colours alternating, e.g. `Q16,D4,pass`.
    #[arg(long, value_delimiter = ',')]
    pub moves: Vec<String>,

    /// Board size when no position file is given.
    #[arg(long, default_value_t = 19)]
    pub size: u8,

    #[arg(long)]
    pub komi: Option<f64>,

    #[arg(long)]
    pub rules: Option<String>,
}

impl PositionArgs {
    pub fn to_position(&self) -> anyhow::Result<Position> {
        let mut position = match &self.position {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read position {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("failed to parse position {}", path.display()))?
            }
            None => Position::empty(self.size),
        };

        if let Some(komi) = self.komi {
            position.komi = komi;
        }
        if let Some(rules) = &self.rules {
            position.rules = Some(rules.clone());
        }

        for text in &self.moves {
            let mv = parse_gtp_move(text.trim())
                .with_context(|| format!("invalid move '{}'", text))?;
            let color = position.natural_next_player();
            position.moves.push(Placement(color, mv));
        }

        position.validate()?;
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goban_common::{BoardMove, Color, Point};
    use std::io::Write;

    fn args() -> PositionArgs {
        PositionArgs {
            position: None,
            moves: Vec::new(),
            size: 19,
            komi: None,
            rules: None,
        }
    }

    #[test]
    fn test_moves_alternate_from_black() {
        let position = PositionArgs {
            moves: vec!["Q16".into(), "D4".into(), "pass".into()],
            ..args()
        }
        .to_position()
        .unwrap();

        assert_eq!(
            position.moves,
            vec![
                Placement(Color::Black, BoardMove::Play(Point::new(15, 16))),
                Placement(Color::White, BoardMove::Play(Point::new(3, 4))),
                Placement(Color::Black, BoardMove::Pass),
            ]
        );
        assert_eq!(position.next_player(), Color::White);
    }

    #[test]
    fn test_bad_move_is_reported() {
        let err = PositionArgs {
            moves: vec!["Z99".into()],
            ..args()
        }
        .to_position()
        .unwrap_err();
        assert!(err.to_string().contains("Z99"));
    }

    #[test]
    fn test_off_board_move_is_rejected() {
        let result = PositionArgs {
            size: 9,
            moves: vec!["Q16".into()],
            ..args()
        }
        .to_position();
        assert!(result.is_err());
    }

    #[test]
    fn test_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"boardSize":13,"komi":6.5,"moves":[["B","D4"]]}}"#
        )
        .unwrap();

        let position = PositionArgs {
            position: Some(file.path().to_path_buf()),
            moves: vec!["K10".into()],
            komi: Some(0.5),
            ..args()
        }
        .to_position()
        .unwrap();

        assert_eq!(position.board_size, 13);
        assert_eq!(position.komi, 0.5);
        assert_eq!(position.moves.len(), 2);
        assert_eq!(position.moves[1].0, Color::White);
    }
}
