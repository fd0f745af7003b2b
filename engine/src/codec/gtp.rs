//! GTP-style line protocol (`lz-analyze` / `kata-analyze`).
//!
//! Outgoing analysis is a plain GTP setup sequence followed by
//! `<command> <interval>`; the engine then streams `info move ...` lines until
//! any further command arrives. Incoming records are scanned clause by clause
//! with an explicit tokenizer instead of a pattern match.

use goban_common::{parse_gtp_move, BoardMove};

use super::{DecodedRecord, WinrateScale, WireCodec};
use crate::error::{EncodingError, ParseError};
use crate::types::{AnalysisResult, CandidateMove, Placement};
use crate::{EngineCommand, EngineFamily};

/// Polling interval used when the query does not ask for one.
pub const DEFAULT_INTERVAL_CENTIS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtpDialect {
    LeelaZero,
    KataGo,
}

#[derive(Debug, Clone, Copy)]
pub struct GtpCodec {
    dialect: GtpDialect,
}

impl GtpCodec {
    pub fn new(dialect: GtpDialect) -> Self {
        Self { dialect }
    }

    fn analyze_command(&self) -> &'static str {
        match self.dialect {
            GtpDialect::LeelaZero => "lz-analyze",
            GtpDialect::KataGo => "kata-analyze",
        }
    }
}

impl WireCodec for GtpCodec {
    fn family(&self) -> EngineFamily {
        match self.dialect {
            GtpDialect::LeelaZero => EngineFamily::LeelaZeroGtp,
            GtpDialect::KataGo => EngineFamily::KatagoGtp,
        }
    }

    fn winrate_scale(&self) -> WinrateScale {
        WinrateScale::Inferred
    }

    fn encode(&self, command: &EngineCommand) -> Result<Vec<String>, EncodingError> {
        let lines = match command {
            EngineCommand::Analyze { query, .. } => {
                let position = &query.position;
                position.validate()?;

                let mut lines = vec![
                    format!("boardsize {}", position.board_size),
                    "clear_board".to_string(),
                    format!("komi {}", position.komi),
                ];

                if let Some(rules) = &position.rules {
                    match self.dialect {
                        GtpDialect::KataGo => lines.push(format!("kata-set-rules {}", rules)),
                        // Leela Zero only plays Chinese rules
                        GtpDialect::LeelaZero if rules.eq_ignore_ascii_case("chinese") => {}
                        GtpDialect::LeelaZero => {
                            return Err(EncodingError::UnsupportedRules(rules.clone()))
                        }
                    }
                }

                for Placement(color, mv) in position.initial_stones.iter().chain(&position.moves) {
                    lines.push(format!("play {} {}", color, mv));
                }

                let interval = query
                    .options
                    .report_interval
                    .map(|d| (d.as_millis() as u64 / 10).max(1))
                    .unwrap_or(DEFAULT_INTERVAL_CENTIS);

                let mut analyze = self.analyze_command().to_string();
                if position.next_player() != position.natural_next_player() {
                    analyze.push_str(&format!(" {}", position.next_player()));
                }
                analyze.push_str(&format!(" {}", interval));
                if let (GtpDialect::KataGo, Some(n)) = (self.dialect, query.options.max_candidates)
                {
                    analyze.push_str(&format!(" maxmoves {}", n));
                }
                lines.push(analyze);
                lines
            }
            EngineCommand::SetOption { name, value } => match self.dialect {
                GtpDialect::LeelaZero => vec![format!("lz-setoption name {} value {}", name, value)],
                GtpDialect::KataGo => vec![format!("kata-set-param {} {}", name, value)],
            },
            // Any command interrupts a running analysis
            EngineCommand::Stop { .. } => match self.dialect {
                GtpDialect::LeelaZero => vec!["name".to_string()],
                GtpDialect::KataGo => vec!["stop".to_string()],
            },
            EngineCommand::ClearCache => vec!["clear_cache".to_string()],
            EngineCommand::Quit => vec!["quit".to_string()],
        };
        Ok(lines)
    }

    fn decode(&self, line: &str) -> Result<DecodedRecord, ParseError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(DecodedRecord::Ignored);
        }

        if let Some(rest) = trimmed.strip_prefix('=') {
            return Ok(DecodedRecord::Response {
                ok: true,
                text: strip_response_id(rest).to_string(),
            });
        }
        if let Some(rest) = trimmed.strip_prefix('?') {
            return Ok(DecodedRecord::Response {
                ok: false,
                text: strip_response_id(rest).to_string(),
            });
        }

        if trimmed.split_whitespace().next() != Some("info") {
            return Err(ParseError::new(trimmed, "not an analysis line"));
        }

        let clauses = scan_clauses(trimmed);
        if clauses.is_empty() {
            return Err(ParseError::new(trimmed, "no info clauses"));
        }

        let mut candidates = Vec::with_capacity(clauses.len());
        let mut skipped = Vec::new();
        for (index, clause) in clauses.iter().enumerate() {
            match clause.to_candidate(index) {
                Ok(candidate) => candidates.push(candidate),
                Err(reason) => skipped.push(ParseError::new(trimmed, reason)),
            }
        }

        Ok(DecodedRecord::Analysis {
            result: AnalysisResult {
                candidates,
                ..Default::default()
            },
            skipped,
        })
    }
}

fn strip_response_id(rest: &str) -> &str {
    rest.trim_start_matches(|c: char| c.is_ascii_digit()).trim()
}

/// Keywords that open a trailing section after the candidate clauses.
const SECTION_KEYWORDS: &[&str] = &["ownership", "movesOwnership", "pvVisits", "pvEdgeVisits"];

/// Where a principal variation stops: at the next `info` clause, at a
/// trailing section keyword, or at end of line (the caller runs out of tokens).
pub fn ends_pv(token: &str) -> bool {
    token == "info" || SECTION_KEYWORDS.contains(&token)
}

/// The raw key/value pairs of one `info` clause.
#[derive(Debug, Default, PartialEq)]
struct Clause<'a> {
    fields: Vec<(&'a str, &'a str)>,
    pv: Vec<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    /// Between clauses, waiting for `info`.
    Start,
    /// Inside a clause, reading `key value` pairs.
    Fields,
    /// Consuming principal-variation coordinates.
    Pv,
    /// Inside a trailing section; skipped until the next `info`.
    Section,
}

fn scan_clauses(line: &str) -> Vec<Clause<'_>> {
    let mut clauses = Vec::new();
    let mut current: Option<Clause<'_>> = None;
    let mut state = ScanState::Start;
    let mut tokens = line.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        if token == "info" {
            clauses.extend(current.take());
            current = Some(Clause::default());
            state = ScanState::Fields;
            continue;
        }

        match state {
            ScanState::Start | ScanState::Section => {}
            ScanState::Pv if !ends_pv(token) => {
                if let Some(clause) = current.as_mut() {
                    clause.pv.push(token);
                }
            }
            ScanState::Pv | ScanState::Fields if SECTION_KEYWORDS.contains(&token) => {
                clauses.extend(current.take());
                state = ScanState::Section;
            }
            ScanState::Pv => {}
            ScanState::Fields if token == "pv" => state = ScanState::Pv,
            ScanState::Fields => {
                // A key whose value is missing at end of line is dropped
                if let (Some(clause), Some(value)) = (current.as_mut(), tokens.peek().copied()) {
                    if value != "info" {
                        clause.fields.push((token, value));
                        tokens.next();
                    }
                }
            }
        }
    }

    clauses.extend(current);
    clauses
}

impl Clause<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    fn to_candidate(&self, index: usize) -> Result<CandidateMove, String> {
        let coord = self
            .get("move")
            .ok_or_else(|| format!("clause {} has no move", index))?;
        let mv = parse_gtp_move(coord).map_err(|e| format!("clause {}: {}", index, e))?;

        let visits = self
            .get("visits")
            .ok_or_else(|| format!("clause {} ({}) has no visits", index, coord))?
            .parse::<i64>()
            .map_err(|_| format!("clause {} ({}) has unreadable visits", index, coord))?;
        if visits <= 0 {
            return Err(format!("clause {} ({}) has no visits", index, coord));
        }

        let pv = self
            .pv
            .iter()
            .map(|s| parse_gtp_move(s))
            .collect::<Result<Vec<BoardMove>, _>>()
            .map_err(|e| format!("clause {} pv: {}", index, e))?;

        let order = self
            .get("order")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(index as u32);

        let mut candidate =
            CandidateMove::new(mv, u32::try_from(visits).unwrap_or(u32::MAX), order);
        // Raw scale; normalization happens once, downstream
        candidate.winrate = self.number("winrate");
        candidate.prior = self.number("prior");
        candidate.lcb = self.number("lcb");
        candidate.score_lead = self.number("scoreLead").or_else(|| self.number("scoreMean"));
        candidate.pv = pv;
        Ok(candidate)
    }
}
