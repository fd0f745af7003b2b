//! KataGo analysis-engine protocol: one JSON object per line.

use goban_common::{parse_gtp_move, BoardMove, Color};
use serde::{Deserialize, Serialize};

use super::{DecodedRecord, WinrateScale, WireCodec};
use crate::error::{EncodingError, ParseError};
use crate::types::{AnalysisResult, CandidateMove, Placement, RequestId};
use crate::{EngineCommand, EngineFamily};

const FAMILY: &str = "katago-analysis";
const DEFAULT_RULES: &str = "chinese";

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryMessage<'a> {
    id: String,
    moves: &'a [Placement],
    #[serde(skip_serializing_if = "no_stones")]
    initial_stones: &'a [Placement],
    rules: &'a str,
    komi: f64,
    board_x_size: u8,
    board_y_size: u8,
    analyze_turns: [usize; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_player: Option<Color>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_visits: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report_during_search_every: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    override_settings: Option<OverrideSettings>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OverrideSettings {
    max_time: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActionMessage<'a> {
    id: String,
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    terminate_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseMessage {
    id: Option<String>,
    error: Option<String>,
    warning: Option<String>,
    action: Option<String>,
    is_during_search: Option<bool>,
    turn_number: Option<u32>,
    // Kept as raw values so one bad candidate does not sink the record.
    move_infos: Option<Vec<serde_json::Value>>,
    root_info: Option<RootInfo>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RootInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    winrate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score_lead: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    visits: Option<u64>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveInfo {
    #[serde(rename = "move")]
    mv: String,
    visits: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    winrate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    order: Option<u32>,
    #[serde(default)]
    pv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score_lead: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prior: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lcb: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    is_during_search: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn_number: Option<u32>,
    move_infos: Vec<MoveInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    root_info: Option<RootInfo>,
}

impl WireCodec for JsonCodec {
    fn family(&self) -> EngineFamily {
        EngineFamily::KatagoAnalysis
    }

    fn winrate_scale(&self) -> WinrateScale {
        WinrateScale::Canonical
    }

    fn encode(&self, command: &EngineCommand) -> Result<Vec<String>, EncodingError> {
        let line = match command {
            EngineCommand::Analyze { id, query } => {
                let position = &query.position;
                position.validate()?;
                let options = &query.options;
                let message = QueryMessage {
                    id: id.to_string(),
                    moves: &position.moves,
                    initial_stones: &position.initial_stones,
                    rules: position.rules.as_deref().unwrap_or(DEFAULT_RULES),
                    komi: position.komi,
                    board_x_size: position.board_size,
                    board_y_size: position.board_size,
                    analyze_turns: [position.moves.len()],
                    initial_player: position.player_to_move,
                    max_visits: options.max_visits,
                    report_during_search_every: options.report_interval.map(|d| d.as_secs_f64()),
                    override_settings: options.max_time.map(|d| OverrideSettings {
                        max_time: d.as_secs_f64(),
                    }),
                };
                to_line(&message)?
            }
            EngineCommand::Stop { id: Some(id) } => to_line(&ActionMessage {
                id: format!("stop-{}", id),
                action: "terminate",
                terminate_id: Some(id.to_string()),
            })?,
            EngineCommand::Stop { id: None } => to_line(&ActionMessage {
                id: "stop-all".to_string(),
                action: "terminate_all",
                terminate_id: None,
            })?,
            EngineCommand::ClearCache => to_line(&ActionMessage {
                id: "clear-cache".to_string(),
                action: "clear_cache",
                terminate_id: None,
            })?,
            EngineCommand::SetOption { .. } | EngineCommand::Quit => {
                return Err(EncodingError::Unsupported {
                    family: FAMILY,
                    command: command.name(),
                })
            }
        };
        Ok(vec![line])
    }

    fn decode(&self, line: &str) -> Result<DecodedRecord, ParseError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(DecodedRecord::Ignored);
        }

        let message: ResponseMessage = serde_json::from_str(trimmed)
            .map_err(|e| ParseError::new(trimmed, format!("invalid JSON: {}", e)))?;

        if let Some(error) = message.error {
            return Ok(DecodedRecord::Rejected {
                id: message.id.as_deref().and_then(|s| s.parse().ok()),
                message: error,
            });
        }
        if let Some(warning) = message.warning {
            tracing::warn!(id = ?message.id, "Engine warning: {}", warning);
            return Ok(DecodedRecord::Ignored);
        }
        if let Some(action) = message.action {
            return Ok(DecodedRecord::Ack { action });
        }

        let Some(move_infos) = message.move_infos else {
            return Err(ParseError::new(trimmed, "record has no moveInfos"));
        };

        let mut candidates = Vec::with_capacity(move_infos.len());
        let mut skipped = Vec::new();
        for (index, raw) in move_infos.into_iter().enumerate() {
            match decode_candidate(raw, index) {
                Ok(candidate) => candidates.push(candidate),
                Err(reason) => skipped.push(ParseError::new(trimmed, reason)),
            }
        }

        let root = message.root_info.unwrap_or(RootInfo {
            winrate: None,
            score_lead: None,
            visits: None,
        });

        let result = AnalysisResult {
            id: message.id.as_deref().and_then(|s| s.parse::<RequestId>().ok()),
            candidates,
            winrate: root.winrate,
            score_lead: root.score_lead,
            visits: root.visits,
            turn_number: message.turn_number,
            is_terminal: !message.is_during_search.unwrap_or(false),
        };

        Ok(DecodedRecord::Analysis { result, skipped })
    }
}

fn no_stones(stones: &&[Placement]) -> bool {
    stones.is_empty()
}

fn to_line<T: Serialize>(message: &T) -> Result<String, EncodingError> {
    serde_json::to_string(message).map_err(|e| EncodingError::Serialize(e.to_string()))
}

fn decode_candidate(raw: serde_json::Value, index: usize) -> Result<CandidateMove, String> {
    let info: MoveInfo =
        serde_json::from_value(raw).map_err(|e| format!("candidate {}: {}", index, e))?;

    if info.visits <= 0 {
        return Err(format!("candidate {} has no visits", index));
    }
    let mv = parse_gtp_move(&info.mv).map_err(|e| format!("candidate {}: {}", index, e))?;
    let pv = info
        .pv
        .iter()
        .map(|s| parse_gtp_move(s))
        .collect::<Result<Vec<BoardMove>, _>>()
        .map_err(|e| format!("candidate {} pv: {}", index, e))?;

    Ok(CandidateMove {
        mv,
        visits: u32::try_from(info.visits).unwrap_or(u32::MAX),
        winrate: info.winrate,
        order: info.order.unwrap_or(index as u32),
        pv,
        score_lead: info.score_lead,
        prior: info.prior,
        lcb: info.lcb,
        points_lost: None,
        winrate_lost: None,
        visit_share: None,
    })
}

/// Render a result the way the engine itself would emit it.
///
/// Derived metrics are not part of the wire format and are dropped.
pub fn format_result(result: &AnalysisResult) -> String {
    let root_info = if result.winrate.is_some() || result.score_lead.is_some() || result.visits.is_some()
    {
        Some(RootInfo {
            winrate: result.winrate,
            score_lead: result.score_lead,
            visits: result.visits,
        })
    } else {
        None
    };

    let message = ResultMessage {
        id: result.id.map(|id| id.to_string()),
        is_during_search: !result.is_terminal,
        turn_number: result.turn_number,
        move_infos: result
            .candidates
            .iter()
            .map(|c| MoveInfo {
                mv: c.mv.to_string(),
                visits: i64::from(c.visits),
                winrate: c.winrate,
                order: Some(c.order),
                pv: c.pv.iter().map(|m| m.to_string()).collect(),
                score_lead: c.score_lead,
                prior: c.prior,
                lcb: c.lcb,
            })
            .collect(),
        root_info,
    };

    // Plain structs of numbers and strings always serialize.
    serde_json::to_string(&message).unwrap_or_default()
}
