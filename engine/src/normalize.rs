//! Post-processing applied to every decoded result before dispatch.
//!
//! Probability fields are brought to the canonical [0,1] domain, candidates
//! are ranked contiguously in engine order, aggregate fields are filled in and
//! the per-candidate loss metrics are derived.
//!
//! # Win-probability scale
//!
//! Line-protocol engines do not say which scale they use: Leela Zero builds
//! print integers on 0–10000, some older builds 0–100, KataGo floats on 0–1.
//! [`normalize_winrate`] infers the scale from the magnitude of each value.
//! This is a best-effort inference and misclassifies values near the
//! boundaries: a genuine `1` on the 0–100 scale (1%) reads as 100%, and a
//! genuine `100` on the 0–10000 scale (1%) reads as 100%.
//!
//! `prior` and `lcb` share their record's scale but are not inferred per
//! value: small priors are normal and `lcb` may overshoot 1. They are divided
//! by the scale of the record's largest raw winrate instead.

use crate::codec::WinrateScale;
use crate::types::AnalysisResult;

/// Map a raw win-probability onto [0,1].
///
/// Values above 100 are taken as 0–10000, values above 1 as 0–100, anything
/// else as already canonical. The result is clamped; non-finite input yields
/// `None`.
pub fn normalize_winrate(raw: f64) -> Option<f64> {
    if !raw.is_finite() {
        return None;
    }
    clamp_probability(raw / scale_divisor(raw))
}

fn scale_divisor(raw: f64) -> f64 {
    if raw > 100.0 {
        10000.0
    } else if raw > 1.0 {
        100.0
    } else {
        1.0
    }
}

fn clamp_probability(raw: f64) -> Option<f64> {
    raw.is_finite().then(|| raw.clamp(0.0, 1.0))
}

/// Divisor for the record's secondary probabilities, judged from the largest
/// raw winrate it carries. `None` when no winrate was reported.
fn record_divisor(result: &AnalysisResult) -> Option<f64> {
    result
        .candidates
        .iter()
        .filter_map(|c| c.winrate)
        .chain(result.winrate)
        .filter(|w| w.is_finite())
        .reduce(f64::max)
        .map(scale_divisor)
}

/// Normalize a freshly decoded result in place.
pub fn normalize(result: &mut AnalysisResult, scale: WinrateScale) {
    let probability = |raw: f64| match scale {
        WinrateScale::Canonical => clamp_probability(raw),
        WinrateScale::Inferred => normalize_winrate(raw),
    };
    let divisor = match scale {
        WinrateScale::Canonical => Some(1.0),
        WinrateScale::Inferred => record_divisor(result),
    };
    // Without any winrate to go by, fall back to the per-value rule
    let secondary = |raw: f64| match divisor {
        Some(divisor) => clamp_probability(raw / divisor),
        None => normalize_winrate(raw),
    };

    for candidate in &mut result.candidates {
        candidate.winrate = candidate.winrate.and_then(probability);
        candidate.prior = candidate.prior.and_then(secondary);
        candidate.lcb = candidate.lcb.and_then(secondary);
    }
    result.winrate = result.winrate.and_then(probability);

    // Engine preference first; the sort is stable so ties keep wire order
    result.candidates.sort_by_key(|c| c.order);
    rerank(result);

    if result.visits.is_none() && !result.candidates.is_empty() {
        result.visits = Some(result.candidate_visits());
    }
    if result.winrate.is_none() {
        result.winrate = result.best().and_then(|c| c.winrate);
    }
    if result.score_lead.is_none() {
        result.score_lead = result.best().and_then(|c| c.score_lead);
    }

    derive_metrics(result);
}

/// Re-rank by visit count. Only applied when a caller explicitly asks.
pub fn order_by_visits(result: &mut AnalysisResult) {
    result
        .candidates
        .sort_by(|a, b| b.visits.cmp(&a.visits).then(a.order.cmp(&b.order)));
    rerank(result);
    derive_metrics(result);
}

/// Keep at most `max` candidates.
pub fn truncate(result: &mut AnalysisResult, max: usize) {
    result.candidates.truncate(max);
}

fn rerank(result: &mut AnalysisResult) {
    for (rank, candidate) in result.candidates.iter_mut().enumerate() {
        candidate.order = rank as u32;
    }
}

/// Fill `points_lost`, `winrate_lost` and `visit_share` relative to rank 0.
fn derive_metrics(result: &mut AnalysisResult) {
    let Some(top) = result.candidates.first() else {
        return;
    };
    let top_score = top.score_lead;
    let top_winrate = top.winrate;
    let total = result.candidate_visits();

    for candidate in &mut result.candidates {
        candidate.points_lost = match (top_score, candidate.score_lead) {
            (Some(best), Some(score)) => Some((best - score).max(0.0)),
            _ => None,
        };
        candidate.winrate_lost = match (top_winrate, candidate.winrate) {
            (Some(best), Some(winrate)) => Some(best - winrate),
            _ => None,
        };
        candidate.visit_share = (total > 0).then(|| f64::from(candidate.visits) / total as f64);
    }
}
