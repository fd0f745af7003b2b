//! Stateless translation between engine commands/results and wire lines.

pub mod gtp;
pub mod json;

pub use gtp::{GtpCodec, GtpDialect};
pub use json::JsonCodec;

use std::fmt;
use std::sync::Arc;

use crate::error::{EncodingError, ParseError};
use crate::types::{AnalysisResult, RequestId};
use crate::{EngineCommand, EngineFamily, Protocol};

/// Which scale raw win-probabilities arrive on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinrateScale {
    /// Already on [0,1]; only clamped.
    Canonical,
    /// Build-dependent (0–10000, 0–100 or 0–1); inferred per value.
    Inferred,
}

/// One decoded line of engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedRecord {
    /// Analysis output. `skipped` lists candidates dropped as malformed.
    Analysis {
        result: AnalysisResult,
        skipped: Vec<ParseError>,
    },
    /// GTP command response (`= ...` / `? ...`).
    Response { ok: bool, text: String },
    /// The engine refused a query.
    Rejected {
        id: Option<RequestId>,
        message: String,
    },
    /// Acknowledgement of a control action.
    Ack { action: String },
    /// Nothing of interest (blank lines, warnings).
    Ignored,
}

pub trait WireCodec: Send + Sync + fmt::Debug {
    fn family(&self) -> EngineFamily;

    fn protocol(&self) -> Protocol {
        self.family().protocol()
    }

    fn winrate_scale(&self) -> WinrateScale;

    /// Produce the exact line(s) the engine expects, without newlines.
    fn encode(&self, command: &EngineCommand) -> Result<Vec<String>, EncodingError>;

    /// Parse one line of engine stdout.
    fn decode(&self, line: &str) -> Result<DecodedRecord, ParseError>;
}

/// Build the codec for an engine family.
pub fn codec_for(family: EngineFamily) -> Arc<dyn WireCodec> {
    match family {
        EngineFamily::KatagoAnalysis => Arc::new(JsonCodec),
        EngineFamily::LeelaZeroGtp => Arc::new(GtpCodec::new(GtpDialect::LeelaZero)),
        EngineFamily::KatagoGtp => Arc::new(GtpCodec::new(GtpDialect::KataGo)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_for_matches_family() {
        for family in [
            EngineFamily::KatagoAnalysis,
            EngineFamily::LeelaZeroGtp,
            EngineFamily::KatagoGtp,
        ] {
            assert_eq!(codec_for(family).family(), family);
        }
    }

    #[test]
    fn test_scales() {
        assert_eq!(
            codec_for(EngineFamily::KatagoAnalysis).winrate_scale(),
            WinrateScale::Canonical
        );
        assert_eq!(
            codec_for(EngineFamily::LeelaZeroGtp).winrate_scale(),
            WinrateScale::Inferred
        );
    }
}
