pub mod codec;
pub mod config;
pub mod error;
pub mod facade;
pub mod normalize;
pub mod reader;
pub mod router;
pub mod supervisor;
pub mod types;

pub use codec::{DecodedRecord, WinrateScale, WireCodec};
pub use config::{ConfigError, EngineConfig};
pub use error::{EncodingError, EngineError, EngineResult, ParseError};
pub use facade::{AnalysisTicket, Engine};
pub use router::RequestState;
pub use supervisor::ProcessStatus;
pub use types::{
    AnalysisOptions, AnalysisQuery, AnalysisResult, CandidateMove, Placement, Position, RequestId,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Commands sent to the engine
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Analyze { id: RequestId, query: AnalysisQuery },
    SetOption { name: String, value: String },
    /// Interrupt one query, or everything in flight when `id` is `None`.
    Stop { id: Option<RequestId> },
    ClearCache,
    Quit,
}

impl EngineCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Analyze { .. } => "analyze",
            Self::SetOption { .. } => "set-option",
            Self::Stop { .. } => "stop",
            Self::ClearCache => "clear-cache",
            Self::Quit => "quit",
        }
    }
}

/// The engine builds this layer knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineFamily {
    /// KataGo `analysis` mode: one JSON object per line in both directions.
    KatagoAnalysis,
    /// Leela Zero in GTP mode, analysed with `lz-analyze`.
    LeelaZeroGtp,
    /// KataGo in GTP mode, analysed with `kata-analyze`.
    KatagoGtp,
}

/// How results are correlated with the requests that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Every record echoes the request id; answers may arrive in any order.
    Structured,
    /// Records carry no id; one query on the wire at a time, strict FIFO.
    LineStream,
}

impl EngineFamily {
    pub fn protocol(self) -> Protocol {
        match self {
            Self::KatagoAnalysis => Protocol::Structured,
            Self::LeelaZeroGtp | Self::KatagoGtp => Protocol::LineStream,
        }
    }
}

impl fmt::Display for EngineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::KatagoAnalysis => "katago-analysis",
            Self::LeelaZeroGtp => "leela-zero-gtp",
            Self::KatagoGtp => "katago-gtp",
        };
        f.write_str(name)
    }
}
