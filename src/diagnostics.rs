//! Non-fatal analysis problems.
//!
//! Nothing in the analysis aborts because code does not look the way we expect. Instead a
//! [`Diagnostic`] is recorded against the function being analyzed, logged, and analysis carries on
//! with a conservative result.

use crate::log::*;
use crate::provider::MemoryUnavailable;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Diagnostic {
    #[error("unrecognized idiom at {addr:#06x}: `{text}`")]
    UnrecognizedIdiom { addr: u64, text: String },
    #[error("unrecognized stack effect at {addr:#06x}: `{text}`")]
    UnrecognizedStackEffect { addr: u64, text: String },
    #[error("stack tracking lost at {addr:#06x}")]
    StackTrackingLost { addr: u64 },
    #[error("stack level skew entering {addr:#06x} from {from:#06x}: kept {kept}, saw {seen}")]
    StackLevelSkew {
        addr: u64,
        from: u64,
        kept: i64,
        seen: i64,
    },
    #[error("flow from {addr:#06x} to {} has no node", display_target(.target))]
    MissingFlowTarget { addr: u64, target: Option<u64> },
    #[error("read for {addr:#06x} failed: {source}")]
    MemoryUnavailable {
        addr: u64,
        #[source]
        source: MemoryUnavailable,
    },
    #[error("no valid prologue at {addr:#06x}")]
    NoPrologue { addr: u64 },
    #[error("call at {addr:#06x} has no static destination")]
    UnresolvedCall { addr: u64 },
    #[error("call at {addr:#06x} targets undecodable {target:#06x}")]
    UndecodableTarget { addr: u64, target: u64 },
}

fn display_target(t: &Option<u64>) -> String {
    match t {
        Some(t) => format!("{:#06x}", t),
        None => "an unknown address".to_owned(),
    }
}

impl Diagnostic {
    /// The address the problem was observed at
    pub fn addr(&self) -> u64 {
        match self {
            Diagnostic::UnrecognizedIdiom { addr, .. }
            | Diagnostic::UnrecognizedStackEffect { addr, .. }
            | Diagnostic::StackTrackingLost { addr }
            | Diagnostic::StackLevelSkew { addr, .. }
            | Diagnostic::MissingFlowTarget { addr, .. }
            | Diagnostic::MemoryUnavailable { addr, .. }
            | Diagnostic::NoPrologue { addr }
            | Diagnostic::UnresolvedCall { addr }
            | Diagnostic::UndecodableTarget { addr, .. } => *addr,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Diagnostic::UnrecognizedIdiom { .. } => "UnrecognizedIdiom",
            Diagnostic::UnrecognizedStackEffect { .. } => "UnrecognizedStackEffect",
            Diagnostic::StackTrackingLost { .. } => "StackTrackingLost",
            Diagnostic::StackLevelSkew { .. } => "StackLevelSkew",
            Diagnostic::MissingFlowTarget { .. } => "MissingFlowTarget",
            Diagnostic::MemoryUnavailable { .. } => "MemoryUnavailable",
            Diagnostic::NoPrologue { .. } => "NoPrologue",
            Diagnostic::UnresolvedCall { .. } => "UnresolvedCall",
            Diagnostic::UndecodableTarget { .. } => "UndecodableTarget",
        }
    }
}

/// All diagnostics recorded during a session, each tagged with the entry of the function it was
/// found in.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<(u64, Diagnostic)>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, function: u64, d: Diagnostic) {
        match d {
            Diagnostic::MemoryUnavailable { .. } | Diagnostic::UnrecognizedIdiom { .. } => {
                info!("{}", d; "function" => Addr(function), "kind" => d.kind())
            }
            _ => warn!("{}", d; "function" => Addr(function), "kind" => d.kind()),
        }
        self.entries.push((function, d));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u64, Diagnostic)> {
        self.entries.iter()
    }

    /// Diagnostics recorded against the function with entry `function`
    pub fn for_function(&self, function: u64) -> impl Iterator<Item = &Diagnostic> {
        self.entries
            .iter()
            .filter(move |(f, _)| *f == function)
            .map(|(_, d)| d)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
