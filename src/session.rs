//! Session data model: migration pairs and the global phase.
//!
//! Pairs are plain data holders; all transition logic lives in the
//! orchestrator. The phase is monotonic — it only moves forward through
//! the cutover sequence or terminates via operator quit.

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;

/// Global progress of a cutover session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Connected, showing the pre-start aggregate, waiting for start.
    AwaitingStart,
    /// Destinations attached as replicas, waiting for links to come up.
    Replicating,
    /// All replication links up; destinations still read-only.
    Synced,
    /// Writes enabled on destinations, waiting for buffers to drain
    /// before promotion.
    WritesEnabled,
    /// Destinations detached and independent; session complete.
    Promoted,
    /// Operator quit.
    Quit,
}

impl SessionPhase {
    /// Position in the forward sequence; `Quit` sits past the end so the
    /// monotonicity check treats it as reachable from anywhere.
    fn index(self) -> u8 {
        match self {
            Self::AwaitingStart => 0,
            Self::Replicating => 1,
            Self::Synced => 2,
            Self::WritesEnabled => 3,
            Self::Promoted => 4,
            Self::Quit => 5,
        }
    }

    /// Whether moving to `next` respects the forward-only ordering.
    pub fn can_advance_to(self, next: SessionPhase) -> bool {
        next == SessionPhase::Quit || next.index() > self.index()
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingStart => write!(f, "awaiting_start"),
            Self::Replicating => write!(f, "replicating"),
            Self::Synced => write!(f, "synced"),
            Self::WritesEnabled => write!(f, "writes_enabled"),
            Self::Promoted => write!(f, "promoted"),
            Self::Quit => write!(f, "quit"),
        }
    }
}

/// One source bound to its replacement destination.
///
/// The ordinal fixes display order and survives the whole session.
#[derive(Debug)]
pub struct MigrationPair {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub index: usize,
}

impl MigrationPair {
    /// `src ==> dst` label used in every per-pair status line.
    pub fn label(&self) -> String {
        format!("{} ==> {}", self.source.address(), self.destination.address())
    }
}

/// The single source of truth for global progress.
#[derive(Debug)]
pub struct Session {
    pairs: Vec<MigrationPair>,
    phase: SessionPhase,
}

impl Session {
    /// Build a session from already-connected pairs. The pairing and
    /// count invariants are enforced upstream at configuration time.
    pub fn new(pairs: Vec<MigrationPair>) -> Self {
        Self {
            pairs,
            phase: SessionPhase::AwaitingStart,
        }
    }

    pub fn pairs(&self) -> &[MigrationPair] {
        &self.pairs
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Advance the phase, enforcing forward-only movement. Returns whether
    /// the transition was applied; an out-of-order request is ignored
    /// rather than regressing.
    pub fn advance_to(&mut self, next: SessionPhase) -> bool {
        if self.phase.can_advance_to(next) {
            self.phase = next;
            true
        } else {
            false
        }
    }
}
