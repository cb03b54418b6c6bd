//! The cutover phase state machine.
//!
//! Owns the session and drives it through replication setup,
//! synchronization polling, write-buffer-drain monitoring, and final
//! promotion. Operator commands trigger transitions; each transition's
//! per-pair side effects run with annotate-and-continue failure handling
//! so one failing pair never aborts the rest of the batch.

use futures::future::join_all;
use tracing::{info, warn};

use crate::config::{CutoverOptions, EndpointSpec};
use crate::endpoint::{Endpoint, EndpointError};
use crate::session::{MigrationPair, Session, SessionPhase};
use crate::status::{self, PairLine, RenderModel};
use crate::version::{self, supports};

/// Commands the operator console can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Start,
    EnableWrites,
    Promote,
    Quit,
}

/// Drives one cutover session from start to promotion.
pub struct Orchestrator {
    session: Session,
    /// Summary line computed while awaiting start, reused as the frame
    /// header in later phases.
    summary: String,
    /// Per-pair error annotations from the most recent transition.
    annotations: Vec<Option<String>>,
}

impl Orchestrator {
    /// Connect every source and destination and build the session.
    ///
    /// Any unreachable endpoint is fatal here, before the state machine
    /// starts; the session never begins with a dead connection.
    pub async fn connect(
        pair_specs: Vec<(EndpointSpec, EndpointSpec)>,
        options: &CutoverOptions,
    ) -> Result<Self, EndpointError> {
        let timeout = options.call_timeout;
        let connects = pair_specs.into_iter().enumerate().map(|(index, (src, dst))| async move {
            let source = Endpoint::connect(src, timeout).await?;
            let destination = Endpoint::connect(dst, timeout).await?;
            Ok::<_, EndpointError>(MigrationPair {
                source,
                destination,
                index,
            })
        });

        let pairs = join_all(connects)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let count = pairs.len();
        info!(pairs = count, "session connected");
        Ok(Self {
            session: Session::new(pairs),
            summary: String::new(),
            annotations: vec![None; count],
        })
    }

    /// Build an orchestrator from already-connected pairs.
    pub fn new(session: Session) -> Self {
        let count = session.pairs().len();
        Self {
            session,
            summary: String::new(),
            annotations: vec![None; count],
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn pairs(&self) -> &[MigrationPair] {
        self.session.pairs()
    }

    /// Whether the session has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self.phase(), SessionPhase::Promoted | SessionPhase::Quit)
    }

    /// Run one polling pass for the current phase and produce the frame
    /// to display. May auto-advance Replicating → Synced when every pair
    /// reports a live replication link in the same pass.
    pub async fn poll(&mut self) -> RenderModel {
        let mut model = match self.phase() {
            SessionPhase::AwaitingStart => {
                let stats = status::poll_summary(self.session.pairs()).await;
                self.summary = stats.summary_line();
                RenderModel {
                    summary: self.summary.clone(),
                    banner: None,
                    legend: String::new(),
                    pairs: Vec::new(),
                }
            }
            SessionPhase::Replicating => {
                let poll = status::poll_sync(self.session.pairs()).await;
                if !self.session.pairs().is_empty() && poll.synced == self.session.pairs().len() {
                    self.session.advance_to(SessionPhase::Synced);
                    info!("all replication links up");
                }
                RenderModel {
                    summary: self.summary.clone(),
                    banner: self.banner(),
                    legend: String::new(),
                    pairs: poll.lines,
                }
            }
            SessionPhase::Synced | SessionPhase::WritesEnabled => RenderModel {
                summary: self.summary.clone(),
                banner: self.banner(),
                legend: String::new(),
                pairs: status::poll_buffers(self.session.pairs()).await,
            },
            SessionPhase::Promoted | SessionPhase::Quit => RenderModel::default(),
        };

        model.legend = self.legend();
        for annotation in self.annotations.iter().flatten() {
            model.pairs.push(PairLine {
                index: model.pairs.len(),
                text: annotation.clone(),
                is_error: true,
            });
        }
        model
    }

    /// Apply an operator command. Commands that do not apply to the
    /// current phase are ignored; enable-writes is idempotent.
    pub async fn apply(&mut self, command: OperatorCommand) {
        match (self.phase(), command) {
            (SessionPhase::AwaitingStart, OperatorCommand::Start) => {
                self.start_replication().await;
                self.session.advance_to(SessionPhase::Replicating);
                info!(phase = %self.phase(), "replication started");
            }
            (SessionPhase::Synced | SessionPhase::WritesEnabled, OperatorCommand::EnableWrites) => {
                self.enable_writes().await;
                self.session.advance_to(SessionPhase::WritesEnabled);
                info!(phase = %self.phase(), "writes enabled on destinations");
            }
            (SessionPhase::WritesEnabled, OperatorCommand::Promote) => {
                self.promote().await;
                self.session.advance_to(SessionPhase::Promoted);
                info!(phase = %self.phase(), "destinations promoted");
            }
            (_, OperatorCommand::Quit) => {
                self.session.advance_to(SessionPhase::Quit);
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Transition side effects
    // -----------------------------------------------------------------------

    /// Attach every destination to its source as a replica.
    async fn start_replication(&mut self) {
        let results = run_step(self.session.pairs(), |pair| async move {
            let dst = &pair.destination;
            if supports(dst.version(), version::READ_ONLY_CONFIG) {
                dst.config_set("slave-read-only", "yes").await?;
            }

            // An empty password is carried as the empty string; the auth
            // setting is only touched when it actually differs, because
            // old servers have no way to set a null value.
            let current = dst.config_get("masterauth").await?.unwrap_or_default();
            if pair.source.password() != current {
                dst.config_set("masterauth", pair.source.password()).await?;
            }

            dst.replica_of(pair.source.host(), pair.source.port()).await
        })
        .await;
        self.record(results);
    }

    /// Clear the read-only flag on every gated destination.
    async fn enable_writes(&mut self) {
        let results = run_step(self.session.pairs(), |pair| async move {
            let dst = &pair.destination;
            if supports(dst.version(), version::READ_ONLY_CONFIG) {
                dst.config_set("slave-read-only", "no").await?;
            }
            Ok(())
        })
        .await;
        self.record(results);
    }

    /// Detach every destination and make it an independent write target.
    async fn promote(&mut self) {
        let results = run_step(self.session.pairs(), |pair| async move {
            let dst = &pair.destination;
            dst.detach().await?;
            if supports(dst.version(), version::READ_ONLY_CONFIG) {
                dst.config_set("slave-read-only", "no").await?;
            }
            // Only clear a secret that is actually set; unconditionally
            // writing an empty value errors on old servers.
            let auth = dst.config_get("masterauth").await?.unwrap_or_default();
            if !auth.is_empty() {
                dst.config_set("masterauth", "").await?;
            }
            Ok(())
        })
        .await;
        self.record(results);
    }

    /// Store the per-pair outcomes of a transition step; failures become
    /// annotations shown until the next transition.
    fn record(&mut self, results: Vec<Result<(), EndpointError>>) {
        for (pair, result) in self.session.pairs().iter().zip(results) {
            self.annotations[pair.index] = match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(pair = %pair.label(), error = %e, "transition command failed");
                    Some(format!("Error: {} - {}", pair.label(), e))
                }
            };
        }
    }

    // -----------------------------------------------------------------------
    // Frame text
    // -----------------------------------------------------------------------

    fn banner(&self) -> Option<String> {
        match self.phase() {
            SessionPhase::Synced => Some(
                "Replication links are up, wait for source replication buffers \
                 to flush before disconnecting from sources"
                    .to_string(),
            ),
            SessionPhase::WritesEnabled => Some(
                "Replication links are up and writes enabled on destinations, wait \
                 for source replication buffers to flush before disconnecting from sources"
                    .to_string(),
            ),
            _ => None,
        }
    }

    fn legend(&self) -> String {
        match self.phase() {
            SessionPhase::AwaitingStart => "q - Quit, s - Start".to_string(),
            SessionPhase::Replicating => "q - Quit".to_string(),
            SessionPhase::Synced => "q - Quit, e - Enable writes on destinations".to_string(),
            SessionPhase::WritesEnabled => {
                "q - Quit, e - Enable writes on destinations, \
                 m - Make destinations masters and quit"
                    .to_string()
            }
            SessionPhase::Promoted | SessionPhase::Quit => String::new(),
        }
    }
}

/// Run one transition step on every pair concurrently. The mutating
/// commands for a single pair stay serialized inside its future; results
/// come back in pair order.
async fn run_step<'p, F, Fut>(
    pairs: &'p [MigrationPair],
    step: F,
) -> Vec<Result<(), EndpointError>>
where
    F: Fn(&'p MigrationPair) -> Fut,
    Fut: std::future::Future<Output = Result<(), EndpointError>> + 'p,
{
    join_all(pairs.iter().map(step)).await
}
