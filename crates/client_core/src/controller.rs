//! Adapter between the aggregator/orchestrator pair and a user interface.
//!
//! The binding consumes [`BindingEvent`]s: every published snapshot, every
//! outcome of the current request, and errors that need surfacing. It drives
//! contributions through [`ContributionController::request_contribution`],
//! one call per user gesture.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use chrono::Local;
use shared::{
    domain::{BucketId, Catalog},
    error::{ErrorClass, SetupError},
    protocol::{SnapshotView, TransactionOutcome},
    units::whole_units,
};
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::{
    aggregator::ContributionAggregator,
    orchestrator::{OutcomeStream, SubmitError, TransactionOrchestrator},
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub token_symbol: String,
    pub token_decimals: u8,
    /// How long a settled status stays visible without acknowledgment.
    pub status_clear_after: Duration,
}

#[derive(Debug, Clone)]
pub enum BindingEvent {
    SnapshotUpdated(SnapshotView),
    Status(StatusEntry),
    StatusCleared,
    /// A gesture was refused because another request holds the session.
    /// Informational; the running request keeps the status board.
    Busy { bucket: BucketId, message: String },
    Error { class: ErrorClass, message: String },
}

/// The latest outcome of the current (or last) request.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    pub bucket: BucketId,
    pub outcome: TransactionOutcome,
    pub message: String,
    pub updated_at: Instant,
}

impl StatusEntry {
    pub fn is_settled(&self) -> bool {
        self.outcome.is_terminal()
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("interaction blocked: {0}")]
    Blocked(String),
}

impl ControllerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ControllerError::Submit(SubmitError::Validation(err)) => err.class(),
            ControllerError::Submit(SubmitError::WalletDisconnected) => ErrorClass::Validation,
            ControllerError::Blocked(_) => ErrorClass::FatalSetup,
        }
    }
}

/// Result of one user gesture.
#[derive(Debug)]
pub enum Gesture {
    /// The request was handed to the orchestrator; the handle completes once
    /// its outcome stream is drained and the follow-up refresh is done.
    Started(JoinHandle<()>),
    /// A gesture on the same bucket is still being handled.
    Debounced,
}

#[derive(Default)]
struct BindingState {
    pending: HashSet<BucketId>,
    status: Option<StatusEntry>,
    blocked: Option<String>,
}

pub struct ContributionController {
    aggregator: Arc<ContributionAggregator>,
    orchestrator: Arc<TransactionOrchestrator>,
    config: ControllerConfig,
    state: Mutex<BindingState>,
    events: broadcast::Sender<BindingEvent>,
}

impl ContributionController {
    pub fn new(
        aggregator: Arc<ContributionAggregator>,
        orchestrator: Arc<TransactionOrchestrator>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            aggregator,
            orchestrator,
            config,
            state: Mutex::new(BindingState::default()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BindingEvent> {
        self.events.subscribe()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        self.aggregator.catalog()
    }

    pub fn snapshot(&self) -> SnapshotView {
        self.aggregator.snapshot().view()
    }

    pub fn status(&self) -> Option<StatusEntry> {
        self.lock_state().status.clone()
    }

    pub fn blocked(&self) -> Option<String> {
        self.lock_state().blocked.clone()
    }

    /// Initial refresh. If not a single bucket could be read the gateway is
    /// treated as unreachable and the binding is blocked.
    pub async fn load(&self) -> Result<SnapshotView, SetupError> {
        let snapshot = self.aggregator.refresh().await;
        let catalog_len = self.aggregator.catalog().len();
        if snapshot.failed_reads().len() == catalog_len {
            let err = SetupError::GatewayUnreachable(format!(
                "all {catalog_len} bucket reads failed"
            ));
            self.block(&err);
            return Err(err);
        }
        let view = snapshot.view();
        self.emit(BindingEvent::SnapshotUpdated(view.clone()));
        Ok(view)
    }

    pub async fn refresh(&self) -> SnapshotView {
        let view = self.aggregator.refresh().await.view();
        self.emit(BindingEvent::SnapshotUpdated(view.clone()));
        view
    }

    /// Puts the binding into a blocking error state until `unblock`.
    pub fn block(&self, err: &SetupError) {
        error!(error = %err, "controller: blocking interaction");
        self.lock_state().blocked = Some(err.to_string());
        self.emit(BindingEvent::Error {
            class: err.class(),
            message: err.to_string(),
        });
    }

    pub fn unblock(&self) {
        self.lock_state().blocked = None;
    }

    /// Entry point for one user gesture on `bucket`.
    pub fn request_contribution(
        self: &Arc<Self>,
        bucket: &str,
    ) -> Result<Gesture, ControllerError> {
        if let Some(reason) = self.blocked() {
            return Err(self.surface(ControllerError::Blocked(reason)));
        }
        let id = match self.catalog().resolve(bucket) {
            Ok(found) => found.id.clone(),
            Err(err) => return Err(self.surface(SubmitError::Validation(err).into())),
        };

        if !self.lock_state().pending.insert(id.clone()) {
            debug!(bucket = %id, "controller: gesture debounced");
            return Ok(Gesture::Debounced);
        }

        let stream = match self
            .orchestrator
            .submit(id.as_str(), self.orchestrator.unit())
        {
            Ok(stream) => stream,
            Err(err) => {
                self.lock_state().pending.remove(&id);
                return Err(self.surface(err.into()));
            }
        };

        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            controller.follow(id, stream).await;
        });
        Ok(Gesture::Started(handle))
    }

    async fn follow(&self, bucket: BucketId, mut stream: OutcomeStream) {
        let mut settled = None;
        while let Some(outcome) = stream.next().await {
            if matches!(outcome, TransactionOutcome::AlreadyInFlight) {
                self.report_busy(&bucket, &outcome);
                settled = Some(outcome);
                break;
            }
            if matches!(outcome, TransactionOutcome::CheckingAllowance) {
                self.aggregator.mark_stale();
                self.emit(BindingEvent::SnapshotUpdated(self.snapshot()));
            }
            self.record(&bucket, outcome.clone());
            if outcome.is_terminal() {
                settled = Some(outcome);
                break;
            }
        }
        self.lock_state().pending.remove(&bucket);

        match settled {
            Some(TransactionOutcome::AlreadyInFlight) => {}
            Some(outcome) => {
                info!(%bucket, outcome = ?outcome, "controller: request settled, refreshing");
                self.refresh().await;
            }
            None => {
                warn!(%bucket, "controller: outcome stream ended without a terminal outcome");
                self.refresh().await;
            }
        }
    }

    fn report_busy(&self, bucket: &BucketId, outcome: &TransactionOutcome) {
        info!(%bucket, "controller: gesture refused, another request is in flight");
        self.emit(BindingEvent::Busy {
            bucket: bucket.clone(),
            message: self.describe(bucket, outcome),
        });
    }

    fn describe(&self, bucket: &BucketId, outcome: &TransactionOutcome) -> String {
        let bucket_name = self.catalog().display_name(bucket);
        let amount_text = format!(
            "{} {}",
            whole_units(self.orchestrator.unit(), self.config.token_decimals),
            self.config.token_symbol
        );
        outcome.status_message(bucket_name, &amount_text, Local::now().time())
    }

    fn record(&self, bucket: &BucketId, outcome: TransactionOutcome) {
        let entry = StatusEntry {
            bucket: bucket.clone(),
            message: self.describe(bucket, &outcome),
            outcome,
            updated_at: Instant::now(),
        };
        self.lock_state().status = Some(entry.clone());
        self.emit(BindingEvent::Status(entry));
    }

    /// Clears a settled status. Returns `false` while a request is running.
    pub fn acknowledge(&self) -> bool {
        let cleared = {
            let mut state = self.lock_state();
            match &state.status {
                Some(entry) if entry.is_settled() => {
                    state.status = None;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            self.emit(BindingEvent::StatusCleared);
        }
        cleared
    }

    /// Clears a settled status that has been visible for longer than the
    /// configured interval as of `now`.
    pub fn clear_expired(&self, now: Instant) -> bool {
        let clear_after = self.config.status_clear_after;
        let cleared = {
            let mut state = self.lock_state();
            let expired = state.status.as_ref().is_some_and(|entry| {
                entry.is_settled() && now.saturating_duration_since(entry.updated_at) >= clear_after
            });
            if expired {
                state.status = None;
            }
            expired
        };
        if cleared {
            self.emit(BindingEvent::StatusCleared);
        }
        cleared
    }

    fn surface(&self, err: ControllerError) -> ControllerError {
        warn!(error = %err, "controller: request refused");
        self.emit(BindingEvent::Error {
            class: err.class(),
            message: err.to_string(),
        });
        err
    }

    fn emit(&self, event: BindingEvent) {
        // No subscriber is not an error.
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BindingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
