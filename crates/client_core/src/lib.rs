pub mod aggregator;
pub mod controller;
pub mod orchestrator;
pub mod revert;
pub mod session_lock;

pub use aggregator::{ContributionAggregator, ContributionSnapshot};
pub use controller::{
    BindingEvent, ContributionController, ControllerConfig, ControllerError, Gesture, StatusEntry,
};
pub use orchestrator::{
    AllowanceStep, ContributionRequest, OrchestratorConfig, OutcomeStream, RequestPhase,
    SubmitError, TransactionOrchestrator,
};
pub use session_lock::{LockBusy, SessionLock, SessionLockGuard};
