//! Chat module: the live conversation with a local model
//!
//! Module structure:
//! - types.rs: SessionState, TurnPhase, TurnOutcome, ChatError
//! - task_registry.rs: active turn tracking and cancellation
//! - session.rs: SessionController (send / stop / clear / load)
//! - history.rs: HistoryReconciler, titles, recency grouping

pub mod types;
pub mod task_registry;
pub mod session;
pub mod history;

pub use types::{ChatError, PersistenceStatus, SessionState, TurnOutcome, TurnPhase};
pub use session::{build_outgoing_messages, SessionController};
pub use history::{
    derive_title, group_by_recency, HistoryReconciler, Recency, RecencyBucket,
    DEFAULT_QUIET_PERIOD,
};
