//! Chat task registry - tracks the active generation of a session

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Active chat completion task
pub struct ChatTask {
    pub turn_id: u64,
    pub cancel_token: CancellationToken,
}

/// Holds at most one active task per session.
///
/// Registering a new task cancels the previous one, which is how a send
/// issued during a generation stops that generation first.
#[derive(Default)]
pub struct TaskRegistry {
    active: Mutex<Option<ChatTask>>,
    next_turn_id: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, Option<ChatTask>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new task, cancelling whatever was active
    pub fn register_task(&self) -> (u64, CancellationToken) {
        let turn_id = self.next_turn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel_token = CancellationToken::new();

        let previous = self.active().replace(ChatTask {
            turn_id,
            cancel_token: cancel_token.clone(),
        });
        if let Some(previous) = previous {
            if !previous.cancel_token.is_cancelled() {
                log::info!("Cancelling turn {} for new turn {}", previous.turn_id, turn_id);
                previous.cancel_token.cancel();
            }
        }

        (turn_id, cancel_token)
    }

    /// Remove a task from the registry if it is still the active one
    pub fn remove_task(&self, turn_id: u64) {
        let mut active = self.active();
        if active.as_ref().map(|t| t.turn_id) == Some(turn_id) {
            *active = None;
        }
    }

    /// Cancel the active task. Returns false when there was nothing left to cancel.
    pub fn cancel_active(&self) -> bool {
        match self.active().as_ref() {
            Some(task) if !task.cancel_token.is_cancelled() => {
                task.cancel_token.cancel();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_cancels_previous() {
        let registry = TaskRegistry::new();
        let (first_id, first) = registry.register_task();
        let (second_id, second) = registry.register_task();

        assert_ne!(first_id, second_id);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(registry.cancel_active());
        assert!(second.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let registry = TaskRegistry::new();
        assert!(!registry.cancel_active());

        let (_, token) = registry.register_task();
        assert!(registry.cancel_active());
        assert!(token.is_cancelled());
        assert!(!registry.cancel_active());
    }

    #[test]
    fn test_remove_only_matching_task() {
        let registry = TaskRegistry::new();
        let (old_id, _) = registry.register_task();
        let (_, current) = registry.register_task();

        registry.remove_task(old_id);
        assert!(registry.cancel_active());
        assert!(current.is_cancelled());

        let (finished_id, finished) = registry.register_task();
        registry.remove_task(finished_id);
        assert!(!registry.cancel_active());
        assert!(!finished.is_cancelled());
    }
}
