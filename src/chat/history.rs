//! History reconciler: mirrors the live chat into the conversation store
//!
//! Saves are debounced. Every change restarts a quiet-period timer and only
//! the latest snapshot is written once the timer expires. The first save of
//! a new chat allocates an id that later saves reuse, so one chat maps to
//! exactly one stored conversation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::types::{ChatError, PersistenceStatus};
use crate::database::{ChatMessage, ChatRole, Conversation, ConversationStore, ConversationSummary};

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(1000);

pub const DEFAULT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 40;

struct PendingSave {
    ticket: u64,
    conversation: Conversation,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct ReconcilerState {
    active_id: Option<i64>,
    created_at: Option<DateTime<Utc>>,
    pending: Option<PendingSave>,
    next_ticket: u64,
}

struct Inner {
    store: Arc<dyn ConversationStore>,
    quiet_period: Duration,
    state: Mutex<ReconcilerState>,
    status: watch::Sender<PersistenceStatus>,
}

#[derive(Clone)]
pub struct HistoryReconciler {
    inner: Arc<Inner>,
}

impl HistoryReconciler {
    pub fn new(store: Arc<dyn ConversationStore>, quiet_period: Duration) -> Self {
        let (status, _) = watch::channel(PersistenceStatus::default());
        Self {
            inner: Arc::new(Inner {
                store,
                quiet_period,
                state: Mutex::new(ReconcilerState::default()),
                status,
            }),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.inner.quiet_period
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PersistenceStatus> {
        self.inner.status.subscribe()
    }

    /// Id of the stored conversation the live chat is bound to
    pub fn active_conversation_id(&self) -> Option<i64> {
        self.inner.state().active_id
    }

    pub fn has_pending(&self) -> bool {
        self.inner.state().pending.is_some()
    }

    /// Record a new snapshot of the chat and restart the quiet-period timer.
    ///
    /// Empty histories are never saved. Must be called from within a tokio runtime.
    pub fn schedule_save(&self, history: &[ChatMessage], model_id: &str) {
        if history.is_empty() {
            return;
        }

        let mut state = self.inner.state();
        let now = Utc::now();
        let created_at = *state.created_at.get_or_insert(now);

        let conversation = Conversation {
            id: state.active_id,
            title: derive_title(history),
            messages: history.to_vec(),
            model_id: model_id.to_string(),
            created_at,
            last_updated: now,
        };

        state.next_ticket += 1;
        let ticket = state.next_ticket;

        if let Some(previous) = state.pending.take() {
            previous.timer.abort();
        }

        let inner = Arc::clone(&self.inner);
        let quiet_period = self.inner.quiet_period;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(quiet_period).await;
            // Errors are already published on the status channel
            let _ = inner.save_pending(Some(ticket));
        });

        state.pending = Some(PendingSave {
            ticket,
            conversation,
            timer,
        });
    }

    /// Write the pending snapshot now, if any
    pub fn flush(&self) -> Result<Option<i64>, ChatError> {
        self.inner.save_pending(None)
    }

    /// Flush, then dissociate the live chat from its stored conversation
    pub fn reset(&self) -> Result<(), ChatError> {
        let flushed = self.flush();

        let mut state = self.inner.state();
        state.active_id = None;
        state.created_at = None;
        drop(state);

        flushed.map(|_| ())
    }

    /// Flush pending work, fetch a stored conversation and bind the live chat to it
    pub fn load_conversation(&self, id: i64) -> Result<Option<Conversation>, ChatError> {
        if let Err(e) = self.flush() {
            log::warn!("Loading conversation {} after failed save: {}", id, e);
        }

        let conversation = self
            .inner
            .store
            .get_conversation(id)
            .map_err(|e| ChatError::Persistence(format!("{:#}", e)))?;

        if let Some(conversation) = &conversation {
            let mut state = self.inner.state();
            state.active_id = Some(id);
            state.created_at = Some(conversation.created_at);
            log::info!("Loaded conversation {} ({} messages)", id, conversation.messages.len());
        }

        Ok(conversation)
    }

    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        self.inner
            .store
            .list_conversations()
            .map_err(|e| ChatError::Persistence(format!("{:#}", e)))
    }

    /// Delete a stored conversation. Returns true when it was the live one,
    /// in which case its pending save is discarded and the chat is dissociated.
    pub fn delete_conversation(&self, id: i64) -> Result<bool, ChatError> {
        let was_active = {
            let mut state = self.inner.state();
            if state.active_id == Some(id) {
                if let Some(pending) = state.pending.take() {
                    pending.timer.abort();
                }
                state.active_id = None;
                state.created_at = None;
                true
            } else {
                false
            }
        };

        self.inner
            .store
            .delete_conversation(id)
            .map_err(|e| ChatError::Persistence(format!("{:#}", e)))?;

        log::info!("Deleted conversation {}", id);
        Ok(was_active)
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ReconcilerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Save the pending snapshot. With a ticket, only saves if that ticket is
    /// still the pending one (a stale timer does nothing).
    fn save_pending(&self, ticket: Option<u64>) -> Result<Option<i64>, ChatError> {
        let mut state = self.state();

        let pending = match state.pending.take() {
            Some(pending) if ticket.map_or(true, |t| t == pending.ticket) => pending,
            other => {
                state.pending = other;
                return Ok(None);
            }
        };
        if ticket.is_none() {
            pending.timer.abort();
        }

        let mut conversation = pending.conversation;
        conversation.id = state.active_id;

        match self.store.save_conversation(&mut conversation) {
            Ok(id) => {
                state.active_id = Some(id);
                state.created_at = Some(conversation.created_at);
                log::debug!(
                    "Saved conversation {} ({} messages)",
                    id,
                    conversation.messages.len()
                );
                self.status.send_modify(|status| {
                    status.last_saved_id = Some(id);
                    status.last_error = None;
                    status.saves += 1;
                });
                Ok(Some(id))
            }
            Err(e) => {
                let message = format!("{:#}", e);
                log::error!("Failed to save conversation: {}", message);
                self.status.send_modify(|status| {
                    status.last_error = Some(message.clone());
                });
                Err(ChatError::Persistence(message))
            }
        }
    }
}

/// Title derived from the first user message, or "New Chat" when there is none
pub fn derive_title(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|title| !title.is_empty())
        .map(|title| {
            if title.chars().count() > TITLE_MAX_CHARS {
                let mut short: String = title.chars().take(TITLE_MAX_CHARS).collect();
                short.truncate(short.trim_end().len());
                short.push('…');
                short
            } else {
                title
            }
        })
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}

/// Anything listed in the history sidebar
pub trait Recency {
    fn last_updated(&self) -> DateTime<Utc>;
}

impl Recency for Conversation {
    fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }
}

impl Recency for ConversationSummary {
    fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecencyBucket {
    Today,
    Yesterday,
    LastWeek,
    Older,
}

impl RecencyBucket {
    pub const ALL: [RecencyBucket; 4] = [
        RecencyBucket::Today,
        RecencyBucket::Yesterday,
        RecencyBucket::LastWeek,
        RecencyBucket::Older,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            RecencyBucket::Today => "Today",
            RecencyBucket::Yesterday => "Yesterday",
            RecencyBucket::LastWeek => "Last Week",
            RecencyBucket::Older => "Older",
        }
    }

    /// Today and Yesterday compare local calendar dates; Last Week is the
    /// trailing seven days.
    pub fn classify(last_updated: DateTime<Utc>, now: DateTime<Local>) -> Self {
        let date = last_updated.with_timezone(&Local).date_naive();
        let today = now.date_naive();

        if date == today {
            RecencyBucket::Today
        } else if today.pred_opt() == Some(date) {
            RecencyBucket::Yesterday
        } else if last_updated > (now - chrono::Duration::days(7)).with_timezone(&Utc) {
            RecencyBucket::LastWeek
        } else {
            RecencyBucket::Older
        }
    }
}

/// Bucket items by recency. Always returns the four buckets in display
/// order, each sorted most recent first.
pub fn group_by_recency<T>(items: &[T], now: DateTime<Local>) -> Vec<(RecencyBucket, Vec<T>)>
where
    T: Recency + Clone,
{
    let mut groups: Vec<(RecencyBucket, Vec<T>)> = RecencyBucket::ALL
        .iter()
        .map(|bucket| (*bucket, Vec::new()))
        .collect();

    for item in items {
        let bucket = RecencyBucket::classify(item.last_updated(), now);
        if let Some((_, group)) = groups.iter_mut().find(|(b, _)| *b == bucket) {
            group.push(item.clone());
        }
    }

    for (_, group) in groups.iter_mut() {
        group.sort_by(|a, b| b.last_updated().cmp(&a.last_updated()));
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    struct CountingStore {
        db: DatabaseManager,
        saves: AtomicUsize,
        fail_next: AtomicBool,
    }

    impl ConversationStore for CountingStore {
        fn save_conversation(&self, conversation: &mut Conversation) -> anyhow::Result<i64> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("database is locked");
            }
            self.db.save_conversation(conversation)
        }

        fn list_conversations(&self) -> anyhow::Result<Vec<ConversationSummary>> {
            self.db.list_conversations()
        }

        fn get_conversation(&self, id: i64) -> anyhow::Result<Option<Conversation>> {
            self.db.get_conversation(id)
        }

        fn delete_conversation(&self, id: i64) -> anyhow::Result<()> {
            self.db.delete_conversation(id)
        }
    }

    struct FailingStore;

    impl ConversationStore for FailingStore {
        fn save_conversation(&self, _conversation: &mut Conversation) -> anyhow::Result<i64> {
            anyhow::bail!("disk full")
        }

        fn list_conversations(&self) -> anyhow::Result<Vec<ConversationSummary>> {
            Ok(Vec::new())
        }

        fn get_conversation(&self, _id: i64) -> anyhow::Result<Option<Conversation>> {
            Ok(None)
        }

        fn delete_conversation(&self, _id: i64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn create_reconciler() -> (TempDir, Arc<CountingStore>, HistoryReconciler) {
        let dir = tempdir().unwrap();
        let store = Arc::new(CountingStore {
            db: DatabaseManager::new(dir.path().join("test.db")).unwrap(),
            saves: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        });
        let reconciler = HistoryReconciler::new(store.clone(), DEFAULT_QUIET_PERIOD);
        (dir, store, reconciler)
    }

    fn history(len: usize) -> Vec<ChatMessage> {
        (0..len)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("question {}", i))
                } else {
                    ChatMessage::assistant(format!("answer {}", i))
                }
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_changes_produce_one_save() {
        let (_dir, store, reconciler) = create_reconciler();

        reconciler.schedule_save(&history(1), "llama3.2");
        reconciler.schedule_save(&history(2), "llama3.2");
        reconciler.schedule_save(&history(3), "llama3.2");

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        let id = reconciler.active_conversation_id().unwrap();
        let saved = store.get_conversation(id).unwrap().unwrap();
        assert_eq!(saved.messages.len(), 3);
        assert_eq!(saved.title, "question 0");
        assert!(!reconciler.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_change_restarts_quiet_period() {
        let (_dir, store, reconciler) = create_reconciler();

        reconciler.schedule_save(&history(1), "llama3.2");
        tokio::time::sleep(Duration::from_millis(600)).await;
        reconciler.schedule_save(&history(2), "llama3.2");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_history_is_not_saved() {
        let (_dir, store, reconciler) = create_reconciler();

        reconciler.schedule_save(&[], "llama3.2");
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
        assert!(reconciler.active_conversation_id().is_none());
    }

    #[tokio::test]
    async fn test_later_saves_reuse_allocated_id() {
        let (_dir, store, reconciler) = create_reconciler();

        reconciler.schedule_save(&history(2), "llama3.2");
        let first = reconciler.flush().unwrap().unwrap();

        reconciler.schedule_save(&history(4), "llama3.2");
        let second = reconciler.flush().unwrap().unwrap();

        assert_eq!(first, second);
        let list = store.list_conversations().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].message_count, 4);
        assert_eq!(reconciler.subscribe_status().borrow().last_saved_id, Some(first));
    }

    #[tokio::test]
    async fn test_flush_without_pending_is_noop() {
        let (_dir, store, reconciler) = create_reconciler();
        assert_eq!(reconciler.flush().unwrap(), None);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reset_starts_new_conversation() {
        let (_dir, store, reconciler) = create_reconciler();

        reconciler.schedule_save(&history(2), "llama3.2");
        reconciler.reset().unwrap();
        assert!(reconciler.active_conversation_id().is_none());

        reconciler.schedule_save(&history(1), "llama3.2");
        reconciler.flush().unwrap();

        assert_eq!(store.list_conversations().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_load_binds_live_chat_to_conversation() {
        let (_dir, store, reconciler) = create_reconciler();

        let mut stored = Conversation::new("Old chat", "mistral", history(2));
        let id = store.save_conversation(&mut stored).unwrap();

        let loaded = reconciler.load_conversation(id).unwrap().unwrap();
        assert_eq!(loaded.model_id, "mistral");
        assert_eq!(reconciler.active_conversation_id(), Some(id));

        reconciler.schedule_save(&history(3), "mistral");
        assert_eq!(reconciler.flush().unwrap(), Some(id));
        assert_eq!(store.list_conversations().unwrap().len(), 1);

        assert!(reconciler.load_conversation(9999).unwrap().is_none());
        assert_eq!(reconciler.active_conversation_id(), Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleting_active_conversation_discards_pending_save() {
        let (_dir, store, reconciler) = create_reconciler();

        reconciler.schedule_save(&history(2), "llama3.2");
        let id = reconciler.flush().unwrap().unwrap();

        reconciler.schedule_save(&history(3), "llama3.2");
        assert!(reconciler.delete_conversation(id).unwrap());
        assert!(reconciler.active_conversation_id().is_none());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(store.list_conversations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_failure_is_reported() {
        let reconciler = HistoryReconciler::new(Arc::new(FailingStore), DEFAULT_QUIET_PERIOD);
        let status = reconciler.subscribe_status();

        reconciler.schedule_save(&history(1), "llama3.2");
        let result = reconciler.flush();

        assert!(matches!(result, Err(ChatError::Persistence(_))));
        assert_eq!(status.borrow().last_error.as_deref(), Some("disk full"));
        assert!(reconciler.active_conversation_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_after_failure_persists_full_history() {
        let (_dir, store, reconciler) = create_reconciler();
        let status = reconciler.subscribe_status();
        store.fail_next.store(true, Ordering::SeqCst);

        reconciler.schedule_save(&history(2), "llama3.2");
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        assert_eq!(status.borrow().last_error.as_deref(), Some("database is locked"));
        assert!(reconciler.active_conversation_id().is_none());
        assert!(store.list_conversations().unwrap().is_empty());

        reconciler.schedule_save(&history(3), "llama3.2");
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(store.saves.load(Ordering::SeqCst), 2);
        let id = reconciler.active_conversation_id().unwrap();
        let saved = store.get_conversation(id).unwrap().unwrap();
        let contents: Vec<&str> = saved.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["question 0", "answer 1", "question 2"]);
        assert_eq!(status.borrow().last_saved_id, Some(id));
        assert!(status.borrow().last_error.is_none());
        assert_eq!(store.list_conversations().unwrap().len(), 1);
        assert!(!reconciler.has_pending());
    }

    #[test]
    fn test_derive_title() {
        assert_eq!(derive_title(&[]), DEFAULT_TITLE);
        assert_eq!(derive_title(&[ChatMessage::assistant("hello")]), DEFAULT_TITLE);
        assert_eq!(
            derive_title(&[ChatMessage::system("sys"), ChatMessage::user("  What is\n Rust? ")]),
            "What is Rust?"
        );

        let long = "word ".repeat(20);
        let title = derive_title(&[ChatMessage::user(long)]);
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= TITLE_MAX_CHARS + 1);
    }

    #[test]
    fn test_group_by_recency() {
        let now = Local.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let at = |hours_ago: i64| {
            let mut c = Conversation::new("c", "m", Vec::new());
            c.last_updated = (now - chrono::Duration::hours(hours_ago)).with_timezone(&Utc);
            c
        };

        let items = vec![at(24 * 10), at(1), at(24), at(3), at(24 * 3)];
        let groups = group_by_recency(&items, now);

        let buckets: Vec<RecencyBucket> = groups.iter().map(|(b, _)| *b).collect();
        assert_eq!(buckets, RecencyBucket::ALL.to_vec());

        assert_eq!(groups[0].1.len(), 2);
        assert!(groups[0].1[0].last_updated > groups[0].1[1].last_updated);
        assert_eq!(groups[1].1.len(), 1);
        assert_eq!(groups[2].1.len(), 1);
        assert_eq!(groups[3].1.len(), 1);
    }

    #[test]
    fn test_classify_uses_calendar_dates() {
        let now = Local.with_ymd_and_hms(2024, 6, 15, 0, 30, 0).unwrap();
        let late_yesterday = Local.with_ymd_and_hms(2024, 6, 14, 23, 45, 0).unwrap();
        let eight_days = Local.with_ymd_and_hms(2024, 6, 7, 0, 0, 0).unwrap();

        assert_eq!(
            RecencyBucket::classify(late_yesterday.with_timezone(&Utc), now),
            RecencyBucket::Yesterday
        );
        assert_eq!(
            RecencyBucket::classify(eight_days.with_timezone(&Utc), now),
            RecencyBucket::Older
        );
        assert_eq!(RecencyBucket::LastWeek.label(), "Last Week");
    }
}
