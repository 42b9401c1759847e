use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::HistoryConfig;
use crate::error::Result;
use crate::logging::log_error;
use crate::models::HistoryRecord;
use crate::store::{HistoryFilter, HistoryStore, Page, PageRequest};

/// Counters exposed for monitoring audit-trail health
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub appended: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub pending_dead_letters: usize,
}

/// Best-effort, append-only writer for the audit trail.
///
/// `append` never fails its caller. Each record gets a timestamp that is
/// non-decreasing within its process and the next per-process sequence
/// number; a store failure is retried and, once attempts run out, the
/// stamped record is parked in a bounded dead-letter buffer for
/// [`HistoryRecorder::retry_dead_letters`].
///
/// The per-process cursor is seeded from the newest stored record. When that
/// read fails, or parked records of the process are not in the store yet, the
/// record is parked unstamped (`sequence == 0`). Later records of the same
/// process queue behind it until a retry has written the earlier ones and can
/// stamp the rest in order.
pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
    config: HistoryConfig,
    /// Last (timestamp, sequence) handed out per process
    cursors: DashMap<Uuid, (DateTime<Utc>, u64)>,
    dead_letters: Mutex<VecDeque<HistoryRecord>>,
    /// Processes whose parked records a retry pass has taken out of
    /// `dead_letters`. Lock order: `dead_letters` before `restamping`.
    restamping: Mutex<HashSet<Uuid>>,
    appended: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl std::fmt::Debug for HistoryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryRecorder")
            .field("config", &self.config)
            .field("tracked_processes", &self.cursors.len())
            .field("dead_letters", &self.dead_letters.lock().len())
            .finish()
    }
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>, config: HistoryConfig) -> Self {
        Self {
            store,
            config,
            cursors: DashMap::new(),
            dead_letters: Mutex::new(VecDeque::new()),
            restamping: Mutex::new(HashSet::new()),
            appended: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    /// Stamp and persist a record, returning it as stamped
    pub async fn append(&self, record: HistoryRecord) -> HistoryRecord {
        if self.must_park(record.process_id) {
            self.dead_letter(record.clone(), "earlier records of this process are not stamped yet");
            return record;
        }
        if let Err(reason) = self.seed_cursor(record.process_id).await {
            self.dead_letter(record.clone(), &format!("could not seed history cursor: {reason}"));
            return record;
        }
        let record = self.stamp(record);

        if let Err(reason) = self.write_with_retry(&record).await {
            self.dead_letter(record.clone(), &reason);
        } else {
            self.appended.fetch_add(1, Ordering::Relaxed);
            debug!(
                process_id = %record.process_id,
                action = %record.action,
                sequence = record.sequence,
                "History appended"
            );
        }
        record
    }

    /// Append several records in order
    pub async fn append_all(&self, records: Vec<HistoryRecord>) -> Vec<HistoryRecord> {
        let mut stamped = Vec::with_capacity(records.len());
        for record in records {
            stamped.push(self.append(record).await);
        }
        stamped
    }

    /// Re-attempt parked records in their original order; returns how many
    /// were written. An unstamped record is stamped once every earlier parked
    /// record of its process is written and the cursor can be seeded.
    pub async fn retry_dead_letters(&self) -> usize {
        let (parked, draining) = {
            let mut queue = self.dead_letters.lock();
            let parked: Vec<HistoryRecord> = queue.drain(..).collect();
            let draining: HashSet<Uuid> = parked.iter().map(|record| record.process_id).collect();
            self.restamping.lock().extend(draining.iter().copied());
            (parked, draining)
        };
        if parked.is_empty() {
            return 0;
        }

        let mut written = 0;
        let mut blocked: HashSet<Uuid> = HashSet::new();
        let mut still_failing = Vec::new();
        for mut record in parked {
            if record.sequence == 0 {
                if blocked.contains(&record.process_id) {
                    still_failing.push(record);
                    continue;
                }
                if let Err(reason) = self.seed_cursor(record.process_id).await {
                    debug!(process_id = %record.process_id, error = %reason, "History cursor still unavailable");
                    blocked.insert(record.process_id);
                    still_failing.push(record);
                    continue;
                }
                record = self.stamp(record);
            }
            match self.store.append(&record).await {
                Ok(()) => {
                    written += 1;
                    self.appended.fetch_add(1, Ordering::Relaxed);
                }
                // A previous attempt reached the store after all
                Err(crate::store::StoreError::Duplicate { .. }) => written += 1,
                Err(err) => {
                    debug!(history_id = %record.history_id, error = %err, "Dead letter still failing");
                    blocked.insert(record.process_id);
                    still_failing.push(record);
                }
            }
        }

        let mut queue = self.dead_letters.lock();
        for record in still_failing.into_iter().rev() {
            queue.push_front(record);
        }
        while queue.len() > self.config.max_dead_letters {
            queue.pop_back();
        }
        let mut restamping = self.restamping.lock();
        for process_id in &draining {
            restamping.remove(process_id);
        }
        written
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().len()
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            appended: self.appended.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            pending_dead_letters: self.dead_letter_count(),
        }
    }

    /// Full timeline of one process
    pub async fn by_process(&self, process_id: Uuid, page: &PageRequest) -> Result<Page<HistoryRecord>> {
        self.query(&HistoryFilter::for_process(process_id), page).await
    }

    pub async fn by_task(&self, task_id: Uuid, page: &PageRequest) -> Result<Page<HistoryRecord>> {
        self.query(&HistoryFilter::for_task(task_id), page).await
    }

    pub async fn by_operator(&self, operator: &str, page: &PageRequest) -> Result<Page<HistoryRecord>> {
        self.query(&HistoryFilter::for_operator(operator), page).await
    }

    /// Records matching `filter`, ordered by timestamp then sequence
    pub async fn query(&self, filter: &HistoryFilter, page: &PageRequest) -> Result<Page<HistoryRecord>> {
        Ok(self.store.list_history(filter, page).await?)
    }

    pub async fn count(&self, filter: &HistoryFilter) -> Result<u64> {
        Ok(self.store.count_history(filter).await?)
    }

    /// Forget the cursor of a process that is finished or deleted; a later
    /// append seeds it again from the store
    pub fn forget(&self, process_id: Uuid) {
        self.cursors.remove(&process_id);
    }

    /// Number of processes with a cached cursor
    pub fn tracked_processes(&self) -> usize {
        self.cursors.len()
    }

    /// Whether a new record of this process has to wait behind parked ones:
    /// an unstamped record is parked, a retry pass holds its records, or the
    /// cursor is not cached while parked records are missing from the store
    fn must_park(&self, process_id: Uuid) -> bool {
        let cached = self.cursors.contains_key(&process_id);
        let queue = self.dead_letters.lock();
        queue
            .iter()
            .any(|record| record.process_id == process_id && (record.sequence == 0 || !cached))
            || self.restamping.lock().contains(&process_id)
    }

    /// Load the cursor from the newest stored record unless it is cached,
    /// retrying read failures like writes
    async fn seed_cursor(&self, process_id: Uuid) -> std::result::Result<(), String> {
        if self.cursors.contains_key(&process_id) {
            return Ok(());
        }
        let attempts = self.config.append_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.store.latest_history(process_id).await {
                Ok(latest) => {
                    let seed = latest.map_or((DateTime::<Utc>::MIN_UTC, 0), |latest| {
                        (latest.timestamp, latest.sequence)
                    });
                    self.cursors.entry(process_id).or_insert(seed);
                    return Ok(());
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        process_id = %process_id,
                        attempt = attempt,
                        error = %err,
                        "Could not seed history cursor"
                    );
                    if attempt < attempts {
                        self.retried.fetch_add(1, Ordering::Relaxed);
                        let backoff = self.config.retry_backoff_ms * u64::from(attempt);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// Assign the next timestamp and sequence; the cursor must be seeded
    fn stamp(&self, mut record: HistoryRecord) -> HistoryRecord {
        let mut cursor = self
            .cursors
            .entry(record.process_id)
            .or_insert((DateTime::<Utc>::MIN_UTC, 0));
        let (last_timestamp, last_sequence) = *cursor;
        if record.timestamp < last_timestamp {
            record.timestamp = last_timestamp;
        }
        record.sequence = last_sequence + 1;
        *cursor = (record.timestamp, record.sequence);
        record
    }

    async fn write_with_retry(&self, record: &HistoryRecord) -> std::result::Result<(), String> {
        let attempts = self.config.append_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.store.append(record).await {
                Ok(()) => return Ok(()),
                Err(crate::store::StoreError::Duplicate { .. }) => return Ok(()),
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        process_id = %record.process_id,
                        history_id = %record.history_id,
                        attempt = attempt,
                        error = %err,
                        "History append failed"
                    );
                    if attempt < attempts {
                        self.retried.fetch_add(1, Ordering::Relaxed);
                        let backoff = self.config.retry_backoff_ms * u64::from(attempt);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    fn dead_letter(&self, record: HistoryRecord, reason: &str) {
        log_error(
            "history_recorder",
            "append",
            reason,
            Some(&format!(
                "process_id={} action={} history_id={}",
                record.process_id, record.action, record.history_id
            )),
        );
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.dead_letters.lock();
        queue.push_back(record);
        while queue.len() > self.config.max_dead_letters {
            if let Some(dropped) = queue.pop_front() {
                warn!(history_id = %dropped.history_id, "History dead-letter buffer full, dropping oldest record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HistoryAction;
    use crate::store::{InMemoryStore, StoreError, StoreResult};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicBool;

    /// Delegates to memory storage but fails appends while `down` is set and
    /// cursor reads while `reads_down` is set
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryStore,
        down: AtomicBool,
        reads_down: AtomicBool,
    }

    #[async_trait]
    impl HistoryStore for FlakyStore {
        async fn append(&self, record: &HistoryRecord) -> StoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("audit store unavailable".into()));
            }
            self.inner.append(record).await
        }

        async fn list_history(&self, filter: &HistoryFilter, page: &PageRequest) -> StoreResult<Page<HistoryRecord>> {
            self.inner.list_history(filter, page).await
        }

        async fn count_history(&self, filter: &HistoryFilter) -> StoreResult<u64> {
            self.inner.count_history(filter).await
        }

        async fn latest_history(&self, process_id: Uuid) -> StoreResult<Option<HistoryRecord>> {
            if self.reads_down.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("audit store unavailable".into()));
            }
            self.inner.latest_history(process_id).await
        }
    }

    fn fast_config() -> HistoryConfig {
        HistoryConfig {
            append_attempts: 2,
            retry_backoff_ms: 1,
            max_dead_letters: 2,
        }
    }

    #[tokio::test]
    async fn test_timestamps_clamped_and_sequenced() {
        let recorder = HistoryRecorder::new(Arc::new(InMemoryStore::new()), fast_config());
        let process_id = Uuid::new_v4();

        let first = recorder
            .append(HistoryRecord::new(process_id, "alice", HistoryAction::ProcessStarted))
            .await;
        let mut late = HistoryRecord::new(process_id, "alice", HistoryAction::NodeStarted);
        late.timestamp = first.timestamp - ChronoDuration::seconds(10);
        let second = recorder.append(late).await;

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.timestamp, first.timestamp);
    }

    #[tokio::test]
    async fn test_cursor_seeded_from_store() {
        let store = Arc::new(InMemoryStore::new());
        let process_id = Uuid::new_v4();
        let first = HistoryRecorder::new(store.clone(), fast_config());
        first
            .append(HistoryRecord::new(process_id, "alice", HistoryAction::ProcessCreated))
            .await;

        let second = HistoryRecorder::new(store, fast_config());
        let record = second
            .append(HistoryRecord::new(process_id, "alice", HistoryAction::ProcessStarted))
            .await;
        assert_eq!(record.sequence, 2);
    }

    #[tokio::test]
    async fn test_outage_dead_letters_then_recovers() {
        let store = Arc::new(FlakyStore {
            down: AtomicBool::new(true),
            ..Default::default()
        });
        let recorder = HistoryRecorder::new(store.clone(), fast_config());
        let process_id = Uuid::new_v4();

        for action in [
            HistoryAction::ProcessStarted,
            HistoryAction::NodeStarted,
            HistoryAction::TaskCreated,
        ] {
            recorder.append(HistoryRecord::new(process_id, "alice", action)).await;
        }
        // Bounded buffer keeps the newest two
        assert_eq!(recorder.dead_letter_count(), 2);
        assert_eq!(recorder.stats().dead_lettered, 3);

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(recorder.retry_dead_letters().await, 2);
        assert_eq!(recorder.dead_letter_count(), 0);

        let page = recorder
            .by_process(process_id, &PageRequest::default())
            .await
            .unwrap();
        let sequences: Vec<u64> = page.items.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    async fn stored_sequences(recorder: &HistoryRecorder, process_id: Uuid) -> Vec<u64> {
        recorder
            .by_process(process_id, &PageRequest::default())
            .await
            .unwrap()
            .items
            .iter()
            .map(|r| r.sequence)
            .collect()
    }

    #[tokio::test]
    async fn test_unseeded_cursor_parks_instead_of_reusing_sequences() {
        let store = Arc::new(FlakyStore::default());
        let process_id = Uuid::new_v4();
        let first = HistoryRecorder::new(store.clone(), fast_config());
        for action in [HistoryAction::ProcessCreated, HistoryAction::ProcessStarted] {
            first.append(HistoryRecord::new(process_id, "alice", action)).await;
        }

        // A fresh recorder cannot read the newest stored record
        store.reads_down.store(true, Ordering::SeqCst);
        let second = HistoryRecorder::new(store.clone(), fast_config());
        let parked = second
            .append(HistoryRecord::new(process_id, "alice", HistoryAction::NodeStarted))
            .await;
        assert_eq!(parked.sequence, 0);
        store.reads_down.store(false, Ordering::SeqCst);
        // Queued behind the unstamped record even though reads work again
        second
            .append(HistoryRecord::new(process_id, "alice", HistoryAction::TaskCreated))
            .await;
        assert_eq!(second.dead_letter_count(), 2);
        assert_eq!(stored_sequences(&second, process_id).await, vec![1, 2]);

        assert_eq!(second.retry_dead_letters().await, 2);
        assert_eq!(second.dead_letter_count(), 0);
        assert_eq!(stored_sequences(&second, process_id).await, vec![1, 2, 3, 4]);

        let next = second
            .append(HistoryRecord::new(process_id, "alice", HistoryAction::TaskCompleted))
            .await;
        assert_eq!(next.sequence, 5);
    }

    #[tokio::test]
    async fn test_forgotten_cursor_waits_for_parked_records() {
        let store = Arc::new(FlakyStore {
            down: AtomicBool::new(true),
            ..Default::default()
        });
        let recorder = HistoryRecorder::new(store.clone(), fast_config());
        let process_id = Uuid::new_v4();

        let stamped = recorder
            .append(HistoryRecord::new(process_id, "alice", HistoryAction::ProcessCompleted))
            .await;
        assert_eq!(stamped.sequence, 1);
        recorder.forget(process_id);
        assert_eq!(recorder.tracked_processes(), 0);

        store.down.store(false, Ordering::SeqCst);
        let parked = recorder
            .append(HistoryRecord::new(process_id, "alice", HistoryAction::TaskApproved))
            .await;
        assert_eq!(parked.sequence, 0);

        assert_eq!(recorder.retry_dead_letters().await, 2);
        assert_eq!(stored_sequences(&recorder, process_id).await, vec![1, 2]);
    }
}
