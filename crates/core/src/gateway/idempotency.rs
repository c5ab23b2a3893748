use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::domain::write::{
    IdempotencyKey, IdempotencyRecord, IdempotencyState, WriteId, WriteResult, WriteStatus,
};

pub const INTERRUPTED_REASON: &str = "commit_interrupted";

/// What a commit attempt may do for its idempotency key.
#[derive(Clone, Debug, PartialEq)]
pub enum Reservation {
    /// No prior success; the caller now owns the key and must call `finish`.
    Reserved,
    /// Another commit for this key is running.
    InProgress,
    /// The key already succeeded; carries the stored result.
    Replay(Box<WriteResult>),
}

#[derive(Debug, Default)]
pub struct IdempotencyStore {
    records: Mutex<HashMap<IdempotencyKey, IdempotencyRecord>>,
}

impl IdempotencyStore {
    /// Checks the key and, when free, marks it `processing` in the same critical section.
    pub fn begin(&self, key: &IdempotencyKey, now: DateTime<Utc>) -> Reservation {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(record) = records.get_mut(key) {
            match record.state {
                IdempotencyState::Succeeded => {
                    if let Some(result) = &record.result {
                        return Reservation::Replay(Box::new(result.clone()));
                    }
                }
                IdempotencyState::Processing => return Reservation::InProgress,
                IdempotencyState::Failed => {}
            }

            record.state = IdempotencyState::Processing;
            record.result = None;
            record.attempt_count += 1;
            record.updated_at = now;
            return Reservation::Reserved;
        }

        records.insert(
            key.clone(),
            IdempotencyRecord {
                key: key.clone(),
                state: IdempotencyState::Processing,
                result: None,
                attempt_count: 1,
                first_seen_at: now,
                updated_at: now,
            },
        );
        Reservation::Reserved
    }

    pub fn finish(
        &self,
        key: &IdempotencyKey,
        state: IdempotencyState,
        result: WriteResult,
        now: DateTime<Utc>,
    ) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records.entry(key.clone()).or_insert_with(|| IdempotencyRecord {
            key: key.clone(),
            state,
            result: None,
            attempt_count: 1,
            first_seen_at: now,
            updated_at: now,
        });
        record.state = state;
        record.result = Some(result);
        record.updated_at = now;
    }

    /// Holds a reserved key until the commit settles. If the guard is dropped unsettled (the
    /// commit future was cancelled or the handler panicked) the key is marked `failed` so a
    /// later attempt can reserve it again.
    pub fn hold<'a>(&'a self, key: &'a IdempotencyKey, write_id: WriteId) -> HeldKey<'a> {
        HeldKey { store: self, key, write_id, settled: false }
    }

    pub fn get(&self, key: &IdempotencyKey) -> Option<IdempotencyRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<IdempotencyRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<IdempotencyRecord> = records.values().cloned().collect();
        snapshot.sort_by(|left, right| left.first_seen_at.cmp(&right.first_seen_at));
        snapshot
    }
}

pub struct HeldKey<'a> {
    store: &'a IdempotencyStore,
    key: &'a IdempotencyKey,
    write_id: WriteId,
    settled: bool,
}

impl HeldKey<'_> {
    pub fn settle(mut self, state: IdempotencyState, result: WriteResult) {
        self.settled = true;
        self.store.finish(self.key, state, result, Utc::now());
    }
}

impl Drop for HeldKey<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let result = WriteResult::new(WriteStatus::Failed, self.write_id.clone())
            .with_reason(INTERRUPTED_REASON)
            .with_idempotency_key(Some(self.key.clone()));
        self.store.finish(self.key, IdempotencyState::Failed, result, Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{IdempotencyStore, Reservation, INTERRUPTED_REASON};
    use crate::domain::write::{IdempotencyKey, IdempotencyState, WriteId, WriteResult, WriteStatus};

    fn key() -> IdempotencyKey {
        IdempotencyKey("key-1".to_string())
    }

    #[test]
    fn second_begin_while_processing_is_in_progress() {
        let store = IdempotencyStore::default();
        let now = Utc::now();

        assert_eq!(store.begin(&key(), now), Reservation::Reserved);
        assert_eq!(store.begin(&key(), now), Reservation::InProgress);
    }

    #[test]
    fn succeeded_key_replays_stored_result() {
        let store = IdempotencyStore::default();
        let now = Utc::now();
        let applied = WriteResult::new(WriteStatus::Applied, WriteId("w1".to_string()))
            .with_data(Some(json!({"ok": true})));

        store.begin(&key(), now);
        store.finish(&key(), IdempotencyState::Succeeded, applied.clone(), now);

        assert_eq!(store.begin(&key(), now), Reservation::Replay(Box::new(applied)));
    }

    #[test]
    fn failed_key_can_be_reserved_again() {
        let store = IdempotencyStore::default();
        let now = Utc::now();
        let failed = WriteResult::new(WriteStatus::Failed, WriteId("w1".to_string()))
            .with_reason("IntegrationError:timeout");

        store.begin(&key(), now);
        store.finish(&key(), IdempotencyState::Failed, failed, now);

        assert_eq!(store.begin(&key(), now), Reservation::Reserved);
        let record = store.get(&key()).expect("record should exist");
        assert_eq!(record.state, IdempotencyState::Processing);
        assert_eq!(record.attempt_count, 2);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn unsettled_hold_releases_key_as_failed() {
        let store = IdempotencyStore::default();

        assert_eq!(store.begin(&key(), Utc::now()), Reservation::Reserved);
        drop(store.hold(&key(), WriteId("w1".to_string())));

        let record = store.get(&key()).expect("record should exist");
        assert_eq!(record.state, IdempotencyState::Failed);
        let stored = record.result.expect("interrupted result");
        assert_eq!(stored.reason.as_deref(), Some(INTERRUPTED_REASON));
        assert_eq!(store.begin(&key(), Utc::now()), Reservation::Reserved);
    }

    #[test]
    fn settled_hold_keeps_the_settled_state() {
        let store = IdempotencyStore::default();
        let applied = WriteResult::new(WriteStatus::Applied, WriteId("w1".to_string()));
        let key = key();

        store.begin(&key, Utc::now());
        store.hold(&key, WriteId("w1".to_string())).settle(IdempotencyState::Succeeded, applied);

        let record = store.get(&key).expect("record should exist");
        assert_eq!(record.state, IdempotencyState::Succeeded);
    }
}
