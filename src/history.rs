//! Per-user state owned outside the engine.
//!
//! The engine never keeps global maps of its own. Message buffers, the
//! violation log, message counts and split-detection history all go through
//! [`UserHistoryStore`], which is injected at construction time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShieldError};
use crate::models::{ChatType, SplitPhoneDetection, ViolationRecord};

/// A message kept in a rolling buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub text: String,
    pub chat_id: String,
    pub chat_type: ChatType,
    pub timestamp: DateTime<Utc>,
}

/// Buffer key for a user's filter history.
pub fn filter_key(user_id: &str) -> String {
    format!("filter:{}", user_id)
}

/// Buffer key for a user's messages in one chat.
pub fn split_key(user_id: &str, chat_id: &str) -> String {
    format!("split:{}:{}", user_id, chat_id)
}

/// Storage for all per-user moderation state.
///
/// Every `push_*` must be atomic with respect to other pushes on the same key.
pub trait UserHistoryStore: Send + Sync {
    /// Buffered messages under `key`, oldest first.
    fn messages(&self, key: &str) -> Vec<StoredMessage>;

    /// Append to a buffer, evicting the oldest entries beyond `capacity`.
    fn push_message(&self, key: &str, message: StoredMessage, capacity: usize);

    /// Empty the buffer under `key`.
    fn clear_messages(&self, key: &str);

    /// The user's full violation log, oldest first.
    fn violations(&self, user_id: &str) -> Vec<ViolationRecord>;

    fn push_violation(&self, record: ViolationRecord);

    /// Messages counted for the user, `None` if never seen.
    fn message_count(&self, user_id: &str) -> Option<u64>;

    /// Count one more message and return the new total.
    fn increment_message_count(&self, user_id: &str) -> u64;

    /// Overwrite the count with an authoritative value.
    fn set_message_count(&self, user_id: &str, count: u64);

    /// Split detections recorded for the user, oldest first.
    fn detections(&self, user_id: &str) -> Vec<SplitPhoneDetection>;

    fn push_detection(&self, user_id: &str, detection: SplitPhoneDetection, capacity: usize);

    /// Drop buffered messages older than `cutoff`. Returns buffers removed.
    fn prune_messages(&self, cutoff: DateTime<Utc>) -> usize;

    /// Drop detections older than `cutoff`.
    fn prune_detections(&self, cutoff: DateTime<Utc>);

    /// Number of users with a message count.
    fn user_count(&self) -> usize;
}

/// Per-user mutexes for check-then-write sequences.
///
/// Store pushes are atomic on their own, but a decision read from the store
/// followed by a write is not. Callers hold the user's lock across both.
#[derive(Default)]
pub struct UserLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding `user_id`'s lock.
    pub fn with_user<T>(&self, user_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.locks.entry(user_id.to_string()).or_default().clone();
        let _guard = lock
            .lock()
            .map_err(|_| ShieldError::InternalState("user lock poisoned".to_string()))?;
        f()
    }

    /// Drop locks nobody holds. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

fn push_capped<T>(buf: &mut VecDeque<T>, item: T, capacity: usize) {
    buf.push_back(item);
    while buf.len() > capacity {
        buf.pop_front();
    }
}

/// Process-local store backed by dashmap.
///
/// Suitable for tests and single-process deployments. Buffers stay until
/// [`UserHistoryStore::prune_messages`] removes them.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    buffers: DashMap<String, VecDeque<StoredMessage>>,
    violations: DashMap<String, Vec<ViolationRecord>>,
    counts: DashMap<String, u64>,
    detections: DashMap<String, VecDeque<SplitPhoneDetection>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserHistoryStore for InMemoryHistoryStore {
    fn messages(&self, key: &str) -> Vec<StoredMessage> {
        self.buffers
            .get(key)
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn push_message(&self, key: &str, message: StoredMessage, capacity: usize) {
        let mut buf = self.buffers.entry(key.to_string()).or_default();
        push_capped(&mut *buf, message, capacity);
    }

    fn clear_messages(&self, key: &str) {
        self.buffers.remove(key);
    }

    fn violations(&self, user_id: &str) -> Vec<ViolationRecord> {
        self.violations
            .get(user_id)
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }

    fn push_violation(&self, record: ViolationRecord) {
        self.violations
            .entry(record.user_id.clone())
            .or_default()
            .push(record);
    }

    fn message_count(&self, user_id: &str) -> Option<u64> {
        self.counts.get(user_id).map(|c| *c)
    }

    fn increment_message_count(&self, user_id: &str) -> u64 {
        let mut count = self.counts.entry(user_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn set_message_count(&self, user_id: &str, count: u64) {
        self.counts.insert(user_id.to_string(), count);
    }

    fn detections(&self, user_id: &str) -> Vec<SplitPhoneDetection> {
        self.detections
            .get(user_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn push_detection(&self, user_id: &str, detection: SplitPhoneDetection, capacity: usize) {
        let mut buf = self.detections.entry(user_id.to_string()).or_default();
        push_capped(&mut *buf, detection, capacity);
    }

    fn prune_messages(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|_, buf| {
            while buf.front().is_some_and(|m| m.timestamp < cutoff) {
                buf.pop_front();
            }
            !buf.is_empty()
        });
        before - self.buffers.len()
    }

    fn prune_detections(&self, cutoff: DateTime<Utc>) {
        self.detections.retain(|_, buf| {
            while buf.front().is_some_and(|d| d.detected_at < cutoff) {
                buf.pop_front();
            }
            !buf.is_empty()
        });
    }

    fn user_count(&self) -> usize {
        self.counts.len()
    }
}

/// Store whose message buffers and detection history expire on their own.
///
/// Buffers idle longer than `buffer_idle` and detection lists older than
/// `detection_ttl` are evicted by moka. The violation log and message counts
/// are durable for the lifetime of the process.
pub struct TtlHistoryStore {
    buffers: Cache<String, VecDeque<StoredMessage>>,
    detections: Cache<String, VecDeque<SplitPhoneDetection>>,
    violations: DashMap<String, Vec<ViolationRecord>>,
    counts: DashMap<String, u64>,
}

impl TtlHistoryStore {
    /// Create a store with the given buffer idle time and detection TTL.
    ///
    /// Capacities:
    /// - Buffers: 100,000 user-chat pairs
    /// - Detections: 50,000 users
    pub fn new(buffer_idle: Duration, detection_ttl: Duration) -> Self {
        Self {
            buffers: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(buffer_idle)
                .build(),
            detections: Cache::builder()
                .max_capacity(50_000)
                .time_to_live(detection_ttl)
                .build(),
            violations: DashMap::new(),
            counts: DashMap::new(),
        }
    }
}

impl Default for TtlHistoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), Duration::from_secs(86_400))
    }
}

impl UserHistoryStore for TtlHistoryStore {
    fn messages(&self, key: &str) -> Vec<StoredMessage> {
        self.buffers
            .get(key)
            .map(|buf| buf.into_iter().collect())
            .unwrap_or_default()
    }

    fn push_message(&self, key: &str, message: StoredMessage, capacity: usize) {
        self.buffers
            .entry(key.to_string())
            .and_upsert_with(|existing| {
                let mut buf = existing.map(|e| e.into_value()).unwrap_or_default();
                push_capped(&mut buf, message, capacity);
                buf
            });
    }

    fn clear_messages(&self, key: &str) {
        self.buffers.invalidate(key);
    }

    fn violations(&self, user_id: &str) -> Vec<ViolationRecord> {
        self.violations
            .get(user_id)
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }

    fn push_violation(&self, record: ViolationRecord) {
        self.violations
            .entry(record.user_id.clone())
            .or_default()
            .push(record);
    }

    fn message_count(&self, user_id: &str) -> Option<u64> {
        self.counts.get(user_id).map(|c| *c)
    }

    fn increment_message_count(&self, user_id: &str) -> u64 {
        let mut count = self.counts.entry(user_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn set_message_count(&self, user_id: &str, count: u64) {
        self.counts.insert(user_id.to_string(), count);
    }

    fn detections(&self, user_id: &str) -> Vec<SplitPhoneDetection> {
        self.detections
            .get(user_id)
            .map(|d| d.into_iter().collect())
            .unwrap_or_default()
    }

    fn push_detection(&self, user_id: &str, detection: SplitPhoneDetection, capacity: usize) {
        self.detections
            .entry(user_id.to_string())
            .and_upsert_with(|existing| {
                let mut buf = existing.map(|e| e.into_value()).unwrap_or_default();
                push_capped(&mut buf, detection, capacity);
                buf
            });
    }

    fn prune_messages(&self, cutoff: DateTime<Utc>) -> usize {
        let stale: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, buf)| buf.back().map_or(true, |m| m.timestamp < cutoff))
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in &stale {
            self.buffers.invalidate(key);
        }
        self.buffers.run_pending_tasks();
        stale.len()
    }

    fn prune_detections(&self, _cutoff: DateTime<Utc>) {
        // Expiry is handled by the cache TTL.
        self.detections.run_pending_tasks();
    }

    fn user_count(&self) -> usize {
        self.counts.len()
    }
}
