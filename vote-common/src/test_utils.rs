//! In-memory stand-ins for the event log and the counter store.
//!
//! They follow the consumer group and counter semantics closely enough to drive the
//! whole pipeline in tests, and can be told to fail on demand.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::counter::{CounterError, CounterStore, VoteCount, VoteTally};
use crate::stream::{EventLog, GroupRead, GroupStatus, StreamError, StreamMessage};
use crate::vote::{VoteEvent, VoteOption};

/// Global order in which test doubles were closed.
static CLOSE_SEQUENCE: AtomicUsize = AtomicUsize::new(1);

fn next_close_sequence() -> usize {
    CLOSE_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the first entry never delivered to this group.
    next_undelivered: usize,
    /// Delivered but unacknowledged entries, keyed by their index in the stream.
    pending: BTreeMap<usize, PendingEntry>,
}

#[derive(Debug, Default)]
struct LogState {
    streams: HashMap<String, Vec<StreamMessage>>,
    groups: HashMap<(String, String), GroupState>,
    next_id: u64,
    acks: Vec<String>,
    reads: u32,
    read_failures: u32,
    ack_failures: u32,
    closed_sequence: Option<usize>,
}

impl LogState {
    fn index_of(&self, stream: &str, id: &str) -> Option<usize> {
        self.streams
            .get(stream)?
            .iter()
            .position(|message| message.id == id)
    }

    fn take_new(&mut self, read: &GroupRead<'_>) -> Result<Vec<StreamMessage>, StreamError> {
        let entries = self.streams.get(read.stream).cloned().unwrap_or_default();
        let group = self
            .groups
            .get_mut(&(read.stream.to_owned(), read.group.to_owned()))
            .ok_or_else(|| StreamError::Unavailable(format!("NOGROUP {}", read.group)))?;

        let end = entries.len().min(group.next_undelivered + read.count);
        let now = Instant::now();
        let delivered: Vec<StreamMessage> = (group.next_undelivered..end)
            .map(|index| {
                group.pending.insert(
                    index,
                    PendingEntry {
                        consumer: read.consumer.to_owned(),
                        delivered_at: now,
                        deliveries: 1,
                    },
                );
                entries[index].clone()
            })
            .collect();
        group.next_undelivered = end;

        Ok(delivered)
    }
}

/// An `EventLog` keeping streams and consumer groups in memory.
#[derive(Clone, Default)]
pub struct MemoryEventLog {
    state: Arc<Mutex<LogState>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        lock(&self.state)
    }

    fn check_open(state: &LogState) -> Result<(), StreamError> {
        match state.closed_sequence {
            Some(_) => Err(StreamError::Unavailable("client closed".to_owned())),
            None => Ok(()),
        }
    }

    /// Append an entry with arbitrary fields, such as a malformed vote.
    pub fn append_fields(&self, stream: &str, fields: &[(&str, &str)]) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("{}-0", state.next_id);
        let message = StreamMessage {
            id: id.clone(),
            fields: fields
                .iter()
                .map(|(field, value)| (field.to_string(), value.to_string()))
                .collect(),
        };
        state
            .streams
            .entry(stream.to_owned())
            .or_default()
            .push(message);
        id
    }

    /// Fail the next `n` calls to `read_group`.
    pub fn fail_next_reads(&self, n: u32) {
        self.state().read_failures = n;
    }

    /// Fail the next `n` calls to `ack`.
    pub fn fail_next_acks(&self, n: u32) {
        self.state().ack_failures = n;
    }

    /// Every id passed to a successful `ack`, in call order.
    pub fn acked(&self) -> Vec<String> {
        self.state().acks.clone()
    }

    /// Ids pending in the group, in stream order.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<String> {
        let state = self.state();
        let Some(entries) = state.streams.get(stream) else {
            return Vec::new();
        };
        state
            .groups
            .get(&(stream.to_owned(), group.to_owned()))
            .map(|group| {
                group
                    .pending
                    .keys()
                    .map(|index| entries[*index].id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The consumer currently holding a pending id, and how many times it was delivered.
    pub fn pending_owner(&self, stream: &str, group: &str, id: &str) -> Option<(String, u32)> {
        let state = self.state();
        let index = state.index_of(stream, id)?;
        state
            .groups
            .get(&(stream.to_owned(), group.to_owned()))?
            .pending
            .get(&index)
            .map(|entry| (entry.consumer.clone(), entry.deliveries))
    }

    pub fn has_group(&self, stream: &str, group: &str) -> bool {
        self.state()
            .groups
            .contains_key(&(stream.to_owned(), group.to_owned()))
    }

    /// Number of `read_group` calls, failed ones included.
    pub fn reads(&self) -> u32 {
        self.state().reads
    }

    /// Position of this client's `close` in the global close order, if it was closed.
    pub fn closed_sequence(&self) -> Option<usize> {
        self.state().closed_sequence
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus, StreamError> {
        let mut state = self.state();
        Self::check_open(&state)?;

        state.streams.entry(stream.to_owned()).or_default();
        let key = (stream.to_owned(), group.to_owned());
        if state.groups.contains_key(&key) {
            return Ok(GroupStatus::AlreadyExists);
        }
        state.groups.insert(key, GroupState::default());
        Ok(GroupStatus::Created)
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<StreamMessage>, StreamError> {
        let deadline = Instant::now() + read.block;

        {
            let mut state = self.state();
            Self::check_open(&state)?;
            state.reads += 1;
            if state.read_failures > 0 {
                state.read_failures -= 1;
                return Err(StreamError::Unavailable("injected read failure".to_owned()));
            }
        }

        loop {
            let delivered = self.state().take_new(read)?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(5))).await;
        }
    }

    async fn claim_pending(
        &self,
        read: &GroupRead<'_>,
        min_idle: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut state = self.state();
        Self::check_open(&state)?;

        let entries = state.streams.get(read.stream).cloned().unwrap_or_default();
        let group = state
            .groups
            .get_mut(&(read.stream.to_owned(), read.group.to_owned()))
            .ok_or_else(|| StreamError::Unavailable(format!("NOGROUP {}", read.group)))?;

        let now = Instant::now();
        let claimed: Vec<StreamMessage> = group
            .pending
            .iter_mut()
            .filter(|(_, entry)| now.duration_since(entry.delivered_at) >= min_idle)
            .take(read.count)
            .map(|(index, entry)| {
                entry.consumer = read.consumer.to_owned();
                entry.delivered_at = now;
                entry.deliveries += 1;
                entries[*index].clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut state = self.state();
        Self::check_open(&state)?;
        if state.ack_failures > 0 {
            state.ack_failures -= 1;
            return Err(StreamError::Unavailable("injected ack failure".to_owned()));
        }

        if let Some(index) = state.index_of(stream, id) {
            if let Some(group) = state
                .groups
                .get_mut(&(stream.to_owned(), group.to_owned()))
            {
                group.pending.remove(&index);
            }
        }
        state.acks.push(id.to_owned());
        Ok(())
    }

    async fn append(&self, stream: &str, event: &VoteEvent) -> Result<String, StreamError> {
        Self::check_open(&self.state())?;
        let fields = event.to_fields();
        let fields: Vec<(&str, &str)> = fields
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
            .collect();
        Ok(self.append_fields(stream, &fields))
    }

    async fn close(self) {
        self.state().closed_sequence = Some(next_close_sequence());
    }
}

#[derive(Debug, Default)]
struct CounterState {
    counts: HashMap<VoteOption, i64>,
    /// Instant of every increment call, failed ones included.
    attempts: Vec<Instant>,
    failures_left: u32,
    unavailable: bool,
    closed_sequence: Option<usize>,
}

/// A `CounterStore` keeping counts in memory.
#[derive(Clone, Default)]
pub struct MemoryCounterStore {
    state: Arc<Mutex<CounterState>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counts(counts: &[(VoteOption, i64)]) -> Self {
        let store = Self::new();
        store.state().counts = counts.iter().copied().collect();
        store
    }

    fn state(&self) -> MutexGuard<'_, CounterState> {
        lock(&self.state)
    }

    /// Fail the next `n` increments.
    pub fn fail_next(&self, n: u32) {
        self.state().failures_left = n;
    }

    /// Fail every increment until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn count(&self, option: VoteOption) -> i64 {
        self.state().counts.get(&option).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.state().counts.values().sum()
    }

    /// When each increment call was made, failed ones included.
    pub fn attempts(&self) -> Vec<Instant> {
        self.state().attempts.clone()
    }

    pub fn closed_sequence(&self) -> Option<usize> {
        self.state().closed_sequence
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, option: VoteOption) -> Result<VoteCount, CounterError> {
        let mut state = self.state();
        state.attempts.push(Instant::now());

        if state.closed_sequence.is_some() {
            return Err(CounterError::Unavailable("store closed".to_owned()));
        }
        if state.unavailable {
            return Err(CounterError::Unavailable("store is down".to_owned()));
        }
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(CounterError::Unavailable("injected failure".to_owned()));
        }

        let count = state.counts.entry(option).or_insert(0);
        *count += 1;
        Ok(VoteCount {
            option,
            count: *count,
        })
    }

    async fn counts(&self) -> Result<Vec<VoteTally>, CounterError> {
        let state = self.state();
        if state.unavailable {
            return Err(CounterError::Unavailable("store is down".to_owned()));
        }
        let updated_at = Utc::now();
        Ok(VoteOption::ALL
            .iter()
            .map(|option| VoteTally {
                option: *option,
                count: state.counts.get(option).copied().unwrap_or(0),
                updated_at,
            })
            .collect())
    }

    async fn close(self) {
        self.state().closed_sequence = Some(next_close_sequence());
    }
}
