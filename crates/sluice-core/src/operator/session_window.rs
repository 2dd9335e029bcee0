//! # Session Window Operator
//!
//! Groups events into variable-length sessions separated by inactivity
//! gaps. Unlike tumbling and sliding windows with fixed boundaries, session
//! windows grow with activity and close once no event arrives within the
//! gap period.
//!
//! ## Key Characteristics
//!
//! - **Dynamic boundaries**: a session starts with its first event and
//!   extends with each event inside the gap
//! - **Per-key tracking**: each key maintains an independent window list
//! - **Session merging**: an event bridging two windows merges them
//! - **Watermark-driven emission**: a window is emitted once the watermark
//!   passes its end; memory is bounded by live sessions only
//!
//! ## Example
//!
//! ```text
//! Timeout: 30
//!
//! Events: [t=0] [t=10] [t=20]  ...gap...  [t=100] [t=110]
//!         |<---- Session 1 ---->|         |<- Session 2 ->|
//!         [0, 50)                         [100, 140)
//! ```
//!
//! Every window mutation keeps the deadline index (`end -> keys`) in
//! lock-step, so a watermark resolves the affected keys in O(log d).

use std::collections::BTreeMap;
use std::hash::Hash;

use fxhash::{FxHashMap, FxHashSet};

use super::{OperatorError, Session, SessionVec};
use crate::time::Watermark;

/// Configuration for a [`SessionWindowOperator`].
///
/// The operator treats events as opaque: timestamp and key extraction plus
/// the whole accumulation lifecycle are supplied as function fields.
pub struct SessionWindowConfig<T, K, A, R> {
    /// Inactivity gap that separates sessions. Must be positive.
    pub session_timeout: i64,
    /// Extracts the event-time timestamp from an event.
    pub timestamp_fn: Box<dyn Fn(&T) -> i64 + Send>,
    /// Extracts the grouping key from an event.
    pub key_fn: Box<dyn Fn(&T) -> K + Send>,
    /// Creates a fresh accumulator for a new window.
    pub new_acc: Box<dyn Fn() -> A + Send>,
    /// Folds one event into a window's accumulator.
    pub accumulate: Box<dyn Fn(&mut A, &T) + Send>,
    /// Merges the right window's accumulator into the left's.
    pub combine: Box<dyn Fn(&mut A, A) + Send>,
    /// Converts an accumulator into the emitted session result.
    pub finish: Box<dyn Fn(A) -> R + Send>,
}

/// Ordered index from window end timestamp to the keys owning a window
/// with exactly that end.
struct DeadlineIndex<K> {
    map: BTreeMap<i64, FxHashSet<K>>,
}

impl<K: Clone + Eq + Hash> DeadlineIndex<K> {
    fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    fn insert(&mut self, deadline: i64, key: &K) {
        self.map.entry(deadline).or_default().insert(key.clone());
    }

    fn remove(&mut self, deadline: i64, key: &K) {
        if let Some(keys) = self.map.get_mut(&deadline) {
            keys.remove(key);
            if keys.is_empty() {
                self.map.remove(&deadline);
            }
        }
    }

    /// Removes every entry with `deadline < wm` and returns the distinct
    /// keys they referenced.
    fn take_expired(&mut self, wm: i64) -> Vec<K> {
        let live = self.map.split_off(&wm);
        let expired = std::mem::replace(&mut self.map, live);

        let mut seen = FxHashSet::default();
        let mut keys = Vec::new();
        for key in expired.into_values().flatten() {
            if !seen.contains(&key) {
                seen.insert(key.clone());
                keys.push(key);
            }
        }
        keys
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Per-key window list in three parallel arrays, sorted by `start`.
///
/// Windows never overlap and adjacent windows satisfy
/// `ends[i] < starts[i + 1]`. Keeping starts, ends, and accumulators in
/// separate contiguous arrays avoids per-window allocations; head removal
/// on emission compacts in place.
struct WindowSet<A> {
    starts: Vec<i64>,
    ends: Vec<i64>,
    accs: Vec<A>,
}

impl<A> WindowSet<A> {
    fn new() -> Self {
        Self {
            starts: Vec::with_capacity(2),
            ends: Vec::with_capacity(2),
            accs: Vec::with_capacity(2),
        }
    }

    fn len(&self) -> usize {
        self.starts.len()
    }

    /// Finds or creates the window absorbing an event at `timestamp` and
    /// returns its index. Keeps `deadlines` consistent with every end
    /// mutation.
    fn resolve<K: Clone + Eq + Hash>(
        &mut self,
        deadlines: &mut DeadlineIndex<K>,
        key: &K,
        timestamp: i64,
        timeout: i64,
        new_acc: &(dyn Fn() -> A + Send),
        combine: &(dyn Fn(&mut A, A) + Send),
    ) -> usize {
        // Window ends stay strictly below Watermark::MAX, so the completion
        // watermark closes every window under the `end < wm` rule.
        let event_end = timestamp.saturating_add(timeout).min(i64::MAX - 1);
        let mut i = 0;
        while i < self.len() && self.starts[i] <= event_end {
            // the window `i` is not after the event interval

            if self.ends[i] < timestamp {
                // the window `i` is before the event interval
                i += 1;
                continue;
            }
            if self.starts[i] <= timestamp && self.ends[i] >= event_end {
                // the window `i` fully covers the event interval
                return i;
            }
            // the window `i` overlaps the event interval

            if i + 1 == self.len() || self.starts[i + 1] > event_end {
                // the window `i + 1` doesn't overlap the event interval
                self.starts[i] = self.starts[i].min(timestamp);
                if self.ends[i] < event_end {
                    deadlines.remove(self.ends[i], key);
                    self.ends[i] = event_end;
                    deadlines.insert(event_end, key);
                }
                return i;
            }
            // both `i` and `i + 1` overlap the event interval; merge them.
            // The merged window fully covers the event interval: windows are
            // at least `timeout` long, so `starts[i + 1] <= event_end`
            // forces `timestamp >= starts[i]` and `ends[i + 1] >= event_end`.
            deadlines.remove(self.ends[i], key);
            let merged_end = self.ends.remove(i + 1);
            self.ends[i] = merged_end;
            self.starts.remove(i + 1);
            let right = self.accs.remove(i + 1);
            combine(&mut self.accs[i], right);
            return i;
        }
        deadlines.insert(event_end, key);
        self.starts.insert(i, timestamp);
        self.ends.insert(i, event_end);
        self.accs.insert(i, new_acc());
        i
    }

    /// Emits every window with `end < wm` into `out` and compacts the head.
    /// Returns true if the set is now empty.
    fn close_into<K: Clone, R>(
        &mut self,
        key: &K,
        wm: i64,
        finish: &(dyn Fn(A) -> R + Send),
        out: &mut SessionVec<K, R>,
    ) -> bool {
        let mut n = 0;
        while n < self.len() && self.ends[n] < wm {
            n += 1;
        }
        for ((start, end), acc) in self
            .starts
            .drain(..n)
            .zip(self.ends.drain(..n))
            .zip(self.accs.drain(..n))
        {
            out.push(Session {
                key: key.clone(),
                start,
                end,
                result: finish(acc),
            });
        }
        self.starts.is_empty()
    }
}

/// Session window operator.
///
/// Groups events by activity periods separated by gaps. Each unique key
/// maintains its own sorted window list independently; a single ordered
/// deadline index across all keys makes watermark handling proportional to
/// the windows actually closing.
///
/// # Session Lifecycle
///
/// 1. **Start**: first event for a key creates a window `[t, t + timeout)`
/// 2. **Extend**: events inside the gap stretch the covering window
/// 3. **Merge**: an event bridging two windows merges them, combining
///    accumulators
/// 4. **Close**: a watermark past a window's end emits it and releases its
///    state
///
/// # Contract with the host
///
/// Watermarks must be monotonically non-decreasing; the operator is correct
/// only under that contract and does not detect regressions. Emitted
/// sessions are returned sorted by non-decreasing `end`.
pub struct SessionWindowOperator<T, K, A, R> {
    config: SessionWindowConfig<T, K, A, R>,
    /// Active window lists by key.
    keyed: FxHashMap<K, WindowSet<A>>,
    /// Window end -> keys, kept in lock-step with every end mutation.
    deadlines: DeadlineIndex<K>,
}

impl<T, K, A, R> SessionWindowOperator<T, K, A, R>
where
    K: Clone + Eq + Hash,
{
    /// Creates a new session window operator.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::ConfigError` if `session_timeout` is not
    /// positive.
    pub fn new(config: SessionWindowConfig<T, K, A, R>) -> Result<Self, OperatorError> {
        if config.session_timeout <= 0 {
            return Err(OperatorError::ConfigError(format!(
                "session timeout must be positive, got {}",
                config.session_timeout
            )));
        }
        Ok(Self {
            config,
            keyed: FxHashMap::default(),
            deadlines: DeadlineIndex::new(),
        })
    }

    /// Ingests one event.
    ///
    /// Performs at most one window mutation plus at most two deadline-index
    /// updates: O(w + log d) for w windows of this key and d distinct
    /// deadlines.
    pub fn accept(&mut self, item: &T) {
        let timestamp = (self.config.timestamp_fn)(item);
        let key = (self.config.key_fn)(item);
        let windows = self.keyed.entry(key.clone()).or_insert_with(WindowSet::new);
        let idx = windows.resolve(
            &mut self.deadlines,
            &key,
            timestamp,
            self.config.session_timeout,
            self.config.new_acc.as_ref(),
            self.config.combine.as_ref(),
        );
        (self.config.accumulate)(&mut windows.accs[idx], item);
    }

    /// Ingests a watermark, emitting every session whose window end is
    /// strictly below it.
    ///
    /// A watermark that does not advance emits nothing and leaves no trace;
    /// keys whose last window was emitted are released entirely. Returned
    /// sessions are sorted by non-decreasing `end`.
    pub fn accept_watermark(&mut self, wm: Watermark) -> SessionVec<K, R> {
        let mut out = SessionVec::new();
        for key in self.deadlines.take_expired(wm.timestamp()) {
            if let Some(windows) = self.keyed.get_mut(&key) {
                let emptied =
                    windows.close_into(&key, wm.timestamp(), self.config.finish.as_ref(), &mut out);
                if emptied {
                    self.keyed.remove(&key);
                }
            }
        }
        out.sort_by_key(|session| session.end);
        out
    }

    /// Flushes every remaining session, equivalent to a `+∞` watermark.
    pub fn complete(&mut self) -> SessionVec<K, R> {
        self.accept_watermark(Watermark::MAX)
    }

    /// Number of keys with at least one active window.
    #[must_use]
    pub fn active_key_count(&self) -> usize {
        self.keyed.len()
    }

    /// Number of distinct deadlines currently indexed.
    #[must_use]
    pub fn deadline_entry_count(&self) -> usize {
        self.deadlines.len()
    }
}
