//! Timer Queries & Range Timers
//!
//! A [`Query`] measures the GPU time between a `begin_query` and an
//! `end_query` command, plus the CPU time the backend spent replaying the
//! commands in between.
//!
//! A [`RangeTimer`] owns a small ring of queries so that results of previous
//! frames can be read while the current frame's queries are still in flight:
//!
//! ```text
//!   frame:   N-3    N-2    N-1     N
//!   ring:  [ q0 ] [ q1 ] [ q2 ] [ q3 ]
//!            ▲                    ▲
//!          tail (sampled)        head (recording)
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::batch::Batch;
use crate::resources::{GpuObject, ResourceId};

/// Number of queries in flight per range timer.
pub const QUERY_QUEUE_SIZE: usize = 4;

/// Last measured durations of a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub gpu_elapsed_ns: u64,
    pub batch_elapsed_ns: u64,
}

/// A GPU timer query.
#[derive(Debug)]
pub struct Query {
    id: ResourceId,
    name: String,
    result: Mutex<QueryResult>,
}

impl GpuObject for Query {
    fn id(&self) -> ResourceId {
        self.id
    }
}

impl Query {
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::next(),
            name: name.to_string(),
            result: Mutex::new(QueryResult::default()),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn result(&self) -> QueryResult {
        *self.result.lock()
    }

    /// GPU time in milliseconds.
    #[must_use]
    pub fn gpu_elapsed(&self) -> f64 {
        self.result().gpu_elapsed_ns as f64 / 1e6
    }

    /// Backend replay time in milliseconds.
    #[must_use]
    pub fn batch_elapsed(&self) -> f64 {
        self.result().batch_elapsed_ns as f64 / 1e6
    }

    pub(crate) fn set_result(&self, result: QueryResult) {
        *self.result.lock() = result;
    }
}

/// Windowed average over the last `N` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage<const N: usize> {
    samples: [f64; N],
    count: usize,
    next: usize,
}

impl<const N: usize> Default for MovingAverage<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MovingAverage<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            samples: [0.0; N],
            count: 0,
            next: 0,
        }
    }

    pub fn add_sample(&mut self, sample: f64) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % N;
        self.count = (self.count + 1).min(N);
    }

    #[must_use]
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.samples[..self.count].iter().sum::<f64>() / self.count as f64
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Debug, Default)]
struct RangeTimerState {
    head: Option<usize>,
    tail: Option<usize>,
    gpu_average: MovingAverage<{ QUERY_QUEUE_SIZE * 2 }>,
    batch_average: MovingAverage<{ QUERY_QUEUE_SIZE * 2 }>,
}

/// Brackets a range of recorded commands with a rotating timer query.
///
/// `begin` and `end` must be recorded in pairs within one frame. An `end`
/// with no preceding `begin` records nothing.
#[derive(Debug)]
pub struct RangeTimer {
    name: String,
    queries: Vec<Arc<Query>>,
    state: Mutex<RangeTimerState>,
}

impl RangeTimer {
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        let queries = (0..QUERY_QUEUE_SIZE)
            .map(|i| Query::new(&format!("{name}[{i}]")))
            .collect();
        Arc::new(Self {
            name: name.to_string(),
            queries,
            state: Mutex::new(RangeTimerState::default()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn begin(&self, batch: &mut Batch) {
        let mut state = self.state.lock();
        let head = state.head.map_or(0, |h| h + 1);
        state.head = Some(head);
        batch.begin_query(&self.queries[head % QUERY_QUEUE_SIZE]);
    }

    pub fn end(&self, batch: &mut Batch) {
        let mut state = self.state.lock();
        let Some(head) = state.head else {
            log::debug!("RangeTimer '{}': end without begin", self.name);
            return;
        };
        batch.end_query(&self.queries[head % QUERY_QUEUE_SIZE]);

        let tail = *state.tail.get_or_insert(head);
        // Sample the oldest query whose result had time to come back.
        if head > tail {
            let query = &self.queries[tail % QUERY_QUEUE_SIZE];
            state.gpu_average.add_sample(query.gpu_elapsed());
            state.batch_average.add_sample(query.batch_elapsed());
            state.tail = Some(tail + 1);
        }
    }

    /// Average GPU time of the range in milliseconds.
    #[must_use]
    pub fn gpu_elapsed_average(&self) -> f64 {
        self.state.lock().gpu_average.average()
    }

    /// Average backend replay time of the range in milliseconds.
    #[must_use]
    pub fn batch_elapsed_average(&self) -> f64 {
        self.state.lock().batch_average.average()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Command;

    #[test]
    fn moving_average_uses_window() {
        let mut avg = MovingAverage::<2>::new();
        assert!(avg.is_empty());
        avg.add_sample(1.0);
        avg.add_sample(3.0);
        assert!((avg.average() - 2.0).abs() < 1e-9);
        avg.add_sample(5.0);
        assert!((avg.average() - 4.0).abs() < 1e-9);
        assert_eq!(avg.len(), 2);
    }

    #[test]
    fn range_timer_rotates_queries() {
        let timer = RangeTimer::new("t");
        let mut seen = Vec::new();
        for _ in 0..QUERY_QUEUE_SIZE + 1 {
            let mut batch = Batch::new("timer");
            timer.begin(&mut batch);
            timer.end(&mut batch);
            let Command::BeginQuery(index) = batch.commands()[0] else {
                panic!("expected a begin query command");
            };
            seen.push(batch.queries().get(index).id());
        }
        assert_ne!(seen[0], seen[1]);
        assert_eq!(seen[0], seen[QUERY_QUEUE_SIZE]);
    }

    #[test]
    fn end_without_begin_records_nothing() {
        let timer = RangeTimer::new("lonely");
        let mut batch = Batch::new("b");
        timer.end(&mut batch);
        assert!(batch.commands().is_empty());
    }
}
