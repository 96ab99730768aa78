//! Cooperative work scheduling
//!
//! The engine is single-threaded: "asynchronous" work is a queue of
//! bounded jobs drained by explicit [`WorkQueue::step`] calls (a host
//! would pump this from its idle loop). Each step is one reparse or one
//! tokenization chunk, so forward progress is guaranteed and tests can
//! drive the queue deterministically without wall-clock timers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default wall-clock budget before a pump voluntarily yields
pub const DEFAULT_YIELD_BUDGET: Duration = Duration::from_millis(50);

/// Maximum lines per background tokenization chunk
pub const MAX_CHUNK_LINES: usize = 1000;

/// A unit of deferred work, stamped with the buffer version it was
/// scheduled against. Stale jobs are dropped at the start of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Incremental reparse of the whole (or restricted) buffer
    Reparse { version: u64 },
    /// Tokenize one chunk of changed lines from the current tree
    TokenizeChunk {
        start_line: usize,
        end_line: usize,
        version: u64,
    },
}

impl Job {
    pub fn version(&self) -> u64 {
        match self {
            Job::Reparse { version } => *version,
            Job::TokenizeChunk { version, .. } => *version,
        }
    }
}

/// Bounded execution budget for a pump of the queue.
///
/// Wall-clock by default; tests use [`StepBudget::steps`] for determinism
/// or [`StepBudget::unlimited`] to run to quiescence.
#[derive(Debug)]
pub struct StepBudget {
    deadline: Option<Instant>,
    steps_left: Option<u32>,
}

impl StepBudget {
    /// Yield after roughly `duration` of wall time
    pub fn wall(duration: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + duration),
            steps_left: None,
        }
    }

    /// Yield after exactly `n` steps
    pub fn steps(n: u32) -> Self {
        Self {
            deadline: None,
            steps_left: Some(n),
        }
    }

    /// Never yield (run to quiescence)
    pub fn unlimited() -> Self {
        Self {
            deadline: None,
            steps_left: None,
        }
    }

    /// Consume one step; returns true when the budget still allows more
    pub fn consume(&mut self) -> bool {
        if let Some(steps) = &mut self.steps_left {
            if *steps == 0 {
                return false;
            }
            *steps -= 1;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return false;
            }
        }
        true
    }
}

impl Default for StepBudget {
    fn default() -> Self {
        Self::wall(DEFAULT_YIELD_BUDGET)
    }
}

/// FIFO queue of pending jobs with replace-pending-reparse semantics.
#[derive(Debug, Default)]
pub struct WorkQueue {
    jobs: VecDeque<Job>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
        }
    }

    /// Schedule a reparse, replacing any pending one (a newer edit
    /// supersedes the older reparse entirely).
    pub fn schedule_reparse(&mut self, version: u64) {
        self.jobs.retain(|j| !matches!(j, Job::Reparse { .. }));
        self.jobs.push_back(Job::Reparse { version });
    }

    /// Queue one tokenization chunk
    pub fn schedule_chunk(&mut self, start_line: usize, end_line: usize, version: u64) {
        self.jobs.push_back(Job::TokenizeChunk {
            start_line,
            end_line,
            version,
        });
    }

    /// Split a line range into ≤ MAX_CHUNK_LINES chunks and queue them all
    pub fn schedule_chunked_range(&mut self, start_line: usize, end_line: usize, version: u64) {
        let mut line = start_line;
        while line < end_line {
            let chunk_end = (line + MAX_CHUNK_LINES).min(end_line);
            self.schedule_chunk(line, chunk_end, version);
            line = chunk_end;
        }
    }

    /// Take the next job whose version is still `current_version`;
    /// stale jobs are dropped on the way.
    pub fn next_current(&mut self, current_version: u64) -> Option<Job> {
        while let Some(job) = self.jobs.pop_front() {
            if job.version() == current_version {
                return Some(job);
            }
            tracing::trace!("Dropping stale job {:?} (buffer at v{})", job, current_version);
        }
        None
    }

    /// Drop every queued job (disposal, dependency teardown)
    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
