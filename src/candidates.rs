//! Supply of candidate identifiers for the engine.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// Answer of a [`CandidateSource`] when asked for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextCandidate {
    /// A candidate to probe.
    Ready(String),
    /// Nothing available right now; ask again later.
    Pending,
    /// No more candidates will ever come.
    Exhausted,
}

/// Produces candidates one at a time and takes back unfinished ones.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Pull the next candidate.
    async fn next(&self) -> NextCandidate;

    /// Return a candidate that could not be finished, for a later pass.
    async fn requeue(&self, candidate: String);
}

/// In-memory FIFO of candidates.
///
/// While open, an empty queue answers `Pending`; once closed and drained it
/// answers `Exhausted`. Requeued candidates go to the back.
#[derive(Debug, Default)]
pub struct QueueCandidates {
    queue: Mutex<VecDeque<String>>,
    closed: AtomicBool,
}

impl QueueCandidates {
    /// Create an open, empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a closed queue holding exactly `candidates`.
    pub fn from_list<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue = Self::new();
        queue.extend(candidates);
        queue.close();
        queue
    }

    /// Append candidates.
    pub fn extend<I, S>(&self, candidates: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queue
            .lock()
            .extend(candidates.into_iter().map(Into::into));
    }

    /// Mark the queue as complete: once drained it reports `Exhausted`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Candidates waiting in the queue.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether no candidate is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Remove and return every waiting candidate.
    pub fn drain(&self) -> Vec<String> {
        self.queue.lock().drain(..).collect()
    }
}

#[async_trait]
impl CandidateSource for QueueCandidates {
    async fn next(&self) -> NextCandidate {
        match self.queue.lock().pop_front() {
            Some(candidate) => NextCandidate::Ready(candidate),
            None if self.closed.load(Ordering::Acquire) => NextCandidate::Exhausted,
            None => NextCandidate::Pending,
        }
    }

    async fn requeue(&self, candidate: String) {
        self.queue.lock().push_back(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_queue_is_pending_until_closed() {
        let queue = QueueCandidates::new();
        assert_eq!(queue.next().await, NextCandidate::Pending);

        queue.extend(["neo"]);
        assert_eq!(queue.next().await, NextCandidate::Ready("neo".to_string()));

        queue.close();
        assert_eq!(queue.next().await, NextCandidate::Exhausted);
    }

    #[tokio::test]
    async fn requeued_candidates_come_back_last() {
        let queue = QueueCandidates::from_list(["a", "b"]);
        let first = queue.next().await;
        assert_eq!(first, NextCandidate::Ready("a".to_string()));

        queue.requeue("a".to_string()).await;
        assert_eq!(queue.drain(), vec!["b", "a"]);
        assert_eq!(queue.next().await, NextCandidate::Exhausted);
    }
}
