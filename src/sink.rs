//! Destination of probe results.

use crate::prober::ProbeOutcome;

use anyhow::anyhow;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Final word on one candidate, handed to the [`ResultSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Identifier under test.
    pub candidate: String,
    /// Outcome of the last attempt.
    pub outcome: ProbeOutcome,
    /// Attempts made for the candidate.
    pub attempts: u32,
    /// Time spent over all attempts.
    pub latency: Duration,
}

impl ProbeReport {
    /// Whether the candidate ran out of attempts without a clear answer.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Inconclusive(_))
    }

    /// Whether the candidate was found free.
    pub fn is_hit(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Hit(_))
    }
}

/// Consumes probe reports (notification, persistence).
///
/// The engine bounds every call with a timeout, so an implementation may
/// apply backpressure without stalling probing for long.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Deliver one report.
    async fn emit(&self, report: ProbeReport) -> anyhow::Result<()>;
}

/// Sink forwarding reports into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ProbeReport>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProbeReport>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn emit(&self, report: ProbeReport) -> anyhow::Result<()> {
        self.tx
            .send(report)
            .await
            .map_err(|e| anyhow!("result receiver dropped, lost report for {}", e.0.candidate))
    }
}
