//! # reqwest-probe-pool
//!
//! A health-aware proxy pool and a bounded concurrent prober built on reqwest.
//!
//! The [`ProxyPool`] hands out the fastest rested, healthy proxy, records how
//! each use went, and restocks itself from a [`ProxySource`]. The
//! [`ProbeEngine`] pulls candidate identifiers from a [`CandidateSource`],
//! checks each one through the pool with a [`Prober`] (404 means free, 200
//! means taken), retries inconclusive attempts with backoff, and reports the
//! outcome to a [`ResultSink`].

pub mod candidates;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod prober;
pub mod proxy;
pub mod sink;
pub mod source;

pub use candidates::{CandidateSource, NextCandidate, QueueCandidates};
pub use config::{
    ProbeEngineConfig, ProbeEngineConfigBuilder, ProxyPoolConfig, ProxyPoolConfigBuilder,
};
pub use engine::{EngineHandle, EngineState, ProbeEngine, RunSummary};
pub use error::{NoProxyAvailable, SourceError};
pub use pool::{PoolStats, ProxyPool, RestockReport};
pub use prober::{HttpProber, Observation, ProbeOutcome, ProbeSignal, Prober};
pub use proxy::ProxyRecord;
pub use sink::{ChannelSink, ProbeReport, ResultSink};
pub use source::{ListSource, ProxySource, StaticSource, WebshareSource};
