//! Single availability check of a candidate through one proxy.

use crate::proxy::redact;

use async_trait::async_trait;
use log::debug;
use std::fmt;
use std::time::{Duration, Instant};

/// What decided the classification of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSignal {
    /// The target answered with this HTTP status.
    Status(u16),
    /// No answer within the probe timeout.
    Timeout,
    /// Connection refused/reset, DNS failure, proxy handshake failure.
    Network(String),
    /// The proxy address could not be turned into a client.
    InvalidProxy(String),
    /// An answer arrived but could not be read.
    Malformed(String),
    /// No proxy could be acquired for the attempt.
    NoProxy,
}

impl fmt::Display for ProbeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeSignal::Status(code) => write!(f, "HTTP {}", code),
            ProbeSignal::Timeout => write!(f, "timeout"),
            ProbeSignal::Network(e) => write!(f, "network failure: {}", e),
            ProbeSignal::InvalidProxy(e) => write!(f, "invalid proxy: {}", e),
            ProbeSignal::Malformed(e) => write!(f, "malformed response: {}", e),
            ProbeSignal::NoProxy => write!(f, "no proxy available"),
        }
    }
}

/// Data every probe outcome carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Identifier under test.
    pub candidate: String,
    /// Time spent on the attempt.
    pub latency: Duration,
    /// What decided the classification.
    pub signal: ProbeSignal,
}

/// Classified result of probing one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The identifier is free (the target answered 404).
    Hit(Observation),
    /// The identifier is in use (the target answered 200).
    Taken(Observation),
    /// No trustworthy answer: other status, timeout or network failure.
    Inconclusive(Observation),
    /// No proxy could be acquired for the candidate.
    ProxyExhausted(Observation),
}

impl ProbeOutcome {
    /// Classify a signal. 404 is a hit, 200 is taken, everything else is
    /// inconclusive.
    pub fn classify(candidate: impl Into<String>, latency: Duration, signal: ProbeSignal) -> Self {
        let variant: fn(Observation) -> Self = match &signal {
            ProbeSignal::Status(404) => ProbeOutcome::Hit,
            ProbeSignal::Status(200) => ProbeOutcome::Taken,
            ProbeSignal::NoProxy => ProbeOutcome::ProxyExhausted,
            _ => ProbeOutcome::Inconclusive,
        };
        variant(Observation {
            candidate: candidate.into(),
            latency,
            signal,
        })
    }

    /// The observation shared by all variants.
    pub fn observation(&self) -> &Observation {
        match self {
            ProbeOutcome::Hit(o)
            | ProbeOutcome::Taken(o)
            | ProbeOutcome::Inconclusive(o)
            | ProbeOutcome::ProxyExhausted(o) => o,
        }
    }

    /// Identifier under test.
    pub fn candidate(&self) -> &str {
        &self.observation().candidate
    }

    /// Time spent on the attempt.
    pub fn latency(&self) -> Duration {
        self.observation().latency
    }

    /// What decided the classification.
    pub fn signal(&self) -> &ProbeSignal {
        &self.observation().signal
    }

    /// Whether the outcome is final for the candidate (hit or taken).
    pub fn is_conclusive(&self) -> bool {
        matches!(self, ProbeOutcome::Hit(_) | ProbeOutcome::Taken(_))
    }

    /// Whether the proxy delivered an interpretable answer. A clean 200 or
    /// 404 counts even though the candidate may be taken.
    pub fn is_proxy_success(&self) -> bool {
        self.is_conclusive()
    }
}

/// Performs one existence check for a candidate through a proxy.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `candidate` through `proxy`, giving up after `timeout`.
    async fn probe(&self, candidate: &str, proxy: &str, timeout: Duration) -> ProbeOutcome;
}

/// Prober issuing one HTTP GET per check against a URL template.
///
/// The template contains `{}` where the candidate goes, e.g.
/// `https://example.com/{}`; a template without it gets the candidate
/// appended as a path segment.
#[derive(Debug, Clone)]
pub struct HttpProber {
    target: String,
    user_agent: Option<String>,
}

impl HttpProber {
    /// Create a prober for the given URL template.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            user_agent: None,
        }
    }

    /// Send this User-Agent with every probe.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// The URL probed for `candidate`.
    pub fn target_url(&self, candidate: &str) -> String {
        if self.target.contains("{}") {
            self.target.replace("{}", candidate)
        } else {
            format!("{}/{}", self.target.trim_end_matches('/'), candidate)
        }
    }

    async fn fetch_status(&self, candidate: &str, proxy: &str, timeout: Duration) -> ProbeSignal {
        let reqwest_proxy = match reqwest::Proxy::all(proxy) {
            Ok(p) => p,
            Err(e) => return ProbeSignal::InvalidProxy(e.to_string()),
        };

        let mut builder = reqwest::Client::builder()
            .proxy(reqwest_proxy)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none());
        if let Some(ua) = &self.user_agent {
            builder = builder.user_agent(ua.as_str());
        }
        let client = match builder.build() {
            Ok(c) => c,
            Err(e) => return ProbeSignal::InvalidProxy(e.to_string()),
        };

        // The outer timeout also covers connect phases the client timeout misses.
        match tokio::time::timeout(timeout, client.get(self.target_url(candidate)).send()).await {
            Ok(Ok(response)) => ProbeSignal::Status(response.status().as_u16()),
            Ok(Err(e)) if e.is_timeout() => ProbeSignal::Timeout,
            Ok(Err(e)) if e.is_connect() || e.is_request() => ProbeSignal::Network(e.to_string()),
            Ok(Err(e)) => ProbeSignal::Malformed(e.to_string()),
            Err(_) => ProbeSignal::Timeout,
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, candidate: &str, proxy: &str, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        let signal = self.fetch_status(candidate, proxy, timeout).await;
        let latency = start.elapsed();

        debug!(
            "Probed {} via {}: {} in {:?}",
            candidate,
            redact(proxy),
            signal,
            latency
        );
        ProbeOutcome::classify(candidate, latency, signal)
    }
}
