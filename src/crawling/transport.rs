//! # Transport Contract
//!
//! The scheduler never performs I/O itself: every fetch goes through a
//! [`Transport`]. Real runs use `infrastructure::HttpTransport`; tests and
//! offline replays use [`ScriptedTransport`].

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use super::tasks::{FetchMethod, FetchTarget, Payload};

/// Fetch failure categories as seen by the scheduler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Transient failure (5xx, 429, connection reset); may be resubmitted
    #[error("Retryable fetch failure: {reason}")]
    Retryable { reason: String },

    /// Permanent failure (4xx, invalid request); never resubmitted
    #[error("Terminal fetch failure: {reason}")]
    Terminal { reason: String },

    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    #[must_use]
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable { reason: reason.into() }
    }

    #[must_use]
    pub fn terminal(reason: impl Into<String>) -> Self {
        Self::Terminal { reason: reason.into() }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. } | Self::Timeout(_))
    }
}

/// Resolves abstract fetch targets into payloads
#[async_trait]
pub trait Transport: Send + Sync {
    async fn resolve(&self, target: &FetchTarget) -> Result<Payload, FetchError>;

    /// How many times the scheduler may resubmit a target after a
    /// retryable failure. Retry policy belongs to the transport.
    fn retry_budget(&self) -> u32 {
        0
    }

    /// Pause before the `attempt`-th resubmission. The scheduler waits it
    /// out without holding a concurrency permit or a fetch deadline.
    fn retry_delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Route {
    method: FetchMethod,
    uri: String,
    body: Option<String>,
}

impl Route {
    fn of(target: &FetchTarget) -> Self {
        Self {
            method: target.method,
            uri: target.uri.clone(),
            body: target.body.clone(),
        }
    }
}

type Scripted = Result<String, FetchError>;

/// In-memory transport answering from a fixed script
///
/// Each route holds a queue of answers; the last answer repeats once the
/// queue is down to one. Unscripted requests fail terminally.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<Route, VecDeque<Scripted>>>,
    calls: DashMap<String, usize>,
    total_calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Option<Duration>,
    route_delays: HashMap<String, Duration>,
    retry_budget: u32,
    retry_delay: Duration,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_get(self, uri: &str, body: &str) -> Self {
        self.with_sequence(FetchMethod::Get, uri, None, vec![Ok(body.to_string())])
    }

    #[must_use]
    pub fn with_post(self, uri: &str, payload: &str, body: &str) -> Self {
        self.with_sequence(
            FetchMethod::Post,
            uri,
            Some(payload),
            vec![Ok(body.to_string())],
        )
    }

    #[must_use]
    pub fn with_get_failure(self, uri: &str, error: FetchError) -> Self {
        self.with_sequence(FetchMethod::Get, uri, None, vec![Err(error)])
    }

    #[must_use]
    pub fn with_post_failure(self, uri: &str, payload: &str, error: FetchError) -> Self {
        self.with_sequence(FetchMethod::Post, uri, Some(payload), vec![Err(error)])
    }

    /// Answers consumed in order; the last one repeats
    #[must_use]
    pub fn with_sequence(
        mut self,
        method: FetchMethod,
        uri: &str,
        payload: Option<&str>,
        answers: Vec<Scripted>,
    ) -> Self {
        let route = Route {
            method,
            uri: uri.to_string(),
            body: payload.map(str::to_string),
        };
        self.routes
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(route, answers.into());
        self
    }

    /// Holds every response for `delay` so concurrent fetches overlap
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Holds responses for `uri` only; overrides [`Self::with_delay`]
    #[must_use]
    pub fn with_delay_for(mut self, uri: &str, delay: Duration) -> Self {
        self.route_delays.insert(uri.to_string(), delay);
        self
    }

    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Fixed pause the scheduler waits before every resubmission
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Number of resolve calls made for `uri`, any method
    #[must_use]
    pub fn calls(&self, uri: &str) -> usize {
        self.calls.get(uri).map_or(0, |c| *c)
    }

    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Highest number of resolve calls observed in progress at once
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_answer(&self, target: &FetchTarget) -> Scripted {
        let route = Route::of(target);
        let mut routes = self
            .routes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match routes.get_mut(&route) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::terminal("empty script"))),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(FetchError::terminal("empty script"))),
            None => Err(FetchError::terminal(format!(
                "no scripted response for {} {}",
                target.method.as_str(),
                target.uri
            ))),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn resolve(&self, target: &FetchTarget) -> Result<Payload, FetchError> {
        *self.calls.entry(target.uri.clone()).or_insert(0) += 1;
        self.total_calls.fetch_add(1, Ordering::SeqCst);

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);

        if let Some(delay) = self.route_delays.get(&target.uri).copied().or(self.delay) {
            tokio::time::sleep(delay).await;
        }
        let answer = self.next_answer(target);

        self.active.fetch_sub(1, Ordering::SeqCst);
        answer.map(|body| Payload::new(body, target.uri.clone()))
    }

    fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    fn retry_delay(&self, _attempt: u32) -> Duration {
        self.retry_delay
    }
}
