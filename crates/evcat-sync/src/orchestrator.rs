//! Bounded worker pool that runs source adapters for one location.
//!
//! Each source is one work item. A worker takes the earliest-ready item, waits for
//! a rate-limit token, calls the adapter under a deadline, and either settles the
//! item or requeues it with a backoff delay. A source therefore never has more than
//! one attempt in flight. Anything still unsettled when the cycle deadline passes is
//! reported as `DeadlineExceeded`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use evcat_adapters::{build_adapter, AdapterContext, AdapterError, FetchQuery, SourceAdapter};
use evcat_core::{RawEventRecord, SourceError};
use evcat_storage::{
    deadline_after, FailureClass, RetryDecision, RetryPolicy, TokenBucket, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{LocationConfig, OrchestratorConfig, SourceConfig};

/// A configured source: its adapter plus the rate limiter that outlives cycles.
#[derive(Clone)]
pub struct SourceHandle {
    pub name: String,
    pub priority: i32,
    pub confidence: f64,
    pub adapter: Arc<dyn SourceAdapter>,
    pub limiter: Arc<TokenBucket>,
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("confidence", &self.confidence)
            .field("platform", &self.adapter.platform())
            .finish()
    }
}

impl SourceHandle {
    pub fn new(name: impl Into<String>, adapter: Arc<dyn SourceAdapter>, rate_limit: TokenBucketConfig) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            confidence: 0.5,
            adapter,
            limiter: Arc::new(TokenBucket::new(rate_limit)),
        }
    }

    pub fn from_config(source: &SourceConfig, ctx: &AdapterContext) -> Result<Self, AdapterError> {
        let adapter = build_adapter(&source.name, &source.kind, ctx)?;
        Ok(Self::new(&source.name, adapter, source.rate_limit)
            .with_priority(source.priority)
            .with_confidence(source.confidence))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Not retryable (auth rejected, malformed source).
    Permanent,
    RetriesExhausted,
    DeadlineExceeded,
    /// The worker running the source stopped without settling it.
    Abandoned,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::Permanent => "permanent",
            FailureReason::RetriesExhausted => "retries exhausted",
            FailureReason::DeadlineExceeded => "deadline exceeded",
            FailureReason::Abandoned => "abandoned",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePartialFailure {
    pub source: String,
    pub location: String,
    pub reason: FailureReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<FailureClass>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<SourceError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Succeeded { records: usize },
    Failed { reason: FailureReason },
}

/// What happened to one source at one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source: String,
    pub location: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub status: SourceStatus,
}

#[derive(Debug, Clone)]
pub struct SourceRecords {
    pub source: String,
    pub source_index: usize,
    pub priority: i32,
    pub confidence: f64,
    pub attempts: u32,
    pub records: Vec<RawEventRecord>,
}

#[derive(Debug, Clone)]
pub struct CollectionResult {
    pub location: LocationConfig,
    /// Successful sources, in source order.
    pub fetched: Vec<SourceRecords>,
    pub failures: Vec<SourcePartialFailure>,
    pub outcomes: Vec<SourceOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl CollectionResult {
    pub fn record_count(&self) -> usize {
        self.fetched.iter().map(|s| s.records.len()).sum()
    }

    /// Records with their source confidence, ordered by source priority (highest
    /// first), then source order, then the order the source returned them.
    pub fn ordered_records(&self) -> Vec<(f64, &RawEventRecord)> {
        let mut sources = self.fetched.iter().collect::<Vec<_>>();
        sources.sort_by_key(|s| (std::cmp::Reverse(s.priority), s.source_index));
        sources
            .into_iter()
            .flat_map(|s| s.records.iter().map(move |r| (s.confidence, r)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(config: &OrchestratorConfig, retry: RetryPolicy) -> Self {
        Self {
            config: config.clone(),
            retry,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Collect with a fresh deadline of `cycle_timeout` from now.
    pub async fn collect(
        &self,
        location: &LocationConfig,
        sources: &[SourceHandle],
        per_source_limit: usize,
    ) -> CollectionResult {
        let deadline = deadline_after(self.config.cycle_timeout());
        self.collect_until(location, sources, per_source_limit, deadline).await
    }

    pub async fn collect_until(
        &self,
        location: &LocationConfig,
        sources: &[SourceHandle],
        per_source_limit: usize,
        deadline: Instant,
    ) -> CollectionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let label = location.label();

        let pool = Arc::new(Pool {
            sources: sources.to_vec(),
            query: location.query(per_source_limit),
            location: label.clone(),
            call_timeout: self.config.call_timeout(),
            rate_limit_wait: self.config.rate_limit_wait(),
            retry: self.retry,
            deadline,
            notify: Notify::new(),
            state: Mutex::new(PoolState {
                pending: (0..sources.len())
                    .map(|index| Pending {
                        index,
                        ready_at: clock,
                    })
                    .collect(),
                in_flight: 0,
                progress: vec![Progress::default(); sources.len()],
            }),
        });

        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers.min(sources.len()) {
            workers.spawn(work(Arc::clone(&pool)));
        }

        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(err) = joined {
                    warn!(location = %label, error = %err, "collection worker stopped abnormally");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(location = %label, "cycle deadline reached, cancelling in-flight sources");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        let deadline_hit = drained.is_err();
        let mut fetched = Vec::new();
        let mut failures = Vec::new();
        let mut outcomes = Vec::new();
        let mut state = pool.lock();
        for (index, progress) in state.progress.iter_mut().enumerate() {
            let handle = &sources[index];
            let settled = progress.settled.take().unwrap_or(Settled::Failed {
                reason: if deadline_hit {
                    FailureReason::DeadlineExceeded
                } else {
                    FailureReason::Abandoned
                },
                class: progress.last_error.as_ref().map(FailureClass::of),
            });
            match settled {
                Settled::Fetched(records) => {
                    outcomes.push(SourceOutcome {
                        source: handle.name.clone(),
                        location: label.clone(),
                        attempts: progress.attempts,
                        status: SourceStatus::Succeeded {
                            records: records.len(),
                        },
                    });
                    fetched.push(SourceRecords {
                        source: handle.name.clone(),
                        source_index: index,
                        priority: handle.priority,
                        confidence: handle.confidence,
                        attempts: progress.attempts,
                        records,
                    });
                }
                Settled::Failed { reason, class } => {
                    outcomes.push(SourceOutcome {
                        source: handle.name.clone(),
                        location: label.clone(),
                        attempts: progress.attempts,
                        status: SourceStatus::Failed { reason },
                    });
                    failures.push(SourcePartialFailure {
                        source: handle.name.clone(),
                        location: label.clone(),
                        reason,
                        class,
                        attempts: progress.attempts,
                        last_error: progress.last_error.take(),
                    });
                }
            }
        }
        drop(state);

        let result = CollectionResult {
            location: location.clone(),
            fetched,
            failures,
            outcomes,
            started_at,
            finished_at: Utc::now(),
            elapsed: clock.elapsed(),
        };
        info!(
            location = %label,
            records = result.record_count(),
            failed_sources = result.failures.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "collection finished"
        );
        result
    }
}

#[derive(Debug, Clone)]
enum Settled {
    Fetched(Vec<RawEventRecord>),
    Failed {
        reason: FailureReason,
        class: Option<FailureClass>,
    },
}

#[derive(Debug, Clone, Default)]
struct Progress {
    attempts: u32,
    last_error: Option<SourceError>,
    settled: Option<Settled>,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    index: usize,
    ready_at: Instant,
}

#[derive(Debug)]
struct PoolState {
    pending: Vec<Pending>,
    in_flight: usize,
    progress: Vec<Progress>,
}

enum Step {
    Run { index: usize, attempt: u32 },
    WaitUntil(Instant),
    Idle,
    Done,
}

struct Pool {
    sources: Vec<SourceHandle>,
    query: FetchQuery,
    location: String,
    call_timeout: Duration,
    rate_limit_wait: Duration,
    retry: RetryPolicy,
    deadline: Instant,
    notify: Notify,
    state: Mutex<PoolState>,
}

impl Pool {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_step(&self, now: Instant) -> Step {
        let mut state = self.lock();
        let earliest = state
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| (p.ready_at, p.index))
            .map(|(pos, p)| (pos, *p));
        match earliest {
            None if state.in_flight == 0 => Step::Done,
            None => Step::Idle,
            Some((_, p)) if p.ready_at > now => Step::WaitUntil(p.ready_at),
            Some((pos, p)) => {
                state.pending.swap_remove(pos);
                state.in_flight += 1;
                let progress = &mut state.progress[p.index];
                progress.attempts += 1;
                Step::Run {
                    index: p.index,
                    attempt: progress.attempts,
                }
            }
        }
    }

    async fn invoke(&self, handle: &SourceHandle) -> Result<Vec<RawEventRecord>, SourceError> {
        if !handle.limiter.acquire(self.rate_limit_wait).await {
            return Err(SourceError::timeout(format!(
                "no rate-limit token within {}ms",
                self.rate_limit_wait.as_millis()
            )));
        }
        match tokio::time::timeout(self.call_timeout, handle.adapter.fetch_events(&self.query)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::timeout(format!(
                "adapter call exceeded {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }

    async fn run_attempt(&self, index: usize, attempt: u32) {
        let mut guard = AttemptGuard {
            pool: self,
            index,
            settled: false,
        };
        let handle = &self.sources[index];
        let span = info_span!("source_attempt", source = %handle.name, location = %self.location, attempt);
        let result = self.invoke(handle).instrument(span).await;

        let mut state = self.lock();
        state.in_flight -= 1;
        let progress = &mut state.progress[index];
        let requeue = match result {
            Ok(mut records) => {
                records.truncate(self.query.limit);
                debug!(source = %handle.name, location = %self.location, attempt, records = records.len(), "source fetched");
                progress.settled = Some(Settled::Fetched(records));
                None
            }
            Err(err) => {
                let decision = self.retry.decide(attempt, &err);
                let requeue = match decision {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(source = %handle.name, location = %self.location, attempt, error = %err, delay_ms = delay.as_millis() as u64, "source attempt failed, retrying");
                        Some(Pending {
                            index,
                            ready_at: deadline_after(delay),
                        })
                    }
                    RetryDecision::GiveUp(class) => {
                        let reason = if class == FailureClass::Permanent {
                            FailureReason::Permanent
                        } else {
                            FailureReason::RetriesExhausted
                        };
                        warn!(source = %handle.name, location = %self.location, attempt, error = %err, %reason, "giving up on source");
                        progress.settled = Some(Settled::Failed {
                            reason,
                            class: Some(class),
                        });
                        None
                    }
                };
                progress.last_error = Some(err);
                requeue
            }
        };
        if let Some(pending) = requeue {
            state.pending.push(pending);
        }
        guard.settled = true;
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Releases the in-flight slot if an attempt is cancelled or panics.
struct AttemptGuard<'a> {
    pool: &'a Pool,
    index: usize,
    settled: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let reason = if Instant::now() >= self.pool.deadline {
            FailureReason::DeadlineExceeded
        } else {
            FailureReason::Abandoned
        };
        {
            let mut state = self.pool.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            let progress = &mut state.progress[self.index];
            let class = progress.last_error.as_ref().map(FailureClass::of);
            progress
                .settled
                .get_or_insert(Settled::Failed { reason, class });
        }
        self.pool.notify.notify_waiters();
    }
}

async fn work(pool: Arc<Pool>) {
    loop {
        let notified = pool.notify.notified();
        match pool.next_step(Instant::now()) {
            Step::Done => return,
            Step::Idle => notified.await,
            Step::WaitUntil(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = notified => {}
                }
            }
            Step::Run { index, attempt } => pool.run_attempt(index, attempt).await,
        }
    }
}
