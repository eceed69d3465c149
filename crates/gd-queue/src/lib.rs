//! Admission-controlled job queue.
//!
//! Per-job state machine: `queued -> active -> {completed | failed}`, with
//! `delayed` entered whenever admission is refused (no free worker slot or
//! the rate window is exhausted). The two pools are kept separate so an
//! observer can tell "waiting for a worker" from "waiting out a rate
//! window".
//!
//! The rate window is a fixed window with a TTL equal to the window length,
//! counted in the coordination store so every engine instance honors the
//! same ceiling. The queue itself owns all job state transitions; nothing
//! else mutates a job record.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use gd_core::{GradingJob, GradingOutcome, JobState, ProviderId};
use gd_store::CoordinationStore;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

const RATE_WINDOW_KEY: &str = "grading:rate:window";

/// Upper bound on any single coordination-store round-trip. A hung
/// connection degrades to fail-open admission instead of stalling
/// dequeue.
const STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a terminal job record stays queryable before eviction.
const TERMINAL_RETENTION: Duration = Duration::from_secs(600);

/// O(1) counter snapshot for the operational dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: u64,
    pub failed: u64,
    pub is_rate_limited: bool,
    /// Time until the soonest delayed job becomes admissible again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelayReason {
    /// All worker slots busy; re-evaluated as soon as one frees.
    Concurrency,
    /// Rate ceiling hit; re-evaluated when the window resets.
    RateWindow,
}

#[derive(Debug)]
struct DelayedEntry {
    id: Ulid,
    retry_at: Instant,
    reason: DelayReason,
}

#[derive(Default)]
struct QueueInner {
    jobs: HashMap<Ulid, GradingJob>,
    queued: VecDeque<Ulid>,
    delayed: Vec<DelayedEntry>,
    /// Terminal jobs awaiting eviction, oldest first.
    finished: Vec<(Ulid, Instant)>,
    active: usize,
    completed: u64,
    failed: u64,
}

impl QueueInner {
    /// Move due delayed entries back into the queued pool, oldest first.
    fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<Ulid> = Vec::new();
        self.delayed.retain(|entry| {
            if entry.retry_at <= now {
                due.push(entry.id);
                false
            } else {
                true
            }
        });
        for id in due {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Queued;
            }
            self.queued.push_back(id);
        }
        // ULIDs are time-ordered, so this restores enqueue order.
        self.queued.make_contiguous().sort_unstable();
    }

    /// Re-admit concurrency-delayed jobs right away; a slot just freed.
    fn promote_concurrency_delayed(&mut self) {
        let mut due: Vec<Ulid> = Vec::new();
        self.delayed.retain(|entry| {
            if entry.reason == DelayReason::Concurrency {
                due.push(entry.id);
                false
            } else {
                true
            }
        });
        for id in due {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Queued;
            }
            self.queued.push_back(id);
        }
    }

    fn delay(&mut self, id: Ulid, retry_at: Instant, reason: DelayReason) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Delayed;
        }
        self.queued.retain(|queued_id| *queued_id != id);
        self.delayed.push(DelayedEntry { id, retry_at, reason });
    }

    /// Drop terminal job records older than the retention window. The
    /// result sink already owns the durable copy; the counters survive.
    fn sweep_terminal(&mut self, now: Instant, retention: Duration) {
        let mut expired: Vec<Ulid> = Vec::new();
        self.finished.retain(|(id, finished_at)| {
            if now.duration_since(*finished_at) >= retention {
                expired.push(*id);
                false
            } else {
                true
            }
        });
        for id in expired {
            self.jobs.remove(&id);
        }
    }
}

pub struct AdmissionQueue {
    inner: Mutex<QueueInner>,
    store: Arc<dyn CoordinationStore>,
    notify: Notify,
    max_concurrency: usize,
    rate_ceiling: u32,
    rate_window: Duration,
    poll_interval: Duration,
    terminal_retention: Duration,
}

impl AdmissionQueue {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        max_concurrency: usize,
        rate_ceiling: u32,
        rate_window: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            store,
            notify: Notify::new(),
            max_concurrency,
            rate_ceiling,
            rate_window,
            poll_interval,
            terminal_retention: TERMINAL_RETENTION,
        }
    }

    pub fn with_terminal_retention(mut self, retention: Duration) -> Self {
        self.terminal_retention = retention;
        self
    }

    pub fn enqueue(&self, mut job: GradingJob) -> Ulid {
        job.state = JobState::Queued;
        let id = job.id;
        {
            let mut inner = self.lock_inner();
            inner.jobs.insert(id, job);
            inner.queued.push_back(id);
        }
        debug!(job_id = %id, "job enqueued");
        self.notify.notify_waiters();
        id
    }

    /// Pull the next admissible job, waiting at most one poll interval.
    /// `None` means nothing was admissible this round; callers loop.
    pub async fn dequeue(&self) -> Option<GradingJob> {
        if let Some(job) = self.try_admit().await {
            return Some(job);
        }
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
        self.try_admit().await
    }

    async fn try_admit(&self) -> Option<GradingJob> {
        let now = Instant::now();

        // Claim the candidate and its slot before the store round-trip so
        // a concurrent worker cannot admit the same job, and no lock is
        // held while the store call is in flight.
        let candidate = {
            let mut inner = self.lock_inner();
            inner.sweep_terminal(now, self.terminal_retention);
            inner.promote_due(now);
            let id = *inner.queued.front()?;
            if inner.active >= self.max_concurrency {
                inner.delay(id, now + self.poll_interval, DelayReason::Concurrency);
                return None;
            }
            inner.queued.pop_front();
            inner.active += 1;
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.state = JobState::Active;
            }
            id
        };

        if self.rate_window_permits().await {
            let inner = self.lock_inner();
            return inner
                .jobs
                .get(&candidate)
                .filter(|job| job.state == JobState::Active)
                .cloned();
        }

        let retry_at = now + self.remaining_window().await;
        let mut inner = self.lock_inner();
        // The job may have been terminated externally while the store call
        // was in flight; only an Active claim still owns a slot.
        if inner.jobs.get(&candidate).map(|job| job.state) == Some(JobState::Active) {
            inner.active -= 1;
            inner.delay(candidate, retry_at, DelayReason::RateWindow);
            debug!(job_id = %candidate, "job delayed by rate window");
        }
        None
    }

    /// One atomic increment against the shared window counter decides
    /// admission. A rejected increment only inflates a counter already at
    /// its ceiling, so the overshoot is harmless. Store calls are bounded
    /// and an outage degrades to admitting with a warning; the ceiling is
    /// a quota-protection measure, not a correctness invariant.
    async fn rate_window_permits(&self) -> bool {
        let incr = self.store.incr_window(RATE_WINDOW_KEY, self.rate_window);
        match tokio::time::timeout(STORE_TIMEOUT, incr).await {
            Ok(Ok(count)) => count <= self.rate_ceiling as u64,
            Ok(Err(err)) => {
                warn!(error = %err, "rate window increment failed, admitting");
                true
            }
            Err(_) => {
                warn!("rate window increment timed out, admitting");
                true
            }
        }
    }

    async fn remaining_window(&self) -> Duration {
        let ttl = self.store.window_ttl(RATE_WINDOW_KEY);
        match tokio::time::timeout(STORE_TIMEOUT, ttl).await {
            Ok(Ok(Some(remaining))) => remaining,
            _ => self.rate_window,
        }
    }

    /// Record a dispatch attempt: bump the counter and remember which
    /// provider and credential this attempt went to.
    pub fn note_attempt(&self, id: Ulid, provider: ProviderId, credential: Option<&str>) {
        let mut inner = self.lock_inner();
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.attempts += 1;
            job.assigned_provider = Some(provider);
            job.assigned_credential = credential.map(str::to_string);
        }
    }

    /// Terminal transition to `completed`. Returns false if the job was
    /// already terminal (the second call is a no-op).
    pub fn complete(&self, id: Ulid, outcome: &GradingOutcome) -> bool {
        let transitioned = {
            let mut inner = self.lock_inner();
            let Some(job) = inner.jobs.get_mut(&id) else {
                return false;
            };
            if job.state.is_terminal() {
                return false;
            }
            let was_active = job.state == JobState::Active;
            job.state = JobState::Completed;
            job.assigned_provider = Some(outcome.provider);
            job.assigned_credential = outcome.credential_id.clone();
            job.last_error = None;
            if was_active {
                inner.active -= 1;
            }
            inner.queued.retain(|queued_id| *queued_id != id);
            inner.delayed.retain(|entry| entry.id != id);
            inner.completed += 1;
            inner.finished.push((id, Instant::now()));
            inner.promote_concurrency_delayed();
            true
        };
        self.notify.notify_waiters();
        debug!(job_id = %id, "job completed");
        transitioned
    }

    /// Terminal transition to `failed`. Idempotent like [`complete`].
    pub fn fail(&self, id: Ulid, kind_tag: &str, message: &str) -> bool {
        let transitioned = {
            let mut inner = self.lock_inner();
            let Some(job) = inner.jobs.get_mut(&id) else {
                return false;
            };
            if job.state.is_terminal() {
                return false;
            }
            let was_active = job.state == JobState::Active;
            job.state = JobState::Failed;
            job.last_error = Some(format!("{kind_tag}: {message}"));
            if was_active {
                inner.active -= 1;
            }
            inner.queued.retain(|queued_id| *queued_id != id);
            inner.delayed.retain(|entry| entry.id != id);
            inner.failed += 1;
            inner.finished.push((id, Instant::now()));
            inner.promote_concurrency_delayed();
            true
        };
        self.notify.notify_waiters();
        debug!(job_id = %id, kind = kind_tag, "job failed");
        transitioned
    }

    pub fn job(&self, id: Ulid) -> Option<GradingJob> {
        self.lock_inner().jobs.get(&id).cloned()
    }

    pub fn status(&self) -> QueueStatus {
        let mut inner = self.lock_inner();
        let now = Instant::now();
        inner.sweep_terminal(now, self.terminal_retention);
        let rate_limit_ttl_ms = inner
            .delayed
            .iter()
            .map(|entry| entry.retry_at.saturating_duration_since(now).as_millis() as u64)
            .min();
        let waiting = inner.queued.len();
        let delayed = inner.delayed.len();
        QueueStatus {
            waiting,
            active: inner.active,
            delayed,
            completed: inner.completed,
            failed: inner.failed,
            is_rate_limited: delayed > 0 || waiting > 0,
            rate_limit_ttl_ms,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            // The queue has no recovery story for a poisoned lock; the
            // panic that poisoned it already took the process down path.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gd_core::GradingPayload;
    use gd_store::MemoryStore;
    use serde_json::json;

    fn job(session: &str) -> GradingJob {
        GradingJob::new(
            session.to_string(),
            "user-1".to_string(),
            GradingPayload {
                file_text: "essay".into(),
                rubric: json!({}),
            },
        )
    }

    fn queue(max_concurrency: usize, rate_ceiling: u32, window: Duration) -> AdmissionQueue {
        AdmissionQueue::new(
            Arc::new(MemoryStore::new()),
            max_concurrency,
            rate_ceiling,
            window,
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn test_fifo_order_within_queued_pool() {
        let queue = queue(8, 100, Duration::from_secs(60));
        let first = queue.enqueue(job("s1"));
        let second = queue.enqueue(job("s1"));
        assert_eq!(queue.dequeue().await.unwrap().id, first);
        assert_eq!(queue.dequeue().await.unwrap().id, second);
    }

    #[tokio::test]
    async fn test_scenario_nine_jobs_eight_slots() {
        // Nine simultaneous jobs against maxConcurrency=8 and a ceiling of
        // 8 per window: exactly eight go active, the ninth is delayed and
        // the queue reports rate limiting until something frees.
        let queue = queue(8, 8, Duration::from_secs(60));
        for _ in 0..9 {
            queue.enqueue(job("s1"));
        }
        let mut admitted = 0;
        for _ in 0..9 {
            if queue.dequeue().await.is_some() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 8);

        let status = queue.status();
        assert_eq!(status.active, 8);
        assert_eq!(status.delayed, 1);
        assert_eq!(status.waiting, 0);
        assert!(status.is_rate_limited);
    }

    #[tokio::test]
    async fn test_active_never_exceeds_max_concurrency() {
        let queue = queue(2, 100, Duration::from_secs(60));
        for _ in 0..5 {
            queue.enqueue(job("s1"));
        }
        for _ in 0..5 {
            let _ = queue.dequeue().await;
        }
        assert!(queue.status().active <= 2);
    }

    #[tokio::test]
    async fn test_completion_frees_slot_for_delayed_job() {
        let queue = queue(1, 100, Duration::from_secs(60));
        let first = queue.enqueue(job("s1"));
        queue.enqueue(job("s1"));

        let active = queue.dequeue().await.unwrap();
        assert_eq!(active.id, first);
        assert!(queue.dequeue().await.is_none());
        assert_eq!(queue.status().delayed, 1);

        let outcome = GradingOutcome {
            result: json!({"score": 90}),
            provider: ProviderId::Local,
            credential_id: None,
            latency_ms: 10,
        };
        assert!(queue.complete(first, &outcome));
        let next = queue.dequeue().await;
        assert!(next.is_some());
        assert_eq!(queue.status().active, 1);
    }

    #[tokio::test]
    async fn test_rate_window_delays_then_readmits() {
        let queue = queue(8, 2, Duration::from_millis(50));
        for _ in 0..3 {
            queue.enqueue(job("s1"));
        }
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_some());
        // Third hits the ceiling and lands in delayed.
        assert!(queue.dequeue().await.is_none());
        let status = queue.status();
        assert_eq!(status.delayed, 1);
        assert!(status.is_rate_limited);
        assert!(status.rate_limit_ttl_ms.is_some());

        // Window expires; the delayed job becomes admissible again.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(queue.dequeue().await.is_some());
    }

    #[tokio::test]
    async fn test_terminal_transition_is_write_once() {
        let queue = queue(8, 100, Duration::from_secs(60));
        let id = queue.enqueue(job("s1"));
        let job = queue.dequeue().await.unwrap();
        assert_eq!(job.id, id);

        let outcome = GradingOutcome {
            result: json!({"score": 77}),
            provider: ProviderId::PrimaryCloud,
            credential_id: Some("key-1".into()),
            latency_ms: 200,
        };
        assert!(queue.complete(id, &outcome));
        assert!(!queue.complete(id, &outcome));
        assert!(!queue.fail(id, "transient", "late failure"));

        let status = queue.status();
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, 0);
        assert_eq!(queue.job(id).unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_fail_records_taxonomy_and_message() {
        let queue = queue(8, 100, Duration::from_secs(60));
        let id = queue.enqueue(job("s1"));
        queue.dequeue().await.unwrap();

        assert!(queue.fail(id, "exhausted-chain", "all providers failed"));
        let job = queue.job(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(
            job.last_error.as_deref(),
            Some("exhausted-chain: all providers failed")
        );
        assert_eq!(queue.status().failed, 1);
    }

    #[tokio::test]
    async fn test_is_rate_limited_iff_waiting_or_delayed() {
        let queue = queue(1, 100, Duration::from_secs(60));
        assert!(!queue.status().is_rate_limited);

        let id = queue.enqueue(job("s1"));
        // Enqueued but not yet evaluated counts as waiting.
        assert!(queue.status().is_rate_limited);

        queue.dequeue().await.unwrap();
        assert!(!queue.status().is_rate_limited);

        let outcome = GradingOutcome {
            result: json!({}),
            provider: ProviderId::Local,
            credential_id: None,
            latency_ms: 5,
        };
        queue.complete(id, &outcome);
        assert!(!queue.status().is_rate_limited);
    }

    #[tokio::test]
    async fn test_note_attempt_tracks_provider_and_credential() {
        let queue = queue(8, 100, Duration::from_secs(60));
        let id = queue.enqueue(job("s1"));
        queue.dequeue().await.unwrap();

        queue.note_attempt(id, ProviderId::PrimaryCloud, Some("primary-key-2"));
        queue.note_attempt(id, ProviderId::SecondaryCloud, Some("secondary-key-1"));

        let job = queue.job(id).unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.assigned_provider, Some(ProviderId::SecondaryCloud));
        assert_eq!(job.assigned_credential.as_deref(), Some("secondary-key-1"));
    }

    #[tokio::test]
    async fn test_concurrent_dequeues_admit_job_once() {
        let queue = Arc::new(queue(8, 100, Duration::from_secs(60)));
        queue.enqueue(job("s1"));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { queue.dequeue().await }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(queue.status().active, 1);
    }

    /// Store whose counter operations never resolve, standing in for a
    /// dead Redis connection.
    struct StalledStore;

    #[async_trait::async_trait]
    impl CoordinationStore for StalledStore {
        async fn incr_window(&self, _key: &str, _ttl: Duration) -> Result<u64, gd_store::StoreError> {
            std::future::pending().await
        }

        async fn get_counter(&self, _key: &str) -> Result<u64, gd_store::StoreError> {
            std::future::pending().await
        }

        async fn window_ttl(
            &self,
            _key: &str,
        ) -> Result<Option<Duration>, gd_store::StoreError> {
            std::future::pending().await
        }

        async fn hash_incr(
            &self,
            _key: &str,
            _field: &str,
            _by: i64,
        ) -> Result<i64, gd_store::StoreError> {
            Ok(0)
        }

        async fn hash_set(
            &self,
            _key: &str,
            _fields: &[(&str, String)],
        ) -> Result<(), gd_store::StoreError> {
            Ok(())
        }

        async fn hash_get_all(
            &self,
            _key: &str,
        ) -> Result<std::collections::HashMap<String, String>, gd_store::StoreError> {
            Ok(std::collections::HashMap::new())
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), gd_store::StoreError> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<(), gd_store::StoreError> {
            Ok(())
        }

        async fn try_lock(&self, _key: &str, _ttl: Duration) -> Result<bool, gd_store::StoreError> {
            Ok(true)
        }

        async fn unlock(&self, _key: &str) -> Result<(), gd_store::StoreError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_survives_stalled_store() {
        // A dead store connection must not wedge admission: the bounded
        // store call times out and admission fails open.
        let queue = AdmissionQueue::new(
            Arc::new(StalledStore),
            8,
            8,
            Duration::from_secs(60),
            Duration::from_millis(20),
        );
        queue.enqueue(job("s1"));
        let admitted = queue.dequeue().await;
        assert!(admitted.is_some());
        assert_eq!(queue.status().active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_jobs_evicted_after_retention() {
        let queue = queue(8, 100, Duration::from_secs(60))
            .with_terminal_retention(Duration::from_millis(50));
        let id = queue.enqueue(job("s1"));
        queue.dequeue().await.unwrap();

        let outcome = GradingOutcome {
            result: json!({"score": 95}),
            provider: ProviderId::Local,
            credential_id: None,
            latency_ms: 8,
        };
        assert!(queue.complete(id, &outcome));
        assert!(queue.job(id).is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let status = queue.status();
        // The record is gone but the counters survive.
        assert!(queue.job(id).is_none());
        assert_eq!(status.completed, 1);
        assert_eq!(status.active, 0);
    }
}
