//! Admission gate: the read, evaluate and write cycle against the store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::entry::RequestLog;
use super::window::WindowPolicy;
use crate::config::{FailurePolicy, LimiterConfig, StoreConfig};
use crate::error::{Result, SlomoError};
use crate::store::{RequestLogStore, StoreError};

const DEFAULT_LOG_KEY: &str = "requests";
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 16;
const DEFAULT_CONFLICT_BACKOFF: Duration = Duration::from_millis(5);

/// The result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Forward the request
    Admitted,
    /// Refuse the request; the caller should wait `retry_after`
    Rejected { retry_after: Duration },
}

/// Decides admission for every incoming request against the shared log.
///
/// Each check reads the log, evaluates the window and writes the trimmed log
/// back with a compare-and-swap. If another gate wrote in between, the check
/// starts over with a fresh read, so concurrent gates sharing one store never
/// lose each other's entries.
#[derive(Debug)]
pub struct Gate {
    store: Arc<dyn RequestLogStore>,
    policy: WindowPolicy,
    clock: Arc<dyn Clock>,
    log_key: String,
    store_timeout: Duration,
    max_conflict_retries: u32,
    conflict_backoff: Duration,
    failure_policy: FailurePolicy,
}

impl Gate {
    /// Create a gate over `store` with default settings.
    pub fn new(store: Arc<dyn RequestLogStore>, policy: WindowPolicy) -> Self {
        Self {
            store,
            policy,
            clock: Arc::new(SystemClock),
            log_key: DEFAULT_LOG_KEY.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            conflict_backoff: DEFAULT_CONFLICT_BACKOFF,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Create a gate from configuration.
    pub fn from_config(
        store: Arc<dyn RequestLogStore>,
        limiter: &LimiterConfig,
        store_config: &StoreConfig,
    ) -> Self {
        Self::new(store, limiter.policy())
            .with_log_key(limiter.log_key.clone())
            .with_store_timeout(store_config.timeout())
            .with_max_conflict_retries(limiter.max_conflict_retries)
            .with_conflict_backoff(limiter.conflict_backoff())
            .with_failure_policy(limiter.on_store_failure)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_log_key(mut self, log_key: impl Into<String>) -> Self {
        self.log_key = log_key.into();
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_conflict_backoff(mut self, backoff: Duration) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn log_key(&self) -> &str {
        &self.log_key
    }

    /// Decide whether the current request may proceed, recording it if so.
    ///
    /// The trimmed log is written back whatever the outcome. Store failures
    /// and malformed logs are returned as errors, never as an admission.
    pub async fn check(&self) -> Result<Admission> {
        let attempts = self.max_conflict_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let stored = self
                .with_deadline(self.store.load(&self.log_key))
                .await?;
            let log = RequestLog::decode(stored.as_deref())?;

            let now = self.clock.now();
            let decision = self.policy.evaluate(log, now);
            let encoded = decision.trimmed_log.encode()?;

            let swapped = self
                .with_deadline(
                    self.store
                        .compare_and_swap(&self.log_key, stored.as_deref(), &encoded),
                )
                .await?;

            if swapped {
                trace!(
                    key = %self.log_key,
                    admitted = decision.admitted,
                    logged = decision.trimmed_log.len(),
                    attempt,
                    "Request log updated"
                );
                return Ok(if decision.admitted {
                    Admission::Admitted
                } else {
                    Admission::Rejected {
                        retry_after: decision.retry_after,
                    }
                });
            }

            debug!(
                key = %self.log_key,
                attempt,
                "Request log changed concurrently, retrying"
            );
            if attempt < attempts {
                self.pause_after_conflict().await;
            }
        }

        warn!(
            key = %self.log_key,
            attempts,
            "Giving up on request log update after repeated conflicts"
        );
        Err(SlomoError::Contention { attempts })
    }

    async fn with_deadline<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, operation).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.store_timeout).into()),
        }
    }

    async fn pause_after_conflict(&self) {
        let ceiling = u64::try_from(self.conflict_backoff.as_micros()).unwrap_or(u64::MAX);
        if ceiling == 0 {
            tokio::task::yield_now().await;
            return;
        }
        let pause = rand::thread_rng().gen_range(0..=ceiling);
        tokio::time::sleep(Duration::from_micros(pause)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::entry::LogEntry;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 3, 1, 12, 0, 0).unwrap()
    }

    fn gate_with(store: &MemoryStore, clock: &ManualClock, capacity: usize) -> Gate {
        Gate::new(Arc::new(store.clone()), WindowPolicy::new(HOUR, capacity))
            .with_clock(Arc::new(clock.clone()))
    }

    async fn stored_log(store: &MemoryStore) -> RequestLog {
        let raw = store.load("requests").await.unwrap();
        RequestLog::decode(raw.as_deref()).unwrap()
    }

    async fn seed(store: &MemoryStore, count: usize, timestamp: DateTime<Utc>) {
        let log = RequestLog::from(vec![LogEntry::at(timestamp); count]);
        store.put("requests", &log.encode().unwrap()).await.unwrap();
    }

    /// Store whose operations always fail.
    #[derive(Debug)]
    struct UnreachableStore;

    #[async_trait]
    impl RequestLogStore for UnreachableStore {
        async fn load(&self, _key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn put(&self, _key: &str, _value: &[u8]) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&[u8]>,
            _value: &[u8],
        ) -> std::result::Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// Store that never answers.
    #[derive(Debug)]
    struct StalledStore;

    #[async_trait]
    impl RequestLogStore for StalledStore {
        async fn load(&self, _key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
            std::future::pending().await
        }

        async fn put(&self, _key: &str, _value: &[u8]) -> std::result::Result<(), StoreError> {
            std::future::pending().await
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&[u8]>,
            _value: &[u8],
        ) -> std::result::Result<bool, StoreError> {
            std::future::pending().await
        }
    }

    /// Memory store that loses the first `conflicts` swaps, as if another
    /// gate had written in between.
    #[derive(Debug)]
    struct ContendedStore {
        inner: MemoryStore,
        conflicts: AtomicUsize,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl RequestLogStore for ContendedStore {
        async fn load(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> std::result::Result<(), StoreError> {
            self.inner.put(key, value).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&[u8]>,
            value: &[u8],
        ) -> std::result::Result<bool, StoreError> {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Ok(false);
            }
            self.inner.compare_and_swap(key, expected, value).await
        }
    }

    #[tokio::test]
    async fn test_first_request_is_admitted_and_recorded() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start());
        let gate = gate_with(&store, &clock, 100);

        assert_eq!(gate.check().await.unwrap(), Admission::Admitted);

        let log = stored_log(&store).await;
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0], LogEntry::at(start()));
    }

    #[tokio::test]
    async fn test_capacity_boundary() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start());
        let gate = gate_with(&store, &clock, 100);

        for i in 0..100 {
            assert_eq!(
                gate.check().await.unwrap(),
                Admission::Admitted,
                "request {} should be admitted",
                i + 1
            );
        }

        assert_eq!(
            gate.check().await.unwrap(),
            Admission::Rejected {
                retry_after: HOUR + Duration::from_secs(1)
            }
        );
        assert_eq!(stored_log(&store).await.len(), 100);
    }

    #[tokio::test]
    async fn test_stale_log_is_cleared() {
        let store = MemoryStore::new();
        seed(&store, 100, start() - TimeDelta::seconds(3601)).await;
        let clock = ManualClock::new(start());
        let gate = gate_with(&store, &clock, 100);

        assert_eq!(gate.check().await.unwrap(), Admission::Admitted);
        assert_eq!(stored_log(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_persists_trimming_without_growth() {
        let store = MemoryStore::new();
        let mut entries = vec![LogEntry::at(start() - TimeDelta::seconds(5000)); 40];
        entries.extend(vec![LogEntry::at(start() - TimeDelta::seconds(1800)); 100]);
        let log = RequestLog::from(entries);
        store.put("requests", &log.encode().unwrap()).await.unwrap();

        let clock = ManualClock::new(start());
        let gate = gate_with(&store, &clock, 100);

        assert_eq!(
            gate.check().await.unwrap(),
            Admission::Rejected {
                retry_after: Duration::from_secs(1801)
            }
        );
        assert_eq!(stored_log(&store).await.len(), 100);
    }

    #[tokio::test]
    async fn test_retry_after_wait_is_admitted() {
        let store = MemoryStore::new();
        seed(&store, 3, start() - TimeDelta::seconds(600)).await;
        let clock = ManualClock::new(start());
        let gate = gate_with(&store, &clock, 3);

        let retry_after = match gate.check().await.unwrap() {
            Admission::Rejected { retry_after } => retry_after,
            other => panic!("expected rejection, got {:?}", other),
        };
        assert_eq!(retry_after, Duration::from_secs(3001));

        clock.advance(TimeDelta::from_std(retry_after).unwrap());
        assert_eq!(gate.check().await.unwrap(), Admission::Admitted);
        assert_eq!(stored_log(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_burst_retry_at_exact_wait_is_admitted() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start());
        let gate = gate_with(&store, &clock, 2);

        assert_eq!(gate.check().await.unwrap(), Admission::Admitted);
        assert_eq!(gate.check().await.unwrap(), Admission::Admitted);
        let retry_after = match gate.check().await.unwrap() {
            Admission::Rejected { retry_after } => retry_after,
            other => panic!("expected rejection, got {:?}", other),
        };

        // A whole window later the burst is exactly on the cutoff and still counts.
        clock.advance(TimeDelta::from_std(HOUR).unwrap());
        assert!(matches!(
            gate.check().await.unwrap(),
            Admission::Rejected { .. }
        ));

        clock.set(start() + TimeDelta::from_std(retry_after).unwrap());
        assert_eq!(gate.check().await.unwrap(), Admission::Admitted);
        assert_eq!(stored_log(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_system_clock_stamps_request_time() {
        let store = MemoryStore::new();
        let gate = Gate::new(Arc::new(store.clone()), WindowPolicy::default());

        let before = Utc::now();
        assert_eq!(gate.check().await.unwrap(), Admission::Admitted);
        let after = Utc::now();

        let log = stored_log(&store).await;
        assert_eq!(log.len(), 1);
        let stamped = log.entries()[0].timestamp;
        assert!(
            before <= stamped && stamped <= after,
            "{} not within [{}, {}]",
            stamped,
            before,
            after
        );
    }

    #[tokio::test]
    async fn test_custom_log_key() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start());
        let gate = gate_with(&store, &clock, 1).with_log_key("slomo:requests");

        assert_eq!(gate.check().await.unwrap(), Admission::Admitted);
        assert!(store.load("slomo:requests").await.unwrap().is_some());
        assert!(store.load("requests").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_log_is_an_error() {
        let store = MemoryStore::new();
        store.put("requests", b"{not a log").await.unwrap();
        let clock = ManualClock::new(start());
        let gate = gate_with(&store, &clock, 100);

        let result = gate.check().await;
        assert!(matches!(result, Err(SlomoError::CorruptLog(_))));
        // The bad value is left for an operator to inspect.
        assert_eq!(
            store.load("requests").await.unwrap(),
            Some(b"{not a log".to_vec())
        );
    }

    #[tokio::test]
    async fn test_unreachable_store_is_an_error() {
        let gate = Gate::new(Arc::new(UnreachableStore), WindowPolicy::default());

        let result = gate.check().await;
        assert!(matches!(
            result,
            Err(SlomoError::Store(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_times_out() {
        let gate = Gate::new(Arc::new(StalledStore), WindowPolicy::default())
            .with_store_timeout(Duration::from_millis(50));

        let result = gate.check().await;
        assert!(matches!(
            result,
            Err(SlomoError::Store(StoreError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_conflict_is_retried_with_fresh_read() {
        let store = ContendedStore {
            inner: MemoryStore::new(),
            conflicts: AtomicUsize::new(2),
            loads: AtomicUsize::new(0),
        };
        let store = Arc::new(store);
        let gate = Gate::new(store.clone(), WindowPolicy::default())
            .with_conflict_backoff(Duration::ZERO);

        assert_eq!(gate.check().await.unwrap(), Admission::Admitted);
        assert_eq!(store.loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_contention_gives_up() {
        let store = ContendedStore {
            inner: MemoryStore::new(),
            conflicts: AtomicUsize::new(usize::MAX),
            loads: AtomicUsize::new(0),
        };
        let gate = Gate::new(Arc::new(store), WindowPolicy::default())
            .with_max_conflict_retries(3)
            .with_conflict_backoff(Duration::ZERO);

        let result = gate.check().await;
        assert!(matches!(result, Err(SlomoError::Contention { attempts: 4 })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gates_never_over_admit() {
        let store = MemoryStore::new();
        let admitted = Arc::new(AtomicUsize::new(0));

        let checks = (0..60).map(|_| {
            let gate = Gate::new(Arc::new(store.clone()), WindowPolicy::new(HOUR, 25))
                .with_max_conflict_retries(128)
                .with_conflict_backoff(Duration::from_millis(1));
            let admitted = admitted.clone();
            tokio::spawn(async move {
                if gate.check().await.unwrap() == Admission::Admitted {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        });
        for result in futures::future::join_all(checks).await {
            result.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 25);
        assert_eq!(stored_log(&store).await.len(), 25);
    }

    #[test]
    fn test_from_config() {
        let limiter = LimiterConfig {
            window_secs: 60,
            capacity: 5,
            log_key: "custom".to_string(),
            on_store_failure: FailurePolicy::FailOpen,
            ..LimiterConfig::default()
        };
        let gate = Gate::from_config(
            Arc::new(MemoryStore::new()),
            &limiter,
            &StoreConfig::default(),
        );

        assert_eq!(gate.policy(), WindowPolicy::new(Duration::from_secs(60), 5));
        assert_eq!(gate.log_key(), "custom");
        assert_eq!(gate.failure_policy(), FailurePolicy::FailOpen);
    }
}
