//! Refresh coordination for the provider data series.
//!
//! Each [`RefreshCoordinator`] owns one [`DataSource`], a recurring timer,
//! and the last successfully fetched snapshot. The accrual engine and the
//! HTTP layer only ever read the cache; a failed fetch leaves it untouched,
//! so readers see last-known-good data through provider outages.
//!
//! Refreshes are single-flight: the timer skips a tick while a fetch is
//! still in the air, and concurrent on-demand callers queue behind the
//! in-flight fetch and share its result instead of issuing their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::source::{DataSource, FetchError};

// ---

pub struct RefreshCoordinator<S: DataSource> {
    // ---
    name: &'static str,
    source: S,
    sn: String,
    period: Duration,

    /// Held for the duration of one fetch; the single-flight gate.
    flight: Mutex<()>,
    /// Bumped on every successful publish. Lets a caller that waited out
    /// someone else's fetch detect that the cache is already fresher than
    /// when it arrived.
    generation: AtomicU64,
    cache: RwLock<Option<Arc<S::Output>>>,
}

impl<S: DataSource> RefreshCoordinator<S> {
    // ---
    pub fn new(name: &'static str, source: S, sn: impl Into<String>, period: Duration) -> Self {
        // ---
        Self {
            name,
            source,
            sn: sn.into(),
            period,
            flight: Mutex::new(()),
            generation: AtomicU64::new(0),
            cache: RwLock::new(None),
        }
    }

    /// The most recent successfully fetched snapshot, if any fetch has ever
    /// succeeded. Readers observe old-or-new, never a partial snapshot.
    pub fn current(&self) -> Option<Arc<S::Output>> {
        // ---
        self.cache.read().unwrap().clone()
    }

    /// On-demand refresh. Queues behind any in-flight fetch; if that fetch
    /// published a snapshot while we waited, it is returned as-is rather
    /// than hitting the provider a second time.
    pub async fn refresh(&self) -> Result<Arc<S::Output>, FetchError> {
        // ---
        let seen = self.generation.load(Ordering::Acquire);
        let _flight = self.flight.lock().await;

        if self.generation.load(Ordering::Acquire) != seen {
            if let Some(snapshot) = self.current() {
                tracing::debug!("{}: refresh satisfied by concurrent fetch", self.name);
                return Ok(snapshot);
            }
        }

        self.fetch_and_publish().await
    }

    /// Timer entry point. Attempts a refresh unless the previous one is
    /// still in flight, in which case this tick is skipped entirely.
    pub async fn poll_once(&self) {
        // ---
        match self.flight.try_lock() {
            Ok(_flight) => {
                if let Err(e) = self.fetch_and_publish().await {
                    tracing::warn!(
                        "{}: scheduled refresh failed, keeping last snapshot: {}",
                        self.name,
                        e
                    );
                }
            }
            Err(_) => {
                tracing::debug!("{}: previous fetch still in flight, skipping tick", self.name);
            }
        }
    }

    /// Caller must hold the flight lock. On failure the cache is untouched.
    async fn fetch_and_publish(&self) -> Result<Arc<S::Output>, FetchError> {
        // ---
        let output = self.source.fetch(&self.sn).await?;
        let snapshot = Arc::new(output);

        *self.cache.write().unwrap() = Some(Arc::clone(&snapshot));
        let generation = self.generation.fetch_add(1, Ordering::Release) + 1;
        tracing::debug!("{}: published snapshot generation {}", self.name, generation);

        Ok(snapshot)
    }

    /// Spawn the recurring polling loop. The first tick fires immediately
    /// so a snapshot is available right after startup; missed ticks are
    /// delayed, not bunched.
    pub fn spawn_polling(self: Arc<Self>) -> JoinHandle<()> {
        // ---
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }
}

// ---

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{BalanceSnapshot, KEY_METER_BALANCE};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    const SCAN_PERIOD: Duration = Duration::from_secs(3600);

    fn snapshot(balance: f64) -> BalanceSnapshot {
        // ---
        BalanceSnapshot {
            readings: [(KEY_METER_BALANCE.to_string(), balance)].into_iter().collect(),
            captured_at: Utc::now(),
        }
    }

    /// Source that blocks inside `fetch` until the test releases the gate,
    /// counting every network-level call it receives.
    struct GatedSource {
        calls: Arc<AtomicUsize>,
        gate: Arc<Semaphore>,
        balance: f64,
    }

    #[async_trait]
    impl DataSource for GatedSource {
        type Output = BalanceSnapshot;

        async fn fetch(&self, _sn: &str) -> Result<BalanceSnapshot, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.unwrap();
            Ok(snapshot(self.balance))
        }
    }

    /// Source that succeeds once, then fails on every later call.
    struct FlakySource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DataSource for FlakySource {
        type Output = BalanceSnapshot;

        async fn fetch(&self, _sn: &str) -> Result<BalanceSnapshot, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(snapshot(100.0))
            } else {
                Err(FetchError::EmptyPage)
            }
        }
    }

    #[tokio::test]
    async fn current_is_absent_before_any_fetch() {
        // ---
        let coordinator = RefreshCoordinator::new(
            "balance",
            FlakySource { calls: AtomicUsize::new(0) },
            "sn-1",
            SCAN_PERIOD,
        );
        assert!(coordinator.current().is_none());
    }

    #[tokio::test]
    async fn concurrent_refreshes_collapse_into_one_fetch() {
        // ---
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let coordinator = Arc::new(RefreshCoordinator::new(
            "balance",
            GatedSource {
                calls: Arc::clone(&calls),
                gate: Arc::clone(&gate),
                balance: 123.0,
            },
            "sn-1",
            SCAN_PERIOD,
        ));

        let first = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.refresh().await }
        });

        // Wait until the first caller is inside the source, holding the
        // flight lock
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.refresh().await }
        });

        // Give the second caller time to record the generation and queue on
        // the flight lock before the fetch completes
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gate.add_permits(2);
        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1, "second caller must reuse the in-flight fetch");
        assert!(Arc::ptr_eq(&a, &b), "both callers observe the same snapshot");
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_previous_snapshot() {
        // ---
        let coordinator = RefreshCoordinator::new(
            "balance",
            FlakySource { calls: AtomicUsize::new(0) },
            "sn-1",
            SCAN_PERIOD,
        );

        let good = coordinator.refresh().await.unwrap();
        assert_eq!(good.meter_balance(), Some(100.0));

        let err = coordinator.refresh().await;
        assert!(err.is_err());

        let cached = coordinator.current().expect("snapshot must survive the failure");
        assert!(Arc::ptr_eq(&good, &cached));
    }

    #[tokio::test]
    async fn timer_tick_skips_while_a_fetch_is_in_flight() {
        // ---
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let coordinator = Arc::new(RefreshCoordinator::new(
            "balance",
            GatedSource {
                calls: Arc::clone(&calls),
                gate: Arc::clone(&gate),
                balance: 50.0,
            },
            "sn-1",
            SCAN_PERIOD,
        ));

        let inflight = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.refresh().await }
        });
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // A timer tick arriving now must not start a second fetch
        coordinator.poll_once().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gate.add_permits(1);
        inflight.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
