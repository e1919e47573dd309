//! Daily cost accrual over the two provider series.
//!
//! The engine is a pull-based state machine: on each tick it reads the two
//! coordinators' cached snapshots (never triggering a fetch), checks the
//! wall-clock date against the stored anchor date, and either
//! re-anchors (day rollover) or computes the cost accrued since the
//! start-of-day anchor. The anchor pair is the only state persisted across
//! restarts.
//!
//! Cost semantics: the meter balance falls as gas is consumed and jumps
//! when a recharge posts. Within one accounting day,
//!
//! ```text
//! cost = anchor_balance - balance              (no recharge settled)
//! cost = anchor_balance + recharge - balance   (recharge settled yesterday)
//! ```
//!
//! so every intra-day tick yields cost-since-start-of-day, not
//! cost-since-last-tick, and a settled top-up is not double-counted as
//! negative consumption.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::coordinator::RefreshCoordinator;
use crate::models::{AccrualState, BalanceSnapshot, CostReading, RechargeTotal};
use crate::source::DataSource;
use crate::store::StateStore;

// ---

pub struct CostAccrualEngine<B, R, S>
where
    B: DataSource<Output = BalanceSnapshot>,
    R: DataSource<Output = RechargeTotal>,
    S: StateStore,
{
    // ---
    balance: Arc<RefreshCoordinator<B>>,
    recharge: Arc<RefreshCoordinator<R>>,
    store: S,

    /// Single writer: only `tick_on` mutates, under this lock.
    state: Mutex<AccrualState>,
    /// Latest published reading for the HTTP layer; readers see the
    /// previous or the new value, never a torn one.
    latest: RwLock<CostReading>,
}

impl<B, R, S> CostAccrualEngine<B, R, S>
where
    B: DataSource<Output = BalanceSnapshot>,
    R: DataSource<Output = RechargeTotal>,
    S: StateStore,
{
    // ---
    pub fn new(
        balance: Arc<RefreshCoordinator<B>>,
        recharge: Arc<RefreshCoordinator<R>>,
        store: S,
        restored: AccrualState,
    ) -> Self {
        // ---
        if restored.is_initialized() {
            tracing::info!(
                "Resuming with restored anchor: {:.2} on {}",
                restored.anchor_balance.unwrap_or_default(),
                restored.anchor_date.map(|d| d.to_string()).unwrap_or_default()
            );
        } else {
            tracing::info!("No usable anchor restored, starting uninitialized");
        }

        Self {
            balance,
            recharge,
            store,
            state: Mutex::new(restored),
            latest: RwLock::new(CostReading::default()),
        }
    }

    /// One tick against the host wall clock.
    pub async fn tick(&self) -> CostReading {
        // ---
        self.tick_on(Local::now().date_naive()).await
    }

    /// One tick with an explicit observation date.
    ///
    /// Reads both coordinator caches, rolls the anchor over when the date
    /// has advanced past it, and publishes the recomputed cost. Missing
    /// upstream data degrades the reading (`available = false`) instead of
    /// failing the tick.
    pub async fn tick_on(&self, today: NaiveDate) -> CostReading {
        // ---
        let snapshot = self.balance.current();
        let balance = snapshot.as_ref().and_then(|s| s.meter_balance());

        // Only a total settled on the day immediately preceding `today`
        // counts; right after midnight the cache may still hold the
        // previous query window, which must read as zero, not as a top-up
        let recharge = self
            .recharge
            .current()
            .filter(|r| r.date.succ_opt() == Some(today))
            .map(|r| r.total)
            .unwrap_or(0.0);

        let mut state = self.state.lock().await;
        let reading = match (state.anchor_date, state.anchor_balance) {
            // Subsequent tick within the same accounting day: the anchor
            // stays put so every re-evaluation is cost-since-start-of-day
            (Some(anchor_date), Some(anchor_balance)) if anchor_date == today => {
                let current = balance.unwrap_or(0.0);
                let value = if recharge > 0.0 {
                    anchor_balance + recharge - current
                } else {
                    anchor_balance - current
                };
                CostReading {
                    value,
                    available: balance.is_some(),
                }
            }

            // Day rollover, first-ever tick, or a half-restored anchor:
            // re-baseline on the current balance and report a zero day start
            _ => match balance {
                Some(balance) => {
                    state.anchor_balance = Some(balance);
                    state.anchor_date = Some(today);
                    if let Err(e) = self.store.save(&state).await {
                        // The in-memory anchor stays authoritative; the
                        // next rollover retries the write
                        tracing::error!("Failed to persist accrual state: {}", e);
                    }
                    tracing::info!("Day rollover: anchored balance {:.2} on {}", balance, today);
                    CostReading {
                        value: 0.0,
                        available: true,
                    }
                }
                None => {
                    // An anchor taken with no balance data would poison the
                    // whole day's costs; stay unanchored until data arrives
                    tracing::debug!("No balance snapshot yet, deferring rollover");
                    CostReading {
                        value: 0.0,
                        available: false,
                    }
                }
            },
        };
        drop(state);

        *self.latest.write().unwrap() = reading;
        reading
    }

    /// The most recently published cost reading.
    pub fn latest(&self) -> CostReading {
        // ---
        *self.latest.read().unwrap()
    }

    /// Snapshot of the current anchor state.
    pub async fn state(&self) -> AccrualState {
        // ---
        self.state.lock().await.clone()
    }

    /// Spawn the recurring tick loop on its own cadence, independent from
    /// the coordinators' timers. First tick fires immediately.
    pub fn spawn_ticking(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        // ---
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

// ---
