//! Quota limiter implementation

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::exit::{ExitHandler, HandlerId};

use super::LimiterError;
use super::config::QuotaConfig;
use super::reservoir::{DailyReservoir, ShortGate};

/// Counters for one limiter
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LimiterStats {
    /// Operations admitted by both gates
    pub total_admitted: u64,
    /// Admissions that had to wait on the short-interval gate
    pub total_short_delayed: u64,
    /// Admissions that had to wait on the daily reservoir
    pub total_daily_delayed: u64,
    /// Rate-limit responses reported through `penalize`
    pub total_penalties: u64,
}

/// Point-in-time view of the gates
#[derive(Debug, Clone)]
pub struct LimiterState {
    pub short_tokens: u32,
    pub daily_remaining: u64,
    pub next_daily_refill: Instant,
    pub disposed: bool,
}

/// Gate state protected by mutex
struct LimiterInner {
    short: ShortGate,
    daily: DailyReservoir,
    stats: LimiterStats,
}

enum Admission {
    Admitted,
    ShortWait(Duration),
    DailyWait(Duration),
}

/// Dual-reservoir limiter for one quota-constrained API
///
/// Every operation passes the short-interval gate first and the daily
/// reservoir second. Callers queue on a fair mutex, so operations scheduled
/// in order are admitted in order.
pub struct QuotaLimiter {
    name: String,
    config: QuotaConfig,
    inner: Mutex<LimiterInner>,
    admission: Mutex<()>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    exit_binding: StdMutex<Option<(ExitHandler, HandlerId)>>,
}

impl std::fmt::Debug for QuotaLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl QuotaLimiter {
    /// Create a per-call limiter; it is not registered for shutdown
    pub fn new(name: impl Into<String>, config: QuotaConfig) -> Result<Self, LimiterError> {
        let name = name.into();
        debug!(%name, ?config, "QuotaLimiter::new: called");
        config.validate()?;

        let now = Instant::now();
        Ok(Self {
            inner: Mutex::new(LimiterInner {
                short: ShortGate::new(&config, now),
                daily: DailyReservoir::new(config.daily_limit, now),
                stats: LimiterStats::default(),
            }),
            name,
            config,
            admission: Mutex::new(()),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            exit_binding: StdMutex::new(None),
        })
    }

    /// Create a process-lifetime limiter whose disposal runs at shutdown
    pub fn shared(name: impl Into<String>, config: QuotaConfig, exit: &ExitHandler) -> Result<Arc<Self>, LimiterError> {
        let limiter = Arc::new(Self::new(name, config)?);

        let weak = Arc::downgrade(&limiter);
        let id = exit
            .bind(move || {
                let weak = weak.clone();
                async move {
                    if let Some(limiter) = weak.upgrade() {
                        limiter.dispose();
                    }
                    Ok(())
                }
            })?;

        *limiter.exit_binding.lock().unwrap_or_else(PoisonError::into_inner) = Some((exit.clone(), id));
        debug!(name = %limiter.name, %id, "QuotaLimiter::shared: disposal bound to exit handler");
        Ok(limiter)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Run `operation` once both gates admit it
    ///
    /// Waits without bound while the daily reservoir is empty; wrap the call
    /// in `tokio::time::timeout` when a deadline is needed.
    pub async fn schedule<F, Fut, R>(&self, operation: F) -> Result<R, LimiterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.admit().await?;
        Ok(operation().await)
    }

    async fn admit(&self) -> Result<(), LimiterError> {
        debug!(name = %self.name, "QuotaLimiter::admit: called");
        if self.is_disposed() {
            return Err(LimiterError::Disposed(self.name.clone()));
        }

        let _turn = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(LimiterError::Disposed(self.name.clone())),
            turn = self.admission.lock() => turn,
        };

        let mut short_delayed = false;
        let mut daily_delayed = false;

        loop {
            if self.is_disposed() {
                return Err(LimiterError::Disposed(self.name.clone()));
            }

            let admission = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();

                let short_wait = inner.short.wait(now);
                if !short_wait.is_zero() {
                    if !short_delayed {
                        short_delayed = true;
                        inner.stats.total_short_delayed += 1;
                    }
                    Admission::ShortWait(short_wait)
                } else {
                    let daily_wait = inner.daily.wait(now);
                    if !daily_wait.is_zero() {
                        if !daily_delayed {
                            daily_delayed = true;
                            inner.stats.total_daily_delayed += 1;
                        }
                        Admission::DailyWait(daily_wait)
                    } else {
                        inner.short.consume(now);
                        inner.daily.consume();
                        inner.stats.total_admitted += 1;
                        Admission::Admitted
                    }
                }
            };

            let wait = match admission {
                Admission::Admitted => {
                    debug!(name = %self.name, "QuotaLimiter::admit: admitted");
                    return Ok(());
                }
                Admission::ShortWait(wait) => {
                    debug!(name = %self.name, ?wait, "QuotaLimiter::admit: short-interval gate closed");
                    wait
                }
                Admission::DailyWait(wait) => {
                    warn!(name = %self.name, ?wait, "Daily quota exhausted, waiting for refill");
                    wait
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(LimiterError::Disposed(self.name.clone())),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Handle a rate-limit response from the remote API
    ///
    /// Drains the short-interval reservoir and holds every admission until
    /// `retry_after` has passed.
    pub async fn penalize(&self, retry_after: Duration) {
        debug!(name = %self.name, ?retry_after, "QuotaLimiter::penalize: called");
        warn!(name = %self.name, ?retry_after, "Received rate limit from API");

        let mut inner = self.inner.lock().await;
        inner.short.drain(Instant::now(), retry_after);
        inner.stats.total_penalties += 1;
    }

    /// Stop both gates and reject every waiting and future caller
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!(name = %self.name, "QuotaLimiter::dispose: already disposed");
            return;
        }

        self.cancel.cancel();

        let binding = self.exit_binding.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((exit, id)) = binding {
            debug!(name = %self.name, %id, "QuotaLimiter::dispose: detaching from exit handler");
            exit.unbind(id);
        }

        info!(name = %self.name, "Quota limiter disposed");
    }

    pub async fn stats(&self) -> LimiterStats {
        self.inner.lock().await.stats.clone()
    }

    pub async fn state(&self) -> LimiterState {
        let inner = self.inner.lock().await;
        LimiterState {
            short_tokens: inner.short.tokens(Instant::now()),
            daily_remaining: inner.daily.remaining(),
            next_daily_refill: inner.daily.next_refill(),
            disposed: self.is_disposed(),
        }
    }
}
