//! Idle strategies for poll loops.
//!
//! A poll loop feeds the work count returned by `poll` into an idle strategy.
//! When work was done the strategy returns immediately; otherwise it backs off
//! so that waiting for a connection does not pin a CPU.

use std::time::Duration;

use async_trait::async_trait;

/// Backoff policy applied between unproductive polls.
#[async_trait]
pub trait IdleStrategy: Send {
    /// Idles according to how much work the last poll did.
    async fn idle(&mut self, work_count: usize);

    /// Resets any accumulated backoff.
    fn reset(&mut self);
}

/// Configuration for `BackoffIdleStrategy`.
#[derive(Debug, Clone)]
pub struct BackoffIdleConfig {
    /// Busy-spin iterations before yielding (default: 10).
    pub max_spins: u32,
    /// Task yields before parking (default: 5).
    pub max_yields: u32,
    /// First park duration (default: 1µs).
    pub min_park: Duration,
    /// Park duration cap (default: 1ms).
    pub max_park: Duration,
}

impl Default for BackoffIdleConfig {
    fn default() -> Self {
        Self {
            max_spins: 10,
            max_yields: 5,
            min_park: Duration::from_micros(1),
            max_park: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffPhase {
    NotIdle,
    Spinning,
    Yielding,
    Parking,
}

/// Spin, then yield, then park with exponentially growing sleeps.
#[derive(Debug, Clone)]
pub struct BackoffIdleStrategy {
    config: BackoffIdleConfig,
    phase: BackoffPhase,
    spins: u32,
    yields: u32,
    park: Duration,
}

impl BackoffIdleStrategy {
    /// Creates a strategy with the given configuration.
    pub fn new(config: BackoffIdleConfig) -> Self {
        let park = config.min_park;
        Self {
            config,
            phase: BackoffPhase::NotIdle,
            spins: 0,
            yields: 0,
            park,
        }
    }

    /// Current park duration, i.e. what the next parking idle will sleep.
    pub fn park_period(&self) -> Duration {
        self.park
    }

    /// Returns true once the strategy has escalated to parking.
    pub fn is_parking(&self) -> bool {
        self.phase == BackoffPhase::Parking
    }
}

impl Default for BackoffIdleStrategy {
    fn default() -> Self {
        Self::new(BackoffIdleConfig::default())
    }
}

#[async_trait]
impl IdleStrategy for BackoffIdleStrategy {
    async fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }

        match self.phase {
            BackoffPhase::NotIdle => {
                self.phase = BackoffPhase::Spinning;
                self.spins = 1;
                std::hint::spin_loop();
            }
            BackoffPhase::Spinning => {
                std::hint::spin_loop();
                self.spins += 1;
                if self.spins > self.config.max_spins {
                    self.phase = BackoffPhase::Yielding;
                    self.yields = 0;
                }
            }
            BackoffPhase::Yielding => {
                self.yields += 1;
                if self.yields > self.config.max_yields {
                    self.phase = BackoffPhase::Parking;
                    self.park = self.config.min_park;
                } else {
                    tokio::task::yield_now().await;
                }
            }
            BackoffPhase::Parking => {
                tokio::time::sleep(self.park).await;
                self.park = (self.park * 2).min(self.config.max_park);
            }
        }
    }

    fn reset(&mut self) {
        self.phase = BackoffPhase::NotIdle;
        self.spins = 0;
        self.yields = 0;
        self.park = self.config.min_park;
    }
}

/// Sleeps a fixed period whenever no work was done.
#[derive(Debug, Clone)]
pub struct SleepingIdleStrategy {
    period: Duration,
}

impl SleepingIdleStrategy {
    /// Creates a strategy sleeping `period` per idle call.
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

#[async_trait]
impl IdleStrategy for SleepingIdleStrategy {
    async fn idle(&mut self, work_count: usize) {
        if work_count == 0 {
            tokio::time::sleep(self.period).await;
        }
    }

    fn reset(&mut self) {}
}
