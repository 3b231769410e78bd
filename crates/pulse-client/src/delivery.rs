//! Delivery loop: the single control loop of the client.
//!
//! Every tick the loop:
//! 1. polls the session,
//! 2. sends a keep-alive once the keep-alive interval has passed since the last
//!    accepted one (a rejected keep-alive ends the tick),
//! 3. once the message interval has passed, re-affirms the session, then encodes
//!    and offers the next batch of request envelopes with bounded retry.
//!
//! The sequence id advances once per created envelope whether or not its offer
//! is eventually accepted, so ids are never reused.

use std::collections::VecDeque;
use std::time::Duration;

use pulse_transport::{ClusterTransport, OfferOutcome, RequestEnvelope};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};
use crate::session::SessionClient;

/// What to do with an envelope whose offer exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedOfferPolicy {
    /// Report the failure and discard the envelope.
    Drop,
    /// Keep the envelope and offer it again, ahead of newer ones, on the next
    /// message tick. Every envelope in a tick is still offered with its own
    /// retry budget. At most `max_pending` failed envelopes are kept; the
    /// oldest are discarded beyond that.
    Redeliver {
        /// Retained envelope bound.
        max_pending: usize,
    },
}

/// Delivery loop timing and retry settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Loop period (default: 1ms).
    pub tick_interval: Duration,
    /// Keep-alive period, measured from the last accepted keep-alive (default: 2s).
    pub keep_alive_interval: Duration,
    /// Message period (default: 1ms).
    pub message_interval: Duration,
    /// Envelopes created per message tick (default: 1).
    pub batch_size: usize,
    /// Offer attempts per envelope (default: 3).
    pub offer_retry_limit: u32,
    /// Failed offer handling (default: drop).
    pub failed_offer_policy: FailedOfferPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1),
            keep_alive_interval: Duration::from_secs(2),
            message_interval: Duration::from_millis(1),
            batch_size: 1,
            offer_retry_limit: 3,
            failed_offer_policy: FailedOfferPolicy::Drop,
        }
    }
}

/// When the loop last fired each action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickTimers {
    /// Last accepted keep-alive.
    pub last_keep_alive: Instant,
    /// Last message tick.
    pub last_message: Instant,
}

impl TickTimers {
    /// Both timers start at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            last_keep_alive: now,
            last_message: now,
        }
    }

    /// Strictly more than `interval` since the last accepted keep-alive.
    pub fn keep_alive_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_keep_alive) > interval
    }

    /// At least `interval` since the last message tick.
    pub fn message_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_message) >= interval
    }
}

/// Keep-alive step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepAliveAction {
    /// Interval has not elapsed.
    #[default]
    NotDue,
    /// Sent and accepted.
    Sent,
    /// Rejected; the rest of the tick was skipped.
    Failed,
}

/// Terminal outcome of offering one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted on attempt `attempts`.
    Delivered {
        /// Attempts used.
        attempts: u32,
    },
    /// Every attempt was rejected.
    Exhausted {
        /// Attempts used.
        attempts: u32,
        /// Outcome of the final attempt.
        last: OfferOutcome,
    },
}

impl SendOutcome {
    /// True for `Delivered`.
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }

    /// Attempts used.
    pub fn attempts(&self) -> u32 {
        match self {
            SendOutcome::Delivered { attempts } | SendOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Outcome for one envelope within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageReport {
    /// Sequence id of the envelope.
    pub tx_id: u64,
    /// How the offer ended.
    pub outcome: SendOutcome,
    /// Earlier ticks on which this envelope already failed.
    pub previous_failures: u32,
}

/// Everything that happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Keep-alive step result.
    pub keep_alive: KeepAliveAction,
    /// Whether the message step ran.
    pub message_tick: bool,
    /// Per-envelope outcomes, in offer order.
    pub messages: Vec<MessageReport>,
    /// Ids given up on this tick; each also has an exhausted entry in `messages`.
    pub dropped: Vec<u64>,
}

impl TickReport {
    /// Envelopes delivered this tick.
    pub fn delivered(&self) -> usize {
        self.messages.iter().filter(|m| m.outcome.is_delivered()).count()
    }
}

/// Running counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Ticks executed.
    pub ticks: u64,
    /// Keep-alives accepted.
    pub keep_alives_sent: u64,
    /// Keep-alives rejected.
    pub keep_alive_failures: u64,
    /// Individual offer calls.
    pub offer_attempts: u64,
    /// Envelopes accepted.
    pub messages_delivered: u64,
    /// Envelope offers that exhausted their retries.
    pub messages_failed: u64,
    /// Envelopes discarded without being delivered.
    pub messages_dropped: u64,
    /// Envelopes accepted after failing on an earlier tick.
    pub messages_redelivered: u64,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    envelope: RequestEnvelope,
    failures: u32,
}

/// The client's top-level control loop.
pub struct DeliveryLoop<T: ClusterTransport> {
    session: SessionClient<T>,
    config: DeliveryConfig,
    next_tx_id: u64,
    timers: TickTimers,
    pending: VecDeque<Pending>,
    stats: DeliveryStats,
}

impl<T: ClusterTransport> DeliveryLoop<T> {
    /// Creates a loop whose timers start at `now`; the first id is 0.
    pub fn new(session: SessionClient<T>, config: DeliveryConfig, now: Instant) -> Self {
        Self {
            session,
            config,
            next_tx_id: 0,
            timers: TickTimers::new(now),
            pending: VecDeque::new(),
            stats: DeliveryStats::default(),
        }
    }

    /// Starts numbering at `tx_id` instead of 0.
    pub fn with_next_tx_id(mut self, tx_id: u64) -> Self {
        self.next_tx_id = tx_id;
        self
    }

    /// Id the next created envelope will carry.
    pub fn next_tx_id(&self) -> u64 {
        self.next_tx_id
    }

    /// Current timers.
    pub fn timers(&self) -> TickTimers {
        self.timers
    }

    /// Counters so far.
    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Envelopes retained for redelivery.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The session client.
    pub fn session(&self) -> &SessionClient<T> {
        &self.session
    }

    /// Runs ticks every `tick_interval` until `cancel` fires.
    ///
    /// Returns an error only if a bounded connect wait times out.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let period = self.config.tick_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.tick(cancel).await {
                Ok(_) => {}
                Err(ClientError::Cancelled) => break,
                Err(err) => return Err(err),
            }
        }

        tracing::info!(
            ticks = self.stats.ticks,
            delivered = self.stats.messages_delivered,
            failed = self.stats.messages_failed,
            next_tx_id = self.next_tx_id,
            "delivery loop stopped"
        );
        Ok(())
    }

    /// Runs one tick at the current time.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> Result<TickReport> {
        self.tick_at(Instant::now(), cancel).await
    }

    /// Runs one tick, judging the timers against `now`.
    pub async fn tick_at(&mut self, now: Instant, cancel: &CancellationToken) -> Result<TickReport> {
        let mut report = TickReport::default();
        self.stats.ticks += 1;

        self.session.poll();

        if self
            .timers
            .keep_alive_due(now, self.config.keep_alive_interval)
        {
            if self.session.send_keep_alive(now) {
                self.timers.last_keep_alive = now;
                self.stats.keep_alives_sent += 1;
                report.keep_alive = KeepAliveAction::Sent;
            } else {
                self.stats.keep_alive_failures += 1;
                report.keep_alive = KeepAliveAction::Failed;
                tracing::warn!("keep-alive not accepted, retrying next tick");
                return Ok(report);
            }
        }

        if self.timers.message_due(now, self.config.message_interval) {
            report.message_tick = true;
            self.session.connect(cancel).await?;

            for _ in 0..self.config.batch_size {
                let envelope = RequestEnvelope::tx_request(self.next_tx_id);
                self.next_tx_id = self.next_tx_id.wrapping_add(1);
                self.pending.push_back(Pending {
                    envelope,
                    failures: 0,
                });
            }
            self.flush_pending(&mut report);
            self.timers.last_message = now;
        }

        Ok(report)
    }

    fn flush_pending(&mut self, report: &mut TickReport) {
        let mut retained = VecDeque::new();
        while let Some(pending) = self.pending.pop_front() {
            let tx_id = pending.envelope.tx_id;
            let outcome = self.offer_with_retry(&pending.envelope);
            report.messages.push(MessageReport {
                tx_id,
                outcome,
                previous_failures: pending.failures,
            });

            match outcome {
                SendOutcome::Delivered { attempts } => {
                    self.stats.messages_delivered += 1;
                    if pending.failures > 0 {
                        self.stats.messages_redelivered += 1;
                    }
                    tracing::info!(tx_id, attempts, "offer accepted");
                }
                SendOutcome::Exhausted { attempts, last } => {
                    self.stats.messages_failed += 1;
                    tracing::warn!(tx_id, attempts, outcome = %last, "offer failed");
                    match self.config.failed_offer_policy {
                        FailedOfferPolicy::Drop => {
                            self.stats.messages_dropped += 1;
                            report.dropped.push(tx_id);
                        }
                        FailedOfferPolicy::Redeliver { .. } => retained.push_back(Pending {
                            failures: pending.failures + 1,
                            ..pending
                        }),
                    }
                }
            }
        }

        if let FailedOfferPolicy::Redeliver { max_pending } = self.config.failed_offer_policy {
            while retained.len() > max_pending {
                if let Some(shed) = retained.pop_front() {
                    let tx_id = shed.envelope.tx_id;
                    self.stats.messages_dropped += 1;
                    report.dropped.push(tx_id);
                    tracing::warn!(
                        tx_id,
                        failures = shed.failures,
                        "redelivery queue full, dropping"
                    );
                }
            }
        }
        self.pending = retained;
    }

    fn offer_with_retry(&mut self, envelope: &RequestEnvelope) -> SendOutcome {
        let buffer = envelope.encode();
        tracing::debug!(
            tx_id = envelope.tx_id,
            is_connected = self.session.is_connected(),
            leader_member_id = ?self.session.leader_id(),
            "sending payload"
        );

        let mut attempts = 0;
        loop {
            attempts += 1;
            self.stats.offer_attempts += 1;
            let outcome = self.session.offer(&buffer);
            if outcome.is_accepted() {
                return SendOutcome::Delivered { attempts };
            }
            if attempts >= self.config.offer_retry_limit {
                return SendOutcome::Exhausted {
                    attempts,
                    last: outcome,
                };
            }
            self.session.poll();
        }
    }
}

impl<T: ClusterTransport> std::fmt::Debug for DeliveryLoop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryLoop")
            .field("session", &self.session)
            .field("next_tx_id", &self.next_tx_id)
            .field("pending", &self.pending.len())
            .field("stats", &self.stats)
            .finish()
    }
}
