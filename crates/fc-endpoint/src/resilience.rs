//! ResilienceContext - Per-endpoint health state machine
//!
//! States: ACTIVE, TIMEOUT_RETRY, SUSPENDED, ADMIN_OFF.
//!
//! Health is an immutable [`HealthSnapshot`] behind an `ArcSwap`. Readers
//! load it without locking; every transition is a pure function of the
//! current snapshot, published with compare-and-swap and recomputed when
//! another message won the race. Concurrent faults therefore never lose an
//! update, and a second suspension always extends the first. Logging and
//! metrics run once, after the winning swap.
//!
//! Recovery from SUSPENDED is lazy: the first readiness check after the
//! suspension deadline moves the endpoint back to ACTIVE.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, Guard};
use chrono::Utc;
use fc_common::{EndpointHealthReport, EndpointState};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::policy::SuspendSettings;

/// Copy of the mutable health fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSnapshot {
    pub state: EndpointState,
    pub consecutive_timeouts: u32,
    /// Duration of the running (or most recent) suspension
    pub current_suspend_ms: Option<u64>,
    pub suspend_until: Option<Instant>,
    /// Earliest time a timed-out endpoint may be retried
    pub retry_at: Option<Instant>,
    pub last_error_code: Option<i32>,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            state: EndpointState::Active,
            consecutive_timeouts: 0,
            current_suspend_ms: None,
            suspend_until: None,
            retry_at: None,
            last_error_code: None,
        }
    }
}

impl HealthSnapshot {
    fn is_ready_at(&self, now: Instant) -> bool {
        let retry_due = self.state != EndpointState::TimeoutRetry || self.retry_at.map_or(true, |at| now >= at);
        self.state.accepts_traffic() && retry_due
    }

    /// Lazy expiry of a finished suspension
    fn expired(mut self, now: Instant) -> (Self, bool) {
        let expired = self.state == EndpointState::Suspended && self.suspend_until.map_or(true, |until| now >= until);
        if expired {
            self.state = EndpointState::Active;
            self.suspend_until = None;
        }
        (self, expired)
    }

    fn suspended(mut self, settings: &SuspendSettings, now: Instant) -> (Self, Transition) {
        let duration_ms = settings.first_suspend_ms();
        self.state = EndpointState::Suspended;
        self.consecutive_timeouts = 0;
        self.retry_at = None;
        self.current_suspend_ms = Some(duration_ms);
        self.suspend_until = Some(deadline(now, duration_ms));
        (self, Transition::Suspended { suspend_ms: duration_ms })
    }

    fn extended(mut self, settings: &SuspendSettings, now: Instant) -> (Self, Transition) {
        let previous_ms = self.current_suspend_ms.unwrap_or_else(|| settings.first_suspend_ms());
        let duration_ms = settings.next_suspend_ms(previous_ms);
        let until = deadline(now, duration_ms);

        self.current_suspend_ms = Some(duration_ms);
        self.suspend_until = Some(self.suspend_until.map_or(until, |existing| existing.max(until)));
        (
            self,
            Transition::Extended {
                previous_ms,
                suspend_ms: duration_ms,
            },
        )
    }
}

/// What a committed update did, for logging and metrics
#[derive(Debug, Clone, Copy, PartialEq)]
enum Transition {
    Unchanged,
    Expired,
    TimeoutRetry,
    Suspended { suspend_ms: u64 },
    Extended { previous_ms: u64, suspend_ms: u64 },
    Recovered { previous: EndpointState },
    SwitchedOff { previous: EndpointState },
    SwitchedOn,
}

pub struct ResilienceContext {
    endpoint: String,
    health: ArcSwap<HealthSnapshot>,
}

impl ResilienceContext {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            health: ArcSwap::from_pointee(HealthSnapshot::default()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        **self.health.load()
    }

    /// Current state without applying lazy recovery
    pub fn state(&self) -> EndpointState {
        self.health.load().state
    }

    pub fn ready_to_send(&self) -> bool {
        self.ready_to_send_at(Instant::now())
    }

    pub fn ready_to_send_at(&self, now: Instant) -> bool {
        let (health, transition) = self.update(|current| {
            let (next, expired) = current.expired(now);
            (next, if expired { Transition::Expired } else { Transition::Unchanged })
        });
        self.announce(&health, transition, None);
        health.is_ready_at(now)
    }

    /// Apply a timeout-classified fault
    pub fn on_timeout(&self, settings: &SuspendSettings, error_code: Option<i32>) -> EndpointState {
        self.on_timeout_at(settings, error_code, Instant::now())
    }

    pub fn on_timeout_at(&self, settings: &SuspendSettings, error_code: Option<i32>, now: Instant) -> EndpointState {
        let (health, transition) = self.update(|current| {
            let (mut next, _) = current.expired(now);
            next.last_error_code = error_code;

            match next.state {
                EndpointState::AdminOff => (next, Transition::Unchanged),
                EndpointState::Suspended => next.extended(settings, now),
                EndpointState::Active | EndpointState::TimeoutRetry => {
                    if next.consecutive_timeouts < settings.retries_on_timeout_before_suspend {
                        next.consecutive_timeouts += 1;
                        next.state = EndpointState::TimeoutRetry;
                        next.retry_at = Some(deadline(now, settings.retry_duration_on_timeout_ms));
                        (next, Transition::TimeoutRetry)
                    } else {
                        next.suspended(settings, now)
                    }
                }
            }
        });

        if transition == Transition::TimeoutRetry {
            warn!(
                endpoint = %self.endpoint,
                error_code = ?error_code,
                consecutive_timeouts = health.consecutive_timeouts,
                retries_before_suspend = settings.retries_on_timeout_before_suspend,
                retry_in_ms = settings.retry_duration_on_timeout_ms,
                "Endpoint timed out, will retry before suspending"
            );
        }
        self.announce(&health, transition, error_code);
        health.state
    }

    /// Apply a suspend-classified fault
    pub fn on_suspend_fault(&self, settings: &SuspendSettings, error_code: Option<i32>) -> EndpointState {
        self.on_suspend_fault_at(settings, error_code, Instant::now())
    }

    pub fn on_suspend_fault_at(
        &self,
        settings: &SuspendSettings,
        error_code: Option<i32>,
        now: Instant,
    ) -> EndpointState {
        let (health, transition) = self.update(|current| {
            let (mut next, _) = current.expired(now);
            next.last_error_code = error_code;

            match next.state {
                EndpointState::AdminOff => (next, Transition::Unchanged),
                EndpointState::Suspended => next.extended(settings, now),
                EndpointState::Active | EndpointState::TimeoutRetry => next.suspended(settings, now),
            }
        });

        self.announce(&health, transition, error_code);
        health.state
    }

    /// Record a fault that is neither a timeout nor suspending
    pub fn record_ignored_fault(&self, error_code: Option<i32>) {
        self.update(|current| {
            let next = HealthSnapshot {
                last_error_code: error_code,
                ..*current
            };
            (next, Transition::Unchanged)
        });
    }

    /// Successful delivery: back to ACTIVE with counters cleared.
    ///
    /// An endpoint switched off by an operator stays off.
    pub fn on_success(&self) {
        let (health, transition) = self.update(|current| {
            let mut next = HealthSnapshot {
                consecutive_timeouts: 0,
                current_suspend_ms: None,
                suspend_until: None,
                retry_at: None,
                ..*current
            };
            match current.state {
                EndpointState::AdminOff | EndpointState::Active => (next, Transition::Unchanged),
                EndpointState::TimeoutRetry | EndpointState::Suspended => {
                    next.state = EndpointState::Active;
                    (next, Transition::Recovered { previous: current.state })
                }
            }
        });
        self.announce(&health, transition, None);
    }

    /// Operator switch-off; overrides every automatic transition
    pub fn switch_off(&self) {
        let (health, transition) = self.update(|current| {
            let next = HealthSnapshot {
                state: EndpointState::AdminOff,
                suspend_until: None,
                retry_at: None,
                ..*current
            };
            let transition = if current.state == EndpointState::AdminOff {
                Transition::Unchanged
            } else {
                Transition::SwitchedOff { previous: current.state }
            };
            (next, transition)
        });
        self.announce(&health, transition, None);
    }

    /// Operator switch-on; the endpoint starts clean
    pub fn switch_on(&self) {
        let (health, transition) = self.update(|current| {
            let next = HealthSnapshot {
                last_error_code: current.last_error_code,
                ..HealthSnapshot::default()
            };
            let transition = if current.state == EndpointState::AdminOff {
                Transition::SwitchedOn
            } else {
                Transition::Unchanged
            };
            (next, transition)
        });
        self.announce(&health, transition, None);
    }

    pub fn report(&self) -> EndpointHealthReport {
        let health = self.snapshot();
        let now = Instant::now();
        let now_utc = Utc::now();

        let suspended_until = health.suspend_until.and_then(|until| {
            chrono::Duration::from_std(until.saturating_duration_since(now))
                .ok()
                .and_then(|remaining| now_utc.checked_add_signed(remaining))
        });

        EndpointHealthReport {
            endpoint: self.endpoint.clone(),
            state: health.state,
            consecutive_timeouts: health.consecutive_timeouts,
            current_suspend_duration_ms: health.current_suspend_ms,
            suspended_until,
            last_error_code: health.last_error_code,
            reported_at: now_utc,
        }
    }

    /// Compare-and-swap loop. `apply` may run more than once, so it must be pure.
    fn update<F>(&self, apply: F) -> (HealthSnapshot, Transition)
    where
        F: Fn(&HealthSnapshot) -> (HealthSnapshot, Transition),
    {
        let mut current = self.health.load_full();
        loop {
            let (next, transition) = apply(&current);
            if next == *current {
                return (next, transition);
            }

            let previous = self.health.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                return (next, transition);
            }
            current = Guard::into_inner(previous);
        }
    }

    fn announce(&self, health: &HealthSnapshot, transition: Transition, error_code: Option<i32>) {
        match transition {
            Transition::Unchanged => {}
            Transition::Expired => {
                metrics::record_recovery(&self.endpoint);
                info!(
                    endpoint = %self.endpoint,
                    suspended_ms = ?health.current_suspend_ms,
                    "Endpoint suspension expired, back to active"
                );
            }
            Transition::TimeoutRetry => metrics::record_timeout(&self.endpoint),
            Transition::Suspended { suspend_ms } => {
                metrics::record_suspension(&self.endpoint);
                warn!(
                    endpoint = %self.endpoint,
                    error_code = ?error_code,
                    suspend_ms = suspend_ms,
                    "Endpoint suspended"
                );
            }
            Transition::Extended {
                previous_ms,
                suspend_ms,
            } => {
                metrics::record_suspension(&self.endpoint);
                debug!(
                    endpoint = %self.endpoint,
                    error_code = ?error_code,
                    previous_ms = previous_ms,
                    suspend_ms = suspend_ms,
                    "Endpoint suspension extended"
                );
            }
            Transition::Recovered { previous } => {
                metrics::record_recovery(&self.endpoint);
                info!(endpoint = %self.endpoint, previous = ?previous, "Endpoint recovered after successful delivery");
            }
            Transition::SwitchedOff { previous } => {
                info!(endpoint = %self.endpoint, previous = ?previous, "Endpoint switched off");
            }
            Transition::SwitchedOn => info!(endpoint = %self.endpoint, "Endpoint switched on"),
        }
    }
}

impl std::fmt::Debug for ResilienceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceContext")
            .field("endpoint", &self.endpoint)
            .field("health", &self.snapshot())
            .finish()
    }
}

/// `now + ms`, clamped far into the future instead of overflowing
fn deadline(now: Instant, ms: u64) -> Instant {
    now.checked_add(Duration::from_millis(ms))
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}
