use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Failure-rate threshold expressed as `"numerator/denominator"`. The
/// denominator doubles as the size of the per-server outcome register and
/// is capped at [`Threshold::MAX_DENOMINATOR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    pub numerator: u32,
    pub denominator: u32,
}

impl Threshold {
    pub const MAX_DENOMINATOR: u32 = 128;
}

#[derive(Debug, thiserror::Error)]
#[error("invalid error-rate threshold '{0}': expected 'N/D' with 0 < N <= D <= 128")]
pub struct InvalidThreshold(String);

impl std::str::FromStr for Threshold {
    type Err = InvalidThreshold;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidThreshold(s.to_string());
        let (numerator, denominator) = s.split_once('/').ok_or_else(invalid)?;
        let numerator: u32 = numerator.parse().map_err(|_| invalid())?;
        let denominator: u32 = denominator.parse().map_err(|_| invalid())?;
        if numerator == 0
            || denominator == 0
            || numerator > denominator
            || denominator > Self::MAX_DENOMINATOR
        {
            return Err(invalid());
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }
}

/// When and for how long a misbehaving server is taken out of rotation.
#[derive(Debug, Clone)]
pub struct ThrottleParams {
    /// How long a throttled server stays disabled. Zero disables
    /// throttling altogether.
    pub period: Duration,
    /// Consecutive failures that trip the throttle. Zero disables this
    /// trigger.
    pub max_failures: u32,
    /// Keep the server disabled past the period, until the next
    /// discovery confirms it.
    pub until_discovery: bool,
    /// Failure-rate trigger over the sliding outcome register.
    pub threshold: Option<Threshold>,
}

impl Default for ThrottleParams {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(10),
            max_failures: 0,
            until_discovery: false,
            threshold: None,
        }
    }
}

const OFF: u8 = 0;
const ON_TIMER: u8 = 1;
const UNTIL_DISCOVERY: u8 = 2;

struct Register {
    consecutive_failures: u32,
    // Sliding window of the last `denominator` outcomes; a set bit is a
    // failure. 128 bits cover the largest permitted denominator.
    bits: u128,
    cursor: u32,
    filled: u32,
}

impl Register {
    fn record(&mut self, failure: bool, threshold: Option<Threshold>) -> bool {
        if failure {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 0;
        }

        let Some(threshold) = threshold else {
            return false;
        };
        let mask = 1u128 << self.cursor;
        if failure {
            self.bits |= mask;
        } else {
            self.bits &= !mask;
        }
        self.cursor = (self.cursor + 1) % threshold.denominator;
        self.filled = (self.filled + 1).min(threshold.denominator);

        self.filled == threshold.denominator
            && self.bits.count_ones() >= threshold.numerator
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.bits = 0;
        self.cursor = 0;
        self.filled = 0;
    }
}

/// Per-server throttling state. Outcomes are recorded as they happen; when
/// a trigger fires, the server is disabled for the configured period (or
/// until re-discovered) and the register starts over.
pub struct Throttle {
    params: ThrottleParams,
    active: Arc<AtomicU8>,
    register: Mutex<Register>,
}

impl Throttle {
    pub fn new(params: ThrottleParams) -> Self {
        Self {
            params,
            active: Arc::new(AtomicU8::new(OFF)),
            register: Mutex::new(Register {
                consecutive_failures: 0,
                bits: 0,
                cursor: 0,
                filled: 0,
            }),
        }
    }

    fn configured(&self) -> bool {
        !self.params.period.is_zero()
            && (self.params.max_failures > 0 || self.params.threshold.is_some())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) != OFF
    }

    pub fn on_success(&self) {
        if self.configured() && !self.is_active() {
            let mut register = self.register.lock().unwrap();
            register.record(false, self.params.threshold);
        }
    }

    /// Record a failure; returns true when this failure tripped the
    /// throttle. Must run inside a tokio runtime, which arms the release
    /// timer.
    pub fn on_failure(&self, server: &str) -> bool {
        if !self.configured() || self.is_active() {
            return false;
        }

        let tripped = {
            let mut register = self.register.lock().unwrap();
            let rate_tripped = register.record(true, self.params.threshold);
            let run_tripped = self.params.max_failures > 0
                && register.consecutive_failures >= self.params.max_failures;
            if rate_tripped || run_tripped {
                register.reset();
                true
            } else {
                false
            }
        };

        if tripped {
            tracing::warn!(server, "throttling server after failures");
            self.active.store(ON_TIMER, Ordering::SeqCst);

            let active = self.active.clone();
            let period = self.params.period;
            let until_discovery = self.params.until_discovery;
            let server = server.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(period).await;
                let next = if until_discovery { UNTIL_DISCOVERY } else { OFF };
                active.store(next, Ordering::SeqCst);
                if next == OFF {
                    tracing::warn!(server, "re-enabling throttled server after wait");
                }
            });
        }
        tripped
    }

    /// A fresh discovery re-enables servers parked until one.
    pub fn discovered(&self, server: &str) {
        if self
            .active
            .compare_exchange(UNTIL_DISCOVERY, OFF, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::warn!(server, "re-enabling throttled server after rediscovery");
        }
    }
}
