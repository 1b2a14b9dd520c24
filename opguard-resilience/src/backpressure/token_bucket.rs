use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Token bucket refilled continuously at `rate` tokens per second up to
/// `burst` tokens. Starts full.
///
/// Also tracks admissions over the trailing second so callers can report an
/// observed rate alongside the configured one.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    admissions: VecDeque<(Instant, u32)>,
}

impl BucketState {
    fn refill(&mut self, now: Instant, rate: f64, burst: f64) {
        let elapsed = now
            .saturating_duration_since(self.last_refill)
            .as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.admissions.front() {
            if now.saturating_duration_since(*at) > RATE_WINDOW {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        let rate = rate.max(0.0);
        let burst = burst.max(0.0);
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
                admissions: VecDeque::new(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// Take `n` tokens if available. Either all `n` are taken or none.
    pub fn consume(&self, n: u32) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        state.refill(now, self.rate, self.burst);
        state.prune(now);

        let wanted = f64::from(n);
        if state.tokens >= wanted {
            state.tokens -= wanted;
            if n > 0 {
                state.admissions.push_back((now, n));
            }
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after refilling
    pub fn available_tokens(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.lock();
        state.refill(now, self.rate, self.burst);
        state.tokens
    }

    /// Tokens admitted over the trailing second
    pub fn observed_rate(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.lock();
        state.prune(now);
        state.admissions.iter().map(|(_, n)| f64::from(*n)).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
