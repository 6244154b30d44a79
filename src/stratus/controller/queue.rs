/*
 * Copyright (C) 2025 The Stratus Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::stratus::logger::log_debug;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

const COMPONENT: &str = "work-queue";

const DEFAULT_FAST_DELAY: Duration = Duration::from_millis(1);
const DEFAULT_SLOW_DELAY: Duration = Duration::from_secs(120);
const DEFAULT_FAST_ATTEMPTS: u32 = 30;
const DEFAULT_EXP_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_EXP_MAX_DELAY: Duration = Duration::from_secs(30);

/// Per-key back-off policy consulted by [`WorkQueue::add_rate_limited`].
///
/// `when` records one more failure for the key and returns the delay before
/// the next attempt; `forget` resets the key after a success.
pub trait RateLimiter: Send + Sync {
    fn when(&self, key: &str) -> Duration;
    fn forget(&self, key: &str);
    fn num_failures(&self, key: &str) -> u32;
}

/// Exponential back-off: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().expect("rate limiter lock poisoned");
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = *count;
        *count += 1;

        let mut delay = self.base;
        for _ in 0..exponent {
            if delay >= self.max {
                break;
            }
            delay *= 2;
        }
        delay.min(self.max)
    }

    fn forget(&self, key: &str) {
        let mut failures = self.failures.lock().expect("rate limiter lock poisoned");
        failures.remove(key);
    }

    fn num_failures(&self, key: &str) -> u32 {
        let failures = self.failures.lock().expect("rate limiter lock poisoned");
        failures.get(key).copied().unwrap_or(0)
    }
}

/// Two-speed back-off: a short delay for the first `max_fast_attempts`
/// failures, a long one afterwards.
pub struct ItemFastSlowRateLimiter {
    fast: Duration,
    slow: Duration,
    max_fast_attempts: u32,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemFastSlowRateLimiter {
    pub fn new(fast: Duration, slow: Duration, max_fast_attempts: u32) -> Self {
        Self {
            fast,
            slow,
            max_fast_attempts,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemFastSlowRateLimiter {
    fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().expect("rate limiter lock poisoned");
        let count = failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        if *count <= self.max_fast_attempts {
            self.fast
        } else {
            self.slow
        }
    }

    fn forget(&self, key: &str) {
        let mut failures = self.failures.lock().expect("rate limiter lock poisoned");
        failures.remove(key);
    }

    fn num_failures(&self, key: &str) -> u32 {
        let failures = self.failures.lock().expect("rate limiter lock poisoned");
        failures.get(key).copied().unwrap_or(0)
    }
}

/// Takes the worst (longest) delay of the wrapped limiters.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &str) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &str) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_failures(&self, key: &str) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_failures(key))
            .max()
            .unwrap_or(0)
    }
}

/// Default controller policy: 1 ms for the first 30 failures then 2 min,
/// combined with `min(5 ms * 2^failures, 30 s)`, whichever is longer.
pub fn default_rate_limiter() -> Arc<dyn RateLimiter> {
    Arc::new(MaxOfRateLimiter::new(vec![
        Box::new(ItemFastSlowRateLimiter::new(
            DEFAULT_FAST_DELAY,
            DEFAULT_SLOW_DELAY,
            DEFAULT_FAST_ATTEMPTS,
        )),
        Box::new(ItemExponentialFailureRateLimiter::new(
            DEFAULT_EXP_BASE_DELAY,
            DEFAULT_EXP_MAX_DELAY,
        )),
    ]))
}

/// Rate-limited, de-duplicating FIFO of reconcile keys.
///
/// A key is never handed to two consumers at once: while it is being
/// processed, re-adds only mark it dirty and it re-enters the ready queue at
/// [`WorkQueue::done`]. Delayed adds coalesce to the earliest deadline.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: Arc<dyn RateLimiter>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    waiting: HashMap<String, Instant>,
    shutting_down: bool,
}

impl QueueState {
    // Moves the key into the ready queue unless it is already pending or in
    // flight. Returns true when a consumer should be woken.
    fn enqueue(&mut self, key: &str) -> bool {
        if self.shutting_down {
            return false;
        }
        if self.dirty.contains(key) {
            return false;
        }
        self.dirty.insert(key.to_string());
        if self.processing.contains(key) {
            return false;
        }
        self.ready.push_back(key.to_string());
        true
    }

    fn promote_due(&mut self, now: Instant) -> bool {
        let due: Vec<String> = self
            .waiting
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut woke = false;
        for key in due {
            self.waiting.remove(&key);
            woke |= self.enqueue(&key);
        }
        woke
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.values().min().copied()
    }
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                rate_limiter,
            }),
        }
    }

    /// Enqueues the key immediately, coalescing duplicates.
    pub fn add(&self, key: &str) {
        let woke = {
            let mut state = self.inner.state.lock().expect("work queue lock poisoned");
            state.enqueue(key)
        };
        if woke {
            self.inner.notify.notify_waiters();
        }
    }

    /// Enqueues the key after `delay`; duplicate schedules keep the earliest
    /// deadline.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        {
            let mut state = self.inner.state.lock().expect("work queue lock poisoned");
            if state.shutting_down {
                return;
            }
            if state.dirty.contains(key) && !state.processing.contains(key) {
                // Already sitting in the ready queue; a delayed add cannot
                // make it arrive sooner.
                return;
            }
            let deadline = Instant::now() + delay;
            let entry = state
                .waiting
                .entry(key.to_string())
                .or_insert(deadline);
            if deadline < *entry {
                *entry = deadline;
            }
        }
        // Sleeping consumers must re-arm their timers against the new deadline.
        self.inner.notify.notify_waiters();
    }

    /// Records a failure for the key and re-enqueues it after the back-off
    /// computed by the queue's rate limiter.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.inner.rate_limiter.when(key);
        log_debug(
            COMPONENT,
            "re-enqueueing with back-off",
            &[
                ("queue", self.inner.name.as_str()),
                ("key", key),
                ("delay", humantime::format_duration(delay).to_string().as_str()),
            ],
        );
        self.add_after(key, delay);
    }

    /// Resets the key's failure counter.
    pub fn forget(&self, key: &str) {
        self.inner.rate_limiter.forget(key);
    }

    pub fn num_failures(&self, key: &str) -> u32 {
        self.inner.rate_limiter.num_failures(key)
    }

    /// Blocks until a ready key exists, returning `None` once the queue has
    /// shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.inner.state.lock().expect("work queue lock poisoned");
                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(when) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = sleep_until(when) => {}
                    }
                }
                None => notified.as_mut().await,
            }
        }
    }

    /// Marks processing of the key complete; a key re-added meanwhile
    /// re-enters the ready queue.
    pub fn done(&self, key: &str) {
        let woke = {
            let mut state = self.inner.state.lock().expect("work queue lock poisoned");
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.ready.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if woke {
            self.inner.notify.notify_waiters();
        }
    }

    /// Stops accepting new keys and unblocks consumers; already-ready keys
    /// are still handed out until the queue drains.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock().expect("work queue lock poisoned");
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock().expect("work queue lock poisoned");
        state.ready.len()
    }
}
