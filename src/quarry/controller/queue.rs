/*
 * Copyright (C) 2024 The Quarry Authors
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

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::sleep;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);
const OVERALL_QPS: f64 = 100.0;
const OVERALL_BURST: f64 = 1000.0;

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(refill_per_second: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_second,
            last_refill: Instant::now(),
        }
    }

    /// Takes one token, possibly going into debt, and returns how long the
    /// caller must wait before acting on it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_per_second)
        }
    }
}

/// Per-item exponential backoff combined with an overall token bucket.
struct RateLimiter {
    failures: HashMap<String, u32>,
    base_delay: Duration,
    max_delay: Duration,
    bucket: TokenBucket,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            failures: HashMap::new(),
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            bucket: TokenBucket::new(OVERALL_QPS, OVERALL_BURST),
        }
    }

    fn when(&mut self, key: &str) -> Duration {
        let attempts = self.failures.entry(key.to_string()).or_insert(0);
        let backoff_secs = self.base_delay.as_secs_f64() * 2f64.powi(*attempts as i32);
        *attempts += 1;
        let backoff = if backoff_secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(backoff_secs)
        };
        backoff.max(self.bucket.reserve())
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    limiter: Mutex<RateLimiter>,
    notify: Notify,
}

/// Rate-limited, deduplicating FIFO of object keys. While a key is being
/// processed, re-adds are coalesced into a single redelivery after `done`,
/// so at most one reconcile per key is ever in flight.
#[derive(Clone)]
pub struct RateLimitingQueue {
    inner: Arc<QueueInner>,
}

impl RateLimitingQueue {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.to_string(),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                limiter: Mutex::new(RateLimiter::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add(&self, key: &str) {
        {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            if state.shutting_down || state.dirty.contains(key) {
                return;
            }
            state.dirty.insert(key.to_string());
            if state.processing.contains(key) {
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.inner.notify.notify_one();
    }

    /// Adds the key after the rate limiter's delay for it has elapsed.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut limiter = self.inner.limiter.lock().expect("limiter lock poisoned");
            limiter.when(key)
        };
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Blocks until a key is available. Returns `None` once the queue has
    /// been shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().expect("queue lock poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Keep sibling workers from sleeping on a backlog.
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks processing of the key finished; a key re-added meanwhile is
    /// redelivered.
    pub fn done(&self, key: &str) {
        let redeliver = {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if redeliver {
            self.inner.notify.notify_one();
        }
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        let limiter = self.inner.limiter.lock().expect("limiter lock poisoned");
        limiter.num_requeues(key)
    }

    /// Clears the backoff history of a key after a successful reconcile.
    pub fn forget(&self, key: &str) {
        let mut limiter = self.inner.limiter.lock().expect("limiter lock poisoned");
        limiter.forget(key);
    }

    /// Stops intake; workers drain the remaining items and then observe the
    /// shutdown.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            state.shutting_down = true;
        }
        self.inner.notify.notify_waiters();
    }
}
