use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};

use crate::config::RateLimitConfig;
use crate::epoch_millis;

const WINDOW: Duration = Duration::from_secs(60);
const RELEASE_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    #[error("rate limit queue full for provider {0}")]
    QueueFull(String),
    #[error("rate limiter disposed")]
    Disposed,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStatus {
    pub requests_in_window: usize,
    pub queue_length: usize,
    /// 0 while under capacity, otherwise when the oldest admission ages out.
    pub next_available_slot_ms: i64,
}

struct Waiter {
    tx: oneshot::Sender<Result<(), LimiterError>>,
}

struct ShardState {
    window: VecDeque<Instant>,
    queue: VecDeque<Waiter>,
    ticker: Option<JoinHandle<()>>,
}

struct Shard {
    provider: String,
    requests_per_minute: usize,
    max_queue_size: usize,
    state: Mutex<ShardState>,
}

impl Shard {
    fn prune(state: &mut ShardState, now: Instant) {
        while let Some(oldest) = state.window.front() {
            if now.duration_since(*oldest) > WINDOW {
                state.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window admission per provider with a bounded FIFO wait queue.
///
/// Each configured provider gets its own shard and mutex, so saturating
/// one provider never affects admission on another. Unconfigured
/// providers are admitted unconditionally.
pub struct RateLimiter {
    shards: HashMap<String, Arc<Shard>>,
    disposed: AtomicBool,
}

impl RateLimiter {
    pub fn new(configs: &[RateLimitConfig]) -> Self {
        let shards = configs
            .iter()
            .map(|config| {
                (
                    config.provider.clone(),
                    Arc::new(Shard {
                        provider: config.provider.clone(),
                        requests_per_minute: config.requests_per_minute as usize,
                        max_queue_size: config.max_queue_size,
                        state: Mutex::new(ShardState {
                            window: VecDeque::new(),
                            queue: VecDeque::new(),
                            ticker: None,
                        }),
                    }),
                )
            })
            .collect();
        Self {
            shards,
            disposed: AtomicBool::new(false),
        }
    }

    /// Completes when a slot is admitted. Suspends in the FIFO queue when
    /// the window is full; fails immediately when the queue is full too.
    pub async fn acquire(&self, provider: &str) -> Result<(), LimiterError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(LimiterError::Disposed);
        }
        let Some(shard) = self.shards.get(provider) else {
            return Ok(());
        };

        let rx = {
            let mut state = shard.state.lock().await;
            let now = Instant::now();
            Shard::prune(&mut state, now);

            if state.window.len() < shard.requests_per_minute {
                state.window.push_back(now);
                return Ok(());
            }
            if state.queue.len() >= shard.max_queue_size {
                return Err(LimiterError::QueueFull(shard.provider.clone()));
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { tx });
            if state.ticker.is_none() {
                state.ticker = Some(spawn_release_ticker(shard.clone()));
            }
            rx
        };

        match rx.await {
            Ok(outcome) => outcome,
            // Sender dropped without resolving: only dispose does that.
            Err(_) => Err(LimiterError::Disposed),
        }
    }

    pub async fn status(&self, provider: &str) -> LimiterStatus {
        let Some(shard) = self.shards.get(provider) else {
            return LimiterStatus::default();
        };
        let mut state = shard.state.lock().await;
        let now = Instant::now();
        Shard::prune(&mut state, now);

        let next_available_slot_ms = if state.window.len() < shard.requests_per_minute {
            0
        } else {
            state
                .window
                .front()
                .map(|oldest| {
                    let remaining = WINDOW.saturating_sub(now.duration_since(*oldest));
                    epoch_millis() + remaining.as_millis() as i64
                })
                .unwrap_or(0)
        };

        LimiterStatus {
            requests_in_window: state.window.len(),
            queue_length: state.queue.len(),
            next_available_slot_ms,
        }
    }

    pub fn configured_providers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shards.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stops every release ticker and rejects all queued waiters. No
    /// acquire succeeds afterwards.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        for shard in self.shards.values() {
            let mut state = shard.state.lock().await;
            if let Some(ticker) = state.ticker.take() {
                ticker.abort();
            }
            while let Some(waiter) = state.queue.pop_front() {
                let _ = waiter.tx.send(Err(LimiterError::Disposed));
            }
        }
    }
}

fn spawn_release_ticker(shard: Arc<Shard>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(RELEASE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The interval fires immediately; the first release is one tick out.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let mut state = shard.state.lock().await;
            let now = Instant::now();
            Shard::prune(&mut state, now);

            while state.window.len() < shard.requests_per_minute {
                let Some(waiter) = state.queue.pop_front() else {
                    break;
                };
                state.window.push_back(now);
                // A waiter that gave up still consumed its slot.
                let _ = waiter.tx.send(Ok(()));
            }

            if state.queue.is_empty() {
                state.ticker = None;
                break;
            }
        }
    })
}
