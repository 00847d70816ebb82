//! Round-robin API key pool with rate-limit cooldown tracking.
//!
//! The upstream API enforces per-key quotas. The pool spreads load by
//! rotating a cursor over the configured keys, skipping any key that is
//! cooling down after a 429. If every key is cooling down, the first key
//! is returned anyway: a degraded call beats a stalled worker.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use blotter_core::Clock;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{FetchError, Result};

/// Default cooldown applied after a 429, matching the upstream quota window.
pub const DEFAULT_KEY_COOLDOWN: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct KeyState {
    key: String,
    requests_made: u64,
    errors: u64,
    last_used_at: Option<Instant>,
    rate_limited_until: Option<Instant>,
}

impl KeyState {
    fn new(key: String) -> Self {
        Self { key, requests_made: 0, errors: 0, last_used_at: None, rate_limited_until: None }
    }

    fn is_limited(&self, now: Instant) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug)]
struct PoolState {
    keys: Vec<KeyState>,
    cursor: usize,
}

/// Per-key usage counters with the key value redacted to a short suffix.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    /// Last four characters of the key, for identification in dashboards.
    pub key_suffix: String,
    /// Requests issued with this key.
    pub requests_made: u64,
    /// Errors attributed to this key: 429s, upstream 5xx, and transport
    /// failures.
    pub errors: u64,
    /// Whether the key is currently cooling down.
    pub rate_limited: bool,
}

/// Thread-safe rotating pool of upstream API keys.
#[derive(Debug)]
pub struct KeyPool {
    state: Mutex<PoolState>,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl KeyPool {
    /// Creates a pool over the configured keys.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Configuration` when the key list is empty;
    /// there is no valid operating mode without at least one key.
    pub fn new(keys: Vec<String>, cooldown: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        if keys.is_empty() {
            return Err(FetchError::configuration("no API keys configured"));
        }

        Ok(Self {
            state: Mutex::new(PoolState {
                keys: keys.into_iter().map(KeyState::new).collect(),
                cursor: 0,
            }),
            cooldown,
            clock,
        })
    }

    /// Returns the next usable key, advancing the round-robin cursor.
    ///
    /// Skips keys that are cooling down, trying at most one full lap. When
    /// every key is limited, falls back to the first configured key rather
    /// than blocking.
    pub async fn next_key(&self) -> String {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let len = state.keys.len();

        for _ in 0..len {
            let idx = state.cursor;
            state.cursor = (state.cursor + 1) % len;

            if !state.keys[idx].is_limited(now) {
                let slot = &mut state.keys[idx];
                slot.requests_made += 1;
                slot.last_used_at = Some(now);
                return slot.key.clone();
            }
        }

        tracing::warn!("all API keys rate limited, falling back to first key");
        let slot = &mut state.keys[0];
        slot.requests_made += 1;
        slot.last_used_at = Some(now);
        slot.key.clone()
    }

    /// Puts a key into cooldown after an upstream 429.
    pub async fn mark_rate_limited(&self, key: &str) {
        let until = self.clock.now() + self.cooldown;
        let mut state = self.state.lock().await;

        if let Some(slot) = state.keys.iter_mut().find(|slot| slot.key == key) {
            slot.rate_limited_until = Some(until);
            slot.errors += 1;
            tracing::warn!(
                key_suffix = suffix(&slot.key),
                cooldown_secs = self.cooldown.as_secs(),
                "API key rate limited"
            );
        }
    }

    /// Attributes a non-429 failure to a key.
    pub async fn mark_error(&self, key: &str) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.keys.iter_mut().find(|slot| slot.key == key) {
            slot.errors += 1;
        }
    }

    /// Usage counters per key, with values redacted.
    pub async fn stats(&self) -> Vec<KeyStats> {
        let now = self.clock.now();
        let state = self.state.lock().await;

        state
            .keys
            .iter()
            .map(|slot| KeyStats {
                key_suffix: suffix(&slot.key),
                requests_made: slot.requests_made,
                errors: slot.errors,
                rate_limited: slot.is_limited(now),
            })
            .collect()
    }

    /// Clears usage counters and cooldowns, keeping the key list.
    pub async fn reset_stats(&self) {
        let mut state = self.state.lock().await;
        for slot in &mut state.keys {
            slot.requests_made = 0;
            slot.errors = 0;
            slot.last_used_at = None;
            slot.rate_limited_until = None;
        }
    }
}

/// Last four characters of a key, for logs and dashboards.
fn suffix(key: &str) -> String {
    let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("...{tail}")
}
