use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type RateLimitMap = HashMap<String, Vec<DateTime<Utc>>>;

/// Minimum time between full passes over every tracked client.
const SWEEP_INTERVAL_SECONDS: i64 = 60;

#[derive(Debug, Error)]
#[error("Too many requests. Try again in {retry_after_seconds} seconds.")]
pub struct RateLimitExceeded {
    pub retry_after_seconds: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    pub limit: usize,
    pub period: Duration,
}

/// Sliding-window request budget per client key.
///
/// Keys are stored as SHA-256 digests so a persisted state file never holds
/// raw client addresses.
pub struct RateLimiter {
    windows: Vec<RateWindow>,
    state: Mutex<LimiterState>,
    state_path: Option<PathBuf>,
}

#[derive(Default)]
struct LimiterState {
    clients: RateLimitMap,
    last_sweep: Option<DateTime<Utc>>,
}

impl LimiterState {
    /// Drops expired timestamps of every client and forgets idle clients.
    fn sweep(&mut self, oldest_relevant: DateTime<Utc>, now: DateTime<Utc>) {
        let due = self
            .last_sweep
            .is_none_or(|last| now - last >= Duration::seconds(SWEEP_INTERVAL_SECONDS));
        if !due {
            return;
        }

        let before = self.clients.len();
        self.clients.retain(|_, timestamps| {
            timestamps.retain(|timestamp| *timestamp > oldest_relevant);
            !timestamps.is_empty()
        });
        self.last_sweep = Some(now);

        let evicted = before - self.clients.len();
        if evicted > 0 {
            debug!("Evicted {evicted} idle rate limit entries");
        }
    }
}

impl RateLimiter {
    /// Windows with a zero limit are dropped; no windows means unlimited.
    pub fn new(windows: Vec<RateWindow>) -> Self {
        Self {
            windows: windows
                .into_iter()
                .filter(|window| window.limit > 0)
                .collect(),
            state: Mutex::new(LimiterState::default()),
            state_path: None,
        }
    }

    pub fn per_minute_and_day(per_minute: usize, per_day: usize) -> Self {
        Self::new(vec![
            RateWindow {
                limit: per_minute,
                period: Duration::minutes(1),
            },
            RateWindow {
                limit: per_day,
                period: Duration::hours(24),
            },
        ])
    }

    /// Loads persisted counters from `path` and keeps writing them back there.
    pub async fn with_state_file(mut self, path: PathBuf) -> Self {
        match load_rate_limits(&path, self.longest_period(), Utc::now()).await {
            Ok(map) => self.state.get_mut().clients = map,
            Err(error) => warn!("Could not load rate limit state from {:?}: {error}", path),
        }
        self.state_path = Some(path);
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.windows.is_empty()
    }

    /// Number of clients currently holding recorded requests.
    pub async fn tracked_clients(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    fn longest_period(&self) -> Duration {
        self.windows
            .iter()
            .map(|window| window.period)
            .max()
            .unwrap_or_else(Duration::zero)
    }

    /// Records one request for `key` unless any window is already full.
    pub async fn check(&self, key: &str, now: DateTime<Utc>) -> Result<(), RateLimitExceeded> {
        if !self.is_enabled() {
            return Ok(());
        }

        let oldest_relevant = now - self.longest_period();
        let (snapshot, outcome) = {
            let mut state = self.state.lock().await;
            state.sweep(oldest_relevant, now);
            let entries = state.clients.entry(hash_key(key)).or_default();
            entries.sort();
            entries.retain(|timestamp| *timestamp > oldest_relevant);

            let retry_after_seconds = self
                .windows
                .iter()
                .filter_map(|window| retry_after(entries, window, now))
                .max();

            let outcome = match retry_after_seconds {
                Some(retry_after_seconds) => Err(RateLimitExceeded {
                    retry_after_seconds,
                }),
                None => {
                    entries.push(now);
                    Ok(())
                }
            };

            let snapshot = match (&self.state_path, &outcome) {
                (Some(_), Ok(())) => Some(state.clients.clone()),
                _ => None,
            };
            (snapshot, outcome)
        };

        if let (Some(snapshot), Some(path)) = (snapshot, &self.state_path)
            && let Err(error) = persist_rate_limits(path, &snapshot).await
        {
            warn!("Could not persist rate limit state: {error}");
        }

        outcome
    }
}

fn retry_after(entries: &[DateTime<Utc>], window: &RateWindow, now: DateTime<Utc>) -> Option<u64> {
    let window_start = now - window.period;
    let in_window: Vec<&DateTime<Utc>> = entries
        .iter()
        .filter(|timestamp| **timestamp > window_start)
        .collect();

    if in_window.len() < window.limit {
        return None;
    }

    let reset_at = in_window
        .first()
        .map(|oldest| **oldest + window.period)
        .unwrap_or(now + window.period);
    Some((reset_at - now).num_seconds().max(1) as u64)
}

fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{digest:x}")
}

async fn load_rate_limits(
    path: &Path,
    longest_period: Duration,
    now: DateTime<Utc>,
) -> Result<RateLimitMap, std::io::Error> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let mut map: RateLimitMap = serde_json::from_str(&contents)
                .map_err(|error| std::io::Error::new(ErrorKind::InvalidData, error))?;

            let window_start = now - longest_period;
            map.retain(|_, timestamps| {
                timestamps.sort();
                timestamps.retain(|timestamp| *timestamp > window_start);
                !timestamps.is_empty()
            });

            Ok(map)
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
        Err(error) => Err(error),
    }
}

async fn persist_rate_limits(path: &Path, rate_limits: &RateLimitMap) -> std::io::Result<()> {
    let payload = serde_json::to_string_pretty(rate_limits)
        .map_err(|error| std::io::Error::new(ErrorKind::InvalidData, error))?;

    tokio::fs::write(path, payload).await
}
