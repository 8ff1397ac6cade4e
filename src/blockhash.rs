// 11.0: replay-protection token cache. one per bot, passed by &mut to whoever
// submits. a token captured at T is never handed out at or after T + refresh.

use std::time::Duration;
use tokio::time::Instant;

use crate::types::Blockhash;

#[derive(Debug, Clone)]
struct CachedBlockhash {
    blockhash: Blockhash,
    captured_at: Instant,
}

#[derive(Debug, Clone)]
pub struct BlockhashCache {
    entry: Option<CachedBlockhash>,
    refresh_interval: Duration,
}

impl BlockhashCache {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            entry: None,
            refresh_interval,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Cached token if it is still younger than the refresh interval.
    pub fn fresh(&self, now: Instant) -> Option<&Blockhash> {
        self.entry
            .as_ref()
            .filter(|cached| now.saturating_duration_since(cached.captured_at) < self.refresh_interval)
            .map(|cached| &cached.blockhash)
    }

    // captured_at should be taken before the fetch was issued
    pub fn store(&mut self, blockhash: Blockhash, captured_at: Instant) {
        self.entry = Some(CachedBlockhash { blockhash, captured_at });
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }
}
