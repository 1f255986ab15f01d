//! Resume-token bookkeeping.
//!
//! Two copies of the stream position are tracked: the *in-flight* token
//! (last event applied to the cache) and the *durable* token (last
//! promoted checkpoint). Only the durable token is handed back to the
//! store on reconnect, so a crash between promotions replays at most the
//! window since the last checkpoint — replays are no-ops under the
//! version-monotonicity rule.

use std::time::{Duration, Instant};

use dockache_storage::ResumeToken;

/// How often the in-flight token is promoted to durable.
pub const PROMOTION_INTERVAL: Duration = Duration::from_secs(300);

/// Promote early after this many applied events, even inside the interval.
pub const PROMOTION_EVENT_THRESHOLD: u32 = 1000;

#[derive(Debug)]
pub struct TokenManager {
    durable: Option<ResumeToken>,
    in_flight: Option<ResumeToken>,
    applied_since_promotion: u32,
    last_promotion: Instant,
    interval: Duration,
    event_threshold: u32,
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new(PROMOTION_INTERVAL, PROMOTION_EVENT_THRESHOLD)
    }
}

impl TokenManager {
    pub fn new(interval: Duration, event_threshold: u32) -> Self {
        Self {
            durable: None,
            in_flight: None,
            applied_since_promotion: 0,
            last_promotion: Instant::now(),
            interval,
            event_threshold,
        }
    }

    /// Record a successfully applied event.
    pub fn advance(&mut self, token: ResumeToken) {
        self.in_flight = Some(token);
        self.applied_since_promotion = self.applied_since_promotion.saturating_add(1);
    }

    /// The token reconnects resume from.
    pub fn durable(&self) -> Option<ResumeToken> {
        self.durable
    }

    pub fn in_flight(&self) -> Option<ResumeToken> {
        self.in_flight
    }

    pub fn due_for_promotion(&self) -> bool {
        self.in_flight != self.durable
            && (self.applied_since_promotion >= self.event_threshold
                || self.last_promotion.elapsed() >= self.interval)
    }

    /// Promote the in-flight token to durable. Returns the new durable
    /// token when it moved.
    pub fn promote(&mut self) -> Option<ResumeToken> {
        if self.in_flight == self.durable {
            return None;
        }
        self.durable = self.in_flight;
        self.applied_since_promotion = 0;
        self.last_promotion = Instant::now();
        self.durable
    }
}
