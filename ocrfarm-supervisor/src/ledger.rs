//! Recent start attempts, used to suppress duplicate starts

use chrono::{DateTime, Utc};
use ocrfarm_core::clock::Clock;
use ocrfarm_core::profile::ProfileName;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-profile timestamp of the last start attempt.
///
/// A claim inside `window` of a previous one is refused. Entries older than
/// `horizon` are pruned on every access.
pub struct StartAttemptLedger {
    clock: Arc<dyn Clock>,
    window: chrono::Duration,
    horizon: chrono::Duration,
    attempts: Mutex<HashMap<ProfileName, DateTime<Utc>>>,
}

impl StartAttemptLedger {
    pub fn new(clock: Arc<dyn Clock>, window: Duration, horizon: Duration) -> Self {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        let horizon = chrono::Duration::from_std(horizon).unwrap_or(chrono::Duration::zero());
        Self {
            clock,
            window,
            horizon: horizon.max(window),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn with_attempts<T>(&self, f: impl FnOnce(&mut HashMap<ProfileName, DateTime<Utc>>) -> T) -> T {
        let mut attempts = match self.attempts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = self.clock.now();
        let horizon = self.horizon;
        attempts.retain(|_, at| now - *at <= horizon);
        f(&mut attempts)
    }

    /// Record an attempt unless one was recorded within the window.
    ///
    /// Returns `false` when a recent attempt already holds the claim.
    pub fn try_claim(&self, profile: &ProfileName) -> bool {
        let now = self.clock.now();
        let window = self.window;
        self.with_attempts(|attempts| match attempts.get(profile) {
            Some(at) if now - *at < window => false,
            _ => {
                attempts.insert(profile.clone(), now);
                true
            }
        })
    }

    /// Whether an attempt was recorded within the window
    pub fn is_recent(&self, profile: &ProfileName) -> bool {
        let now = self.clock.now();
        let window = self.window;
        self.with_attempts(|attempts| attempts.get(profile).is_some_and(|at| now - *at < window))
    }

    /// Forget the attempt for a profile
    pub fn release(&self, profile: &ProfileName) {
        self.with_attempts(|attempts| {
            attempts.remove(profile);
        });
    }

    /// Number of tracked attempts
    pub fn len(&self) -> usize {
        self.with_attempts(|attempts| attempts.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocrfarm_core::clock::ManualClock;

    fn ledger(clock: &ManualClock) -> StartAttemptLedger {
        StartAttemptLedger::new(
            Arc::new(clock.clone()),
            Duration::from_secs(20),
            Duration::from_secs(240),
        )
    }

    #[test]
    fn test_claim_is_exclusive_within_window() {
        let clock = ManualClock::default();
        let ledger = ledger(&clock);
        let alice = ProfileName::new("alice").unwrap();

        assert!(ledger.try_claim(&alice));
        assert!(!ledger.try_claim(&alice));
        assert!(ledger.is_recent(&alice));

        clock.advance(Duration::from_secs(20));
        assert!(!ledger.is_recent(&alice));
        assert!(ledger.try_claim(&alice));
    }

    #[test]
    fn test_release_frees_claim() {
        let clock = ManualClock::default();
        let ledger = ledger(&clock);
        let alice = ProfileName::new("alice").unwrap();

        assert!(ledger.try_claim(&alice));
        ledger.release(&alice);
        assert!(ledger.is_empty());
        assert!(ledger.try_claim(&alice));
    }

    #[test]
    fn test_entries_pruned_past_horizon() {
        let clock = ManualClock::default();
        let ledger = ledger(&clock);

        ledger.try_claim(&ProfileName::new("a").unwrap());
        clock.advance(Duration::from_secs(200));
        ledger.try_claim(&ProfileName::new("b").unwrap());
        assert_eq!(ledger.len(), 2);

        clock.advance(Duration::from_secs(41));
        assert_eq!(ledger.len(), 1);
    }
}
