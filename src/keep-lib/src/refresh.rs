use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// What a fetch must do about a locator's signature before reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshAction {
    /// Signature absent or comfortably fresh.
    None,
    /// Already expired: re-sign synchronously or fail the read.
    Sync,
    /// More than half way to expiry: kick a background refresh and read
    /// with the current signature.
    Async,
}

/// Tracks the best current guess at the cluster's signing TTL and decides
/// when locator signatures need refreshing.
///
/// The guess starts from collection metadata and only ratchets upward:
/// every successful refresh that yields a longer-lived signature raises it.
pub struct SignatureRefresher {
    guessed_ttl: Mutex<Duration>,
}

impl SignatureRefresher {
    pub fn new(guessed_ttl: Duration) -> Self {
        Self {
            guessed_ttl: Mutex::new(guessed_ttl),
        }
    }

    pub fn guessed_ttl(&self) -> Duration {
        *self.guessed_ttl.lock().unwrap()
    }

    pub fn set_guessed_ttl(&self, ttl: Duration) {
        *self.guessed_ttl.lock().unwrap() = ttl;
    }

    pub fn action_for(&self, expiry: Option<SystemTime>) -> RefreshAction {
        let expiry = match expiry {
            Some(t) => t,
            None => return RefreshAction::None,
        };
        let now = SystemTime::now();
        match expiry.duration_since(now) {
            Err(_) => RefreshAction::Sync,
            Ok(left) if left < self.guessed_ttl() / 2 => RefreshAction::Async,
            Ok(_) => RefreshAction::None,
        }
    }

    /// Record the expiry observed on a freshly-issued signature.
    pub fn note_refreshed(&self, new_expiry: SystemTime) {
        if let Ok(ttl) = new_expiry.duration_since(SystemTime::now()) {
            let mut guessed = self.guessed_ttl.lock().unwrap();
            if ttl > *guessed {
                debug!(
                    "raising guessed signing TTL from {:?} to {:?}",
                    *guessed, ttl
                );
                *guessed = ttl;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_for() {
        let r = SignatureRefresher::new(Duration::from_secs(3600));
        let now = SystemTime::now();
        assert_eq!(r.action_for(None), RefreshAction::None);
        assert_eq!(
            r.action_for(Some(now - Duration::from_secs(10))),
            RefreshAction::Sync
        );
        assert_eq!(
            r.action_for(Some(now + Duration::from_secs(120))),
            RefreshAction::Async
        );
        assert_eq!(
            r.action_for(Some(now + Duration::from_secs(3000))),
            RefreshAction::None
        );
    }

    #[test]
    fn test_ttl_ratchets_up_only() {
        let r = SignatureRefresher::new(Duration::from_secs(60));
        r.note_refreshed(SystemTime::now() + Duration::from_secs(7200));
        let raised = r.guessed_ttl();
        assert!(raised > Duration::from_secs(7000), "got {:?}", raised);
        r.note_refreshed(SystemTime::now() + Duration::from_secs(30));
        assert_eq!(r.guessed_ttl(), raised);
    }
}
