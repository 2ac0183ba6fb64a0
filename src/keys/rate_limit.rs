use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected { retry_after: Duration },
}

/// Sliding-window request limiter.
///
/// Each key tracks the exact instants of its admitted requests inside the
/// trailing window. The check-and-increment runs under a per-key mutex, so
/// two concurrent requests can never both take the last slot; the outer map
/// lock is only held long enough to locate or create a key's slot, and
/// unrelated keys never contend on each other.
pub struct RateLimiter {
    window: Duration,
    keys: RwLock<HashMap<String, Arc<Mutex<VecDeque<Instant>>>>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Decide whether a request for `key_id` may proceed under `limit`
    /// requests per window. Admission appends the current instant to the
    /// window in the same critical section as the check.
    pub fn admit(&self, key_id: &str, limit: u32) -> Admission {
        let slot = self.slot(key_id);
        let now = Instant::now();

        let mut entries = slot.lock().expect("rate window mutex poisoned");
        while let Some(front) = entries.front()
            && now.duration_since(*front) >= self.window
        {
            entries.pop_front();
        }

        if (entries.len() as u64) < limit as u64 {
            entries.push_back(now);
            return Admission::Admitted;
        }

        let retry_after = entries
            .front()
            .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
            .unwrap_or(self.window);
        Admission::Rejected { retry_after }
    }

    fn slot(&self, key_id: &str) -> Arc<Mutex<VecDeque<Instant>>> {
        {
            let keys = self.keys.read().expect("rate limiter map poisoned");
            if let Some(slot) = keys.get(key_id) {
                return slot.clone();
            }
        }
        let mut keys = self.keys.write().expect("rate limiter map poisoned");
        keys.entry(key_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    /// Drop keys whose windows have fully aged out, so idle keys do not
    /// accumulate. Run periodically from a background task.
    pub fn purge_idle(&self) {
        let now = Instant::now();
        let mut keys = self.keys.write().expect("rate limiter map poisoned");
        keys.retain(|_, slot| {
            // A slot locked by an in-flight admission is certainly live
            let Ok(mut entries) = slot.try_lock() else {
                return true;
            };
            while let Some(front) = entries.front()
                && now.duration_since(*front) >= self.window
            {
                entries.pop_front();
            }
            !entries.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.keys.read().expect("rate limiter map poisoned").len()
    }
}

/// Whole seconds until a retry can succeed, rounded up and at least 1
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    (retry_after.as_millis().div_ceil(1000) as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(Duration::from_secs(60));

        for _ in 0..3 {
            assert_eq!(limiter.admit("key-1", 3), Admission::Admitted);
        }

        match limiter.admit("key-1", 3) {
            Admission::Rejected { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            Admission::Admitted => panic!("fourth request must be rejected"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_elapse_readmits() {
        let limiter = RateLimiter::new(Duration::from_secs(60));

        assert_eq!(limiter.admit("key-1", 1), Admission::Admitted);
        assert!(matches!(
            limiter.admit("key-1", 1),
            Admission::Rejected { .. }
        ));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.admit("key-1", 1), Admission::Admitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_tracks_oldest_entry() {
        let limiter = RateLimiter::new(Duration::from_secs(60));

        assert_eq!(limiter.admit("key-1", 2), Admission::Admitted);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(limiter.admit("key-1", 2), Admission::Admitted);
        tokio::time::advance(Duration::from_secs(10)).await;

        // Oldest entry is 30s old, so it expires in 30s
        match limiter.admit("key-1", 2) {
            Admission::Rejected { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            Admission::Admitted => panic!("window is full"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_admissions_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60)));
        let admitted = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                if limiter.admit("key-1", 5) == Admission::Admitted {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_do_not_interfere() {
        let limiter = RateLimiter::new(Duration::from_secs(60));

        assert_eq!(limiter.admit("key-1", 1), Admission::Admitted);
        assert_eq!(limiter.admit("key-2", 1), Admission::Admitted);
        assert!(matches!(
            limiter.admit("key-1", 1),
            Admission::Rejected { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_reclaims_idle_keys() {
        let limiter = RateLimiter::new(Duration::from_secs(60));

        limiter.admit("key-1", 5);
        limiter.admit("key-2", 5);
        assert_eq!(limiter.tracked_keys(), 2);

        limiter.purge_idle();
        assert_eq!(limiter.tracked_keys(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.purge_idle();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_retry_after_secs_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1001)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(30)), 30);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
