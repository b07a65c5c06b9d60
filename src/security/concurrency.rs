//! Per-caller concurrency limiter.
//!
//! Admission is non-blocking: a full set means "try again later".

use crate::error::LimitError;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Caps in-flight requests per caller identifier.
pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    active: DashMap<String, HashSet<String>>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            active: DashMap::new(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Register `token` as in flight for `identifier`.
    ///
    /// Returns `false` without blocking when the caller is at capacity.
    /// Acquiring a token that is already held succeeds without growing the set.
    pub fn acquire(&self, identifier: &str, token: &str) -> bool {
        let admitted = {
            let mut set = self.active.entry(identifier.to_string()).or_default();
            if set.contains(token) {
                true
            } else if set.len() >= self.max_concurrent {
                false
            } else {
                set.insert(token.to_string());
                true
            }
        };

        if admitted {
            debug!(
                "Concurrency slot acquired for {}: {}/{}",
                identifier,
                self.active_count(identifier),
                self.max_concurrent
            );
        } else {
            self.active.remove_if(identifier, |_, set| set.is_empty());
            warn!(
                "Concurrent request limit exceeded for {}: {}/{}",
                identifier,
                self.active_count(identifier),
                self.max_concurrent
            );
        }
        admitted
    }

    /// Remove `token`; releasing an unknown token is a no-op.
    pub fn release(&self, identifier: &str, token: &str) {
        let removed = self
            .active
            .get_mut(identifier)
            .map(|mut set| set.remove(token))
            .unwrap_or(false);
        self.active.remove_if(identifier, |_, set| set.is_empty());

        if removed {
            debug!(
                "Concurrency slot released for {}: {}/{}",
                identifier,
                self.active_count(identifier),
                self.max_concurrent
            );
        }
    }

    pub fn active_count(&self, identifier: &str) -> usize {
        self.active.get(identifier).map_or(0, |set| set.len())
    }

    pub fn tracked_callers(&self) -> usize {
        self.active.len()
    }

    /// Acquire a slot wrapped in a guard that releases it on drop.
    pub fn try_permit<'a>(
        &'a self,
        identifier: &str,
        token: &str,
    ) -> Result<ConcurrencyPermit<'a>, LimitError> {
        if self.acquire(identifier, token) {
            Ok(ConcurrencyPermit {
                limiter: self,
                identifier: identifier.to_string(),
                token: token.to_string(),
            })
        } else {
            Err(LimitError::ConcurrencyLimited {
                active: self.active_count(identifier),
                max: self.max_concurrent,
            })
        }
    }
}

/// RAII guard that releases the concurrency slot on drop.
pub struct ConcurrencyPermit<'a> {
    limiter: &'a ConcurrencyLimiter,
    identifier: String,
    token: String,
}

impl ConcurrencyPermit<'_> {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for ConcurrencyPermit<'_> {
    fn drop(&mut self) {
        self.limiter.release(&self.identifier, &self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_third_acquire_rejected() {
        let limiter = ConcurrencyLimiter::new(2);
        assert!(limiter.acquire("x", "t1"));
        assert!(limiter.acquire("x", "t2"));
        assert!(!limiter.acquire("x", "t3"));
        assert_eq!(limiter.active_count("x"), 2);

        limiter.release("x", "t1");
        assert!(limiter.acquire("x", "t3"));
        assert_eq!(limiter.active_count("x"), 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let limiter = ConcurrencyLimiter::new(2);
        assert!(limiter.acquire("x", "t1"));
        limiter.release("x", "t1");
        limiter.release("x", "t1");
        limiter.release("unknown", "t9");
        assert_eq!(limiter.active_count("x"), 0);
        assert_eq!(limiter.tracked_callers(), 0);
    }

    #[test]
    fn test_reacquire_same_token() {
        let limiter = ConcurrencyLimiter::new(1);
        assert!(limiter.acquire("x", "t1"));
        assert!(limiter.acquire("x", "t1"));
        assert_eq!(limiter.active_count("x"), 1);
    }

    #[test]
    fn test_zero_capacity_leaves_no_entry() {
        let limiter = ConcurrencyLimiter::new(0);
        assert!(!limiter.acquire("x", "t1"));
        assert_eq!(limiter.tracked_callers(), 0);
    }

    #[test]
    fn test_permit_releases_on_drop() {
        let limiter = ConcurrencyLimiter::new(1);
        {
            let permit = limiter.try_permit("x", "t1").unwrap();
            assert_eq!(permit.token(), "t1");
            assert!(matches!(
                limiter.try_permit("x", "t2"),
                Err(LimitError::ConcurrencyLimited { active: 1, max: 1 })
            ));
        }
        assert_eq!(limiter.active_count("x"), 0);
        assert!(limiter.try_permit("x", "t2").is_ok());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_cap() {
        let limiter = Arc::new(ConcurrencyLimiter::new(4));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.acquire("shared", &format!("t{i}")))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 4);
        assert_eq!(limiter.active_count("shared"), 4);
    }
}
