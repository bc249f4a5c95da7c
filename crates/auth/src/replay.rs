#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const PRUNE_THRESHOLD: usize = 1024;

/// Remembers proof identifiers for a fixed window so each proof is accepted
/// at most once.
pub struct ReplayCache {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl ReplayCache {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records `jti` for the key identified by `thumbprint`. Returns false when
    /// the pair was already seen inside the window.
    pub fn check_and_record(&self, thumbprint: &str, jti: &str) -> bool {
        let now = Instant::now();
        let key = format!("{thumbprint}:{jti}");
        let mut seen = match self.seen.lock() {
            Ok(seen) => seen,
            Err(poisoned) => poisoned.into_inner(),
        };

        if seen.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            seen.retain(|_, recorded| now.duration_since(*recorded) <= window);
        }

        match seen.get(&key) {
            Some(recorded) if now.duration_since(*recorded) <= self.window => false,
            _ => {
                seen.insert(key, now);
                true
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self.seen.lock() {
            Ok(seen) => seen.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
