//! Upstream pool rotation
//!
//! The rotator owns the ordered pool of upstream endpoints and hands out the
//! next one according to the configured strategy and stickiness policy.
//! Liveness is driven entirely by dial outcomes reported through
//! [`Rotator::mark_dead`]; there is no background probe.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::{Result, RevolveError};
use crate::models::ProxyEndpoint;

/// Strategy for walking the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    #[default]
    Random,
    Sequential,
}

impl RotationStrategy {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "sequential" | "seq" => Self::Sequential,
            _ => Self::Random,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Sequential => "sequential",
        }
    }
}

/// How long a selected endpoint stays current before rotating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestsPerProxy {
    /// Rotate after this many requests (1 = rotate every request)
    Count(u32),
    /// Stay on the current endpoint for as long as it is alive
    Auto,
}

impl Default for RequestsPerProxy {
    fn default() -> Self {
        Self::Count(1)
    }
}

type AllDeadCallback = Box<dyn Fn() + Send + Sync>;

/// Mutex-protected rotator state
#[derive(Default)]
struct RotatorInner {
    /// Insertion-ordered pool; endpoints are never removed
    endpoints: Vec<Arc<ProxyEndpoint>>,
    /// Fingerprints already inserted, for dedup
    seen: HashSet<String>,
    /// Next index for the sequential strategy
    seq_index: usize,
    /// Cached permutation for the random strategy; empty means recompute
    shuffled: Vec<Arc<ProxyEndpoint>>,
    shuffle_idx: usize,
    /// Scratch buffer for the filtered alive pool
    pool_cache: Vec<Arc<ProxyEndpoint>>,
    /// Sticky selection state
    current: Option<Arc<ProxyEndpoint>>,
    counter: u32,
    all_dead_fired: bool,
}

/// Ordered pool of upstream endpoints with rotation and liveness tracking
pub struct Rotator {
    strategy: RotationStrategy,
    skip_dead: bool,
    requests_per: RequestsPerProxy,
    inner: Mutex<RotatorInner>,
    on_all_dead: Mutex<Option<AllDeadCallback>>,
}

impl Rotator {
    pub fn new(
        strategy: RotationStrategy,
        skip_dead: bool,
        requests_per: RequestsPerProxy,
    ) -> Self {
        Self {
            strategy,
            skip_dead,
            requests_per,
            inner: Mutex::new(RotatorInner::default()),
            on_all_dead: Mutex::new(None),
        }
    }

    /// Register a hook fired at most once, when the last alive endpoint dies
    /// under skip-dead mode.
    pub fn on_all_dead<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_all_dead.lock() = Some(Box::new(callback));
    }

    /// Load endpoints from a file, one URL per line
    ///
    /// Blank lines and lines starting with `#` are skipped; malformed URLs
    /// are skipped silently. Only I/O failures on the file itself are errors.
    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::open(path.as_ref())?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match ProxyEndpoint::parse(line) {
                Ok(endpoint) => {
                    self.add(endpoint);
                }
                Err(e) => debug!("Skipping malformed proxy line {:?}: {}", line, e),
            }
        }
        Ok(())
    }

    /// Load endpoints from raw URL strings, skipping malformed entries
    pub fn load_from_strings(&self, urls: &[String]) {
        for raw in urls {
            match ProxyEndpoint::parse(raw) {
                Ok(endpoint) => {
                    self.add(endpoint);
                }
                Err(e) => debug!("Skipping malformed proxy URL {:?}: {}", raw, e),
            }
        }
    }

    /// Add an endpoint, deduplicating by fingerprint
    ///
    /// Returns false when an endpoint with the same fingerprint is already
    /// in the pool.
    pub fn add(&self, endpoint: ProxyEndpoint) -> bool {
        let key = endpoint.fingerprint();
        let mut inner = self.inner.lock();
        if !inner.seen.insert(key) {
            return false;
        }
        inner.endpoints.push(Arc::new(endpoint));
        inner.shuffled.clear();
        inner.pool_cache.clear();
        true
    }

    /// Total endpoints in the pool
    pub fn count(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    /// Endpoints currently marked alive
    pub fn alive_count(&self) -> usize {
        self.inner
            .lock()
            .endpoints
            .iter()
            .filter(|e| e.is_alive())
            .count()
    }

    /// Snapshot of the pool in insertion order, for the metrics display
    pub fn endpoints(&self) -> Vec<Arc<ProxyEndpoint>> {
        self.inner.lock().endpoints.clone()
    }

    /// Produce the next endpoint according to strategy and stickiness
    ///
    /// With skip-dead enabled the selection pool is the alive subsequence and
    /// an empty one fails with [`RevolveError::AllProxiesDead`]; otherwise
    /// dead endpoints keep rotating.
    pub fn next(&self) -> Result<Arc<ProxyEndpoint>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.endpoints.is_empty() {
            return Err(RevolveError::NoProxiesAvailable);
        }

        // Stay on the current endpoint while the stickiness policy allows.
        if let Some(current) = inner.current.clone() {
            let within_budget = match self.requests_per {
                RequestsPerProxy::Auto => true,
                RequestsPerProxy::Count(k) => inner.counter < k,
            };
            if within_budget && (!self.skip_dead || current.is_alive()) {
                inner.counter += 1;
                return Ok(current);
            }
        }

        let pool: &[Arc<ProxyEndpoint>] = if self.skip_dead {
            inner.pool_cache.clear();
            for endpoint in &inner.endpoints {
                if endpoint.is_alive() {
                    inner.pool_cache.push(endpoint.clone());
                }
            }
            if inner.pool_cache.is_empty() {
                return Err(RevolveError::AllProxiesDead);
            }
            &inner.pool_cache
        } else {
            &inner.endpoints
        };

        let selected = match self.strategy {
            RotationStrategy::Sequential => {
                // The modulus keeps indexing in range when the alive pool
                // shrank since the last call.
                inner.seq_index %= pool.len();
                let endpoint = pool[inner.seq_index].clone();
                inner.seq_index += 1;
                endpoint
            }
            RotationStrategy::Random => {
                let mut reshuffle =
                    inner.shuffled.is_empty() || inner.shuffle_idx >= inner.shuffled.len();
                // A pool-size change (only possible under skip-dead) would
                // otherwise leave the cursor pointing past the end.
                if self.skip_dead && inner.shuffled.len() != pool.len() {
                    reshuffle = true;
                }
                if reshuffle {
                    inner.shuffled.clear();
                    inner.shuffled.extend_from_slice(pool);
                    inner.shuffled.shuffle(&mut rand::thread_rng());
                    inner.shuffle_idx = 0;
                }
                let endpoint = inner.shuffled[inner.shuffle_idx].clone();
                inner.shuffle_idx += 1;
                endpoint
            }
        };

        inner.current = Some(selected.clone());
        inner.counter = 1;
        Ok(selected)
    }

    /// Mark an endpoint dead after a failed dial
    ///
    /// Idempotent; under skip-dead mode this invalidates the cached shuffle
    /// and alive pool, and fires the all-dead hook when the last alive
    /// endpoint goes down.
    pub fn mark_dead(&self, endpoint: &ProxyEndpoint) {
        endpoint.mark_dead();

        let mut inner = self.inner.lock();
        if !self.skip_dead {
            return;
        }
        inner.shuffled.clear();
        inner.pool_cache.clear();

        if !inner.all_dead_fired
            && !inner.endpoints.is_empty()
            && inner.endpoints.iter().all(|e| !e.is_alive())
        {
            inner.all_dead_fired = true;
            drop(inner);
            if let Some(callback) = &*self.on_all_dead.lock() {
                callback();
            }
        }
    }
}
