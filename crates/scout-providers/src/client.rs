// Evidence Client
// Cached, retrying, bounded-concurrency front for the remote search backend

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use scout_types::EvidenceItem;

use crate::search::{normalize_item, SearchBackend};

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for evidence fetching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Cache entry lifetime in seconds; entries older than this are misses.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Additional attempts after the first failed backend call.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound of the random jitter added to each backoff delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Wall-clock timeout per backend call; exceeding it counts as a failed attempt.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Bound on concurrent backend calls within one batch.
    #[serde(default = "default_max_parallel_fetches")]
    pub max_parallel_fetches: usize,
    /// URL budget passed to the backend per query.
    #[serde(default = "default_max_urls_per_query")]
    pub max_urls_per_query: usize,
}

fn default_cache_ttl_secs() -> u64 {
    120
}
fn default_retry_attempts() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    200
}
fn default_jitter_ms() -> u64 {
    100
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_max_parallel_fetches() -> usize {
    5
}
fn default_max_urls_per_query() -> usize {
    5
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            retry_attempts: default_retry_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            jitter_ms: default_jitter_ms(),
            timeout_secs: default_timeout_secs(),
            max_parallel_fetches: default_max_parallel_fetches(),
            max_urls_per_query: default_max_urls_per_query(),
        }
    }
}

// ============================================================================
// Evidence Client
// ============================================================================

struct CacheEntry {
    inserted_at: Instant,
    items: Vec<EvidenceItem>,
}

/// Client for the remote search backend. Shared across runs; the cache is
/// keyed by normalized query, never by run, so there is no cross-run
/// contention beyond the cache lock itself.
#[derive(Clone)]
pub struct EvidenceClient {
    backend: Arc<dyn SearchBackend>,
    config: SearchConfig,
    cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
    semaphore: Arc<Semaphore>,
}

impl EvidenceClient {
    pub fn new(backend: Arc<dyn SearchBackend>, config: SearchConfig) -> Self {
        let permits = config.max_parallel_fetches.max(1);
        Self {
            backend,
            config,
            cache: Arc::new(Mutex::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Fetch evidence for a batch of queries, concurrently with bounded
    /// parallelism. One bad query never aborts the others: a query whose
    /// retry budget is exhausted maps to an empty item list.
    pub async fn fetch(&self, queries: &[String]) -> HashMap<String, Vec<EvidenceItem>> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = queries
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty() && seen.insert(cache_key(q)))
            .collect();

        let mut join_set: JoinSet<(String, Vec<EvidenceItem>)> = JoinSet::new();
        for query in unique {
            let client = self.clone();
            let semaphore = self.semaphore.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (query, Vec::new()),
                };
                let items = client.fetch_single(&query).await;
                (query, items)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((query, items)) => {
                    results.insert(query, items);
                }
                Err(e) => tracing::error!("evidence fetch task join error: {}", e),
            }
        }
        results
    }

    /// Fetch one query: cache first, then the backend with retry/backoff.
    async fn fetch_single(&self, query: &str) -> Vec<EvidenceItem> {
        let key = cache_key(query);
        if let Some(items) = self.cache_lookup(&key).await {
            tracing::debug!("cache hit for query `{}`", query);
            return items;
        }

        let attempts = self.config.retry_attempts + 1;
        let mut last_error = String::new();
        for attempt in 0..attempts {
            let call = self.backend.search(query, self.config.max_urls_per_query);
            match tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), call).await {
                Ok(Ok(response)) => {
                    let items: Vec<EvidenceItem> =
                        response.results.iter().filter_map(normalize_item).collect();
                    tracing::debug!("query `{}` returned {} usable items", query, items.len());
                    if !items.is_empty() {
                        self.cache_store(&key, &items).await;
                    }
                    return items;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {}s", self.config.timeout_secs);
                }
            }

            if attempt + 1 < attempts {
                let delay = self.backoff_delay(attempt);
                tracing::warn!(
                    "search failed for `{}` (attempt {}/{}): {}; retrying in {:?}",
                    query,
                    attempt + 1,
                    attempts,
                    last_error,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        tracing::error!(
            "search failed for `{}` after {} attempts: {}",
            query,
            attempts,
            last_error
        );
        Vec::new()
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_ms.saturating_mul(1 << attempt);
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    async fn cache_lookup(&self, key: &str) -> Option<Vec<EvidenceItem>> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let mut cache = self.cache.lock().await;
        match cache.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < ttl => Some(entry.items.clone()),
            Some(_) => {
                // Expired entries are logically absent; evict lazily.
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    async fn cache_store(&self, key: &str, items: &[EvidenceItem]) {
        let mut cache = self.cache.lock().await;
        cache.insert(
            key.to_string(),
            CacheEntry {
                inserted_at: Instant::now(),
                items: items.to_vec(),
            },
        );
    }
}

fn cache_key(query: &str) -> String {
    query.trim().to_lowercase()
}

// ============================================================================
// Tests
// ============================================================================
