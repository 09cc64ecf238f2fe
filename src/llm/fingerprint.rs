//! Request fingerprints and the single-flight cache
//!
//! Concurrent callers issuing the same normalized request share one
//! provider call. Successful results are served from the cache until the
//! TTL elapses; failed results are dropped as soon as every waiter has
//! seen them. Expired entries are swept on insert, at most once per TTL.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::debug;

use super::{ModelRequest, ModelResponse, ModelResult};

/// Stable hash of the parts of a request that determine its answer
///
/// Whitespace in prompts is collapsed and `request_id` is ignored, so two
/// callers asking the same question share one fingerprint.
pub fn fingerprint(request: &ModelRequest) -> String {
    let normalize = |text: &str| text.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut hasher = Sha256::new();
    hasher.update(request.provider_id.as_deref().unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(request.model_name.as_deref().unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(request.system_prompt.as_deref().unwrap_or("")).as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(&request.prompt).as_bytes());
    hasher.update([0u8]);
    hasher.update(request.max_tokens.to_le_bytes());
    hasher.update(format!("{:.3}", request.temperature).as_bytes());
    format!("{:x}", hasher.finalize())
}

type Completed = (Instant, ModelResult<ModelResponse>);

#[derive(Default)]
struct Slot {
    cell: OnceCell<Completed>,
}

impl Slot {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.cell
            .get()
            .map_or(false, |(done, _)| now.saturating_duration_since(*done) >= ttl)
    }
}

pub struct SingleFlightCache {
    ttl: Duration,
    entries: DashMap<String, Arc<Slot>>,
    last_purge: Mutex<Instant>,
}

impl SingleFlightCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            last_purge: Mutex::new(Instant::now()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `call` unless an identical call is in flight or cached
    pub async fn get_or_call<F, Fut>(&self, key: String, call: F) -> ModelResult<ModelResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ModelResult<ModelResponse>>,
    {
        if self.ttl.is_zero() {
            return call().await;
        }

        let now = Instant::now();
        self.purge_if_due(now);

        let slot = {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::default()));
            if entry.is_expired(now, self.ttl) {
                *entry = Arc::new(Slot::default());
            }
            Arc::clone(&entry)
        };

        let (_, result) = slot
            .cell
            .get_or_init(|| async {
                let result = call().await;
                (Instant::now(), result)
            })
            .await;
        let result = result.clone();

        if result.is_err() {
            self.entries.remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
        }
        result
    }

    /// Drop every completed entry older than the TTL
    pub fn purge_expired(&self) {
        let now = Instant::now();
        *self.last_purge.lock().unwrap_or_else(|p| p.into_inner()) = now;
        self.entries.retain(|_, slot| !slot.is_expired(now, self.ttl));
    }

    fn purge_if_due(&self, now: Instant) {
        {
            let mut last = self.last_purge.lock().unwrap_or_else(|p| p.into_inner());
            if now.saturating_duration_since(*last) < self.ttl {
                return;
            }
            *last = now;
        }
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now, self.ttl));
        debug!(evicted = before.saturating_sub(self.entries.len()), "Expired fingerprints purged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelProviderError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn response(content: &str) -> ModelResponse {
        ModelResponse {
            request_id: Uuid::new_v4(),
            provider_id: "p1".to_string(),
            model_name: "m".to_string(),
            content: content.to_string(),
            latency_ms: 1,
            attempts: 1,
            prompt_tokens: None,
            completion_tokens: None,
            error: None,
        }
    }

    #[test]
    fn test_fingerprint_ignores_request_id_and_whitespace() {
        let a = ModelRequest::new("What is   the price?");
        let b = ModelRequest::new(" What is the\nprice? ");
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let mut c = ModelRequest::new("What is the price?");
        c.temperature = 0.2;
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_call() {
        let cache = Arc::new(SingleFlightCache::new(Duration::from_secs(30)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_call("key".to_string(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(response("shared"))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().content, "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = SingleFlightCache::new(Duration::from_secs(1));
        let first = cache
            .get_or_call("k".to_string(), || async { Ok(response("one")) })
            .await
            .unwrap();
        let cached = cache
            .get_or_call("k".to_string(), || async { Ok(response("two")) })
            .await
            .unwrap();
        assert_eq!(first.content, cached.content);

        tokio::time::advance(Duration::from_secs(1)).await;
        let fresh = cache
            .get_or_call("k".to_string(), || async { Ok(response("three")) })
            .await
            .unwrap();
        assert_eq!(fresh.content, "three");

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.purge_expired();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_prompts_are_evicted_after_ttl() {
        let cache = SingleFlightCache::new(Duration::from_secs(1));
        for i in 0..500 {
            cache
                .get_or_call(format!("prompt-{}", i), || async { Ok(response("answer")) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 500);

        tokio::time::advance(Duration::from_secs(3600)).await;
        cache
            .get_or_call("one more".to_string(), || async { Ok(response("fresh")) })
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = SingleFlightCache::new(Duration::from_secs(30));
        let err = cache
            .get_or_call("k".to_string(), || async {
                Err(ModelProviderError::Timeout("slow".to_string()))
            })
            .await;
        assert!(err.is_err());
        assert!(cache.is_empty());

        let ok = cache
            .get_or_call("k".to_string(), || async { Ok(response("recovered")) })
            .await
            .unwrap();
        assert_eq!(ok.content, "recovered");
    }
}
