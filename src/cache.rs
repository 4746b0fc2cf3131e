//! Template cache.
//!
//! In-process `(identifier, teamSlug?, tag) -> AliasInfo` mapping, populated
//! on miss from the store and invalidated by the tag catalog after a tag
//! mutation commits. Same store/load-with-expiry shape as a typical
//! policy cache, but in-memory and safe under concurrent readers
//! (`dashmap`) with a single-flight lock on miss so two concurrent readers
//! of the same cold key only hit the store once and both observe the same
//! fresh value.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::model::EnvBuild;

#[derive(Debug, Clone, PartialEq)]
pub struct AliasInfo {
    pub template_id: String,
    pub team_id: Uuid,
    pub public: bool,
    pub aliases: Vec<String>,
    pub build: EnvBuild,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Alias {
        identifier: String,
        team_slug: Option<String>,
        tag: String,
    },
    ById {
        template_id: String,
        tag: String,
    },
}

/// Safe under concurrent readers; writer-exclusive only for the duration of
/// a single invalidate call (a `DashMap` shard lock), never for the whole
/// cache.
#[derive(Default)]
pub struct TemplateCache {
    entries: DashMap<CacheKey, AliasInfo>,
    loading: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespaced exact match, for a specific tag (defaulting to `latest`
    /// is the caller's job -- callers parse the `name:tag` target before
    /// calling in).
    pub async fn resolve_alias<F, Fut>(
        &self,
        identifier: &str,
        team_slug: Option<&str>,
        tag: &str,
        loader: F,
    ) -> ApiResult<AliasInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<AliasInfo>>,
    {
        let key = CacheKey::Alias {
            identifier: identifier.to_string(),
            team_slug: team_slug.map(str::to_string),
            tag: tag.to_string(),
        };
        self.get_or_load(key, loader).await
    }

    /// `GetByID(templateID)` for a specific tag.
    pub async fn get_by_id<F, Fut>(&self, template_id: &str, tag: &str, loader: F) -> ApiResult<AliasInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<AliasInfo>>,
    {
        let key = CacheKey::ById {
            template_id: template_id.to_string(),
            tag: tag.to_string(),
        };
        self.get_or_load(key, loader).await
    }

    async fn get_or_load<F, Fut>(&self, key: CacheKey, loader: F) -> ApiResult<AliasInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<AliasInfo>>,
    {
        if let Some(hit) = self.entries.get(&key) {
            return Ok(hit.clone());
        }

        // Single-flight: only the first caller for this key actually loads;
        // everyone else waits on the same lock and then re-checks the map.
        let lock = self
            .loading
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(hit) = self.entries.get(&key) {
            return Ok(hit.clone());
        }

        let value = loader().await?;
        self.entries.insert(key.clone(), value.clone());
        self.loading.remove(&key);
        Ok(value)
    }

    /// Point invalidation for `(templateID, tag)`. The next read after this
    /// returns observes a fresh value (`get_or_load` reloads on miss) --
    /// the publication barrier a tag mutation needs before it can be
    /// considered visible.
    pub fn invalidate(&self, template_id: &str, tag: &str) {
        self.entries
            .retain(|k, v| !(v.template_id == template_id && key_tag(k) == Some(tag)));
    }

    /// Bulk invalidation of every tag of a template.
    pub fn invalidate_all_tags(&self, template_id: &str) {
        self.entries.retain(|_, v| v.template_id != template_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Invalidation matches on the *value* side: the lookup key alone doesn't
// know which template an alias resolved to.
fn key_tag(key: &CacheKey) -> Option<&str> {
    match key {
        CacheKey::Alias { tag, .. } => Some(tag),
        CacheKey::ById { tag, .. } => Some(tag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BuildStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn alias_info(template_id: &str) -> AliasInfo {
        AliasInfo {
            template_id: template_id.to_string(),
            team_id: Uuid::new_v4(),
            public: false,
            aliases: vec!["app".to_string()],
            build: EnvBuild {
                id: Uuid::new_v4(),
                template_id: template_id.to_string(),
                status: BuildStatus::Succeeded,
                vcpu: 1,
                ram_mb: 512,
                free_disk_mb: 1024,
                kernel_version: "5.10".to_string(),
                firecracker_version: "1.7.0".to_string(),
                envd_version: Some("0.2.0".to_string()),
                dockerfile: None,
                start_cmd: None,
                ready_cmd: None,
                cluster_node_id: None,
                cpu_info: None,
            },
        }
    }

    #[tokio::test]
    async fn miss_then_hit_loads_once() {
        let cache = TemplateCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let info = cache
                .resolve_alias("app", Some("acme"), "latest", || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(alias_info("tpl1"))
                    }
                })
                .await
                .unwrap();
            assert_eq!(info.template_id, "tpl1");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_reload_with_fresh_value() {
        let cache = TemplateCache::new();
        cache
            .resolve_alias("app", Some("acme"), "latest", || async { Ok(alias_info("tpl1")) })
            .await
            .unwrap();

        cache.invalidate("tpl1", "latest");
        assert!(cache.is_empty());

        let reloaded = cache
            .resolve_alias("app", Some("acme"), "latest", || async { Ok(alias_info("tpl1-v2")) })
            .await
            .unwrap();
        assert_eq!(reloaded.template_id, "tpl1-v2");
    }

    #[tokio::test]
    async fn invalidate_all_tags_clears_every_tag_of_a_template() {
        let cache = TemplateCache::new();
        cache
            .resolve_alias("app", Some("acme"), "latest", || async { Ok(alias_info("tpl1")) })
            .await
            .unwrap();
        cache
            .resolve_alias("app", Some("acme"), "v1", || async { Ok(alias_info("tpl1")) })
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);

        cache.invalidate_all_tags("tpl1");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn concurrent_readers_single_flight_on_cold_key() {
        let cache = Arc::new(TemplateCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_by_id("tpl1", "latest", || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                            Ok(alias_info("tpl1"))
                        }
                    })
                    .await
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
