//! Cache orchestrator.
//!
//! Read-through and write-back for the three entry kinds (single row,
//! get-all blob, aggregation metadata), the serialized-size ceiling, and
//! the invalidation helpers used after confirmed mutations. All entries of
//! a type live under its declared cache name; a type without one is simply
//! never cached.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde_json::Value;
use tracing::debug;

use crate::config::EngineSettings;
use crate::domain::schema::TypeDescriptor;
use crate::infra::cache::CacheBackend;

use super::identifier::{all_cache_key, item_cache_key, meta_cache_key};

pub struct CacheOrchestrator {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
    ceiling_bytes: usize,
}

impl CacheOrchestrator {
    pub fn new(backend: Arc<dyn CacheBackend>, settings: &EngineSettings) -> Self {
        Self {
            backend,
            default_ttl: settings.cache_ttl(),
            ceiling_bytes: settings.cache_ceiling_bytes,
        }
    }

    fn ttl(&self, desc: &TypeDescriptor) -> Duration {
        desc.cache_ttl_secs
            .map_or(self.default_ttl, Duration::from_secs)
    }

    async fn get_value(&self, key: &str) -> Option<Value> {
        match self.backend.get(key).await {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    counter!("tessera_cache_hit_total").increment(1);
                    Some(value)
                }
                Err(err) => {
                    debug!(key, %err, "dropping undecodable cache entry");
                    self.backend.del(&[key.to_string()]).await;
                    counter!("tessera_cache_miss_total").increment(1);
                    None
                }
            },
            None => {
                counter!("tessera_cache_miss_total").increment(1);
                None
            }
        }
    }

    async fn put_value(&self, desc: &TypeDescriptor, key: &str, value: &Value) {
        let Ok(payload) = serde_json::to_vec(value) else {
            return;
        };
        if payload.len() > self.ceiling_bytes {
            counter!("tessera_cache_skip_oversize_total").increment(1);
            debug!(key, size = payload.len(), "result exceeds cache ceiling");
            return;
        }
        self.backend
            .set(key, Bytes::from(payload), self.ttl(desc))
            .await;
    }

    // ========================================================================
    // Read-through lookups
    // ========================================================================

    pub async fn get_row(&self, desc: &TypeDescriptor, id: &str) -> Option<Value> {
        let cache_name = desc.cache_name.as_ref()?;
        self.get_value(&item_cache_key(cache_name, id)).await
    }

    pub async fn put_row(&self, desc: &TypeDescriptor, id: &str, row: &Value) {
        let Some(cache_name) = desc.cache_name.as_ref() else {
            return;
        };
        self.put_value(desc, &item_cache_key(cache_name, id), row)
            .await;
    }

    pub async fn get_all(&self, desc: &TypeDescriptor) -> Option<Value> {
        let cache_name = desc.cache_name.as_ref()?;
        self.get_value(&all_cache_key(cache_name)).await
    }

    pub async fn put_all(&self, desc: &TypeDescriptor, result: &Value) {
        let Some(cache_name) = desc.cache_name.as_ref() else {
            return;
        };
        self.put_value(desc, &all_cache_key(cache_name), result)
            .await;
    }

    pub async fn get_meta(&self, desc: &TypeDescriptor) -> Option<Value> {
        let cache_name = desc.cache_name.as_ref()?;
        self.get_value(&meta_cache_key(cache_name)).await
    }

    pub async fn put_meta(&self, desc: &TypeDescriptor, meta: &Value) {
        let Some(cache_name) = desc.cache_name.as_ref() else {
            return;
        };
        self.put_value(desc, &meta_cache_key(cache_name), meta)
            .await;
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Delete the given rows' entries plus the type's get-all and metadata
    /// entries. Called only after a confirmed database mutation.
    pub async fn invalidate_items<I>(&self, desc: &TypeDescriptor, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let Some(cache_name) = desc.cache_name.as_ref() else {
            return;
        };
        let mut keys: Vec<String> = ids
            .into_iter()
            .map(|id| item_cache_key(cache_name, &id))
            .collect();
        keys.push(all_cache_key(cache_name));
        keys.push(meta_cache_key(cache_name));
        self.backend.del(&keys).await;
    }

    /// Delete the get-all and metadata entries of declared child types.
    pub async fn invalidate_children(&self, desc: &TypeDescriptor) {
        if desc.child_cache_names.is_empty() {
            return;
        }
        let mut keys = Vec::with_capacity(desc.child_cache_names.len() * 2);
        for child in &desc.child_cache_names {
            keys.push(all_cache_key(child));
            keys.push(meta_cache_key(child));
        }
        self.backend.del(&keys).await;
    }

    /// Delete one ancestor entry plus the ancestor type's get-all and
    /// metadata entries.
    pub async fn invalidate_ancestors<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut keys = Vec::new();
        for (cache_name, id) in entries {
            keys.push(item_cache_key(&cache_name, &id));
            if !keys.contains(&all_cache_key(&cache_name)) {
                keys.push(all_cache_key(&cache_name));
                keys.push(meta_cache_key(&cache_name));
            }
        }
        if !keys.is_empty() {
            self.backend.del(&keys).await;
        }
    }
}
