//! Process-wide model cache.
//!
//! `load_model` treats the url as an opaque string (a filesystem path in
//! this implementation). Concurrent loads of one url are single-flight: the
//! second caller waits for the first and receives the same shared model.
//! The cache keeps the most recently used models up to its limit; evicted
//! models stay alive for as long as a session holds them.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};

#[cfg_attr(not(test), allow(unused_imports))]
use crate::error::{ModelError, ModelResult};
use crate::info::Model;

/// Environment variable bounding the process-wide cache (default 3).
pub const MODEL_CACHE_LIMIT_ENV: &str = "CNIS_MODEL_CACHE_LIMIT";

const DEFAULT_CACHE_LIMIT: usize = 3;

enum Slot {
    /// A loader is in flight; waiters block on the cache condvar.
    Loading,
    Ready { model: Arc<Model>, last_used: u64 },
}

struct CacheState {
    slots: HashMap<String, Slot>,
    tick: u64,
}

/// LRU cache of loaded models keyed by url.
pub struct ModelCache {
    state: Mutex<CacheState>,
    loaded: Condvar,
    limit: usize,
}

impl ModelCache {
    /// Creates a cache bounded to `limit` models.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                tick: 0,
            }),
            loaded: Condvar::new(),
            limit: limit.max(1),
        }
    }

    /// Loads the package at `url`, deduplicating concurrent and repeated
    /// loads of the same url.
    pub fn load(&self, url: &str) -> ModelResult<Arc<Model>> {
        loop {
            let mut state = self.state.lock();
            state.tick += 1;
            let tick = state.tick;
            match state.slots.get_mut(url) {
                Some(Slot::Ready { model, last_used }) => {
                    *last_used = tick;
                    return Ok(Arc::clone(model));
                }
                Some(Slot::Loading) => {
                    self.loaded.wait(&mut state);
                    continue;
                }
                None => {
                    state.slots.insert(url.to_string(), Slot::Loading);
                }
            }
            drop(state);

            let result = Self::load_package(url);
            let mut state = self.state.lock();
            match result {
                Ok(model) => {
                    state.tick += 1;
                    let tick = state.tick;
                    state.slots.insert(
                        url.to_string(),
                        Slot::Ready {
                            model: Arc::clone(&model),
                            last_used: tick,
                        },
                    );
                    self.evict_over_limit(&mut state);
                    self.loaded.notify_all();
                    return Ok(model);
                }
                Err(err) => {
                    state.slots.remove(url);
                    self.loaded.notify_all();
                    return Err(err);
                }
            }
        }
    }

    fn load_package(url: &str) -> ModelResult<Arc<Model>> {
        log::info!("[Model] [Load] loading package from {url}");
        let bytes = std::fs::read(url)?;
        Model::from_bytes(&bytes)
    }

    fn evict_over_limit(&self, state: &mut CacheState) {
        while state
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count()
            > self.limit
        {
            let victim = state
                .slots
                .iter()
                .filter_map(|(url, slot)| match slot {
                    Slot::Ready { last_used, .. } => Some((*last_used, url.clone())),
                    Slot::Loading => None,
                })
                .min();
            match victim {
                Some((_, url)) => {
                    log::info!("[Model] [Cache] evicting least recently used {url}");
                    state.slots.remove(&url);
                }
                None => break,
            }
        }
    }

    /// Drops the cached model with `key`. Returns whether a model was
    /// removed.
    pub fn unload(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let url = state.slots.iter().find_map(|(url, slot)| match slot {
            Slot::Ready { model, .. } if model.key() == key => Some(url.clone()),
            _ => None,
        });
        match url {
            Some(url) => {
                state.slots.remove(&url);
                true
            }
            None => false,
        }
    }

    /// Empties the cache.
    pub fn clear(&self) {
        self.state.lock().slots.clear();
    }

    /// Number of cached (ready) models.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count()
    }

    /// `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn process_cache() -> &'static ModelCache {
    static CACHE: OnceLock<ModelCache> = OnceLock::new();
    CACHE.get_or_init(|| {
        let limit = std::env::var(MODEL_CACHE_LIMIT_ENV)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_CACHE_LIMIT);
        ModelCache::with_limit(limit)
    })
}

/// Loads a model through the process-wide cache.
pub fn load_model(url: &str) -> ModelResult<Arc<Model>> {
    process_cache().load(url)
}

/// Removes the model with `key` from the process-wide cache.
pub fn unload_model(key: &str) -> bool {
    process_cache().unload(key)
}

/// Empties the process-wide cache.
pub fn clear_model_cache() {
    process_cache().clear()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn manifest_json(name: &str, batch: usize) -> String {
        format!(
            r#"{{
                "name": "{name}",
                "inputs": [{{"dims": [{batch}, 3, 8, 8], "dtype": "u8", "order": "NCHW"}}],
                "outputs": [{{"dims": [{batch}, 10], "dtype": "f32", "order": "NONE"}}]
            }}"#
        )
    }

    fn write_package(dir: &tempfile::TempDir, file: &str, name: &str, batch: usize) -> String {
        let path = dir.path().join(file);
        let mut f = std::fs::File::create(&path).expect("create manifest");
        f.write_all(manifest_json(name, batch).as_bytes())
            .expect("write manifest");
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn repeated_load_shares_one_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = write_package(&dir, "m.json", "m", 4);
        let cache = ModelCache::with_limit(3);
        let a = cache.load(&url).expect("first load");
        let b = cache.load(&url).expect("second load");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_load_shares_one_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = write_package(&dir, "m.json", "m", 4);
        let cache = Arc::new(ModelCache::with_limit(3));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let url = url.clone();
                std::thread::spawn(move || cache.load(&url).expect("load"))
            })
            .collect();
        let models: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();
        for m in &models[1..] {
            assert!(Arc::ptr_eq(&models[0], m));
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn least_recently_used_model_is_evicted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let urls: Vec<String> = (0..3)
            .map(|i| write_package(&dir, &format!("m{i}.json"), &format!("m{i}"), 4))
            .collect();
        let cache = ModelCache::with_limit(2);
        cache.load(&urls[0]).expect("load 0");
        cache.load(&urls[1]).expect("load 1");
        cache.load(&urls[0]).expect("touch 0");
        cache.load(&urls[2]).expect("load 2 evicts 1");
        assert_eq!(cache.len(), 2);
        let reloaded = cache.load(&urls[1]).expect("reload 1");
        assert_eq!(reloaded.name(), "m1");
    }

    #[test]
    fn unload_by_key_and_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = write_package(&dir, "m.json", "m", 4);
        let cache = ModelCache::with_limit(3);
        let model = cache.load(&url).expect("load");
        assert!(cache.unload(model.key()));
        assert!(!cache.unload(model.key()), "second unload finds nothing");
        cache.load(&url).expect("load again");
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn missing_package_fails_and_unblocks_waiters() {
        let cache = ModelCache::with_limit(3);
        assert!(matches!(
            cache.load("/nonexistent/model.json"),
            Err(ModelError::Read(_))
        ));
        assert!(cache.is_empty());
    }
}
