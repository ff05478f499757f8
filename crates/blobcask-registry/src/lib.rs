//! Explicit registration and configuration of blob stores.
//!
//! A [`Registry`] is a constructor table mapping a type tag (`"memory"`,
//! `"limit"`, `"proxycache"`) to a function that builds the store from a
//! JSON config object. Registration is explicit and happens at startup —
//! there is no process-wide table populated at module load time, so there
//! is no hidden initialization order.
//!
//! Constructors resolve references to other stores by name through a
//! [`Loader`]; [`StoreMap`] is the plain map-backed implementation.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use blobcask_core::MemoryStorage;
//! # use blobcask_registry::{Registry, StoreMap};
//! # use serde_json::json;
//! let mut stores = StoreMap::new();
//! stores.insert("origin", Arc::new(MemoryStorage::new()));
//! stores.insert("cache", Arc::new(MemoryStorage::new()));
//!
//! let registry = Registry::with_defaults();
//! let px = registry
//!     .construct(
//!         &stores,
//!         "proxycache",
//!         &json!({ "origin": "origin", "cache": "cache" }),
//!     )
//!     .unwrap();
//! # let _ = px;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use blobcask_core::BlobStore;
use blobcask_core::MemoryStorage;
use blobcask_core::constants::DEFAULT_MAX_CACHE_BYTES;
use blobcask_limit::LimitStorage;
use blobcask_proxycache::ProxyCache;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use snafu::Snafu;

/// Errors from registry construction.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    /// No constructor registered under the tag.
    #[snafu(display("unknown storage type: {tag}"))]
    UnknownType {
        /// The unrecognized type tag.
        tag: String,
    },

    /// A named store was not found by the loader.
    #[snafu(display("unknown storage name: {name}"))]
    UnknownStore {
        /// The unresolved store name.
        name: String,
    },

    /// The config object did not match the constructor's schema.
    #[snafu(display("invalid {tag} config: {message}"))]
    InvalidConfig {
        /// The type tag whose config failed to parse.
        tag: String,
        /// What was wrong with it.
        message: String,
    },
}

/// Resolves store names to already-constructed stores.
pub trait Loader {
    /// Look up a store by name.
    fn get_storage(&self, name: &str) -> Result<Arc<dyn BlobStore>, RegistryError>;
}

/// A plain name-to-store map.
#[derive(Default)]
pub struct StoreMap {
    stores: HashMap<String, Arc<dyn BlobStore>>,
}

impl StoreMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under `name`, replacing any previous entry.
    pub fn insert(&mut self, name: &str, store: Arc<dyn BlobStore>) {
        self.stores.insert(name.to_string(), store);
    }
}

impl Loader for StoreMap {
    fn get_storage(&self, name: &str) -> Result<Arc<dyn BlobStore>, RegistryError> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownStore {
                name: name.to_string(),
            })
    }
}

/// Builds a store from a loader and a JSON config object.
pub type StorageConstructor =
    Box<dyn Fn(&dyn Loader, &serde_json::Value) -> Result<Arc<dyn BlobStore>, RegistryError> + Send + Sync>;

/// An explicit table of storage constructors.
#[derive(Default)]
pub struct Registry {
    constructors: HashMap<String, StorageConstructor>,
}

impl Registry {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with the built-in store types registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", Box::new(construct_memory));
        registry.register("limit", Box::new(construct_limit));
        registry.register("proxycache", Box::new(construct_proxycache));
        registry
    }

    /// Register a constructor under `tag`, replacing any previous one.
    pub fn register(&mut self, tag: &str, constructor: StorageConstructor) {
        self.constructors.insert(tag.to_string(), constructor);
    }

    /// Build a store of type `tag` from `config`.
    pub fn construct(
        &self,
        loader: &dyn Loader,
        tag: &str,
        config: &serde_json::Value,
    ) -> Result<Arc<dyn BlobStore>, RegistryError> {
        let constructor =
            self.constructors
                .get(tag)
                .ok_or_else(|| RegistryError::UnknownType {
                    tag: tag.to_string(),
                })?;
        constructor(loader, config)
    }
}

/// Parse a config object, rejecting unknown fields.
fn parse_config<T: DeserializeOwned>(
    tag: &str,
    config: &serde_json::Value,
) -> Result<T, RegistryError> {
    serde_json::from_value(config.clone()).map_err(|e| RegistryError::InvalidConfig {
        tag: tag.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MemoryConfig {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LimitConfig {
    /// The byte ceiling.
    capacity: u64,
    /// Name of the wrapped store.
    inner: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ProxyCacheConfig {
    /// Name of the authoritative backend.
    origin: String,
    /// Name of the cache backend.
    cache: String,
    /// Cache byte ceiling.
    #[serde(default = "default_max_cache_bytes")]
    max_cache_bytes: i64,
}

fn default_max_cache_bytes() -> i64 {
    DEFAULT_MAX_CACHE_BYTES
}

fn construct_memory(
    _loader: &dyn Loader,
    config: &serde_json::Value,
) -> Result<Arc<dyn BlobStore>, RegistryError> {
    let MemoryConfig {} = parse_config("memory", config)?;
    Ok(Arc::new(MemoryStorage::new()))
}

fn construct_limit(
    loader: &dyn Loader,
    config: &serde_json::Value,
) -> Result<Arc<dyn BlobStore>, RegistryError> {
    let cfg: LimitConfig = parse_config("limit", config)?;
    let inner = loader.get_storage(&cfg.inner)?;
    Ok(Arc::new(LimitStorage::new(cfg.capacity, inner)))
}

fn construct_proxycache(
    loader: &dyn Loader,
    config: &serde_json::Value,
) -> Result<Arc<dyn BlobStore>, RegistryError> {
    let cfg: ProxyCacheConfig = parse_config("proxycache", config)?;
    let origin = loader.get_storage(&cfg.origin)?;
    let cache = loader.get_storage(&cfg.cache)?;
    Ok(Arc::new(ProxyCache::new(cfg.max_cache_bytes, cache, origin)))
}
