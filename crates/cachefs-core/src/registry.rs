//! Backend registry: layout and wrapper lookup by name.
//!
//! The registry is a static table built once. [`Registry::builtin`] holds
//! the layouts and wrappers shipped with this crate; applications needing
//! their own wrappers assemble a table with [`Registry::builder`] before
//! opening any filesystem and pass it to the provider.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock, OnceLock};

use tracing::debug;

use crate::config::{Config, StoreSettings};
use crate::mapper::{
    ContentHashMapper, FirstCharPrefixMapper, FlatMapper, HashOctetPrefixMapper, StorageMapper,
};
use crate::origin;
use crate::store::{LocalStore, LocalStoreOptions, Store, StoreError, StoreResult};
use crate::sync::PathSynchronizer;

/// Constructor of a layout.
pub type LayoutFn = fn() -> Arc<dyn StorageMapper>;

/// Decorator constructor: wraps `next` and returns the new top of the chain.
pub type WrapperFn =
    Arc<dyn Fn(Arc<dyn Store>, &WrapperContext) -> StoreResult<Arc<dyn Store>> + Send + Sync>;

/// What every wrapper of one chain shares.
pub struct WrapperContext {
    config: Config,
    synchronizer: OnceLock<Arc<PathSynchronizer>>,
}

impl WrapperContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            synchronizer: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The chain's synchronizer, created on first request.
    pub fn synchronizer(&self) -> Arc<PathSynchronizer> {
        self.synchronizer
            .get_or_init(|| Arc::new(PathSynchronizer::new()))
            .clone()
    }
}

/// A composed chain: the local store at the bottom, `top` for clients.
#[derive(Debug, Clone)]
pub struct Chain {
    pub local: Arc<LocalStore>,
    pub top: Arc<dyn Store>,
}

/// Name → constructor tables.
#[derive(Clone)]
pub struct Registry {
    layouts: BTreeMap<&'static str, LayoutFn>,
    wrappers: BTreeMap<String, WrapperFn>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("layouts", &self.layouts.keys().collect::<Vec<_>>())
            .field("wrappers", &self.wrappers.keys().collect::<Vec<_>>())
            .finish()
    }
}

static BUILTIN: LazyLock<Arc<Registry>> = LazyLock::new(|| Arc::new(Registry::builder().build()));

impl Registry {
    /// The process-wide registry of built-in implementations.
    pub fn builtin() -> Arc<Registry> {
        BUILTIN.clone()
    }

    /// Start from the built-ins.
    pub fn builder() -> RegistryBuilder {
        let mut layouts: BTreeMap<&'static str, LayoutFn> = BTreeMap::new();
        layouts.insert("flat", || -> Arc<dyn StorageMapper> { Arc::new(FlatMapper) });
        layouts.insert("cache", || -> Arc<dyn StorageMapper> { Arc::new(ContentHashMapper) });
        layouts.insert("mediawiki", || -> Arc<dyn StorageMapper> { Arc::new(HashOctetPrefixMapper) });
        layouts.insert("opendata", || -> Arc<dyn StorageMapper> { Arc::new(FirstCharPrefixMapper) });

        let mut wrappers: BTreeMap<String, WrapperFn> = BTreeMap::new();
        wrappers.insert(origin::MIRROR.to_string(), Arc::new(origin::mirror_wrapper));

        RegistryBuilder {
            registry: Registry { layouts, wrappers },
        }
    }

    pub fn layout_names(&self) -> impl Iterator<Item = &str> {
        self.layouts.keys().copied()
    }

    pub fn wrapper_names(&self) -> impl Iterator<Item = &str> {
        self.wrappers.keys().map(String::as_str)
    }

    /// Instantiate a layout. Unknown names are a configuration error.
    pub fn layout(&self, name: &str) -> StoreResult<Arc<dyn StorageMapper>> {
        self.layouts
            .get(name)
            .map(|ctor| ctor())
            .ok_or_else(|| StoreError::config(format!("unknown file system type: {name}")))
    }

    /// Look up wrappers in order. Any unknown name fails the whole list.
    pub fn wrappers(&self, names: &[String]) -> StoreResult<Vec<(String, WrapperFn)>> {
        names
            .iter()
            .map(|name| {
                self.wrappers
                    .get(name)
                    .map(|ctor| (name.clone(), ctor.clone()))
                    .ok_or_else(|| {
                        StoreError::config(format!("unknown file system wrapper: {name}"))
                    })
            })
            .collect()
    }

    /// Fold `wrappers` over `base` in order, then the config's injected
    /// factory if any. Every wrapper sees the same context.
    pub fn compose(
        &self,
        base: Arc<dyn Store>,
        wrappers: &[(String, WrapperFn)],
        config: &Config,
    ) -> StoreResult<Arc<dyn Store>> {
        let ctx = WrapperContext::new(config.clone());
        let mut top = base;
        for (name, wrap) in wrappers {
            debug!(wrapper = %name, "applying wrapper");
            top = wrap(top, &ctx)?;
        }
        if let Some(factory) = config.wrapper_factory() {
            debug!("applying injected wrapper");
            top = factory(top, &ctx)?;
        }
        Ok(top)
    }

    /// Validate names, open the local store at `base`, compose the chain.
    ///
    /// Names are checked before anything touches the disk.
    pub async fn build(&self, base: &Path, config: &Config) -> StoreResult<Chain> {
        let settings = StoreSettings::from_config(config)?;
        let mapper = self.layout(&settings.layout)?;
        let wrappers = self.wrappers(&settings.wrappers)?;

        let options = LocalStoreOptions {
            temporary: settings.temporary,
            clear_on_startup: settings.clear_on_startup,
        };
        let local = Arc::new(LocalStore::open(base, mapper, options).await?);
        let top = self.compose(local.clone(), &wrappers, config)?;
        Ok(Chain { local, top })
    }
}

/// Assembles a custom [`Registry`].
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    pub fn layout(mut self, name: &'static str, ctor: LayoutFn) -> Self {
        self.registry.layouts.insert(name, ctor);
        self
    }

    pub fn wrapper(mut self, name: impl Into<String>, ctor: WrapperFn) -> Self {
        self.registry.wrappers.insert(name.into(), ctor);
        self
    }

    pub fn build(self) -> Registry {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FILE_SYSTEM_TYPE, FILE_SYSTEM_WRAPPER};
    use crate::overlay::Overlay;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Wrapper that records its name when applied and checks the shared
    /// synchronizer.
    fn recording(
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        seen: Arc<Mutex<Vec<Arc<PathSynchronizer>>>>,
    ) -> WrapperFn {
        Arc::new(
            move |next: Arc<dyn Store>, ctx: &WrapperContext| -> StoreResult<Arc<dyn Store>> {
                log.lock().push(name);
                seen.lock().push(ctx.synchronizer());
                Ok(Arc::new(Overlay::new(next)))
            },
        )
    }

    #[test]
    fn test_builtin_names() {
        let registry = Registry::builtin();
        let layouts: Vec<_> = registry.layout_names().collect();
        assert_eq!(layouts, ["cache", "flat", "mediawiki", "opendata"]);
        assert!(registry.wrapper_names().any(|n| n == "mirror"));
        assert_eq!(registry.layout("cache").unwrap().name(), "cache");
    }

    #[test]
    fn test_unknown_names_are_config_errors() {
        let registry = Registry::builtin();
        assert!(matches!(
            registry.layout("tape"),
            Err(StoreError::Config(_))
        ));

        let err = registry
            .wrappers(&["mirror".to_string(), "nope".to_string()])
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Config(_)));
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_unknown_wrapper_fails_before_io() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("never-created");
        let config = Config::new().with(FILE_SYSTEM_WRAPPER, "bogus");

        let err = Registry::builtin().build(&base, &config).await.unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
        assert!(!base.exists());
    }

    #[tokio::test]
    async fn test_wrappers_applied_in_order_with_shared_context() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let registry = Registry::builder()
            .wrapper("first", recording("first", log.clone(), seen.clone()))
            .wrapper("second", recording("second", log.clone(), seen.clone()))
            .build();
        let config = Config::new()
            .with(FILE_SYSTEM_TYPE, "flat")
            .with(FILE_SYSTEM_WRAPPER, "second,first")
            .with_wrapper_factory(recording("injected", log.clone(), seen.clone()));

        let chain = registry.build(dir.path(), &config).await.unwrap();

        assert_eq!(*log.lock(), ["second", "first", "injected"]);
        let seen = seen.lock();
        assert!(seen.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(chain.local.mapper().name(), "flat");
        assert_eq!(chain.top.base_directory(), chain.local.base_directory());
    }

    #[tokio::test]
    async fn test_empty_layout_defaults_to_cache() {
        let dir = TempDir::new().unwrap();
        let config = Config::new().with(FILE_SYSTEM_TYPE, "  ");
        let chain = Registry::builtin().build(dir.path(), &config).await.unwrap();
        assert_eq!(chain.local.mapper().name(), "cache");
    }
}
