//! # cachefs-core
//!
//! Caching virtual filesystem.
//!
//! A filesystem presents hierarchical logical paths over a local store
//! and keeps remote content on disk:
//! - Logical paths are normalized once and compared by owning filesystem
//! - A named layout maps each path to its on-disk location
//! - Overlays fetch misses from an origin and push closed writes back,
//!   one operation per path at a time
//! - A background sweep expires entries older than `maxAge`

pub mod config;
pub mod eviction;
pub mod filesystem;
pub mod mapper;
pub mod origin;
pub mod overlay;
pub mod path;
pub mod provider;
pub mod registry;
pub mod store;
pub mod sync;

pub use config::{Config, FileSystemUri, StoreSettings, cache_root};
pub use eviction::{EvictionHandle, EvictionPolicy, EvictionSchedule, start_eviction, sweep};
pub use filesystem::FileSystem;
pub use mapper::{
    ContentHashMapper, FirstCharPrefixMapper, FlatMapper, HashOctetPrefixMapper, StorageMapper,
};
pub use origin::{DirectoryOrigin, mirror_wrapper};
pub use overlay::{Overlay, Retriever, Sender, copy_from_remote};
pub use path::{FileSystemId, LogicalPath};
pub use provider::FileSystemProvider;
pub use registry::{Chain, Registry, RegistryBuilder, WrapperContext, WrapperFn};
pub use store::{
    CopyOptions, DirEntry, FileAttr, FileType, LocalStore, LocalStoreOptions, Store, StoreError,
    StoreReader, StoreResult, StoreWriter, SweepReport, WriteMode,
};
pub use sync::{PathSynchronizer, Synchronized};
