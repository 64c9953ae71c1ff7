//! Store layer: the capability trait, its local implementation, and the
//! shared types and errors.

mod error;
mod local;
mod ops;
mod types;

pub use error::{StoreError, StoreResult};
pub use local::{LocalStore, LocalStoreOptions};
pub use ops::{Store, StoreReader, StoreWriter};
pub use types::{CopyOptions, DirEntry, FileAttr, FileType, SweepReport, WriteMode};
