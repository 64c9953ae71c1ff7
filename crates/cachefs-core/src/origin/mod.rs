//! Built-in remote origins.

mod mirror;

pub use mirror::{DirectoryOrigin, MIRROR, mirror_wrapper};
