//! Storage layouts: resolved key → relative physical location.
//!
//! Mappers are pure. Confinement of the result to the store's base
//! directory is enforced by the store, not here, so a buggy or hostile
//! mapper cannot write outside it.

use md5::{Digest, Md5};

use crate::store::{StoreError, StoreResult};

/// Named layout strategy.
pub trait StorageMapper: Send + Sync + std::fmt::Debug {
    /// Registry name of the layout.
    fn name(&self) -> &'static str;

    /// Map a resolved key (no leading separator, no dots) to a location
    /// relative to the store's base directory.
    fn map(&self, key: &str) -> StoreResult<String>;

    /// Whether directories are meaningful under this layout.
    fn supports_directories(&self) -> bool {
        true
    }
}

/// Physical location mirrors the logical key.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatMapper;

impl StorageMapper for FlatMapper {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn map(&self, key: &str) -> StoreResult<String> {
        Ok(key.to_string())
    }
}

/// `<d0>/<d0d1>/<md5hex><suffix>`: two levels of sharding on the digest of
/// the whole key, keeping the file extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentHashMapper;

impl StorageMapper for ContentHashMapper {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn map(&self, key: &str) -> StoreResult<String> {
        let digest = hex::encode(Md5::digest(key.as_bytes()));
        Ok(format!(
            "{}/{}/{}{}",
            &digest[..1],
            &digest[..2],
            digest,
            extension(key)
        ))
    }

    fn supports_directories(&self) -> bool {
        false
    }
}

/// MediaWiki upload layout: `<d0>/<d0d1>/<key>` using the first digest octet.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashOctetPrefixMapper;

impl StorageMapper for HashOctetPrefixMapper {
    fn name(&self) -> &'static str {
        "mediawiki"
    }

    fn map(&self, key: &str) -> StoreResult<String> {
        let digest = Md5::digest(key.as_bytes());
        let octet = hex::encode(&digest[..1]);
        Ok(format!("{}/{}/{}", &octet[..1], octet, key))
    }
}

/// Single directory named after the key's first character.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstCharPrefixMapper;

impl StorageMapper for FirstCharPrefixMapper {
    fn name(&self) -> &'static str {
        "opendata"
    }

    fn map(&self, key: &str) -> StoreResult<String> {
        let first = key
            .chars()
            .next()
            .ok_or_else(|| StoreError::invalid_path("empty key has no prefix"))?;
        Ok(format!("{first}/{key}"))
    }
}

/// Trailing `.ext` of the last segment, or empty.
fn extension(key: &str) -> &str {
    match (key.rfind('.'), key.rfind('/')) {
        (Some(dot), Some(slash)) if dot > slash => &key[dot..],
        (Some(dot), None) => &key[dot..],
        _ => "",
    }
}
