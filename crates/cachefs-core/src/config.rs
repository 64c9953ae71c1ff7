//! Filesystem configuration.
//!
//! Configuration is a flat string map. It is assembled in three layers,
//! later layers overriding earlier ones:
//!
//! 1. `<cache root>/<authority>.toml`, a flat table of scalars;
//! 2. the map supplied by the caller;
//! 3. query parameters of the filesystem URI.
//!
//! [`StoreSettings`] is the typed view the store and eviction use.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::registry::WrapperFn;
use crate::store::{StoreError, StoreResult};

/// Override of the physical root directory.
pub const BASE_DIRECTORY: &str = "baseDirectory";
/// Mark the store temporary: its tree is deleted on close.
pub const DELETE_ON_EXIT: &str = "deleteOnExit";
/// Layout name: `flat`, `cache`, `mediawiki` or `opendata`.
pub const FILE_SYSTEM_TYPE: &str = "fileSystemType";
/// Comma-separated overlay wrapper names, applied in order.
pub const FILE_SYSTEM_WRAPPER: &str = "fileSystemWrapper";
/// Maximum entry age in milliseconds; 0 disables eviction.
pub const MAX_AGE: &str = "maxAge";
/// Milliseconds between sweeps; defaults to `maxAge`, ≤0 disables re-sweeping.
pub const SCAN_DELAY: &str = "scanDelay";
/// Sweep shortly after opening (default true).
pub const EXPIRE_ON_STARTUP: &str = "expireOnStartup";
/// Delete the whole store when opening (default false).
pub const CLEAR_ON_STARTUP: &str = "clearOnStartup";
/// Reject client writes (default false).
pub const READ_ONLY: &str = "readOnly";
/// Root directory of the `mirror` origin.
pub const REMOTE_DIRECTORY: &str = "remoteDirectory";
/// Make the `mirror` origin fetch-only.
pub const REMOTE_READ_ONLY: &str = "remoteReadOnly";

/// Environment variable overriding the cache root.
pub const CACHE_ROOT_ENV: &str = "CACHEFS_BASE";

/// Default layout when none is configured.
pub const DEFAULT_LAYOUT: &str = "cache";

/// String-keyed configuration map.
#[derive(Clone, Default)]
pub struct Config {
    values: BTreeMap<String, String>,
    wrapper_factory: Option<WrapperFn>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("values", &self.values)
            .field("wrapper_factory", &self.wrapper_factory.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Attach a wrapper applied after the named ones.
    pub fn with_wrapper_factory(mut self, factory: WrapperFn) -> Self {
        self.wrapper_factory = Some(factory);
        self
    }

    pub fn wrapper_factory(&self) -> Option<&WrapperFn> {
        self.wrapper_factory.as_ref()
    }

    /// Overlay `other` on top of this map. `other` wins on every key it
    /// sets, and its wrapper factory replaces ours if present.
    pub fn merged(mut self, other: &Config) -> Self {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
        if other.wrapper_factory.is_some() {
            self.wrapper_factory = other.wrapper_factory.clone();
        }
        self
    }

    /// Present and not `false`.
    pub fn is_true(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.trim().eq_ignore_ascii_case("false"))
    }

    /// Present and exactly `false`.
    pub fn is_false(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v.trim().eq_ignore_ascii_case("false"))
    }

    /// Boolean with a default for an absent key.
    pub fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(_) => self.is_true(key),
            None => default,
        }
    }

    /// Integer value; a present but malformed value is a configuration error.
    pub fn get_i64(&self, key: &str) -> StoreResult<Option<i64>> {
        self.get(key)
            .map(|v| {
                v.trim()
                    .parse::<i64>()
                    .map_err(|e| StoreError::config(format!("{key}={v:?}: {e}")))
            })
            .transpose()
    }

    /// Parse `key=value&...` pairs, percent-decoded.
    pub fn from_query(query: &str) -> Self {
        let mut config = Self::new();
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            config.insert(k.into_owned(), v);
        }
        config
    }

    /// Load a flat TOML table of scalars. A missing file is an empty map.
    pub fn from_toml_file(path: &Path) -> StoreResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(StoreError::io(path.display().to_string(), e)),
        };
        let config = Self::from_toml_str(&text)
            .map_err(|e| StoreError::config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), keys = config.values.len(), "loaded filesystem defaults");
        Ok(config)
    }

    /// Parse a flat TOML table of scalars.
    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        let table: toml::Table = text.parse().map_err(|e: toml::de::Error| e.to_string())?;
        let mut config = Self::new();
        for (key, value) in table {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Datetime(d) => d.to_string(),
                toml::Value::Array(_) | toml::Value::Table(_) => {
                    return Err(format!("{key}: expected a scalar value"));
                }
            };
            config.values.insert(key, value);
        }
        Ok(config)
    }
}

/// Root directory holding one store per authority.
///
/// `$CACHEFS_BASE` if set and non-empty, else `<platform cache dir>/cachefs`.
pub fn cache_root() -> StoreResult<PathBuf> {
    if let Ok(dir) = std::env::var(CACHE_ROOT_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    dirs::cache_dir()
        .map(|dir| dir.join("cachefs"))
        .ok_or_else(|| {
            StoreError::config(format!("no platform cache directory; set {CACHE_ROOT_ENV}"))
        })
}

/// A parsed `scheme://authority/path?query` address.
#[derive(Debug, Clone)]
pub struct FileSystemUri {
    pub scheme: String,
    pub authority: String,
    /// Percent-decoded path, `/` when absent.
    pub path: String,
    /// Decoded query parameters.
    pub query: Config,
}

impl FileSystemUri {
    pub fn parse(uri: &str) -> StoreResult<Self> {
        let url = Url::parse(uri).map_err(|e| StoreError::config(format!("{uri}: {e}")))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| StoreError::config(format!("{uri}: missing authority")))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        if authority == "." || authority == ".." {
            return Err(StoreError::config(format!("{uri}: invalid authority")));
        }

        let path = percent_decode_str(url.path())
            .decode_utf8()
            .map_err(|e| StoreError::config(format!("{uri}: path is not UTF-8: {e}")))?
            .into_owned();
        let path = if path.is_empty() { "/".to_string() } else { path };
        let query = url.query().map(Config::from_query).unwrap_or_default();

        Ok(Self {
            scheme: url.scheme().to_string(),
            authority,
            path,
            query,
        })
    }
}

/// Typed view of a [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub base_directory: Option<PathBuf>,
    pub temporary: bool,
    pub layout: String,
    pub wrappers: Vec<String>,
    /// `None` when eviction is disabled.
    pub max_age: Option<Duration>,
    /// `None` when periodic sweeping is disabled.
    pub scan_delay: Option<Duration>,
    pub expire_on_startup: bool,
    pub clear_on_startup: bool,
    pub read_only: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            base_directory: None,
            temporary: false,
            layout: DEFAULT_LAYOUT.to_string(),
            wrappers: Vec::new(),
            max_age: None,
            scan_delay: None,
            expire_on_startup: true,
            clear_on_startup: false,
            read_only: false,
        }
    }
}

impl StoreSettings {
    pub fn from_config(config: &Config) -> StoreResult<Self> {
        let layout = config
            .get(FILE_SYSTEM_TYPE)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_LAYOUT)
            .to_string();

        let wrappers = config
            .get(FILE_SYSTEM_WRAPPER)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let max_age_ms = config.get_i64(MAX_AGE)?.unwrap_or(0);
        let scan_delay_ms = config.get_i64(SCAN_DELAY)?.unwrap_or(max_age_ms);

        Ok(Self {
            base_directory: config
                .get(BASE_DIRECTORY)
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            temporary: config.is_true(DELETE_ON_EXIT),
            layout,
            wrappers,
            max_age: positive_millis(max_age_ms),
            scan_delay: positive_millis(scan_delay_ms),
            expire_on_startup: config.flag(EXPIRE_ON_STARTUP, true),
            clear_on_startup: config.is_true(CLEAR_ON_STARTUP),
            read_only: config.is_true(READ_ONLY),
        })
    }
}

fn positive_millis(ms: i64) -> Option<Duration> {
    u64::try_from(ms)
        .ok()
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
}
