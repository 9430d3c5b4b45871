//! Maintenance tool configuration.
//!
//! Loaded from environment variables:
//!
//! - `BPLUS_DATA_DIRECTORY`: Directory holding the store files (default: `./data`)
//! - `BPLUS_KEY_LENGTH`: Maximum key length for new stores (default: `64`)
//! - `BPLUS_NODE_SIZE`: Keys per tree node for new stores (default: `32`)
//! - `BPLUS_BLOCK_SIZE`: Heap payload bytes per buffer for new stores (default: `1024`)
//! - `BPLUS_FOOTPRINT_LIMIT`: Materialized leaves kept in memory (default: `100`)
//! - `BPLUS_COLLATION`: `ordinal` or `invariant` for new stores (default: `invariant`)
//! - `BPLUS_FIX_ERRORS`: Repair instead of only reporting (default: `false`)
//!
//! Layout parameters only apply when the store is created. An existing
//! store keeps the ones recorded in its headers.

use std::path::PathBuf;
use std::str::FromStr;

use crate::storage::btree::{
    DEFAULT_FOOTPRINT_LIMIT, MAX_KEY_LENGTH, MIN_FOOTPRINT_LIMIT, MIN_KEY_LENGTH, MIN_NODE_SIZE,
};
use crate::storage::chunk_heap::MIN_PAYLOAD_SIZE;
use crate::storage::{
    Collation, DEFAULT_KEY_LENGTH, DEFAULT_NODE_SIZE, DEFAULT_PAYLOAD_SIZE, StoreOptions,
};

/// Configuration for opening and checking a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding `index.bpt` and `heap.bpt`.
    pub data_directory: PathBuf,
    pub max_key_length: usize,
    pub node_size: usize,
    pub payload_size: usize,
    pub footprint_limit: usize,
    pub collation: Collation,
    /// Reclaim leaked space and rebuild broken free lists.
    pub fix_errors: bool,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from(Self::DEFAULT_DATA_DIRECTORY),
            max_key_length: DEFAULT_KEY_LENGTH,
            node_size: DEFAULT_NODE_SIZE,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            footprint_limit: DEFAULT_FOOTPRINT_LIMIT,
            collation: Collation::default(),
            fix_errors: false,
        }
    }
}

impl StoreConfig {
    /// Default data directory.
    pub const DEFAULT_DATA_DIRECTORY: &'static str = "./data";
    /// File name of the index tree inside the data directory.
    pub const INDEX_FILE_NAME: &'static str = "index.bpt";
    /// File name of the chunk heap inside the data directory.
    pub const HEAP_FILE_NAME: &'static str = "heap.bpt";

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that does not parse
    /// or is outside the range the store accepts.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let data_directory = lookup("BPLUS_DATA_DIRECTORY")
            .map_or(defaults.data_directory, PathBuf::from);
        let max_key_length = load_ranged(
            &lookup,
            "BPLUS_KEY_LENGTH",
            defaults.max_key_length,
            MIN_KEY_LENGTH..=MAX_KEY_LENGTH,
        )?;
        let node_size = load_ranged(
            &lookup,
            "BPLUS_NODE_SIZE",
            defaults.node_size,
            MIN_NODE_SIZE..=usize::from(u16::MAX),
        )?;
        let payload_size = load_ranged(
            &lookup,
            "BPLUS_BLOCK_SIZE",
            defaults.payload_size,
            MIN_PAYLOAD_SIZE..=usize::MAX,
        )?;
        let footprint_limit = load_ranged(
            &lookup,
            "BPLUS_FOOTPRINT_LIMIT",
            defaults.footprint_limit,
            MIN_FOOTPRINT_LIMIT..=usize::MAX,
        )?;
        let collation = load_parsed(&lookup, "BPLUS_COLLATION", defaults.collation)?;
        let fix_errors = load_flag(&lookup, "BPLUS_FIX_ERRORS", defaults.fix_errors)?;

        Ok(Self {
            data_directory,
            max_key_length,
            node_size,
            payload_size,
            footprint_limit,
            collation,
            fix_errors,
        })
    }

    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.data_directory.join(Self::INDEX_FILE_NAME)
    }

    #[must_use]
    pub fn heap_path(&self) -> PathBuf {
        self.data_directory.join(Self::HEAP_FILE_NAME)
    }

    /// Layout used when the store has to be created.
    #[must_use]
    pub const fn options(&self) -> StoreOptions {
        StoreOptions {
            max_key_length: self.max_key_length,
            node_size: self.node_size,
            payload_size: self.payload_size,
            collation: self.collation,
        }
    }
}

fn load_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}': {e}"),
        }),
        None => Ok(default),
    }
}

fn load_ranged(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
    range: std::ops::RangeInclusive<usize>,
) -> Result<usize, ConfigError> {
    let value = load_parsed(lookup, name, default)?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!(
                "{value} is out of range ({}..={})",
                range.start(),
                range.end()
            ),
        })
    }
}

fn load_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(name).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1" | "true" | "yes") => Ok(true),
        Some("0" | "false" | "no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{other}' is not a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = StoreConfig::from_lookup(lookup_from(&[])).expect("defaults");
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.data_directory, PathBuf::from("./data"));
        assert_eq!(config.max_key_length, 64);
        assert_eq!(config.node_size, 32);
        assert_eq!(config.payload_size, 1024);
        assert_eq!(config.footprint_limit, 100);
        assert_eq!(config.collation, Collation::Invariant);
        assert!(!config.fix_errors);
    }

    #[test]
    fn test_overrides() {
        let config = StoreConfig::from_lookup(lookup_from(&[
            ("BPLUS_DATA_DIRECTORY", "/tmp/store"),
            ("BPLUS_KEY_LENGTH", "20"),
            ("BPLUS_NODE_SIZE", "6"),
            ("BPLUS_BLOCK_SIZE", "256"),
            ("BPLUS_FOOTPRINT_LIMIT", "12"),
            ("BPLUS_COLLATION", "Ordinal"),
            ("BPLUS_FIX_ERRORS", "true"),
        ]))
        .expect("overrides");

        assert_eq!(config.index_path(), PathBuf::from("/tmp/store/index.bpt"));
        assert_eq!(config.heap_path(), PathBuf::from("/tmp/store/heap.bpt"));
        assert!(config.fix_errors);
        assert_eq!(config.footprint_limit, 12);
        assert_eq!(
            config.options(),
            StoreOptions {
                max_key_length: 20,
                node_size: 6,
                payload_size: 256,
                collation: Collation::Ordinal,
            }
        );
    }

    #[test]
    fn test_rejects_out_of_range() {
        let error = StoreConfig::from_lookup(lookup_from(&[("BPLUS_KEY_LENGTH", "2")]))
            .expect_err("key length below minimum");
        assert!(matches!(error, ConfigError::InvalidValue { ref name, .. } if name == "BPLUS_KEY_LENGTH"));

        let error = StoreConfig::from_lookup(lookup_from(&[("BPLUS_FOOTPRINT_LIMIT", "4")]))
            .expect_err("footprint below minimum");
        assert!(error.to_string().starts_with("invalid value for BPLUS_FOOTPRINT_LIMIT"));
    }

    #[test]
    fn test_rejects_unparsable_values() {
        assert!(StoreConfig::from_lookup(lookup_from(&[("BPLUS_NODE_SIZE", "many")])).is_err());
        assert!(StoreConfig::from_lookup(lookup_from(&[("BPLUS_COLLATION", "klingon")])).is_err());
        assert!(StoreConfig::from_lookup(lookup_from(&[("BPLUS_FIX_ERRORS", "maybe")])).is_err());
    }

    #[test]
    fn test_config_error_display_invalid() {
        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}
