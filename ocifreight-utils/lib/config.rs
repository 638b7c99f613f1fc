//! On-disk TOML configuration for the ocifreight workspace: the default
//! registry, which blob-info cache backend to use, and where the local
//! layered store lives. Every field is optional both in the file and in the
//! resolved value — callers fall back to [`crate::defaults`] the same way
//! [`crate::env`] already does for individual settings.
//!
//! # Examples
//! ```no_run
//! use ocifreight_utils::config::load_config;
//!
//! let config = load_config()?;
//! println!("default registry: {}", config.default_registry());
//! # Ok::<(), ocifreight_utils::OcifreightUtilsError>(())
//! ```

use std::{fs, path::PathBuf};

use serde::Deserialize;

use crate::{OcifreightUtilsError, OcifreightUtilsResult, defaults, env};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable overriding the config file's own path.
pub const OCIFREIGHT_CONFIG_ENV_VAR: &str = "OCIFREIGHT_CONFIG";

/// Environment variable overriding which blob-info cache backend is used.
pub const OCIFREIGHT_BLOB_CACHE_BACKEND_ENV_VAR: &str = "OCIFREIGHT_BLOB_CACHE_BACKEND";

/// Environment variable overriding the local layered store's root directory.
pub const OCIFREIGHT_STORE_ROOT_ENV_VAR: &str = "OCIFREIGHT_STORE_ROOT";

/// The config file's name within the ocifreight home directory.
pub const CONFIG_FILENAME: &str = "config.toml";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Which implementation backs the blob-info cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlobInfoCacheBackend {
    /// Process-lifetime, in-memory cache. Lost on restart.
    #[default]
    Memory,
    /// Sqlite-backed cache, durable across process restarts.
    Sqlite,
}

/// The raw, on-disk shape of `config.toml`. Every field is optional: an
/// absent or missing file resolves to all-`None`, which [`ResolvedConfig`]
/// then fills in from environment variables and finally hardcoded defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OcifreightConfigFile {
    /// The default registry host used to resolve bare references.
    pub default_registry: Option<String>,
    /// Which blob-info cache backend to use.
    pub blob_info_cache_backend: Option<BlobInfoCacheBackend>,
    /// Root directory for the local layered store.
    pub store_root: Option<PathBuf>,
}

/// Effective configuration after folding the on-disk file, environment
/// variable overrides, and hardcoded defaults together, in that priority
/// order (environment wins over file, file wins over default).
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    default_registry: String,
    blob_info_cache_backend: BlobInfoCacheBackend,
    store_root: PathBuf,
}

impl ResolvedConfig {
    /// The default registry host used to resolve bare references.
    pub fn default_registry(&self) -> &str {
        &self.default_registry
    }

    /// Which blob-info cache backend to use.
    pub fn blob_info_cache_backend(&self) -> BlobInfoCacheBackend {
        self.blob_info_cache_backend
    }

    /// Root directory for the local layered store.
    pub fn store_root(&self) -> &PathBuf {
        &self.store_root
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The path `config.toml` is read from: `OCIFREIGHT_CONFIG` if set, otherwise
/// `<ocifreight home>/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(OCIFREIGHT_CONFIG_ENV_VAR) {
        PathBuf::from(path)
    } else {
        env::get_ocifreight_home_path().join(CONFIG_FILENAME)
    }
}

/// Reads and parses the on-disk config file, if present, then folds in
/// environment variable overrides and defaults to produce the effective
/// configuration. A missing file is not an error: it resolves as if every
/// field were absent.
pub fn load_config() -> OcifreightUtilsResult<ResolvedConfig> {
    let file = load_config_file()?;
    Ok(resolve_config_file(file))
}

/// Reads and parses the on-disk config file at its default/overridden path,
/// returning `OcifreightConfigFile::default()` (all fields unset) if it does
/// not exist.
pub fn load_config_file() -> OcifreightUtilsResult<OcifreightConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(OcifreightConfigFile::default());
    }

    let contents = fs::read_to_string(&path)?;
    toml::from_str(&contents).map_err(|e| OcifreightUtilsError::ConfigParse(e.to_string()))
}

/// Folds an already-parsed config file together with environment variable
/// overrides and hardcoded defaults (environment wins over file, file wins
/// over default). Exposed so callers that obtain an [`OcifreightConfigFile`]
/// some other way (e.g. tests, or a caller embedding its own config source)
/// can still get the same resolution priority [`load_config`] uses.
pub fn resolve_config_file(file: OcifreightConfigFile) -> ResolvedConfig {
    let default_registry = std::env::var(env::OCIFREIGHT_REGISTRY_HOST_ENV_VAR)
        .ok()
        .or(file.default_registry)
        .unwrap_or_else(|| defaults::DEFAULT_OCI_REGISTRY.to_string());

    let blob_info_cache_backend = std::env::var(OCIFREIGHT_BLOB_CACHE_BACKEND_ENV_VAR)
        .ok()
        .and_then(|raw| match raw.to_lowercase().as_str() {
            "memory" => Some(BlobInfoCacheBackend::Memory),
            "sqlite" => Some(BlobInfoCacheBackend::Sqlite),
            _ => None,
        })
        .or(file.blob_info_cache_backend)
        .unwrap_or_default();

    let store_root = std::env::var(OCIFREIGHT_STORE_ROOT_ENV_VAR)
        .ok()
        .map(PathBuf::from)
        .or(file.store_root)
        .unwrap_or_else(env::get_ocifreight_home_path);

    ResolvedConfig {
        default_registry,
        blob_info_cache_backend,
        store_root,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_falls_back_to_defaults_when_everything_is_unset() {
        let resolved = resolve_config_file(OcifreightConfigFile::default());
        assert_eq!(resolved.default_registry(), defaults::DEFAULT_OCI_REGISTRY);
        assert_eq!(resolved.blob_info_cache_backend(), BlobInfoCacheBackend::Memory);
    }

    #[test]
    fn resolve_prefers_file_values_over_defaults() {
        let file = OcifreightConfigFile {
            default_registry: Some("ghcr.io".to_string()),
            blob_info_cache_backend: Some(BlobInfoCacheBackend::Sqlite),
            store_root: Some(PathBuf::from("/srv/ocifreight")),
        };
        let resolved = resolve_config_file(file);
        assert_eq!(resolved.default_registry(), "ghcr.io");
        assert_eq!(resolved.blob_info_cache_backend(), BlobInfoCacheBackend::Sqlite);
        assert_eq!(resolved.store_root(), &PathBuf::from("/srv/ocifreight"));
    }

    #[test]
    fn parses_a_minimal_toml_file() {
        let toml = r#"
            default_registry = "ghcr.io"
            blob_info_cache_backend = "sqlite"
        "#;
        let file: OcifreightConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(file.default_registry.as_deref(), Some("ghcr.io"));
        assert_eq!(file.blob_info_cache_backend, Some(BlobInfoCacheBackend::Sqlite));
        assert!(file.store_root.is_none());
    }

    #[test]
    fn rejects_unknown_fields() {
        let toml = r#"
            nonsense = true
        "#;
        let result: Result<OcifreightConfigFile, _> = toml::from_str(toml);
        assert!(result.is_err());
    }
}
