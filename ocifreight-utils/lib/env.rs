//! Utility functions for working with environment variables.

use std::path::PathBuf;

use crate::{DEFAULT_OCIFREIGHT_HOME, DEFAULT_OCI_REGISTRY};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable for the ocifreight home directory (blob store, metadata db).
pub const OCIFREIGHT_HOME_ENV_VAR: &str = "OCIFREIGHT_HOME";

/// Environment variable for the default registry host, used to resolve bare references.
pub const OCIFREIGHT_REGISTRY_HOST_ENV_VAR: &str = "OCIFREIGHT_REGISTRY_HOST";

/// Environment variable for a registry username (basic auth).
pub const OCIFREIGHT_REGISTRY_USERNAME_ENV_VAR: &str = "OCIFREIGHT_REGISTRY_USERNAME";

/// Environment variable for a registry password (basic auth).
pub const OCIFREIGHT_REGISTRY_PASSWORD_ENV_VAR: &str = "OCIFREIGHT_REGISTRY_PASSWORD";

/// Environment variable for a registry bearer token.
pub const OCIFREIGHT_REGISTRY_TOKEN_ENV_VAR: &str = "OCIFREIGHT_REGISTRY_TOKEN";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the path to the ocifreight home directory.
/// If the `OCIFREIGHT_HOME` environment variable is set, returns that path.
/// Otherwise, returns the default ocifreight home path.
pub fn get_ocifreight_home_path() -> PathBuf {
    if let Ok(home) = std::env::var(OCIFREIGHT_HOME_ENV_VAR) {
        PathBuf::from(home)
    } else {
        DEFAULT_OCIFREIGHT_HOME.to_owned()
    }
}

/// Returns the domain for the default OCI registry.
/// If the `OCIFREIGHT_REGISTRY_HOST` environment variable is set, returns that value.
/// Otherwise, returns the default OCI registry domain.
pub fn get_oci_registry() -> String {
    if let Ok(oci_registry_domain) = std::env::var(OCIFREIGHT_REGISTRY_HOST_ENV_VAR) {
        oci_registry_domain
    } else {
        DEFAULT_OCI_REGISTRY.to_string()
    }
}

/// Returns the registry username from environment, if set.
pub fn get_registry_username() -> Option<String> {
    std::env::var(OCIFREIGHT_REGISTRY_USERNAME_ENV_VAR).ok()
}

/// Returns the registry password from environment, if set.
pub fn get_registry_password() -> Option<String> {
    std::env::var(OCIFREIGHT_REGISTRY_PASSWORD_ENV_VAR).ok()
}

/// Returns the registry token from environment, if set.
pub fn get_registry_token() -> Option<String> {
    std::env::var(OCIFREIGHT_REGISTRY_TOKEN_ENV_VAR).ok()
}
