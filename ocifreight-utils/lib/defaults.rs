//! Default values and constants used throughout the ocifreight project.
//!
//! # Examples
//!
//! ```
//! use ocifreight_utils::defaults::DEFAULT_OCI_REGISTRY;
//!
//! assert_eq!(DEFAULT_OCI_REGISTRY, "docker.io");
//! ```

use std::path::PathBuf;
use std::sync::LazyLock;

use crate::OCIFREIGHT_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The path where all ocifreight global data (blob store, metadata db) is kept.
pub static DEFAULT_OCIFREIGHT_HOME: LazyLock<PathBuf> =
    LazyLock::new(|| dirs::home_dir().unwrap().join(OCIFREIGHT_HOME_DIR));

/// The default OCI registry domain, used when a reference omits one.
pub const DEFAULT_OCI_REGISTRY: &str = "docker.io";

/// The default OCI reference tag, used when a reference omits one.
pub const DEFAULT_OCI_REFERENCE_TAG: &str = "latest";

/// The default OCI reference repository namespace for single-name Docker Hub
/// references (e.g. `alpine` resolves to `library/alpine`).
pub const DEFAULT_OCI_REFERENCE_REPO_NAMESPACE: &str = "library";

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
