//! The `oci-archive:` transport: a POSIX tar of an OCI layout directory,
//! selected by the same `:name`/`:@index` grammar as [`super::oci_layout`].

use super::{parse_path_and_selector, validate_policy_path, ImageReference, Selector, Transport};
use crate::OcifreightCoreResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A reference into an `oci-archive:` tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciArchiveReference {
    /// Path of the tar file.
    pub file: String,
    /// Which entry inside the archive's `index.json` this reference names.
    pub selector: Selector,
}

impl ImageReference for OciArchiveReference {
    fn transport_name(&self) -> &'static str {
        "oci-archive"
    }

    fn string_within_transport(&self) -> String {
        match &self.selector {
            Selector::Default => self.file.clone(),
            Selector::Name(name) => format!("{}:{name}", self.file),
            Selector::Index(i) => format!("{}:@{i}", self.file),
        }
    }

    fn policy_configuration_identity(&self) -> Option<String> {
        Some(self.file.clone())
    }

    fn selector(&self) -> &Selector {
        &self.selector
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Factory for [`OciArchiveReference`]s.
pub struct OciArchiveTransport;

impl Transport for OciArchiveTransport {
    fn name(&self) -> &'static str {
        "oci-archive"
    }

    fn parse_reference(&self, payload: &str) -> OcifreightCoreResult<Box<dyn ImageReference>> {
        let (file, selector) = parse_path_and_selector(payload)?;
        Ok(Box::new(OciArchiveReference { file, selector }))
    }

    fn validate_policy_configuration_scope(&self, scope: &str) -> OcifreightCoreResult<()> {
        validate_policy_path(scope)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
