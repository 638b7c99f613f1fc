//! The `oci:` transport: a local on-disk OCI layout directory, optionally
//! followed by a `:name` or `:@index` selector.

use super::{parse_path_and_selector, validate_policy_path, ImageReference, Selector, Transport};
use crate::OcifreightCoreResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A reference into an `oci:` layout directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciLayoutReference {
    /// Absolute path of the layout directory.
    pub path: String,
    /// Which entry inside `index.json` this reference names.
    pub selector: Selector,
}

impl ImageReference for OciLayoutReference {
    fn transport_name(&self) -> &'static str {
        "oci"
    }

    fn string_within_transport(&self) -> String {
        match &self.selector {
            Selector::Default => self.path.clone(),
            Selector::Name(name) => format!("{}:{name}", self.path),
            Selector::Index(i) => format!("{}:@{i}", self.path),
        }
    }

    fn policy_configuration_identity(&self) -> Option<String> {
        Some(self.path.clone())
    }

    fn selector(&self) -> &Selector {
        &self.selector
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Factory for [`OciLayoutReference`]s.
pub struct OciLayoutTransport;

impl Transport for OciLayoutTransport {
    fn name(&self) -> &'static str {
        "oci"
    }

    fn parse_reference(&self, payload: &str) -> OcifreightCoreResult<Box<dyn ImageReference>> {
        let (path, selector) = parse_path_and_selector(payload)?;
        Ok(Box::new(OciLayoutReference { path, selector }))
    }

    fn validate_policy_configuration_scope(&self, scope: &str) -> OcifreightCoreResult<()> {
        validate_policy_path(scope)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
