//! The transport/reference registry: turns an opaque `transport:payload`
//! string into a pluggable, transport-specific [`ImageReference`], and
//! validates policy-scope strings using the same grammar each transport's
//! payload follows.

pub mod containers_storage;
pub mod docker;
pub mod oci_archive;
pub mod oci_layout;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The image/index selector a path-based or store-based reference may carry:
/// a symbolic name, a numeric index into a multi-image container, or neither
/// (the container's "default" entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// No selector given; the transport's default entry applies.
    Default,
    /// `:name` — a symbolic tag/name.
    Name(String),
    /// `:@N` — a zero-based index into a multi-image container.
    Index(u64),
}

/// An opaque, transport-produced handle identifying one image (or one
/// instance inside a multi-image container). References are immutable value
/// objects: round-tripping through [`ImageReference::string_within_transport`]
/// and re-parsing yields an equal reference.
pub trait ImageReference: fmt::Debug + Send + Sync {
    /// The name of the transport that produced this reference (e.g. `oci`).
    fn transport_name(&self) -> &'static str;

    /// The payload half of `transport:payload`, round-trippable back through
    /// that transport's `parse_reference`.
    fn string_within_transport(&self) -> String;

    /// A normalized name usable for policy lookup, when the underlying
    /// container has one (a path-based reference's path, a registry
    /// reference's repository name). `None` for purely index-selected
    /// references.
    fn policy_configuration_identity(&self) -> Option<String>;

    /// The selector distinguishing which image inside a (possibly
    /// multi-image) container this reference names.
    fn selector(&self) -> &Selector;

    /// Downcasting hook: [`crate::image`] dispatches `open_source`/
    /// `open_destination` to the right backend by matching
    /// [`ImageReference::transport_name`] and then downcasting to the
    /// transport's own concrete reference type, rather than growing this
    /// trait with every backend's constructor parameters.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// A named factory for one kind of [`ImageReference`]: parses payload
/// strings and validates policy-configuration scopes under this transport's
/// grammar.
pub trait Transport: Send + Sync {
    /// The transport's registered name, e.g. `oci`, `oci-archive`, `docker`,
    /// `containers-storage`.
    fn name(&self) -> &'static str;

    /// Parses `payload` (the part of the reference string after the first
    /// `:`) into a concrete reference.
    fn parse_reference(&self, payload: &str) -> OcifreightCoreResult<Box<dyn ImageReference>>;

    /// Validates a policy-configuration scope string under this transport's
    /// rules, without requiring it to name an existing image.
    fn validate_policy_configuration_scope(&self, scope: &str) -> OcifreightCoreResult<()>;
}

/// A name → factory map. A reference string is split at its first `:`; the
/// prefix looks up the registered transport, and the suffix is handed to it
/// as payload.
#[derive(Default)]
pub struct TransportRegistry {
    transports: HashMap<&'static str, Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The full set of built-in transports (`oci`, `oci-archive`, `docker`,
    /// `containers-storage`).
    pub fn with_builtin_transports() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(oci_layout::OciLayoutTransport));
        registry.register(Arc::new(oci_archive::OciArchiveTransport));
        registry.register(Arc::new(docker::DockerTransport));
        registry.register(Arc::new(containers_storage::ContainersStorageTransport));
        registry
    }

    /// Registers (or replaces) a transport under its own [`Transport::name`].
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.name(), transport);
    }

    /// Looks up a transport by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(name).cloned()
    }

    /// Splits `reference` at its first `:`, looks up the named transport, and
    /// parses the remainder as that transport's payload.
    pub fn parse_reference(&self, reference: &str) -> OcifreightCoreResult<Box<dyn ImageReference>> {
        let (name, payload) = split_transport(reference)?;
        let transport = self
            .get(name)
            .ok_or_else(|| OcifreightCoreError::InvalidReference(format!("unknown transport {name:?}")))?;
        transport.parse_reference(payload)
    }
}

fn split_transport(reference: &str) -> OcifreightCoreResult<(&str, &str)> {
    reference
        .split_once(':')
        .ok_or_else(|| OcifreightCoreError::InvalidReference(format!("missing ':' in reference {reference:?}")))
}

//--------------------------------------------------------------------------------------------------
// Functions: shared path-transport grammar
//--------------------------------------------------------------------------------------------------

/// Splits a path-transport payload (`oci`/`oci-archive`) of the form
/// `<path>[:name]` or `<path>:@<uint>` into its path and [`Selector`].
/// Name and numeric index are mutually exclusive; a payload ending in a bare
/// `:` with nothing after it is rejected as ambiguous.
pub fn parse_path_and_selector(payload: &str) -> OcifreightCoreResult<(String, Selector)> {
    // The path itself may contain ':' only as part of a Windows drive letter,
    // which this engine does not target; the first remaining ':' after the
    // path's leading '/' therefore safely delimits the selector.
    let Some(split_at) = payload.find(':') else {
        return Ok((payload.to_string(), Selector::Default));
    };

    let (path, rest) = payload.split_at(split_at);
    let rest = &rest[1..]; // drop the ':'

    if rest.is_empty() {
        return Err(OcifreightCoreError::InvalidReference(
            "empty selector after ':' is ambiguous".to_string(),
        ));
    }

    if let Some(index_str) = rest.strip_prefix('@') {
        if rest.contains(':') {
            return Err(OcifreightCoreError::InvalidReference(
                "name and @index selectors are mutually exclusive".to_string(),
            ));
        }
        let index: i64 = index_str
            .parse()
            .map_err(|_| OcifreightCoreError::InvalidReference(format!("invalid index {index_str:?}")))?;
        if index < 0 {
            return Err(OcifreightCoreError::InvalidReference(format!(
                "negative index {index} is invalid"
            )));
        }
        return Ok((path.to_string(), Selector::Index(index as u64)));
    }

    if rest.contains(':') {
        return Err(OcifreightCoreError::InvalidReference(
            "name and @index selectors are mutually exclusive".to_string(),
        ));
    }

    Ok((path.to_string(), Selector::Name(rest.to_string())))
}

/// Validates a policy-configuration path scope: must be absolute, non-root,
/// free of `.`/`..` components, empty components, double slashes, and a
/// trailing slash.
pub fn validate_policy_path(path: &str) -> OcifreightCoreResult<()> {
    let reject = |reason: &str| {
        Err(OcifreightCoreError::InvalidReference(format!(
            "invalid policy scope {path:?}: {reason}"
        )))
    };

    if !path.starts_with('/') {
        return reject("must be an absolute path");
    }
    if path == "/" {
        return reject("root path is not a valid scope");
    }
    if path.ends_with('/') {
        return reject("trailing slash is not allowed");
    }
    if path.contains("//") {
        return reject("double slash is not allowed");
    }
    for component in path.split('/').skip(1) {
        if component.is_empty() {
            return reject("empty path component");
        }
        if component == "." || component == ".." {
            return reject("'.' or '..' components are not allowed");
        }
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
