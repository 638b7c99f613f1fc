//! The `containers-storage:` transport: references into the layered local
//! store. Payload = optional `[store-spec]` followed by `name`, `@id`, or
//! `name@id`. Store-spec is `[<graph-root>]` or
//! `[<driver>@<graph-root>[:opt,opt]]`; graph-root must be absolute.

use super::{validate_policy_path, ImageReference, Selector, Transport};
use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed store-spec: the optional driver override, the graph root every
/// layer/image is rooted under, and driver options.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreSpec {
    /// Storage driver name, if explicitly given (e.g. `overlay`).
    pub driver: Option<String>,
    /// Absolute path the store's sqlite metadata and layer blobs live under.
    pub graph_root: Option<String>,
    /// Driver-specific options, as raw `key=value` or bare flag strings.
    pub options: Vec<String>,
}

/// A reference into the layered local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainersStorageReference {
    /// The store this reference is rooted in.
    pub store: StoreSpec,
    /// Symbolic name, if given.
    pub name: Option<String>,
    /// Explicit image id, if given (from `@id` or `name@id`).
    pub id: Option<String>,
}

impl ImageReference for ContainersStorageReference {
    fn transport_name(&self) -> &'static str {
        "containers-storage"
    }

    fn string_within_transport(&self) -> String {
        let mut out = String::new();
        if let Some(graph_root) = &self.store.graph_root {
            out.push('[');
            if let Some(driver) = &self.store.driver {
                out.push_str(driver);
                out.push('@');
            }
            out.push_str(graph_root);
            if !self.store.options.is_empty() {
                out.push(':');
                out.push_str(&self.store.options.join(","));
            }
            out.push(']');
        }
        if let Some(name) = &self.name {
            out.push_str(name);
        }
        if let Some(id) = &self.id {
            out.push('@');
            out.push_str(id);
        }
        out
    }

    fn policy_configuration_identity(&self) -> Option<String> {
        self.name.clone()
    }

    fn selector(&self) -> &Selector {
        // The layered store distinguishes images by name/id rather than the
        // path-transport Selector grammar; always report Default so callers
        // that only care about path-transport selectors don't misread this.
        &Selector::Default
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Factory for [`ContainersStorageReference`]s.
pub struct ContainersStorageTransport;

impl Transport for ContainersStorageTransport {
    fn name(&self) -> &'static str {
        "containers-storage"
    }

    fn parse_reference(&self, payload: &str) -> OcifreightCoreResult<Box<dyn ImageReference>> {
        let (store, rest) = parse_store_spec(payload)?;

        if rest.is_empty() {
            return Err(OcifreightCoreError::InvalidReference(
                "containers-storage reference has no name or id".to_string(),
            ));
        }

        let (name_part, id) = match rest.split_once('@') {
            Some((name, id)) => (name, Some(id.to_string())),
            None => (rest, None),
        };

        let name = if name_part.is_empty() {
            None
        } else {
            Some(name_part.to_string())
        };

        if name.is_none() && id.is_none() {
            return Err(OcifreightCoreError::InvalidReference(
                "containers-storage reference has no name or id".to_string(),
            ));
        }

        Ok(Box::new(ContainersStorageReference { store, name, id }))
    }

    fn validate_policy_configuration_scope(&self, scope: &str) -> OcifreightCoreResult<()> {
        // The store's own name/id scopes carry no path-grammar constraints,
        // but an explicit graph-root embedded in a `[...]` prefix still must
        // be an absolute path.
        if let Some(rest) = scope.strip_prefix('[') {
            let Some((spec, _)) = rest.split_once(']') else {
                return Err(OcifreightCoreError::InvalidReference(format!(
                    "unterminated store-spec in scope {scope:?}"
                )));
            };
            let graph_root = spec.split('@').next_back().unwrap_or(spec);
            let graph_root = graph_root.split(':').next().unwrap_or(graph_root);
            return validate_policy_path(graph_root);
        }
        Ok(())
    }
}

fn parse_store_spec(payload: &str) -> OcifreightCoreResult<(StoreSpec, &str)> {
    let Some(rest) = payload.strip_prefix('[') else {
        return Ok((StoreSpec::default(), payload));
    };

    let Some((spec, after)) = rest.split_once(']') else {
        return Err(OcifreightCoreError::InvalidReference(
            "unterminated store-spec: missing ']'".to_string(),
        ));
    };

    let (driver_and_root, options) = match spec.split_once(':') {
        Some((left, opts)) => (left, opts.split(',').map(str::to_string).collect()),
        None => (spec, Vec::new()),
    };

    let (driver, graph_root) = match driver_and_root.split_once('@') {
        Some((driver, root)) => (Some(driver.to_string()), root.to_string()),
        None => (None, driver_and_root.to_string()),
    };

    if !graph_root.is_empty() && !graph_root.starts_with('/') {
        return Err(OcifreightCoreError::InvalidReference(format!(
            "store graph-root {graph_root:?} must be absolute"
        )));
    }

    let graph_root = if graph_root.is_empty() { None } else { Some(graph_root) };

    Ok((
        StoreSpec {
            driver,
            graph_root,
            options,
        },
        after,
    ))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_name() {
        let transport = ContainersStorageTransport;
        let reference = transport.parse_reference("myimage").unwrap();
        assert_eq!(reference.policy_configuration_identity().unwrap(), "myimage");
    }

    #[test]
    fn parse_name_with_id() {
        let transport = ContainersStorageTransport;
        let reference = transport.parse_reference("myimage@abcd1234").unwrap();
        assert_eq!(reference.string_within_transport(), "myimage@abcd1234");
    }

    #[test]
    fn parse_with_store_spec_and_driver() {
        let transport = ContainersStorageTransport;
        let reference = transport
            .parse_reference("[overlay@/var/lib/ocifreight:opt1,opt2]myimage")
            .unwrap();
        assert_eq!(
            reference.string_within_transport(),
            "[overlay@/var/lib/ocifreight:opt1,opt2]myimage"
        );
    }

    #[test]
    fn rejects_relative_graph_root() {
        let transport = ContainersStorageTransport;
        assert!(transport.parse_reference("[relative/path]myimage").is_err());
    }

    #[test]
    fn rejects_name_and_id_both_missing() {
        let transport = ContainersStorageTransport;
        assert!(transport.parse_reference("@").is_err());
    }
}
