//! The `docker:` transport: `docker://<registry>/<repo>[:tag][@digest]`,
//! resolved against a remote v2 registry. Credential resolution walks, in
//! priority order: environment variables, the docker CLI's config/credential
//! helpers, stored ocifreight credentials, then falls back to anonymous.

use ocifreight_utils::{docker_config, env, registry_auth};
use oci_client::secrets::RegistryAuth;

use super::{ImageReference, Selector, Transport};
use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A reference to an image (or digest-pinned instance) on a remote registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerReference {
    /// The registry host, e.g. `docker.io`, `ghcr.io:443`.
    pub registry: String,
    /// The repository path, e.g. `library/alpine`.
    pub repository: String,
    /// The tag, if given (mutually meaningful alongside a digest).
    pub tag: Option<String>,
    /// The pinned digest, if given.
    pub digest: Option<String>,
}

impl ImageReference for DockerReference {
    fn transport_name(&self) -> &'static str {
        "docker"
    }

    fn string_within_transport(&self) -> String {
        let mut out = format!("//{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    fn policy_configuration_identity(&self) -> Option<String> {
        Some(format!("{}/{}", self.registry, self.repository))
    }

    fn selector(&self) -> &Selector {
        &Selector::Default
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Factory for [`DockerReference`]s.
pub struct DockerTransport;

impl Transport for DockerTransport {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn parse_reference(&self, payload: &str) -> OcifreightCoreResult<Box<dyn ImageReference>> {
        let rest = payload.strip_prefix("//").ok_or_else(|| {
            OcifreightCoreError::InvalidReference(format!(
                "docker reference {payload:?} must start with '//'"
            ))
        })?;

        let (registry, path) = rest.split_once('/').ok_or_else(|| {
            OcifreightCoreError::InvalidReference(format!(
                "docker reference {payload:?} is missing a repository path"
            ))
        })?;

        if registry.is_empty() {
            return Err(OcifreightCoreError::InvalidReference(
                "docker reference has an empty registry host".to_string(),
            ));
        }

        let (path, digest) = match path.split_once('@') {
            Some((p, d)) => (p, Some(d.to_string())),
            None => (path, None),
        };

        let (repository, tag) = match path.split_once(':') {
            Some((repo, tag)) => (repo.to_string(), Some(tag.to_string())),
            None => (path.to_string(), None),
        };

        if repository.is_empty() {
            return Err(OcifreightCoreError::InvalidReference(
                "docker reference has an empty repository".to_string(),
            ));
        }

        Ok(Box::new(DockerReference {
            registry: registry.to_string(),
            repository,
            tag,
            digest,
        }))
    }

    fn validate_policy_configuration_scope(&self, scope: &str) -> OcifreightCoreResult<()> {
        if scope.is_empty() || scope.starts_with('/') || scope.contains("://") {
            return Err(OcifreightCoreError::InvalidReference(format!(
                "invalid docker policy scope {scope:?}"
            )));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: auth resolution
//--------------------------------------------------------------------------------------------------

/// Resolves registry auth for `host`, trying in order: `OCIFREIGHT_REGISTRY_*`
/// environment variables, the docker CLI's config.json/credential helpers,
/// ocifreight's own stored credentials, then anonymous.
pub fn resolve_registry_auth(host: &str) -> RegistryAuth {
    if let Some(token) = env::get_registry_token() {
        return RegistryAuth::Bearer(token);
    }
    if let (Some(username), Some(password)) = (env::get_registry_username(), env::get_registry_password()) {
        return RegistryAuth::Basic(username, password);
    }

    if let Ok(Some(creds)) = docker_config::load_docker_registry_credentials(host) {
        return match creds {
            docker_config::DockerAuthCredentials::Basic { username, password } => {
                RegistryAuth::Basic(username, password)
            }
            docker_config::DockerAuthCredentials::Token { token } => RegistryAuth::Bearer(token),
        };
    }

    if let Ok(Some(creds)) = registry_auth::load_stored_registry_credentials(host) {
        return match creds {
            registry_auth::StoredRegistryCredentials::Basic { username, password } => {
                RegistryAuth::Basic(username, password)
            }
            registry_auth::StoredRegistryCredentials::Token { token } => RegistryAuth::Bearer(token),
        };
    }

    RegistryAuth::Anonymous
}

/// Normalizes a registry host for auth/cache-scope lookups: `docker.io`'s
/// well-known legacy alias is collapsed to the canonical host.
pub fn normalize_registry_host(host: &str) -> String {
    match host {
        "index.docker.io" | "registry-1.docker.io" => "docker.io".to_string(),
        other => other.to_string(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
