//! Manifest-list / image-index platform selection.

use oci_spec::image::{Descriptor, ImageIndex, Platform};

use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Docker's "this isn't really a platform image, it's an attestation/SBOM
/// manifest" annotation. Entries carrying it are skipped during platform
/// selection so attestation or SBOM manifests never get mistaken for a real
/// platform image.
pub const DOCKER_REFERENCE_TYPE_ANNOTATION: &str = "vnd.docker.reference.type";

/// The annotation an index entry may carry to expose a symbolic tag for
/// name-based lookup inside a multi-image container.
pub const IMAGE_REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A platform to match an index entry against.
#[derive(Debug, Clone)]
pub struct PlatformQuery {
    /// Target operating system, e.g. `linux`.
    pub os: String,
    /// Target architecture, e.g. `amd64`.
    pub architecture: String,
    /// Ordered variant preference list; an empty descriptor variant matches
    /// only when this list is empty or contains `""`.
    pub variants: Vec<String>,
    /// Optional required `os.version`.
    pub os_version: Option<String>,
}

impl PlatformQuery {
    /// Builds a query for the host's own platform.
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variants: Vec::new(),
            os_version: None,
        }
    }

    fn matches(&self, platform: &Platform) -> bool {
        if platform.os().to_string() != self.os || platform.architecture().to_string() != self.architecture
        {
            return false;
        }
        if let Some(wanted_version) = &self.os_version {
            if platform.os_version().as_deref() != Some(wanted_version.as_str()) {
                return false;
            }
        }
        let entry_variant = platform.variant().clone().unwrap_or_default();
        if self.variants.is_empty() {
            return entry_variant.is_empty();
        }
        self.variants.iter().any(|v| v == &entry_variant)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Selects the index entry whose platform best matches `query`. Tie-break is
/// the first match in declaration order. Entries annotated as
/// attestation/SBOM manifests (`vnd.docker.reference.type` present) are
/// skipped regardless of platform. On no match, returns
/// [`OcifreightCoreError::PlatformMiss`] listing every platform actually
/// present, for diagnostics.
pub fn select_platform<'a>(
    index: &'a ImageIndex,
    query: &PlatformQuery,
) -> OcifreightCoreResult<&'a Descriptor> {
    let mut available = Vec::new();

    for entry in index.manifests() {
        if is_attestation_entry(entry) {
            continue;
        }
        let Some(platform) = entry.platform() else {
            continue;
        };
        available.push(describe_platform(platform));
        if query.matches(platform) {
            return Ok(entry);
        }
    }

    Err(OcifreightCoreError::PlatformMiss {
        requested: format!(
            "{}/{}{}",
            query.os,
            query.architecture,
            query
                .variants
                .first()
                .map(|v| format!("/{v}"))
                .unwrap_or_default()
        ),
        available,
    })
}

fn is_attestation_entry(entry: &Descriptor) -> bool {
    entry
        .annotations()
        .as_ref()
        .map(|a| a.contains_key(DOCKER_REFERENCE_TYPE_ANNOTATION))
        .unwrap_or(false)
}

fn describe_platform(platform: &Platform) -> String {
    match platform.variant() {
        Some(v) if !v.is_empty() => {
            format!("{}/{}/{}", platform.os(), platform.architecture(), v)
        }
        _ => format!("{}/{}", platform.os(), platform.architecture()),
    }
}

/// Builds a platform query for the host the process is currently running on,
/// mapping Rust's `std::env::consts` names to the `os`/`architecture` pair
/// OCI platform objects use (`x86_64` -> `amd64`, `aarch64` -> `arm64`).
pub fn current_platform() -> PlatformQuery {
    let architecture = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    PlatformQuery::new(std::env::consts::OS, architecture)
}

/// Looks up an index entry by its `org.opencontainers.image.ref.name`
/// annotation, used for name-based lookup inside multi-image OCI layouts.
pub fn find_by_ref_name<'a>(index: &'a ImageIndex, name: &str) -> Option<&'a Descriptor> {
    index.manifests().iter().find(|entry| {
        entry
            .annotations()
            .as_ref()
            .and_then(|a| a.get(IMAGE_REF_NAME_ANNOTATION))
            .map(|v| v == name)
            .unwrap_or(false)
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::{DescriptorBuilder, Digest, ImageIndexBuilder, MediaType, PlatformBuilder};
    use std::str::FromStr;

    fn entry(os: &str, arch: &str, variant: Option<&str>, digest_suffix: char) -> Descriptor {
        let mut platform = PlatformBuilder::default();
        platform.os(os).architecture(arch);
        if let Some(v) = variant {
            platform.variant(v.to_string());
        }
        DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(
                Digest::from_str(&format!(
                    "sha256:{}",
                    digest_suffix.to_string().repeat(64)
                ))
                .unwrap(),
            )
            .size(1i64)
            .platform(platform.build().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn select_platform_matches_exact_triple() {
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(vec![
                entry("linux", "amd64", None, 'a'),
                entry("linux", "ppc64le", None, 'b'),
            ])
            .build()
            .unwrap();

        let query = PlatformQuery::new("linux", "ppc64le");
        let selected = select_platform(&index, &query).unwrap();
        assert_eq!(selected.digest().to_string(), format!("sha256:{}", "b".repeat(64)));
    }

    #[test]
    fn select_platform_misses_report_available() {
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(vec![entry("linux", "amd64", None, 'a')])
            .build()
            .unwrap();

        let query = PlatformQuery::new("windows", "amd64");
        let err = select_platform(&index, &query).unwrap_err();
        match err {
            OcifreightCoreError::PlatformMiss { available, .. } => {
                assert_eq!(available, vec!["linux/amd64".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
