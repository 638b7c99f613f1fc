//! Black-box end-to-end tests driving the crate purely through its public
//! surface: `image::open_source_str`/`open_destination_str`, `copy::copy_image`,
//! the layered store, and the transport registry. Each test corresponds to one
//! of the scenarios the engine is meant to satisfy end to end, rather than to
//! a single module's internals.

use std::str::FromStr;

use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageIndexBuilder, ImageManifestBuilder, MediaType,
    PlatformBuilder,
};
use ocifreight_core::blobinfocache::memory::MemoryBlobInfoCache;
use ocifreight_core::blobinfocache::BlobInfoCache;
use ocifreight_core::copy::{copy_image, CopyOptions};
use ocifreight_core::image::{open_destination_str, open_source_str, SystemContext};
use ocifreight_core::manifest::PlatformQuery;
use ocifreight_core::store::{ImageRecord, LayerRecord, Store};
use ocifreight_core::transport::TransportRegistry;
use ocifreight_core::OcifreightCoreError;
use sha2::{Digest as _, Sha256};
use tempfile::TempDir;

fn sha256_digest(bytes: &[u8]) -> Digest {
    Digest::from_str(&format!("sha256:{}", hex::encode(Sha256::digest(bytes)))).unwrap()
}

fn descriptor(media_type: MediaType, bytes: &[u8]) -> Descriptor {
    DescriptorBuilder::default()
        .media_type(media_type)
        .digest(sha256_digest(bytes))
        .size(bytes.len() as i64)
        .build()
        .unwrap()
}

/// Writes a single-layer `oci:` image directly through the public backend
/// interface, returning the manifest bytes that were pushed.
async fn seed_single_layer_image(path: &str, name: &str) -> Vec<u8> {
    let context = SystemContext::default();
    let destination = open_destination_str(&format!("oci:{path}:{name}"), &context)
        .await
        .unwrap();
    let cache = MemoryBlobInfoCache::default();

    let config_bytes = br#"{"created":"2020-01-01T00:00:00Z","architecture":"amd64","os":"linux"}"#;
    let layer_bytes = vec![0x42u8; 8192];

    let config_info = ocifreight_core::digest::BlobInfo::new(
        sha256_digest(config_bytes),
        config_bytes.len() as i64,
        MediaType::ImageConfig,
    );
    destination
        .put_blob(
            Box::new(config_bytes.as_slice()),
            &config_info,
            &Default::default(),
            &cache,
        )
        .await
        .unwrap();

    let layer_info = ocifreight_core::digest::BlobInfo::new(
        sha256_digest(&layer_bytes),
        layer_bytes.len() as i64,
        MediaType::ImageLayerGzip,
    );
    destination
        .put_blob(
            Box::new(layer_bytes.as_slice()),
            &layer_info,
            &Default::default(),
            &cache,
        )
        .await
        .unwrap();

    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(descriptor(MediaType::ImageConfig, config_bytes))
        .layers(vec![descriptor(MediaType::ImageLayerGzip, &layer_bytes)])
        .build()
        .unwrap();
    let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
    destination.put_manifest(&manifest_bytes, None).await.unwrap();
    destination.commit(&manifest_bytes).await.unwrap();
    manifest_bytes
}

/// S1: a full image copies end to end between two `oci:` layouts opened
/// purely via reference strings, landing under the destination's own name.
#[test_log::test(tokio::test)]
async fn s1_copies_an_image_between_two_oci_layouts_via_reference_strings() {
    let src_dir = TempDir::new().unwrap();
    let dst_dir = TempDir::new().unwrap();
    let src_path = src_dir.path().to_string_lossy().to_string();
    let dst_path = dst_dir.path().to_string_lossy().to_string();

    seed_single_layer_image(&src_path, "app").await;

    let context = SystemContext::default();
    let source = open_source_str(&format!("oci:{src_path}:app"), &context)
        .await
        .unwrap();
    let destination = open_destination_str(&format!("oci:{dst_path}:app"), &context)
        .await
        .unwrap();
    let cache = MemoryBlobInfoCache::default();

    let digest = copy_image(source.as_ref(), destination.as_ref(), &cache, &CopyOptions::default())
        .await
        .unwrap();

    let verify_source = open_source_str(&format!("oci:{dst_path}:app"), &context)
        .await
        .unwrap();
    let (bytes, media_type) = verify_source.get_manifest(None).await.unwrap();
    assert_eq!(media_type, MediaType::ImageManifest);
    assert_eq!(sha256_digest(&bytes).to_string(), digest.to_string());
}

/// S2: a digest mismatch during `put_blob` is rejected and leaves no trace
/// of the bad blob behind under the destination's content-addressed store.
#[test_log::test(tokio::test)]
async fn s2_put_blob_digest_mismatch_leaves_destination_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_string_lossy().to_string();
    let context = SystemContext::default();
    let destination = open_destination_str(&format!("oci:{path}:app"), &context)
        .await
        .unwrap();
    let cache = MemoryBlobInfoCache::default();

    let claimed = Digest::from_str(&format!("sha256:{}", "b".repeat(64))).unwrap();
    let actual_bytes = vec![0x11u8; 2048];
    let info = ocifreight_core::digest::BlobInfo::new(claimed.clone(), actual_bytes.len() as i64, MediaType::ImageLayerGzip);

    let err = destination
        .put_blob(Box::new(actual_bytes.as_slice()), &info, &Default::default(), &cache)
        .await
        .unwrap_err();
    assert!(matches!(err, OcifreightCoreError::DigestMismatch { .. }));

    let blob_path = dir
        .path()
        .join("blobs")
        .join("sha256")
        .join(claimed.digest());
    assert!(tokio::fs::metadata(&blob_path).await.is_err());
}

/// S3: copying a multi-platform index with no matching platform surfaces a
/// `PlatformMiss` naming every platform actually present, and copies nothing.
#[test_log::test(tokio::test)]
async fn s3_copy_image_reports_platform_miss_for_unmatched_index() {
    let src_dir = TempDir::new().unwrap();
    let dst_dir = TempDir::new().unwrap();
    let src_path = src_dir.path().to_string_lossy().to_string();
    let dst_path = dst_dir.path().to_string_lossy().to_string();

    let context = SystemContext::default();
    let destination = open_destination_str(&format!("oci:{src_path}:multi"), &context)
        .await
        .unwrap();
    let cache = MemoryBlobInfoCache::default();

    // A bogus child manifest digest is fine here: platform selection fails
    // before the engine ever tries to fetch the child.
    let child_digest = Digest::from_str(&format!("sha256:{}", "c".repeat(64))).unwrap();
    let mut platform = PlatformBuilder::default();
    platform.os("linux").architecture("ppc64le");
    let entry = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(child_digest)
        .size(1i64)
        .platform(platform.build().unwrap())
        .build()
        .unwrap();
    let index = ImageIndexBuilder::default()
        .schema_version(2u32)
        .manifests(vec![entry])
        .build()
        .unwrap();
    let index_bytes = serde_json::to_vec(&index).unwrap();
    destination.put_manifest(&index_bytes, None).await.unwrap();
    destination.commit(&index_bytes).await.unwrap();

    let source = open_source_str(&format!("oci:{src_path}:multi"), &context)
        .await
        .unwrap();
    let destination = open_destination_str(&format!("oci:{dst_path}:multi"), &context)
        .await
        .unwrap();

    let options = CopyOptions {
        target_platform: Some(PlatformQuery::new("windows", "amd64")),
        ..CopyOptions::default()
    };
    let err = copy_image(source.as_ref(), destination.as_ref(), &cache, &options)
        .await
        .unwrap_err();
    match err {
        OcifreightCoreError::PlatformMiss { available, .. } => {
            assert_eq!(available, vec!["linux/ppc64le".to_string()]);
        }
        other => panic!("expected PlatformMiss, got {other:?}"),
    }

    // Nothing should have been written to the destination layout.
    let leftover = tokio::fs::read_dir(dst_dir.path().join("blobs").join("sha256"))
        .await
        .unwrap()
        .next_entry()
        .await
        .unwrap();
    assert!(leftover.is_none());
}

/// S4: the blob-info cache's candidate ordering is exact digest's own
/// locations first, then other digests sharing its uncompressed equivalent,
/// then the uncompressed digest's own locations, capped at the replacement
/// ceiling.
#[test_log::test(tokio::test)]
async fn s4_candidate_locations_orders_exact_then_substituted_then_uncompressed() {
    let cache = MemoryBlobInfoCache::default();
    let compressed = Digest::from_str(&format!("sha256:{}", "1".repeat(64))).unwrap();
    let sibling = Digest::from_str(&format!("sha256:{}", "2".repeat(64))).unwrap();
    let uncompressed = Digest::from_str(&format!("sha256:{}", "3".repeat(64))).unwrap();

    cache
        .record_digest_uncompressed_pair(&compressed, &uncompressed)
        .await
        .unwrap();
    cache
        .record_digest_uncompressed_pair(&sibling, &uncompressed)
        .await
        .unwrap();
    cache
        .record_known_location("docker", "registry.example.com/app", &compressed, "loc-exact".to_string())
        .await
        .unwrap();
    cache
        .record_known_location("docker", "registry.example.com/app", &sibling, "loc-sibling".to_string())
        .await
        .unwrap();
    cache
        .record_known_location(
            "docker",
            "registry.example.com/app",
            &uncompressed,
            "loc-uncompressed".to_string(),
        )
        .await
        .unwrap();

    let without_substitution = cache
        .candidate_locations("docker", "registry.example.com/app", &compressed, false)
        .await
        .unwrap();
    assert_eq!(without_substitution.len(), 1);
    assert_eq!(without_substitution[0].location, "loc-exact");

    let with_substitution = cache
        .candidate_locations("docker", "registry.example.com/app", &compressed, true)
        .await
        .unwrap();
    let locations: Vec<_> = with_substitution.iter().map(|c| c.location.clone()).collect();
    assert_eq!(
        locations,
        vec![
            "loc-exact".to_string(),
            "loc-sibling".to_string(),
            "loc-uncompressed".to_string(),
        ]
    );
}

/// S5: committing an image id a second time with a different top layer is
/// rejected; the first commit's record is left untouched.
#[test_log::test(tokio::test)]
async fn s5_layered_store_rejects_conflicting_recommit_of_same_image_id() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).await.unwrap();

    let base_diff = dir.path().join("base.tar");
    tokio::fs::write(&base_diff, b"base layer contents").await.unwrap();
    let base_digest = sha256_digest(b"base layer contents");
    let base_layer_id = ocifreight_core::store::layer::derive_layer_id(None, &base_digest);
    let base_record = LayerRecord {
        layer_id: base_layer_id.clone(),
        parent_id: None,
        uncompressed_digest: base_digest.clone(),
        uncompressed_size: 20,
        compressed_digest: None,
        compressed_size: None,
    };
    store.put_layer(base_record, &base_diff).await.unwrap();

    let other_diff = dir.path().join("other.tar");
    tokio::fs::write(&other_diff, b"a different base layer").await.unwrap();
    let other_digest = sha256_digest(b"a different base layer");
    let other_layer_id = ocifreight_core::store::layer::derive_layer_id(None, &other_digest);
    let other_record = LayerRecord {
        layer_id: other_layer_id.clone(),
        parent_id: None,
        uncompressed_digest: other_digest,
        uncompressed_size: 23,
        compressed_digest: None,
        compressed_size: None,
    };
    store.put_layer(other_record, &other_diff).await.unwrap();

    store
        .commit_image(
            ImageRecord {
                image_id: "image-1".to_string(),
                top_layer_id: Some(base_layer_id),
                names: vec!["app:latest".to_string()],
            },
            vec![],
        )
        .await
        .unwrap();

    let err = store
        .commit_image(
            ImageRecord {
                image_id: "image-1".to_string(),
                top_layer_id: Some(other_layer_id),
                names: vec!["app:latest".to_string()],
            },
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OcifreightCoreError::DuplicateId(_)));

    let record = store.find_image_by_id("image-1").await.unwrap().unwrap();
    assert_eq!(record.names, vec!["app:latest".to_string()]);
}

/// S6: the transport registry's reference grammar accepts the documented
/// forms for every built-in transport and rejects the documented malformed
/// ones, without needing an actual image or registry behind any of them.
#[test_log::test(tokio::test)]
async fn s6_transport_registry_accepts_and_rejects_reference_grammar() {
    let registry = TransportRegistry::with_builtin_transports();

    for good in [
        "oci:/var/lib/images/app:latest",
        "oci:/var/lib/images/app:@0",
        "oci-archive:/tmp/app.tar:latest",
        "docker://registry.example.com/library/app:1.0",
        "docker://registry.example.com/library/app@sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        "containers-storage:app:latest",
        "containers-storage:[overlay@/var/lib/containers:opt1]app",
    ] {
        registry
            .parse_reference(good)
            .unwrap_or_else(|e| panic!("expected {good:?} to parse, got {e:?}"));
    }

    for bad in [
        "no-colon-anywhere",
        "unregistered-transport:payload",
        "oci:/var/lib/images/app:",
        "oci:/var/lib/images/app:@-1",
        "oci:/var/lib/images/app:@0:name",
        "containers-storage:[relative-root@rel:opt]app",
    ] {
        assert!(
            registry.parse_reference(bad).is_err(),
            "expected {bad:?} to be rejected"
        );
    }
}
