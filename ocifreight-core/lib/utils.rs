//! Small filesystem helpers shared by the backends.

use std::path::Path;

use oci_spec::image::DigestAlgorithm;
use sha2::{Digest as _, Sha256, Sha512};
use tokio::{fs::File, io::AsyncReadExt};

use crate::OcifreightCoreResult;

/// Hashes the contents of a file on disk with the given digest algorithm,
/// streaming it in fixed-size chunks rather than reading it whole into memory.
///
/// ## Arguments
///
/// * `path` - The file to hash.
/// * `algorithm` - Which digest algorithm to use (`sha256` or `sha512`).
///
/// ## Returns
///
/// The raw digest bytes.
pub async fn get_file_hash(
    path: impl AsRef<Path>,
    algorithm: DigestAlgorithm,
) -> OcifreightCoreResult<Vec<u8>> {
    let mut file = File::open(path.as_ref()).await?;
    let mut buf = vec![0u8; 64 * 1024];

    match algorithm {
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hasher.finalize().to_vec())
        }
        DigestAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hasher.finalize().to_vec())
        }
        other => Err(crate::OcifreightCoreError::Unsupported(format!(
            "digest algorithm {other:?} is not supported"
        ))),
    }
}
