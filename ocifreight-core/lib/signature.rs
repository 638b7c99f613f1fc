//! The signing abstraction: an opaque mechanism for attaching a detached
//! signature to a manifest digest + reference pair, and for deciding what a
//! copy does with signatures it finds at the source.
//!
//! GPG and cosign/sigstore primitives are deliberately out of scope here: a
//! real application wires a concrete [`Signer`]/[`Verifier`] backed by one of
//! those, but this crate only needs to know that signing produces an opaque
//! blob tagged with a format, and that a copy can pass such blobs through
//! unchanged, re-sign them for a new reference, or drop them.

use oci_spec::image::Digest;

use crate::{OcifreightCoreError, OcifreightCoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Which signature convention a [`Signature`]'s blob follows. Both are
/// opaque to this crate; the tag only matters for the on-disk/wire
/// representation a backend stores these blobs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureFormat {
    /// A detached GPG "simple signing" envelope.
    SimpleSigning,
    /// A sigstore payload + annotations bundle.
    Sigstore,
}

impl SignatureFormat {
    fn tag(self) -> u8 {
        match self {
            SignatureFormat::SimpleSigning => 0,
            SignatureFormat::Sigstore => 1,
        }
    }

    fn from_tag(tag: u8) -> OcifreightCoreResult<Self> {
        match tag {
            0 => Ok(SignatureFormat::SimpleSigning),
            1 => Ok(SignatureFormat::Sigstore),
            other => Err(OcifreightCoreError::Unsupported(format!(
                "unrecognized signature format tag {other}"
            ))),
        }
    }
}

/// A detached signature: a format tag plus an opaque blob meaningful only to
/// whatever signing mechanism produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Which convention `blob` follows.
    pub format: SignatureFormat,
    /// The signature bytes themselves (a GPG envelope, or a sigstore bundle).
    pub blob: Vec<u8>,
}

/// Signs a manifest digest + reference pair against a key identity. Entirely
/// abstract: a real signer wraps GPG or a sigstore client; this crate only
/// needs the shape of the operation to drive the copy engine's signature
/// step.
pub trait Signer: Send + Sync {
    /// The identity (key fingerprint, sigstore identity token subject, …)
    /// this signer signs under.
    fn key_identity(&self) -> &str;

    /// Produces a detached signature over `manifest_digest` scoped to
    /// `reference` (the signature conventionally also asserts which
    /// reference the signed content may be served under).
    fn sign(&self, manifest_digest: &Digest, reference: &str) -> OcifreightCoreResult<Signature>;
}

/// Verifies a detached signature against a manifest digest + reference pair.
pub trait Verifier: Send + Sync {
    /// Returns whether `signature` is a valid signature over `manifest_digest`
    /// scoped to `reference`.
    fn verify(&self, signature: &Signature, manifest_digest: &Digest, reference: &str) -> OcifreightCoreResult<bool>;
}

/// What a copy does with the signatures it read from the source: pass them
/// through unchanged, re-sign with an injected signer for the new reference,
/// or strip them entirely.
pub enum SignatureAction<'a> {
    /// Carry every source signature forward unchanged.
    PassThrough,
    /// Discard every source signature; the destination receives none.
    Strip,
    /// Discard source signatures and produce a single fresh signature over
    /// the destination's manifest digest and reference, using `signer`.
    Resign {
        /// The signer to produce the destination's signature with.
        signer: &'a dyn Signer,
        /// The reference the new signature is scoped to.
        destination_reference: &'a str,
    },
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Encodes a [`Signature`] into the opaque byte blob a [`crate::backend::Source`]/
/// [`crate::backend::Destination`] actually traffics in: a one-byte format
/// tag followed by the signature's own bytes.
pub fn encode(signature: &Signature) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + signature.blob.len());
    out.push(signature.format.tag());
    out.extend_from_slice(&signature.blob);
    out
}

/// The inverse of [`encode`].
pub fn decode(bytes: &[u8]) -> OcifreightCoreResult<Signature> {
    let (&tag, blob) = bytes
        .split_first()
        .ok_or_else(|| OcifreightCoreError::MalformedManifest("empty signature blob".to_string()))?;
    Ok(Signature {
        format: SignatureFormat::from_tag(tag)?,
        blob: blob.to_vec(),
    })
}

/// Applies a copy's [`SignatureAction`] to the opaque signature blobs read
/// from a source, producing the opaque blobs a destination's
/// `put_signatures_with_format` should be called with.
pub fn apply_action(
    source_signatures: &[Vec<u8>],
    action: &SignatureAction<'_>,
    destination_manifest_digest: &Digest,
) -> OcifreightCoreResult<Vec<Vec<u8>>> {
    match action {
        SignatureAction::PassThrough => Ok(source_signatures.to_vec()),
        SignatureAction::Strip => Ok(Vec::new()),
        SignatureAction::Resign {
            signer,
            destination_reference,
        } => {
            let signature = signer.sign(destination_manifest_digest, destination_reference)?;
            Ok(vec![encode(&signature)])
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    struct FixedSigner {
        identity: String,
    }

    impl Signer for FixedSigner {
        fn key_identity(&self) -> &str {
            &self.identity
        }

        fn sign(&self, manifest_digest: &Digest, reference: &str) -> OcifreightCoreResult<Signature> {
            let mut blob = manifest_digest.to_string().into_bytes();
            blob.extend_from_slice(reference.as_bytes());
            Ok(Signature {
                format: SignatureFormat::Sigstore,
                blob,
            })
        }
    }

    fn sample_digest() -> Digest {
        Digest::from_str("sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855").unwrap()
    }

    #[test]
    fn encode_decode_round_trips() {
        let signature = Signature {
            format: SignatureFormat::SimpleSigning,
            blob: b"gpg-envelope".to_vec(),
        };
        let encoded = encode(&signature);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, signature);
    }

    #[test]
    fn decode_rejects_empty_blob() {
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn pass_through_preserves_source_signatures() {
        let sigs = vec![vec![0, 1, 2]];
        let out = apply_action(&sigs, &SignatureAction::PassThrough, &sample_digest()).unwrap();
        assert_eq!(out, sigs);
    }

    #[test]
    fn strip_drops_all_signatures() {
        let sigs = vec![vec![0, 1, 2]];
        let out = apply_action(&sigs, &SignatureAction::Strip, &sample_digest()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn resign_produces_exactly_one_fresh_signature() {
        let signer = FixedSigner {
            identity: "key-1".to_string(),
        };
        let sigs = vec![vec![9, 9, 9]];
        let action = SignatureAction::Resign {
            signer: &signer,
            destination_reference: "docker://example.com/repo:tag",
        };
        let out = apply_action(&sigs, &action, &sample_digest()).unwrap();
        assert_eq!(out.len(), 1);
        let decoded = decode(&out[0]).unwrap();
        assert_eq!(decoded.format, SignatureFormat::Sigstore);
    }
}
