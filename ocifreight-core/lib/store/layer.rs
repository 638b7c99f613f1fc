//! Deterministic layer-id derivation: identical `(parent, diffID)` pairs
//! always derive the same id, so concurrent pulls of the same image layer
//! converge on a single stored copy instead of racing to create duplicates.

use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Derives a layer id from its parent id (if any) and the digest of its
/// uncompressed content (the diffID). A base layer (no parent) is identified
/// by its diffID alone; a layer with a parent is identified by the hex
/// sha256 of `"<parent>+<diffID>"`, chaining every ancestor into the id.
pub fn derive_layer_id(parent_id: Option<&str>, diff_id: &Digest) -> String {
    match parent_id {
        None => hex_of(diff_id.to_string().as_bytes()),
        Some(parent) => hex_of(format!("{parent}+{diff_id}").as_bytes()),
    }
}

/// As [`derive_layer_id`], but identifies the layer by a TOC (table-of-contents)
/// digest rather than a diffID, for content addressed by a chunked/zstd:chunked
/// manifest rather than a full uncompressed digest.
pub fn derive_layer_id_from_toc(parent_id: Option<&str>, toc_digest: &Digest) -> String {
    match parent_id {
        None => hex_of(format!("@TOC={toc_digest}").as_bytes()),
        Some(parent) => hex_of(format!("{parent}+@TOC={toc_digest}").as_bytes()),
    }
}

fn hex_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn diff(c: char) -> Digest {
        Digest::from_str(&format!("sha256:{}", c.to_string().repeat(64))).unwrap()
    }

    #[test]
    fn base_layer_id_is_diff_id_hash_of_itself() {
        let d = diff('a');
        let id = derive_layer_id(None, &d);
        assert_eq!(id, hex_of(d.to_string().as_bytes()));
    }

    #[test]
    fn chained_layer_id_is_deterministic() {
        let d = diff('b');
        let id1 = derive_layer_id(Some("parent123"), &d);
        let id2 = derive_layer_id(Some("parent123"), &d);
        assert_eq!(id1, id2);
    }

    #[test]
    fn different_parents_derive_different_ids() {
        let d = diff('c');
        let id1 = derive_layer_id(Some("parentA"), &d);
        let id2 = derive_layer_id(Some("parentB"), &d);
        assert_ne!(id1, id2);
    }

    #[test]
    fn toc_derivation_differs_from_diff_id_derivation() {
        let d = diff('d');
        let by_diff = derive_layer_id(Some("p"), &d);
        let by_toc = derive_layer_id_from_toc(Some("p"), &d);
        assert_ne!(by_diff, by_toc);
    }
}
