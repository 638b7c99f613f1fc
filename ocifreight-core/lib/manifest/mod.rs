//! Manifest model: decode/encode schema-1 (signed), schema-2,
//! OCI v1 image manifests, and both manifest-list flavors; compute canonical
//! digests; enumerate layer infos; produce updated variants; select a
//! platform-specific child out of an index.
//!
//! Schema-2 and OCI v1 manifests/configs share an identical JSON shape, so
//! this module leans on [`oci_spec::image`]'s typed model for both rather than
//! hand-rolling a parallel representation; schema-1 (with its detached JWS
//! envelope) gets its own [`schema1`] submodule because its digest rule is not
//! "hash the bytes".

pub mod index;
pub mod inspect;
pub mod model;
pub mod schema1;

pub use index::*;
pub use inspect::*;
pub use model::*;
