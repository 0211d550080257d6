//! # kiln-cache
//!
//! Build-skip cache: the on-disk [`CacheRecord`](kiln_core::CacheRecord)
//! store, the git revision query, and the policy that decides whether the
//! previous build output can be served as-is.
//!
//! Call [`can_serve`] at the start of a run and [`store::write`] after every
//! successful build.

pub mod error;
pub mod policy;
pub mod revision;
pub mod store;

pub use error::CacheError;
pub use policy::{can_serve, evaluate, CacheDecision, RevisionProbe};
