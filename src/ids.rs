//! # ID SOURCE
//!
//! UUID generation is modeled as an external collaborator: a primitive
//! yielding a fresh opaque string on demand. [`IdSource`] is that seam;
//! [`UuidIdSource`] is the default, real implementation, so the crate is
//! usable standalone without callers having to supply their own.

use std::sync::Arc;

/// Produces fresh opaque strings for use as transaction and receipt ids.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> String;
}

/// Default [`IdSource`], backed by the `uuid` crate.
#[derive(Default)]
pub struct UuidIdSource;

impl IdSource for UuidIdSource {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

pub(crate) fn default_id_source() -> Arc<dyn IdSource> {
    Arc::new(UuidIdSource)
}
