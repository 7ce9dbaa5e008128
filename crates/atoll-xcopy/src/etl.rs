//! ETL transform hook.
//!
//! A transform takes the full source payload and produces the bytes to
//! store at the destination. Output sizes are unknown up front, which is
//! why ETL jobs switch the data mover to PDU framing.

use bytes::Bytes;

/// Byte-level object transform applied between read and send/store.
pub trait Transform: Send + Sync {
    /// Stable name the job message refers to.
    fn name(&self) -> &str;

    /// Transform one object's payload.
    fn apply(&self, obj_name: &str, data: Bytes) -> Result<Bytes, String>;
}

/// The identity transform; useful for exercising the ETL wire path.
pub struct IdentityTransform;

impl Transform for IdentityTransform {
    fn name(&self) -> &str {
        "identity"
    }

    fn apply(&self, _obj_name: &str, data: Bytes) -> Result<Bytes, String> {
        Ok(data)
    }
}
