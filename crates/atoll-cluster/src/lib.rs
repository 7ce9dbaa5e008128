//! Cluster membership and metadata ownership.
//!
//! The primary proxy is the sole writer of the cluster map ([`SmapOwner`])
//! and the bucket metadata ([`BmdOwner`]). Both are immutable value types
//! behind an atomic pointer: readers take a snapshot and use it for the
//! whole request; the writer clones, bumps the version, and publishes.
//! Non-primary proxies forward mutating control-plane requests to the
//! primary and relay the response (the forward-CP contract, implemented
//! by [`CpClient`]).

mod bmd;
mod control;
mod error;
mod smap;

pub use bmd::{BmdOwner, CreateOutcome};
pub use control::{paths, CpClient, DeleteObjsReq, JoinReply, ListPageReq};
pub use error::ClusterError;
pub use smap::SmapOwner;
