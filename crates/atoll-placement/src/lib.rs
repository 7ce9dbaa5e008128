//! Consistent-hash routing via highest-random-weight (rendezvous) hashing.
//!
//! Given an object's canonical `uname` and a cluster-map snapshot, the
//! router picks the single owning target: for each active target compute
//! a per-(key, node) score and take the maximum. Adding or removing one
//! node relocates only ~1/N of keys, with no virtual-node tuning.
//!
//! Determinism contract: the same `(uname, Smap version)` always resolves
//! to the same target; ties break on lexicographic node-id order, which
//! the Smap's BTreeMap iteration provides for free.

pub mod hrw;

pub use hrw::{hrw_multihome, hrw_target, PlacementError};
