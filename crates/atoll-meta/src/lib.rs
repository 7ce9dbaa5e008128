//! Local metadata cache for Atoll nodes.
//!
//! Every node persists the latest [`Smap`] and [`Bmd`] snapshots it has
//! installed, plus its own identity, so that a restarting node can find
//! the cluster again: the join sequence first contacts the primary
//! recorded in the cached map. All data here is a cache reconstructible
//! from the cluster; losing it only costs a slower discovery-URL join.
//!
//! [`Smap`]: atoll_types::Smap
//! [`Bmd`]: atoll_types::Bmd

mod error;
mod store;

pub use error::MetaError;
pub use store::MetaCache;
