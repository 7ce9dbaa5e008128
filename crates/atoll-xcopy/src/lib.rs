//! Transform-copy engine.
//!
//! A transform-copy job copies (or ETL-transforms) a selection of
//! objects from one bucket to another, across all targets. Every active
//! target runs the job locally: it iterates the selected objects it
//! owns, stores each one locally when the destination hashes back to
//! itself, and streams it to the owning target otherwise. Termination is
//! reference-counted (every peer owes this target one "done" control
//! message) and the wait is a small quiescence state machine instead of
//! indefinite blocking.

mod engine;
mod error;
mod etl;
mod pending;

#[cfg(test)]
mod tests;

pub use engine::{MoverConnector, XcopyConfig, XcopyEngine};
pub use error::XcopyError;
pub use etl::{IdentityTransform, Transform};
pub use pending::{JobSnap, JobState, WorkItem};
