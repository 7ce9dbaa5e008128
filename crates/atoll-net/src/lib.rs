//! Point-to-point streaming data mover.
//!
//! The transform-copy engine moves objects between targets over
//! long-lived per-peer streams. A stream is opened lazily on the first
//! send of a job, carries a FIFO sequence of records (object payloads
//! and control messages, distinguished by opcode), and is closed exactly
//! once when the job ends.
//!
//! Two implementations of [`DataMover`]:
//! - [`QuicMover`] — iroh QUIC uni-directional streams, one per
//!   (job, peer), demultiplexed on the receiving side by job ID.
//! - [`LoopbackMover`] — in-process delivery for engine tests.

mod error;
mod loopback;
mod message;
mod quic;

pub use error::NetError;
pub use loopback::{LoopbackMover, LoopbackNet};
pub use message::{ObjHdr, StreamHdr, OPC_OBJ, OPC_TXN_DONE};
pub use quic::{cluster_alpn, AddressBook, MoverEndpoint, QuicMover};

use bytes::Bytes;

/// Receiving side of the data mover: one handler per job, registered
/// under the job's ID while the job runs.
///
/// Returning an error from `recv` terminates the sender's stream (the
/// strictest error handling; the engine decides what is fatal before
/// propagating). The payload is always fully drained from the wire
/// before the handler runs.
#[async_trait::async_trait]
pub trait RecvHandler: Send + Sync {
    async fn recv(&self, hdr: ObjHdr, payload: Bytes) -> Result<(), NetError>;
}

/// Sending side of the data mover, scoped to one job.
#[async_trait::async_trait]
pub trait DataMover: Send + Sync {
    /// Send one object record to `to` on the job's per-peer stream.
    async fn send_obj(
        &self,
        to: &atoll_types::NodeId,
        hdr: ObjHdr,
        payload: Bytes,
    ) -> Result<(), NetError>;

    /// Send the termination ack for `txn_uuid` to `to`. Ordered after
    /// every previously sent object record on the same stream.
    async fn send_done(&self, to: &atoll_types::NodeId, txn_uuid: &str) -> Result<(), NetError>;

    /// Close all per-peer streams. Calling twice is a bug and returns
    /// [`NetError::AlreadyClosed`].
    async fn close(&self) -> Result<(), NetError>;
}
