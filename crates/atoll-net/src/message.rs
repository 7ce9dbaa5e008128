//! Wire records for the data mover.
//!
//! Every stream starts with a [`StreamHdr`] identifying the job and the
//! sender, followed by records: `[u32 hdr_len][postcard ObjHdr]` and then
//! the payload. A payload of known size is sent raw; an unknown size
//! (ETL output) is framed as PDUs: `[u32 n][n bytes]` repeated, with a
//! zero-length PDU marking end-of-object, so the receiver can drive its
//! write pipeline without pre-allocating.

use atoll_types::{Bck, NodeId, ObjAttrs};
use serde::{Deserialize, Serialize};

/// Opcode of an object-payload record.
pub const OPC_OBJ: u16 = 0;

/// Opcode of the termination ack: "this sender has finished enqueuing
/// objects for this job".
pub const OPC_TXN_DONE: u16 = 27182;

/// Per-stream preamble: which job the stream belongs to and who sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHdr {
    pub job_uuid: String,
    pub sender: NodeId,
}

/// Per-record header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjHdr {
    /// [`OPC_OBJ`] or [`OPC_TXN_DONE`].
    pub opcode: u16,
    /// Transaction UUID of the job this record belongs to.
    pub txn_uuid: String,
    /// Destination bucket.
    pub bck: Bck,
    /// Destination object name (transform already applied by the sender).
    pub obj_name: String,
    /// Attributes; `attrs.size < 0` selects PDU framing on the wire.
    pub attrs: ObjAttrs,
}

impl ObjHdr {
    pub fn done(txn_uuid: &str, bck: Bck) -> Self {
        Self {
            opcode: OPC_TXN_DONE,
            txn_uuid: txn_uuid.to_string(),
            bck,
            obj_name: String::new(),
            attrs: ObjAttrs::default(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.opcode == OPC_TXN_DONE
    }
}
