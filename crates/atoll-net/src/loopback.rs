//! In-process data mover for engine tests.
//!
//! Delivers records by direct handler invocation: the sender awaits each
//! delivery, which preserves per-sender FIFO exactly like a real stream.
//! Multi-"node" tests share one [`LoopbackNet`] and register each node's
//! handler under `(receiver, job)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atoll_types::NodeId;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::NetError;
use crate::message::ObjHdr;
use crate::{DataMover, RecvHandler};

/// Shared in-process "network": `(receiver, job_uuid)` → handler.
#[derive(Default)]
pub struct LoopbackNet {
    handlers: RwLock<HashMap<(NodeId, String), Arc<dyn RecvHandler>>>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, node: NodeId, job_uuid: &str, handler: Arc<dyn RecvHandler>) {
        self.handlers
            .write()
            .await
            .insert((node, job_uuid.to_string()), handler);
    }

    pub async fn unregister(&self, node: &NodeId, job_uuid: &str) {
        self.handlers
            .write()
            .await
            .remove(&(node.clone(), job_uuid.to_string()));
    }

    async fn deliver(
        &self,
        to: &NodeId,
        job_uuid: &str,
        hdr: ObjHdr,
        payload: Bytes,
    ) -> Result<(), NetError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(&(to.clone(), job_uuid.to_string()))
            .cloned()
            .ok_or_else(|| NetError::NoHandler(format!("{to}/{job_uuid}")))?;
        handler
            .recv(hdr, payload)
            .await
            .map_err(|e| NetError::Rejected(e.to_string()))
    }
}

/// Per-job sending half over a [`LoopbackNet`].
pub struct LoopbackMover {
    net: Arc<LoopbackNet>,
    job_uuid: String,
    closed: AtomicBool,
}

impl LoopbackMover {
    pub fn new(net: Arc<LoopbackNet>, job_uuid: impl Into<String>) -> Self {
        Self {
            net,
            job_uuid: job_uuid.into(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl DataMover for LoopbackMover {
    async fn send_obj(&self, to: &NodeId, hdr: ObjHdr, payload: Bytes) -> Result<(), NetError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::AlreadyClosed);
        }
        self.net.deliver(to, &self.job_uuid, hdr, payload).await
    }

    async fn send_done(&self, to: &NodeId, txn_uuid: &str) -> Result<(), NetError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::AlreadyClosed);
        }
        let hdr = ObjHdr::done(txn_uuid, atoll_types::Bck::native(""));
        self.net.deliver(to, &self.job_uuid, hdr, Bytes::new()).await
    }

    async fn close(&self) -> Result<(), NetError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!(job = %self.job_uuid, "loopback mover double close");
            return Err(NetError::AlreadyClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use atoll_types::{Bck, ObjAttrs};

    use super::*;
    use crate::message::OPC_OBJ;

    struct Sink {
        seen: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait::async_trait]
    impl RecvHandler for Sink {
        async fn recv(&self, hdr: ObjHdr, payload: Bytes) -> Result<(), NetError> {
            self.seen
                .lock()
                .unwrap()
                .push((hdr.obj_name, payload.len()));
            Ok(())
        }
    }

    fn obj_hdr(name: &str, size: i64) -> ObjHdr {
        ObjHdr {
            opcode: OPC_OBJ,
            txn_uuid: "txn".to_string(),
            bck: Bck::native("dst"),
            obj_name: name.to_string(),
            attrs: ObjAttrs {
                size,
                ..ObjAttrs::default()
            },
        }
    }

    #[tokio::test]
    async fn test_delivery_in_send_order() {
        let net = LoopbackNet::new();
        let sink = Arc::new(Sink {
            seen: Mutex::new(vec![]),
        });
        let receiver = NodeId::from("t-1");
        net.register(receiver.clone(), "job", sink.clone()).await;

        let mover = LoopbackMover::new(net.clone(), "job");
        for i in 0..5 {
            mover
                .send_obj(
                    &receiver,
                    obj_hdr(&format!("o{i}"), 1),
                    Bytes::from_static(b"x"),
                )
                .await
                .unwrap();
        }

        let seen = sink.seen.lock().unwrap();
        let names: Vec<&str> = seen.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["o0", "o1", "o2", "o3", "o4"]);
    }

    #[tokio::test]
    async fn test_unregistered_receiver_errors() {
        let net = LoopbackNet::new();
        let mover = LoopbackMover::new(net, "job");
        let err = mover
            .send_obj(&NodeId::from("t-9"), obj_hdr("o", 1), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::NoHandler(_)));
    }

    #[tokio::test]
    async fn test_double_close_is_flagged() {
        let net = LoopbackNet::new();
        let mover = LoopbackMover::new(net, "job");
        mover.close().await.unwrap();
        assert!(matches!(
            mover.close().await.unwrap_err(),
            NetError::AlreadyClosed
        ));
    }
}
