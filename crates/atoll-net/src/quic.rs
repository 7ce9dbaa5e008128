//! QUIC data mover built on iroh.
//!
//! [`MoverEndpoint`] wraps an iroh [`Endpoint`]: it pools connections to
//! peers, accepts incoming streams, and demultiplexes records to the
//! [`RecvHandler`] registered under the stream's job ID. [`QuicMover`] is
//! the per-job sending half: one lazily opened uni-directional stream per
//! peer, carrying the job's records in FIFO order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atoll_types::NodeId;
use bytes::{Bytes, BytesMut};
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, NodeAddr as EndpointAddr, NodeId as IrohNodeId, SecretKey};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::NetError;
use crate::message::{ObjHdr, StreamHdr, OPC_TXN_DONE};
use crate::{DataMover, RecvHandler};

/// Maximum encoded record-header size.
const MAX_HDR_SIZE: usize = 1024 * 1024;

/// PDU payload frame size used when the object size is unknown.
pub const PDU_SIZE: usize = 128 * 1024;

/// Node-id → mover endpoint address, maintained from Smap snapshots.
pub type AddressBook = Arc<RwLock<HashMap<NodeId, EndpointAddr>>>;

/// Derive the mover ALPN from the cluster name so that nodes of different
/// clusters cannot connect; the TLS handshake itself rejects a mismatch.
pub fn cluster_alpn(cluster: &str) -> Vec<u8> {
    let digest = blake3::hash(cluster.as_bytes());
    format!("atoll/0/{}", &digest.to_hex()[..16]).into_bytes()
}

/// Shared QUIC endpoint for the data mover.
pub struct MoverEndpoint {
    endpoint: Endpoint,
    alpn: Vec<u8>,
    connections: Mutex<HashMap<IrohNodeId, Connection>>,
    handlers: RwLock<HashMap<String, Arc<dyn RecvHandler>>>,
}

impl MoverEndpoint {
    /// Bind a new endpoint with a cluster-specific ALPN.
    pub async fn bind(
        secret_key: SecretKey,
        relay_mode: iroh::RelayMode,
        alpn: Vec<u8>,
    ) -> Result<Arc<Self>, NetError> {
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![alpn.clone()])
            .relay_mode(relay_mode)
            .bind()
            .await
            .map_err(|e| NetError::Connect(e.to_string()))?;

        Ok(Arc::new(Self {
            endpoint,
            alpn,
            connections: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        }))
    }

    /// This endpoint's address (identity + direct addresses).
    pub fn addr(&self) -> EndpointAddr {
        use iroh::Watcher as _;
        let mut watcher = self.endpoint.node_addr();
        watcher
            .get()
            .unwrap_or_else(|| EndpointAddr::new(self.endpoint.node_id()))
    }

    /// This endpoint's public identity.
    pub fn endpoint_id(&self) -> IrohNodeId {
        self.endpoint.node_id()
    }

    /// Register the receive handler for a job. One handler per job.
    pub async fn register(&self, job_uuid: &str, handler: Arc<dyn RecvHandler>) {
        self.handlers
            .write()
            .await
            .insert(job_uuid.to_string(), handler);
    }

    /// Deregister the receive handler of a finished job.
    pub async fn unregister(&self, job_uuid: &str) {
        self.handlers.write().await.remove(job_uuid);
    }

    async fn handler_for(&self, job_uuid: &str) -> Option<Arc<dyn RecvHandler>> {
        self.handlers.read().await.get(job_uuid).cloned()
    }

    /// Get or establish a connection to a peer.
    async fn get_connection(&self, addr: EndpointAddr) -> Result<Connection, NetError> {
        let remote_id = addr.node_id;
        {
            let cache = self.connections.lock().await;
            if let Some(conn) = cache.get(&remote_id) {
                if conn.close_reason().is_none() {
                    return Ok(conn.clone());
                }
            }
        }

        debug!(remote = %remote_id.fmt_short(), "mover: connecting to peer");
        let conn = self
            .endpoint
            .connect(addr, &self.alpn)
            .await
            .map_err(|e| NetError::Connect(e.to_string()))?;
        self.connections.lock().await.insert(remote_id, conn.clone());
        Ok(conn)
    }

    /// Run the accept loop until the endpoint closes. Each incoming uni
    /// stream is served on its own task.
    pub fn spawn_accept_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(incoming) = this.endpoint.accept().await {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("mover: failed to accept connection: {e}");
                        continue;
                    }
                };
                let this = this.clone();
                tokio::spawn(async move {
                    loop {
                        match conn.accept_uni().await {
                            Ok(recv) => {
                                let this = this.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = this.serve_stream(recv).await {
                                        debug!("mover: stream ended with error: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                debug!("mover: connection closed: {e}");
                                break;
                            }
                        }
                    }
                });
            }
        })
    }

    /// Read one stream: preamble, then records until EOF.
    async fn serve_stream(&self, mut recv: RecvStream) -> Result<(), NetError> {
        let preamble: StreamHdr = match read_frame(&mut recv).await? {
            Some(frame) => postcard::from_bytes(&frame)
                .map_err(|e| NetError::Serialization(e.to_string()))?,
            None => return Ok(()), // opened and finished empty
        };
        let handler = self
            .handler_for(&preamble.job_uuid)
            .await
            .ok_or_else(|| NetError::NoHandler(preamble.job_uuid.clone()))?;

        loop {
            // EOF before a record header is the normal end of stream.
            let hdr_bytes = match read_frame(&mut recv).await? {
                Some(frame) => frame,
                None => return Ok(()),
            };
            let hdr: ObjHdr = postcard::from_bytes(&hdr_bytes)
                .map_err(|e| NetError::Serialization(e.to_string()))?;

            // Drain the payload unconditionally, before the handler can
            // fail, so the stream stays decodable.
            let payload = if hdr.opcode == OPC_TXN_DONE {
                Bytes::new()
            } else if hdr.attrs.size >= 0 {
                read_exact_bytes(&mut recv, hdr.attrs.size as usize).await?
            } else {
                read_pdus(&mut recv).await?
            };

            if let Err(e) = handler.recv(hdr, payload).await {
                // Strict receive: a handler error terminates the stream.
                return Err(NetError::Rejected(e.to_string()));
            }
        }
    }

    /// Close the endpoint (drops pooled connections).
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

// ---------------------------------------------------------------------------
// Stream reading helpers
// ---------------------------------------------------------------------------

/// Read exactly `buf.len()` bytes. `Ok(false)` on clean EOF at offset 0.
async fn read_full(recv: &mut RecvStream, buf: &mut [u8]) -> Result<bool, NetError> {
    let mut filled = 0;
    while filled < buf.len() {
        match recv
            .read(&mut buf[filled..])
            .await
            .map_err(|e| NetError::Read(e.to_string()))?
        {
            Some(n) => filled += n,
            None if filled == 0 => return Ok(false),
            None => {
                return Err(NetError::Read(format!(
                    "stream ended mid-frame ({filled}/{} bytes)",
                    buf.len()
                )))
            }
        }
    }
    Ok(true)
}

/// Read a `[u32 len][len bytes]` frame. `Ok(None)` on clean EOF.
async fn read_frame(recv: &mut RecvStream) -> Result<Option<Vec<u8>>, NetError> {
    let mut len_buf = [0u8; 4];
    if !read_full(recv, &mut len_buf).await? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_HDR_SIZE {
        return Err(NetError::RecordTooLarge(len, MAX_HDR_SIZE));
    }
    let mut frame = vec![0u8; len];
    if !read_full(recv, &mut frame).await? {
        return Err(NetError::Read("stream ended before frame body".to_string()));
    }
    Ok(Some(frame))
}

/// Read a known-size payload.
async fn read_exact_bytes(recv: &mut RecvStream, size: usize) -> Result<Bytes, NetError> {
    let mut buf = vec![0u8; size];
    if size > 0 && !read_full(recv, &mut buf).await? {
        return Err(NetError::Read("stream ended before payload".to_string()));
    }
    Ok(Bytes::from(buf))
}

/// Read PDU frames up to the zero-length end-of-object marker.
async fn read_pdus(recv: &mut RecvStream) -> Result<Bytes, NetError> {
    let mut out = BytesMut::new();
    loop {
        let mut len_buf = [0u8; 4];
        if !read_full(recv, &mut len_buf).await? {
            return Err(NetError::Read("stream ended inside PDU sequence".to_string()));
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(out.freeze());
        }
        if len > MAX_HDR_SIZE {
            return Err(NetError::RecordTooLarge(len, MAX_HDR_SIZE));
        }
        let start = out.len();
        out.resize(start + len, 0);
        if !read_full(recv, &mut out[start..]).await? {
            return Err(NetError::Read("stream ended inside PDU".to_string()));
        }
    }
}

async fn write_frame(send: &mut SendStream, frame: &[u8]) -> Result<(), NetError> {
    send.write_all(&(frame.len() as u32).to_be_bytes())
        .await
        .map_err(|e| NetError::Write(e.to_string()))?;
    send.write_all(frame)
        .await
        .map_err(|e| NetError::Write(e.to_string()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// QuicMover
// ---------------------------------------------------------------------------

/// Per-job sending half of the data mover.
pub struct QuicMover {
    endpoint: Arc<MoverEndpoint>,
    job_uuid: String,
    local: NodeId,
    address_book: AddressBook,
    /// One stream per peer; the per-peer mutex serializes records so the
    /// stream stays FIFO even with parallel jogger workers.
    streams: std::sync::Mutex<HashMap<NodeId, Arc<Mutex<SendStream>>>>,
    /// Frame payloads as PDUs regardless of declared size (ETL mode).
    pdu: bool,
    closed: AtomicBool,
}

impl QuicMover {
    pub fn new(
        endpoint: Arc<MoverEndpoint>,
        job_uuid: impl Into<String>,
        local: NodeId,
        address_book: AddressBook,
        pdu: bool,
    ) -> Self {
        Self {
            endpoint,
            job_uuid: job_uuid.into(),
            local,
            address_book,
            streams: std::sync::Mutex::new(HashMap::new()),
            pdu,
            closed: AtomicBool::new(false),
        }
    }

    /// Get or lazily open the per-peer stream, writing the preamble on open.
    async fn stream_to(&self, to: &NodeId) -> Result<Arc<Mutex<SendStream>>, NetError> {
        if let Some(s) = self.streams.lock().expect("mover lock poisoned").get(to) {
            return Ok(s.clone());
        }

        let addr = self
            .address_book
            .read()
            .await
            .get(to)
            .cloned()
            .ok_or_else(|| NetError::NoRoute(to.to_string()))?;
        let conn = self.endpoint.get_connection(addr).await?;
        let mut send = conn
            .open_uni()
            .await
            .map_err(|e| NetError::StreamOpen(e.to_string()))?;

        let preamble = postcard::to_allocvec(&StreamHdr {
            job_uuid: self.job_uuid.clone(),
            sender: self.local.clone(),
        })
        .map_err(|e| NetError::Serialization(e.to_string()))?;
        write_frame(&mut send, &preamble).await?;

        let slot = Arc::new(Mutex::new(send));
        let mut map = self.streams.lock().expect("mover lock poisoned");
        // A concurrent open may have won; keep the first stream.
        Ok(map.entry(to.clone()).or_insert(slot).clone())
    }

    async fn send_record(
        &self,
        to: &NodeId,
        hdr: &ObjHdr,
        payload: &Bytes,
    ) -> Result<(), NetError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::AlreadyClosed);
        }
        let stream = self.stream_to(to).await?;
        let mut send = stream.lock().await;

        let hdr_bytes =
            postcard::to_allocvec(hdr).map_err(|e| NetError::Serialization(e.to_string()))?;
        write_frame(&mut send, &hdr_bytes).await?;

        if hdr.opcode == OPC_TXN_DONE {
            return Ok(());
        }
        if self.pdu || hdr.attrs.size < 0 {
            for chunk in payload.chunks(PDU_SIZE) {
                send.write_all(&(chunk.len() as u32).to_be_bytes())
                    .await
                    .map_err(|e| NetError::Write(e.to_string()))?;
                send.write_all(chunk)
                    .await
                    .map_err(|e| NetError::Write(e.to_string()))?;
            }
            send.write_all(&0u32.to_be_bytes())
                .await
                .map_err(|e| NetError::Write(e.to_string()))?;
        } else {
            send.write_all(payload)
                .await
                .map_err(|e| NetError::Write(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DataMover for QuicMover {
    async fn send_obj(&self, to: &NodeId, mut hdr: ObjHdr, payload: Bytes) -> Result<(), NetError> {
        // ETL mode keeps the declared size unknown on the wire.
        if self.pdu {
            hdr.attrs.size = -1;
        }
        self.send_record(to, &hdr, &payload).await
    }

    async fn send_done(&self, to: &NodeId, txn_uuid: &str) -> Result<(), NetError> {
        let hdr = ObjHdr::done(txn_uuid, atoll_types::Bck::native(""));
        self.send_record(to, &hdr, &Bytes::new()).await
    }

    async fn close(&self) -> Result<(), NetError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!(job = %self.job_uuid, "mover double close");
            return Err(NetError::AlreadyClosed);
        }
        let streams: Vec<Arc<Mutex<SendStream>>> = {
            let mut map = self.streams.lock().expect("mover lock poisoned");
            map.drain().map(|(_, s)| s).collect()
        };
        for stream in streams {
            let mut send = stream.lock().await;
            if let Err(e) = send.finish() {
                debug!(job = %self.job_uuid, "stream finish: {e}");
            }
        }
        Ok(())
    }
}
