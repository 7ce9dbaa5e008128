//! Shared types for the Atoll workspace.
//!
//! This crate defines the data model used across all Atoll crates:
//! node identity and roles ([`NodeId`], [`Node`]), the versioned cluster
//! map ([`Smap`]), bucket identity and metadata ([`Bck`], [`BckProps`],
//! [`Bmd`]), object attributes ([`ObjAttrs`]), control-plane and job
//! messages ([`msg`]), feature flags ([`features`]), and the brace-range
//! template parser ([`template`]).

pub mod clock;
pub mod features;
pub mod msg;
pub mod template;

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

/// Stable identifier for a cluster node.
///
/// Node IDs are short opaque strings assigned once at first startup
/// (`p-…` for proxies, `t-…` for targets) and never reused. The rendezvous
/// hash mixes the raw string bytes, so the ID must not change for the
/// lifetime of the node.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Terminates client HTTP and routes; stateless w.r.t. object data.
    Proxy,
    /// Stores object data on local mountpaths.
    Target,
}

/// Liveness state of a node as recorded in the cluster map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Node participates in hashing and broadcasts.
    Active,
    /// Node is administratively out; excluded from hashing.
    Maintenance,
}

/// A cluster node as published in the [`Smap`].
///
/// Immutable except through Smap transitions: the primary builds a new
/// map version and broadcasts it; nodes never edit their entry in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub role: NodeRole,
    /// Public endpoints clients are redirected to. Targets may advertise
    /// more than one (multi-homing); the router picks per object key.
    pub pub_urls: Vec<String>,
    /// Intra-cluster control endpoint (join, snapshot broadcast, pages).
    pub intra_url: String,
    /// Data-mover endpoint identity (hex QUIC key), targets only.
    #[serde(default)]
    pub mover_id: Option<String>,
    /// Direct socket addresses for the data-mover endpoint.
    #[serde(default)]
    pub mover_addrs: Vec<SocketAddr>,
    pub state: NodeState,
}

impl Node {
    pub fn is_active(&self) -> bool {
        self.state == NodeState::Active
    }

    /// First public URL; every node must advertise at least one.
    pub fn pub_url(&self) -> &str {
        self.pub_urls.first().map(String::as_str).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Cluster map
// ---------------------------------------------------------------------------

/// Versioned cluster membership snapshot.
///
/// Invariants: exactly one primary proxy; versions strictly increase on
/// replace; readers always see a consistent snapshot (the owner publishes
/// whole immutable values, see `atoll-cluster`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Smap {
    pub version: u64,
    pub primary: NodeId,
    /// Proxies by node ID. BTreeMap for deterministic iteration order.
    pub pmap: BTreeMap<NodeId, Node>,
    /// Targets by node ID.
    pub tmap: BTreeMap<NodeId, Node>,
}

impl Smap {
    /// Initial single-node map with `primary` as the only member.
    pub fn initial(primary: Node) -> Self {
        let mut pmap = BTreeMap::new();
        let id = primary.id.clone();
        pmap.insert(id.clone(), primary);
        Self {
            version: 1,
            primary: id,
            pmap,
            tmap: BTreeMap::new(),
        }
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Node> {
        self.tmap.get(id).or_else(|| self.pmap.get(id))
    }

    pub fn is_primary(&self, id: &NodeId) -> bool {
        self.primary == *id
    }

    pub fn primary_node(&self) -> Option<&Node> {
        self.pmap.get(&self.primary)
    }

    /// Targets that participate in hashing and job broadcasts.
    pub fn active_targets(&self) -> impl Iterator<Item = &Node> {
        self.tmap.values().filter(|n| n.is_active())
    }

    pub fn count_active_targets(&self) -> usize {
        self.active_targets().count()
    }

    /// All nodes, proxies first.
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.pmap.values().chain(self.tmap.values())
    }
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

/// Storage backend provider of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Native,
    Aws,
    Gcp,
    Azure,
    Hdfs,
    RemoteNative,
    Http,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Native => "atoll",
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
            Provider::Hdfs => "hdfs",
            Provider::RemoteNative => "remote-atoll",
            Provider::Http => "http",
        }
    }
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Native
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "atoll" | "" => Ok(Provider::Native),
            "aws" | "s3" => Ok(Provider::Aws),
            "gcp" | "gs" => Ok(Provider::Gcp),
            "azure" | "az" => Ok(Provider::Azure),
            "hdfs" => Ok(Provider::Hdfs),
            "remote-atoll" => Ok(Provider::RemoteNative),
            "http" => Ok(Provider::Http),
            other => Err(NameError::BadProvider(other.to_string())),
        }
    }
}

/// Bucket identity: (provider, namespace, name).
///
/// The empty namespace is the global one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bck {
    pub provider: Provider,
    #[serde(default)]
    pub ns: String,
    pub name: String,
}

impl Bck {
    pub fn native(name: impl Into<String>) -> Self {
        Self {
            provider: Provider::Native,
            ns: String::new(),
            name: name.into(),
        }
    }

    /// Canonical serialization of (provider, namespace, name, objectName):
    /// the hash key for rendezvous routing. The separator cannot appear in
    /// provider tokens, and name validation rejects empty components, so
    /// the encoding is unambiguous.
    pub fn make_uname(&self, obj_name: &str) -> String {
        format!("{}/@{}/{}/{}", self.provider.as_str(), self.ns, self.name, obj_name)
    }

    /// Uname of the bucket itself; used as the BMD key.
    pub fn bck_uname(&self) -> String {
        self.make_uname("")
    }

    /// Human-readable `provider://name` (or `provider://ns/name`).
    pub fn cname(&self, obj_name: &str) -> String {
        let mut s = format!("{}://", self.provider.as_str());
        if !self.ns.is_empty() {
            s.push_str(&self.ns);
            s.push('/');
        }
        s.push_str(&self.name);
        if !obj_name.is_empty() {
            s.push('/');
            s.push_str(obj_name);
        }
        s
    }

    pub fn validate(&self) -> Result<(), NameError> {
        validate_bucket_name(&self.name)
    }
}

impl fmt::Display for Bck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cname(""))
    }
}

/// Versioning configuration of a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConf {
    pub enabled: bool,
}

/// Checksum algorithm recorded with stored objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    None,
    Blake3,
}

impl Default for ChecksumType {
    fn default() -> Self {
        ChecksumType::Blake3
    }
}

/// Checksum configuration of a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CksumConf {
    #[serde(rename = "type")]
    pub ty: ChecksumType,
}

/// Local mirroring configuration (applied by targets, outside the core).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConf {
    pub enabled: bool,
    pub copies: u8,
}

/// Erasure-coding configuration (applied by targets, outside the core).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcConf {
    pub enabled: bool,
    pub data_slices: u8,
    pub parity_slices: u8,
}

/// Per-bucket properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BckProps {
    /// Unique, stable bucket ID assigned by the primary at creation.
    pub bid: u64,
    /// Creation time, nanoseconds since the UNIX epoch.
    pub created_ns: u64,
    pub versioning: VersionConf,
    pub checksum: CksumConf,
    pub mirror: MirrorConf,
    pub ec: EcConf,
    /// Per-bucket feature bits; `None` inherits the cluster default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<u64>,
}

impl BckProps {
    /// Effective feature bits: the bucket override or the cluster default.
    pub fn effective_features(&self, cluster_default: u64) -> u64 {
        self.features.unwrap_or(cluster_default)
    }
}

/// One BMD entry: a bucket plus its properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BckEntry {
    pub bck: Bck,
    pub props: BckProps,
}

/// Structured result of a by-name bucket lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BmdLookupErr {
    #[error("bucket {0:?} does not exist")]
    NotFound(String),
    #[error("bucket name {0:?} is ambiguous across providers: {1:?}")]
    AmbiguousProvider(String, Vec<Provider>),
}

/// Versioned registry of known buckets.
///
/// Owned by the primary proxy; every node caches the latest copy.
/// Bucket IDs are unique and stable for the lifetime of the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bmd {
    pub version: u64,
    /// Keyed by [`Bck::bck_uname`].
    pub buckets: BTreeMap<String, BckEntry>,
}

impl Default for Bmd {
    fn default() -> Self {
        Self {
            version: 1,
            buckets: BTreeMap::new(),
        }
    }
}

impl Bmd {
    pub fn get(&self, bck: &Bck) -> Option<&BckEntry> {
        self.buckets.get(&bck.bck_uname())
    }

    pub fn contains(&self, bck: &Bck) -> bool {
        self.get(bck).is_some()
    }

    /// Resolve a bucket by name, optionally pinned to a provider.
    ///
    /// Without a provider hint, the name must be unique across providers;
    /// otherwise the lookup reports [`BmdLookupErr::AmbiguousProvider`].
    pub fn init_by_name(
        &self,
        name: &str,
        provider: Option<Provider>,
    ) -> Result<&BckEntry, BmdLookupErr> {
        if let Some(p) = provider {
            let bck = Bck {
                provider: p,
                ns: String::new(),
                name: name.to_string(),
            };
            return self.get(&bck).ok_or_else(|| BmdLookupErr::NotFound(name.to_string()));
        }

        let matches: Vec<&BckEntry> = self
            .buckets
            .values()
            .filter(|e| e.bck.name == name)
            .collect();
        match matches.len() {
            0 => Err(BmdLookupErr::NotFound(name.to_string())),
            1 => Ok(matches[0]),
            _ => Err(BmdLookupErr::AmbiguousProvider(
                name.to_string(),
                matches.iter().map(|e| e.bck.provider).collect(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Object attributes
// ---------------------------------------------------------------------------

/// Size used when the payload length is not known up front (ETL).
pub const SIZE_UNKNOWN: i64 = -1;

/// A checksum value paired with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cksum {
    pub ty: ChecksumType,
    pub value: String,
}

impl Cksum {
    /// Compute the bucket-default checksum of a payload.
    pub fn compute(ty: ChecksumType, data: &[u8]) -> Option<Self> {
        match ty {
            ChecksumType::None => None,
            ChecksumType::Blake3 => Some(Self {
                ty,
                value: blake3::hash(data).to_hex().to_string(),
            }),
        }
    }
}

/// Attributes travelling with an object through PUTs and the data mover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjAttrs {
    /// Payload size in bytes; [`SIZE_UNKNOWN`] when not known up front.
    pub size: i64,
    /// Access time, nanoseconds since the UNIX epoch; 0 when absent.
    pub atime_ns: i64,
    #[serde(default)]
    pub checksum: Option<Cksum>,
    /// Pass-through attributes (content-type, Content-MD5, user metadata).
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

/// Maximum object name length in bytes.
pub const MAX_OBJ_NAME_LEN: usize = 1024;

/// Maximum bucket name length in bytes.
pub const MAX_BCK_NAME_LEN: usize = 255;

/// Name-policy violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("missing or empty object name")]
    EmptyObjName,
    #[error("object name too long ({0} > {MAX_OBJ_NAME_LEN} bytes)")]
    ObjNameTooLong(usize),
    #[error("object name contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("object name contains a '..' path segment")]
    DotDot,
    #[error("object name must not start with '/'")]
    LeadingSlash,
    #[error("invalid bucket name {0:?}")]
    BadBucketName(String),
    #[error("unknown provider {0:?}")]
    BadProvider(String),
}

/// Validate an object key against the name policy: non-empty, no control
/// characters, no leading slash, no `..` segment, bounded length.
pub fn validate_obj_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::EmptyObjName);
    }
    if name.len() > MAX_OBJ_NAME_LEN {
        return Err(NameError::ObjNameTooLong(name.len()));
    }
    if name.starts_with('/') {
        return Err(NameError::LeadingSlash);
    }
    if let Some(c) = name.chars().find(|c| c.is_control()) {
        return Err(NameError::InvalidChar(c));
    }
    if name.split('/').any(|seg| seg == "..") {
        return Err(NameError::DotDot);
    }
    Ok(())
}

/// Validate a bucket name: S3-ish lowercase alphanumerics plus `-`, `_`, `.`.
pub fn validate_bucket_name(name: &str) -> Result<(), NameError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_BCK_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with(['-', '.'])
        && !name.ends_with(['-', '.']);
    if ok {
        Ok(())
    } else {
        Err(NameError::BadBucketName(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
