//! Control-plane and job messages.
//!
//! The private control RPC between proxies and targets carries
//! [`ActMsg`] JSON objects; cross-target transform-copy jobs carry
//! [`TcoMsg`] blobs keyed by their transaction UUID.

use serde::{Deserialize, Serialize};

use crate::template::{Template, TemplateError};
use crate::Bck;

// ---------------------------------------------------------------------------
// ActMsg
// ---------------------------------------------------------------------------

/// Create a bucket (primary only).
pub const ACT_CREATE_BCK: &str = "create-bck";
/// Destroy a bucket (primary only; idempotent against already-destroyed).
pub const ACT_DESTROY_BCK: &str = "destroy-bck";
/// Update bucket properties (primary only).
pub const ACT_SET_BPROPS: &str = "set-bprops";
/// List objects (paged, scattered to targets).
pub const ACT_LIST: &str = "list";
/// Start a transform-copy job (broadcast to targets).
pub const ACT_COPY_OBJECTS: &str = "copy-objects";
/// Start an ETL transform-copy job (broadcast to targets).
pub const ACT_ETL_OBJECTS: &str = "etl-objects";
/// Delete a list/range of objects (broadcast to targets).
pub const ACT_DELETE_OBJECTS: &str = "delete-objects";

/// Generic control-plane action message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActMsg {
    pub action: String,
    /// Subject of the action (bucket name, job ID, …).
    #[serde(default)]
    pub name: String,
    /// Action-specific payload.
    #[serde(default)]
    pub value: serde_json::Value,
}

impl ActMsg {
    pub fn new(action: &str, name: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            name: name.into(),
            value: serde_json::Value::Null,
        }
    }

    pub fn with_value<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.value = serde_json::to_value(value)?;
        Ok(self)
    }
}

/// An explicit list of object names, the payload of list-range actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRange {
    pub obj_names: Vec<String>,
}

// ---------------------------------------------------------------------------
// List-objects paging
// ---------------------------------------------------------------------------

/// Default ListObjectsV2 page size.
pub const DFLT_PAGE_SIZE: usize = 1000;

/// Paged listing request carried from the gateway to targets.
///
/// The first page establishes `uuid`; targets and subsequent pages must
/// echo it; a mismatch is a bug on the aggregator side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsoMsg {
    pub prefix: String,
    pub page_size: usize,
    /// Last key emitted by the previous page; empty on the first page.
    #[serde(default)]
    pub continuation_token: String,
    /// Listing job ID, minted on the first page.
    #[serde(default)]
    pub uuid: String,
}

/// One object entry in a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsoEntry {
    pub name: String,
    pub size: u64,
    pub atime_ns: i64,
    #[serde(default)]
    pub checksum: String,
}

/// One page of a distributed listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsoPage {
    pub uuid: String,
    pub entries: Vec<LsoEntry>,
    /// Empty when the listing is complete.
    #[serde(default)]
    pub continuation_token: String,
}

// ---------------------------------------------------------------------------
// Transform-copy job message
// ---------------------------------------------------------------------------

/// What a transform-copy job operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    /// Explicit object names; non-owners skip names silently.
    List(Vec<String>),
    /// Brace-range template, e.g. `test/a-{0010..0029}`.
    Template(String),
    /// Every object whose name starts with the prefix.
    Prefix(String),
}

impl Selection {
    /// Parse the template variant eagerly; other variants always succeed.
    /// Called on the originator so parse failures reach the user.
    pub fn parse_template(&self) -> Result<Option<Template>, TemplateError> {
        match self {
            Selection::Template(s) => Template::parse(s).map(Some),
            _ => Ok(None),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Selection::List(_))
    }
}

/// Destination-name transformation.
///
/// `to_name(src) = prepend ++ f(src)` where `f` strips a prefix or
/// substitutes one. A non-empty prepend means destination names no longer
/// match source names, which disables the sync-same-name-remote shortcut.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameXform {
    #[serde(default)]
    pub prepend: String,
    #[serde(default)]
    pub strip_prefix: String,
    /// Substitute `subst.0` at the start of the name with `subst.1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subst: Option<(String, String)>,
}

impl NameXform {
    pub fn to_name(&self, src: &str) -> String {
        let base = if let Some((from, to)) = &self.subst {
            match src.strip_prefix(from.as_str()) {
                Some(rest) => format!("{to}{rest}"),
                None => src.to_string(),
            }
        } else {
            src.strip_prefix(self.strip_prefix.as_str())
                .unwrap_or(src)
                .to_string()
        };
        format!("{}{}", self.prepend, base)
    }

    pub fn is_identity(&self) -> bool {
        self.prepend.is_empty() && self.strip_prefix.is_empty() && self.subst.is_none()
    }
}

/// A transform-copy job message. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcoMsg {
    /// Transaction UUID identifying the job cluster-wide.
    pub txn_uuid: String,
    pub bck_from: Bck,
    pub bck_to: Bck,
    pub selection: Selection,
    #[serde(default)]
    pub xform: NameXform,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Named ETL transform; payload sizes become unknown when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etl: Option<String>,
    /// Whether the destination bucket was created on behalf of this job.
    /// Recorded when the job is accepted; cleanup must not infer it.
    #[serde(default)]
    pub dst_was_created: bool,
}

impl TcoMsg {
    pub fn is_etl(&self) -> bool {
        self.etl.is_some()
    }
}
