//! Cluster and per-bucket feature flags.
//!
//! A 64-bit bitfield on the cluster configuration, inherited by buckets
//! unless overridden (see [`BckProps::effective_features`]). Enumerated
//! names are exposed at the API edge; the bits travel on the wire.
//!
//! [`BckProps::effective_features`]: crate::BckProps::effective_features

/// Serve the S3 API at the URL root instead of under the `/s3` prefix.
pub const S3_API_VIA_ROOT: u64 = 1 << 0;

/// Skip loading version/checksum metadata on object access.
pub const SKIP_LOADING_VC_MD: u64 = 1 << 1;

/// Accept presigned S3 requests.
pub const PRESIGNED_S3_REQ: u64 = 1 << 2;

/// fsync object files on PUT before acknowledging.
pub const FSYNC_PUT: u64 = 1 << 3;

const ALL: &[(u64, &str)] = &[
    (S3_API_VIA_ROOT, "Provide-S3-API-via-Root"),
    (SKIP_LOADING_VC_MD, "Skip-Loading-VersionChecksum-MD"),
    (PRESIGNED_S3_REQ, "Presigned-S3-Req"),
    (FSYNC_PUT, "Fsync-PUT"),
];

/// Names of all flags set in `bits`, in declaration order.
pub fn names(bits: u64) -> Vec<&'static str> {
    ALL.iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Look up a flag bit by its enumerated name.
pub fn from_name(name: &str) -> Option<u64> {
    ALL.iter().find(|(_, n)| *n == name).map(|(bit, _)| *bit)
}

/// Parse a list of flag names into a bitfield; unknown names are reported.
pub fn parse(names: &[String]) -> Result<u64, String> {
    let mut bits = 0;
    for name in names {
        match from_name(name) {
            Some(bit) => bits |= bit,
            None => return Err(format!("unknown feature flag {name:?}")),
        }
    }
    Ok(bits)
}
