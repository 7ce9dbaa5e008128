//! XML envelopes for the S3 API, serialized via `quick-xml` + `serde`.

use atoll_types::msg::LsoEntry;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Convert unix nanoseconds to ISO 8601 (e.g. `2024-01-15T12:30:00Z`).
pub(crate) fn nanos_to_iso8601(ns: i64) -> String {
    DateTime::<Utc>::from_timestamp(ns.max(0) / 1_000_000_000, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Strip characters illegal in XML 1.0.
fn sanitize_for_xml(s: &str) -> String {
    s.chars()
        .filter(|&c| matches!(c, '\t' | '\n' | '\r' | '\u{20}'..))
        .collect()
}

// -----------------------------------------------------------------------
// Error envelope
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "Error")]
struct ErrorXml<'a> {
    #[serde(rename = "Code")]
    code: &'a str,
    #[serde(rename = "Message")]
    message: String,
}

pub(crate) fn error_xml(code: &str, message: &str) -> String {
    quick_xml::se::to_string(&ErrorXml {
        code,
        message: sanitize_for_xml(message),
    })
    .expect("Error envelope contains only safe strings")
}

// -----------------------------------------------------------------------
// ListAllMyBucketsResult (GET /)
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "ListAllMyBucketsResult")]
struct ListAllMyBucketsResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Owner")]
    owner: Owner,
    #[serde(rename = "Buckets")]
    buckets: Buckets,
}

#[derive(Serialize)]
struct Owner {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Serialize)]
struct Buckets {
    #[serde(rename = "Bucket", default)]
    bucket: Vec<BucketEntryXml>,
}

#[derive(Serialize)]
struct BucketEntryXml {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CreationDate")]
    creation_date: String,
}

pub(crate) fn list_all_my_buckets(owner_id: &str, buckets: &[(String, u64)]) -> String {
    quick_xml::se::to_string(&ListAllMyBucketsResult {
        xmlns: S3_XMLNS,
        owner: Owner {
            id: owner_id.to_string(),
        },
        buckets: Buckets {
            bucket: buckets
                .iter()
                .map(|(name, created_ns)| BucketEntryXml {
                    name: name.clone(),
                    creation_date: nanos_to_iso8601(*created_ns as i64),
                })
                .collect(),
        },
    })
    .expect("ListAllMyBucketsResult contains only safe strings")
}

// -----------------------------------------------------------------------
// ListBucketResult (ListObjectsV2)
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "ListBucketResult")]
struct ListBucketResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Prefix")]
    prefix: String,
    #[serde(rename = "KeyCount")]
    key_count: usize,
    #[serde(rename = "MaxKeys")]
    max_keys: usize,
    #[serde(rename = "IsTruncated")]
    is_truncated: bool,
    #[serde(rename = "ContinuationToken", skip_serializing_if = "Option::is_none")]
    continuation_token: Option<String>,
    #[serde(
        rename = "NextContinuationToken",
        skip_serializing_if = "Option::is_none"
    )]
    next_continuation_token: Option<String>,
    #[serde(rename = "Contents", default)]
    contents: Vec<Contents>,
}

#[derive(Serialize)]
struct Contents {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "LastModified")]
    last_modified: String,
    #[serde(rename = "ETag")]
    etag: String,
}

pub(crate) fn list_objects_v2(
    bucket: &str,
    prefix: &str,
    entries: &[LsoEntry],
    max_keys: usize,
    continuation_token: Option<String>,
    next_continuation_token: Option<String>,
) -> String {
    quick_xml::se::to_string(&ListBucketResult {
        xmlns: S3_XMLNS,
        name: bucket.to_string(),
        prefix: prefix.to_string(),
        key_count: entries.len(),
        max_keys,
        is_truncated: next_continuation_token.is_some(),
        continuation_token,
        next_continuation_token,
        contents: entries
            .iter()
            .map(|e| Contents {
                key: sanitize_for_xml(&e.name),
                size: e.size,
                last_modified: nanos_to_iso8601(e.atime_ns),
                etag: format!("\"{}\"", e.checksum),
            })
            .collect(),
    })
    .expect("ListBucketResult with sanitized keys cannot fail")
}

// -----------------------------------------------------------------------
// VersioningConfiguration
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "VersioningConfiguration")]
struct VersioningConfigurationXml {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Status", skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
}

pub(crate) fn versioning_configuration(enabled: bool) -> String {
    quick_xml::se::to_string(&VersioningConfigurationXml {
        xmlns: S3_XMLNS,
        status: if enabled { Some("Enabled") } else { Some("Suspended") },
    })
    .expect("VersioningConfiguration contains only safe strings")
}

#[derive(Deserialize)]
#[serde(rename = "VersioningConfiguration")]
struct VersioningRequest {
    #[serde(rename = "Status", default)]
    status: String,
}

/// Parse a PUT `?versioning` body; returns the requested enabled state.
pub(crate) fn parse_versioning_request(body: &str) -> Result<bool, String> {
    let req: VersioningRequest =
        quick_xml::de::from_str(body).map_err(|e| format!("bad VersioningConfiguration: {e}"))?;
    match req.status.as_str() {
        "Enabled" => Ok(true),
        "Suspended" | "" => Ok(false),
        other => Err(format!("bad versioning status {other:?}")),
    }
}

// -----------------------------------------------------------------------
// Multi-delete (POST /{bucket}?delete)
// -----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename = "Delete")]
struct DeleteRequest {
    #[serde(rename = "Object", default)]
    objects: Vec<DeleteObjectXml>,
}

#[derive(Debug, Deserialize)]
struct DeleteObjectXml {
    #[serde(rename = "Key")]
    key: String,
}

/// Parse the keys of a multi-delete body. An empty body is a valid,
/// empty request.
pub(crate) fn parse_multi_delete(body: &str) -> Result<Vec<String>, String> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let req: DeleteRequest =
        quick_xml::de::from_str(body).map_err(|e| format!("bad Delete body: {e}"))?;
    Ok(req.objects.into_iter().map(|o| o.key).collect())
}

#[derive(Serialize)]
#[serde(rename = "DeleteResult")]
struct DeleteResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Deleted", default)]
    deleted: Vec<DeletedXml>,
}

#[derive(Serialize)]
struct DeletedXml {
    #[serde(rename = "Key")]
    key: String,
}

/// The response lists every requested key as deleted: targets report a
/// single aggregate result, so per-key failures are not available here.
pub(crate) fn delete_result(keys: &[String]) -> String {
    quick_xml::se::to_string(&DeleteResult {
        xmlns: S3_XMLNS,
        deleted: keys
            .iter()
            .map(|k| DeletedXml {
                key: sanitize_for_xml(k),
            })
            .collect(),
    })
    .expect("DeleteResult with sanitized keys cannot fail")
}

// -----------------------------------------------------------------------
// ListMultipartUploadsResult (serialized on targets, parsed on proxies)
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "ListMultipartUploadsResult")]
pub(crate) struct ListMultipartUploadsResult {
    #[serde(rename = "@xmlns", skip_deserializing)]
    #[serde(default = "xmlns_default")]
    xmlns: &'static str,
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Upload", default)]
    pub uploads: Vec<UploadXml>,
}

fn xmlns_default() -> &'static str {
    S3_XMLNS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct UploadXml {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "UploadId")]
    pub upload_id: String,
}

pub(crate) fn list_multipart_uploads(bucket: &str, uploads: Vec<UploadXml>) -> String {
    quick_xml::se::to_string(&ListMultipartUploadsResult {
        xmlns: S3_XMLNS,
        bucket: bucket.to_string(),
        uploads,
    })
    .expect("ListMultipartUploadsResult contains only safe strings")
}

/// Parse one target's answer during the fan-out aggregation.
pub(crate) fn parse_multipart_uploads(body: &str) -> Result<ListMultipartUploadsResult, String> {
    quick_xml::de::from_str(body).map_err(|e| format!("bad ListMultipartUploadsResult: {e}"))
}

// -----------------------------------------------------------------------
// CopyObjectResult
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "CopyObjectResult")]
struct CopyObjectResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "ETag")]
    etag: String,
}

pub(crate) fn copy_object_result(etag: &str) -> String {
    quick_xml::se::to_string(&CopyObjectResult {
        xmlns: S3_XMLNS,
        etag: format!("\"{etag}\""),
    })
    .expect("CopyObjectResult contains only safe strings")
}

// -----------------------------------------------------------------------
// InitiateMultipartUploadResult / CompleteMultipartUpload (target side)
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "InitiateMultipartUploadResult")]
struct InitiateMultipartUploadResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Bucket")]
    bucket: String,
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "UploadId")]
    upload_id: String,
}

pub(crate) fn initiate_multipart_upload(bucket: &str, key: &str, upload_id: &str) -> String {
    quick_xml::se::to_string(&InitiateMultipartUploadResult {
        xmlns: S3_XMLNS,
        bucket: bucket.to_string(),
        key: key.to_string(),
        upload_id: upload_id.to_string(),
    })
    .expect("InitiateMultipartUploadResult contains only safe strings")
}

#[derive(Serialize)]
#[serde(rename = "CompleteMultipartUploadResult")]
struct CompleteMultipartUploadResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Bucket")]
    bucket: String,
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "ETag")]
    etag: String,
}

pub(crate) fn complete_multipart_upload(bucket: &str, key: &str, etag: &str) -> String {
    quick_xml::se::to_string(&CompleteMultipartUploadResult {
        xmlns: S3_XMLNS,
        bucket: bucket.to_string(),
        key: key.to_string(),
        etag: format!("\"{etag}\""),
    })
    .expect("CompleteMultipartUploadResult contains only safe strings")
}

#[derive(Deserialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartRequest {
    #[serde(rename = "Part", default)]
    parts: Vec<PartInfo>,
}

#[derive(Deserialize)]
struct PartInfo {
    #[serde(rename = "PartNumber")]
    part_number: u16,
}

/// Parse part numbers from a CompleteMultipartUpload body.
pub(crate) fn parse_complete_multipart(body: &str) -> Vec<u16> {
    let Ok(req) = quick_xml::de::from_str::<CompleteMultipartRequest>(body) else {
        return Vec::new();
    };
    let mut parts: Vec<u16> = req.parts.into_iter().map(|p| p.part_number).collect();
    parts.sort();
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso8601() {
        assert_eq!(nanos_to_iso8601(0), "1970-01-01T00:00:00Z");
        assert_eq!(nanos_to_iso8601(1_705_321_800 * 1_000_000_000), "2024-01-15T12:30:00Z");
        // Missing/negative timestamps clamp to the epoch.
        assert_eq!(nanos_to_iso8601(-5), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_parse_multi_delete() {
        let body = r#"<Delete>
            <Object><Key>k1</Key></Object>
            <Object><Key>k2</Key></Object>
            <Object><Key>k3</Key></Object>
        </Delete>"#;
        assert_eq!(parse_multi_delete(body).unwrap(), vec!["k1", "k2", "k3"]);
        assert!(parse_multi_delete("").unwrap().is_empty());
        assert!(parse_multi_delete("  \n ").unwrap().is_empty());
        assert!(parse_multi_delete("<not-xml").is_err());
    }

    #[test]
    fn test_delete_result_counts_every_key() {
        let keys = vec!["a".to_string(), "b".to_string()];
        let xml = delete_result(&keys);
        assert_eq!(xml.matches("<Deleted>").count(), 2);
        assert!(xml.contains("<Key>a</Key>"));
        assert!(xml.contains("<Key>b</Key>"));
    }

    #[test]
    fn test_multipart_uploads_roundtrip() {
        let xml = list_multipart_uploads(
            "b1",
            vec![UploadXml {
                key: "big.bin".to_string(),
                upload_id: "u-1".to_string(),
            }],
        );
        let parsed = parse_multipart_uploads(&xml).unwrap();
        assert_eq!(parsed.bucket, "b1");
        assert_eq!(parsed.uploads.len(), 1);
        assert_eq!(parsed.uploads[0].key, "big.bin");
    }

    #[test]
    fn test_versioning_roundtrip() {
        assert!(parse_versioning_request(&versioning_configuration(true)).unwrap());
        assert!(!parse_versioning_request(&versioning_configuration(false)).unwrap());
        assert!(parse_versioning_request("<junk/>").is_err());
    }

    #[test]
    fn test_list_objects_v2_envelope() {
        let entries = vec![LsoEntry {
            name: "k/1".to_string(),
            size: 10,
            atime_ns: 1_705_321_800 * 1_000_000_000,
            checksum: "abc".to_string(),
        }];
        let xml = list_objects_v2("b1", "k/", &entries, 1000, None, Some("k/1".to_string()));
        assert!(xml.contains("<Name>b1</Name>"));
        assert!(xml.contains("<KeyCount>1</KeyCount>"));
        assert!(xml.contains("<IsTruncated>true</IsTruncated>"));
        assert!(xml.contains("<NextContinuationToken>k/1</NextContinuationToken>"));
        assert!(xml.contains("<ETag>\"abc\"</ETag>"));
    }

    #[test]
    fn test_list_buckets_envelope() {
        let xml = list_all_my_buckets("atoll", &[("b1".to_string(), 0)]);
        assert!(xml.contains("<ListAllMyBucketsResult"));
        assert!(xml.contains("<Name>b1</Name>"));
    }
}
