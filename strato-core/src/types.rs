use crate::error::{Result, StratoError};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SWIFT_USER_META_PREFIX: &str = "x-object-meta-";
pub const S3_USER_META_PREFIX: &str = "x-amz-meta-";
pub const MANIFEST_HEADER: &str = "x-object-manifest";
pub const SLO_HEADER: &str = "x-static-large-object";

/// Tag applied to objects pulled in by the migrator: the provider id the
/// object came from. Its presence distinguishes migrated copies from
/// user writes during deletion reconciliation.
pub const MIGRATED_FROM_HEADER: &str = "x-object-meta-cloud-sync";
/// Source timestamp recorded next to [`MIGRATED_FROM_HEADER`].
pub const SOURCE_TIMESTAMP_HEADER: &str = "x-object-meta-source-x-timestamp";
/// Container-level migration state (`migrating`, `modified`, `src_deleted`).
pub const MIGRATOR_CONTAINER_HEADER: &str = "x-container-sysmeta-cloud-migrator";
/// DLOs have no stable ETag of their own; the computed one is stored here
/// on the remote copy.
pub const DLO_ETAG_KEY: &str = "x-object-meta-strato-dlo-etag";
/// Whole-SLO etag recorded on a multipart remote copy, for the
/// already-uploaded probe when part boundaries differ from segments.
pub const SLO_ETAG_KEY: &str = "x-object-meta-strato-slo-etag";
/// Composite MPU etag preserved on an SLO restored from S3.
pub const REMOTE_ETAG_KEY: &str = "x-object-meta-strato-remote-etag";

pub type UserMetadata = HashMap<String, String>;

/// A local-store timestamp with 10-microsecond resolution, the `X-Timestamp`
/// wire form being `<seconds>.<5 frac digits>` zero-padded to 16 characters.
/// Timestamps synthesized from `Last-Modified` (S3 has nothing better) are
/// flagged so consumers can avoid treating them as authoritative.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timestamp {
    micros: i64,
    #[serde(default)]
    synthesized: bool,
}

impl Timestamp {
    pub fn from_micros(micros: i64) -> Self {
        Self {
            micros,
            synthesized: false,
        }
    }

    /// Floored to whole seconds; S3 listings and `Last-Modified` headers
    /// carry no sub-second resolution we can trust.
    pub fn from_last_modified(when: DateTime<Utc>) -> Self {
        Self {
            micros: when.timestamp() * 1_000_000,
            synthesized: true,
        }
    }

    pub fn now() -> Self {
        Self {
            micros: Utc::now().timestamp_micros(),
            synthesized: false,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        // An offset suffix ("_<hex>") may trail the float form; it orders
        // after the base timestamp but is not preserved here.
        let raw = raw.trim();
        let base = raw.split('_').next().unwrap_or(raw);
        let (secs, frac) = match base.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (base, ""),
        };
        let secs: i64 = secs
            .parse()
            .map_err(|_| StratoError::InvalidRequest(format!("bad timestamp: {}", raw)))?;
        let mut micros = secs * 1_000_000;
        if !frac.is_empty() {
            let padded = format!("{:0<6}", frac);
            let frac_micros: i64 = padded[..6]
                .parse()
                .map_err(|_| StratoError::InvalidRequest(format!("bad timestamp: {}", raw)))?;
            micros += frac_micros;
        }
        Ok(Self {
            micros,
            synthesized: false,
        })
    }

    /// The 16-character normal form the local store expects.
    pub fn internal(&self) -> String {
        let secs = self.micros.div_euclid(1_000_000);
        let frac = self.micros.rem_euclid(1_000_000) / 10;
        format!("{:010}.{:05}", secs, frac)
    }

    pub fn micros(&self) -> i64 {
        self.micros
    }

    pub fn is_synthesized(&self) -> bool {
        self.synthesized
    }

    /// The next representable instant, used when a reconciling delete must
    /// order after the migrated copy it removes.
    pub fn next(&self) -> Self {
        Self {
            micros: self.micros + 10,
            synthesized: self.synthesized,
        }
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.micros == other.micros
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.micros.cmp(&other.micros)
    }
}

/// Everything the engines need to know about one object without holding
/// its body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    pub account: String,
    pub container: String,
    pub name: String,
    pub etag: String,
    pub timestamp: Timestamp,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub metadata: UserMetadata,
    /// Pending expiration (`X-Delete-At`), unix seconds.
    #[serde(default)]
    pub delete_at: Option<i64>,
}

impl ObjectRef {
    pub fn path(&self) -> String {
        format!("{}/{}/{}", self.account, self.container, self.name)
    }

    pub fn is_slo(&self) -> bool {
        self.metadata
            .get(SLO_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn dlo_manifest(&self) -> Option<(&str, &str)> {
        let manifest = self.metadata.get(MANIFEST_HEADER)?;
        manifest.split_once('/')
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloSegment {
    pub path: String,
    pub etag: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<(u64, u64)>,
}

impl SloSegment {
    /// `path` is `/container/object`; splits into the two halves.
    pub fn split_path(&self) -> Result<(&str, &str)> {
        self.path
            .trim_start_matches('/')
            .split_once('/')
            .ok_or_else(|| {
                StratoError::InvalidRequest(format!("bad segment path: {}", self.path))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpuPart {
    pub part_number: u32,
    pub etag: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LargeObjectManifest {
    Slo(Vec<SloSegment>),
    Dlo {
        segments_container: String,
        prefix: String,
    },
    Mpu(Vec<MpuPart>),
}

impl LargeObjectManifest {
    pub fn total_size(&self) -> Option<u64> {
        match self {
            LargeObjectManifest::Slo(segments) => {
                Some(segments.iter().map(|s| s.size_bytes).sum())
            }
            LargeObjectManifest::Dlo { .. } => None,
            LargeObjectManifest::Mpu(parts) => Some(parts.iter().map(|p| p.size_bytes).sum()),
        }
    }
}

pub fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_ascii_lowercase()
}

pub fn etags_match(lhs: &str, rhs: &str) -> bool {
    normalize_etag(lhs) == normalize_etag(rhs)
}

/// Composite etag of an S3 multipart object or a restored SLO:
/// `md5(concat(binary part etags))-N`.
pub fn composite_etag<'a, I>(part_etags: I) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Md5::new();
    let mut count = 0usize;
    for etag in part_etags {
        let binary = hex::decode(normalize_etag(etag))
            .map_err(|_| StratoError::InvalidRequest(format!("non-hex etag: {}", etag)))?;
        hasher.update(&binary);
        count += 1;
    }
    Ok(format!("{}-{}", hex::encode(hasher.finalize()), count))
}

/// The whole-object etag Swift reports for an SLO: hex md5 of the
/// concatenated *hex* segment etags.
pub fn slo_manifest_etag<'a, I>(segment_etags: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Md5::new();
    for etag in segment_etags {
        hasher.update(normalize_etag(etag).as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Parses `<hex>-<parts>` composite etags; plain etags return None.
pub fn mpu_part_count(etag: &str) -> Option<u32> {
    let etag = normalize_etag(etag);
    let (digest, count) = etag.rsplit_once('-')?;
    if digest.is_empty() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    count.parse().ok()
}

/// User metadata comparison is case-insensitive on keys but exact on
/// values; the computed DLO etag key is excluded because only the remote
/// side carries it.
pub fn metadata_synced(local: &UserMetadata, remote: &UserMetadata) -> bool {
    let local_keys: HashMap<String, &str> = local
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .collect();
    let remote_keys: HashMap<String, &str> = remote
        .iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case(DLO_ETAG_KEY))
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .collect();
    local_keys == remote_keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = Timestamp::parse("1500000000.00123").unwrap();
        assert_eq!(ts.internal(), "1500000000.00123");
        assert_eq!(ts.micros(), 1_500_000_000_001_230);
        assert!(!ts.is_synthesized());

        let with_offset = Timestamp::parse("1500000000.00123_3f").unwrap();
        assert_eq!(with_offset, ts);
    }

    #[test]
    fn test_timestamp_from_last_modified_floors() {
        let when = DateTime::parse_from_rfc3339("2017-06-28T12:30:45.987Z")
            .unwrap()
            .with_timezone(&Utc);
        let ts = Timestamp::from_last_modified(when);
        assert!(ts.is_synthesized());
        assert_eq!(ts.internal(), format!("{:010}.00000", when.timestamp()));
    }

    #[test]
    fn test_etag_normalization() {
        assert!(etags_match("\"ABCDEF\"", "abcdef"));
        assert!(!etags_match("abcdef", "abcdee"));
    }

    #[test]
    fn test_composite_etag() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        let empty = "d41d8cd98f00b204e9800998ecf8427e";
        let composite = composite_etag([empty, empty]).unwrap();
        assert!(composite.ends_with("-2"));
        assert_eq!(composite.len(), 32 + 2);
    }

    #[test]
    fn test_mpu_part_count() {
        assert_eq!(mpu_part_count("d41d8cd98f00b204e9800998ecf8427e-3"), Some(3));
        assert_eq!(mpu_part_count("\"d41d8cd98f00b204e9800998ecf8427e-12\""), Some(12));
        assert_eq!(mpu_part_count("d41d8cd98f00b204e9800998ecf8427e"), None);
        assert_eq!(mpu_part_count("not-hex-9"), None);
    }

    #[test]
    fn test_metadata_synced_ignores_case_and_dlo_etag() {
        let mut local = UserMetadata::new();
        local.insert("X-Object-Meta-Color".to_string(), "blue".to_string());
        let mut remote = UserMetadata::new();
        remote.insert("x-object-meta-color".to_string(), "blue".to_string());
        remote.insert(DLO_ETAG_KEY.to_string(), "abc".to_string());
        assert!(metadata_synced(&local, &remote));

        remote.insert("x-object-meta-extra".to_string(), "1".to_string());
        assert!(!metadata_synced(&local, &remote));
    }
}
