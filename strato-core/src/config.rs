use crate::error::{Result, StratoError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Swift's single-object ceiling; larger remote objects are restored as SLOs.
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024 + 2;
/// S3 rejects non-final multipart parts below this.
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
const DEFAULT_SEGMENT_DELAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Swift,
    S3,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::S3
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub containers: Vec<SyncProfile>,
    #[serde(default)]
    pub migrations: Vec<MigrationProfile>,
    #[serde(default)]
    pub migrator_settings: Option<MigratorSettings>,

    /// Base URL of the local cluster's proxy, e.g. `http://127.0.0.1:8080`.
    pub local_endpoint: String,
    #[serde(default)]
    pub devices: Option<String>,
    #[serde(default = "default_items_chunk")]
    pub items_chunk: usize,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    pub status_dir: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_workers")]
    pub enumerator_workers: usize,
    #[serde(default = "default_processes")]
    pub processes: usize,
    #[serde(default)]
    pub process: usize,
    #[serde(default)]
    pub statsd_host: Option<String>,
    #[serde(default = "default_statsd_port")]
    pub statsd_port: u16,
    #[serde(default)]
    pub statsd_prefix: Option<String>,
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout: f64,

    #[serde(flatten, skip_serializing)]
    pub unknown: HashMap<String, serde_json::Value>,
}

/// One (account, container) → (endpoint, bucket) binding with its behavior
/// flags. `container = "/*"` maps every container under the account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProfile {
    pub account: String,
    pub container: String,
    pub aws_endpoint: String,
    pub aws_identity: String,
    pub aws_secret: String,
    pub aws_bucket: String,
    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub remote_account: Option<String>,
    #[serde(default)]
    pub convert_dlo: bool,
    #[serde(default)]
    pub copy_after: u64,
    #[serde(default)]
    pub exclude_pattern: String,
    #[serde(default = "default_true")]
    pub propagate_delete: bool,
    #[serde(default)]
    pub propagate_expiration: bool,
    #[serde(default)]
    pub propagate_expiration_offset: i64,
    #[serde(default)]
    pub remote_delete_after: u64,
    #[serde(default = "default_segment_delay")]
    pub remote_delete_after_addition: u64,
    #[serde(default = "default_true")]
    pub retain_local: bool,
    #[serde(default)]
    pub retain_local_segments: bool,
    #[serde(default)]
    pub storage_policy: Option<String>,
    #[serde(default)]
    pub sync_container_acl: bool,
    #[serde(default)]
    pub sync_container_metadata: bool,
    #[serde(default)]
    pub min_segment_size: Option<u64>,
    #[serde(default)]
    pub merge_namespaces: bool,
    #[serde(default)]
    pub custom_prefix: Option<String>,
    #[serde(default)]
    pub selection_criteria: Option<MetadataCondition>,

    #[serde(flatten, skip_serializing)]
    pub unknown: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationProfile {
    pub account: String,
    #[serde(default)]
    pub container: Option<String>,
    pub aws_endpoint: String,
    pub aws_identity: String,
    pub aws_secret: String,
    pub aws_bucket: String,
    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub remote_account: Option<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub older_than: Option<u64>,
    #[serde(default)]
    pub storage_policy: Option<String>,
    #[serde(default)]
    pub propagate_account_metadata: bool,
    #[serde(default)]
    pub metadata_conditions: Option<MetadataCondition>,
    #[serde(default)]
    pub merge_namespaces: bool,

    #[serde(flatten, skip_serializing)]
    pub unknown: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigratorSettings {
    pub status_file: PathBuf,
    #[serde(default = "default_items_chunk")]
    pub items_chunk: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_migrator_poll")]
    pub poll_interval: f64,
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,
    #[serde(default = "default_ring_name")]
    pub ring_name: String,
    #[serde(default = "default_processes")]
    pub processes: usize,
    #[serde(default)]
    pub process: usize,
    #[serde(default)]
    pub statsd_prefix: Option<String>,
}

/// Boolean combination of metadata predicates evaluated against an
/// object's user metadata. Leaves match a key against one of several
/// accepted values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataCondition {
    And(Vec<MetadataCondition>),
    Or(Vec<MetadataCondition>),
    Not(Box<MetadataCondition>),
    #[serde(untagged)]
    Match {
        key: String,
        #[serde(default)]
        values: Vec<String>,
    },
}

impl MetadataCondition {
    pub fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        match self {
            MetadataCondition::And(conds) => conds.iter().all(|c| c.matches(metadata)),
            MetadataCondition::Or(conds) => conds.iter().any(|c| c.matches(metadata)),
            MetadataCondition::Not(cond) => !cond.matches(metadata),
            MetadataCondition::Match { key, values } => {
                let found = metadata
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v.as_str());
                match found {
                    Some(value) => values.is_empty() || values.iter().any(|v| v == value),
                    None => false,
                }
            }
        }
    }
}

impl SyncProfile {
    pub fn per_account(&self) -> bool {
        self.container == "/*"
    }

    /// A profile resolved to one concrete container under a `/*` mapping.
    pub fn for_container(&self, container: &str) -> SyncProfile {
        let mut profile = self.clone();
        profile.container = container.to_string();
        profile
    }

    pub fn exclude_regex(&self) -> Result<Option<Regex>> {
        if self.exclude_pattern.is_empty() {
            return Ok(None);
        }
        Regex::new(&self.exclude_pattern).map(Some).map_err(|e| {
            StratoError::Config(format!(
                "bad exclude_pattern for {}/{}: {}",
                self.account, self.container, e
            ))
        })
    }

    fn validate(&self) -> Result<()> {
        if self.account.is_empty() || self.container.is_empty() {
            return Err(StratoError::Config(
                "profile requires account and container".to_string(),
            ));
        }
        if self.aws_bucket.is_empty() {
            return Err(StratoError::Config(format!(
                "profile {}/{} requires aws_bucket",
                self.account, self.container
            )));
        }
        if self.sync_container_acl && !self.sync_container_metadata {
            return Err(StratoError::Config(format!(
                "profile {}/{}: sync_container_acl requires sync_container_metadata",
                self.account, self.container
            )));
        }
        if self.protocol == Protocol::S3
            && (self.propagate_expiration || self.sync_container_metadata)
        {
            return Err(StratoError::Config(format!(
                "profile {}/{}: expiration and container metadata propagation are Swift-only",
                self.account, self.container
            )));
        }
        self.exclude_regex()?;
        for key in self.unknown.keys() {
            tracing::warn!(
                "Unknown key '{}' in profile {}/{} ignored",
                key,
                self.account,
                self.container
            );
        }
        Ok(())
    }
}

impl MigrationProfile {
    pub fn all_buckets(&self) -> bool {
        self.aws_bucket == "/*"
    }

    pub fn local_container(&self) -> &str {
        // Bucket name doubles as the local container unless remapped.
        self.container.as_deref().unwrap_or(&self.aws_bucket)
    }

    pub fn for_bucket(&self, bucket: &str) -> MigrationProfile {
        let mut profile = self.clone();
        profile.aws_bucket = bucket.to_string();
        profile.container = Some(bucket.to_string());
        profile
    }

    /// Identity ignoring the fields that change between passes (wildcard
    /// expansion) or must never persist (the secret).
    pub fn same_migration(&self, other: &MigrationProfile) -> bool {
        let wildcard = self.all_buckets() || other.all_buckets();
        self.account == other.account
            && self.aws_endpoint == other.aws_endpoint
            && self.aws_identity == other.aws_identity
            && self.protocol == other.protocol
            && (wildcard || self.aws_bucket == other.aws_bucket)
            && (wildcard || self.local_container() == other.local_container())
    }

    fn validate(&self) -> Result<()> {
        if self.account.is_empty() || self.aws_bucket.is_empty() {
            return Err(StratoError::Config(
                "migration requires account and aws_bucket".to_string(),
            ));
        }
        if self.all_buckets() && self.container.is_some() {
            return Err(StratoError::Config(format!(
                "migration for {}: cannot remap containers with aws_bucket = /*",
                self.account
            )));
        }
        for key in self.unknown.keys() {
            tracing::warn!("Unknown key '{}' in migration for {} ignored", key, self.account);
        }
        Ok(())
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(
                path.to_str().ok_or_else(|| {
                    StratoError::Config(format!("non-utf8 config path: {}", path.display()))
                })?,
                config::FileFormat::Json,
            ))
            .add_source(config::Environment::with_prefix("STRATO"))
            .build()
            .map_err(|e| StratoError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| StratoError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.process >= self.processes {
            return Err(StratoError::Config(format!(
                "process index {} out of range for {} processes",
                self.process, self.processes
            )));
        }
        for profile in &self.containers {
            profile.validate()?;
        }
        for migration in &self.migrations {
            migration.validate()?;
        }
        if !self.migrations.is_empty() && self.migrator_settings.is_none() {
            return Err(StratoError::Config(
                "migrations configured without migrator_settings".to_string(),
            ));
        }
        for key in self.unknown.keys() {
            tracing::warn!("Unknown top-level config key '{}' ignored", key);
        }
        Ok(())
    }

    /// The sync profile covering (account, container): an exact entry wins
    /// over the account's `/*` entry.
    pub fn sync_profile_for(&self, account: &str, container: &str) -> Option<&SyncProfile> {
        self.containers
            .iter()
            .find(|p| p.account == account && p.container == container)
            .or_else(|| {
                self.containers
                    .iter()
                    .find(|p| p.account == account && p.per_account())
            })
    }

    pub fn migration_for(&self, account: &str, container: &str) -> Option<&MigrationProfile> {
        self.migrations
            .iter()
            .find(|m| m.account == account && m.local_container() == container)
            .or_else(|| {
                self.migrations
                    .iter()
                    .find(|m| m.account == account && m.all_buckets())
            })
    }
}

/// Re-reads the config when the file's mtime changes. The daemons and the
/// shunt poll this instead of restarting.
pub struct ConfigWatcher {
    path: PathBuf,
    mtime: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf) -> Self {
        Self { path, mtime: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a freshly parsed config when the file changed since the last
    /// call. A config that fails to parse is reported and skipped; the
    /// caller keeps serving the previous one.
    pub fn poll(&mut self) -> Option<Config> {
        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if mtime == self.mtime {
            return None;
        }
        self.mtime = mtime;
        match Config::from_file(&self.path) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::error!("Config reload failed, keeping previous: {}", e);
                None
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_items_chunk() -> usize {
    1000
}

fn default_poll_interval() -> f64 {
    60.0
}

fn default_migrator_poll() -> f64 {
    5.0
}

fn default_workers() -> usize {
    10
}

fn default_processes() -> usize {
    1
}

fn default_statsd_port() -> u16 {
    8125
}

fn default_segment_size() -> u64 {
    100_000_000
}

fn default_segment_delay() -> u64 {
    DEFAULT_SEGMENT_DELAY_SECS
}

fn default_ring_name() -> String {
    "container".to_string()
}

fn default_max_object_size() -> u64 {
    DEFAULT_MAX_OBJECT_SIZE
}

fn default_graceful_timeout() -> f64 {
    15.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_profile() -> SyncProfile {
        serde_json::from_value(serde_json::json!({
            "account": "AUTH_a",
            "container": "c",
            "aws_endpoint": "https://s3.example.com",
            "aws_identity": "id",
            "aws_secret": "secret",
            "aws_bucket": "bucket",
            "protocol": "s3"
        }))
        .unwrap()
    }

    #[test]
    fn test_profile_defaults() {
        let profile = base_profile();
        assert!(profile.propagate_delete);
        assert!(profile.retain_local);
        assert!(!profile.retain_local_segments);
        assert!(!profile.convert_dlo);
        assert_eq!(profile.remote_delete_after_addition, 86400);
        profile.validate().unwrap();
    }

    #[test]
    fn test_acl_requires_metadata() {
        let mut profile = base_profile();
        profile.protocol = Protocol::Swift;
        profile.sync_container_acl = true;
        assert!(profile.validate().is_err());
        profile.sync_container_metadata = true;
        profile.validate().unwrap();
    }

    #[test]
    fn test_swift_only_flags_rejected_for_s3() {
        let mut profile = base_profile();
        profile.propagate_expiration = true;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_bad_exclude_pattern() {
        let mut profile = base_profile();
        profile.exclude_pattern = "[".to_string();
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_wildcard_profile_resolution() {
        let profile = base_profile();
        let mut wildcard = base_profile();
        wildcard.container = "/*".to_string();
        assert!(wildcard.per_account());
        let resolved = wildcard.for_container("photos");
        assert_eq!(resolved.container, "photos");
        assert!(!resolved.per_account());
        assert!(!profile.per_account());
    }

    #[test]
    fn test_metadata_condition() {
        let cond: MetadataCondition = serde_json::from_value(serde_json::json!({
            "and": [
                {"key": "x-object-meta-tier", "values": ["cold"]},
                {"not": {"key": "x-object-meta-pinned", "values": []}}
            ]
        }))
        .unwrap();

        let mut meta = HashMap::new();
        meta.insert("X-Object-Meta-Tier".to_string(), "cold".to_string());
        assert!(cond.matches(&meta));

        meta.insert("x-object-meta-pinned".to_string(), "yes".to_string());
        assert!(!cond.matches(&meta));
    }

    #[test]
    fn test_same_migration_wildcard() {
        let base: MigrationProfile = serde_json::from_value(serde_json::json!({
            "account": "AUTH_a",
            "aws_endpoint": "https://s3.example.com",
            "aws_identity": "id",
            "aws_secret": "secret",
            "aws_bucket": "/*",
            "protocol": "s3"
        }))
        .unwrap();
        let resolved = base.for_bucket("b1");
        assert!(base.same_migration(&resolved));
        assert!(!resolved.same_migration(&base.for_bucket("b2")));
    }
}
