use crate::config::{MigrationProfile, Protocol, SyncProfile};
use crate::error::{Result, StratoError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Per-(profile, container) sync cursor and counters. Never contains
/// credentials; the profile itself stays in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusRecord {
    pub last_row: u64,
    pub verified_row: u64,
    pub bytes_count: u64,
    pub scan_count: u64,
    pub moved_count: u64,
    #[serde(default)]
    pub aux: Option<String>,
    #[serde(default)]
    pub all_buckets: bool,
}

impl StatusRecord {
    fn check(&self) -> Result<()> {
        if self.verified_row > self.last_row {
            return Err(StratoError::Internal(format!(
                "verified_row {} > last_row {}",
                self.verified_row, self.last_row
            )));
        }
        Ok(())
    }
}

/// Sync status files live at `<status_dir>/<account>/<container>`. Writes
/// go through a temp file and an atomic rename; a file that does not parse
/// is renamed aside and treated as absent so the scan restarts.
pub struct SyncStatusStore {
    status_dir: PathBuf,
}

impl SyncStatusStore {
    pub fn new(status_dir: PathBuf) -> Self {
        Self { status_dir }
    }

    fn record_path(&self, account: &str, container: &str) -> PathBuf {
        self.status_dir.join(account).join(container)
    }

    pub async fn load(&self, account: &str, container: &str) -> Result<Option<StatusRecord>> {
        let path = self.record_path(account, container);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<StatusRecord>(&raw) {
            Ok(record) => {
                record.check()?;
                Ok(Some(record))
            }
            Err(e) => {
                tracing::warn!(
                    "Corrupt status file {}: {}. Quarantining and rescanning.",
                    path.display(),
                    e
                );
                quarantine(&path).await?;
                Ok(None)
            }
        }
    }

    pub async fn save(&self, account: &str, container: &str, record: &StatusRecord) -> Result<()> {
        record.check()?;
        let path = self.record_path(account, container);
        write_atomic(&path, &serde_json::to_vec(record)?).await
    }

    /// Drops status files whose profile no longer exists in the config.
    /// Runs once at daemon startup.
    pub async fn purge_stale(&self, profiles: &[SyncProfile]) -> Result<usize> {
        let mut purged = 0usize;
        let mut accounts = match fs::read_dir(&self.status_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(account_entry) = accounts.next_entry().await? {
            let account = account_entry.file_name().to_string_lossy().to_string();
            if !account_entry.file_type().await?.is_dir() {
                continue;
            }
            let mut containers = fs::read_dir(account_entry.path()).await?;
            while let Some(container_entry) = containers.next_entry().await? {
                let container = container_entry.file_name().to_string_lossy().to_string();
                if container.contains(".corrupt.") || container.ends_with(".tmp") {
                    continue;
                }
                let covered = profiles.iter().any(|p| {
                    p.account == account && (p.per_account() || p.container == container)
                });
                if !covered {
                    fs::remove_file(container_entry.path()).await?;
                    tracing::info!("Purged stale status for {}/{}", account, container);
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }
}

/// Identity of a migration inside the status list. Deliberately excludes
/// the secret so credentials never land in status files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationKey {
    pub account: String,
    pub aws_endpoint: String,
    pub aws_identity: String,
    pub aws_bucket: String,
    pub container: String,
    pub protocol: Protocol,
}

impl MigrationKey {
    pub fn of(profile: &MigrationProfile) -> Self {
        Self {
            account: profile.account.clone(),
            aws_endpoint: profile.aws_endpoint.clone(),
            aws_identity: profile.aws_identity.clone(),
            aws_bucket: profile.aws_bucket.clone(),
            container: profile.local_container().to_string(),
            protocol: profile.protocol,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub marker: String,
    /// Marker from the pass before this one. Pruning only considers keys
    /// below the smaller of the two so misaligned pages never delete an
    /// object both stores hold.
    #[serde(default)]
    pub prev_marker: String,
    pub moved_count: u64,
    pub scanned_count: u64,
    pub bytes_count: u64,
    /// Migrated objects missing from the remote listing last pass; a
    /// second consecutive absence lets the pruner act.
    #[serde(default)]
    pub pending_prune: Vec<String>,
    #[serde(default)]
    pub finished: Option<f64>,
    #[serde(default)]
    pub last_moved_count: u64,
    #[serde(default)]
    pub last_scanned_count: u64,
    #[serde(default)]
    pub last_bytes_count: u64,
    #[serde(default)]
    pub last_finished: Option<f64>,
}

impl MigrationStatus {
    /// Fold one pass's counts in. A reset pass (full rescan) rolls the
    /// current counters into the `last_` set first, unless nothing moved
    /// and the scan counts repeat.
    pub fn record_pass(
        &mut self,
        marker: String,
        moved: u64,
        scanned: u64,
        bytes: u64,
        reset: bool,
        now: f64,
    ) {
        if reset {
            let overwrite_last = match (self.finished, self.last_finished) {
                (Some(_), Some(_)) => {
                    self.last_moved_count != 0 || self.scanned_count != self.last_scanned_count
                }
                (Some(_), None) => true,
                _ => false,
            };
            if overwrite_last {
                self.last_moved_count = self.moved_count;
                self.last_scanned_count = self.scanned_count;
                self.last_bytes_count = self.bytes_count;
                self.last_finished = self.finished;
            }
            self.moved_count = moved;
            self.scanned_count = scanned;
            self.bytes_count = bytes;
        } else {
            self.moved_count += moved;
            self.scanned_count += scanned;
            self.bytes_count += bytes;
        }
        self.prev_marker = std::mem::replace(&mut self.marker, marker);
        self.finished = Some(now);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MigrationStatusEntry {
    #[serde(flatten)]
    key: MigrationKey,
    status: MigrationStatus,
}

/// All migrations' status in one file, mirroring the sync store's
/// temp-write + rename and quarantine behavior.
pub struct MigrationStatusList {
    path: PathBuf,
    entries: Vec<MigrationStatusEntry>,
}

impl MigrationStatusList {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let entries = match fs::read(&path).await {
            Ok(raw) if raw.is_empty() => Vec::new(),
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        "Corrupt migrator status {}: {}. Quarantining and rescanning.",
                        path.display(),
                        e
                    );
                    quarantine(&path).await?;
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries })
    }

    pub fn get(&self, key: &MigrationKey) -> MigrationStatus {
        self.entries
            .iter()
            .find(|e| &e.key == key)
            .map(|e| e.status.clone())
            .unwrap_or_default()
    }

    pub async fn put(&mut self, key: MigrationKey, status: MigrationStatus) -> Result<()> {
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => entry.status = status,
            None => self.entries.push(MigrationStatusEntry { key, status }),
        }
        self.flush().await
    }

    /// Keeps only the migrations handled this cycle; removed config entries
    /// take their status with them.
    pub async fn prune(&mut self, handled: &[MigrationKey]) -> Result<()> {
        self.entries.retain(|e| handled.contains(&e.key));
        self.flush().await
    }

    async fn flush(&self) -> Result<()> {
        write_atomic(&self.path, &serde_json::to_vec(&self.entries)?).await
    }
}

async fn quarantine(path: &Path) -> Result<()> {
    // Appended, not substituted: container names may contain dots.
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let aside = path.with_file_name(format!(
        "{}.corrupt.{}",
        name,
        chrono::Utc::now().timestamp()
    ));
    fs::rename(path, &aside).await?;
    Ok(())
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!("{}.{}.tmp", name, ulid::Ulid::new()));
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStatusStore::new(dir.path().to_path_buf());

        assert!(store.load("AUTH_a", "c").await.unwrap().is_none());

        let record = StatusRecord {
            last_row: 42,
            verified_row: 40,
            bytes_count: 1024,
            scan_count: 10,
            moved_count: 3,
            aux: None,
            all_buckets: false,
        };
        store.save("AUTH_a", "c", &record).await.unwrap();
        let loaded = store.load("AUTH_a", "c").await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_verified_row_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStatusStore::new(dir.path().to_path_buf());
        let record = StatusRecord {
            last_row: 1,
            verified_row: 2,
            ..Default::default()
        };
        assert!(store.save("AUTH_a", "c", &record).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_status_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStatusStore::new(dir.path().to_path_buf());
        let path = dir.path().join("AUTH_a").join("c");
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, b"{not json").await.unwrap();

        assert!(store.load("AUTH_a", "c").await.unwrap().is_none());
        assert!(!path.exists());
        let mut found_quarantined = false;
        let mut entries = std::fs::read_dir(path.parent().unwrap()).unwrap();
        while let Some(Ok(entry)) = entries.next() {
            if entry.file_name().to_string_lossy().contains("corrupt") {
                found_quarantined = true;
            }
        }
        assert!(found_quarantined);
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStatusStore::new(dir.path().to_path_buf());
        store
            .save("AUTH_a", "kept", &StatusRecord::default())
            .await
            .unwrap();
        store
            .save("AUTH_a", "dropped", &StatusRecord::default())
            .await
            .unwrap();

        let profile: SyncProfile = serde_json::from_value(serde_json::json!({
            "account": "AUTH_a",
            "container": "kept",
            "aws_endpoint": "e",
            "aws_identity": "i",
            "aws_secret": "s",
            "aws_bucket": "b",
            "protocol": "s3"
        }))
        .unwrap();

        let purged = store.purge_stale(&[profile]).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.load("AUTH_a", "kept").await.unwrap().is_some());
        assert!(store.load("AUTH_a", "dropped").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_migration_status_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrator-status");
        let mut list = MigrationStatusList::open(path.clone()).await.unwrap();

        let key = MigrationKey {
            account: "AUTH_a".to_string(),
            aws_endpoint: "https://s3.example.com".to_string(),
            aws_identity: "id".to_string(),
            aws_bucket: "b".to_string(),
            container: "b".to_string(),
            protocol: Protocol::S3,
        };
        let mut status = list.get(&key);
        status.record_pass("marker-1".to_string(), 5, 10, 512, false, 1000.0);
        list.put(key.clone(), status).await.unwrap();

        let reloaded = MigrationStatusList::open(path.clone()).await.unwrap();
        let status = reloaded.get(&key);
        assert_eq!(status.marker, "marker-1");
        assert_eq!(status.moved_count, 5);

        // No secret anywhere in the file.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secret"));

        let mut list = reloaded;
        list.prune(&[]).await.unwrap();
        let empty = MigrationStatusList::open(path).await.unwrap();
        assert_eq!(empty.get(&key).marker, "");
    }

    #[test]
    fn test_record_pass_reset_rolls_counters() {
        let mut status = MigrationStatus::default();
        status.record_pass("m1".to_string(), 3, 9, 100, false, 1.0);
        status.record_pass("m2".to_string(), 1, 9, 50, true, 2.0);
        assert_eq!(status.last_moved_count, 3);
        assert_eq!(status.moved_count, 1);
        assert_eq!(status.prev_marker, "m1");
        assert_eq!(status.marker, "m2");
    }
}
