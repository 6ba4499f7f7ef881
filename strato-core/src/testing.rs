//! In-memory local store, remote providers, and feed used by the engine
//! and translator tests.

use crate::config::SyncProfile;
use crate::error::{Result, StratoError};
use crate::feed::{FeedRow, FeedSource};
use crate::local::LocalStore;
use crate::provider::{
    Capabilities, ListEntry, MultipartUpload, ObjLoc, ObjectBody, Provider, PutOptions, PutResult,
    RemoteMeta, RemoteObject,
};
use crate::shard::Partition;
use crate::stats::StatsReporterFactory;
use crate::status::SyncStatusStore;
use crate::sync::{InFlight, SyncEngine};
use crate::types::{
    MANIFEST_HEADER, SLO_HEADER, SWIFT_USER_META_PREFIX, ObjectRef, SloSegment, Timestamp,
    UserMetadata, composite_etag, slo_manifest_etag,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

fn parse_range(range: Option<&str>, len: u64) -> (u64, u64) {
    let Some(raw) = range.and_then(|r| r.strip_prefix("bytes=")) else {
        return (0, len.saturating_sub(1));
    };
    let (start, end) = raw.split_once('-').unwrap_or((raw, ""));
    let start: u64 = start.parse().unwrap_or(0);
    let end: u64 = end.parse().unwrap_or(len.saturating_sub(1));
    (start, end.min(len.saturating_sub(1)))
}

#[derive(Clone)]
struct StoredObject {
    body: Bytes,
    etag: String,
    timestamp: Timestamp,
    metadata: UserMetadata,
    content_type: Option<String>,
    manifest: Option<Vec<SloSegment>>,
}

#[derive(Default)]
struct StoreInner {
    objects: BTreeMap<(String, String, String), StoredObject>,
    containers: BTreeMap<(String, String), Vec<(String, String)>>,
    rows: Vec<(String, String, FeedRow)>,
    next_row: u64,
}

/// In-memory stand-in for the local cluster, doubling as the change-feed
/// recorder: every put/delete appends a row.
#[derive(Clone, Default)]
pub struct TestStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        account: &str,
        container: &str,
        name: &str,
        body: &[u8],
        timestamp: Timestamp,
        metadata: UserMetadata,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let object = StoredObject {
            body: Bytes::copy_from_slice(body),
            etag: md5_hex(body),
            timestamp,
            metadata,
            content_type: None,
            manifest: None,
        };
        inner.objects.insert(
            (account.to_string(), container.to_string(), name.to_string()),
            object,
        );
        inner.next_row += 1;
        let row = FeedRow {
            row_id: inner.next_row,
            name: name.to_string(),
            deleted: false,
            created_at: timestamp,
        };
        inner
            .rows
            .push((account.to_string(), container.to_string(), row));
    }

    pub fn put_slo(
        &self,
        account: &str,
        container: &str,
        name: &str,
        manifest: Vec<SloSegment>,
        timestamp: Timestamp,
        metadata: UserMetadata,
    ) {
        let mut metadata = metadata;
        metadata.insert(SLO_HEADER.to_string(), "True".to_string());
        let etag = slo_manifest_etag(manifest.iter().map(|s| s.etag.as_str()));
        let mut inner = self.inner.lock().unwrap();
        let object = StoredObject {
            body: Bytes::new(),
            etag,
            timestamp,
            metadata,
            content_type: None,
            manifest: Some(manifest),
        };
        inner.objects.insert(
            (account.to_string(), container.to_string(), name.to_string()),
            object,
        );
        inner.next_row += 1;
        let row = FeedRow {
            row_id: inner.next_row,
            name: name.to_string(),
            deleted: false,
            created_at: timestamp,
        };
        inner
            .rows
            .push((account.to_string(), container.to_string(), row));
    }

    pub fn delete(&self, account: &str, container: &str, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .objects
            .remove(&(account.to_string(), container.to_string(), name.to_string()));
        inner.next_row += 1;
        let row = FeedRow {
            row_id: inner.next_row,
            name: name.to_string(),
            deleted: true,
            created_at: Timestamp::now(),
        };
        inner
            .rows
            .push((account.to_string(), container.to_string(), row));
    }

    pub fn head(&self, account: &str, container: &str, name: &str) -> Option<ObjectRef> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&(account.to_string(), container.to_string(), name.to_string()))
            .map(|object| object_ref(account, container, name, object))
    }
}

fn object_ref(account: &str, container: &str, name: &str, object: &StoredObject) -> ObjectRef {
    ObjectRef {
        account: account.to_string(),
        container: container.to_string(),
        name: name.to_string(),
        etag: object.etag.clone(),
        timestamp: object.timestamp,
        size_bytes: object.body.len() as u64,
        content_type: object.content_type.clone(),
        metadata: object.metadata.clone(),
        delete_at: None,
    }
}

#[async_trait]
impl LocalStore for TestStore {
    async fn head_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Option<ObjectRef>> {
        Ok(self.head(account, container, name))
    }

    async fn get_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        range: Option<&str>,
    ) -> Result<(ObjectRef, ObjectBody)> {
        let inner = self.inner.lock().unwrap();
        let object = inner
            .objects
            .get(&(account.to_string(), container.to_string(), name.to_string()))
            .ok_or_else(|| {
                StratoError::NotFound(format!("{}/{}/{}", account, container, name))
            })?;
        let (start, end) = parse_range(range, object.body.len() as u64);
        let body = if object.body.is_empty() {
            Bytes::new()
        } else {
            object.body.slice(start as usize..=end as usize)
        };
        Ok((
            object_ref(account, container, name, object),
            ObjectBody::Buffered(body),
        ))
    }

    async fn get_manifest(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Vec<SloSegment>> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&(account.to_string(), container.to_string(), name.to_string()))
            .and_then(|object| object.manifest.clone())
            .ok_or_else(|| {
                StratoError::InvalidRequest(format!("no manifest: {}/{}", container, name))
            })
    }

    async fn put_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        headers: Vec<(String, String)>,
        body: ObjectBody,
        _content_length: Option<u64>,
    ) -> Result<String> {
        let body = body.into_bytes().await?;
        let mut metadata = UserMetadata::new();
        let mut timestamp = Timestamp::now();
        let mut content_type = None;
        let mut manifest = None;
        for (key, value) in headers {
            let lower = key.to_ascii_lowercase();
            match lower.as_str() {
                "x-timestamp" => {
                    timestamp = Timestamp::parse(&value)?;
                }
                "content-type" => content_type = Some(value),
                "x-static-large-object" => {
                    metadata.insert(SLO_HEADER.to_string(), value);
                }
                _ if lower.starts_with(SWIFT_USER_META_PREFIX) || lower == MANIFEST_HEADER => {
                    metadata.insert(lower, value);
                }
                _ => {}
            }
        }
        if metadata
            .get(SLO_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            manifest = serde_json::from_slice(&body).ok();
        }
        let etag = md5_hex(&body);
        let mut inner = self.inner.lock().unwrap();
        inner.objects.insert(
            (account.to_string(), container.to_string(), name.to_string()),
            StoredObject {
                body,
                etag: etag.clone(),
                timestamp,
                metadata,
                content_type,
                manifest,
            },
        );
        inner.next_row += 1;
        let row = FeedRow {
            row_id: inner.next_row,
            name: name.to_string(),
            deleted: false,
            created_at: timestamp,
        };
        inner
            .rows
            .push((account.to_string(), container.to_string(), row));
        Ok(etag)
    }

    async fn post_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        metadata: UserMetadata,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let object = inner
            .objects
            .get_mut(&(account.to_string(), container.to_string(), name.to_string()))
            .ok_or_else(|| {
                StratoError::NotFound(format!("{}/{}/{}", account, container, name))
            })?;
        object.metadata = metadata;
        Ok(())
    }

    async fn delete_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        if_timestamp: Option<Timestamp>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (account.to_string(), container.to_string(), name.to_string());
        if let Some(object) = inner.objects.get(&key) {
            if let Some(expected) = if_timestamp
                && object.timestamp > expected
            {
                return Err(StratoError::ConflictNewer(name.to_string()));
            }
            inner.objects.remove(&key);
        }
        Ok(())
    }

    async fn list_container(
        &self,
        account: &str,
        container: &str,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
    ) -> Result<Vec<ListEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .objects
            .iter()
            .filter(|((a, c, n), _)| {
                a == account
                    && c == container
                    && n.as_str() > marker
                    && prefix.is_none_or(|p| n.starts_with(p))
            })
            .take(limit)
            .map(|((_, _, name), object)| ListEntry {
                name: name.clone(),
                etag: object.etag.clone(),
                size_bytes: object.body.len() as u64,
                last_modified: chrono::DateTime::from_timestamp(
                    object.timestamp.micros().div_euclid(1_000_000),
                    0,
                )
                .unwrap_or_else(Utc::now),
                content_type: object.content_type.clone(),
                subdir: false,
                content_location: String::new(),
            })
            .collect())
    }

    async fn list_account(
        &self,
        account: &str,
        marker: &str,
        limit: usize,
    ) -> Result<Vec<ListEntry>> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<String> = inner
            .objects
            .keys()
            .filter(|(a, _, _)| a == account)
            .map(|(_, c, _)| c.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names
            .into_iter()
            .filter(|name| name.as_str() > marker)
            .take(limit)
            .map(|name| ListEntry {
                name,
                etag: String::new(),
                size_bytes: 0,
                last_modified: Utc::now(),
                content_type: None,
                subdir: false,
                content_location: String::new(),
            })
            .collect())
    }

    async fn head_container(
        &self,
        account: &str,
        container: &str,
    ) -> Result<Option<Vec<(String, String)>>> {
        let inner = self.inner.lock().unwrap();
        let key = (account.to_string(), container.to_string());
        if let Some(headers) = inner.containers.get(&key) {
            return Ok(Some(headers.clone()));
        }
        let has_objects = inner
            .objects
            .keys()
            .any(|(a, c, _)| a == account && c == container);
        Ok(has_objects.then(Vec::new))
    }

    async fn put_container(
        &self,
        account: &str,
        container: &str,
        headers: Vec<(String, String)>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .containers
            .insert((account.to_string(), container.to_string()), headers);
        Ok(())
    }

    async fn post_container(
        &self,
        account: &str,
        container: &str,
        headers: Vec<(String, String)>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .containers
            .entry((account.to_string(), container.to_string()))
            .or_default();
        for (key, value) in headers {
            entry.retain(|(k, _)| !k.eq_ignore_ascii_case(&key));
            entry.push((key, value));
        }
        Ok(())
    }

    async fn delete_container(&self, account: &str, container: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let has_objects = inner
            .objects
            .keys()
            .any(|(a, c, _)| a == account && c == container);
        if has_objects {
            return Err(StratoError::ConflictNewer(container.to_string()));
        }
        inner
            .containers
            .remove(&(account.to_string(), container.to_string()));
        Ok(())
    }

    async fn head_account(&self, _account: &str) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    async fn post_account(
        &self,
        _account: &str,
        _headers: Vec<(String, String)>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Feed view over a [`TestStore`]'s recorded rows.
pub struct TestFeed {
    store: TestStore,
}

impl TestFeed {
    pub fn of(store: &TestStore) -> Self {
        Self {
            store: store.clone(),
        }
    }
}

#[async_trait]
impl FeedSource for TestFeed {
    async fn next_rows(
        &self,
        account: &str,
        container: &str,
        since: u64,
        limit: usize,
    ) -> Result<Vec<FeedRow>> {
        let inner = self.store.inner.lock().unwrap();
        Ok(inner
            .rows
            .iter()
            .filter(|(a, c, row)| a == account && c == container && row.row_id > since)
            .take(limit)
            .map(|(_, _, row)| row.clone())
            .collect())
    }
}

#[derive(Clone)]
pub struct RemoteSnapshot {
    pub body: Bytes,
    pub etag: String,
    pub metadata: UserMetadata,
}

struct RemoteStored {
    body: Bytes,
    etag: String,
    metadata: UserMetadata,
    content_type: Option<String>,
    parts: Option<Vec<(u64, String)>>,
    last_modified: chrono::DateTime<Utc>,
}

fn whole_second_now() -> chrono::DateTime<Utc> {
    chrono::DateTime::from_timestamp(Utc::now().timestamp(), 0).expect("valid timestamp")
}

#[derive(Default)]
struct RemoteInner {
    objects: BTreeMap<(String, String), RemoteStored>,
    containers: Vec<String>,
    manifests: BTreeMap<(String, String), Vec<SloSegment>>,
    uploads: HashMap<String, Vec<(u32, Bytes, String)>>,
    lifecycles: Vec<(String, String, u64)>,
    fail_pattern: Option<String>,
    next_upload: u64,
}

/// Swift-flavored in-memory remote. With `multipart` it behaves like the
/// S3 variant instead: no native manifests, MPU assembly, lifecycle rules.
#[derive(Clone)]
pub struct TestRemote {
    inner: Arc<Mutex<RemoteInner>>,
    multipart: bool,
}

impl TestRemote {
    pub fn swift() -> Self {
        Self {
            inner: Arc::default(),
            multipart: false,
        }
    }

    pub fn s3() -> Self {
        Self {
            inner: Arc::default(),
            multipart: true,
        }
    }

    pub fn object(&self, container: &str, name: &str) -> Option<RemoteSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&(container.to_string(), name.to_string()))
            .map(|stored| RemoteSnapshot {
                body: stored.body.clone(),
                etag: stored.etag.clone(),
                metadata: stored.metadata.clone(),
            })
    }

    pub fn manifest(&self, container: &str, name: &str) -> Option<Vec<SloSegment>> {
        let inner = self.inner.lock().unwrap();
        inner
            .manifests
            .get(&(container.to_string(), name.to_string()))
            .cloned()
    }

    pub fn lifecycles(&self) -> Vec<(String, String, u64)> {
        self.inner.lock().unwrap().lifecycles.clone()
    }

    pub fn pending_uploads(&self) -> usize {
        self.inner.lock().unwrap().uploads.len()
    }

    pub fn fail_puts_matching(&self, pattern: &str) {
        self.inner.lock().unwrap().fail_pattern = Some(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().fail_pattern = None;
    }

    fn check_failure(&self, name: &str) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if let Some(pattern) = &inner.fail_pattern
            && name.contains(pattern.as_str())
        {
            return Err(StratoError::RemoteClient {
                status: 400,
                message: format!("induced failure for {}", name),
            });
        }
        Ok(())
    }

    fn remote_meta(stored: &RemoteStored) -> RemoteMeta {
        RemoteMeta {
            etag: stored.etag.clone(),
            timestamp: None,
            last_modified: Some(stored.last_modified),
            size_bytes: stored.body.len() as u64,
            content_type: stored.content_type.clone(),
            metadata: stored.metadata.clone(),
            headers: vec![
                ("etag".to_string(), stored.etag.clone()),
                (
                    "content-length".to_string(),
                    stored.body.len().to_string(),
                ),
            ],
        }
    }
}

#[async_trait]
impl Provider for TestRemote {
    fn id(&self) -> String {
        "test://remote;tester;bucket".to_string()
    }

    fn capabilities(&self) -> Capabilities {
        if self.multipart {
            Capabilities {
                bucket_lifecycle: true,
                per_object_expiration: false,
                account_listing: true,
                container_metadata: false,
                swift_large_objects: false,
            }
        } else {
            Capabilities {
                bucket_lifecycle: false,
                per_object_expiration: true,
                account_listing: true,
                container_metadata: true,
                swift_large_objects: true,
            }
        }
    }

    fn as_multipart(&self) -> Option<&dyn MultipartUpload> {
        self.multipart.then_some(self as &dyn MultipartUpload)
    }

    async fn put_object(
        &self,
        loc: ObjLoc<'_>,
        opts: &PutOptions,
        body: ObjectBody,
        content_length: Option<u64>,
    ) -> Result<PutResult> {
        self.check_failure(loc.name)?;
        let body = body.into_bytes().await?;
        if let Some(expected) = content_length
            && expected != body.len() as u64
        {
            return Err(StratoError::InvalidRequest("bad content length".to_string()));
        }
        let etag = md5_hex(&body);
        let mut metadata = opts.metadata.clone();
        if let Some(manifest) = &opts.dlo_manifest {
            metadata.insert(MANIFEST_HEADER.to_string(), manifest.clone());
        }
        let mut inner = self.inner.lock().unwrap();
        inner.objects.insert(
            (loc.container.to_string(), loc.name.to_string()),
            RemoteStored {
                body,
                etag: etag.clone(),
                metadata,
                content_type: opts.content_type.clone(),
                parts: None,
                last_modified: whole_second_now(),
            },
        );
        Ok(PutResult {
            etag,
            timestamp: None,
        })
    }

    async fn post_object(&self, loc: ObjLoc<'_>, opts: &PutOptions) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .objects
            .get_mut(&(loc.container.to_string(), loc.name.to_string()))
            .ok_or_else(|| StratoError::NotFound(loc.name.to_string()))?;
        stored.metadata = opts.metadata.clone();
        Ok(())
    }

    async fn get_object(&self, loc: ObjLoc<'_>, range: Option<&str>) -> Result<RemoteObject> {
        let inner = self.inner.lock().unwrap();
        let stored = inner
            .objects
            .get(&(loc.container.to_string(), loc.name.to_string()))
            .ok_or_else(|| StratoError::NotFound(loc.name.to_string()))?;
        let (start, end) = parse_range(range, stored.body.len() as u64);
        let body = if stored.body.is_empty() {
            Bytes::new()
        } else {
            stored.body.slice(start as usize..=end as usize)
        };
        Ok(RemoteObject {
            status: if range.is_some() { 206 } else { 200 },
            meta: Self::remote_meta(stored),
            body: ObjectBody::Buffered(body),
        })
    }

    async fn head_object(&self, loc: ObjLoc<'_>) -> Result<Option<RemoteMeta>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .objects
            .get(&(loc.container.to_string(), loc.name.to_string()))
            .map(Self::remote_meta))
    }

    async fn delete_object(&self, loc: ObjLoc<'_>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .objects
            .remove(&(loc.container.to_string(), loc.name.to_string()));
        inner
            .manifests
            .remove(&(loc.container.to_string(), loc.name.to_string()));
        Ok(())
    }

    async fn list_objects(
        &self,
        container: &str,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
        _delimiter: Option<&str>,
    ) -> Result<Vec<ListEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .objects
            .iter()
            .filter(|((c, n), _)| {
                c == container
                    && n.as_str() > marker
                    && prefix.is_none_or(|p| n.starts_with(p))
            })
            .take(limit)
            .map(|((_, name), stored)| ListEntry {
                name: name.clone(),
                etag: stored.etag.clone(),
                size_bytes: stored.body.len() as u64,
                last_modified: stored.last_modified,
                content_type: stored.content_type.clone(),
                subdir: false,
                content_location: self.id(),
            })
            .collect())
    }

    async fn list_buckets(
        &self,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
    ) -> Result<Vec<ListEntry>> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<String> = inner.objects.keys().map(|(c, _)| c.clone()).collect();
        names.extend(inner.containers.iter().cloned());
        names.sort();
        names.dedup();
        Ok(names
            .into_iter()
            .filter(|name| name.as_str() > marker)
            .filter(|name| prefix.is_none_or(|p| name.starts_with(p)))
            .take(limit)
            .map(|name| ListEntry {
                name,
                etag: String::new(),
                size_bytes: 0,
                last_modified: Utc::now(),
                content_type: None,
                subdir: false,
                content_location: self.id(),
            })
            .collect())
    }

    async fn put_container(&self, container: &str, _metadata: &UserMetadata) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.containers.contains(&container.to_string()) {
            inner.containers.push(container.to_string());
        }
        Ok(())
    }

    async fn post_container(&self, _container: &str, _metadata: &UserMetadata) -> Result<()> {
        Ok(())
    }

    async fn head_container(&self, container: &str) -> Result<Option<Vec<(String, String)>>> {
        let inner = self.inner.lock().unwrap();
        let exists = inner.containers.contains(&container.to_string())
            || inner.objects.keys().any(|(c, _)| c == container);
        Ok(exists.then(Vec::new))
    }

    async fn head_account(&self) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    async fn upload_manifest(
        &self,
        loc: ObjLoc<'_>,
        manifest: &[SloSegment],
        opts: &PutOptions,
    ) -> Result<PutResult> {
        if self.multipart {
            return Err(StratoError::LargeObjectPolicy(
                "manifests need multipart assembly".to_string(),
            ));
        }
        self.check_failure(loc.name)?;
        let etag = slo_manifest_etag(manifest.iter().map(|s| s.etag.as_str()));
        let mut metadata = opts.metadata.clone();
        metadata.insert(SLO_HEADER.to_string(), "True".to_string());
        let mut inner = self.inner.lock().unwrap();
        inner.manifests.insert(
            (loc.container.to_string(), loc.name.to_string()),
            manifest.to_vec(),
        );
        inner.objects.insert(
            (loc.container.to_string(), loc.name.to_string()),
            RemoteStored {
                body: Bytes::new(),
                etag: etag.clone(),
                metadata,
                content_type: opts.content_type.clone(),
                parts: None,
                last_modified: whole_second_now(),
            },
        );
        Ok(PutResult {
            etag,
            timestamp: None,
        })
    }

    async fn get_manifest(&self, loc: ObjLoc<'_>) -> Result<Option<Vec<SloSegment>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .manifests
            .get(&(loc.container.to_string(), loc.name.to_string()))
            .cloned())
    }

    async fn set_lifecycle(
        &self,
        container: &str,
        prefix: &str,
        delete_after_secs: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.lifecycles.push((
            container.to_string(),
            prefix.to_string(),
            delete_after_secs,
        ));
        Ok(())
    }

    fn close_idle(&self) {}
}

#[async_trait]
impl MultipartUpload for TestRemote {
    async fn create_upload(&self, loc: ObjLoc<'_>, opts: &PutOptions) -> Result<String> {
        self.check_failure(loc.name)?;
        let mut inner = self.inner.lock().unwrap();
        inner.next_upload += 1;
        let id = format!("upload-{}", inner.next_upload);
        inner.uploads.insert(id.clone(), Vec::new());
        let _ = opts;
        Ok(id)
    }

    async fn upload_part(
        &self,
        _loc: ObjLoc<'_>,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let etag = md5_hex(&body);
        let mut inner = self.inner.lock().unwrap();
        let parts = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StratoError::NotFound(upload_id.to_string()))?;
        parts.push((part_number, body, etag.clone()));
        Ok(etag)
    }

    async fn complete_upload(
        &self,
        loc: ObjLoc<'_>,
        upload_id: &str,
        part_etags: &[String],
    ) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let mut parts = inner
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StratoError::NotFound(upload_id.to_string()))?;
        parts.sort_by_key(|(number, _, _)| *number);
        let etag = composite_etag(part_etags.iter().map(String::as_str))?;
        let mut body = Vec::new();
        let mut part_index = Vec::new();
        for (_, data, part_etag) in &parts {
            body.extend_from_slice(data);
            part_index.push((data.len() as u64, part_etag.clone()));
        }
        inner.objects.insert(
            (loc.container.to_string(), loc.name.to_string()),
            RemoteStored {
                body: Bytes::from(body),
                etag: etag.clone(),
                metadata: UserMetadata::new(),
                content_type: None,
                parts: Some(part_index),
                last_modified: whole_second_now(),
            },
        );
        Ok(etag)
    }

    async fn abort_upload(&self, _loc: ObjLoc<'_>, upload_id: &str) -> Result<()> {
        self.inner.lock().unwrap().uploads.remove(upload_id);
        Ok(())
    }

    async fn get_part(
        &self,
        loc: ObjLoc<'_>,
        part_number: u32,
        _if_match: Option<&str>,
    ) -> Result<RemoteObject> {
        let inner = self.inner.lock().unwrap();
        let stored = inner
            .objects
            .get(&(loc.container.to_string(), loc.name.to_string()))
            .ok_or_else(|| StratoError::NotFound(loc.name.to_string()))?;
        let parts = stored
            .parts
            .as_ref()
            .ok_or_else(|| StratoError::InvalidRequest("not multipart".to_string()))?;
        let mut offset = 0u64;
        for (index, (size, etag)) in parts.iter().enumerate() {
            if index as u32 + 1 == part_number {
                let body = stored.body.slice(offset as usize..(offset + size) as usize);
                let mut meta = Self::remote_meta(stored);
                meta.etag = etag.clone();
                meta.size_bytes = *size;
                return Ok(RemoteObject {
                    status: 206,
                    meta,
                    body: ObjectBody::Buffered(body),
                });
            }
            offset += size;
        }
        Err(StratoError::NotFound(format!(
            "part {} of {}",
            part_number, loc.name
        )))
    }

    async fn preserve_manifest(&self, loc: ObjLoc<'_>, manifest: &[SloSegment]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.manifests.insert(
            (loc.container.to_string(), loc.name.to_string()),
            manifest.to_vec(),
        );
        Ok(())
    }
}

pub fn test_profile() -> SyncProfile {
    serde_json::from_value(serde_json::json!({
        "account": "AUTH_a",
        "container": "c",
        "aws_endpoint": "test://remote",
        "aws_identity": "tester",
        "aws_secret": "secret",
        "aws_bucket": "bucket",
        "protocol": "swift"
    }))
    .unwrap()
}

/// Engine wired against a [`TestStore`] and a Swift-style [`TestRemote`].
pub async fn test_engine(
    configure: impl FnOnce(&mut SyncProfile),
) -> (Arc<SyncEngine>, TestStore, TestRemote) {
    let mut profile = test_profile();
    configure(&mut profile);
    let store = TestStore::new();
    let remote = TestRemote::swift();
    let status_dir = std::env::temp_dir().join(format!("strato-test-{}", ulid::Ulid::new()));
    let engine = SyncEngine::new(
        profile,
        Arc::new(remote.clone()),
        Arc::new(store.clone()),
        Arc::new(SyncStatusStore::new(status_dir)),
        StatsReporterFactory::disabled().instance("AUTH_a", "c"),
        Partition::new(0, 1),
        Arc::new(InFlight::default()),
        2,
        100,
        2,
    )
    .unwrap();
    (Arc::new(engine), store, remote)
}
