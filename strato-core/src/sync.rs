use crate::config::SyncProfile;
use crate::error::{Result, StratoError};
use crate::feed::{FeedRow, FeedSource};
use crate::local::LocalStore;
use crate::provider::{ObjLoc, Provider, PutOptions};
use crate::shard::Partition;
use crate::stats::StatsReporter;
use crate::status::{StatusRecord, SyncStatusStore};
use crate::translate::Translator;
use crate::types::{
    DLO_ETAG_KEY, ObjectRef, SLO_ETAG_KEY, Timestamp, etags_match, metadata_synced,
    slo_manifest_etag,
};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

const RETRY_BASE_DELAY_MS: u64 = 250;

/// What happened to one feed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    /// Object (or manifest) landed on the remote.
    Uploaded,
    /// Remote already matched; nothing sent.
    AlreadyUploaded,
    /// Only metadata diverged; POSTed.
    MetadataUpdated,
    /// Remote delete done (includes 404/409 wins).
    Deleted,
    /// Permanently out of scope (excluded, missing, policy-skipped).
    Skipped,
    /// Not ready yet (copy_after, stale HEAD, concurrent mutation); the
    /// next pass picks it up again.
    Deferred,
    /// Retries exhausted; the next pass tries again.
    Failed,
}

#[derive(Debug, Default, Clone)]
pub struct PassStats {
    pub scanned: u64,
    pub uploaded: u64,
    pub uploaded_bytes: u64,
    pub already_uploaded: u64,
    pub deleted: u64,
    pub deferred: u64,
    pub errors: u64,
}

/// Per-key in-flight guard: at most one operation per object key per
/// process, whatever the workers are doing.
#[derive(Default)]
pub struct InFlight {
    keys: Mutex<HashSet<String>>,
}

impl InFlight {
    pub async fn try_acquire(&self, key: &str) -> bool {
        self.keys.lock().await.insert(key.to_string())
    }

    pub async fn release(&self, key: &str) {
        self.keys.lock().await.remove(key);
    }
}

/// Drives one (profile, container) against the remote: consumes feed
/// rows, uploads/deletes through the provider, and checkpoints progress.
pub struct SyncEngine {
    profile: SyncProfile,
    provider: Arc<dyn Provider>,
    local: Arc<dyn LocalStore>,
    status: Arc<SyncStatusStore>,
    stats: StatsReporter,
    partition: Partition,
    in_flight: Arc<InFlight>,
    exclude: Option<Regex>,
    workers: usize,
    items_chunk: usize,
    retry_limit: u32,
    /// Set once per pass when the remote handles expiration per bucket.
    lifecycle_installed: Mutex<bool>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: SyncProfile,
        provider: Arc<dyn Provider>,
        local: Arc<dyn LocalStore>,
        status: Arc<SyncStatusStore>,
        stats: StatsReporter,
        partition: Partition,
        in_flight: Arc<InFlight>,
        workers: usize,
        items_chunk: usize,
        retry_limit: u32,
    ) -> Result<Self> {
        let exclude = profile.exclude_regex()?;
        Ok(Self {
            profile,
            provider,
            local,
            status,
            stats,
            partition,
            in_flight,
            exclude,
            workers: workers.max(1),
            items_chunk: items_chunk.max(1),
            retry_limit,
            lifecycle_installed: Mutex::new(false),
        })
    }

    pub fn account(&self) -> &str {
        &self.profile.account
    }

    pub fn container(&self) -> &str {
        &self.profile.container
    }

    /// One pass over the feed. Resumes from `verified_row` so rows that
    /// failed last time get another shot; re-syncing a done row is a
    /// cheap already-uploaded HEAD.
    pub async fn run_pass(self: &Arc<Self>, feed: &dyn FeedSource) -> Result<PassStats> {
        *self.lifecycle_installed.lock().await = false;
        let mut record = self
            .status
            .load(&self.profile.account, &self.profile.container)
            .await?
            .unwrap_or(StatusRecord {
                all_buckets: self.profile.per_account(),
                ..Default::default()
            });

        let mut totals = PassStats::default();
        let mut cursor = record.verified_row;
        loop {
            let rows = feed
                .next_rows(
                    &self.profile.account,
                    &self.profile.container,
                    cursor,
                    self.items_chunk,
                )
                .await?;
            let Some(last) = rows.last() else { break };
            cursor = last.row_id;

            let (stats, verified, last_row) = self.process_batch(rows).await;

            totals.scanned += stats.scanned;
            totals.uploaded += stats.uploaded;
            totals.uploaded_bytes += stats.uploaded_bytes;
            totals.already_uploaded += stats.already_uploaded;
            totals.deleted += stats.deleted;
            totals.deferred += stats.deferred;
            totals.errors += stats.errors;

            record.last_row = record.last_row.max(last_row);
            if let Some(verified) = verified {
                record.verified_row = record.verified_row.max(verified);
            }
            record.scan_count += stats.scanned;
            record.moved_count += stats.uploaded;
            record.bytes_count += stats.uploaded_bytes;
            self.status
                .save(&self.profile.account, &self.profile.container, &record)
                .await?;
        }
        Ok(totals)
    }

    /// Fans a batch out over the worker pool. Returns the per-batch stats,
    /// the contiguous-success frontier (every row at or below it is done),
    /// and the highest row id seen.
    async fn process_batch(
        self: &Arc<Self>,
        rows: Vec<FeedRow>,
    ) -> (PassStats, Option<u64>, u64) {
        let mut stats = PassStats::default();
        if rows.is_empty() {
            return (stats, None, 0);
        }
        let last_row = rows.iter().map(|r| r.row_id).max().unwrap_or(0);

        // Keys hashed to other processes are theirs to sync; for this
        // process's cursor they are simply done.
        let mut row_done: HashMap<u64, bool> = HashMap::new();
        let (owned, foreign): (Vec<FeedRow>, Vec<FeedRow>) = rows
            .into_iter()
            .partition(|row| self.partition.owns_key(&row.name));
        for row in foreign {
            row_done.insert(row.row_id, true);
        }

        // Only the newest row per key matters; the superseded ones are
        // done the moment the newest lands.
        let mut newest: HashMap<String, FeedRow> = HashMap::new();
        let mut superseded: HashMap<String, Vec<u64>> = HashMap::new();
        for row in owned {
            match newest.get(&row.name) {
                Some(existing) if existing.row_id >= row.row_id => {
                    superseded.entry(row.name.clone()).or_default().push(row.row_id);
                }
                Some(existing) => {
                    superseded
                        .entry(row.name.clone())
                        .or_default()
                        .push(existing.row_id);
                    newest.insert(row.name.clone(), row);
                }
                None => {
                    newest.insert(row.name.clone(), row);
                }
            }
        }

        let (work_tx, work_rx) = mpsc::channel::<FeedRow>(self.workers * 2);
        let (done_tx, mut done_rx) = mpsc::channel::<(String, u64, RowOutcome)>(self.workers * 2);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let engine = Arc::clone(self);
            let work_rx = Arc::clone(&work_rx);
            let done_tx = done_tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let row = {
                        let mut guard = work_rx.lock().await;
                        guard.recv().await
                    };
                    let Some(row) = row else { break };
                    let outcome = engine.process_row_with_retry(&row).await;
                    if done_tx.send((row.name, row.row_id, outcome)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(done_tx);

        let total = newest.len();
        let feeder = {
            let rows: Vec<FeedRow> = newest.into_values().collect();
            tokio::spawn(async move {
                for row in rows {
                    if work_tx.send(row).await.is_err() {
                        break;
                    }
                }
            })
        };

        let mut received = 0usize;
        while let Some((name, row_id, outcome)) = done_rx.recv().await {
            received += 1;
            let done = !matches!(outcome, RowOutcome::Deferred | RowOutcome::Failed);
            row_done.insert(row_id, done);
            for superseded_id in superseded.remove(&name).unwrap_or_default() {
                row_done.insert(superseded_id, done);
            }
            match outcome {
                RowOutcome::Uploaded => stats.uploaded += 1,
                RowOutcome::AlreadyUploaded => {
                    stats.already_uploaded += 1;
                    self.stats.increment("already_uploaded", 1);
                }
                RowOutcome::MetadataUpdated => {}
                RowOutcome::Deleted => {
                    stats.deleted += 1;
                    self.stats.increment("deleted", 1);
                }
                RowOutcome::Skipped => {}
                RowOutcome::Deferred => stats.deferred += 1,
                RowOutcome::Failed => stats.errors += 1,
            }
            stats.scanned += 1;
            self.stats.increment("scanned_objects", 1);
            if received == total {
                break;
            }
        }
        let _ = feeder.await;
        for handle in handles {
            let _ = handle.await;
        }

        let mut ids: Vec<u64> = row_done.keys().copied().collect();
        ids.sort_unstable();
        let mut verified = None;
        for id in ids {
            if row_done.get(&id).copied().unwrap_or(false) {
                verified = Some(id);
            } else {
                break;
            }
        }
        (stats, verified, last_row)
    }

    async fn process_row_with_retry(&self, row: &FeedRow) -> RowOutcome {
        if !self.in_flight.try_acquire(&row.name).await {
            return RowOutcome::Deferred;
        }
        let mut attempt = 0u32;
        let outcome = loop {
            match self.process_row(row).await {
                Ok(outcome) => break outcome,
                Err(StratoError::StaleRow(_)) | Err(StratoError::ConflictNewer(_)) => {
                    break RowOutcome::Deferred;
                }
                Err(e) if e.is_retryable() && attempt < self.retry_limit => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt.min(6));
                    tracing::debug!(
                        "Retrying {}/{} row {} after {}ms: {}",
                        self.profile.container,
                        row.name,
                        row.row_id,
                        delay,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to sync {}/{}/{}: {}",
                        self.profile.account,
                        self.profile.container,
                        row.name,
                        e
                    );
                    self.stats.error(e.kind());
                    break RowOutcome::Failed;
                }
            }
        };
        self.in_flight.release(&row.name).await;
        outcome
    }

    async fn process_row(&self, row: &FeedRow) -> Result<RowOutcome> {
        if let Some(exclude) = &self.exclude
            && exclude.is_match(&row.name)
        {
            return Ok(RowOutcome::Skipped);
        }
        if self.profile.copy_after > 0 {
            let age = Timestamp::now().micros() - row.created_at.micros();
            if age < self.profile.copy_after as i64 * 1_000_000 {
                return Ok(RowOutcome::Deferred);
            }
        }

        if row.deleted {
            if !self.profile.propagate_delete {
                return Ok(RowOutcome::Skipped);
            }
            self.provider
                .delete_object(ObjLoc {
                    container: &self.profile.container,
                    name: &row.name,
                })
                .await?;
            return Ok(RowOutcome::Deleted);
        }

        let Some(object) = self
            .local
            .head_object(&self.profile.account, &self.profile.container, &row.name)
            .await?
        else {
            // Gone since enumeration; the delete row covers it.
            return Ok(RowOutcome::Skipped);
        };

        // The row described a different version than what is stored now;
        // process it when its own row arrives.
        if object.timestamp != row.created_at {
            return Err(StratoError::StaleRow(row.name.clone()));
        }

        if let Some(criteria) = &self.profile.selection_criteria
            && !criteria.matches(&object.metadata)
        {
            return Ok(RowOutcome::Skipped);
        }

        self.ensure_lifecycle().await?;

        let outcome = if object.is_slo() {
            self.upload_slo(&object).await?
        } else if object.dlo_manifest().is_some() {
            self.upload_dlo(&object).await?
        } else {
            self.upload_plain(&object).await?
        };

        if matches!(outcome, RowOutcome::Uploaded) {
            self.stats.increment("uploaded_objects", 1);
            self.stats.increment("uploaded_bytes", object.size_bytes);
            self.after_success(&object).await?;
        }
        Ok(outcome)
    }

    async fn upload_plain(&self, object: &ObjectRef) -> Result<RowOutcome> {
        let loc = ObjLoc {
            container: &object.container,
            name: &object.name,
        };
        if let Some(remote) = self.provider.head_object(loc).await? {
            if etags_match(&remote.etag, &object.etag) {
                if metadata_synced(&object.metadata, &remote.metadata) {
                    return Ok(RowOutcome::AlreadyUploaded);
                }
                self.provider
                    .post_object(loc, &self.put_options(object))
                    .await?;
                return Ok(RowOutcome::MetadataUpdated);
            }
        }

        let (read_ref, body) = self
            .local
            .get_object(&object.account, &object.container, &object.name, None)
            .await?;
        if read_ref.timestamp != object.timestamp {
            return Err(StratoError::StaleRow(object.name.clone()));
        }
        let opts = self.put_options(object);
        let result = self
            .provider
            .put_object(loc, &opts, body, Some(object.size_bytes))
            .await;
        let result = match result {
            Err(StratoError::NotFound(_)) => {
                // Remote container not there yet (fresh per-account
                // mapping); create and retry once.
                self.provider
                    .put_container(&object.container, &crate::types::UserMetadata::new())
                    .await?;
                let (_, body) = self
                    .local
                    .get_object(&object.account, &object.container, &object.name, None)
                    .await?;
                self.provider
                    .put_object(loc, &opts, body, Some(object.size_bytes))
                    .await?
            }
            other => other?,
        };
        if !result.etag.is_empty() && !etags_match(&result.etag, &object.etag) {
            return Err(StratoError::IntegrityMismatch {
                key: object.path(),
                expected: object.etag.clone(),
                actual: result.etag,
            });
        }
        Ok(RowOutcome::Uploaded)
    }

    async fn upload_slo(&self, object: &ObjectRef) -> Result<RowOutcome> {
        let loc = ObjLoc {
            container: &object.container,
            name: &object.name,
        };
        let manifest = self
            .local
            .get_manifest(&object.account, &object.container, &object.name)
            .await?;
        let expected = slo_manifest_etag(manifest.iter().map(|s| s.etag.as_str()));

        if let Some(remote) = self.provider.head_object(loc).await? {
            let uploaded = etags_match(&remote.etag, &expected)
                || remote
                    .metadata
                    .get(SLO_ETAG_KEY)
                    .is_some_and(|stored| etags_match(stored, &expected));
            if uploaded {
                if metadata_synced(&object.metadata, &remote.metadata) {
                    return Ok(RowOutcome::AlreadyUploaded);
                }
                self.provider
                    .post_object(loc, &self.put_options(object))
                    .await?;
                return Ok(RowOutcome::MetadataUpdated);
            }
        }

        let translator = self.translator();
        translator.push_slo(object, self.put_options(object)).await?;
        Ok(RowOutcome::Uploaded)
    }

    async fn upload_dlo(&self, object: &ObjectRef) -> Result<RowOutcome> {
        let loc = ObjLoc {
            container: &object.container,
            name: &object.name,
        };
        let translator = self.translator();

        if let Some(remote) = self.provider.head_object(loc).await?
            && let Some(stored) = remote.metadata.get(DLO_ETAG_KEY)
        {
            let current = translator.dlo_etag(object).await?;
            if etags_match(stored, &current) {
                if metadata_synced(&object.metadata, &remote.metadata) {
                    return Ok(RowOutcome::AlreadyUploaded);
                }
                self.provider
                    .post_object(loc, &self.put_options(object))
                    .await?;
                return Ok(RowOutcome::MetadataUpdated);
            }
        }

        let opts = self.put_options(object);
        let result = if self.profile.convert_dlo {
            translator.push_dlo_converted(object, opts).await
        } else {
            translator.push_dlo_passthrough(object, opts).await
        };
        match result {
            Ok(_) => Ok(RowOutcome::Uploaded),
            Err(e @ StratoError::LargeObjectPolicy(_)) => {
                tracing::warn!("Skipping large object {}: {}", object.path(), e);
                self.stats.error(e.kind());
                Ok(RowOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Confirms the local object did not move underneath the upload, then
    /// applies local retention policy.
    async fn after_success(&self, object: &ObjectRef) -> Result<()> {
        let current = self
            .local
            .head_object(&object.account, &object.container, &object.name)
            .await?;
        if let Some(current) = &current
            && current.timestamp != object.timestamp
        {
            // A newer write landed mid-upload; its own row re-syncs it and
            // the local copy must stay.
            return Err(StratoError::StaleRow(object.name.clone()));
        }

        if self.profile.retain_local {
            return Ok(());
        }
        let manifest = if object.is_slo() && !self.profile.retain_local_segments {
            Some(
                self.local
                    .get_manifest(&object.account, &object.container, &object.name)
                    .await?,
            )
        } else {
            None
        };
        self.local
            .delete_object(
                &object.account,
                &object.container,
                &object.name,
                Some(object.timestamp),
            )
            .await?;
        if let Some(manifest) = manifest {
            // Manifest first, segments after, so a reader never sees a
            // manifest with missing segments.
            for segment in manifest {
                let (container, name) = segment.split_path()?;
                self.local
                    .delete_object(&object.account, container, name, None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn ensure_lifecycle(&self) -> Result<()> {
        if self.profile.remote_delete_after == 0 {
            return Ok(());
        }
        if !self.provider.capabilities().bucket_lifecycle {
            return Ok(());
        }
        let mut installed = self.lifecycle_installed.lock().await;
        if *installed {
            return Ok(());
        }
        self.provider
            .set_lifecycle(
                &self.profile.container,
                "",
                self.profile.remote_delete_after,
            )
            .await?;
        *installed = true;
        Ok(())
    }

    fn translator(&self) -> Translator<'_> {
        let segment_delete_after = (self.profile.remote_delete_after > 0
            && self.provider.capabilities().per_object_expiration)
            .then(|| self.profile.remote_delete_after + self.profile.remote_delete_after_addition);
        Translator::new(
            self.local.as_ref(),
            self.provider.as_ref(),
            &self.profile.account,
            self.profile.min_segment_size,
            segment_delete_after,
        )
    }

    fn put_options(&self, object: &ObjectRef) -> PutOptions {
        let mut metadata = object.metadata.clone();
        metadata.retain(|k, _| !k.eq_ignore_ascii_case(crate::types::SLO_HEADER));
        let per_object = self.provider.capabilities().per_object_expiration;
        // remote_delete_after wins over expiration propagation when both
        // are configured.
        let delete_after = (per_object && self.profile.remote_delete_after > 0)
            .then_some(self.profile.remote_delete_after);
        let delete_at = if delete_after.is_none() && per_object && self.profile.propagate_expiration
        {
            object
                .delete_at
                .map(|at| at + self.profile.propagate_expiration_offset)
        } else {
            None
        };
        PutOptions {
            content_type: object.content_type.clone(),
            metadata,
            etag: Some(object.etag.clone()),
            delete_after,
            delete_at,
            dlo_manifest: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestFeed, TestStore, test_engine};
    use crate::types::SWIFT_USER_META_PREFIX;

    fn put_local(store: &TestStore, name: &str, body: &[u8], micros: i64) {
        store.put(
            "AUTH_a",
            "c",
            name,
            body,
            Timestamp::from_micros(micros),
            UserMetadataPairs::default(),
        );
    }

    type UserMetadataPairs = crate::types::UserMetadata;

    #[tokio::test]
    async fn test_basic_put_propagation() {
        let (engine, store, remote) = test_engine(|profile| {
            profile.retain_local = false;
        })
        .await;
        put_local(&store, "hello", b"world", 1_000_000);
        let feed = TestFeed::of(&store);

        let stats = engine.run_pass(&feed).await.unwrap();
        assert_eq!(stats.uploaded, 1);
        assert_eq!(stats.errors, 0);

        let uploaded = remote.object("c", "hello").expect("object uploaded");
        assert_eq!(uploaded.body.as_ref(), b"world");
        // retain_local=false removes the local copy after remote success.
        assert!(store.head("AUTH_a", "c", "hello").is_none());
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let (engine, store, _remote) = test_engine(|_| {}).await;
        put_local(&store, "hello", b"world", 1_000_000);
        let feed = TestFeed::of(&store);

        let first = engine.run_pass(&feed).await.unwrap();
        assert_eq!(first.uploaded, 1);

        let second = engine.run_pass(&feed).await.unwrap();
        assert_eq!(second.uploaded, 0);
        assert_eq!(second.deleted, 0);
    }

    #[tokio::test]
    async fn test_delete_propagation_off() {
        let (engine, store, remote) = test_engine(|profile| {
            profile.propagate_delete = false;
        })
        .await;
        put_local(&store, "k", b"data", 1_000_000);
        let feed = TestFeed::of(&store);
        engine.run_pass(&feed).await.unwrap();
        assert!(remote.object("c", "k").is_some());

        store.delete("AUTH_a", "c", "k");
        let feed = TestFeed::of(&store);
        let stats = engine.run_pass(&feed).await.unwrap();
        assert_eq!(stats.uploaded, 0);
        assert_eq!(stats.deleted, 0);
        assert!(remote.object("c", "k").is_some());
    }

    #[tokio::test]
    async fn test_delete_propagation_on() {
        let (engine, store, remote) = test_engine(|_| {}).await;
        put_local(&store, "k", b"data", 1_000_000);
        let feed = TestFeed::of(&store);
        engine.run_pass(&feed).await.unwrap();

        store.delete("AUTH_a", "c", "k");
        let feed = TestFeed::of(&store);
        let stats = engine.run_pass(&feed).await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(remote.object("c", "k").is_none());
    }

    #[tokio::test]
    async fn test_exclude_pattern() {
        let (engine, store, remote) = test_engine(|profile| {
            profile.exclude_pattern = "^tmp/".to_string();
        })
        .await;
        put_local(&store, "tmp/scratch", b"x", 1_000_000);
        put_local(&store, "kept", b"y", 2_000_000);
        let feed = TestFeed::of(&store);

        let stats = engine.run_pass(&feed).await.unwrap();
        assert_eq!(stats.uploaded, 1);
        assert!(remote.object("c", "tmp/scratch").is_none());
        assert!(remote.object("c", "kept").is_some());
    }

    #[tokio::test]
    async fn test_metadata_only_change_posts() {
        let (engine, store, remote) = test_engine(|_| {}).await;
        put_local(&store, "k", b"data", 1_000_000);
        let feed = TestFeed::of(&store);
        engine.run_pass(&feed).await.unwrap();

        let mut metadata = UserMetadataPairs::default();
        metadata.insert(
            format!("{}color", SWIFT_USER_META_PREFIX),
            "blue".to_string(),
        );
        store.put(
            "AUTH_a",
            "c",
            "k",
            b"data",
            Timestamp::from_micros(2_000_000),
            metadata,
        );
        let feed = TestFeed::of(&store);
        let stats = engine.run_pass(&feed).await.unwrap();
        // Same etag, different metadata: a POST, not a re-upload.
        assert_eq!(stats.uploaded, 0);
        let remote_obj = remote.object("c", "k").unwrap();
        assert_eq!(
            remote_obj
                .metadata
                .get(&format!("{}color", SWIFT_USER_META_PREFIX))
                .map(String::as_str),
            Some("blue")
        );
    }

    #[tokio::test]
    async fn test_zero_byte_object() {
        let (engine, store, remote) = test_engine(|_| {}).await;
        put_local(&store, "empty", b"", 1_000_000);
        let feed = TestFeed::of(&store);
        let stats = engine.run_pass(&feed).await.unwrap();
        assert_eq!(stats.uploaded, 1);
        assert_eq!(remote.object("c", "empty").unwrap().body.len(), 0);
    }

    #[tokio::test]
    async fn test_verified_row_trails_failure() {
        let (engine, store, remote) = test_engine(|_| {}).await;
        put_local(&store, "a", b"1", 1_000_000);
        put_local(&store, "b", b"2", 2_000_000);
        remote.fail_puts_matching("a");
        let feed = TestFeed::of(&store);

        let stats = engine.run_pass(&feed).await.unwrap();
        assert_eq!(stats.errors, 1);
        let record = engine
            .status
            .load("AUTH_a", "c")
            .await
            .unwrap()
            .expect("status written");
        // Row for "a" failed, so the verified frontier stays before it,
        // while last_row records how far the pass read.
        assert!(record.verified_row < record.last_row);

        remote.clear_failures();
        let feed = TestFeed::of(&store);
        let retry = engine.run_pass(&feed).await.unwrap();
        assert_eq!(retry.errors, 0);
        assert!(remote.object("c", "a").is_some());
        let record = engine.status.load("AUTH_a", "c").await.unwrap().unwrap();
        assert_eq!(record.verified_row, record.last_row);
    }

    #[tokio::test]
    async fn test_unicode_object_roundtrip() {
        let (engine, store, remote) = test_engine(|_| {}).await;
        let name = "héllo-🚀";
        let mut metadata = UserMetadataPairs::default();
        metadata.insert(
            format!("{}désc", SWIFT_USER_META_PREFIX),
            "ünïcode → value".to_string(),
        );
        store.put(
            "AUTH_a",
            "c",
            name,
            "päyload".as_bytes(),
            Timestamp::from_micros(1_000_000),
            metadata.clone(),
        );
        let feed = TestFeed::of(&store);
        engine.run_pass(&feed).await.unwrap();

        let uploaded = remote.object("c", name).expect("unicode name survives");
        assert_eq!(uploaded.body.as_ref(), "päyload".as_bytes());
        assert_eq!(
            uploaded.metadata.get(&format!("{}désc", SWIFT_USER_META_PREFIX)),
            metadata.get(&format!("{}désc", SWIFT_USER_META_PREFIX))
        );
    }
}
