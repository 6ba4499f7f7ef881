use crate::config::S3_MIN_PART_SIZE;
use crate::error::{Result, StratoError};
use crate::local::LocalStore;
use crate::provider::{MultipartUpload, ObjLoc, Provider, PutOptions};
use crate::types::{
    DLO_ETAG_KEY, ObjectRef, SLO_ETAG_KEY, SloSegment, composite_etag, normalize_etag,
    slo_manifest_etag,
};

const MAX_MPU_PARTS: usize = 10_000;

/// Converts between the three large-object shapes: local SLO/DLO going
/// out as remote MPU or SLO, and (through [`restore_ranges`]) remote
/// multipart objects coming back as local SLOs.
pub struct Translator<'a> {
    local: &'a dyn LocalStore,
    provider: &'a dyn Provider,
    account: &'a str,
    min_segment_size: Option<u64>,
    segment_delete_after: Option<u64>,
}

/// One remote part assembled from one or more local segments.
#[derive(Debug)]
struct PartPlan {
    segments: Vec<SloSegment>,
    size: u64,
}

impl<'a> Translator<'a> {
    pub fn new(
        local: &'a dyn LocalStore,
        provider: &'a dyn Provider,
        account: &'a str,
        min_segment_size: Option<u64>,
        segment_delete_after: Option<u64>,
    ) -> Self {
        Self {
            local,
            provider,
            account,
            min_segment_size,
            segment_delete_after,
        }
    }

    /// Uploads a local SLO. Returns the etag the remote reports for the
    /// assembled object.
    pub async fn push_slo(&self, object: &ObjectRef, mut opts: PutOptions) -> Result<String> {
        let manifest = self
            .local
            .get_manifest(self.account, &object.container, &object.name)
            .await?;
        if manifest.is_empty() {
            return Err(StratoError::LargeObjectPolicy(format!(
                "empty SLO manifest: {}",
                object.path()
            )));
        }
        opts.metadata.insert(
            SLO_ETAG_KEY.to_string(),
            slo_manifest_etag(manifest.iter().map(|s| s.etag.as_str())),
        );
        if self.provider.as_multipart().is_some() {
            self.push_manifest_as_mpu(object, &manifest, opts).await
        } else {
            self.push_manifest_as_slo(object, &manifest, opts).await
        }
    }

    /// Expands a DLO by prefix listing at capture time and uploads the
    /// expansion as a fresh SLO (or MPU on S3). Returns the computed DLO
    /// etag, which also lands in the remote copy's metadata.
    pub async fn push_dlo_converted(
        &self,
        object: &ObjectRef,
        mut opts: PutOptions,
    ) -> Result<String> {
        if object.size_bytes > 0 {
            // A manifest that carries data of its own has no defined
            // expansion; uploading either half would lose the other.
            return Err(StratoError::LargeObjectPolicy(format!(
                "dlo_with_data: {}",
                object.path()
            )));
        }
        let manifest = self.expand_dlo(object).await?;
        let dlo_etag = slo_manifest_etag(manifest.iter().map(|s| s.etag.as_str()));
        opts.metadata
            .insert(DLO_ETAG_KEY.to_string(), dlo_etag.clone());
        if self.provider.as_multipart().is_some() {
            self.push_manifest_as_mpu(object, &manifest, opts).await?;
        } else {
            self.push_manifest_as_slo(object, &manifest, opts).await?;
        }
        Ok(dlo_etag)
    }

    /// Uploads a DLO without conversion: segments keep their containers
    /// and the manifest object goes up with its header remapped. Swift
    /// targets only.
    pub async fn push_dlo_passthrough(
        &self,
        object: &ObjectRef,
        mut opts: PutOptions,
    ) -> Result<String> {
        if !self.provider.capabilities().swift_large_objects {
            return Err(StratoError::LargeObjectPolicy(format!(
                "S3 targets need convert_dlo for {}",
                object.path()
            )));
        }
        let (segments_container, prefix) = object.dlo_manifest().ok_or_else(|| {
            StratoError::InvalidRequest(format!("not a DLO manifest: {}", object.path()))
        })?;
        let segments_container = segments_container.to_string();
        let prefix = prefix.to_string();

        let manifest = self.expand_dlo(object).await?;
        for segment in &manifest {
            self.upload_segment(segment).await?;
        }
        let dlo_etag = slo_manifest_etag(manifest.iter().map(|s| s.etag.as_str()));
        opts.metadata
            .insert(DLO_ETAG_KEY.to_string(), dlo_etag.clone());
        opts.dlo_manifest = Some(format!(
            "{}/{}",
            self.provider.remote_container_name(&segments_container),
            prefix
        ));

        // The manifest object itself may carry bytes; forward them as-is.
        let (manifest_ref, body) = self
            .local
            .get_object(self.account, &object.container, &object.name, None)
            .await?;
        opts.etag = Some(manifest_ref.etag.clone());
        self.provider
            .put_object(
                ObjLoc {
                    container: &object.container,
                    name: &object.name,
                },
                &opts,
                body,
                Some(manifest_ref.size_bytes),
            )
            .await?;
        Ok(dlo_etag)
    }

    /// The already-uploaded probe for DLOs: the computed etag stored on
    /// the remote copy against a fresh expansion of the local prefix.
    pub async fn dlo_etag(&self, object: &ObjectRef) -> Result<String> {
        let manifest = self.expand_dlo(object).await?;
        Ok(slo_manifest_etag(manifest.iter().map(|s| s.etag.as_str())))
    }

    async fn expand_dlo(&self, object: &ObjectRef) -> Result<Vec<SloSegment>> {
        let (segments_container, prefix) = object.dlo_manifest().ok_or_else(|| {
            StratoError::InvalidRequest(format!("not a DLO manifest: {}", object.path()))
        })?;
        let segments_container = segments_container.to_string();
        let prefix = prefix.to_string();

        let mut manifest = Vec::new();
        let mut marker = String::new();
        loop {
            let page = self
                .local
                .list_container(self.account, &segments_container, &marker, 1000, Some(&prefix))
                .await?;
            let Some(last) = page.last() else { break };
            marker = last.name.clone();
            for entry in page {
                if entry.subdir {
                    continue;
                }
                // The manifest can sit inside its own prefix; zero-byte
                // manifests are simply skipped, anything else was already
                // rejected by the caller.
                if segments_container == object.container && entry.name == object.name {
                    continue;
                }
                manifest.push(SloSegment {
                    path: format!("/{}/{}", segments_container, entry.name),
                    etag: entry.etag,
                    size_bytes: entry.size_bytes,
                    range: None,
                });
            }
        }
        if manifest.is_empty() {
            return Err(StratoError::LargeObjectPolicy(format!(
                "DLO prefix {}/{} lists no segments",
                segments_container, prefix
            )));
        }
        Ok(manifest)
    }

    async fn push_manifest_as_slo(
        &self,
        object: &ObjectRef,
        manifest: &[SloSegment],
        opts: PutOptions,
    ) -> Result<String> {
        if !self.provider.capabilities().swift_large_objects {
            return Err(StratoError::LargeObjectPolicy(format!(
                "target cannot hold SLO manifests: {}",
                object.path()
            )));
        }
        for segment in manifest {
            self.upload_segment(segment).await?;
        }

        let remapped: Vec<SloSegment> = manifest
            .iter()
            .map(|segment| {
                let (container, name) = segment.split_path()?;
                Ok(SloSegment {
                    path: format!(
                        "/{}/{}",
                        self.provider.remote_container_name(container),
                        name
                    ),
                    etag: segment.etag.clone(),
                    size_bytes: segment.size_bytes,
                    range: segment.range,
                })
            })
            .collect::<Result<_>>()?;

        self.provider
            .upload_manifest(
                ObjLoc {
                    container: &object.container,
                    name: &object.name,
                },
                &remapped,
                &opts,
            )
            .await?;
        Ok(slo_manifest_etag(manifest.iter().map(|s| s.etag.as_str())))
    }

    async fn upload_segment(&self, segment: &SloSegment) -> Result<()> {
        let (container, name) = segment.split_path()?;
        let (segment_ref, body) = self.local.get_object(self.account, container, name, None).await?;
        if segment_ref.is_slo() || segment_ref.dlo_manifest().is_some() {
            return Err(StratoError::LargeObjectPolicy(format!(
                "nested large object segment: {}",
                segment.path
            )));
        }
        let mut opts = PutOptions {
            content_type: segment_ref.content_type.clone(),
            metadata: segment_ref.metadata.clone(),
            etag: Some(segment_ref.etag.clone()),
            delete_after: self.segment_delete_after,
            ..Default::default()
        };
        opts.metadata.retain(|k, _| !k.eq_ignore_ascii_case(crate::types::SLO_HEADER));
        self.provider
            .put_object(
                ObjLoc { container, name },
                &opts,
                body,
                Some(segment_ref.size_bytes),
            )
            .await?;
        Ok(())
    }

    async fn push_manifest_as_mpu(
        &self,
        object: &ObjectRef,
        manifest: &[SloSegment],
        opts: PutOptions,
    ) -> Result<String> {
        let mpu = self.provider.as_multipart().ok_or_else(|| {
            StratoError::Internal("MPU assembly requires multipart support".to_string())
        })?;

        let plan = plan_parts(manifest, self.min_segment_size)?;

        let loc = ObjLoc {
            container: &object.container,
            name: &object.name,
        };
        let upload_id = mpu.create_upload(loc, &opts).await?;

        let result: Result<Vec<String>> = async {
            let mut part_etags = Vec::with_capacity(plan.len());
            for (index, part) in plan.iter().enumerate() {
                let mut buffer = Vec::with_capacity(part.size as usize);
                for segment in &part.segments {
                    let (container, name) = segment.split_path()?;
                    let range = segment
                        .range
                        .map(|(start, end)| format!("bytes={}-{}", start, end));
                    let (segment_ref, body) = self
                        .local
                        .get_object(self.account, container, name, range.as_deref())
                        .await?;
                    if segment_ref.is_slo() || segment_ref.dlo_manifest().is_some() {
                        return Err(StratoError::LargeObjectPolicy(format!(
                            "nested large object segment: {}",
                            segment.path
                        )));
                    }
                    buffer.extend_from_slice(&body.into_bytes().await?);
                }
                if buffer.len() as u64 != part.size {
                    return Err(StratoError::IntegrityMismatch {
                        key: object.path(),
                        expected: part.size.to_string(),
                        actual: buffer.len().to_string(),
                    });
                }
                let etag = mpu
                    .upload_part(loc, &upload_id, index as u32 + 1, buffer.into())
                    .await?;
                part_etags.push(etag);
            }
            Ok(part_etags)
        }
        .await;

        let part_etags = match result {
            Ok(part_etags) => part_etags,
            Err(e) => {
                // Never leave half an MPU behind; storage for unfinished
                // uploads bills until aborted.
                if let Err(abort_err) = mpu.abort_upload(loc, &upload_id).await {
                    tracing::warn!(
                        "Failed to abort multipart upload {}: {}",
                        object.path(),
                        abort_err
                    );
                }
                return Err(e);
            }
        };

        let expected = composite_etag(part_etags.iter().map(String::as_str))?;
        let remote_etag = mpu.complete_upload(loc, &upload_id, &part_etags).await?;
        if normalize_etag(&remote_etag) != expected {
            return Err(StratoError::IntegrityMismatch {
                key: object.path(),
                expected,
                actual: normalize_etag(&remote_etag),
            });
        }

        mpu.preserve_manifest(loc, manifest).await?;
        Ok(normalize_etag(&remote_etag))
    }
}

fn plan_parts(manifest: &[SloSegment], min_segment_size: Option<u64>) -> Result<Vec<PartPlan>> {
    // Ranged segments pin exact byte boundaries; coalescing would have to
    // re-slice them, so it is off for the whole run.
    let any_ranges = manifest.iter().any(|s| s.range.is_some());
    let coalesce_below = match min_segment_size {
        Some(size) if !any_ranges => size,
        _ => 0,
    };

    let mut plan: Vec<PartPlan> = Vec::new();
    for segment in manifest {
        match plan.last_mut() {
            Some(last) if last.size < coalesce_below => {
                last.size += segment.size_bytes;
                last.segments.push(segment.clone());
            }
            _ => plan.push(PartPlan {
                segments: vec![segment.clone()],
                size: segment.size_bytes,
            }),
        }
    }

    if plan.len() > MAX_MPU_PARTS {
        return Err(StratoError::LargeObjectPolicy(format!(
            "SLO expands to {} parts, multipart caps at {}",
            plan.len(),
            MAX_MPU_PARTS
        )));
    }
    // All but the final part must clear the remote's minimum; failing here
    // keeps the upload from starting at all.
    for part in plan.iter().take(plan.len().saturating_sub(1)) {
        if part.size < S3_MIN_PART_SIZE {
            return Err(StratoError::LargeObjectPolicy(format!(
                "part of {} bytes is below the {} byte multipart minimum",
                part.size, S3_MIN_PART_SIZE
            )));
        }
    }
    Ok(plan)
}

/// Byte ranges for restoring an oversized single remote object as local
/// SLO segments of at most `segment_size` each.
pub fn restore_ranges(content_length: u64, segment_size: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut start = 0u64;
    while start < content_length {
        let end = (start + segment_size).min(content_length) - 1;
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(path: &str, size: u64) -> SloSegment {
        SloSegment {
            path: path.to_string(),
            etag: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            size_bytes: size,
            range: None,
        }
    }

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_plan_without_coalescing() {
        let manifest = vec![
            segment("/segs/1", 6 * MIB),
            segment("/segs/2", 6 * MIB),
            segment("/segs/3", 6 * MIB),
        ];
        let plan = plan_parts(&manifest, None).unwrap();
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|p| p.segments.len() == 1));
    }

    #[test]
    fn test_plan_coalesces_small_segments() {
        let manifest = vec![
            segment("/segs/1", 2 * MIB),
            segment("/segs/2", 2 * MIB),
            segment("/segs/3", 2 * MIB),
            segment("/segs/4", 2 * MIB),
        ];
        let plan = plan_parts(&manifest, Some(5 * MIB)).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].size, 6 * MIB);
        assert_eq!(plan[1].size, 2 * MIB);
    }

    #[test]
    fn test_plan_ranges_disable_coalescing() {
        let mut ranged = segment("/segs/1", 2 * MIB);
        ranged.range = Some((0, 2 * MIB - 1));
        let manifest = vec![ranged, segment("/segs/2", 6 * MIB)];
        // With coalescing disabled the first (undersized) part fails the
        // minimum-part check instead of being merged.
        assert!(matches!(
            plan_parts(&manifest, Some(5 * MIB)),
            Err(StratoError::LargeObjectPolicy(_))
        ));
    }

    #[test]
    fn test_plan_rejects_undersized_part() {
        let manifest = vec![segment("/segs/1", MIB), segment("/segs/2", 6 * MIB)];
        assert!(matches!(
            plan_parts(&manifest, None),
            Err(StratoError::LargeObjectPolicy(_))
        ));
        // A lone undersized segment is fine: the final part may be small.
        let single = vec![segment("/segs/1", MIB)];
        assert_eq!(plan_parts(&single, None).unwrap().len(), 1);
    }

    #[test]
    fn test_restore_ranges() {
        assert_eq!(restore_ranges(10, 4), vec![(0, 3), (4, 7), (8, 9)]);
        assert_eq!(restore_ranges(8, 4), vec![(0, 3), (4, 7)]);
        assert_eq!(restore_ranges(0, 4), Vec::<(u64, u64)>::new());
    }

    mod with_fakes {
        use super::*;
        use crate::testing::{TestRemote, TestStore};
        use crate::types::{MANIFEST_HEADER, Timestamp, UserMetadata, composite_etag};
        use md5::{Digest, Md5};

        fn seed_slo(store: &TestStore, segment_size: usize) -> (crate::types::ObjectRef, Vec<String>) {
            let mut manifest = Vec::new();
            let mut etags = Vec::new();
            for index in 0..3 {
                let body = vec![index as u8 + 1; segment_size];
                let name = format!("big/{:08}", index + 1);
                store.put(
                    "AUTH_a",
                    "segs",
                    &name,
                    &body,
                    Timestamp::from_micros(1_000_000 + index),
                    UserMetadata::new(),
                );
                let etag = hex::encode(Md5::digest(&body));
                etags.push(etag.clone());
                manifest.push(SloSegment {
                    path: format!("/segs/{}", name),
                    etag,
                    size_bytes: segment_size as u64,
                    range: None,
                });
            }
            store.put_slo(
                "AUTH_a",
                "c",
                "big",
                manifest,
                Timestamp::from_micros(2_000_000),
                UserMetadata::new(),
            );
            (store.head("AUTH_a", "c", "big").unwrap(), etags)
        }

        #[tokio::test]
        async fn test_slo_to_mpu_composite_etag() {
            let store = TestStore::new();
            let remote = TestRemote::s3();
            let (object, etags) = seed_slo(&store, 6 * MIB as usize);

            let translator = Translator::new(&store, &remote, "AUTH_a", None, None);
            let remote_etag = translator
                .push_slo(&object, PutOptions::default())
                .await
                .unwrap();

            // One segment per part, so the composite is computable from the
            // original segment etags.
            let expected =
                composite_etag(etags.iter().map(String::as_str)).unwrap();
            assert_eq!(remote_etag, expected);
            assert!(remote_etag.ends_with("-3"));

            let uploaded = remote.object("c", "big").unwrap();
            assert_eq!(uploaded.body.len(), 18 * MIB as usize);
            assert_eq!(uploaded.etag, expected);
            // Original boundaries parked for restore.
            let preserved = remote.manifest("c", "big").unwrap();
            assert_eq!(preserved.len(), 3);
            assert_eq!(preserved[0].etag, etags[0]);
            assert_eq!(remote.pending_uploads(), 0);
        }

        #[tokio::test]
        async fn test_undersized_slo_fails_without_partial_upload() {
            let store = TestStore::new();
            let remote = TestRemote::s3();
            let (object, _) = seed_slo(&store, MIB as usize);

            let translator = Translator::new(&store, &remote, "AUTH_a", None, None);
            let err = translator
                .push_slo(&object, PutOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, StratoError::LargeObjectPolicy(_)));
            assert!(remote.object("c", "big").is_none());
            assert_eq!(remote.pending_uploads(), 0);
        }

        #[tokio::test]
        async fn test_slo_to_swift_remaps_and_uploads_segments() {
            let store = TestStore::new();
            let remote = TestRemote::swift();
            let (object, etags) = seed_slo(&store, 1024);

            let translator = Translator::new(&store, &remote, "AUTH_a", None, None);
            translator
                .push_slo(&object, PutOptions::default())
                .await
                .unwrap();

            for index in 0..3 {
                assert!(
                    remote.object("segs", &format!("big/{:08}", index + 1)).is_some(),
                    "segment {} uploaded",
                    index
                );
            }
            let manifest = remote.manifest("c", "big").unwrap();
            assert_eq!(manifest[0].etag, etags[0]);
            assert!(manifest[0].path.starts_with("/segs/"));
        }

        #[tokio::test]
        async fn test_dlo_with_data_is_skipped() {
            let store = TestStore::new();
            let remote = TestRemote::swift();
            store.put(
                "AUTH_a",
                "segs",
                "parts/0001",
                b"segment-data",
                Timestamp::from_micros(1_000_000),
                UserMetadata::new(),
            );
            let mut metadata = UserMetadata::new();
            metadata.insert(MANIFEST_HEADER.to_string(), "segs/parts/".to_string());
            store.put(
                "AUTH_a",
                "c",
                "dlo",
                b"stray manifest payload",
                Timestamp::from_micros(2_000_000),
                metadata,
            );
            let object = store.head("AUTH_a", "c", "dlo").unwrap();

            let translator = Translator::new(&store, &remote, "AUTH_a", None, None);
            let err = translator
                .push_dlo_converted(&object, PutOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, StratoError::LargeObjectPolicy(_)));
            assert!(err.to_string().contains("dlo_with_data"));
            assert!(remote.object("c", "dlo").is_none());
        }

        #[tokio::test]
        async fn test_dlo_converted_to_slo() {
            let store = TestStore::new();
            let remote = TestRemote::swift();
            for index in 0..2 {
                store.put(
                    "AUTH_a",
                    "segs",
                    &format!("parts/{:04}", index),
                    format!("chunk-{}", index).as_bytes(),
                    Timestamp::from_micros(1_000_000 + index),
                    UserMetadata::new(),
                );
            }
            let mut metadata = UserMetadata::new();
            metadata.insert(MANIFEST_HEADER.to_string(), "segs/parts/".to_string());
            store.put(
                "AUTH_a",
                "c",
                "dlo",
                b"",
                Timestamp::from_micros(2_000_000),
                metadata,
            );
            let object = store.head("AUTH_a", "c", "dlo").unwrap();

            let translator = Translator::new(&store, &remote, "AUTH_a", None, None);
            let dlo_etag = translator
                .push_dlo_converted(&object, PutOptions::default())
                .await
                .unwrap();

            let manifest = remote.manifest("c", "dlo").unwrap();
            assert_eq!(manifest.len(), 2);
            let uploaded = remote.object("c", "dlo").unwrap();
            assert_eq!(
                uploaded.metadata.get(DLO_ETAG_KEY).map(String::as_str),
                Some(dlo_etag.as_str())
            );
        }
    }
}
