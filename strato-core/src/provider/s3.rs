use crate::error::{Result, StratoError};
use crate::provider::{
    Capabilities, ListEntry, MultipartUpload, ObjLoc, ObjectBody, Provider, ProviderConfig,
    PutOptions, PutResult, RemoteMeta, RemoteObject,
};
use crate::types::{
    MANIFEST_HEADER, S3_USER_META_PREFIX, SLO_HEADER, SWIFT_USER_META_PREFIX, SloSegment,
    UserMetadata, normalize_etag,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, CompletedMultipartUpload, CompletedPart, ExpirationStatus,
    LifecycleExpiration, LifecycleRule, LifecycleRuleFilter, ServerSideEncryption,
};
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_runtime_api::http::Response as HttpResponse;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};

/// Namespace inside the bucket where original SLO manifests are parked so
/// a later migration can restore the exact segment boundaries.
const MANIFEST_NAMESPACE: &str = ".manifests";

/// S3 remote over the AWS SDK. Object keys are laid out as
/// `<prefix>/<account>/<container>/<name>` where the prefix is an md5 of
/// `account/container` unless a custom prefix replaces it; migrations set
/// an empty prefix and address bucket keys natively.
pub struct S3Provider {
    config: ProviderConfig,
    client: aws_sdk_s3::Client,
}

impl S3Provider {
    pub async fn new(config: ProviderConfig) -> Result<Self> {
        let credentials = Credentials::new(
            config.identity.clone(),
            config.secret.clone(),
            None,
            None,
            "strato-config",
        );
        let base = aws_config::defaults(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("us-east-1"))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base).force_path_style(true);
        if !config.endpoint.is_empty() {
            builder = builder.endpoint_url(&config.endpoint);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        Ok(Self { config, client })
    }

    fn native(&self) -> bool {
        self.config.custom_prefix.as_deref() == Some("")
    }

    fn key_prefix(&self, container: &str) -> String {
        match self.config.custom_prefix.as_deref() {
            Some("") => String::new(),
            Some(custom) => format!("{}/{}/{}/", custom, self.config.account, container),
            None => {
                let hashed = hex::encode(Md5::digest(
                    format!("{}/{}", self.config.account, container).as_bytes(),
                ));
                format!("{}/{}/{}/", hashed, self.config.account, container)
            }
        }
    }

    fn object_key(&self, loc: ObjLoc<'_>) -> String {
        format!("{}{}", self.key_prefix(loc.container), loc.name)
    }

    fn manifest_key(&self, loc: ObjLoc<'_>) -> String {
        format!(
            "{}/{}/{}/{}",
            MANIFEST_NAMESPACE, self.config.account, loc.container, loc.name
        )
    }

    fn bucket(&self) -> &str {
        &self.config.bucket
    }
}

#[async_trait]
impl Provider for S3Provider {
    fn id(&self) -> String {
        self.config.content_location()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            bucket_lifecycle: true,
            per_object_expiration: false,
            account_listing: true,
            container_metadata: false,
            swift_large_objects: false,
        }
    }

    fn as_multipart(&self) -> Option<&dyn MultipartUpload> {
        Some(self)
    }

    async fn put_object(
        &self,
        loc: ObjLoc<'_>,
        opts: &PutOptions,
        body: ObjectBody,
        content_length: Option<u64>,
    ) -> Result<PutResult> {
        let bytes = body.into_bytes().await?;
        if let Some(expected) = content_length
            && expected != bytes.len() as u64
        {
            return Err(StratoError::InvalidRequest(format!(
                "content length {} does not match body size {}",
                expected,
                bytes.len()
            )));
        }

        let mut request = self
            .client
            .put_object()
            .bucket(self.bucket())
            .key(self.object_key(loc))
            .server_side_encryption(ServerSideEncryption::Aes256)
            .content_length(bytes.len() as i64)
            .body(ByteStream::from(bytes));
        if let Some(content_type) = &opts.content_type {
            request = request.content_type(content_type);
        }
        if let Some(etag) = &opts.etag
            && let Some(md5) = content_md5(etag)
        {
            request = request.content_md5(md5);
        }
        for (key, value) in encode_metadata(&opts.metadata, opts.dlo_manifest.as_deref()) {
            request = request.metadata(key, value);
        }

        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_err(e, &format!("PUT {}/{}", loc.container, loc.name)))?;
        let etag = output.e_tag().map(normalize_etag).unwrap_or_default();
        if let Some(expected) = &opts.etag
            && !crate::types::etags_match(expected, &etag)
        {
            return Err(StratoError::IntegrityMismatch {
                key: format!("{}/{}", loc.container, loc.name),
                expected: normalize_etag(expected),
                actual: etag,
            });
        }
        Ok(PutResult {
            etag,
            timestamp: None,
        })
    }

    async fn post_object(&self, loc: ObjLoc<'_>, opts: &PutOptions) -> Result<()> {
        // S3 has no metadata-only update; re-copy in place with the new
        // metadata set.
        let key = self.object_key(loc);
        let mut request = self
            .client
            .copy_object()
            .bucket(self.bucket())
            .key(&key)
            .copy_source(format!("{}/{}", self.bucket(), urlencode_path(&key)))
            .metadata_directive(aws_sdk_s3::types::MetadataDirective::Replace)
            .server_side_encryption(ServerSideEncryption::Aes256);
        if let Some(content_type) = &opts.content_type {
            request = request.content_type(content_type);
        }
        for (meta_key, value) in encode_metadata(&opts.metadata, opts.dlo_manifest.as_deref()) {
            request = request.metadata(meta_key, value);
        }
        request
            .send()
            .await
            .map_err(|e| map_sdk_err(e, &format!("COPY {}/{}", loc.container, loc.name)))?;
        Ok(())
    }

    async fn get_object(&self, loc: ObjLoc<'_>, range: Option<&str>) -> Result<RemoteObject> {
        let mut request = self
            .client
            .get_object()
            .bucket(self.bucket())
            .key(self.object_key(loc));
        if let Some(range) = range {
            request = request.range(range);
        }
        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_err(e, &format!("GET {}/{}", loc.container, loc.name)))?;

        let status = if output.content_range().is_some() { 206 } else { 200 };
        let meta = meta_from_parts(
            output.e_tag(),
            output.last_modified(),
            output.content_length(),
            output.content_type(),
            output.content_range(),
            output.metadata(),
        );
        let body = byte_stream_body(output.body);
        Ok(RemoteObject { status, meta, body })
    }

    async fn head_object(&self, loc: ObjLoc<'_>) -> Result<Option<RemoteMeta>> {
        let result = self
            .client
            .head_object()
            .bucket(self.bucket())
            .key(self.object_key(loc))
            .send()
            .await;
        match result {
            Ok(output) => Ok(Some(meta_from_parts(
                output.e_tag(),
                output.last_modified(),
                output.content_length(),
                output.content_type(),
                None,
                output.metadata(),
            ))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(map_sdk_err(
                e,
                &format!("HEAD {}/{}", loc.container, loc.name),
            )),
        }
    }

    async fn delete_object(&self, loc: ObjLoc<'_>) -> Result<()> {
        // DeleteObject is idempotent; a missing key is success already.
        self.client
            .delete_object()
            .bucket(self.bucket())
            .key(self.object_key(loc))
            .send()
            .await
            .map_err(|e| map_sdk_err(e, &format!("DELETE {}/{}", loc.container, loc.name)))?;
        Ok(())
    }

    async fn list_objects(
        &self,
        container: &str,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<Vec<ListEntry>> {
        let key_prefix = self.key_prefix(container);
        let full_prefix = format!("{}{}", key_prefix, prefix.unwrap_or(""));
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(self.bucket())
            .prefix(full_prefix)
            .max_keys(limit as i32);
        if !marker.is_empty() {
            request = request.start_after(format!("{}{}", key_prefix, marker));
        }
        if let Some(delimiter) = delimiter {
            request = request.delimiter(delimiter);
        }
        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_err(e, &format!("listing {}", container)))?;

        let location = format!(
            "{};{};{}",
            self.config.endpoint, self.config.identity, self.config.bucket
        );
        let mut entries = Vec::new();
        for object in output.contents() {
            let Some(key) = object.key() else { continue };
            let Some(name) = key.strip_prefix(&key_prefix) else {
                continue;
            };
            // The manifest namespace is bookkeeping, not data.
            if self.native() && name.starts_with(MANIFEST_NAMESPACE) {
                continue;
            }
            entries.push(ListEntry {
                name: name.to_string(),
                etag: object.e_tag().map(normalize_etag).unwrap_or_default(),
                size_bytes: object.size().unwrap_or(0) as u64,
                last_modified: object
                    .last_modified()
                    .and_then(aws_time_to_chrono)
                    .unwrap_or_else(Utc::now),
                content_type: None,
                subdir: false,
                content_location: location.clone(),
            });
        }
        for common in output.common_prefixes() {
            if let Some(prefix_key) = common.prefix()
                && let Some(name) = prefix_key.strip_prefix(&key_prefix)
            {
                entries.push(ListEntry {
                    name: name.to_string(),
                    etag: String::new(),
                    size_bytes: 0,
                    last_modified: Utc::now(),
                    content_type: None,
                    subdir: true,
                    content_location: location.clone(),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn list_buckets(
        &self,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
    ) -> Result<Vec<ListEntry>> {
        let output = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| map_sdk_err(e, "bucket listing"))?;
        let mut entries: Vec<ListEntry> = output
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name().map(str::to_string))
            .filter(|name| name.as_str() > marker)
            .filter(|name| prefix.is_none_or(|p| name.starts_with(p)))
            .map(|name| {
                let location = format!(
                    "{};{};{}",
                    self.config.endpoint, self.config.identity, name
                );
                ListEntry {
                    name,
                    etag: String::new(),
                    size_bytes: 0,
                    last_modified: Utc::now(),
                    content_type: None,
                    subdir: false,
                    content_location: location,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn put_container(&self, _container: &str, _metadata: &UserMetadata) -> Result<()> {
        let result = self
            .client
            .create_bucket()
            .bucket(self.bucket())
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(service_err))
                if matches!(
                    service_err.raw().status().as_u16(),
                    409 // BucketAlreadyOwnedByYou / BucketAlreadyExists
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(map_sdk_err(e, "create bucket")),
        }
    }

    async fn post_container(&self, container: &str, _metadata: &UserMetadata) -> Result<()> {
        Err(StratoError::InvalidRequest(format!(
            "S3 buckets carry no container metadata (container {})",
            container
        )))
    }

    async fn head_container(&self, _container: &str) -> Result<Option<Vec<(String, String)>>> {
        let result = self.client.head_bucket().bucket(self.bucket()).send().await;
        match result {
            Ok(_) => Ok(Some(Vec::new())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(map_sdk_err(e, "HEAD bucket")),
        }
    }

    async fn head_account(&self) -> Result<Vec<(String, String)>> {
        Err(StratoError::InvalidRequest(
            "S3 exposes no account metadata".to_string(),
        ))
    }

    async fn upload_manifest(
        &self,
        loc: ObjLoc<'_>,
        _manifest: &[SloSegment],
        _opts: &PutOptions,
    ) -> Result<PutResult> {
        Err(StratoError::LargeObjectPolicy(format!(
            "S3 large objects are assembled as multipart uploads: {}/{}",
            loc.container, loc.name
        )))
    }

    async fn get_manifest(&self, loc: ObjLoc<'_>) -> Result<Option<Vec<SloSegment>>> {
        let result = self
            .client
            .get_object()
            .bucket(self.bucket())
            .key(self.manifest_key(loc))
            .send()
            .await;
        let output = match result {
            Ok(output) => output,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => {
                return Err(map_sdk_err(
                    e,
                    &format!("manifest GET {}/{}", loc.container, loc.name),
                ));
            }
        };
        let raw = output
            .body
            .collect()
            .await
            .map_err(|e| StratoError::TransientNetwork(e.to_string()))?
            .into_bytes();
        let manifest: Vec<SloSegment> = serde_json::from_slice(&raw)?;
        Ok(Some(manifest))
    }

    async fn set_lifecycle(
        &self,
        container: &str,
        prefix: &str,
        delete_after_secs: u64,
    ) -> Result<()> {
        let key_prefix = format!("{}{}", self.key_prefix(container), prefix);
        let rule_id = format!("strato-{}", hex::encode(Md5::digest(key_prefix.as_bytes())));
        // Lifecycle expiration is day-granular; round up so nothing expires
        // earlier than asked.
        let days = delete_after_secs.div_ceil(24 * 60 * 60).max(1) as i32;

        let existing = match self
            .client
            .get_bucket_lifecycle_configuration()
            .bucket(self.bucket())
            .send()
            .await
        {
            Ok(output) => output.rules.unwrap_or_default(),
            Err(e) if is_not_found(&e) => Vec::new(),
            Err(e) => return Err(map_sdk_err(e, "get lifecycle")),
        };

        let rule = LifecycleRule::builder()
            .id(&rule_id)
            .status(ExpirationStatus::Enabled)
            .filter(LifecycleRuleFilter::builder().prefix(&key_prefix).build())
            .expiration(LifecycleExpiration::builder().days(days).build())
            .build()
            .map_err(|e| StratoError::Internal(e.to_string()))?;

        let mut rules: Vec<LifecycleRule> = existing
            .into_iter()
            .filter(|r| r.id() != Some(rule_id.as_str()))
            .collect();
        rules.push(rule);

        let config = BucketLifecycleConfiguration::builder()
            .set_rules(Some(rules))
            .build()
            .map_err(|e| StratoError::Internal(e.to_string()))?;
        self.client
            .put_bucket_lifecycle_configuration()
            .bucket(self.bucket())
            .lifecycle_configuration(config)
            .send()
            .await
            .map_err(|e| map_sdk_err(e, "put lifecycle"))?;
        Ok(())
    }

    fn close_idle(&self) {
        // The SDK pools per client; clients are rebuilt per migrator pass
        // by the caller, so nothing to drop here.
    }
}

#[async_trait]
impl MultipartUpload for S3Provider {
    async fn create_upload(&self, loc: ObjLoc<'_>, opts: &PutOptions) -> Result<String> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket())
            .key(self.object_key(loc))
            .server_side_encryption(ServerSideEncryption::Aes256);
        if let Some(content_type) = &opts.content_type {
            request = request.content_type(content_type);
        }
        for (key, value) in encode_metadata(&opts.metadata, opts.dlo_manifest.as_deref()) {
            request = request.metadata(key, value);
        }
        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_err(e, &format!("MPU create {}/{}", loc.container, loc.name)))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StratoError::Internal("MPU create returned no upload id".to_string()))
    }

    async fn upload_part(
        &self,
        loc: ObjLoc<'_>,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let md5 = STANDARD.encode(Md5::digest(&body));
        let output = self
            .client
            .upload_part()
            .bucket(self.bucket())
            .key(self.object_key(loc))
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .content_md5(md5)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                map_sdk_err(
                    e,
                    &format!("MPU part {} of {}/{}", part_number, loc.container, loc.name),
                )
            })?;
        Ok(output.e_tag().map(normalize_etag).unwrap_or_default())
    }

    async fn complete_upload(
        &self,
        loc: ObjLoc<'_>,
        upload_id: &str,
        part_etags: &[String],
    ) -> Result<String> {
        let parts: Vec<CompletedPart> = part_etags
            .iter()
            .enumerate()
            .map(|(index, etag)| {
                CompletedPart::builder()
                    .part_number(index as i32 + 1)
                    .e_tag(etag)
                    .build()
            })
            .collect();
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(self.bucket())
            .key(self.object_key(loc))
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_err(e, &format!("MPU complete {}/{}", loc.container, loc.name)))?;
        Ok(output.e_tag().map(normalize_etag).unwrap_or_default())
    }

    async fn abort_upload(&self, loc: ObjLoc<'_>, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(self.bucket())
            .key(self.object_key(loc))
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_err(e, &format!("MPU abort {}/{}", loc.container, loc.name)))?;
        Ok(())
    }

    async fn get_part(
        &self,
        loc: ObjLoc<'_>,
        part_number: u32,
        if_match: Option<&str>,
    ) -> Result<RemoteObject> {
        let mut request = self
            .client
            .get_object()
            .bucket(self.bucket())
            .key(self.object_key(loc))
            .part_number(part_number as i32);
        if let Some(if_match) = if_match {
            request = request.if_match(if_match);
        }
        let output = request.send().await.map_err(|e| {
            map_sdk_err(
                e,
                &format!("GET part {} of {}/{}", part_number, loc.container, loc.name),
            )
        })?;
        let meta = meta_from_parts(
            output.e_tag(),
            output.last_modified(),
            output.content_length(),
            output.content_type(),
            None,
            output.metadata(),
        );
        let body = byte_stream_body(output.body);
        Ok(RemoteObject {
            status: 200,
            meta,
            body,
        })
    }

    async fn preserve_manifest(&self, loc: ObjLoc<'_>, manifest: &[SloSegment]) -> Result<()> {
        let payload = serde_json::to_vec(manifest)?;
        self.client
            .put_object()
            .bucket(self.bucket())
            .key(self.manifest_key(loc))
            .server_side_encryption(ServerSideEncryption::Aes256)
            .body(ByteStream::from(payload))
            .send()
            .await
            .map_err(|e| {
                map_sdk_err(
                    e,
                    &format!("manifest PUT {}/{}", loc.container, loc.name),
                )
            })?;
        Ok(())
    }
}

fn byte_stream_body(body: ByteStream) -> ObjectBody {
    let stream = futures_util::stream::try_unfold(body, |mut body| async move {
        match body.try_next().await {
            Ok(Some(chunk)) => Ok(Some((chunk, body))),
            Ok(None) => Ok(None),
            Err(e) => Err(std::io::Error::other(e.to_string())),
        }
    });
    ObjectBody::Stream(Box::pin(stream))
}

fn aws_time_to_chrono(when: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(when.secs(), when.subsec_nanos())
}

/// Rebuilds a Swift-shaped view of an S3 response: metadata keys get the
/// `x-object-meta-` prefix back, the manifest markers are restored, and
/// the header list carries what the shunt relays to clients.
fn meta_from_parts(
    etag: Option<&str>,
    last_modified: Option<&aws_sdk_s3::primitives::DateTime>,
    content_length: Option<i64>,
    content_type: Option<&str>,
    content_range: Option<&str>,
    metadata: Option<&std::collections::HashMap<String, String>>,
) -> RemoteMeta {
    let mut user_meta = UserMetadata::new();
    if let Some(metadata) = metadata {
        for (key, value) in metadata {
            let value = decode_rfc2047(value);
            let lower = key.to_ascii_lowercase();
            if lower == MANIFEST_HEADER || lower == SLO_HEADER {
                user_meta.insert(lower, value);
            } else {
                user_meta.insert(format!("{}{}", SWIFT_USER_META_PREFIX, lower), value);
            }
        }
    }

    let etag = etag.map(normalize_etag).unwrap_or_default();
    let last_modified = last_modified.and_then(aws_time_to_chrono);
    let size_bytes = content_length.unwrap_or(0).max(0) as u64;

    let mut headers: Vec<(String, String)> = Vec::new();
    if !etag.is_empty() {
        headers.push(("etag".to_string(), etag.clone()));
    }
    headers.push(("content-length".to_string(), size_bytes.to_string()));
    if let Some(content_type) = content_type {
        headers.push(("content-type".to_string(), content_type.to_string()));
    }
    if let Some(when) = &last_modified {
        headers.push(("last-modified".to_string(), when.to_rfc2822()));
    }
    if let Some(range) = content_range {
        headers.push(("content-range".to_string(), range.to_string()));
    }
    for (key, value) in &user_meta {
        headers.push((key.clone(), value.clone()));
    }

    RemoteMeta {
        etag,
        timestamp: user_meta
            .get(crate::types::SOURCE_TIMESTAMP_HEADER)
            .and_then(|raw| crate::types::Timestamp::parse(raw).ok()),
        last_modified,
        size_bytes,
        content_type: content_type.map(str::to_string),
        metadata: user_meta,
        headers,
    }
}

/// Swift metadata into S3 metadata keys: the user-meta prefix comes off,
/// the large-object markers keep their full names, and non-ASCII values
/// are MIME-encoded per RFC 2047.
fn encode_metadata(
    metadata: &UserMetadata,
    dlo_manifest: Option<&str>,
) -> Vec<(String, String)> {
    let mut encoded = Vec::new();
    for (key, value) in metadata {
        let lower = key.to_ascii_lowercase();
        let meta_key = if lower == MANIFEST_HEADER || lower == SLO_HEADER {
            lower
        } else if let Some(suffix) = lower.strip_prefix(SWIFT_USER_META_PREFIX) {
            suffix.to_string()
        } else if let Some(suffix) = lower.strip_prefix(S3_USER_META_PREFIX) {
            suffix.to_string()
        } else {
            lower
        };
        encoded.push((meta_key, encode_rfc2047(value)));
    }
    if let Some(manifest) = dlo_manifest {
        encoded.push((MANIFEST_HEADER.to_string(), encode_rfc2047(manifest)));
    }
    encoded
}

pub(crate) fn encode_rfc2047(value: &str) -> String {
    if value.bytes().all(|b| (0x20..0x7f).contains(&b)) {
        return value.to_string();
    }
    let mut encoded = String::from("=?utf-8?q?");
    for byte in value.as_bytes() {
        match byte {
            b' ' => encoded.push('_'),
            b'=' | b'?' | b'_' => encoded.push_str(&format!("={:02X}", byte)),
            0x21..=0x7e => encoded.push(char::from(*byte)),
            _ => encoded.push_str(&format!("={:02X}", byte)),
        }
    }
    encoded.push_str("?=");
    encoded
}

pub(crate) fn decode_rfc2047(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix("=?")
        .and_then(|rest| rest.strip_suffix("?="))
    else {
        return value.to_string();
    };
    let mut parts = inner.splitn(3, '?');
    let charset = parts.next().unwrap_or_default();
    let encoding = parts.next().unwrap_or_default();
    let Some(payload) = parts.next() else {
        return value.to_string();
    };
    if !charset.eq_ignore_ascii_case("utf-8") {
        return value.to_string();
    }

    let bytes = match encoding {
        "q" | "Q" => {
            let mut bytes = Vec::with_capacity(payload.len());
            let mut iter = payload.bytes();
            while let Some(byte) = iter.next() {
                match byte {
                    b'_' => bytes.push(b' '),
                    b'=' => {
                        let hi = iter.next();
                        let lo = iter.next();
                        match (hi, lo) {
                            (Some(hi), Some(lo)) => {
                                let hex = [hi, lo];
                                match u8::from_str_radix(
                                    std::str::from_utf8(&hex).unwrap_or("zz"),
                                    16,
                                ) {
                                    Ok(decoded) => bytes.push(decoded),
                                    Err(_) => return value.to_string(),
                                }
                            }
                            _ => return value.to_string(),
                        }
                    }
                    other => bytes.push(other),
                }
            }
            bytes
        }
        "b" | "B" => match STANDARD.decode(payload.as_bytes()) {
            Ok(bytes) => bytes,
            Err(_) => return value.to_string(),
        },
        _ => return value.to_string(),
    };
    String::from_utf8(bytes).unwrap_or_else(|_| value.to_string())
}

/// `Content-MD5` from a plain (non-composite) local etag.
fn content_md5(etag: &str) -> Option<String> {
    let normalized = normalize_etag(etag);
    let binary = hex::decode(&normalized).ok()?;
    (binary.len() == 16).then(|| STANDARD.encode(binary))
}

fn is_not_found<E>(err: &SdkError<E, HttpResponse>) -> bool {
    match err {
        SdkError::ServiceError(service_err) => service_err.raw().status().as_u16() == 404,
        _ => false,
    }
}

fn map_sdk_err<E>(err: SdkError<E, HttpResponse>, what: &str) -> StratoError
where
    E: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(service_err) => {
            StratoError::from_status(service_err.raw().status().as_u16(), format!("{}: {:?}", what, err))
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StratoError::TransientNetwork(format!("{}: {:?}", what, err))
        }
        _ => StratoError::Internal(format!("{}: {:?}", what, err)),
    }
}

fn urlencode_path(raw: &str) -> String {
    raw.split('/')
        .map(|part| {
            let mut encoded = String::with_capacity(part.len());
            for byte in part.as_bytes() {
                if byte.is_ascii_alphanumeric() || matches!(*byte, b'-' | b'_' | b'.' | b'~') {
                    encoded.push(char::from(*byte));
                } else {
                    encoded.push_str(&format!("%{:02X}", byte));
                }
            }
            encoded
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc2047_roundtrip() {
        let plain = "simple-value";
        assert_eq!(encode_rfc2047(plain), plain);
        assert_eq!(decode_rfc2047(plain), plain);

        let unicode = "héllo wörld 🚀";
        let encoded = encode_rfc2047(unicode);
        assert!(encoded.starts_with("=?utf-8?q?"));
        assert!(encoded.is_ascii());
        assert_eq!(decode_rfc2047(&encoded), unicode);
    }

    #[test]
    fn test_rfc2047_decode_base64() {
        let encoded = format!("=?utf-8?b?{}?=", STANDARD.encode("héllo".as_bytes()));
        assert_eq!(decode_rfc2047(&encoded), "héllo");
    }

    #[test]
    fn test_rfc2047_decode_fallback() {
        // Broken encodings come back verbatim rather than erroring.
        assert_eq!(decode_rfc2047("=?utf-8?q?=Z?="), "=?utf-8?q?=Z?=");
        assert_eq!(decode_rfc2047("=?latin-1?q?abc?="), "=?latin-1?q?abc?=");
    }

    #[test]
    fn test_content_md5() {
        // md5("") in hex and its base64 form.
        let md5 = content_md5("d41d8cd98f00b204e9800998ecf8427e").unwrap();
        assert_eq!(md5, "1B2M2Y8AsgTpgAmY7PhCfg==");
        assert!(content_md5("d41d8cd98f00b204e9800998ecf8427e-3").is_none());
    }

    #[test]
    fn test_encode_metadata_prefix_stripping() {
        let mut metadata = UserMetadata::new();
        metadata.insert("X-Object-Meta-Color".to_string(), "blue".to_string());
        metadata.insert(SLO_HEADER.to_string(), "True".to_string());
        let encoded = encode_metadata(&metadata, None);
        assert!(encoded.contains(&("color".to_string(), "blue".to_string())));
        assert!(encoded.contains(&(SLO_HEADER.to_string(), "True".to_string())));
    }
}
