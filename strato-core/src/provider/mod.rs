use crate::config::{MigrationProfile, Protocol, SyncProfile};
use crate::error::{Result, StratoError};
use crate::types::{
    MANIFEST_HEADER, SLO_HEADER, SloSegment, Timestamp, UserMetadata,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

mod s3;
mod swift;

pub use s3::S3Provider;
pub use swift::SwiftProvider;
pub use swift::{format_swift_time, parse_swift_time as swift_listing_time};

/// Object body on its way in or out of a provider. Small bodies travel as
/// one buffer; GET responses stream.
pub enum ObjectBody {
    Buffered(Bytes),
    Stream(BoxStream<'static, std::io::Result<Bytes>>),
}

impl ObjectBody {
    pub fn empty() -> Self {
        ObjectBody::Buffered(Bytes::new())
    }

    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            ObjectBody::Buffered(bytes) => Ok(bytes),
            ObjectBody::Stream(mut stream) => {
                use futures_util::StreamExt;
                let mut buf = Vec::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(
                        &chunk.map_err(|e| StratoError::TransientNetwork(e.to_string()))?,
                    );
                }
                Ok(Bytes::from(buf))
            }
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, std::io::Result<Bytes>> {
        match self {
            ObjectBody::Buffered(bytes) => {
                Box::pin(futures_util::stream::once(async move { Ok(bytes) }))
            }
            ObjectBody::Stream(stream) => stream,
        }
    }
}

impl From<Bytes> for ObjectBody {
    fn from(bytes: Bytes) -> Self {
        ObjectBody::Buffered(bytes)
    }
}

/// Source-side address of an object; each provider maps it onto its own
/// remote namespace (bucket key layout or remote container naming).
#[derive(Debug, Clone, Copy)]
pub struct ObjLoc<'a> {
    pub container: &'a str,
    pub name: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    /// Swift-style user metadata (`x-object-meta-*` keys).
    pub metadata: UserMetadata,
    /// Local etag; S3 turns it into Content-MD5, Swift into the ETag header.
    pub etag: Option<String>,
    pub delete_after: Option<u64>,
    pub delete_at: Option<i64>,
    /// DLO manifest value (`container/prefix`), already remapped.
    pub dlo_manifest: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub etag: String,
    pub timestamp: Option<Timestamp>,
}

/// Remote object metadata with the full header set already converted to
/// Swift conventions, so the shunt can relay it untranslated.
#[derive(Debug, Clone)]
pub struct RemoteMeta {
    pub etag: String,
    pub timestamp: Option<Timestamp>,
    pub last_modified: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub metadata: UserMetadata,
    pub headers: Vec<(String, String)>,
}

impl RemoteMeta {
    /// The Swift timestamp when the source carried one, otherwise
    /// synthesized from `Last-Modified`.
    pub fn effective_timestamp(&self) -> Option<Timestamp> {
        self.timestamp.or_else(|| {
            self.last_modified.map(Timestamp::from_last_modified)
        })
    }

    pub fn is_slo(&self) -> bool {
        self.metadata
            .get(SLO_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn dlo_manifest(&self) -> Option<&str> {
        self.metadata.get(MANIFEST_HEADER).map(String::as_str)
    }
}

pub struct RemoteObject {
    pub status: u16,
    pub meta: RemoteMeta,
    pub body: ObjectBody,
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub name: String,
    pub etag: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub content_type: Option<String>,
    pub subdir: bool,
    /// `endpoint;identity;bucket` marker surfaced in merged listings.
    pub content_location: String,
}

/// What a variant can do beyond the common surface. Callers probe these
/// instead of sniffing for methods.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// Expiration installed as a bucket lifecycle rule (S3).
    pub bucket_lifecycle: bool,
    /// Expiration carried per object via X-Delete-At/After (Swift).
    pub per_object_expiration: bool,
    /// Account-level container listing is available.
    pub account_listing: bool,
    /// Container metadata/ACL propagation is meaningful.
    pub container_metadata: bool,
    /// The remote understands SLO/DLO manifests natively (Swift).
    pub swift_large_objects: bool,
}

/// Part-level multipart control, needed by the large-object translator to
/// assemble MPUs with known part etags. Probed via
/// [`Provider::as_multipart`].
#[async_trait]
pub trait MultipartUpload: Send + Sync {
    async fn create_upload(&self, loc: ObjLoc<'_>, opts: &PutOptions) -> Result<String>;

    async fn upload_part(
        &self,
        loc: ObjLoc<'_>,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String>;

    /// Returns the composite etag reported by the remote.
    async fn complete_upload(
        &self,
        loc: ObjLoc<'_>,
        upload_id: &str,
        part_etags: &[String],
    ) -> Result<String>;

    async fn abort_upload(&self, loc: ObjLoc<'_>, upload_id: &str) -> Result<()>;

    /// Fetches one part of an existing multipart object, preserving the
    /// source's part boundaries on restore.
    async fn get_part(
        &self,
        loc: ObjLoc<'_>,
        part_number: u32,
        if_match: Option<&str>,
    ) -> Result<RemoteObject>;

    /// Parks the original SLO manifest next to the assembled data so a
    /// later restore can rebuild identical segment boundaries.
    async fn preserve_manifest(&self, loc: ObjLoc<'_>, manifest: &[SloSegment]) -> Result<()>;
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier recorded on migrated objects and in
    /// `content_location` markers: `endpoint;identity;bucket`.
    fn id(&self) -> String;

    fn capabilities(&self) -> Capabilities;

    /// Part-level multipart control where the variant has it (S3).
    fn as_multipart(&self) -> Option<&dyn MultipartUpload> {
        None
    }

    /// How a source container is named on the remote; manifests uploaded
    /// to Swift targets reference segments through this mapping.
    fn remote_container_name(&self, source_container: &str) -> String {
        source_container.to_string()
    }

    async fn put_object(
        &self,
        loc: ObjLoc<'_>,
        opts: &PutOptions,
        body: ObjectBody,
        content_length: Option<u64>,
    ) -> Result<PutResult>;

    /// Metadata-only update.
    async fn post_object(&self, loc: ObjLoc<'_>, opts: &PutOptions) -> Result<()>;

    /// `range` is a raw `Range` header value passed through untouched.
    async fn get_object(&self, loc: ObjLoc<'_>, range: Option<&str>) -> Result<RemoteObject>;

    async fn head_object(&self, loc: ObjLoc<'_>) -> Result<Option<RemoteMeta>>;

    /// 404 from the remote is success; a newer remote copy (409) is too.
    async fn delete_object(&self, loc: ObjLoc<'_>) -> Result<()>;

    async fn list_objects(
        &self,
        container: &str,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<Vec<ListEntry>>;

    /// Account-level container listing; only meaningful where
    /// `capabilities().account_listing` holds.
    async fn list_buckets(
        &self,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
    ) -> Result<Vec<ListEntry>>;

    async fn put_container(&self, container: &str, metadata: &UserMetadata) -> Result<()>;

    async fn post_container(&self, container: &str, metadata: &UserMetadata) -> Result<()>;

    async fn head_container(&self, container: &str) -> Result<Option<Vec<(String, String)>>>;

    async fn head_account(&self) -> Result<Vec<(String, String)>>;

    /// Uploads an SLO manifest referencing already-uploaded segments.
    async fn upload_manifest(
        &self,
        loc: ObjLoc<'_>,
        manifest: &[SloSegment],
        opts: &PutOptions,
    ) -> Result<PutResult>;

    /// Fetches a remote SLO manifest, None when the object is not an SLO.
    async fn get_manifest(&self, loc: ObjLoc<'_>) -> Result<Option<Vec<SloSegment>>>;

    /// Installs expiration on the remote key prefix (bucket lifecycle).
    async fn set_lifecycle(
        &self,
        container: &str,
        prefix: &str,
        delete_after_secs: u64,
    ) -> Result<()>;

    /// Drops pooled connections; called at the end of a migrator pass so
    /// idle deployments do not pin remote listen queues.
    fn close_idle(&self);
}

/// Connection parameters shared by both provider variants.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub identity: String,
    pub secret: String,
    pub bucket: String,
    pub protocol: Protocol,
    pub account: String,
    pub container: String,
    pub per_account: bool,
    pub custom_prefix: Option<String>,
    pub remote_account: Option<String>,
}

impl ProviderConfig {
    pub fn from_sync(profile: &SyncProfile) -> Self {
        Self {
            endpoint: profile.aws_endpoint.clone(),
            identity: profile.aws_identity.clone(),
            secret: profile.aws_secret.clone(),
            bucket: profile.aws_bucket.clone(),
            protocol: profile.protocol,
            account: profile.account.clone(),
            container: profile.container.clone(),
            per_account: profile.per_account(),
            custom_prefix: profile.custom_prefix.clone(),
            remote_account: profile.remote_account.clone(),
        }
    }

    pub fn from_migration(profile: &MigrationProfile) -> Self {
        Self {
            endpoint: profile.aws_endpoint.clone(),
            identity: profile.aws_identity.clone(),
            secret: profile.aws_secret.clone(),
            bucket: profile.aws_bucket.clone(),
            protocol: profile.protocol,
            account: profile.account.clone(),
            container: profile.local_container().to_string(),
            per_account: profile.all_buckets(),
            // Migrations always address the bucket natively.
            custom_prefix: Some(String::new()),
            remote_account: profile.remote_account.clone(),
        }
    }

    pub fn content_location(&self) -> String {
        format!("{};{};{}", self.endpoint, self.identity, self.bucket)
    }
}

/// The two wire protocols behind one dispatch point. Call sites hold this
/// enum; variant-specific features are reached through capability probes.
pub enum RemoteProvider {
    Swift(SwiftProvider),
    S3(S3Provider),
}

impl RemoteProvider {
    pub async fn create(config: ProviderConfig) -> Result<Self> {
        match config.protocol {
            Protocol::Swift => Ok(RemoteProvider::Swift(SwiftProvider::new(config)?)),
            Protocol::S3 => Ok(RemoteProvider::S3(S3Provider::new(config).await?)),
        }
    }

    fn inner(&self) -> &dyn Provider {
        match self {
            RemoteProvider::Swift(swift) => swift,
            RemoteProvider::S3(s3) => s3,
        }
    }
}

#[async_trait]
impl Provider for RemoteProvider {
    fn id(&self) -> String {
        self.inner().id()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner().capabilities()
    }

    fn as_multipart(&self) -> Option<&dyn MultipartUpload> {
        match self {
            RemoteProvider::Swift(_) => None,
            RemoteProvider::S3(s3) => Some(s3),
        }
    }

    fn remote_container_name(&self, source_container: &str) -> String {
        self.inner().remote_container_name(source_container)
    }

    async fn put_object(
        &self,
        loc: ObjLoc<'_>,
        opts: &PutOptions,
        body: ObjectBody,
        content_length: Option<u64>,
    ) -> Result<PutResult> {
        self.inner().put_object(loc, opts, body, content_length).await
    }

    async fn post_object(&self, loc: ObjLoc<'_>, opts: &PutOptions) -> Result<()> {
        self.inner().post_object(loc, opts).await
    }

    async fn get_object(&self, loc: ObjLoc<'_>, range: Option<&str>) -> Result<RemoteObject> {
        self.inner().get_object(loc, range).await
    }

    async fn head_object(&self, loc: ObjLoc<'_>) -> Result<Option<RemoteMeta>> {
        self.inner().head_object(loc).await
    }

    async fn delete_object(&self, loc: ObjLoc<'_>) -> Result<()> {
        self.inner().delete_object(loc).await
    }

    async fn list_objects(
        &self,
        container: &str,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<Vec<ListEntry>> {
        self.inner()
            .list_objects(container, marker, limit, prefix, delimiter)
            .await
    }

    async fn list_buckets(
        &self,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
    ) -> Result<Vec<ListEntry>> {
        self.inner().list_buckets(marker, limit, prefix).await
    }

    async fn put_container(&self, container: &str, metadata: &UserMetadata) -> Result<()> {
        self.inner().put_container(container, metadata).await
    }

    async fn post_container(&self, container: &str, metadata: &UserMetadata) -> Result<()> {
        self.inner().post_container(container, metadata).await
    }

    async fn head_container(&self, container: &str) -> Result<Option<Vec<(String, String)>>> {
        self.inner().head_container(container).await
    }

    async fn head_account(&self) -> Result<Vec<(String, String)>> {
        self.inner().head_account().await
    }

    async fn upload_manifest(
        &self,
        loc: ObjLoc<'_>,
        manifest: &[SloSegment],
        opts: &PutOptions,
    ) -> Result<PutResult> {
        self.inner().upload_manifest(loc, manifest, opts).await
    }

    async fn get_manifest(&self, loc: ObjLoc<'_>) -> Result<Option<Vec<SloSegment>>> {
        self.inner().get_manifest(loc).await
    }

    async fn set_lifecycle(
        &self,
        container: &str,
        prefix: &str,
        delete_after_secs: u64,
    ) -> Result<()> {
        self.inner()
            .set_lifecycle(container, prefix, delete_after_secs)
            .await
    }

    fn close_idle(&self) {
        self.inner().close_idle()
    }
}
