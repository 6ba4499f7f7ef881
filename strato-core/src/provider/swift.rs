use crate::error::{Result, StratoError};
use crate::provider::{
    Capabilities, ListEntry, ObjLoc, ObjectBody, Provider, ProviderConfig, PutOptions, PutResult,
    RemoteMeta, RemoteObject,
};
use crate::types::{
    MANIFEST_HEADER, SLO_HEADER, SWIFT_USER_META_PREFIX, SloSegment, Timestamp, UserMetadata,
    normalize_etag,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;

const SWIFT_TIME_FMT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Clone)]
struct AuthState {
    token: String,
    storage_url: String,
}

/// Swift remote speaking TempAuth-style token auth. The token is fetched
/// lazily and refreshed once on 401 before the error surfaces.
pub struct SwiftProvider {
    config: ProviderConfig,
    client: Mutex<reqwest::Client>,
    auth: AsyncMutex<Option<AuthState>>,
}

#[derive(Debug, Deserialize)]
struct SwiftListingEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    subdir: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    bytes: Option<u64>,
    #[serde(default)]
    last_modified: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SwiftManifestEntry {
    #[serde(alias = "path")]
    name: String,
    #[serde(alias = "etag")]
    hash: String,
    #[serde(alias = "size_bytes")]
    bytes: u64,
    #[serde(default)]
    range: Option<String>,
}

impl SwiftProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            config,
            client: Mutex::new(reqwest::Client::new()),
            auth: AsyncMutex::new(None),
        })
    }

    fn http(&self) -> reqwest::Client {
        self.client.lock().expect("client lock").clone()
    }

    /// Maps a source container to its remote name. The profile's own
    /// container becomes the bucket; any other (segments containers, DLO
    /// prefixes) keeps its name so an account-wide sync pass does not copy
    /// segments twice.
    pub fn remote_container(&self, source_container: &str) -> String {
        if self.config.per_account {
            return format!("{}{}", self.config.bucket, source_container);
        }
        if source_container == self.config.container {
            self.config.bucket.clone()
        } else {
            source_container.to_string()
        }
    }

    async fn authenticate(&self) -> Result<AuthState> {
        let response = self
            .http()
            .get(&self.config.endpoint)
            .header("X-Auth-User", &self.config.identity)
            .header("X-Auth-Key", &self.config.secret)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StratoError::Auth {
                endpoint: self.config.endpoint.clone(),
                message: format!("auth returned {}", response.status()),
            });
        }
        let token = header_string(response.headers(), "x-auth-token").ok_or_else(|| {
            StratoError::Auth {
                endpoint: self.config.endpoint.clone(),
                message: "auth response missing X-Auth-Token".to_string(),
            }
        })?;
        let mut storage_url =
            header_string(response.headers(), "x-storage-url").ok_or_else(|| StratoError::Auth {
                endpoint: self.config.endpoint.clone(),
                message: "auth response missing X-Storage-Url".to_string(),
            })?;

        if let Some(remote_account) = &self.config.remote_account {
            let url = reqwest::Url::parse(&storage_url)
                .map_err(|e| StratoError::Internal(format!("bad storage url: {}", e)))?;
            let origin = url.origin().ascii_serialization();
            storage_url = format!("{}/v1/{}", origin, urlencode(remote_account));
        }

        Ok(AuthState {
            token,
            storage_url: storage_url.trim_end_matches('/').to_string(),
        })
    }

    async fn auth_state(&self, force: bool) -> Result<AuthState> {
        let mut guard = self.auth.lock().await;
        if force || guard.is_none() {
            *guard = Some(self.authenticate().await?);
        }
        Ok(guard.clone().expect("auth state populated"))
    }

    /// Issues a request, re-authenticating once on 401.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        headers: HeaderMap,
        body: Option<ObjectBody>,
    ) -> Result<reqwest::Response> {
        // Streaming bodies cannot be replayed after a 401; everything else
        // gets one re-auth attempt.
        let replayable = !matches!(body, Some(ObjectBody::Stream(_)));
        let mut body = body;
        let mut attempt = 0;
        loop {
            let auth = self.auth_state(attempt > 0).await?;
            let url = format!("{}/{}", auth.storage_url, path);
            let mut request = self
                .http()
                .request(method.clone(), &url)
                .header("X-Auth-Token", &auth.token)
                .headers(headers.clone());
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(payload) = body.take() {
                match payload {
                    ObjectBody::Buffered(bytes) => {
                        body = Some(ObjectBody::Buffered(bytes.clone()));
                        request = request.body(bytes);
                    }
                    ObjectBody::Stream(stream) => {
                        request = request.body(reqwest::Body::wrap_stream(stream));
                    }
                }
            }
            let response = request.send().await?;
            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 && replayable {
                attempt += 1;
                continue;
            }
            return Ok(response);
        }
    }

    fn object_path(&self, loc: ObjLoc<'_>) -> String {
        format!(
            "{}/{}",
            urlencode(&self.remote_container(loc.container)),
            urlencode_path(loc.name)
        )
    }

    fn entry_location(&self, container: &str) -> String {
        format!(
            "{};{};{}",
            self.config.endpoint, self.config.identity, container
        )
    }
}

#[async_trait]
impl Provider for SwiftProvider {
    fn id(&self) -> String {
        self.config.content_location()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            bucket_lifecycle: false,
            per_object_expiration: true,
            account_listing: true,
            container_metadata: true,
            swift_large_objects: true,
        }
    }

    fn remote_container_name(&self, source_container: &str) -> String {
        self.remote_container(source_container)
    }

    async fn put_object(
        &self,
        loc: ObjLoc<'_>,
        opts: &PutOptions,
        body: ObjectBody,
        content_length: Option<u64>,
    ) -> Result<PutResult> {
        let mut headers = options_headers(opts)?;
        if let Some(length) = content_length {
            headers.insert("content-length", HeaderValue::from_str(&length.to_string())
                .map_err(|e| StratoError::InvalidRequest(e.to_string()))?);
        }
        if let Some(etag) = &opts.etag {
            headers.insert("etag", header_value(&normalize_etag(etag))?);
        }
        let response = self
            .request(Method::PUT, &self.object_path(loc), &[], headers, Some(body))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("PUT {}/{}", loc.container, loc.name),
            ));
        }
        let etag = header_string(response.headers(), "etag")
            .map(|raw| normalize_etag(&raw))
            .unwrap_or_default();
        Ok(PutResult {
            etag,
            timestamp: header_string(response.headers(), "x-timestamp")
                .and_then(|raw| Timestamp::parse(&raw).ok()),
        })
    }

    async fn post_object(&self, loc: ObjLoc<'_>, opts: &PutOptions) -> Result<()> {
        let headers = options_headers(opts)?;
        let response = self
            .request(Method::POST, &self.object_path(loc), &[], headers, None)
            .await?;
        if !response.status().is_success() {
            return Err(StratoError::from_status(
                response.status().as_u16(),
                format!("POST {}/{}", loc.container, loc.name),
            ));
        }
        Ok(())
    }

    async fn get_object(&self, loc: ObjLoc<'_>, range: Option<&str>) -> Result<RemoteObject> {
        let mut headers = HeaderMap::new();
        if let Some(range) = range {
            headers.insert("range", header_value(range)?);
        }
        let response = self
            .request(Method::GET, &self.object_path(loc), &[], headers, None)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("GET {}/{}", loc.container, loc.name),
            ));
        }
        let meta = parse_meta(response.headers());
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok(RemoteObject {
            status: status.as_u16(),
            meta,
            body: ObjectBody::Stream(Box::pin(stream)),
        })
    }

    async fn head_object(&self, loc: ObjLoc<'_>) -> Result<Option<RemoteMeta>> {
        let response = self
            .request(
                Method::HEAD,
                &self.object_path(loc),
                &[],
                HeaderMap::new(),
                None,
            )
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("HEAD {}/{}", loc.container, loc.name),
            ));
        }
        Ok(Some(parse_meta(response.headers())))
    }

    async fn delete_object(&self, loc: ObjLoc<'_>) -> Result<()> {
        // The remote copy may be an SLO; those need the manifest delete
        // query or the segments leak.
        let head = self.head_object(loc).await?;
        let Some(meta) = head else {
            return Ok(());
        };
        let query: &[(&str, &str)] = if meta.is_slo() {
            &[("multipart-manifest", "delete")]
        } else {
            &[]
        };
        let response = self
            .request(
                Method::DELETE,
                &self.object_path(loc),
                query,
                HeaderMap::new(),
                None,
            )
            .await?;
        let status = response.status();
        // 404 means someone beat us to it; 409 means the remote copy is
        // newer than the delete. Both count as done.
        if status.is_success()
            || status == StatusCode::NOT_FOUND
            || status == StatusCode::CONFLICT
        {
            return Ok(());
        }
        Err(StratoError::from_status(
            status.as_u16(),
            format!("DELETE {}/{}", loc.container, loc.name),
        ))
    }

    async fn list_objects(
        &self,
        container: &str,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<Vec<ListEntry>> {
        let remote_container = self.remote_container(container);
        let limit = limit.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("format", "json"),
            ("marker", marker),
            ("limit", &limit),
        ];
        if let Some(prefix) = prefix {
            query.push(("prefix", prefix));
        }
        if let Some(delimiter) = delimiter {
            query.push(("delimiter", delimiter));
        }
        let response = self
            .request(
                Method::GET,
                &urlencode(&remote_container),
                &query,
                HeaderMap::new(),
                None,
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("listing {}", remote_container),
            ));
        }
        let entries: Vec<SwiftListingEntry> = response.json().await?;
        Ok(entries
            .into_iter()
            .map(|entry| self.convert_entry(entry, &remote_container))
            .collect())
    }

    async fn list_buckets(
        &self,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
    ) -> Result<Vec<ListEntry>> {
        let limit = limit.to_string();
        let mut query: Vec<(&str, &str)> =
            vec![("format", "json"), ("marker", marker), ("limit", &limit)];
        if let Some(prefix) = prefix {
            query.push(("prefix", prefix));
        }
        let response = self
            .request(Method::GET, "", &query, HeaderMap::new(), None)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                "account listing".to_string(),
            ));
        }
        let entries: Vec<SwiftListingEntry> = response.json().await?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let name = entry.name.clone().unwrap_or_default();
                let location = self.entry_location(&name);
                ListEntry {
                    name,
                    etag: String::new(),
                    size_bytes: entry.bytes.unwrap_or(0),
                    last_modified: Utc::now(),
                    content_type: None,
                    subdir: false,
                    content_location: location,
                }
            })
            .collect())
    }

    async fn put_container(&self, container: &str, metadata: &UserMetadata) -> Result<()> {
        let headers = metadata_headers(metadata)?;
        let response = self
            .request(
                Method::PUT,
                &urlencode(&self.remote_container(container)),
                &[],
                headers,
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(StratoError::from_status(
                response.status().as_u16(),
                format!("PUT container {}", container),
            ));
        }
        Ok(())
    }

    async fn post_container(&self, container: &str, metadata: &UserMetadata) -> Result<()> {
        let headers = metadata_headers(metadata)?;
        let response = self
            .request(
                Method::POST,
                &urlencode(&self.remote_container(container)),
                &[],
                headers,
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(StratoError::from_status(
                response.status().as_u16(),
                format!("POST container {}", container),
            ));
        }
        Ok(())
    }

    async fn head_container(&self, container: &str) -> Result<Option<Vec<(String, String)>>> {
        let response = self
            .request(
                Method::HEAD,
                &urlencode(&self.remote_container(container)),
                &[],
                HeaderMap::new(),
                None,
            )
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("HEAD container {}", container),
            ));
        }
        Ok(Some(all_headers(response.headers())))
    }

    async fn head_account(&self) -> Result<Vec<(String, String)>> {
        let response = self
            .request(Method::HEAD, "", &[], HeaderMap::new(), None)
            .await?;
        if !response.status().is_success() {
            return Err(StratoError::from_status(
                response.status().as_u16(),
                "HEAD account".to_string(),
            ));
        }
        Ok(all_headers(response.headers()))
    }

    async fn upload_manifest(
        &self,
        loc: ObjLoc<'_>,
        manifest: &[SloSegment],
        opts: &PutOptions,
    ) -> Result<PutResult> {
        #[derive(serde::Serialize)]
        struct PutEntry<'a> {
            path: &'a str,
            etag: &'a str,
            size_bytes: u64,
        }
        let entries: Vec<PutEntry<'_>> = manifest
            .iter()
            .map(|segment| PutEntry {
                path: &segment.path,
                etag: &segment.etag,
                size_bytes: segment.size_bytes,
            })
            .collect();
        let payload = serde_json::to_vec(&entries)?;

        // opts.etag describes the assembled object, not the manifest body,
        // so it stays off this PUT.
        let headers = options_headers(opts)?;
        let response = self
            .request(
                Method::PUT,
                &self.object_path(loc),
                &[("multipart-manifest", "put")],
                headers,
                Some(ObjectBody::Buffered(payload.into())),
            )
            .await?;
        let status = response.status();
        if status == StatusCode::ACCEPTED {
            tracing::warn!(
                "SLO {}/{} possibly already overwritten",
                loc.container,
                loc.name
            );
        } else if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("manifest PUT {}/{}", loc.container, loc.name),
            ));
        }
        let etag = header_string(response.headers(), "etag")
            .map(|raw| normalize_etag(&raw))
            .unwrap_or_default();
        Ok(PutResult {
            etag,
            timestamp: None,
        })
    }

    async fn get_manifest(&self, loc: ObjLoc<'_>) -> Result<Option<Vec<SloSegment>>> {
        let response = self
            .request(
                Method::GET,
                &self.object_path(loc),
                &[("multipart-manifest", "get")],
                HeaderMap::new(),
                None,
            )
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("manifest GET {}/{}", loc.container, loc.name),
            ));
        }
        if header_string(response.headers(), SLO_HEADER).is_none() {
            return Ok(None);
        }
        let entries: Vec<SwiftManifestEntry> = response.json().await?;
        Ok(Some(
            entries
                .into_iter()
                .map(|entry| SloSegment {
                    path: entry.name,
                    etag: normalize_etag(&entry.hash),
                    size_bytes: entry.bytes,
                    range: entry.range.as_deref().and_then(parse_manifest_range),
                })
                .collect(),
        ))
    }

    async fn set_lifecycle(&self, _container: &str, _prefix: &str, _secs: u64) -> Result<()> {
        Err(StratoError::InvalidRequest(
            "swift targets expire per object, not per bucket".to_string(),
        ))
    }

    fn close_idle(&self) {
        // Swapping the client drops its pool; in-flight requests keep the
        // old one alive until they finish.
        *self.client.lock().expect("client lock") = reqwest::Client::new();
    }
}

impl SwiftProvider {
    fn convert_entry(&self, entry: SwiftListingEntry, remote_container: &str) -> ListEntry {
        let subdir = entry.name.is_none();
        let name = entry.name.or(entry.subdir).unwrap_or_default();
        ListEntry {
            name,
            etag: entry.hash.map(|h| normalize_etag(&h)).unwrap_or_default(),
            size_bytes: entry.bytes.unwrap_or(0),
            last_modified: entry
                .last_modified
                .as_deref()
                .and_then(parse_swift_time)
                .unwrap_or_else(Utc::now),
            content_type: entry.content_type,
            subdir,
            content_location: self.entry_location(remote_container),
        }
    }
}

pub fn parse_swift_time(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, SWIFT_TIME_FMT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Listing timestamp format used by Swift JSON bodies.
pub fn format_swift_time(when: DateTime<Utc>) -> String {
    when.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

fn parse_manifest_range(raw: &str) -> Option<(u64, u64)> {
    let (start, end) = raw.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn parse_meta(headers: &HeaderMap) -> RemoteMeta {
    let mut metadata = UserMetadata::new();
    for (name, value) in headers {
        let name = name.as_str();
        let Ok(value) = value.to_str() else { continue };
        if name.starts_with(SWIFT_USER_META_PREFIX)
            || name == MANIFEST_HEADER
            || name == SLO_HEADER
        {
            metadata.insert(name.to_string(), value.to_string());
        }
    }
    RemoteMeta {
        etag: header_string(headers, "etag")
            .map(|raw| normalize_etag(&raw))
            .unwrap_or_default(),
        timestamp: header_string(headers, "x-timestamp")
            .and_then(|raw| Timestamp::parse(&raw).ok()),
        last_modified: header_string(headers, "last-modified")
            .and_then(|raw| DateTime::parse_from_rfc2822(&raw).ok())
            .map(|when| when.with_timezone(&Utc)),
        size_bytes: header_string(headers, "content-length")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        content_type: header_string(headers, "content-type"),
        metadata,
        headers: all_headers(headers),
    }
}

fn all_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn header_value(raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw).map_err(|e| StratoError::InvalidRequest(e.to_string()))
}

fn options_headers(opts: &PutOptions) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(content_type) = &opts.content_type {
        headers.insert("content-type", header_value(content_type)?);
    }
    for (key, value) in &opts.metadata {
        let name = HeaderName::from_bytes(key.to_ascii_lowercase().as_bytes())
            .map_err(|e| StratoError::InvalidRequest(e.to_string()))?;
        headers.insert(name, header_value(value)?);
    }
    if let Some(manifest) = &opts.dlo_manifest {
        headers.insert(MANIFEST_HEADER, header_value(manifest)?);
    }
    if let Some(delete_after) = opts.delete_after {
        headers.insert(
            "x-delete-after",
            header_value(&delete_after.to_string())?,
        );
    } else if let Some(delete_at) = opts.delete_at {
        headers.insert("x-delete-at", header_value(&delete_at.to_string())?);
    }
    Ok(headers)
}

fn metadata_headers(metadata: &UserMetadata) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in metadata {
        let name = HeaderName::from_bytes(key.to_ascii_lowercase().as_bytes())
            .map_err(|e| StratoError::InvalidRequest(e.to_string()))?;
        headers.insert(name, header_value(value)?);
    }
    Ok(headers)
}

fn urlencode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.as_bytes() {
        if byte.is_ascii_alphanumeric() || matches!(*byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(char::from(*byte));
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

/// Like [`urlencode`] but keeps `/` so object names stay path-shaped.
fn urlencode_path(raw: &str) -> String {
    raw.split('/').map(urlencode).collect::<Vec<_>>().join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn provider(per_account: bool) -> SwiftProvider {
        SwiftProvider::new(ProviderConfig {
            endpoint: "https://remote.example.com/auth/v1.0".to_string(),
            identity: "user".to_string(),
            secret: "key".to_string(),
            bucket: "dst".to_string(),
            protocol: Protocol::Swift,
            account: "AUTH_a".to_string(),
            container: "photos".to_string(),
            per_account,
            custom_prefix: None,
            remote_account: None,
        })
        .unwrap()
    }

    #[test]
    fn test_remote_container_mapping() {
        let p = provider(false);
        assert_eq!(p.remote_container("photos"), "dst");
        // Segment containers pass through verbatim so an account-wide sync
        // does not re-copy them under a second name.
        assert_eq!(p.remote_container("photos_segments"), "photos_segments");

        let p = provider(true);
        assert_eq!(p.remote_container("photos"), "dstphotos");
        assert_eq!(p.remote_container("photos_segments"), "dstphotos_segments");
    }

    #[test]
    fn test_urlencode_path_preserves_slashes() {
        assert_eq!(urlencode_path("a/b c/é"), "a/b%20c/%C3%A9");
        assert_eq!(urlencode("héllo-🚀"), "h%C3%A9llo-%F0%9F%9A%80");
    }

    #[test]
    fn test_parse_swift_time() {
        let when = parse_swift_time("2017-06-28T12:30:45.123456").unwrap();
        assert_eq!(when.timestamp(), 1498653045);
        assert!(parse_swift_time("not-a-time").is_none());
    }

    #[test]
    fn test_manifest_entry_aliases() {
        let internal: SwiftManifestEntry =
            serde_json::from_value(serde_json::json!({
                "name": "/segs/one",
                "hash": "abc",
                "bytes": 5
            }))
            .unwrap();
        assert_eq!(internal.name, "/segs/one");

        let client_form: SwiftManifestEntry =
            serde_json::from_value(serde_json::json!({
                "path": "/segs/one",
                "etag": "abc",
                "size_bytes": 5
            }))
            .unwrap();
        assert_eq!(client_form.bytes, 5);
    }
}
