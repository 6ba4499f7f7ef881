use crate::error::{Result, StratoError};
use crate::provider::{ListEntry, ObjectBody};
use crate::types::{
    MANIFEST_HEADER, SLO_HEADER, SWIFT_USER_META_PREFIX, ObjectRef, SloSegment, Timestamp,
    UserMetadata, normalize_etag,
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Deserialize;

/// The sync engine's and migrator's view of the local cluster. The real
/// implementation talks to the cluster's proxy; tests swap in a map.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn head_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Option<ObjectRef>>;

    async fn get_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        range: Option<&str>,
    ) -> Result<(ObjectRef, ObjectBody)>;

    /// Raw SLO manifest of a manifest object.
    async fn get_manifest(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Vec<SloSegment>>;

    /// `headers` go through verbatim; migration PUTs carry `X-Timestamp`
    /// and the migrator tag.
    async fn put_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        headers: Vec<(String, String)>,
        body: ObjectBody,
        content_length: Option<u64>,
    ) -> Result<String>;

    async fn post_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        metadata: UserMetadata,
    ) -> Result<()>;

    /// Conditional on `if_timestamp`: the delete is dropped (conflict) when
    /// the object advanced past the given timestamp.
    async fn delete_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        if_timestamp: Option<Timestamp>,
    ) -> Result<()>;

    async fn list_container(
        &self,
        account: &str,
        container: &str,
        marker: &str,
        limit: usize,
        prefix: Option<&str>,
    ) -> Result<Vec<ListEntry>>;

    async fn list_account(
        &self,
        account: &str,
        marker: &str,
        limit: usize,
    ) -> Result<Vec<ListEntry>>;

    async fn head_container(
        &self,
        account: &str,
        container: &str,
    ) -> Result<Option<Vec<(String, String)>>>;

    async fn put_container(
        &self,
        account: &str,
        container: &str,
        headers: Vec<(String, String)>,
    ) -> Result<()>;

    async fn post_container(
        &self,
        account: &str,
        container: &str,
        headers: Vec<(String, String)>,
    ) -> Result<()>;

    async fn delete_container(&self, account: &str, container: &str) -> Result<()>;

    async fn head_account(&self, account: &str) -> Result<Vec<(String, String)>>;

    async fn post_account(
        &self,
        account: &str,
        headers: Vec<(String, String)>,
    ) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct LocalListingEntry {
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

/// Talks to the local cluster's proxy over its v1 API.
pub struct HttpLocalStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLocalStore {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("{}/v1", endpoint.trim_end_matches('/')),
        }
    }

    fn path(&self, parts: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for part in parts {
            url.push('/');
            url.push_str(&urlencode_path(part));
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        query: &[(&str, &str)],
        headers: HeaderMap,
        body: Option<ObjectBody>,
    ) -> Result<reqwest::Response> {
        let mut request = self.client.request(method, &url).headers(headers);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = match body {
                ObjectBody::Buffered(bytes) => request.body(bytes),
                ObjectBody::Stream(stream) => request.body(reqwest::Body::wrap_stream(stream)),
            };
        }
        Ok(request.send().await?)
    }
}

#[async_trait]
impl LocalStore for HttpLocalStore {
    async fn head_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Option<ObjectRef>> {
        let response = self
            .send(
                Method::HEAD,
                self.path(&[account, container, name]),
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
                format!("local HEAD {}/{}/{}", account, container, name),
            ));
        }
        Ok(Some(object_ref_from_headers(
            account,
            container,
            name,
            response.headers(),
        )?))
    }

    async fn get_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        range: Option<&str>,
    ) -> Result<(ObjectRef, ObjectBody)> {
        let mut headers = HeaderMap::new();
        if let Some(range) = range {
            headers.insert(
                "range",
                HeaderValue::from_str(range)
                    .map_err(|e| StratoError::InvalidRequest(e.to_string()))?,
            );
        }
        let response = self
            .send(
                Method::GET,
                self.path(&[account, container, name]),
                &[],
                headers,
                None,
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("local GET {}/{}/{}", account, container, name),
            ));
        }
        let object_ref = object_ref_from_headers(account, container, name, response.headers())?;
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok((object_ref, ObjectBody::Stream(Box::pin(stream))))
    }

    async fn get_manifest(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Vec<SloSegment>> {
        #[derive(Deserialize)]
        struct Entry {
            #[serde(alias = "path")]
            name: String,
            #[serde(alias = "etag")]
            hash: String,
            #[serde(alias = "size_bytes")]
            bytes: u64,
            #[serde(default)]
            range: Option<String>,
        }
        let response = self
            .send(
                Method::GET,
                self.path(&[account, container, name]),
                &[("multipart-manifest", "get")],
                HeaderMap::new(),
                None,
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("local manifest GET {}/{}/{}", account, container, name),
            ));
        }
        let entries: Vec<Entry> = response.json().await?;
        Ok(entries
            .into_iter()
            .map(|entry| SloSegment {
                path: entry.name,
                etag: normalize_etag(&entry.hash),
                size_bytes: entry.bytes,
                range: entry.range.as_deref().and_then(|raw| {
                    let (start, end) = raw.split_once('-')?;
                    Some((start.parse().ok()?, end.parse().ok()?))
                }),
            })
            .collect())
    }

    async fn put_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        headers: Vec<(String, String)>,
        body: ObjectBody,
        content_length: Option<u64>,
    ) -> Result<String> {
        let mut header_map = header_map(headers)?;
        if let Some(length) = content_length {
            header_map.insert(
                "content-length",
                HeaderValue::from_str(&length.to_string())
                    .map_err(|e| StratoError::InvalidRequest(e.to_string()))?,
            );
        }
        let response = self
            .send(
                Method::PUT,
                self.path(&[account, container, name]),
                &[],
                header_map,
                Some(body),
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("local PUT {}/{}/{}", account, container, name),
            ));
        }
        Ok(response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(normalize_etag)
            .unwrap_or_default())
    }

    async fn post_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        metadata: UserMetadata,
    ) -> Result<()> {
        let headers = header_map(metadata.into_iter().collect())?;
        let response = self
            .send(
                Method::POST,
                self.path(&[account, container, name]),
                &[],
                headers,
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(StratoError::from_status(
                response.status().as_u16(),
                format!("local POST {}/{}/{}", account, container, name),
            ));
        }
        Ok(())
    }

    async fn delete_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        if_timestamp: Option<Timestamp>,
    ) -> Result<()> {
        let mut headers = HeaderMap::new();
        if let Some(timestamp) = if_timestamp {
            // Ordering the tombstone right after the observed timestamp
            // leaves any newer write in place.
            headers.insert(
                "x-timestamp",
                HeaderValue::from_str(&timestamp.next().internal())
                    .map_err(|e| StratoError::InvalidRequest(e.to_string()))?,
            );
        }
        let response = self
            .send(
                Method::DELETE,
                self.path(&[account, container, name]),
                &[],
                headers,
                None,
            )
            .await?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(StratoError::ConflictNewer(format!(
                "{}/{}/{}",
                account, container, name
            )));
        }
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("local DELETE {}/{}/{}", account, container, name),
            ));
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
        let limit = limit.to_string();
        let mut query: Vec<(&str, &str)> =
            vec![("format", "json"), ("marker", marker), ("limit", &limit)];
        if let Some(prefix) = prefix {
            query.push(("prefix", prefix));
        }
        let response = self
            .send(
                Method::GET,
                self.path(&[account, container]),
                &query,
                HeaderMap::new(),
                None,
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("local listing {}/{}", account, container),
            ));
        }
        let entries: Vec<LocalListingEntry> = response.json().await?;
        Ok(entries.into_iter().map(convert_local_entry).collect())
    }

    async fn list_account(
        &self,
        account: &str,
        marker: &str,
        limit: usize,
    ) -> Result<Vec<ListEntry>> {
        let limit = limit.to_string();
        let query: Vec<(&str, &str)> =
            vec![("format", "json"), ("marker", marker), ("limit", &limit)];
        let response = self
            .send(Method::GET, self.path(&[account]), &query, HeaderMap::new(), None)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("local account listing {}", account),
            ));
        }
        let entries: Vec<LocalListingEntry> = response.json().await?;
        Ok(entries.into_iter().map(convert_local_entry).collect())
    }

    async fn head_container(
        &self,
        account: &str,
        container: &str,
    ) -> Result<Option<Vec<(String, String)>>> {
        let response = self
            .send(
                Method::HEAD,
                self.path(&[account, container]),
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
                format!("local HEAD {}/{}", account, container),
            ));
        }
        Ok(Some(collect_headers(response.headers())))
    }

    async fn put_container(
        &self,
        account: &str,
        container: &str,
        headers: Vec<(String, String)>,
    ) -> Result<()> {
        let response = self
            .send(
                Method::PUT,
                self.path(&[account, container]),
                &[],
                header_map(headers)?,
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(StratoError::from_status(
                response.status().as_u16(),
                format!("local PUT {}/{}", account, container),
            ));
        }
        Ok(())
    }

    async fn post_container(
        &self,
        account: &str,
        container: &str,
        headers: Vec<(String, String)>,
    ) -> Result<()> {
        let response = self
            .send(
                Method::POST,
                self.path(&[account, container]),
                &[],
                header_map(headers)?,
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(StratoError::from_status(
                response.status().as_u16(),
                format!("local POST {}/{}", account, container),
            ));
        }
        Ok(())
    }

    async fn delete_container(&self, account: &str, container: &str) -> Result<()> {
        let response = self
            .send(
                Method::DELETE,
                self.path(&[account, container]),
                &[],
                HeaderMap::new(),
                None,
            )
            .await?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(StratoError::ConflictNewer(format!(
                "{}/{}",
                account, container
            )));
        }
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(StratoError::from_status(
                status.as_u16(),
                format!("local DELETE {}/{}", account, container),
            ));
        }
        Ok(())
    }

    async fn head_account(&self, account: &str) -> Result<Vec<(String, String)>> {
        let response = self
            .send(Method::HEAD, self.path(&[account]), &[], HeaderMap::new(), None)
            .await?;
        if !response.status().is_success() {
            return Err(StratoError::from_status(
                response.status().as_u16(),
                format!("local HEAD account {}", account),
            ));
        }
        Ok(collect_headers(response.headers()))
    }

    async fn post_account(&self, account: &str, headers: Vec<(String, String)>) -> Result<()> {
        let response = self
            .send(
                Method::POST,
                self.path(&[account]),
                &[],
                header_map(headers)?,
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(StratoError::from_status(
                response.status().as_u16(),
                format!("local POST account {}", account),
            ));
        }
        Ok(())
    }
}

fn object_ref_from_headers(
    account: &str,
    container: &str,
    name: &str,
    headers: &HeaderMap,
) -> Result<ObjectRef> {
    let mut metadata = UserMetadata::new();
    for (header, value) in headers {
        let header = header.as_str();
        let Ok(value) = value.to_str() else { continue };
        if header.starts_with(SWIFT_USER_META_PREFIX)
            || header == MANIFEST_HEADER
            || header == SLO_HEADER
        {
            metadata.insert(header.to_string(), value.to_string());
        }
    }
    let timestamp = headers
        .get("x-timestamp")
        .and_then(|v| v.to_str().ok())
        .map(Timestamp::parse)
        .transpose()?
        .unwrap_or_else(Timestamp::now);
    Ok(ObjectRef {
        account: account.to_string(),
        container: container.to_string(),
        name: name.to_string(),
        etag: headers
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(normalize_etag)
            .unwrap_or_default(),
        timestamp,
        size_bytes: headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        content_type: headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        metadata,
        delete_at: headers
            .get("x-delete-at")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()),
    })
}

fn convert_local_entry(entry: LocalListingEntry) -> ListEntry {
    let subdir = entry.name.is_none();
    ListEntry {
        name: entry.name.or(entry.subdir).unwrap_or_default(),
        etag: entry.hash.map(|h| normalize_etag(&h)).unwrap_or_default(),
        size_bytes: entry.bytes.unwrap_or(0),
        last_modified: entry
            .last_modified
            .as_deref()
            .and_then(crate::provider::swift_listing_time)
            .unwrap_or_else(Utc::now),
        content_type: entry.content_type,
        subdir,
        content_location: String::new(),
    }
}

fn collect_headers(headers: &HeaderMap) -> Vec<(String, String)> {
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

fn header_map(headers: Vec<(String, String)>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.to_ascii_lowercase().as_bytes())
            .map_err(|e| StratoError::InvalidRequest(e.to_string()))?;
        map.insert(
            name,
            HeaderValue::from_str(&value)
                .map_err(|e| StratoError::InvalidRequest(e.to_string()))?,
        );
    }
    Ok(map)
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
