use crate::listing::{ListingFormat, merge_listings, render_listing};
use crate::{ShuntState, is_hop_by_hop};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use strato_core::error::StratoError;
use strato_core::provider::{ListEntry, ObjLoc, Provider, RemoteObject};
use strato_core::types::MIGRATOR_CONTAINER_HEADER;

/// A 206 whose Content-Range spans the whole object is really a 200; some
/// clients send `Range: bytes=0-` and would cache a partial marker.
pub fn response_is_complete(status: u16, headers: &[(String, String)]) -> bool {
    if status == 200 {
        return true;
    }
    if status != 206 {
        return false;
    }
    let Some(range) = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-range"))
        .map(|(_, value)| value.as_str())
    else {
        return false;
    };
    let Some(rest) = range.strip_prefix("bytes 0-") else {
        return false;
    };
    let Some((end, length)) = rest.split_once('/') else {
        return false;
    };
    match (end.parse::<u64>(), length.parse::<u64>()) {
        (Ok(end), Ok(length)) => end + 1 == length,
        _ => false,
    }
}

pub async fn handle_object(
    State(state): State<Arc<ShuntState>>,
    Path((account, container, object)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let local = match forward_local(
        &state,
        method.clone(),
        &[account.as_str(), container.as_str(), object.as_str()],
        &headers,
        Some(body),
    )
    .await
    {
        Ok(response) => response,
        Err(e) => return bad_gateway(e),
    };

    if local.status() != StatusCode::NOT_FOUND
        || !(method == Method::GET || method == Method::HEAD)
    {
        return local;
    }

    let active = state.active().await;
    let Some((provider_config, _)) = active.covering_profile(&account, &container) else {
        return local;
    };
    let provider = match active
        .provider((account.clone(), container.clone()), provider_config)
        .await
    {
        Ok(provider) => provider,
        Err(e) => return bad_gateway(e),
    };

    shunt_request(provider.as_ref(), &container, &object, &method, &headers).await
}

/// Serves a GET/HEAD from the remote provider, rewriting the response the
/// way the local cluster would have shaped it.
pub async fn shunt_request(
    provider: &dyn Provider,
    container: &str,
    object: &str,
    method: &Method,
    headers: &HeaderMap,
) -> Response {
    let loc = ObjLoc {
        container,
        name: object,
    };
    let range = headers.get("range").and_then(|v| v.to_str().ok());

    if method == Method::HEAD {
        return match provider.head_object(loc).await {
            Ok(Some(meta)) => {
                let mut response = Response::new(Body::empty());
                apply_remote_headers(&mut response, &meta.headers);
                response
            }
            Ok(None) => StatusCode::NOT_FOUND.into_response(),
            Err(e) => remote_error_response(e),
        };
    }

    match provider.get_object(loc, range).await {
        Ok(remote) => remote_object_response(remote),
        Err(e) => remote_error_response(e),
    }
}

fn remote_object_response(remote: RemoteObject) -> Response {
    let RemoteObject { status, meta, body } = remote;
    let complete = response_is_complete(status, &meta.headers);
    let status = if complete { 200 } else { status };

    let mut response = Response::new(Body::from_stream(body.into_stream()));
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    apply_remote_headers(&mut response, &meta.headers);
    if complete {
        // The body now covers the whole object; a leftover Content-Range
        // would contradict the 200.
        response.headers_mut().remove("content-range");
    }
    response
}

fn apply_remote_headers(response: &mut Response, headers: &[(String, String)]) {
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
}

fn remote_error_response(error: StratoError) -> Response {
    match error {
        StratoError::NotFound(_) => StatusCode::NOT_FOUND.into_response(),
        StratoError::RemoteClient { status: 416, .. } => {
            StatusCode::RANGE_NOT_SATISFIABLE.into_response()
        }
        other => bad_gateway(other),
    }
}

pub async fn handle_container(
    State(state): State<Arc<ShuntState>>,
    Path((account, container)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if method != Method::GET {
        return match forward_local(
            &state,
            method,
            &[account.as_str(), container.as_str()],
            &headers,
            Some(body),
        )
        .await
        {
            Ok(response) => response,
            Err(e) => bad_gateway(e),
        };
    }

    let active = state.active().await;
    let migration = active
        .covering_profile(&account, &container)
        .filter(|(_, is_migration)| *is_migration);
    let Some((provider_config, _)) = migration else {
        return match forward_local(
            &state,
            method,
            &[account.as_str(), container.as_str()],
            &headers,
            None,
        )
        .await
        {
            Ok(response) => response,
            Err(e) => bad_gateway(e),
        };
    };

    let provider = match active
        .provider((account.clone(), container.clone()), provider_config)
        .await
    {
        Ok(provider) => provider,
        Err(e) => return bad_gateway(e),
    };

    let marker = params.get("marker").map(String::as_str).unwrap_or("");
    let prefix = params.get("prefix").map(String::as_str);
    let limit: usize = params
        .get("limit")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(10_000);

    let local_store = strato_core::local::HttpLocalStore::new(&active.config.local_endpoint);
    use strato_core::local::LocalStore;
    let local_entries = match local_store
        .list_container(&account, &container, marker, limit, prefix)
        .await
    {
        Ok(entries) => entries,
        Err(StratoError::NotFound(_)) => {
            // First contact with a not-yet-migrated container: create it
            // lazily so subsequent writes land, then serve from remote.
            let created = local_store
                .put_container(
                    &account,
                    &container,
                    vec![(
                        MIGRATOR_CONTAINER_HEADER.to_string(),
                        strato_core::migrate::STATE_MIGRATING.to_string(),
                    )],
                )
                .await;
            if let Err(e) = created {
                tracing::warn!("Lazy container create {}/{} failed: {}", account, container, e);
            }
            Vec::new()
        }
        Err(e) => return bad_gateway(e),
    };

    let remote_entries = match provider
        .list_objects(&container, marker, limit, prefix, params.get("delimiter").map(String::as_str))
        .await
    {
        Ok(entries) => entries,
        Err(StratoError::NotFound(_)) => Vec::new(),
        Err(e) => return bad_gateway(e),
    };

    let merged = merge_listings(local_entries, remote_entries, limit);
    listing_response(&container, merged, &params, &headers)
}

pub async fn handle_account(
    State(state): State<Arc<ShuntState>>,
    Path(account): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if method != Method::GET {
        return match forward_local(&state, method, &[account.as_str()], &headers, Some(body)).await
        {
            Ok(response) => response,
            Err(e) => bad_gateway(e),
        };
    }

    let active = state.active().await;
    let Some(provider_config) = active.account_migration(&account) else {
        return match forward_local(&state, method, &[account.as_str()], &headers, None).await {
            Ok(response) => response,
            Err(e) => bad_gateway(e),
        };
    };
    let provider = match active
        .provider((account.clone(), "/*".to_string()), provider_config)
        .await
    {
        Ok(provider) => provider,
        Err(e) => return bad_gateway(e),
    };

    let marker = params.get("marker").map(String::as_str).unwrap_or("");
    let limit: usize = params
        .get("limit")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(10_000);

    let local_store = strato_core::local::HttpLocalStore::new(&active.config.local_endpoint);
    use strato_core::local::LocalStore;
    let local_entries = match local_store.list_account(&account, marker, limit).await {
        Ok(entries) => entries,
        Err(StratoError::NotFound(_)) => Vec::new(),
        Err(e) => return bad_gateway(e),
    };
    let remote_entries = match provider.list_buckets(marker, limit, None).await {
        Ok(entries) => entries,
        Err(e) => return bad_gateway(e),
    };

    let merged = merge_listings(local_entries, remote_entries, limit);
    listing_response(&account, merged, &params, &headers)
}

fn listing_response(
    scope: &str,
    entries: Vec<ListEntry>,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Response {
    let format = ListingFormat::negotiate(
        params.get("format").map(String::as_str),
        headers.get("accept").and_then(|v| v.to_str().ok()),
    );
    let body = render_listing(scope, &entries, format);
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = if entries.is_empty() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::OK
    };
    response.headers_mut().insert(
        "content-type",
        HeaderValue::from_static(format.content_type()),
    );
    response
}

/// Forwards a request to the local cluster untouched (minus hop-by-hop
/// headers) and streams the response back.
async fn forward_local(
    state: &ShuntState,
    method: Method,
    path_parts: &[&str],
    headers: &HeaderMap,
    body: Option<Body>,
) -> strato_core::error::Result<Response> {
    let active = state.active().await;
    let mut url = format!("{}/v1", active.config.local_endpoint.trim_end_matches('/'));
    for part in path_parts {
        url.push('/');
        url.push_str(&urlencode_path(part));
    }

    let mut request = state.http().request(
        reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| StratoError::Internal(e.to_string()))?,
        &url,
    );
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || name == "host" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request = request.header(name.as_str(), value);
        }
    }
    if let Some(body) = body {
        let stream = body
            .into_data_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        request = request.body(reqwest::Body::wrap_stream(stream));
    }

    let upstream = request.send().await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    let stream = upstream
        .bytes_stream()
        .map_err(|e| std::io::Error::other(e.to_string()));
    *response.body_mut() = Body::from_stream(stream);
    Ok(response)
}

fn bad_gateway(error: StratoError) -> Response {
    tracing::warn!("Shunt upstream error: {}", error);
    // A fixed sized body keeps Content-Length accurate on the 502.
    let mut response = Response::new(Body::from("Bad Gateway"));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert("content-length", HeaderValue::from_static("11"));
    response
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

    fn range_headers(value: &str) -> Vec<(String, String)> {
        vec![("content-range".to_string(), value.to_string())]
    }

    #[test]
    fn test_complete_responses() {
        assert!(response_is_complete(200, &[]));
        assert!(response_is_complete(206, &range_headers("bytes 0-99/100")));
    }

    #[test]
    fn test_partial_responses() {
        assert!(!response_is_complete(206, &[]));
        assert!(!response_is_complete(206, &range_headers("bytes 0-49/100")));
        assert!(!response_is_complete(206, &range_headers("bytes 10-99/100")));
        assert!(!response_is_complete(206, &range_headers("bytes 0-garbage/100")));
        assert!(!response_is_complete(404, &[]));
    }

    #[test]
    fn test_206_promotion_strips_content_range() {
        let remote = RemoteObject {
            status: 206,
            meta: strato_core::provider::RemoteMeta {
                etag: "abc".to_string(),
                timestamp: None,
                last_modified: None,
                size_bytes: 100,
                content_type: None,
                metadata: Default::default(),
                headers: vec![
                    ("content-length".to_string(), "100".to_string()),
                    ("content-range".to_string(), "bytes 0-99/100".to_string()),
                ],
            },
            body: strato_core::provider::ObjectBody::Buffered(bytes::Bytes::from(vec![0u8; 100])),
        };
        let response = remote_object_response(remote);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("content-range").is_none());
        assert_eq!(
            response.headers().get("content-length").unwrap(),
            "100"
        );
    }

    #[test]
    fn test_true_partial_stays_206() {
        let remote = RemoteObject {
            status: 206,
            meta: strato_core::provider::RemoteMeta {
                etag: "abc".to_string(),
                timestamp: None,
                last_modified: None,
                size_bytes: 100,
                content_type: None,
                metadata: Default::default(),
                headers: vec![("content-range".to_string(), "bytes 0-49/100".to_string())],
            },
            body: strato_core::provider::ObjectBody::Buffered(bytes::Bytes::from(vec![0u8; 50])),
        };
        let response = remote_object_response(remote);
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert!(response.headers().get("content-range").is_some());
    }

    #[test]
    fn test_bad_gateway_content_length() {
        let response = bad_gateway(StratoError::TransientNetwork("boom".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("content-length").unwrap(), "11");
    }
}
