//! Impersonating reverse proxy in front of the cluster API server.
//!
//! Each request arrives with the end-user JWT in `X-Infra-Authorization`
//! (the plain `Authorization` header is reserved for the credential we
//! inject upstream). After verification the request is rewritten: the Infra
//! header and any client-supplied `Impersonate-*` headers are stripped, the
//! engine's service-account token becomes the upstream credential, and
//! `Impersonate-User` names the verified user so the cluster's own RBAC
//! decides what they may do. Responses stream through untouched and are
//! never cached; upgrade requests (exec, port-forward) are bridged at the
//! byte level.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{HeaderMap, HeaderName, AUTHORIZATION, CONNECTION, HOST, UPGRADE};
use axum::http::{Request, StatusCode, Uri};
use axum::response::Response;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use infra_common::{INFRA_AUTHORIZATION_HEADER, INFRA_QUERY_HEADER};

use crate::error::{Error, Result};
use crate::jwks::JwkCache;

/// Path prefix routed to the proxy; stripped before dispatch upstream.
const PROXY_PREFIX: &str = "/proxy";

/// Headers that only apply to a single hop and must not be forwarded,
/// except on upgrade requests where `Connection` and `Upgrade` carry the
/// protocol switch.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upstream connection settings.
pub struct ProxyState {
    pub jwks: Arc<JwkCache>,
    /// Client pinned to the cluster CA.
    pub client: reqwest::Client,
    /// API server base, e.g. `https://10.96.0.1:443`.
    pub base_url: String,
    /// Service-account token injected as the upstream credential.
    pub sa_token: String,
}

/// True when the request asks for a protocol upgrade.
fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
}

/// Compute the upstream URL and header set for a verified request.
///
/// - strips the `/proxy` prefix;
/// - restores the query string from `X-Infra-Query` when a hop dropped it;
/// - drops the Infra header, the inbound `Authorization` and `Host`, every
///   client-supplied `Impersonate-*` header, and hop-by-hop headers;
/// - injects the service-account bearer and `Impersonate-User`.
fn rewrite_request(
    base_url: &str,
    uri: &Uri,
    headers: &HeaderMap,
    email: &str,
    sa_token: &str,
) -> Result<(String, HeaderMap)> {
    let path = uri.path().strip_prefix(PROXY_PREFIX).unwrap_or(uri.path());
    let path = if path.is_empty() { "/" } else { path };

    let query = headers
        .get(INFRA_QUERY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| uri.query().map(str::to_string));
    let url = match query {
        Some(query) => format!("{base_url}{path}?{query}"),
        None => format!("{base_url}{path}"),
    };

    let upgrade = wants_upgrade(headers);
    let mut upstream = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if lower == INFRA_AUTHORIZATION_HEADER.to_ascii_lowercase()
            || lower == INFRA_QUERY_HEADER.to_ascii_lowercase()
            || lower.starts_with("impersonate-")
            || name == AUTHORIZATION
            || name == HOST
        {
            continue;
        }
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            // Upgrade requests need the protocol-switch headers intact.
            if !(upgrade && (name == CONNECTION || name == UPGRADE)) {
                continue;
            }
        }
        upstream.append(name.clone(), value.clone());
    }

    let bearer = format!("Bearer {sa_token}")
        .parse()
        .map_err(|_| Error::internal("service-account token is not a valid header value"))?;
    upstream.insert(AUTHORIZATION, bearer);
    let user = email
        .parse()
        .map_err(|_| Error::unauthorized("user name is not a valid header value"))?;
    upstream.insert(HeaderName::from_static("impersonate-user"), user);

    Ok((url, upstream))
}

fn response_headers(headers: &HeaderMap, upgrade: bool) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str())
            && !(upgrade && (name == CONNECTION || name == UPGRADE))
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn stream_response(upstream: reqwest::Response) -> Result<Response> {
    let status = upstream.status();
    let headers = response_headers(upstream.headers(), false);
    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| Error::internal(format!("failed to build response: {e}")))?;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Handle one proxied request.
pub async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    mut request: Request<Body>,
) -> Result<Response> {
    let token = request
        .headers()
        .get(INFRA_AUTHORIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::unauthorized("no bearer token"))?
        .to_string();

    let claims = state.jwks.verify(&token).await?;

    let (url, headers) = rewrite_request(
        &state.base_url,
        request.uri(),
        request.headers(),
        &claims.email,
        &state.sa_token,
    )?;
    debug!(user = %claims.email, url = %url, "proxying request");

    let method = request.method().clone();
    let upgrade = wants_upgrade(request.headers());
    let on_upgrade = request.extensions_mut().remove::<hyper::upgrade::OnUpgrade>();

    if upgrade {
        if let Some(on_upgrade) = on_upgrade {
            let upstream = state
                .client
                .request(method, &url)
                .headers(headers)
                .send()
                .await
                .map_err(|e| Error::proxy(format!("upstream request failed: {e}")))?;

            if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
                return stream_response(upstream);
            }

            let response_headers = response_headers(upstream.headers(), true);
            tokio::spawn(async move {
                let client_io = match on_upgrade.await {
                    Ok(upgraded) => upgraded,
                    Err(err) => {
                        warn!(error = %err, "client upgrade failed");
                        return;
                    }
                };
                let mut server_io = match upstream.upgrade().await {
                    Ok(upgraded) => upgraded,
                    Err(err) => {
                        warn!(error = %err, "upstream upgrade failed");
                        return;
                    }
                };
                let mut client_io = TokioIo::new(client_io);
                if let Err(err) =
                    tokio::io::copy_bidirectional(&mut client_io, &mut server_io).await
                {
                    debug!(error = %err, "upgraded connection closed");
                }
            });

            let mut response = Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .body(Body::empty())
                .map_err(|e| Error::internal(format!("failed to build response: {e}")))?;
            *response.headers_mut() = response_headers;
            return Ok(response);
        }
    }

    let body_stream = request.into_body().into_data_stream();
    let upstream = state
        .client
        .request(method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body_stream))
        .send()
        .await
        .map_err(|e| Error::proxy(format!("upstream request failed: {e}")))?;
    stream_response(upstream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-infra-authorization"),
            "Bearer some.jwt.value".parse().unwrap(),
        );
        headers.insert(HOST, "engine.example.com".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());
        headers
    }

    #[test]
    fn impersonates_the_verified_user() {
        let uri: Uri = "/proxy/api/v1/pods".parse().unwrap();
        let (url, headers) = rewrite_request(
            "https://10.96.0.1:443",
            &uri,
            &request_headers(),
            "alice@x",
            "sa-token",
        )
        .unwrap();

        assert_eq!(url, "https://10.96.0.1:443/api/v1/pods");
        assert_eq!(headers.get("impersonate-user").unwrap(), "alice@x");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sa-token");
        // The Infra credential must not reach the API server.
        assert!(headers.get("x-infra-authorization").is_none());
        assert!(headers.get(HOST).is_none());
        assert_eq!(headers.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn client_supplied_impersonation_is_stripped() {
        let mut headers = request_headers();
        headers.insert(
            HeaderName::from_static("impersonate-user"),
            "cluster-admin".parse().unwrap(),
        );
        headers.insert(
            HeaderName::from_static("impersonate-group"),
            "system:masters".parse().unwrap(),
        );

        let uri: Uri = "/proxy/api/v1/pods".parse().unwrap();
        let (_, rewritten) =
            rewrite_request("https://k8s", &uri, &headers, "alice@x", "sa").unwrap();
        assert_eq!(rewritten.get("impersonate-user").unwrap(), "alice@x");
        assert!(rewritten.get("impersonate-group").is_none());
    }

    #[test]
    fn restores_query_from_header() {
        let mut headers = request_headers();
        headers.insert(
            HeaderName::from_static("x-infra-query"),
            "command=ls&stdout=true".parse().unwrap(),
        );

        let uri: Uri = "/proxy/api/v1/namespaces/default/pods/web/exec"
            .parse()
            .unwrap();
        let (url, rewritten) =
            rewrite_request("https://k8s", &uri, &headers, "alice@x", "sa").unwrap();
        assert_eq!(
            url,
            "https://k8s/api/v1/namespaces/default/pods/web/exec?command=ls&stdout=true"
        );
        assert!(rewritten.get("x-infra-query").is_none());
    }

    #[test]
    fn preserves_existing_query() {
        let uri: Uri = "/proxy/api/v1/pods?watch=true".parse().unwrap();
        let (url, _) =
            rewrite_request("https://k8s", &uri, &request_headers(), "a@x", "sa").unwrap();
        assert_eq!(url, "https://k8s/api/v1/pods?watch=true");
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = request_headers();
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("te", "trailers".parse().unwrap());

        let uri: Uri = "/proxy/api".parse().unwrap();
        let (_, rewritten) =
            rewrite_request("https://k8s", &uri, &headers, "a@x", "sa").unwrap();
        assert!(rewritten.get("transfer-encoding").is_none());
        assert!(rewritten.get("te").is_none());
    }

    #[test]
    fn upgrade_requests_keep_protocol_switch_headers() {
        let mut headers = request_headers();
        headers.insert(CONNECTION, "Upgrade".parse().unwrap());
        headers.insert(UPGRADE, "SPDY/3.1".parse().unwrap());

        let uri: Uri = "/proxy/api/v1/namespaces/default/pods/web/exec"
            .parse()
            .unwrap();
        let (_, rewritten) =
            rewrite_request("https://k8s", &uri, &headers, "a@x", "sa").unwrap();
        assert_eq!(rewritten.get(CONNECTION).unwrap(), "Upgrade");
        assert_eq!(rewritten.get(UPGRADE).unwrap(), "SPDY/3.1");
    }

    #[test]
    fn bare_proxy_path_maps_to_root() {
        let uri: Uri = "/proxy".parse().unwrap();
        let (url, _) =
            rewrite_request("https://k8s", &uri, &request_headers(), "a@x", "sa").unwrap();
        assert_eq!(url, "https://k8s/");
    }
}
