use crate::error::PoolError;
use crate::registry::SessionRegistry;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use proflink_store::{ArtifactQuery, StoreError};
use reqwest::Client;
use std::time::Duration;

/// A request path decomposed the way sessions are keyed.
///
/// Splitting on `/` keeps the leading empty segment, so a well-formed path
/// has `["", prefix, db, runner, dataset, name, ..rest]`. The first six
/// segments joined back together form the session key; everything after
/// them is forwarded to the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRoute {
    pub key: String,
    pub query: ArtifactQuery,
    pub suffix: String,
}

impl ProfileRoute {
    pub fn parse(path: &str) -> Option<Self> {
        let components: Vec<&str> = path.split('/').collect();
        if components.len() < 6 {
            return None;
        }
        let key = components[..6].join("/");
        let suffix = components[6..].join("/");
        let query = ArtifactQuery {
            db: components[2].to_string(),
            runner: components[3].to_string(),
            dataset: components[4].to_string(),
            name: components[5].to_string(),
        };
        Some(ProfileRoute { key, query, suffix })
    }
}

/// Route one request to its per-profile viewer, creating the session on
/// first touch.
pub async fn dispatch(State(registry): State<SessionRegistry>, req: Request) -> Response {
    let Some(route) = ProfileRoute::parse(req.uri().path()) else {
        return plain(StatusCode::NOT_FOUND, "not found\n");
    };
    tracing::debug!(key = %route.key, suffix = %route.suffix, "dispatching to viewer");
    match proxy_via_pool(&registry, &route, req).await {
        Ok(resp) => resp,
        Err(err) => error_response(&route, &err),
    }
}

async fn proxy_via_pool(
    registry: &SessionRegistry,
    route: &ProfileRoute,
    req: Request,
) -> Result<Response, PoolError> {
    let session = registry.get_or_create(route).await?;
    let Some(token) = session.session_id.clone() else {
        return Err(PoolError::NotReady {
            key: session.key.clone(),
        });
    };
    forward(
        registry.http_client(),
        registry.config().request_timeout,
        session.port,
        &token,
        &route.suffix,
        req,
    )
    .await
}

/// Relay one request to the viewer, rewriting the path onto the viewer's
/// session token. The deadline covers the whole exchange; hitting it before
/// response headers arrive surfaces as a timeout, hitting it mid-stream
/// aborts the relayed body.
async fn forward(
    client: &Client,
    timeout: Duration,
    port: u16,
    token: &str,
    suffix: &str,
    req: Request,
) -> Result<Response, PoolError> {
    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let url = format!("http://127.0.0.1:{port}/{token}/{suffix}{query}");

    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::debug!(%err, "failed reading client request body");
            return Ok(plain(StatusCode::BAD_REQUEST, "bad request\n"));
        }
    };

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);

    let mut request = client
        .request(parts.method, &url)
        .headers(headers)
        .timeout(timeout);
    if !body.is_empty() {
        request = request.body(body);
    }
    let upstream = request.send().await.map_err(|err| {
        if err.is_timeout() {
            PoolError::ProxyTimeout { port }
        } else {
            PoolError::Transport { port, source: err }
        }
    })?;

    let status = upstream.status();
    let mut resp_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut resp_headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = resp_headers;
    Ok(response)
}

fn error_response(route: &ProfileRoute, err: &PoolError) -> Response {
    match err {
        PoolError::ProfileNotFound { .. }
        | PoolError::Store(StoreError::InvalidDbName { .. }) => {
            tracing::debug!(key = %route.key, %err, "profile not found");
            plain(StatusCode::NOT_FOUND, "profile not found\n")
        }
        PoolError::NotReady { .. } | PoolError::DiscoveryTimeout { .. } => {
            tracing::warn!(key = %route.key, %err, "viewer unavailable");
            plain(StatusCode::SERVICE_UNAVAILABLE, "viewer not ready\n")
        }
        PoolError::ProxyTimeout { .. } => {
            tracing::warn!(key = %route.key, %err, "proxy timeout");
            plain(StatusCode::GATEWAY_TIMEOUT, "Proxy timeout\n")
        }
        PoolError::Transport { .. } => {
            tracing::warn!(key = %route.key, %err, "viewer transport error");
            plain(StatusCode::BAD_GATEWAY, "bad gateway\n")
        }
        _ => {
            tracing::error!(key = %route.key, %err, "session creation failed");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n")
        }
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ] {
        let _ = headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[test]
    fn short_paths_do_not_route() {
        assert_eq!(ProfileRoute::parse("/"), None);
        assert_eq!(ProfileRoute::parse("/profile"), None);
        assert_eq!(ProfileRoute::parse("/profile/db/runner/dataset"), None);
    }

    #[test]
    fn six_segments_key_with_empty_suffix() {
        let route = ProfileRoute::parse("/profile/db/linux/checkout/warm").unwrap();
        assert_eq!(route.key, "/profile/db/linux/checkout/warm");
        assert_eq!(route.suffix, "");
        assert_eq!(route.query.db, "db");
        assert_eq!(route.query.runner, "linux");
        assert_eq!(route.query.dataset, "checkout");
        assert_eq!(route.query.name, "warm");
    }

    #[test]
    fn extra_segments_become_the_suffix() {
        let route =
            ProfileRoute::parse("/profile/db/linux/checkout/warm/static/js/app.js").unwrap();
        assert_eq!(route.key, "/profile/db/linux/checkout/warm");
        assert_eq!(route.suffix, "static/js/app.js");
    }

    /// Accept one connection, capture the request head, reply canned.
    async fn upstream_fixture(response: &'static str) -> (u16, oneshot::Receiver<String>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let _ = tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());
            let _ = socket.write_all(response.as_bytes()).await;
        });
        (port, rx)
    }

    fn get(uri: &str) -> Request {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn rewrites_onto_the_session_token_and_relays() {
        let (port, seen) = upstream_fixture(
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nx-upstream: yes\r\nconnection: close\r\n\r\nok",
        )
        .await;
        let client = Client::new();

        let resp = forward(
            &client,
            Duration::from_secs(2),
            port,
            "tok",
            "profile.json",
            get("/profile/db/r/d/n/profile.json"),
        )
        .await
        .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-upstream").unwrap(), "yes");
        // Hop-by-hop headers from the canned response never reach the client.
        assert!(resp.headers().get(header::CONNECTION).is_none());
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");

        let head = seen.await.unwrap();
        assert!(head.starts_with("GET /tok/profile.json HTTP/1.1"), "{head}");
    }

    #[tokio::test]
    async fn query_strings_are_preserved() {
        let (port, seen) =
            upstream_fixture("HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n").await;
        let client = Client::new();

        let resp = forward(
            &client,
            Duration::from_secs(2),
            port,
            "tok",
            "flamegraph",
            get("/profile/db/r/d/n/flamegraph?frame=12&depth=3"),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let head = seen.await.unwrap();
        assert!(head.starts_with("GET /tok/flamegraph?frame=12&depth=3 "), "{head}");
    }

    #[tokio::test]
    async fn silent_upstream_times_out_as_504() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept and hold the connection without ever responding.
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });
        let client = Client::new();

        let err = forward(
            &client,
            Duration::from_millis(200),
            port,
            "tok",
            "profile.json",
            get("/profile/db/r/d/n/profile.json"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PoolError::ProxyTimeout { .. }));

        let route = ProfileRoute::parse("/profile/db/r/d/n/profile.json").unwrap();
        let resp = error_response(&route, &err);
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Proxy timeout\n");
    }

    #[tokio::test]
    async fn refused_connection_maps_to_502() {
        // Grab a port and release it so the connect is refused.
        let port = {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = Client::new();

        let err = forward(
            &client,
            Duration::from_secs(1),
            port,
            "tok",
            "profile.json",
            get("/profile/db/r/d/n/profile.json"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PoolError::Transport { .. }));

        let route = ProfileRoute::parse("/profile/db/r/d/n/profile.json").unwrap();
        let resp = error_response(&route, &err);
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn empty_suffix_still_hits_the_session_root() {
        let (port, seen) =
            upstream_fixture("HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        let client = Client::new();

        forward(
            &client,
            Duration::from_secs(2),
            port,
            "tok",
            "",
            get("/profile/db/r/d/n"),
        )
        .await
        .unwrap();

        let head = seen.await.unwrap();
        assert!(head.starts_with("GET /tok/ HTTP/1.1"), "{head}");
    }
}
