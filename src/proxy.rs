use axum::body::Body;
use axum::extract::ws::{Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue, Method, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{info, warn};
use url::Url;

use crate::error::{RelayError, RelayResult};
use crate::metrics::UPSTREAM_FAILURES;

/// Browser identity presented to upstream hosts. The provider rejects
/// requests without a plausible UA/Referer/Origin triple, which is the whole
/// reason this relay exists instead of fetching from the player directly.
pub const SPOOFED_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/112.0";
pub const PROVIDER_SITE: &str = "https://www.bilibili.com/";

/// Reconstruct the upstream HTTPS URL from the `/proxy/{host}/{*rest}`
/// route pieces. The host segment varies per call, so this is resolved at
/// request time rather than by a static rule.
pub fn proxy_target(host: &str, rest: &str, query: Option<&str>) -> RelayResult<String> {
    if host.is_empty() || host.contains('/') || host.contains('@') {
        return Err(RelayError::BadRequest(format!("invalid proxy host: {host:?}")));
    }
    let mut target = format!("https://{}/{}", host, rest.trim_start_matches('/'));
    if let Some(q) = query {
        if !q.is_empty() {
            target.push('?');
            target.push_str(q);
        }
    }
    // Reject anything that does not survive a parse round-trip.
    Url::parse(&target).map_err(|e| RelayError::BadRequest(format!("bad proxy target: {e}")))?;
    Ok(target)
}

/// Same reconstruction for a WebSocket upgrade.
pub fn ws_target(host: &str, rest: &str, query: Option<&str>) -> RelayResult<String> {
    let https = proxy_target(host, rest, query)?;
    Ok(format!("wss{}", https.trim_start_matches("https")))
}

/// Rewrite an absolute upstream URL into the local same-origin proxy route:
/// `https://host/path?q` becomes `{origin}/proxy/host/path?q`.
pub fn proxied_url(upstream: &str, origin: &str) -> RelayResult<String> {
    let url = Url::parse(upstream)
        .map_err(|e| RelayError::Upstream(format!("unparsable upstream url {upstream:?}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::Upstream(format!("upstream url has no host: {upstream:?}")))?;
    let mut out = format!("{}/proxy/{}{}", origin, host, url.path());
    if let Some(q) = url.query() {
        out.push('?');
        out.push_str(q);
    }
    Ok(out)
}

/// Hop-by-hop headers never cross the relay in either direction.
fn is_hop_by_hop(name: &header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Request headers going upstream: everything the client sent minus
/// hop-by-hop, `Host` and `Content-Length` (the HTTP client recomputes
/// both), with the browser-identity triple overridden.
fn outbound_headers(client_headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in client_headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out.insert(header::USER_AGENT, HeaderValue::from_static(SPOOFED_USER_AGENT));
    out.insert(header::REFERER, HeaderValue::from_static(PROVIDER_SITE));
    out.insert(header::ORIGIN, HeaderValue::from_static(PROVIDER_SITE));
    out
}

/// Response headers going back to the player: everything upstream sent
/// minus hop-by-hop, with the CORS grant overwritten. Content-Encoding and
/// caching validators in particular must survive, since the body bytes are
/// streamed through undecoded.
fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        if is_hop_by_hop(name) || name == header::ACCESS_CONTROL_ALLOW_ORIGIN {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    out
}

/// Forward one HTTP request to the reconstructed target. Headers pass
/// through transparently both ways (minus hop-by-hop), with the browser
/// identity spoofed outbound and permissive CORS forced inbound. The
/// upstream body is streamed straight through. No timeout is applied; a
/// hung upstream hangs this request (known gap, kept deliberately).
pub async fn relay(
    client: &reqwest::Client,
    host: &str,
    rest: &str,
    query: Option<&str>,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
) -> RelayResult<Response<Body>> {
    let target = proxy_target(host, rest, query)?;
    info!("Proxying {} {}", method, target);

    let mut req = client
        .request(method, &target)
        .headers(outbound_headers(headers));
    if !body.is_empty() {
        req = req.body(body);
    }

    let upstream = req.send().await.map_err(|e| {
        UPSTREAM_FAILURES.inc();
        RelayError::Upstream(format!("proxy request to {target} failed: {e}"))
    })?;

    let status = upstream.status();
    let headers_out = response_headers(upstream.headers());
    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| RelayError::Internal(e.to_string()))?;
    *response.headers_mut() = headers_out;
    Ok(response)
}

/// Accept the client-side upgrade and bridge frames to the upstream socket.
pub fn relay_ws(ws: WebSocketUpgrade, target: String) -> Response<Body> {
    ws.on_upgrade(move |socket| bridge(socket, target))
}

async fn bridge(client: WebSocket, target: String) {
    let (upstream, _) = match connect_async(&target).await {
        Ok(conn) => conn,
        Err(e) => {
            UPSTREAM_FAILURES.inc();
            warn!("WebSocket upstream connect failed: target={} err={}", target, e);
            return;
        }
    };
    info!("WebSocket bridge open: {}", target);

    let (mut up_tx, mut up_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client.split();

    loop {
        tokio::select! {
            from_client = client_rx.next() => {
                let msg = match from_client {
                    Some(Ok(msg)) => msg,
                    _ => break,
                };
                let forward = match msg {
                    ClientMessage::Text(t) => UpstreamMessage::text(t.as_str()),
                    ClientMessage::Binary(b) => UpstreamMessage::Binary(b),
                    ClientMessage::Ping(p) => UpstreamMessage::Ping(p),
                    ClientMessage::Pong(p) => UpstreamMessage::Pong(p),
                    ClientMessage::Close(_) => break,
                };
                if up_tx.send(forward).await.is_err() {
                    break;
                }
            }
            from_upstream = up_rx.next() => {
                let msg = match from_upstream {
                    Some(Ok(msg)) => msg,
                    _ => break,
                };
                let forward = match msg {
                    UpstreamMessage::Text(t) => ClientMessage::Text(t.as_str().into()),
                    UpstreamMessage::Binary(b) => ClientMessage::Binary(b),
                    UpstreamMessage::Ping(p) => ClientMessage::Ping(p),
                    UpstreamMessage::Pong(p) => ClientMessage::Pong(p),
                    UpstreamMessage::Close(_) => break,
                    UpstreamMessage::Frame(_) => continue,
                };
                if client_tx.send(forward).await.is_err() {
                    break;
                }
            }
        }
    }
    info!("WebSocket bridge closed: {}", target);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstructs_target_from_route_pieces() {
        let target = proxy_target(
            "api.bilibili.com",
            "x/web-interface/view",
            Some("bvid=BV1xx411c7md"),
        )
        .unwrap();
        assert_eq!(
            target,
            "https://api.bilibili.com/x/web-interface/view?bvid=BV1xx411c7md"
        );
    }

    #[test]
    fn target_without_query_keeps_plain_path() {
        let target = proxy_target("upos-sz.bilivideo.com", "v/seg.m4s", None).unwrap();
        assert_eq!(target, "https://upos-sz.bilivideo.com/v/seg.m4s");
    }

    #[test]
    fn rejects_malformed_hosts() {
        assert!(proxy_target("", "x", None).is_err());
        assert!(proxy_target("a/b", "x", None).is_err());
        assert!(proxy_target("user@evil", "x", None).is_err());
    }

    #[test]
    fn proxied_url_round_trips_through_target() {
        let origin = "http://127.0.0.1:16253";
        let upstream = "https://api.bilibili.com/x/player/playurl?bvid=BV1&cid=2";
        let local = proxied_url(upstream, origin).unwrap();
        assert_eq!(
            local,
            "http://127.0.0.1:16253/proxy/api.bilibili.com/x/player/playurl?bvid=BV1&cid=2"
        );

        // The handler splits {host}/{*rest}?{query}; rebuilding must land on
        // the original upstream URL.
        let rebuilt = proxy_target(
            "api.bilibili.com",
            "x/player/playurl",
            Some("bvid=BV1&cid=2"),
        )
        .unwrap();
        assert_eq!(rebuilt, upstream);
    }

    #[test]
    fn ws_target_swaps_scheme() {
        let target = ws_target("live.example.com", "sub", None).unwrap();
        assert_eq!(target, "wss://live.example.com/sub");
    }

    #[test]
    fn outbound_headers_pass_through_with_identity_spoofed() {
        let mut client_headers = HeaderMap::new();
        client_headers.insert(header::USER_AGENT, "player/1.0".parse().unwrap());
        client_headers.insert(header::ACCEPT_ENCODING, "gzip".parse().unwrap());
        client_headers.insert(header::RANGE, "bytes=0-".parse().unwrap());
        client_headers.insert(header::IF_NONE_MATCH, "\"abc\"".parse().unwrap());
        client_headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        client_headers.insert(header::HOST, "127.0.0.1:16253".parse().unwrap());
        client_headers.insert(header::CONTENT_LENGTH, "12".parse().unwrap());

        let out = outbound_headers(&client_headers);
        assert_eq!(out[header::USER_AGENT], SPOOFED_USER_AGENT);
        assert_eq!(out[header::REFERER], PROVIDER_SITE);
        assert_eq!(out[header::ORIGIN], PROVIDER_SITE);
        assert_eq!(out[header::ACCEPT_ENCODING], "gzip");
        assert_eq!(out[header::RANGE], "bytes=0-");
        assert_eq!(out[header::IF_NONE_MATCH], "\"abc\"");
        assert!(!out.contains_key(header::CONNECTION));
        assert!(!out.contains_key(header::HOST));
        assert!(!out.contains_key(header::CONTENT_LENGTH));
    }

    #[test]
    fn response_headers_keep_encoding_and_validators_with_forced_cors() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, "video/mp4".parse().unwrap());
        upstream.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        upstream.insert(header::ETAG, "\"seg-42\"".parse().unwrap());
        upstream.insert(
            header::LAST_MODIFIED,
            "Wed, 01 Jan 2025 00:00:00 GMT".parse().unwrap(),
        );
        upstream.insert(header::CONTENT_RANGE, "bytes 0-99/1000".parse().unwrap());
        upstream.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        upstream.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            "https://www.bilibili.com".parse().unwrap(),
        );

        let out = response_headers(&upstream);
        assert_eq!(out[header::CONTENT_ENCODING], "gzip");
        assert_eq!(out[header::ETAG], "\"seg-42\"");
        assert_eq!(out[header::LAST_MODIFIED], "Wed, 01 Jan 2025 00:00:00 GMT");
        assert_eq!(out[header::CONTENT_RANGE], "bytes 0-99/1000");
        assert!(!out.contains_key(header::TRANSFER_ENCODING));
        assert_eq!(out[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
