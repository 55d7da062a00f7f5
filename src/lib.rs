pub mod bilibili;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod streamer;
pub mod subtitles;

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use tracing::info;

use crate::error::{RelayError, RelayResult};
use crate::metrics::{BYTES_STREAMED, HTTP_REQUESTS};
use crate::streamer::ResolvedRange;

pub struct AppState {
    pub client: reqwest::Client,
    /// `http://127.0.0.1:<port>` of this server; every rewritten URL points
    /// back here.
    pub origin: String,
}

impl AppState {
    pub fn new(origin: String) -> Self {
        // Redirects are never followed automatically: short-link expansion
        // reads Location itself, and proxied upstream redirects pass through
        // to the player untouched.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("default TLS client");
        Self { client, origin }
    }
}

pub fn create_app(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/local-video/{*path}", get(local_video_handler))
        .route("/subtitles/{*path}", get(subtitles_handler))
        .route("/subtitle-convert/{*rest}", get(subtitle_convert_handler))
        .route("/manifest/{*rest}", get(manifest_handler))
        .route("/proxy/{host}/{*rest}", any(proxy_handler))
        .route("/api/resolve", get(resolve_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP 404: method={} uri={} UA=\"{}\"", method, uri, user_agent);
    Response::builder()
        .status(404)
        .body(Body::from("Not found"))
        .unwrap()
}

/// Take the remainder after a route prefix off the raw request path and
/// decode it once. Extractor-level decoding is bypassed on purpose: these
/// remainders embed full URLs and filesystem paths whose own `%`-escapes
/// must survive until exactly one decode here.
fn decode_remainder(uri: &Uri, prefix: &str) -> RelayResult<String> {
    let raw = uri.path().strip_prefix(prefix).unwrap_or_default();
    if raw.is_empty() {
        return Err(RelayError::BadRequest(format!(
            "missing {prefix} remainder"
        )));
    }
    let decoded = urlencoding::decode(raw)
        .map_err(|e| RelayError::BadRequest(format!("undecodable path: {e}")))?;
    Ok(decoded.into_owned())
}

/// Parse a `k=v&k2=v2` blob, decoding each value once.
fn parse_param_blob(blob: &str) -> Vec<(String, String)> {
    blob.split('&')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| {
            let value = urlencoding::decode(v)
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| v.to_string());
            (k.to_string(), value)
        })
        .collect()
}

fn blob_param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

async fn local_video_handler(
    uri: Uri,
    headers: HeaderMap,
    State(_state): State<Arc<AppState>>,
) -> Result<Response, RelayError> {
    HTTP_REQUESTS.with_label_values(&["local-video"]).inc();

    let decoded = decode_remainder(&uri, "/local-video/")?;
    let path = PathBuf::from(server::strip_quotes(&decoded));

    let range = headers
        .get(axum::http::header::RANGE)
        .and_then(|v| v.to_str().ok());
    info!(
        "HTTP local-video request: path={} Range=\"{}\"",
        path.display(),
        range.unwrap_or("<none>")
    );

    let meta = tokio::fs::metadata(&path).await?;
    if !meta.is_file() {
        return Err(RelayError::NotFound(format!(
            "not a regular file: {}",
            path.display()
        )));
    }

    match streamer::resolve_range(range, meta.len()) {
        ResolvedRange::Unsatisfiable { total } => Ok(Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header("Content-Range", format!("bytes */{total}"))
            .header("Access-Control-Allow-Origin", "*")
            .body(Body::empty())
            .unwrap()),
        ResolvedRange::Satisfiable(spec) => {
            let body = streamer::range_body(&path, &spec).await?;
            BYTES_STREAMED.inc_by(spec.content_length());
            Ok(Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header("Content-Range", spec.content_range())
                .header("Accept-Ranges", "bytes")
                .header("Content-Length", spec.content_length().to_string())
                .header(
                    "Content-Type",
                    streamer::content_type_for(&path.to_string_lossy()),
                )
                .header("Access-Control-Allow-Origin", "*")
                .body(body)
                .unwrap())
        }
    }
}

async fn subtitles_handler(
    uri: Uri,
    State(_state): State<Arc<AppState>>,
) -> Result<Response, RelayError> {
    HTTP_REQUESTS.with_label_values(&["subtitles"]).inc();

    let decoded = decode_remainder(&uri, "/subtitles/")?;
    let path = server::strip_quotes(&decoded).to_string();
    info!("HTTP subtitle request: path={}", path);

    let bytes = tokio::fs::read(&path).await?;
    let text = subtitles::detect_and_decode(&bytes);

    // Files already in the player's timed-text format pass through as-is.
    let vtt = if subtitles::is_timed_text(&path) {
        text
    } else {
        subtitles::srt_to_vtt(&text)
    };

    Ok(vtt_response(vtt))
}

async fn subtitle_convert_handler(
    uri: Uri,
    State(state): State<Arc<AppState>>,
) -> Result<Response, RelayError> {
    HTTP_REQUESTS.with_label_values(&["subtitle-convert"]).inc();

    let raw = uri
        .path()
        .strip_prefix("/subtitle-convert/")
        .unwrap_or_default();
    let params = parse_param_blob(raw);

    let subtitle_url = match blob_param(&params, "subtitle_url") {
        Some(url) => url.to_string(),
        None => {
            // No direct URL given: look the track up by index via the view
            // API, passing the remaining params (bvid/cid or aid) through.
            let index: usize = blob_param(&params, "index")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let pairs: Vec<(&str, &str)> = params
                .iter()
                .filter(|(k, _)| k != "index")
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            if pairs.is_empty() {
                return Err(RelayError::BadRequest(
                    "subtitle-convert needs subtitle_url or video id params".to_string(),
                ));
            }
            let view = bilibili::fetch_view(&state, &pairs).await?;
            let list = view
                .subtitle
                .ok_or_else(|| {
                    RelayError::Upstream("view api response missing subtitle list".to_string())
                })?
                .list;
            list.get(index)
                .ok_or_else(|| RelayError::Upstream(format!("no subtitle track at index {index}")))?
                .subtitle_url
                .clone()
        }
    };

    // Provider subtitle URLs are frequently protocol-relative.
    let subtitle_url = if subtitle_url.starts_with("//") {
        format!("https:{subtitle_url}")
    } else {
        subtitle_url
    };
    info!("HTTP subtitle-convert request: url={}", subtitle_url);

    let resp = state.client.get(&subtitle_url).send().await?;
    if !resp.status().is_success() {
        return Err(RelayError::Upstream(format!(
            "subtitle fetch returned status {}",
            resp.status()
        )));
    }
    let remote: subtitles::RemoteSubtitle = resp
        .json()
        .await
        .map_err(|e| RelayError::Upstream(format!("subtitle json malformed: {e}")))?;

    Ok(vtt_response(subtitles::cues_to_vtt(&remote.body)))
}

async fn manifest_handler(
    uri: Uri,
    State(state): State<Arc<AppState>>,
) -> Result<Response, RelayError> {
    HTTP_REQUESTS.with_label_values(&["manifest"]).inc();

    let raw = uri.path().strip_prefix("/manifest/").unwrap_or_default();
    let blob = raw
        .strip_suffix(".mpd")
        .ok_or_else(|| RelayError::BadRequest("manifest path must end in .mpd".to_string()))?;
    let params = parse_param_blob(blob);
    let bvid = blob_param(&params, "bvid")
        .ok_or_else(|| RelayError::BadRequest("manifest path missing bvid".to_string()))?;
    let cid = blob_param(&params, "cid")
        .ok_or_else(|| RelayError::BadRequest("manifest path missing cid".to_string()))?;
    info!("HTTP manifest request: bvid={} cid={}", bvid, cid);

    let dash = manifest::fetch_playurl(&state, bvid, cid).await?;
    let mpd = manifest::build_mpd(&dash, &state.origin)?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/dash+xml")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(mpd))
        .unwrap())
}

async fn proxy_handler(
    uri: Uri,
    method: Method,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
    body: Bytes,
) -> Result<Response, RelayError> {
    HTTP_REQUESTS.with_label_values(&["proxy"]).inc();

    // Keep the raw, still-encoded path: the upstream expects its own
    // percent-escapes back unchanged.
    let remainder = uri
        .path()
        .strip_prefix("/proxy/")
        .ok_or_else(|| RelayError::BadRequest("missing proxy target".to_string()))?;
    let (host, rest) = remainder
        .split_once('/')
        .ok_or_else(|| RelayError::BadRequest("proxy target missing path".to_string()))?;

    if let Ok(ws) = ws {
        let target = proxy::ws_target(host, rest, uri.query())?;
        info!("Proxying websocket upgrade to {}", target);
        return Ok(proxy::relay_ws(ws, target));
    }

    proxy::relay(
        &state.client,
        host,
        rest,
        uri.query(),
        method,
        &headers,
        body,
    )
    .await
}

#[derive(Deserialize)]
struct ResolveParams {
    url: String,
}

async fn resolve_handler(
    Query(params): Query<ResolveParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<bilibili::ResolvedVideo>, RelayError> {
    HTTP_REQUESTS.with_label_values(&["resolve"]).inc();
    info!("HTTP resolve request: url={}", params.url);
    let resolved = bilibili::resolve_video(&state, &params.url).await?;
    Ok(Json(resolved))
}

async fn metrics_handler() -> impl IntoResponse {
    Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(metrics::gather_metrics()))
        .unwrap()
}

fn vtt_response(vtt: String) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/vtt")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(vtt))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_blob_splits_and_decodes_values() {
        let params = parse_param_blob(
            "subtitle_url=https%3A%2F%2Fsub.example.com%2Fs.json%3Fa%3D1%26b%3D2&index=1",
        );
        assert_eq!(
            blob_param(&params, "subtitle_url"),
            Some("https://sub.example.com/s.json?a=1&b=2")
        );
        assert_eq!(blob_param(&params, "index"), Some("1"));
        assert_eq!(blob_param(&params, "missing"), None);
    }

    #[test]
    fn param_blob_handles_plain_pairs() {
        let params = parse_param_blob("bvid=BV1xx411c7md&cid=1176840");
        assert_eq!(blob_param(&params, "bvid"), Some("BV1xx411c7md"));
        assert_eq!(blob_param(&params, "cid"), Some("1176840"));
    }

    #[test]
    fn remainder_decoding_rejects_empty() {
        let uri: Uri = "/local-video/".parse().unwrap();
        assert!(decode_remainder(&uri, "/local-video/").is_err());

        let uri: Uri = "/local-video/%2Fmedia%2Fa%20clip.mp4".parse().unwrap();
        assert_eq!(
            decode_remainder(&uri, "/local-video/").unwrap(),
            "/media/a clip.mp4"
        );
    }
}
