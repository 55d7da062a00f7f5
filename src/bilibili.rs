use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RelayError, RelayResult};
use crate::proxy;
use crate::AppState;

pub const VIEW_API: &str = "https://api.bilibili.com/x/web-interface/view";

lazy_static! {
    // Pattern table for provider URLs. Matching order is load-bearing: the
    // short-link host is checked first, then the two id shapes.
    static ref BILI_URL: Regex = Regex::new(
        r"(?i)(bilibili\.com/(video/)?((av\d{8})|(bv[A-Za-z0-9]{10}))(\?|/)?)|(b23\.tv/([A-Za-z0-9]{6}|[A-Za-z0-9]{12})$)"
    )
    .unwrap();
    static ref SHORT_LINK: Regex = Regex::new(r"(?i)b23\.tv/[A-Za-z0-9]{6}").unwrap();
    static ref BV_ID: Regex = Regex::new(r"(?i)/(bv[A-Za-z0-9]{10})").unwrap();
    static ref AV_ID: Regex = Regex::new(r"(?i)/av(\d{8})").unwrap();
    static ref PAGE_PARAM: Regex = Regex::new(r"(?i)\?p=(\d+)").unwrap();
    static ref SCHEME: Regex = Regex::new(r"^(?i)https?://").unwrap();
}

pub fn is_bili_url(url: &str) -> bool {
    BILI_URL.is_match(url)
}

/// Content identifier extracted from a page URL, carrying which query
/// parameter the view API expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoId {
    Bvid(String),
    Aid(String),
}

impl VideoId {
    pub fn query_pair(&self) -> (&'static str, &str) {
        match self {
            VideoId::Bvid(v) => ("bvid", v),
            VideoId::Aid(v) => ("aid", v),
        }
    }
}

/// Locate the 10-character alphanumeric id after `/bv`, or the 8-digit
/// legacy id after `/av`. Neither matching is a caller error, distinct from
/// any upstream failure.
pub fn extract_video_id(url: &str) -> RelayResult<VideoId> {
    if let Some(caps) = BV_ID.captures(url) {
        return Ok(VideoId::Bvid(caps[1].to_string()));
    }
    if let Some(caps) = AV_ID.captures(url) {
        return Ok(VideoId::Aid(caps[1].to_string()));
    }
    Err(RelayError::UnsupportedUrl(url.to_string()))
}

/// `?p=<n>` page index, defaulting to the first part.
pub fn page_index(url: &str) -> String {
    PAGE_PARAM
        .captures(url)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| "1".to_string())
}

/// Expand a short link by following exactly one `Location` hop. The client
/// has redirect-following disabled, so the HEAD response carries the target.
pub async fn expand_short_link(client: &reqwest::Client, url: &str) -> RelayResult<String> {
    let absolute = if SCHEME.is_match(url) {
        url.to_string()
    } else {
        format!("https://{url}")
    };
    let resp = client.head(&absolute).send().await?;
    let location = resp
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            RelayError::Upstream(format!("short link {absolute} returned no redirect"))
        })?;
    Ok(location.to_string())
}

#[derive(Debug, Deserialize)]
struct ViewResponse {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<ViewData>,
}

#[derive(Debug, Deserialize)]
pub struct ViewData {
    #[serde(default)]
    pub bvid: String,
    #[serde(default)]
    pub pages: Vec<PageInfo>,
    pub subtitle: Option<SubtitleInfo>,
}

#[derive(Debug, Deserialize)]
pub struct PageInfo {
    pub cid: u64,
    pub page: u32,
}

#[derive(Debug, Deserialize)]
pub struct SubtitleInfo {
    #[serde(default)]
    pub list: Vec<SubtitleEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SubtitleEntry {
    pub lan: String,
    pub subtitle_url: String,
}

/// One subtitle track descriptor as the player consumes it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubtitleTrack {
    pub kind: &'static str,
    pub src: String,
    #[serde(rename = "srcLang")]
    pub src_lang: String,
    pub label: String,
    #[serde(rename = "default")]
    pub is_default: bool,
}

/// Resolver output: a same-origin manifest URL plus subtitle descriptors,
/// consumed once by the caller to configure the player.
#[derive(Debug, Serialize)]
pub struct ResolvedVideo {
    pub url: String,
    pub subtitles: Vec<SubtitleTrack>,
}

/// Call the view API through our own proxy route (which owns the spoofed
/// headers) and unwrap the payload envelope.
pub async fn fetch_view(state: &AppState, params: &[(&str, &str)]) -> RelayResult<ViewData> {
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let target = proxy::proxied_url(&format!("{VIEW_API}?{query}"), &state.origin)?;

    let resp = state.client.get(&target).send().await?;
    if !resp.status().is_success() {
        return Err(RelayError::Upstream(format!(
            "view api returned status {}",
            resp.status()
        )));
    }
    let body: ViewResponse = resp
        .json()
        .await
        .map_err(|e| RelayError::Upstream(format!("view api returned malformed json: {e}")))?;
    if body.code != 0 {
        return Err(RelayError::Upstream(format!(
            "view api error code {}: {}",
            body.code, body.message
        )));
    }
    body.data
        .ok_or_else(|| RelayError::Upstream("view api response missing data".to_string()))
}

/// Build the subtitle descriptor list for one page; the first track is the
/// default one.
pub fn subtitle_tracks(entries: &[SubtitleEntry], origin: &str) -> Vec<SubtitleTrack> {
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| SubtitleTrack {
            kind: "subtitles",
            src: format!(
                "{}/subtitle-convert/subtitle_url={}",
                origin,
                urlencoding::encode(&entry.subtitle_url)
            ),
            src_lang: entry.lan.clone(),
            label: entry.lan.clone(),
            is_default: i == 0,
        })
        .collect()
}

/// Resolve a provider page URL into a playable same-origin manifest URL and
/// subtitle tracks: optional single short-link hop, id extraction, view
/// lookup, then the page's subtitle list (page 1 reuses the first response).
pub async fn resolve_video(state: &AppState, page_url: &str) -> RelayResult<ResolvedVideo> {
    let mut url = page_url.trim().to_string();
    if SHORT_LINK.is_match(&url) {
        url = expand_short_link(&state.client, &url).await?;
        info!("Short link expanded to {}", url);
    }

    let id = extract_video_id(&url)?;
    let page = page_index(&url);

    let (key, value) = id.query_pair();
    let view = fetch_view(state, &[(key, value)]).await?;

    let page_info = view
        .pages
        .iter()
        .find(|p| p.page.to_string() == page)
        .ok_or_else(|| RelayError::Upstream(format!("video has no page {page}")))?;
    let cid = page_info.cid.to_string();

    let bvid = match &id {
        VideoId::Bvid(b) => b.clone(),
        VideoId::Aid(_) => view.bvid.clone(),
    };

    // Page 1's subtitle list rides along with the first view response; any
    // other page needs a second call scoped to (bvid, cid).
    let subtitle = if page != "1" {
        fetch_view(state, &[("bvid", bvid.as_str()), ("cid", cid.as_str())])
            .await?
            .subtitle
    } else {
        view.subtitle
    };
    let entries = subtitle
        .ok_or_else(|| RelayError::Upstream("view api response missing subtitle list".to_string()))?
        .list;

    Ok(ResolvedVideo {
        url: format!("{}/manifest/bvid={}&cid={}.mpd", state.origin, bvid, cid),
        subtitles: subtitle_tracks(&entries, &state.origin),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_provider_urls() {
        assert!(is_bili_url("https://www.bilibili.com/video/BV1xx411c7md"));
        assert!(is_bili_url("https://www.bilibili.com/video/av12345678/"));
        assert!(is_bili_url("https://b23.tv/abc123"));
        assert!(!is_bili_url("https://example.com/video/1"));
    }

    #[test]
    fn extracts_bv_id() {
        let id = extract_video_id("https://www.bilibili.com/video/BV1xx411c7md?p=2").unwrap();
        assert_eq!(id, VideoId::Bvid("BV1xx411c7md".to_string()));
        assert_eq!(id.query_pair().0, "bvid");
    }

    #[test]
    fn extracts_legacy_av_id() {
        let id = extract_video_id("https://www.bilibili.com/video/av12345678").unwrap();
        assert_eq!(id, VideoId::Aid("12345678".to_string()));
        assert_eq!(id.query_pair().0, "aid");
    }

    #[test]
    fn unsupported_url_is_a_caller_error() {
        let err = extract_video_id("https://example.com/watch?v=nope").unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedUrl(_)));
    }

    #[test]
    fn page_index_defaults_to_first_part() {
        assert_eq!(page_index("https://www.bilibili.com/video/BV1xx411c7md"), "1");
        assert_eq!(
            page_index("https://www.bilibili.com/video/BV1xx411c7md?p=3"),
            "3"
        );
    }

    #[test]
    fn subtitle_tracks_mark_only_first_as_default() {
        let entries = vec![
            SubtitleEntry {
                lan: "zh-CN".into(),
                subtitle_url: "https://i0.example.com/a.json?x=1&y=2".into(),
            },
            SubtitleEntry {
                lan: "en-US".into(),
                subtitle_url: "https://i0.example.com/b.json".into(),
            },
        ];
        let tracks = subtitle_tracks(&entries, "http://127.0.0.1:12345");
        assert_eq!(tracks.len(), 2);
        assert!(tracks[0].is_default);
        assert!(!tracks[1].is_default);
        assert_eq!(tracks[0].src_lang, "zh-CN");
        assert!(tracks[0]
            .src
            .starts_with("http://127.0.0.1:12345/subtitle-convert/subtitle_url="));
        // The carried URL is encoded so its own query does not split ours.
        assert!(!tracks[0].src.contains("y=2"));
        assert!(tracks[0].src.contains("y%3D2"));
    }

    #[test]
    fn parses_view_payload() {
        let raw = r#"{
            "code": 0,
            "message": "0",
            "data": {
                "bvid": "BV1xx411c7md",
                "pages": [
                    {"cid": 111, "page": 1},
                    {"cid": 222, "page": 2}
                ],
                "subtitle": {"list": [{"lan": "zh-CN", "subtitle_url": "//aisubtitle.example.com/s.json"}]}
            }
        }"#;
        let parsed: ViewResponse = serde_json::from_str(raw).unwrap();
        let data = parsed.data.unwrap();
        assert_eq!(data.pages[1].cid, 222);
        assert_eq!(data.subtitle.unwrap().list[0].lan, "zh-CN");
    }
}
