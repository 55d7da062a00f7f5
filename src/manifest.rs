use serde::Deserialize;

use crate::error::{RelayError, RelayResult};
use crate::proxy;
use crate::AppState;

pub const PLAYURL_API: &str = "https://api.bilibili.com/x/player/playurl";

/// Only AV1 representations go into the video adaptation set; the provider
/// also ships AVC/HEVC variants and those are deliberately excluded.
pub const AV1_CODEC_PREFIX: &str = "av01";

#[derive(Debug, Deserialize)]
struct PlayurlResponse {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<PlayurlData>,
}

#[derive(Debug, Deserialize)]
struct PlayurlData {
    dash: Option<DashInfo>,
}

/// The provider's raw playback description: parallel video/audio
/// representation arrays plus overall timing.
#[derive(Debug, Deserialize)]
pub struct DashInfo {
    pub duration: f64,
    #[serde(rename = "minBufferTime", alias = "min_buffer_time")]
    pub min_buffer_time: f64,
    #[serde(default)]
    pub video: Vec<DashRepresentation>,
    #[serde(default)]
    pub audio: Vec<DashRepresentation>,
}

#[derive(Debug, Deserialize)]
pub struct DashRepresentation {
    pub id: u64,
    #[serde(rename = "baseUrl", alias = "base_url")]
    pub base_url: String,
    pub bandwidth: u64,
    #[serde(rename = "mimeType", alias = "mime_type")]
    pub mime_type: String,
    pub codecs: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(rename = "frameRate", alias = "frame_rate", default)]
    pub frame_rate: Option<String>,
    #[serde(default)]
    pub sar: Option<String>,
    #[serde(rename = "startWithSap", alias = "start_with_sap", default)]
    pub start_with_sap: Option<u32>,
    #[serde(default)]
    pub codecid: Option<u32>,
    #[serde(rename = "SegmentBase", alias = "segment_base")]
    pub segment_base: SegmentBase,
}

/// Byte-range index pointer plus initialization-segment span.
#[derive(Debug, Deserialize)]
pub struct SegmentBase {
    #[serde(rename = "indexRange", alias = "index_range")]
    pub index_range: String,
    #[serde(rename = "Initialization", alias = "initialization")]
    pub initialization: String,
}

/// Fetch the playback description for `(bvid, cid)` through the proxy,
/// requesting the highest adaptive-bitrate mode with 4K enabled.
pub async fn fetch_playurl(state: &AppState, bvid: &str, cid: &str) -> RelayResult<DashInfo> {
    let query = format!("bvid={bvid}&cid={cid}&fnval=16&qn=64&fnver=0&fourk=1");
    let target = proxy::proxied_url(&format!("{PLAYURL_API}?{query}"), &state.origin)?;

    let resp = state.client.get(&target).send().await?;
    if !resp.status().is_success() {
        return Err(RelayError::Upstream(format!(
            "playurl api returned status {}",
            resp.status()
        )));
    }
    let body: PlayurlResponse = resp
        .json()
        .await
        .map_err(|e| RelayError::Upstream(format!("playurl api returned malformed json: {e}")))?;
    if body.code != 0 {
        return Err(RelayError::Upstream(format!(
            "playurl api error code {}: {}",
            body.code, body.message
        )));
    }
    body.data
        .and_then(|d| d.dash)
        .ok_or_else(|| RelayError::Upstream("playurl response missing dash description".to_string()))
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(&escape_xml(value));
    out.push('"');
}

fn push_representation(
    out: &mut String,
    rep: &DashRepresentation,
    origin: &str,
) -> RelayResult<()> {
    out.push_str("      <Representation");
    push_attr(out, "id", &rep.id.to_string());
    push_attr(out, "bandwidth", &rep.bandwidth.to_string());
    push_attr(out, "mimeType", &rep.mime_type);
    push_attr(out, "codecs", &rep.codecs);
    if let Some(width) = rep.width {
        push_attr(out, "width", &width.to_string());
    }
    if let Some(height) = rep.height {
        push_attr(out, "height", &height.to_string());
    }
    if let Some(frame_rate) = &rep.frame_rate {
        push_attr(out, "frameRate", frame_rate);
    }
    if let Some(sar) = &rep.sar {
        push_attr(out, "sar", sar);
    }
    if let Some(sap) = rep.start_with_sap {
        push_attr(out, "startWithSap", &sap.to_string());
    }
    if let Some(codecid) = rep.codecid {
        push_attr(out, "codecid", &codecid.to_string());
    }
    out.push_str(">\n");

    // Media URLs must never point at the upstream host directly.
    let base = proxy::proxied_url(&rep.base_url, origin)?;
    out.push_str("        <BaseURL>");
    out.push_str(&escape_xml(&base));
    out.push_str("</BaseURL>\n");

    out.push_str("        <SegmentBase");
    push_attr(out, "indexRange", &rep.segment_base.index_range);
    push_attr(out, "Initialization", &rep.segment_base.initialization);
    out.push_str("/>\n");

    out.push_str("      </Representation>\n");
    Ok(())
}

/// Emit a static on-demand MPD for the playback description, with one
/// AV1-only video adaptation set, one audio adaptation set carrying every
/// representation, and all BaseURLs rewritten through the local proxy.
pub fn build_mpd(dash: &DashInfo, origin: &str) -> RelayResult<String> {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    out.push_str("<MPD");
    push_attr(&mut out, "xmlns", "urn:mpeg:dash:schema:mpd:2011");
    push_attr(
        &mut out,
        "profiles",
        "urn:mpeg:dash:profile:isoff-on-demand:2011,http://dashif.org/guidelines/dash264",
    );
    push_attr(&mut out, "type", "static");
    push_attr(&mut out, "minBufferTime", &format!("PT{}S", dash.min_buffer_time));
    push_attr(
        &mut out,
        "mediaPresentationDuration",
        &format!("PT{}S", dash.duration),
    );
    out.push_str(">\n");

    out.push_str("  <Period");
    push_attr(&mut out, "duration", &format!("PT{}S", dash.duration));
    out.push_str(">\n");

    out.push_str("    <AdaptationSet contentType=\"video\" bitstreamSwitching=\"true\">\n");
    for rep in dash
        .video
        .iter()
        .filter(|r| r.codecs.starts_with(AV1_CODEC_PREFIX))
    {
        push_representation(&mut out, rep, origin)?;
    }
    out.push_str("    </AdaptationSet>\n");

    out.push_str("    <AdaptationSet contentType=\"audio\" bitstreamSwitching=\"true\">\n");
    for rep in &dash.audio {
        push_representation(&mut out, rep, origin)?;
    }
    out.push_str("    </AdaptationSet>\n");

    out.push_str("  </Period>\n</MPD>\n");
    Ok(out)
}
