use chardetng::EncodingDetector;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

lazy_static! {
    // Styling-tag rewrites, applied in this order (X in {i,b,u}):
    // {\X} closes, {\X1} opens, {X} opens, {/X} closes.
    static ref TAG_CLOSE_BACKSLASH: Regex = Regex::new(r"\{\\([ibu])\}").unwrap();
    static ref TAG_OPEN_NUMBERED: Regex = Regex::new(r"\{\\([ibu])1\}").unwrap();
    static ref TAG_OPEN_PLAIN: Regex = Regex::new(r"\{([ibu])\}").unwrap();
    static ref TAG_CLOSE_PLAIN: Regex = Regex::new(r"\{/([ibu])\}").unwrap();
    static ref TIMESTAMP_COMMA: Regex = Regex::new(r"(\d{2}:\d{2}:\d{2}),(\d{3})").unwrap();
    static ref CUE_TIMING_LINE: Regex = Regex::new(
        r"(?m)^(\d{2}:\d{2}:\d{2}\.\d{3} --> \d{2}:\d{2}:\d{2}\.\d{3})(\r?)$"
    )
    .unwrap();
}

const VTT_HEADER: &str = "WEBVTT FILE";
/// Positions cues for the compact player layout.
const CUE_SETTINGS: &str = " align:middle line:90%";

/// Sniff the charset and decode to text. Subtitle files in the wild are
/// frequently GBK/Big5/Windows-125x rather than UTF-8.
pub fn detect_and_decode(bytes: &[u8]) -> String {
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

/// True when the extension already names the timed-text format the player
/// consumes directly; such files are served as-is.
pub fn is_timed_text(path: &str) -> bool {
    path.rsplit('.')
        .next()
        .map(|ext| ext.eq_ignore_ascii_case("vtt"))
        .unwrap_or(false)
}

/// Convert a legacy SubRip-family document to WebVTT: rewrite styling tags,
/// switch timestamp decimal separators, append cue positioning to every
/// timing line, and frame the body with the WEBVTT header.
pub fn srt_to_vtt(input: &str) -> String {
    let text = TAG_CLOSE_BACKSLASH.replace_all(input, "</$1>");
    let text = TAG_OPEN_NUMBERED.replace_all(&text, "<$1>");
    let text = TAG_OPEN_PLAIN.replace_all(&text, "<$1>");
    let text = TAG_CLOSE_PLAIN.replace_all(&text, "</$1>");
    let text = TIMESTAMP_COMMA.replace_all(&text, "$1.$2");
    let text = CUE_TIMING_LINE.replace_all(&text, format!("${{1}}{CUE_SETTINGS}${{2}}"));

    let mut out = format!("{VTT_HEADER}\n\n{text}");
    while !out.ends_with("\n\n") {
        out.push('\n');
    }
    out
}

/// One cue from a provider's remote subtitle JSON (`body` array).
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCue {
    pub from: f64,
    pub to: f64,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct RemoteSubtitle {
    pub body: Vec<RemoteCue>,
}

/// `HH:MM:SS.mmm` with millisecond precision.
pub fn format_cue_time(seconds: f64) -> String {
    let total_ms = (seconds * 1000.0).round().max(0.0) as u64;
    let ms = total_ms % 1000;
    let s = (total_ms / 1000) % 60;
    let m = (total_ms / 60_000) % 60;
    let h = total_ms / 3_600_000;
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

/// Render a remote cue list as WebVTT, cues numbered from 1 in source order.
pub fn cues_to_vtt(cues: &[RemoteCue]) -> String {
    let mut out = String::from("WEBVTT FILE\r\n\r\n");
    for (i, cue) in cues.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_cue_time(cue.from),
            format_cue_time(cue.to),
            cue.content
        ));
    }
    out
}
