use std::io::SeekFrom;
use std::path::Path;

use axum::body::Body;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::RelayResult;

/// Upper bound on a single range response. The player pulls follow-up ranges
/// on demand, so one request never buffers more than this.
pub const CHUNK_CEILING: u64 = 4_000_000;

/// A satisfiable byte span within a file of `total` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedRange {
    Satisfiable(RangeSpec),
    /// `start` at or past EOF (or an empty file); answer 416.
    Unsatisfiable { total: u64 },
}

impl RangeSpec {
    pub fn content_length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Pull the start offset out of a `Range: bytes=<start>-` header.
/// Anything unparsable behaves like the header was absent.
fn range_start(header: Option<&str>) -> u64 {
    let Some(header) = header else {
        return 0;
    };
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return 0;
    };
    let start_str = match spec.split_once('-') {
        Some((start, _)) => start,
        None => spec,
    };
    start_str.trim().parse::<u64>().unwrap_or(0)
}

/// Resolve the request header against the file size. A missing header is
/// treated as `bytes=0-`; the end is clamped to both the chunk ceiling and
/// the last byte of the file.
pub fn resolve_range(header: Option<&str>, total: u64) -> ResolvedRange {
    let start = range_start(header);
    if total == 0 || start >= total {
        return ResolvedRange::Unsatisfiable { total };
    }
    let end = (start + CHUNK_CEILING).min(total - 1);
    ResolvedRange::Satisfiable(RangeSpec { start, end, total })
}

/// Content type by file extension, defaulting to mp4 for anything unknown.
pub fn content_type_for(path: &str) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("video/mp4")
        .to_string()
}

/// Open the file and stream exactly `[start, end]` without buffering the
/// span in memory. The handle is owned by the stream and dropped with the
/// response body, including on client abort.
pub async fn range_body(path: &Path, spec: &RangeSpec) -> RelayResult<Body> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(spec.start)).await?;
    let limited = file.take(spec.content_length());
    Ok(Body::from_stream(ReaderStream::new(limited)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_equals_zero_range() {
        let a = resolve_range(None, 10_000_000);
        let b = resolve_range(Some("bytes=0-"), 10_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn end_is_clamped_to_chunk_ceiling() {
        let ResolvedRange::Satisfiable(spec) = resolve_range(Some("bytes=0-"), 50_000_000) else {
            panic!("expected satisfiable range");
        };
        assert_eq!(spec.start, 0);
        assert_eq!(spec.end, CHUNK_CEILING);
        assert_eq!(spec.content_length(), CHUNK_CEILING + 1);
    }

    #[test]
    fn end_never_reaches_file_size() {
        for total in [1u64, 10, 4_000_001, 123_456_789] {
            for start in [0u64, 1, total / 2, total - 1] {
                if let ResolvedRange::Satisfiable(spec) = resolve_range(
                    Some(&format!("bytes={start}-")),
                    total,
                ) {
                    assert!(spec.end < total, "end {} >= total {}", spec.end, total);
                    assert!(spec.content_length() > 0);
                }
            }
        }
    }

    #[test]
    fn near_eof_clamps_without_error() {
        let total = 1000u64;
        let ResolvedRange::Satisfiable(spec) = resolve_range(Some("bytes=990-"), total) else {
            panic!("expected satisfiable range");
        };
        assert_eq!(spec.start, 990);
        assert_eq!(spec.end, total - 1);
        assert_eq!(spec.content_range(), "bytes 990-999/1000");
    }

    #[test]
    fn start_past_eof_is_unsatisfiable() {
        assert_eq!(
            resolve_range(Some("bytes=1000-"), 1000),
            ResolvedRange::Unsatisfiable { total: 1000 }
        );
        assert_eq!(
            resolve_range(None, 0),
            ResolvedRange::Unsatisfiable { total: 0 }
        );
    }

    #[test]
    fn content_type_defaults_to_mp4() {
        assert_eq!(content_type_for("/tmp/clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("/tmp/talk.webm"), "video/webm");
        assert_eq!(content_type_for("/tmp/unknown.xyz123"), "video/mp4");
    }
}
