//! File responses with HTTP range support for in-browser playback.

use std::io::SeekFrom;
use std::path::Path;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::EditError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// No usable range; serve the whole file.
    Full,
    /// Inclusive byte window.
    Partial { start: u64, end: u64 },
    /// Syntactically valid but outside the file.
    Unsatisfiable,
}

/// Parse a single-range `Range` header against a file size.
///
/// Supports `bytes=0-499`, `bytes=500-` and `bytes=-500`. Malformed or
/// multi-range headers are ignored rather than rejected.
pub fn parse_range(header: Option<&str>, file_size: u64) -> ByteRange {
    let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if ranges.contains(',') {
        return ByteRange::Full;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return ByteRange::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    match (start.is_empty(), end.is_empty()) {
        (true, false) => {
            let Ok(suffix) = end.parse::<u64>() else {
                return ByteRange::Full;
            };
            if suffix == 0 || file_size == 0 {
                return ByteRange::Unsatisfiable;
            }
            ByteRange::Partial {
                start: file_size.saturating_sub(suffix),
                end: file_size - 1,
            }
        }
        (false, true) => {
            let Ok(start) = start.parse::<u64>() else {
                return ByteRange::Full;
            };
            if start >= file_size {
                return ByteRange::Unsatisfiable;
            }
            ByteRange::Partial {
                start,
                end: file_size - 1,
            }
        }
        (false, false) => {
            let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                return ByteRange::Full;
            };
            if start > end {
                return ByteRange::Full;
            }
            if start >= file_size {
                return ByteRange::Unsatisfiable;
            }
            ByteRange::Partial {
                start,
                end: end.min(file_size - 1),
            }
        }
        (true, true) => ByteRange::Full,
    }
}

pub fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Stream `path`, honouring `range`. With `download_name` set the response
/// carries an attachment `Content-Disposition`.
pub async fn serve_file(
    path: &Path,
    range: Option<&str>,
    download_name: Option<&str>,
) -> Result<Response, EditError> {
    let not_found = || {
        EditError::not_found(format!(
            "file not found: {}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ))
    };
    let metadata = tokio::fs::metadata(path).await.map_err(|_| not_found())?;
    if !metadata.is_file() {
        return Err(not_found());
    }
    let file_size = metadata.len();
    let mut file = File::open(path).await.map_err(|_| not_found())?;

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type_for(path))
        .header(header::ACCEPT_RANGES, "bytes");
    if let Some(name) = download_name {
        let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
            .map_err(|err| EditError::Internal(err.to_string()))?;
        builder = builder.header(header::CONTENT_DISPOSITION, disposition);
    }

    let response = match parse_range(range, file_size) {
        ByteRange::Full => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, file_size)
            .body(Body::from_stream(ReaderStream::new(file))),
        ByteRange::Partial { start, end } => {
            let length = end - start + 1;
            file.seek(SeekFrom::Start(start)).await?;
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, length)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{file_size}"),
                )
                .body(Body::from_stream(ReaderStream::new(file.take(length))))
        }
        ByteRange::Unsatisfiable => builder
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{file_size}"))
            .body(Body::empty()),
    };
    response.map_err(|err| EditError::Internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::{tempdir, TempDir};

    use super::*;

    fn sample_file() -> (TempDir, PathBuf) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("clip.mp4");
        let bytes: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, bytes).expect("write sample");
        (dir, path)
    }

    fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> &'a str {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    #[test]
    fn parse_range_forms() {
        assert_eq!(
            parse_range(Some("bytes=0-499"), 1000),
            ByteRange::Partial { start: 0, end: 499 }
        );
        assert_eq!(
            parse_range(Some("bytes=500-"), 1000),
            ByteRange::Partial {
                start: 500,
                end: 999
            }
        );
        assert_eq!(
            parse_range(Some("bytes=-200"), 1000),
            ByteRange::Partial {
                start: 800,
                end: 999
            }
        );
        assert_eq!(
            parse_range(Some("bytes=-5000"), 1000),
            ByteRange::Partial { start: 0, end: 999 }
        );
        assert_eq!(
            parse_range(Some("bytes=0-2000"), 1000),
            ByteRange::Partial { start: 0, end: 999 }
        );
    }

    #[test]
    fn parse_range_edge_cases() {
        assert_eq!(parse_range(None, 1000), ByteRange::Full);
        assert_eq!(parse_range(Some("bytes=-"), 1000), ByteRange::Full);
        assert_eq!(parse_range(Some("bytes=abc-def"), 1000), ByteRange::Full);
        assert_eq!(parse_range(Some("items=0-1"), 1000), ByteRange::Full);
        assert_eq!(parse_range(Some("bytes=0-1,5-6"), 1000), ByteRange::Full);
        assert_eq!(parse_range(Some("bytes=9-3"), 1000), ByteRange::Full);
        assert_eq!(parse_range(Some("bytes=1000-"), 1000), ByteRange::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=1500-1600"), 1000), ByteRange::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=-0"), 1000), ByteRange::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=0-10"), 0), ByteRange::Unsatisfiable);
    }

    #[tokio::test]
    async fn ranged_request_returns_partial_content() {
        let (_dir, path) = sample_file();
        let response = serve_file(&path, Some("bytes=0-99"), None)
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 0-99/1000");
        assert_eq!(header_str(&response, header::CONTENT_LENGTH), "100");
        assert_eq!(header_str(&response, header::ACCEPT_RANGES), "bytes");
        assert_eq!(header_str(&response, header::CONTENT_TYPE), "video/mp4");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(body.len(), 100);
        assert_eq!(body[99], 99);
    }

    #[tokio::test]
    async fn open_range_streams_the_tail() {
        let (_dir, path) = sample_file();
        let response = serve_file(&path, Some("bytes=900-"), None)
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 900-999/1000");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(body.len(), 100);
        assert_eq!(body[0], (900 % 251) as u8);
    }

    #[tokio::test]
    async fn missing_range_returns_whole_file() {
        let (_dir, path) = sample_file();
        let response = serve_file(&path, None, None).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, header::CONTENT_LENGTH), "1000");
        assert!(response.headers().get(header::CONTENT_DISPOSITION).is_none());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(body.len(), 1000);
    }

    #[tokio::test]
    async fn out_of_bounds_range_is_416() {
        let (_dir, path) = sample_file();
        let response = serve_file(&path, Some("bytes=5000-"), None)
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes */1000");
    }

    #[tokio::test]
    async fn download_name_sets_attachment_disposition() {
        let (_dir, path) = sample_file();
        let response = serve_file(&path, None, Some("clip.mp4"))
            .await
            .expect("response");
        assert_eq!(
            header_str(&response, header::CONTENT_DISPOSITION),
            "attachment; filename=\"clip.mp4\""
        );
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let err = serve_file(&dir.path().join("gone.mp4"), None, None)
            .await
            .expect_err("missing");
        assert!(matches!(err, EditError::NotFound(_)));
    }
}
