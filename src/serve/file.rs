//! Blob streaming with single-range support.

use std::io::SeekFrom;

use axum::body::Body;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::store::BlobReader;

const STREAM_BUF_SIZE: usize = 64 * 1024;

/// What a Range header asks for, against a representation of `size` bytes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RangeOutcome {
    /// No (usable) range: serve the full representation.
    Full,
    /// Byte range, end exclusive.
    Partial { start: u64, end: u64 },
    /// Syntactically valid but outside the representation: 416.
    Unsatisfiable,
}

/// Parse a `Range` header. Only single byte ranges are honoured;
/// multi-range requests and malformed headers fall back to the full
/// representation per RFC 9110 (a server MAY ignore the header).
pub(crate) fn parse_range(header: &str, size: u64) -> RangeOutcome {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        return RangeOutcome::Full;
    }
    let spec = spec.trim();

    if let Some(suffix) = spec.strip_prefix('-') {
        // bytes=-N: the final N bytes
        let Ok(n) = suffix.parse::<u64>() else {
            return RangeOutcome::Full;
        };
        if n == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let start = size.saturating_sub(n);
        return RangeOutcome::Partial { start, end: size };
    }

    let Some((start, end)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };
    let Ok(start) = start.parse::<u64>() else {
        return RangeOutcome::Full;
    };
    let end = if end.is_empty() {
        size
    } else {
        match end.parse::<u64>() {
            // inclusive in the header, exclusive here
            Ok(e) => (e + 1).min(size),
            Err(_) => return RangeOutcome::Full,
        }
    };

    if start >= size {
        return RangeOutcome::Unsatisfiable;
    }
    if start >= end {
        return RangeOutcome::Full;
    }
    RangeOutcome::Partial { start, end }
}

/// Stream `len` bytes of the blob starting at `start`.
pub(crate) async fn body_from(
    mut reader: BlobReader,
    start: u64,
    len: u64,
) -> std::io::Result<Body> {
    if start > 0 {
        reader.seek(SeekFrom::Start(start)).await?;
    }
    let limited = reader.take(len);
    let stream = ReaderStream::with_capacity(limited, STREAM_BUF_SIZE);
    Ok(Body::from_stream(stream))
}
