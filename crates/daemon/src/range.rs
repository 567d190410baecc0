//! HTTP Range header parsing.
//!
//! Only single byte ranges are honored. Multi-range requests are answered
//! with the whole file, which RFC 9110 permits.

/// Outcome of interpreting a Range header against a file size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// No usable Range header: send the whole file with 200
    Full,
    /// Inclusive byte range to send with 206
    Partial { start: u64, end: u64 },
    /// Syntactically valid but outside the file: 416
    Unsatisfiable,
}

impl ByteRange {
    /// Number of bytes the response body carries
    pub fn len(&self, file_size: u64) -> u64 {
        match self {
            ByteRange::Full => file_size,
            ByteRange::Partial { start, end } => end - start + 1,
            ByteRange::Unsatisfiable => 0,
        }
    }
}

/// Interpret a Range header value.
///
/// Supports formats:
/// - bytes=0-499
/// - bytes=500-
/// - bytes=-500 (last 500 bytes)
///
/// Malformed headers and other units are ignored (treated as absent).
pub fn parse_range_header(header: Option<&str>, file_size: u64) -> ByteRange {
    let Some(header) = header else {
        return ByteRange::Full;
    };
    let Some(ranges) = header.trim().strip_prefix("bytes=") else {
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
        // bytes=-500
        (true, false) => {
            let Ok(suffix_len) = end.parse::<u64>() else {
                return ByteRange::Full;
            };
            if suffix_len == 0 || file_size == 0 {
                return ByteRange::Unsatisfiable;
            }
            ByteRange::Partial {
                start: file_size.saturating_sub(suffix_len),
                end: file_size - 1,
            }
        }
        // bytes=500-
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
        // bytes=0-499
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
        // bytes=-
        (true, true) => ByteRange::Full,
    }
}

/// `Content-Range` value for a partial response
pub fn content_range(start: u64, end: u64, file_size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, file_size)
}

/// `Content-Range` value for a 416 response
pub fn unsatisfied_content_range(file_size: u64) -> String {
    format!("bytes */{}", file_size)
}
