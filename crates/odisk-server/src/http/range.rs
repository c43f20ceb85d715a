//! `Range` header decoding for the read protocol.
//!
//! Clients send exactly one `bytes=<start>-<end>` range. Unlike RFC 9110 ranges there are no
//! suffix ranges and no multi-range requests: the first `<start>-<end>` pair found in the header
//! value is used, and an empty `<end>` means "to the end of the medium" (the
//! [`READ_TO_END`] sentinel). Everything else is a decode error.

use lazy_regex::regex_captures;
use odisk_media::READ_TO_END;

/// Header values echoed into errors and logs are cut to this many bytes.
const MAX_ECHOED_HEADER_LEN: usize = 64;

/// A requested range as sent by the client. `end == READ_TO_END` when open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeParseError {
    #[error("missing Range header")]
    Missing,
    #[error("malformed Range header {0:?}")]
    Malformed(String),
}

pub fn parse_range_header(value: Option<&str>) -> Result<RangeRequest, RangeParseError> {
    let value = value.ok_or(RangeParseError::Missing)?;
    let malformed = || RangeParseError::Malformed(truncate_for_error(value, MAX_ECHOED_HEADER_LEN));

    let (_, start, end) = regex_captures!(r"bytes=(\d*)-(\d*)", value).ok_or_else(malformed)?;
    let start = start.parse::<u64>().map_err(|_| malformed())?;
    let end = if end.is_empty() {
        READ_TO_END
    } else {
        end.parse::<u64>().map_err(|_| malformed())?
    };

    Ok(RangeRequest { start, end })
}

fn truncate_for_error(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }

    const ELLIPSIS: &str = "...";
    // Truncate at a valid UTF-8 boundary.
    let mut end = max_len - ELLIPSIS.len();
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }

    let mut out = value[..end].to_string();
    out.push_str(ELLIPSIS);
    out
}
