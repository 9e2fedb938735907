use thiserror::Error;

/// Inclusive byte span of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("range unit must be bytes")]
    UnsupportedUnit,
    #[error("multiple ranges are not supported")]
    MultipleRanges,
    #[error("suffix ranges are not supported")]
    SuffixRange,
    #[error("malformed range")]
    Malformed,
    #[error("range {start}-{end} is outside of {size} bytes")]
    Unsatisfiable { start: u64, end: u64, size: u64 },
}

/// Parses a single `bytes=<start>-[<end>]` range against a file of `size`
/// bytes. A missing end means the last byte.
pub fn parse_range(header: &str, size: u64) -> Result<ByteRange, RangeError> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::UnsupportedUnit)?;
    if spec.contains(',') {
        return Err(RangeError::MultipleRanges);
    }
    let (start, end) = spec.split_once('-').ok_or(RangeError::Malformed)?;
    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() {
        return Err(RangeError::SuffixRange);
    }
    let start = parse_position(start)?;
    let end = if end.is_empty() {
        size.checked_sub(1).ok_or(RangeError::Unsatisfiable {
            start,
            end: 0,
            size,
        })?
    } else {
        parse_position(end)?
    };
    if start > end || end >= size {
        return Err(RangeError::Unsatisfiable { start, end, size });
    }
    Ok(ByteRange { start, end })
}

fn parse_position(raw: &str) -> Result<u64, RangeError> {
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Malformed);
    }
    raw.parse().map_err(|_| RangeError::Malformed)
}
