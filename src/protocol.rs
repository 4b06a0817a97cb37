//! Wire framing for the COPY sub-protocol.
//!
//! Every frame is a one-byte tag followed by a 4-byte big-endian length and
//! the payload. The length covers itself but not the tag, matching the
//! Postgres frontend/backend message layout.

use anyhow::{anyhow, Result};

// Frontend frame tags for an in-flight copy
pub const COPY_DATA: u8 = b'd';
pub const COPY_DONE: u8 = b'c';

// Marker preceding the affected-row count in the backend's completion tag
const COMMAND_TAG_MARKER: &str = "COPY ";

/// Build one data frame carrying `payload` verbatim.
///
/// The length field is 32 bits, so a payload that cannot fit is a local
/// error; the caller reports it through the normal error path.
pub fn data_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len() + 4)
        .map_err(|_| anyhow!("copy payload too large for one frame: {} bytes", payload.len()))?;
    let mut frame = Vec::with_capacity(1 + 4 + payload.len());
    frame.push(COPY_DATA);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Zero-payload frame signaling end of copy data.
pub fn done_frame() -> [u8; 5] {
    [COPY_DONE, 0, 0, 0, 4]
}

/// Extract the affected-row count from a completion tag like `COPY 1234`.
///
/// The count is advisory telemetry: a tag without the marker, or with a
/// malformed count behind it, yields `None` rather than an error.
pub fn command_rows(tag: &str) -> Option<u64> {
    let idx = tag.find(COMMAND_TAG_MARKER)?;
    let digits = tag[idx + COMMAND_TAG_MARKER.len()..]
        .split_whitespace()
        .next()?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_layout() {
        let frame = data_frame(b"a\tb\n").unwrap();
        assert_eq!(frame[0], COPY_DATA);
        assert_eq!(&frame[1..5], &8u32.to_be_bytes());
        assert_eq!(&frame[5..], b"a\tb\n");
    }

    #[test]
    fn data_frame_empty_payload() {
        let frame = data_frame(b"").unwrap();
        assert_eq!(frame, vec![COPY_DATA, 0, 0, 0, 4]);
    }

    #[test]
    fn done_frame_layout() {
        assert_eq!(done_frame(), [COPY_DONE, 0, 0, 0, 4]);
    }

    #[test]
    fn command_rows_parses_count() {
        assert_eq!(command_rows("COPY 42"), Some(42));
        assert_eq!(command_rows("COPY 0"), Some(0));
    }

    #[test]
    fn command_rows_missing_marker() {
        assert_eq!(command_rows("SELECT 1"), None);
        assert_eq!(command_rows(""), None);
    }

    #[test]
    fn command_rows_malformed_count() {
        assert_eq!(command_rows("COPY "), None);
        assert_eq!(command_rows("COPY many"), None);
    }
}
