//! Newline framing shared by the TCP and serial readers
//!
//! Bytes arrive in arbitrary chunks; only complete `\n`-terminated lines are
//! yielded and any partial tail is kept for the next read. A trailing `\r`
//! (NMEA) and surrounding whitespace are stripped, blank lines skipped.

use bytes::{Buf, BytesMut};

use crate::error::SourceError;
use crate::record::Record;

/// A line longer than this without a newline is garbage, not a record
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered after the last complete line
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Next complete record, if one is buffered.
    /// A line that is not valid UTF-8 comes back as `SourceError::Decode`; the
    /// caller drops it and keeps reading.
    pub fn next_record(&mut self) -> Option<Result<Record, SourceError>> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > MAX_LINE_LEN {
                    let dropped = self.buf.len();
                    self.buf.clear();
                    return Some(Err(SourceError::Decode(format!(
                        "discarded {} bytes without a line terminator",
                        dropped
                    ))));
                }
                return None;
            };

            let line = self.buf.split_to(pos);
            self.buf.advance(1);

            match std::str::from_utf8(&line) {
                Ok(text) => {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    return Some(Ok(Record::new(text)));
                }
                Err(e) => return Some(Err(SourceError::Decode(e.to_string()))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_line_kept_across_reads() {
        let mut lines = LineBuffer::new();
        lines.extend(b"MSG,3,1,1,A92F2D,1");
        assert!(lines.next_record().is_none());
        assert_eq!(lines.pending(), 18);

        lines.extend(b",,,\nMSG,1,1");
        let record = lines.next_record().unwrap().unwrap();
        assert_eq!(record.as_str(), "MSG,3,1,1,A92F2D,1,,,");
        assert!(lines.next_record().is_none());
        assert_eq!(lines.pending(), 7);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut lines = LineBuffer::new();
        lines.extend(b"!AIVDM,1,1,,B,15M67FC000G?ufbE`FepT@3n00Sa,0*5C\r\n\r\n\n!AIVDO,1\r\n");
        assert_eq!(
            lines.next_record().unwrap().unwrap().as_str(),
            "!AIVDM,1,1,,B,15M67FC000G?ufbE`FepT@3n00Sa,0*5C"
        );
        assert_eq!(lines.next_record().unwrap().unwrap().as_str(), "!AIVDO,1");
        assert!(lines.next_record().is_none());
    }

    #[test]
    fn test_invalid_utf8_is_decode_error_then_continues() {
        let mut lines = LineBuffer::new();
        lines.extend(b"\xff\xfe\n!AIVDM,ok\n");
        assert!(matches!(
            lines.next_record(),
            Some(Err(SourceError::Decode(_)))
        ));
        assert_eq!(lines.next_record().unwrap().unwrap().as_str(), "!AIVDM,ok");
    }

    #[test]
    fn test_oversized_line_discarded() {
        let mut lines = LineBuffer::new();
        lines.extend(&vec![b'x'; MAX_LINE_LEN + 1]);
        assert!(matches!(
            lines.next_record(),
            Some(Err(SourceError::Decode(_)))
        ));
        assert_eq!(lines.pending(), 0);
    }
}
