use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// One line read from the upstream source, without its delimiter.
/// Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    text: String,
}

impl Record {
    #[inline]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Bytes written downstream: the record followed by `terminator`
    pub fn to_wire(&self, terminator: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.text.len() + terminator.len());
        buf.put_slice(self.text.as_bytes());
        buf.put_slice(terminator);
        buf.freeze()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
