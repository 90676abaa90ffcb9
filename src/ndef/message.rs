//! NDEF message buffer

use log::{debug, warn};

use super::record::{flags, NdefRecord, RecordHeader, DEFAULT_LANGUAGE};
use super::{NdefError, Result};

/// Default ceiling for an encoded message, sized to fit a small tag
pub const DEFAULT_SIZE_LIMIT: usize = 249;

/// An encoded NDEF message that grows one record at a time
///
/// The buffer always holds complete records with MB set on the first and
/// ME on the last. Records that would push the message to the size limit
/// are refused and the buffer is left as it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdefMessage {
    content: Vec<u8>,
    record_count: usize,
    size_limit: usize,
    cursor: usize,
}

impl Default for NdefMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl NdefMessage {
    pub fn new() -> Self {
        Self::with_size_limit(DEFAULT_SIZE_LIMIT)
    }

    pub fn with_size_limit(size_limit: usize) -> Self {
        Self {
            content: Vec::new(),
            record_count: 0,
            size_limit,
            cursor: 0,
        }
    }

    /// Parse an encoded message; the ceiling is raised to fit it when the
    /// input is larger than the default
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut message = Self::with_size_limit(DEFAULT_SIZE_LIMIT.max(bytes.len() + 1));
        message.set_content(bytes)?;
        Ok(message)
    }

    /// Replace the message with `bytes` and fix up the header flags
    ///
    /// Malformed or oversized input leaves the current message untouched.
    pub fn set_content(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() >= self.size_limit {
            warn!(
                "Refusing NDEF message of {} bytes (limit {})",
                bytes.len(),
                self.size_limit
            );
            return Err(NdefError::SizeLimit {
                size: bytes.len(),
                limit: self.size_limit,
            });
        }
        let count = count_records(bytes)?;
        self.content = bytes.to_vec();
        self.record_count = count;
        self.cursor = 0;
        self.update_header_flags();
        Ok(())
    }

    /// Append a record
    pub fn add_record(&mut self, record: &NdefRecord) -> Result<()> {
        if record.payload.is_empty() {
            warn!("Refusing NDEF record with empty payload");
            return Err(NdefError::EmptyPayload);
        }
        let encoded = record.encode_with(self.record_count == 0, true)?;
        let size = self.content.len() + encoded.len();
        if size >= self.size_limit {
            warn!(
                "Refusing NDEF record: message would grow to {} bytes (limit {})",
                size, self.size_limit
            );
            return Err(NdefError::SizeLimit {
                size,
                limit: self.size_limit,
            });
        }

        self.content.extend_from_slice(&encoded);
        self.record_count += 1;
        self.update_header_flags();
        debug!(
            "Added NDEF record {} ({} bytes, message {} bytes)",
            self.record_count,
            encoded.len(),
            self.content.len()
        );
        Ok(())
    }

    pub fn add_text_record(&mut self, text: &str) -> Result<()> {
        self.add_text_record_with_language(text, DEFAULT_LANGUAGE)
    }

    pub fn add_text_record_with_language(&mut self, text: &str, language: &str) -> Result<()> {
        self.add_record(&NdefRecord::text(text, language))
    }

    pub fn add_uri_record(&mut self, uri: &str) -> Result<()> {
        self.add_record(&NdefRecord::uri(uri))
    }

    pub fn add_mime_media_record(&mut self, mime_type: &str, payload: &[u8]) -> Result<()> {
        self.add_record(&NdefRecord::mime(mime_type, payload))
    }

    /// Encoded message bytes
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Iterate over the records from the start
    pub fn records(&self) -> Records<'_> {
        Records {
            data: &self.content,
            pos: 0,
            failed: false,
        }
    }

    /// Read the record under the cursor and advance past it
    ///
    /// Returns `None` once every record has been read.
    pub fn next_record(&mut self) -> Option<Result<NdefRecord>> {
        let rest = self.content.get(self.cursor..).filter(|rest| !rest.is_empty())?;
        match NdefRecord::decode(rest) {
            Ok((record, len)) => {
                self.cursor += len;
                Some(Ok(record))
            }
            Err(e) => {
                self.cursor = self.content.len();
                Some(Err(e))
            }
        }
    }

    /// Move the read cursor back to the first record
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Whether the cursor has passed the last record
    pub fn at_end(&self) -> bool {
        self.cursor >= self.content.len()
    }

    /// Set MB on the first record and ME on the last, clear both elsewhere
    fn update_header_flags(&mut self) {
        let mut pos = 0;
        let mut index = 0;
        while pos < self.content.len() {
            let Ok(header) = RecordHeader::parse(&self.content[pos..]) else {
                break;
            };
            let mut bits = self.content[pos] & !(flags::MB | flags::ME);
            if index == 0 {
                bits |= flags::MB;
            }
            if index + 1 == self.record_count {
                bits |= flags::ME;
            }
            self.content[pos] = bits;
            pos += header.record_len();
            index += 1;
        }
    }
}

impl<'a> IntoIterator for &'a NdefMessage {
    type Item = Result<NdefRecord>;
    type IntoIter = Records<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.records()
    }
}

/// Iterator over the records of an encoded message
///
/// Yields an error once and stops if a record is malformed.
pub struct Records<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<NdefRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        match NdefRecord::decode(&self.data[self.pos..]) {
            Ok((record, len)) => {
                self.pos += len;
                Some(Ok(record))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Count records, checking each one fits in `bytes`
fn count_records(bytes: &[u8]) -> Result<usize> {
    let mut pos = 0;
    let mut count = 0;
    while pos < bytes.len() {
        let header = RecordHeader::parse(&bytes[pos..])?;
        let end = pos + header.record_len();
        if end > bytes.len() {
            return Err(NdefError::Truncated("record"));
        }
        pos = end;
        count += 1;
    }
    Ok(count)
}
