//! Raw inbound message access.
//!
//! Signature checks need the header block byte for byte, so headers are
//! kept as they arrived (with folding) next to decoded accessors.
//! MIME decoding of the body is left to `mailparse`.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use mailparse::{MailAddr, ParsedMail};

use crate::errors::VerificationError;

/// One header field exactly as it appeared, folding included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    pub name: String,
    /// `Name: value\r\n`, continuation lines included.
    pub raw: String,
}

impl RawHeader {
    /// Everything after the first colon, without the final CRLF.
    pub fn raw_value(&self) -> &str {
        let line = self.raw.strip_suffix("\r\n").unwrap_or(&self.raw);
        line.split_once(':').map(|(_, v)| v).unwrap_or("")
    }

    /// Unfolded value with RFC 2047 encoded words decoded.
    pub fn value(&self) -> String {
        match mailparse::parse_header(self.raw.as_bytes()) {
            Ok((header, _)) => header.get_value().trim().to_string(),
            Err(_) => unfold(self.raw_value()).trim().to_string(),
        }
    }
}

/// A message with CRLF line endings and its header block split out.
#[derive(Debug, Clone)]
pub struct RawMessage {
    bytes: Vec<u8>,
    headers: Vec<RawHeader>,
    body_start: usize,
}

impl RawMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, VerificationError> {
        let bytes = normalize_line_endings(raw);
        let (header_end, body_start) = match find(&bytes, b"\r\n\r\n") {
            Some(pos) => (pos + 2, pos + 4),
            None => (bytes.len(), bytes.len()),
        };

        let block = std::str::from_utf8(&bytes[..header_end])
            .map_err(|_| VerificationError::Malformed("header block is not UTF-8".into()))?;

        let mut headers: Vec<RawHeader> = Vec::new();
        for line in block.split_inclusive("\r\n") {
            if line.starts_with(' ') || line.starts_with('\t') {
                let last = headers.last_mut().ok_or_else(|| {
                    VerificationError::Malformed("continuation line before first header".into())
                })?;
                last.raw.push_str(line);
                continue;
            }
            let (name, _) = line.split_once(':').ok_or_else(|| {
                VerificationError::Malformed(format!("header line without colon: {}", line.trim_end()))
            })?;
            headers.push(RawHeader {
                name: name.trim_end().to_string(),
                raw: line.to_string(),
            });
        }
        if headers.is_empty() {
            return Err(VerificationError::Malformed("message has no headers".into()));
        }

        Ok(Self {
            bytes,
            headers,
            body_start,
        })
    }

    pub fn headers(&self) -> &[RawHeader] {
        &self.headers
    }

    /// Raw body bytes, after the blank line.
    pub fn body(&self) -> &[u8] {
        &self.bytes[self.body_start..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// Decoded value of the first header called `name`.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(RawHeader::value)
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn header_all(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(RawHeader::value)
            .collect()
    }

    pub fn subject(&self) -> Option<String> {
        self.header("Subject")
    }

    pub fn message_id(&self) -> Option<String> {
        self.header("Message-ID")
    }

    /// MIME tree of the whole message.
    pub fn mime(&self) -> Result<ParsedMail<'_>, VerificationError> {
        mailparse::parse_mail(&self.bytes).map_err(|e| VerificationError::Malformed(e.to_string()))
    }
}

/// Plain addresses in an address-list header value. Groups are flattened.
pub fn parse_addresses(value: &str) -> Vec<String> {
    match mailparse::addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![info.addr.clone()],
                MailAddr::Group(group) => group.addrs.iter().map(|i| i.addr.clone()).collect(),
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Domain part of an address, lowercased.
pub fn domain_of(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
}

/// Parse a Date header, keeping its offset where possible.
pub fn parse_date(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date);
    }
    let ts = mailparse::dateparse(value).ok()?;
    Utc.timestamp_opt(ts, 0).single().map(|d| d.fixed_offset())
}

fn unfold(value: &str) -> String {
    value.replace("\r\n", "")
}

fn normalize_line_endings(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + raw.len() / 40);
    let mut prev = 0u8;
    for &b in raw {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
