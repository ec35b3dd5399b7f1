//! Mail message model
//!
//! A `MailMessage` is an ordered header list plus the body exactly as it goes
//! on the wire. For multipart messages the body still holds the full encoded
//! multipart text (boundaries included); `parts` is a parsed view of it.
//! Rendering never re-serializes parts, so bytes covered by a signature survive
//! a parse/render cycle untouched.

use mailparse::{ParsedContentType, ParsedMail};

use crate::mime::{self, CRLF};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailMessage {
    headers: Vec<Header>,
    body: Vec<u8>,
    parts: Vec<MailMessage>,
}

impl MailMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header (duplicates are allowed)
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.parts.clear();
        self
    }

    /// Build a `multipart/<subtype>` entity from already complete parts
    pub fn multipart(subtype: &str, parts: Vec<MailMessage>) -> Self {
        let boundary = mime::new_boundary();

        let mut body = Vec::new();
        for part in &parts {
            body.extend_from_slice(format!("--{boundary}").as_bytes());
            body.extend_from_slice(CRLF);
            body.extend_from_slice(&part.to_bytes());
            body.extend_from_slice(CRLF);
        }
        body.extend_from_slice(format!("--{boundary}--").as_bytes());
        body.extend_from_slice(CRLF);

        Self {
            headers: vec![Header::new(
                "Content-Type",
                format!("multipart/{subtype}; boundary=\"{boundary}\""),
            )],
            body,
            parts,
        }
    }

    /// Parse an RFC 5322 message (or a bare MIME entity)
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let parsed = mailparse::parse_mail(raw)?;
        Self::from_parsed(&parsed)
    }

    pub(crate) fn from_parsed(parsed: &ParsedMail<'_>) -> Result<Self> {
        let headers = parsed
            .headers
            .iter()
            .map(|h| Header {
                name: h.get_key(),
                value: String::from_utf8_lossy(h.get_value_raw()).into_owned(),
            })
            .collect();
        let parts = parsed
            .subparts
            .iter()
            .map(Self::from_parsed)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            headers,
            body: raw_body(parsed)?.to_vec(),
            parts,
        })
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.is(name))
            .map(|h| h.value.as_str())
    }

    /// Replace the first occurrence in place and drop any duplicates, or
    /// append when the header is absent
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter().position(|h| h.is(name)) {
            Some(index) => {
                self.headers[index].value = value;
                let mut seen = 0;
                self.headers.retain(|h| {
                    if h.is(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.headers.push(Header::new(name, value)),
        }
    }

    pub fn append_header(&mut self, header: Header) {
        self.headers.push(header);
    }

    /// Remove every occurrence; returns how many were removed
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|h| !h.is(name));
        before - self.headers.len()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn parts(&self) -> &[MailMessage] {
        &self.parts
    }

    pub fn content_type(&self) -> ParsedContentType {
        mailparse::parse_content_type(self.header("Content-Type").unwrap_or("text/plain"))
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type().mimetype.starts_with("multipart/")
    }

    /// The body as a standalone MIME entity: its `Content-*` headers followed
    /// by the body with canonical CRLF line endings. This is the exact byte
    /// string that gets signed and/or encrypted.
    pub fn entity(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 128);
        let mut has_content_type = false;
        for header in self.headers.iter().filter(|h| mime::is_content_header(&h.name)) {
            has_content_type |= header.is("Content-Type");
            write_header(&mut out, header);
        }
        if !has_content_type {
            write_header(&mut out, &Header::new("Content-Type", "text/plain; charset=utf-8"));
        }
        out.extend_from_slice(CRLF);
        out.extend_from_slice(&mime::canonicalize_line_endings(&self.body));
        out
    }

    /// Headers, blank line, body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 64 * self.headers.len() + 2);
        for header in &self.headers {
            write_header(&mut out, header);
        }
        out.extend_from_slice(CRLF);
        out.extend_from_slice(&self.body);
        out
    }

    /// Swap the body description for a new one. Content-Type and
    /// Content-Transfer-Encoding are dropped, headers the new content also
    /// carries are replaced in place, everything else stays where it was.
    pub(crate) fn replace_content(&mut self, content: &MailMessage) {
        self.headers
            .retain(|h| !h.is("Content-Type") && !h.is("Content-Transfer-Encoding"));
        self.set_header("MIME-Version", "1.0");
        for header in content.headers.iter().filter(|h| !h.is("MIME-Version")) {
            self.set_header(&header.name, header.value.clone());
        }
        self.body = content.body.clone();
        self.parts = content.parts.clone();
    }
}

fn write_header(out: &mut Vec<u8>, header: &Header) {
    out.extend_from_slice(header.name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(header.value.as_bytes());
    out.extend_from_slice(CRLF);
}

/// Body bytes of a parsed entity, still transfer-encoded
pub(crate) fn raw_body<'a>(parsed: &ParsedMail<'a>) -> Result<&'a [u8]> {
    let (_, offset) = mailparse::parse_headers(parsed.raw_bytes)?;
    Ok(&parsed.raw_bytes[offset.min(parsed.raw_bytes.len())..])
}

/// Decoded body of a single-part entity, or the raw body of a multipart one
pub(crate) fn decoded_body(parsed: &ParsedMail<'_>) -> Result<Vec<u8>> {
    if parsed.subparts.is_empty() {
        Ok(parsed.get_body_raw()?)
    } else {
        Ok(raw_body(parsed)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> MailMessage {
        MailMessage::new()
            .with_header("From", "a@x")
            .with_header("To", "b@x")
            .with_header("Subject", "hi")
            .with_body("hello")
    }

    #[test]
    fn test_render_single_part() {
        assert_eq!(
            draft().to_bytes(),
            b"From: a@x\r\nTo: b@x\r\nSubject: hi\r\n\r\nhello"
        );
        assert!(!draft().is_multipart());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let msg = draft();
        assert_eq!(msg.header("subject"), Some("hi"));
        assert_eq!(msg.header("SUBJECT"), Some("hi"));
        assert_eq!(msg.header("Cc"), None);
    }

    #[test]
    fn test_set_header_keeps_position() {
        let mut msg = draft().with_header("X-Tag", "1").with_header("x-tag", "2");
        msg.set_header("To", "c@x");
        msg.set_header("X-TAG", "3");
        msg.set_header("Reply-To", "d@x");

        let names: Vec<&str> = msg.headers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["From", "To", "Subject", "X-Tag", "Reply-To"]);
        assert_eq!(msg.header("to"), Some("c@x"));
        assert_eq!(msg.header("x-tag"), Some("3"));
    }

    #[test]
    fn test_entity_covers_content_headers_only() {
        let msg = draft()
            .with_header("Content-Type", "text/plain; charset=us-ascii")
            .with_header("Content-Transfer-Encoding", "7bit")
            .with_body("line one\nline two\n");
        assert_eq!(
            msg.entity(),
            b"Content-Type: text/plain; charset=us-ascii\r\n\
              Content-Transfer-Encoding: 7bit\r\n\r\n\
              line one\r\nline two\r\n"
                .to_vec()
        );
    }

    #[test]
    fn test_entity_defaults_content_type() {
        assert_eq!(
            draft().entity(),
            b"Content-Type: text/plain; charset=utf-8\r\n\r\nhello".to_vec()
        );
    }

    #[test]
    fn test_parse_preserves_order_and_body() {
        let raw = b"Subject: hi\r\nFrom: a@x\r\nReceived: one\r\nReceived: two\r\n\r\nhello\r\n";
        let msg = MailMessage::parse(raw).unwrap();
        let names: Vec<&str> = msg.headers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["Subject", "From", "Received", "Received"]);
        assert_eq!(msg.body(), b"hello\r\n");
        assert_eq!(msg.to_bytes(), raw.to_vec());
    }

    #[test]
    fn test_multipart_build_and_parse() {
        let text = MailMessage::new()
            .with_header("Content-Type", "text/plain")
            .with_body("first");
        let html = MailMessage::new()
            .with_header("Content-Type", "text/html")
            .with_body("<p>second</p>");
        let multi = MailMessage::multipart("alternative", vec![text, html]);
        assert!(multi.is_multipart());
        assert_eq!(multi.parts().len(), 2);

        let parsed = MailMessage::parse(&multi.to_bytes()).unwrap();
        assert!(parsed.is_multipart());
        assert_eq!(parsed.parts().len(), 2);
        assert_eq!(parsed.parts()[1].header("content-type"), Some("text/html"));
        assert_eq!(parsed.body(), multi.body());
    }

    #[test]
    fn test_replace_content_keeps_descriptive_content_headers() {
        let mut msg = draft()
            .with_header("Content-ID", "<1@x>")
            .with_header("Content-Type", "text/plain")
            .with_header("Content-Disposition", "inline")
            .with_header("Content-Language", "en");
        let content = MailMessage::new()
            .with_header("Content-Type", "application/pkcs7-mime")
            .with_header("Content-Transfer-Encoding", "base64")
            .with_header("Content-Disposition", "attachment; filename=\"smime.p7m\"")
            .with_body("AAAA");
        msg.replace_content(&content);

        let names: Vec<&str> = msg.headers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "From",
                "To",
                "Subject",
                "Content-ID",
                "Content-Disposition",
                "Content-Language",
                "MIME-Version",
                "Content-Type",
                "Content-Transfer-Encoding"
            ]
        );
        assert_eq!(
            msg.header("content-disposition"),
            Some("attachment; filename=\"smime.p7m\"")
        );
        assert_eq!(msg.header("Content-Language"), Some("en"));
    }

    #[test]
    fn test_replace_content_keeps_other_headers() {
        let mut msg = draft()
            .with_header("Content-Type", "text/plain")
            .with_header("X-Mailer", "test");
        let content = MailMessage::new()
            .with_header("MIME-Version", "1.0")
            .with_header("Content-Type", "application/pkcs7-mime")
            .with_body("AAAA");
        msg.replace_content(&content);

        let names: Vec<&str> = msg.headers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(
            names,
            ["From", "To", "Subject", "X-Mailer", "MIME-Version", "Content-Type"]
        );
        assert_eq!(msg.body(), b"AAAA");
    }
}
