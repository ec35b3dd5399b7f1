//! Small MIME helpers shared by the message model and the engine

use base64::{engine::general_purpose::STANDARD, Engine};
use uuid::Uuid;

/// Preamble OpenSSL writes ahead of the parts of a clear-signed message
pub const SIGNED_MARKER: &str = "This is an S/MIME signed message";

pub const SMIME_FILENAME: &str = "smime.p7m";

pub const CRLF: &[u8] = b"\r\n";

/// Base64 lines are limited to 76 characters (RFC 2045 §6.8)
const BASE64_LINE: usize = 76;

pub fn new_boundary() -> String {
    format!("=_mailseal_{}", Uuid::new_v4().simple())
}

/// Base64 with CRLF after every line, ready to use as a part body
pub fn base64_lines(data: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(data);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / BASE64_LINE * 2 + 2);
    for line in encoded.as_bytes().chunks(BASE64_LINE) {
        out.extend_from_slice(line);
        out.extend_from_slice(CRLF);
    }
    out
}

/// Turn bare LF into CRLF, leaving existing CRLF alone
pub fn canonicalize_line_endings(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    let mut prev = 0u8;
    for &byte in data {
        if byte == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        prev = byte;
    }
    out
}

/// Text in a multipart body ahead of the first delimiter line
pub fn preamble<'a>(body: &'a [u8], boundary: &str) -> &'a [u8] {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut line_start = 0;
    while line_start < body.len() {
        if body[line_start..].starts_with(delimiter) {
            return &body[..line_start];
        }
        match body[line_start..].iter().position(|&b| b == b'\n') {
            Some(offset) => line_start += offset + 1,
            None => break,
        }
    }
    body
}

pub fn is_pkcs7_mime(mimetype: &str) -> bool {
    matches!(mimetype, "application/pkcs7-mime" | "application/x-pkcs7-mime")
}

pub fn is_pkcs7_signature(mimetype: &str) -> bool {
    matches!(
        mimetype,
        "application/pkcs7-signature" | "application/x-pkcs7-signature"
    )
}

/// `Content-*` headers describe the body and travel inside the envelope
pub fn is_content_header(name: &str) -> bool {
    name.len() > 8
        && name
            .get(..8)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("content-"))
}

pub fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
