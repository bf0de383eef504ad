//! yEnc decoding
//!
//! yEnc frames binary data between an `=ybegin` header (optionally followed by
//! `=ypart` for multi-part posts) and an `=yend` trailer. Data bytes are the
//! raw byte minus 42, except escaped bytes (`=` followed by the byte minus
//! 106) used for NUL/TAB/LF/CR/ESC/space/dot/`=` itself. The trailer declares
//! the part size and a CRC32 (`pcrc32` for a part, `crc32` for the whole
//! file) that we verify but treat as advisory.

use crate::error::DecodeError;
use std::collections::HashMap;

/// Parsed `=ybegin` header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YencHeader {
    /// Declared filename (the real name of the file being reassembled)
    pub name: Option<String>,
    /// Declared total file size
    pub size: Option<u64>,
    /// Part number for multi-part posts
    pub part: Option<u64>,
    /// Declared line length (informational)
    pub line: Option<u64>,
}

/// Parsed `=ypart` header (multi-part posts only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YencPart {
    /// 1-based inclusive begin offset within the whole file
    pub begin: u64,
    /// Inclusive end offset within the whole file
    pub end: u64,
}

/// Parsed `=yend` trailer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YencTrailer {
    /// Declared decoded size of this part
    pub size: Option<u64>,
    /// Whole-file CRC32
    pub crc32: Option<u32>,
    /// Part CRC32 (multi-part posts)
    pub pcrc32: Option<u32>,
}

/// Result of decoding one yEnc article body
#[derive(Debug, Clone)]
pub struct YencDecoded {
    /// Decoded bytes
    pub data: Vec<u8>,
    /// The `=ybegin` header
    pub header: YencHeader,
    /// The `=ypart` header, if present
    pub part: Option<YencPart>,
    /// The `=yend` trailer; None when the body was truncated before it
    pub trailer: Option<YencTrailer>,
    /// CRC32 computed over the decoded bytes
    pub computed_crc: u32,
}

impl YencDecoded {
    /// Whether the computed CRC matches the trailer's declaration.
    ///
    /// None when the trailer is absent or carries no checksum. For multi-part
    /// posts `pcrc32` is authoritative; `crc32` covers the whole file and only
    /// applies to single-part posts.
    pub fn crc_matches(&self) -> Option<bool> {
        let trailer = self.trailer.as_ref()?;
        let expected = match (self.part.is_some(), trailer.pcrc32, trailer.crc32) {
            (true, Some(p), _) => p,
            (true, None, _) => return None,
            (false, Some(p), _) => p,
            (false, None, Some(c)) => c,
            (false, None, None) => return None,
        };
        Some(expected == self.computed_crc)
    }

    /// Whether the decoded length matches the trailer's declared size
    pub fn size_matches(&self) -> Option<bool> {
        let declared = self.trailer.as_ref()?.size?;
        Some(declared == self.data.len() as u64)
    }
}

/// Decode one yEnc article body.
///
/// `body` is the raw multiline BODY payload with NNTP framing already removed
/// (dot-unstuffed, no trailing terminator). Fails only when no `=ybegin`
/// header is present or the header itself is unparseable; a body truncated
/// before `=yend` still decodes, with `trailer: None`.
pub fn decode(body: &[u8]) -> Result<YencDecoded, DecodeError> {
    let mut lines = body.split(|&b| b == b'\n').map(strip_cr);

    let header = loop {
        let line = lines.next().ok_or(DecodeError::UnknownEncoding)?;
        if line.starts_with(b"=ybegin") {
            break parse_ybegin(line)?;
        }
    };

    let mut part = None;
    let mut trailer = None;
    let mut data = Vec::new();
    let mut hasher = crc32fast::Hasher::new();
    let mut first_data_line = true;

    for line in lines {
        if first_data_line && line.starts_with(b"=ypart") {
            part = Some(parse_ypart(line)?);
            first_data_line = false;
            continue;
        }
        first_data_line = false;

        if line.starts_with(b"=yend") {
            trailer = Some(parse_yend(line)?);
            break;
        }

        let start = data.len();
        decode_line(line, &mut data);
        hasher.update(&data[start..]);
    }

    Ok(YencDecoded {
        data,
        header,
        part,
        trailer,
        computed_crc: hasher.finalize(),
    })
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Decode one yEnc data line into `out`
fn decode_line(line: &[u8], out: &mut Vec<u8>) {
    let mut escaped = false;
    for &byte in line {
        if escaped {
            out.push(byte.wrapping_sub(106));
            escaped = false;
        } else if byte == b'=' {
            escaped = true;
        } else {
            out.push(byte.wrapping_sub(42));
        }
    }
}

fn parse_ybegin(line: &[u8]) -> Result<YencHeader, DecodeError> {
    let (kv, name) = parse_key_values(line);
    Ok(YencHeader {
        name,
        size: kv.get("size").and_then(|v| v.parse().ok()),
        part: kv.get("part").and_then(|v| v.parse().ok()),
        line: kv.get("line").and_then(|v| v.parse().ok()),
    })
}

fn parse_ypart(line: &[u8]) -> Result<YencPart, DecodeError> {
    let (kv, _) = parse_key_values(line);
    let begin = kv
        .get("begin")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| malformed(line))?;
    let end = kv
        .get("end")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| malformed(line))?;
    Ok(YencPart { begin, end })
}

fn parse_yend(line: &[u8]) -> Result<YencTrailer, DecodeError> {
    let (kv, _) = parse_key_values(line);
    Ok(YencTrailer {
        size: kv.get("size").and_then(|v| v.parse().ok()),
        crc32: kv.get("crc32").and_then(|v| parse_hex_u32(v)),
        pcrc32: kv.get("pcrc32").and_then(|v| parse_hex_u32(v)),
    })
}

fn malformed(line: &[u8]) -> DecodeError {
    DecodeError::MalformedHeader {
        line: String::from_utf8_lossy(line).into_owned(),
    }
}

/// Split a `=y...` header line into key=value pairs.
///
/// `name=` must be handled separately because the value runs to the end of
/// the line and may contain spaces and `=` characters.
fn parse_key_values(line: &[u8]) -> (HashMap<String, String>, Option<String>) {
    let text = String::from_utf8_lossy(line);

    let (rest, name) = match text.find(" name=") {
        Some(idx) => {
            let name = text[idx + 6..].trim();
            let name = (!name.is_empty()).then(|| name.to_string());
            (&text[..idx], name)
        }
        None => (text.as_ref(), None),
    };

    let mut kv = HashMap::new();
    for token in rest.split_whitespace().skip(1) {
        if let Some((key, value)) = token.split_once('=') {
            kv.insert(key.to_string(), value.to_string());
        }
    }
    (kv, name)
}

fn parse_hex_u32(value: &str) -> Option<u32> {
    // Some posters emit 64-bit checksums; the low 32 bits are the CRC
    let trimmed = value.trim();
    let tail = if trimmed.len() > 8 {
        &trimmed[trimmed.len() - 8..]
    } else {
        trimmed
    };
    u32::from_str_radix(tail, 16).ok()
}

/// yEnc-encode a blob, for tests and fixtures.
///
/// Escapes NUL, TAB, LF, CR, `=`, and a leading dot (NNTP dot-stuffing
/// hazard), wrapping lines at `line_len` output characters.
#[doc(hidden)]
pub fn encode_for_test(name: &str, data: &[u8], line_len: usize) -> Vec<u8> {
    let crc = crc32fast::hash(data);
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 128);
    out.extend_from_slice(
        format!("=ybegin line={line_len} size={} name={name}\r\n", data.len()).as_bytes(),
    );

    let mut col = 0usize;
    for (i, &byte) in data.iter().enumerate() {
        let enc = byte.wrapping_add(42);
        let needs_escape = matches!(enc, 0x00 | 0x09 | 0x0a | 0x0d | b'=')
            || (col == 0 && enc == b'.');
        if needs_escape {
            out.push(b'=');
            out.push(enc.wrapping_add(64));
            col += 2;
        } else {
            out.push(enc);
            col += 1;
        }
        if col >= line_len && i + 1 < data.len() {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("=yend size={} crc32={crc:08x}\r\n", data.len()).as_bytes());
    out
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes_with_matching_crc() {
        let blob: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let encoded = encode_for_test("blob.bin", &blob, 128);

        let decoded = decode(&encoded).unwrap();

        assert_eq!(decoded.data, blob, "decode must invert encode exactly");
        assert_eq!(decoded.header.name.as_deref(), Some("blob.bin"));
        assert_eq!(decoded.header.size, Some(3000));
        assert_eq!(
            decoded.crc_matches(),
            Some(true),
            "computed CRC must match the encoded trailer"
        );
        assert_eq!(decoded.size_matches(), Some(true));
    }

    #[test]
    fn round_trips_bytes_that_require_escaping() {
        // Bytes that encode to NUL, TAB, LF, CR, '=' all need escape sequences
        let blob = vec![214u8, 223, 224, 227, 19, 0, 255, 61, b'.'];
        let encoded = encode_for_test("esc.bin", &blob, 8);

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.data, blob);
        assert_eq!(decoded.crc_matches(), Some(true));
    }

    #[test]
    fn detects_crc_mismatch_without_failing() {
        let blob = b"hello yenc world".to_vec();
        let mut encoded = encode_for_test("x.bin", &blob, 128);
        // Corrupt the trailer checksum (byte-level: the encoded payload is
        // not valid UTF-8)
        let pos = encoded
            .windows(b"crc32=".len())
            .position(|w| w == b"crc32=")
            .unwrap();
        encoded.splice(pos + b"crc32=".len()..pos + b"crc32=".len(), *b"0000");

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.data, blob, "payload still decodes on CRC mismatch");
        assert_eq!(decoded.crc_matches(), Some(false));
    }

    #[test]
    fn multipart_prefers_pcrc32() {
        let body = b"=ybegin part=2 line=128 size=1000 name=multi.bin\r\n\
=ypart begin=501 end=505\r\n\
KLMNO\r\n\
=yend size=5 part=2 pcrc32=ffffffff\r\n";
        let decoded = decode(body).unwrap();
        assert_eq!(decoded.part, Some(YencPart { begin: 501, end: 505 }));
        assert_eq!(
            decoded.crc_matches(),
            Some(false),
            "bogus pcrc32 must be compared, not the absent whole-file crc32"
        );
        assert_eq!(decoded.data.len(), 5);
    }

    #[test]
    fn truncated_body_decodes_with_no_trailer() {
        let body = b"=ybegin line=128 size=100 name=cut.bin\r\nJJJJJ";
        let decoded = decode(body).unwrap();
        assert_eq!(decoded.trailer, None);
        assert_eq!(decoded.crc_matches(), None, "no trailer, no CRC verdict");
        assert_eq!(decoded.data.len(), 5);
    }

    #[test]
    fn header_name_may_contain_spaces_and_equals() {
        let body = b"=ybegin line=128 size=3 name=my file = v2.rar\r\nJJJ\r\n=yend size=3\r\n";
        let decoded = decode(body).unwrap();
        assert_eq!(decoded.header.name.as_deref(), Some("my file = v2.rar"));
    }

    #[test]
    fn body_without_ybegin_is_unknown_encoding() {
        let err = decode(b"just some text\r\nno headers\r\n").unwrap_err();
        assert_eq!(err, DecodeError::UnknownEncoding);
    }

    #[test]
    fn ypart_without_offsets_is_malformed() {
        let body = b"=ybegin part=1 line=128 size=10 name=x\r\n=ypart begin=1\r\nJJ\r\n";
        let err = decode(body).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedHeader { .. }));
    }

    #[test]
    fn parse_hex_accepts_overlong_checksums() {
        assert_eq!(parse_hex_u32("deadbeef"), Some(0xdead_beef));
        assert_eq!(
            parse_hex_u32("1234deadbeef"),
            Some(0xdead_beef),
            "64-bit checksum keeps its low 32 bits"
        );
        assert_eq!(parse_hex_u32("zzzz"), None);
    }

    #[test]
    fn junk_before_ybegin_is_skipped() {
        let blob = b"payload".to_vec();
        let mut body = b"From: poster\r\n\r\n".to_vec();
        body.extend_from_slice(&encode_for_test("j.bin", &blob, 128));
        let decoded = decode(&body).unwrap();
        assert_eq!(decoded.data, blob);
    }
}
