//! UUencode decoding
//!
//! UUencoded bodies open with `begin <mode> <name>`, carry lines whose first
//! character declares the decoded byte count (offset from space), followed by
//! 4-character groups each encoding 3 bytes, and close with a backtick/empty
//! line and `end`. Real posts are frequently sloppy about trailing characters,
//! so short lines are padded rather than rejected.

use crate::error::DecodeError;

/// Result of decoding one UUencoded article body
#[derive(Debug, Clone)]
pub struct UuDecoded {
    /// Decoded bytes
    pub data: Vec<u8>,
    /// Filename from the `begin` line
    pub name: Option<String>,
}

/// Decode one UUencoded article body.
///
/// Fails only when no `begin` line is present; malformed data lines decode
/// best-effort (missing characters treated as zero bits).
pub fn decode(body: &[u8]) -> Result<UuDecoded, DecodeError> {
    let mut lines = body.split(|&b| b == b'\n').map(strip_cr);

    let name = loop {
        let line = lines.next().ok_or(DecodeError::UnknownEncoding)?;
        if let Some(name) = parse_begin(line) {
            break name;
        }
    };

    let mut data = Vec::new();
    for line in lines {
        if line.is_empty() || line == b"`" {
            continue;
        }
        if line == b"end" {
            break;
        }
        decode_line(line, &mut data);
    }

    Ok(UuDecoded { data, name })
}

/// Whether a line looks like a UUencode `begin` header: `begin <octal-mode> <name>`
pub(super) fn is_begin_line(line: &[u8]) -> bool {
    parse_begin(line).is_some()
}

fn parse_begin(line: &[u8]) -> Option<Option<String>> {
    let text = std::str::from_utf8(line).ok()?;
    let rest = text.strip_prefix("begin ")?;
    let (mode, name) = rest.split_once(' ')?;
    if mode.is_empty() || !mode.bytes().all(|b| b.is_ascii_digit() && b < b'8') {
        return None;
    }
    let name = name.trim();
    Some((!name.is_empty()).then(|| name.to_string()))
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn uu_val(byte: u8) -> u8 {
    byte.wrapping_sub(0x20) & 0x3f
}

/// Decode one UUencoded data line into `out`.
///
/// The first character declares how many decoded bytes the line carries; the
/// groups that follow are decoded and then truncated to that count, which
/// also absorbs the off-by-one-length lines some encoders emit.
fn decode_line(line: &[u8], out: &mut Vec<u8>) {
    let declared = uu_val(line[0]) as usize;
    if declared == 0 {
        return;
    }

    let start = out.len();
    let mut chunk = [0u8; 4];
    for group in line[1..].chunks(4) {
        chunk.fill(b'`');
        chunk[..group.len()].copy_from_slice(group);
        let d: Vec<u8> = chunk.iter().map(|&c| uu_val(c)).collect();
        out.push((d[0] << 2) | (d[1] >> 4));
        out.push((d[1] << 4) | (d[2] >> 2));
        out.push((d[2] << 6) | d[3]);
    }
    out.truncate(start + declared);
}

/// UUencode a blob, for tests and fixtures.
#[doc(hidden)]
pub fn encode_for_test(name: &str, data: &[u8]) -> Vec<u8> {
    fn uu_char(val: u8) -> u8 {
        if val == 0 { b'`' } else { val + 0x20 }
    }

    let mut out = format!("begin 644 {name}\r\n").into_bytes();
    for line in data.chunks(45) {
        out.push(uu_char(line.len() as u8));
        for group in line.chunks(3) {
            let mut buf = [0u8; 3];
            buf[..group.len()].copy_from_slice(group);
            out.push(uu_char(buf[0] >> 2));
            out.push(uu_char(((buf[0] << 4) | (buf[1] >> 4)) & 0x3f));
            out.push(uu_char(((buf[1] << 2) | (buf[2] >> 6)) & 0x3f));
            out.push(uu_char(buf[2] & 0x3f));
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"`\r\nend\r\n");
    out
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let blob: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let encoded = encode_for_test("blob.bin", &blob);

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.data, blob);
        assert_eq!(decoded.name.as_deref(), Some("blob.bin"));
    }

    #[test]
    fn decodes_the_classic_cat_example() {
        // "Cat" encodes to "#0V%T" with length char '#' (3 bytes)
        let body = b"begin 644 cat.txt\r\n#0V%T\r\n`\r\nend\r\n";
        let decoded = decode(&body[..]).unwrap();
        assert_eq!(decoded.data, b"Cat");
    }

    #[test]
    fn tolerates_line_with_missing_trailing_character() {
        // Drop the final character of the data line; the declared length
        // still says 3 bytes, so the missing bits decode as zero
        let body = b"begin 644 short.txt\r\n#0V%\r\n`\r\nend\r\n";
        let decoded = decode(&body[..]).unwrap();
        assert_eq!(decoded.data.len(), 3, "declared length wins over line length");
        assert_eq!(&decoded.data[..2], b"Ca");
    }

    #[test]
    fn body_without_begin_is_unknown_encoding() {
        let err = decode(b"no header here\r\n").unwrap_err();
        assert_eq!(err, DecodeError::UnknownEncoding);
    }

    #[test]
    fn begin_line_requires_octal_mode() {
        assert!(is_begin_line(b"begin 644 file.bin"));
        assert!(is_begin_line(b"begin 0755 tool"));
        assert!(
            !is_begin_line(b"begin now, the story"),
            "prose starting with 'begin' must not be mistaken for a header"
        );
        assert!(!is_begin_line(b"begin 999 file.bin"), "9 is not octal");
        assert!(!is_begin_line(b"begin"));
    }

    #[test]
    fn stops_at_end_marker() {
        let mut body = encode_for_test("x.bin", b"data");
        body.extend_from_slice(b"#0V%T\r\n");
        let decoded = decode(&body).unwrap();
        assert_eq!(decoded.data, b"data", "lines after end must be ignored");
    }

    #[test]
    fn empty_payload_decodes_to_empty() {
        let encoded = encode_for_test("empty.bin", b"");
        let decoded = decode(&encoded).unwrap();
        assert!(decoded.data.is_empty());
    }
}
