//! Article decoding — yEnc and UUencode detection, decode, and validation
//!
//! Decoding is pure and never blocks the pipeline: an article with no
//! recognizable encoding header, or one that fails CRC/size validation,
//! degrades to best-effort output (empty for the former) instead of aborting
//! the download. Corruption is expected to be repaired downstream by PAR2
//! tooling, which is outside this crate.

pub mod uu;
pub mod yenc;

/// Encoding detected in an article body
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// yEnc (`=ybegin` header)
    Yenc,
    /// UUencode (`begin <mode> <name>` header)
    UuEncode,
    /// No recognizable header; decodes to a zero-byte placeholder
    Unknown,
}

/// One decoded article, ready to be written as a segment file
#[derive(Debug, Clone)]
pub struct DecodedArticle {
    /// Decoded bytes (empty for [`Encoding::Unknown`])
    pub data: Vec<u8>,
    /// Which encoding was detected
    pub encoding: Encoding,
    /// Filename declared in the encoding header, used to resolve the parent
    /// file's real name when the first segment decodes
    pub filename: Option<String>,
    /// CRC verdict: Some(false) means the declared checksum did not match
    pub crc_ok: Option<bool>,
    /// Size verdict against the trailer's declared size
    pub size_ok: Option<bool>,
}

impl DecodedArticle {
    fn placeholder() -> Self {
        Self {
            data: Vec::new(),
            encoding: Encoding::Unknown,
            filename: None,
            crc_ok: None,
            size_ok: None,
        }
    }
}

/// Decode one raw article body.
///
/// Never fails: detection scans for an `=ybegin` or UUencode `begin` line and
/// an unrecognizable body produces an empty [`DecodedArticle`]. CRC and size
/// mismatches are reported in the result (and logged by the caller) but do not
/// reject the decoded data.
pub fn decode_article(body: &[u8]) -> DecodedArticle {
    match detect_encoding(body) {
        Encoding::Yenc => match yenc::decode(body) {
            Ok(decoded) => DecodedArticle {
                crc_ok: decoded.crc_matches(),
                size_ok: decoded.size_matches(),
                filename: decoded.header.name,
                data: decoded.data,
                encoding: Encoding::Yenc,
            },
            Err(e) => {
                tracing::warn!(error = %e, "yEnc decode failed, writing placeholder");
                DecodedArticle::placeholder()
            }
        },
        Encoding::UuEncode => match uu::decode(body) {
            Ok(decoded) => DecodedArticle {
                data: decoded.data,
                encoding: Encoding::UuEncode,
                filename: decoded.name,
                crc_ok: None,
                size_ok: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "UUencode decode failed, writing placeholder");
                DecodedArticle::placeholder()
            }
        },
        Encoding::Unknown => {
            tracing::debug!(
                body_len = body.len(),
                "no recognizable encoding header, writing placeholder"
            );
            DecodedArticle::placeholder()
        }
    }
}

/// Scan the body's lines for an encoding header
pub fn detect_encoding(body: &[u8]) -> Encoding {
    for line in body.split(|&b| b == b'\n') {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        if line.starts_with(b"=ybegin") {
            return Encoding::Yenc;
        }
        if uu::is_begin_line(line) {
            return Encoding::UuEncode;
        }
    }
    Encoding::Unknown
}
