//! NZB manifest parsing
//!
//! Streams the manifest XML through a quick-xml pull parser and produces the
//! [`NzbFile`](crate::model::NzbFile) arena. The parser is deliberately
//! tolerant of the messes real indexers produce: out-of-order segment numbers
//! (sorted), duplicate segment numbers (first occurrence wins), and a missing
//! segment 1 (the lowest present number becomes "first" for filename
//! discovery).

use crate::error::{Error, Result};
use crate::model::{NzbFile, NzbSegment};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use std::collections::HashSet;
use std::io::BufRead;
use std::sync::LazyLock;

/// Priority stride between files: within-file position occupies the low bits,
/// file ordinal the high bits, so pop order follows manifest order per file
/// and segment-number order within a file. Allows ~1M segments per file.
const FILE_PRIORITY_SHIFT: u32 = 20;

#[derive(Debug)]
enum ParseState {
    Initial,
    InNzb,
    InHead,
    InMeta,
    InFile,
    InGroups,
    InGroup,
    InSegments,
    InSegment { bytes: u64, number: u32 },
}

#[derive(Debug)]
struct FileBuilder {
    subject: String,
    date: Option<i64>,
    groups: Vec<String>,
    segments: Vec<NzbSegment>,
}

/// Pull parser for NZB manifests
#[derive(Debug)]
pub struct ManifestParser {
    state: ParseState,
    files: Vec<NzbFile>,
    current_file: Option<FileBuilder>,
    current_text: String,
}

impl ManifestParser {
    /// Create a parser with empty state
    pub fn new() -> Self {
        Self {
            state: ParseState::Initial,
            files: Vec::new(),
            current_file: None,
            current_text: String::new(),
        }
    }

    /// Parse a complete manifest, returning files ready for the queue.
    ///
    /// Fails with [`Error::InvalidNzb`] on malformed XML, a missing `<nzb>`
    /// root, or a manifest with no files — a bad manifest aborts that archive
    /// only, never the process.
    pub fn parse<R: BufRead>(mut self, input: R) -> Result<Vec<NzbFile>> {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::with_capacity(4096);
        let mut saw_nzb = false;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    if e.name().as_ref() == b"nzb" {
                        saw_nzb = true;
                    }
                    self.handle_start(e)?;
                }
                Ok(Event::End(ref e)) => self.handle_end(e.name().as_ref()),
                Ok(Event::Text(ref e)) => {
                    self.current_text.push_str(
                        &e.unescape()
                            .map_err(|e| Error::InvalidNzb(e.to_string()))?,
                    );
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::InvalidNzb(e.to_string())),
            }
            buf.clear();
        }

        if !saw_nzb {
            return Err(Error::InvalidNzb("missing <nzb> root element".to_string()));
        }
        if self.files.is_empty() {
            return Err(Error::InvalidNzb("manifest contains no files".to_string()));
        }

        self.finish();
        Ok(self.files)
    }

    fn handle_start(&mut self, e: &BytesStart) -> Result<()> {
        let tag = e.name();
        self.current_text.clear();

        self.state = match (&self.state, tag.as_ref()) {
            (ParseState::Initial, b"nzb") => ParseState::InNzb,
            (ParseState::InNzb, b"head") => ParseState::InHead,
            (ParseState::InHead, b"meta") => ParseState::InMeta,
            (ParseState::InNzb, b"file") => {
                let subject = get_attr(e, b"subject")?.unwrap_or_default();
                let date = get_attr(e, b"date")?.and_then(|s| s.parse::<i64>().ok());
                self.current_file = Some(FileBuilder {
                    subject,
                    date,
                    groups: Vec::new(),
                    segments: Vec::new(),
                });
                ParseState::InFile
            }
            (ParseState::InFile, b"groups") => ParseState::InGroups,
            (ParseState::InGroups, b"group") => ParseState::InGroup,
            (ParseState::InFile, b"segments") => ParseState::InSegments,
            (ParseState::InSegments, b"segment") => {
                let bytes = get_attr(e, b"bytes")?
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                let number = get_attr(e, b"number")?
                    .and_then(|s| s.parse::<u32>().ok())
                    .ok_or_else(|| {
                        Error::InvalidNzb("segment missing number attribute".to_string())
                    })?;
                ParseState::InSegment { bytes, number }
            }
            _ => return Ok(()),
        };
        Ok(())
    }

    fn handle_end(&mut self, tag: &[u8]) {
        self.state = match (&self.state, tag) {
            (ParseState::InMeta, b"meta") => ParseState::InHead,
            (ParseState::InHead, b"head") => ParseState::InNzb,
            (ParseState::InGroup, b"group") => {
                if let Some(ref mut f) = self.current_file {
                    f.groups.push(std::mem::take(&mut self.current_text));
                }
                ParseState::InGroups
            }
            (ParseState::InGroups, b"groups") => ParseState::InFile,
            (ParseState::InSegment { bytes, number }, b"segment") => {
                let message_id = std::mem::take(&mut self.current_text);
                if let Some(ref mut f) = self.current_file {
                    if message_id.is_empty() {
                        tracing::warn!(number = *number, "segment without message-id, skipping");
                    } else {
                        f.segments.push(NzbSegment {
                            number: *number,
                            bytes: *bytes,
                            message_id,
                            priority: 0,
                            failed_pools: 0,
                        });
                    }
                }
                ParseState::InSegments
            }
            (ParseState::InSegments, b"segments") => ParseState::InFile,
            (ParseState::InFile, b"file") => {
                if let Some(builder) = self.current_file.take() {
                    if builder.segments.is_empty() {
                        tracing::warn!(
                            subject = %builder.subject,
                            "file has no usable segments, skipping"
                        );
                    } else {
                        self.push_file(builder);
                    }
                }
                ParseState::InNzb
            }
            (ParseState::InNzb, b"nzb") => ParseState::Initial,
            _ => return,
        };
    }

    fn push_file(&mut self, builder: FileBuilder) {
        let filename = extract_filename(&builder.subject);
        let (is_par, is_extra_par) = classify_par(filename.as_deref());
        let total_bytes = builder.segments.iter().map(|s| s.bytes).sum();
        let number = self.files.len() as u32 + 1;

        self.files.push(NzbFile {
            subject: builder.subject,
            number,
            posted_at: builder
                .date
                .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)),
            filename,
            groups: builder.groups,
            total_bytes,
            read_bytes: 0,
            is_par,
            is_extra_par,
            is_skipped_par: false,
            segments: builder.segments,
            todo_segments: HashSet::new(),
            dequeued_segments: HashSet::new(),
        });
    }

    /// Sort and dedup segments, assign priorities, and seed the todo sets.
    fn finish(&mut self) {
        for (file_idx, file) in self.files.iter_mut().enumerate() {
            file.segments.sort_by_key(|s| s.number);
            // Duplicate segment numbers: keep the first occurrence
            file.segments.dedup_by_key(|s| s.number);
            file.total_bytes = file.segments.iter().map(|s| s.bytes).sum();

            for (pos, segment) in file.segments.iter_mut().enumerate() {
                segment.priority = ((file_idx as u64) << FILE_PRIORITY_SHIFT) | pos as u64;
                file.todo_segments.insert(segment.number);
            }
        }
    }
}

impl Default for ManifestParser {
    fn default() -> Self {
        Self::new()
    }
}

fn get_attr(e: &BytesStart, name: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name {
            return Ok(Some(
                attr.unescape_value()
                    .map_err(|e| Error::InvalidNzb(e.to_string()))?
                    .into_owned(),
            ));
        }
    }
    Ok(None)
}

static FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([^"]+\.[a-zA-Z0-9]{2,4})""#).expect("valid regex")
});

/// Extract a quoted filename from a subject line.
///
/// Subjects usually look like `Name [01/15] - "file.part01.rar" yEnc (1/50)`;
/// the last quoted token with an extension wins.
pub fn extract_filename(subject: &str) -> Option<String> {
    FILENAME_RE
        .captures_iter(subject)
        .last()
        .map(|cap| cap[1].to_string())
}

static PAR2_VOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.vol\d+\+\d+\.par2$").expect("valid regex"));

/// Classify a filename as (is_par, is_extra_par).
///
/// `file.par2` is the main par file; `file.vol003+04.par2` is a recovery
/// volume (extra par).
pub fn classify_par(filename: Option<&str>) -> (bool, bool) {
    let Some(name) = filename else {
        return (false, false);
    };
    if !name.to_ascii_lowercase().ends_with(".par2") {
        return (false, false);
    }
    let is_volume = PAR2_VOL_RE.is_match(name);
    (true, is_volume)
}
