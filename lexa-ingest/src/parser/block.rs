//! Block parser state machine
//!
//! One forward pass over a line stream with a single entry under
//! construction:
//!
//! ```text
//!             line opens entry            line opens entry
//!   Idle ─────────────────────> Building ─────────────────> Building (emit previous if it has a body)
//!    │ body line: orphan          │ body line: append fragment (short lines are noise)
//!    └─ EOF: done                 └─ EOF: emit if it has a body
//! ```
//!
//! Entries without any body fragment are rejected and counted, never
//! emitted. The parser never fails on malformed input; an I/O error ends the
//! stream early and is reported through [`ParseStats::io_error`].

use std::io::{BufRead, BufReader, Cursor};

use lexa_common::text::normalize_key;
use serde::{Deserialize, Serialize};

use super::formats::EntryFormat;

/// Fragments shorter than this (in characters) are treated as noise
pub const DEFAULT_MIN_FRAGMENT_LEN: usize = 3;

/// Recorded in job metadata so re-imports can be traced to parser behaviour
pub const PARSER_VERSION: &str = "block-parser/1";

/// One structured entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEntry {
    /// Canonical key (case-folded, diacritics stripped)
    pub key: String,
    /// Headword as written in the source
    pub headword: String,
    /// Body lines in source order, trimmed
    pub fragments: Vec<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub cross_refs: Vec<String>,
}

impl ParsedEntry {
    /// Fragments joined in order
    pub fn body(&self) -> String {
        self.fragments.join(" ")
    }
}

/// Counters reported alongside the entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub lines: u64,
    pub emitted: u64,
    /// Entries dropped for having no body
    pub rejected: u64,
    /// Short lines discarded inside an entry
    pub noise_lines: u64,
    /// Body lines seen before any entry opened
    pub orphan_lines: u64,
    pub io_error: Option<String>,
}

struct Building {
    headword: String,
    fragments: Vec<String>,
}

/// Lazy iterator of [`ParsedEntry`] over a line stream
pub struct BlockParser<R, F> {
    reader: R,
    format: F,
    min_fragment_len: usize,
    current: Option<Building>,
    stats: ParseStats,
    buf: Vec<u8>,
    exhausted: bool,
}

impl<F: EntryFormat> BlockParser<Cursor<Vec<u8>>, F> {
    /// Parser over an in-memory text
    pub fn from_text(text: impl Into<String>, format: F) -> Self {
        Self::new(Cursor::new(text.into().into_bytes()), format)
    }
}

impl<R: std::io::Read, F: EntryFormat> BlockParser<BufReader<R>, F> {
    pub fn from_reader(reader: R, format: F) -> Self {
        Self::new(BufReader::new(reader), format)
    }
}

impl<R: BufRead, F: EntryFormat> BlockParser<R, F> {
    pub fn new(reader: R, format: F) -> Self {
        Self {
            reader,
            format,
            min_fragment_len: DEFAULT_MIN_FRAGMENT_LEN,
            current: None,
            stats: ParseStats::default(),
            buf: Vec::with_capacity(256),
            exhausted: false,
        }
    }

    pub fn with_min_fragment_len(mut self, min_fragment_len: usize) -> Self {
        self.min_fragment_len = min_fragment_len;
        self
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    pub fn format_name(&self) -> &'static str {
        self.format.name()
    }

    /// Next raw line with invalid UTF-8 replaced, `None` at end of stream
    fn next_line(&mut self) -> Option<String> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                self.stats.lines += 1;
                Some(String::from_utf8_lossy(&self.buf).into_owned())
            }
            Err(e) => {
                tracing::warn!(
                    line = self.stats.lines + 1,
                    error = %e,
                    "Read error, ending parse early"
                );
                self.stats.io_error = Some(e.to_string());
                None
            }
        }
    }

    /// Close the entry under construction, returning it if it has a body
    fn close_current(&mut self) -> Option<ParsedEntry> {
        let building = self.current.take()?;
        if building.fragments.is_empty() {
            self.stats.rejected += 1;
            tracing::trace!(headword = %building.headword, "Dropping entry without body");
            return None;
        }

        let key = normalize_key(&building.headword);
        if key.is_empty() {
            self.stats.rejected += 1;
            return None;
        }

        let body = building.fragments.join(" ");
        self.stats.emitted += 1;
        Some(ParsedEntry {
            key,
            category: self.format.extract_category(&body),
            cross_refs: self.format.extract_cross_refs(&body),
            headword: building.headword,
            fragments: building.fragments,
        })
    }
}

impl<R: BufRead, F: EntryFormat> Iterator for BlockParser<R, F> {
    type Item = ParsedEntry;

    fn next(&mut self) -> Option<ParsedEntry> {
        if self.exhausted {
            return None;
        }

        while let Some(raw) = self.next_line() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(headword) = self.format.opens_entry(line) {
                let finished = self.close_current();
                self.current = Some(Building {
                    headword,
                    fragments: Vec::new(),
                });
                if finished.is_some() {
                    return finished;
                }
                continue;
            }

            match self.current.as_mut() {
                Some(building) => {
                    if line.chars().count() < self.min_fragment_len {
                        self.stats.noise_lines += 1;
                    } else {
                        building.fragments.push(line.to_string());
                    }
                }
                None => self.stats.orphan_lines += 1,
            }
        }

        self.exhausted = true;
        self.close_current()
    }
}
