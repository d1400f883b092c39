//! Delimited Record Reader - Streams header-keyed records out of tab/comma files

use crate::error::{IngestError, Result};
use csv::{ByteRecord, ReaderBuilder, Terminator, Trim};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Chain, Cursor, Read};
use std::sync::Arc;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Field separator of a delimited source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    Tab,
    Comma,
}

impl Delimiter {
    pub fn as_byte(self) -> u8 {
        match self {
            Delimiter::Tab => b'\t',
            Delimiter::Comma => b',',
        }
    }

    /// Accepts `tab`, `comma`, or the literal characters.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim_matches(|c| c == ' ' || c == '\'' || c == '"') {
            "\t" | "\\t" => Some(Delimiter::Tab),
            "," => Some(Delimiter::Comma),
            other if other.eq_ignore_ascii_case("tab") || other.eq_ignore_ascii_case("tsv") => {
                Some(Delimiter::Tab)
            }
            other if other.eq_ignore_ascii_case("comma") || other.eq_ignore_ascii_case("csv") => {
                Some(Delimiter::Comma)
            }
            _ => None,
        }
    }

    /// Pick the delimiter from a header line: tab when it appears at least once
    /// and at least as often as comma outside quotes, comma otherwise.
    pub fn sniff(line: &[u8]) -> Self {
        let mut tabs = 0usize;
        let mut commas = 0usize;
        let mut in_quotes = false;

        for &b in line {
            match b {
                b'"' => in_quotes = !in_quotes,
                b'\t' if !in_quotes => tabs += 1,
                b',' if !in_quotes => commas += 1,
                _ => {}
            }
        }

        if tabs > 0 && tabs >= commas {
            Delimiter::Tab
        } else {
            Delimiter::Comma
        }
    }
}

/// One parsed data row, keyed by the original header text.
#[derive(Clone, Debug)]
pub struct RawRecord {
    headers: Arc<[String]>,
    values: Vec<String>,
    row: u64,
    line: u64,
}

impl RawRecord {
    pub fn new(headers: Arc<[String]>, values: Vec<String>, row: u64, line: u64) -> Self {
        Self {
            headers,
            values,
            row,
            line,
        }
    }

    /// Value under an original header, if that header exists.
    pub fn get(&self, header: &str) -> Option<&str> {
        let idx = self.headers.iter().position(|h| h == header)?;
        self.values.get(idx).map(String::as_str)
    }

    /// Value by header position.
    pub fn value(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// 1-based data row number (header and blank lines are not rows).
    pub fn row(&self) -> u64 {
        self.row
    }

    /// 1-based physical line the record starts on.
    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Notes when the underlying stream first reports end of input.
struct EndAware<R> {
    inner: R,
    at_end: bool,
}

impl<R: Read> Read for EndAware<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.at_end = true;
        }
        Ok(n)
    }
}

type Source<R> = Chain<Cursor<Vec<u8>>, EndAware<BufReader<R>>>;

/// Lazy, finite reader over a delimited byte stream.
///
/// Yields `Ok(RawRecord)` for well-formed rows and row-level errors
/// (`FieldCountMismatch`, `InvalidEncoding`) for malformed ones. A
/// `SourceReadFailure` is yielded at most once and ends the sequence.
pub struct DelimitedReader<R: Read> {
    inner: csv::Reader<Source<R>>,
    headers: Arc<[String]>,
    delimiter: Delimiter,
    record: ByteRecord,
    line_offset: u64,
    /// Parser line after the previous read, relative to the header line.
    parsed_line: u64,
    rows: u64,
    blank_rows: u64,
    finished: bool,
}

impl<R: Read> DelimitedReader<R> {
    /// Consume the header line and prepare for streaming.
    ///
    /// `delimiter` overrides detection; `None` sniffs the header line.
    pub fn new(source: R, delimiter: Option<Delimiter>) -> Result<Self> {
        let mut buffered = BufReader::new(source);
        let mut line_offset = 0u64;
        let mut first_line = Vec::new();

        loop {
            first_line.clear();
            let read = buffered.read_until(b'\n', &mut first_line)?;
            if read == 0 {
                return Err(IngestError::EmptySource);
            }
            if line_offset == 0 && first_line.starts_with(UTF8_BOM) {
                first_line.drain(..UTF8_BOM.len());
            }
            if first_line.iter().any(|b| !b.is_ascii_whitespace()) {
                break;
            }
            line_offset += 1;
        }

        let delimiter = delimiter.unwrap_or_else(|| Delimiter::sniff(&first_line));
        let chained = Cursor::new(first_line).chain(EndAware {
            inner: buffered,
            at_end: false,
        });

        // Only `\n` ends a record, so a terminated record always consumes its
        // own newline; a trailing `\r` is stripped from the last field.
        let mut inner = ReaderBuilder::new()
            .delimiter(delimiter.as_byte())
            .terminator(Terminator::Any(b'\n'))
            .quote(b'"')
            .double_quote(true)
            .has_headers(true)
            .flexible(true)
            .trim(Trim::None)
            .from_reader(chained);

        let mut headers: Vec<String> = inner
            .headers()
            .map_err(|source| IngestError::SourceReadFailure {
                after_row: 0,
                source,
            })?
            .iter()
            .map(str::to_string)
            .collect();
        if let Some(last) = headers.last_mut() {
            if last.ends_with('\r') {
                last.pop();
            }
        }

        if headers.is_empty() {
            return Err(IngestError::EmptySource);
        }
        let parsed_line = inner.position().line();

        Ok(Self {
            inner,
            headers: headers.into(),
            delimiter,
            record: ByteRecord::new(),
            line_offset,
            parsed_line,
            rows: 0,
            blank_rows: line_offset,
            finished: false,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn delimiter(&self) -> Delimiter {
        self.delimiter
    }

    /// Data rows yielded so far, malformed ones included.
    pub fn rows_read(&self) -> u64 {
        self.rows
    }

    /// Blank lines skipped so far, including any before the header.
    pub fn blank_rows(&self) -> u64 {
        self.blank_rows
    }

    /// Read one record and account for the lines it consumed.
    ///
    /// Returns the line the record starts on, relative to the header line.
    /// Empty lines skipped by the parser are added to `blank_rows`.
    fn read_next(&mut self) -> csv::Result<Option<u64>> {
        let before = self.parsed_line;
        let found = self.inner.read_byte_record(&mut self.record)?;
        let after = self.inner.position().line();
        self.parsed_line = after;

        if !found {
            // Empty lines after the last record.
            self.blank_rows += after.saturating_sub(before);
            return Ok(None);
        }

        let embedded = self.record.as_slice().iter().filter(|&&b| b == b'\n').count() as u64;
        let terminated = !self.inner.get_ref().get_ref().1.at_end;
        let own_lines = embedded + u64::from(terminated);
        self.blank_rows += (after - before).saturating_sub(own_lines);
        Ok(Some(after.saturating_sub(own_lines)))
    }

    fn decode(&self, row: u64, line: u64) -> Result<RawRecord> {
        if self.record.len() != self.headers.len() {
            return Err(IngestError::FieldCountMismatch {
                row,
                line,
                expected: self.headers.len(),
                found: self.record.len(),
            });
        }

        let last = self.record.len().saturating_sub(1);
        let mut values = Vec::with_capacity(self.record.len());
        for (field, bytes) in self.record.iter().enumerate() {
            let bytes = match bytes.strip_suffix(b"\r") {
                Some(stripped) if field == last => stripped,
                _ => bytes,
            };
            match std::str::from_utf8(bytes) {
                Ok(text) => values.push(text.to_string()),
                Err(_) => return Err(IngestError::InvalidEncoding { row, line, field }),
            }
        }

        Ok(RawRecord::new(Arc::clone(&self.headers), values, row, line))
    }
}

fn is_blank(record: &ByteRecord) -> bool {
    record
        .iter()
        .all(|field| field.iter().all(u8::is_ascii_whitespace))
}

impl<R: Read> Iterator for DelimitedReader<R> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            match self.read_next() {
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Ok(Some(line)) => {
                    if is_blank(&self.record) {
                        self.blank_rows += 1;
                        continue;
                    }
                    self.rows += 1;
                    return Some(self.decode(self.rows, line + self.line_offset));
                }
                Err(source) => {
                    self.finished = true;
                    return Some(Err(IngestError::SourceReadFailure {
                        after_row: self.rows,
                        source,
                    }));
                }
            }
        }
    }
}

impl<R: Read> std::iter::FusedIterator for DelimitedReader<R> {}
