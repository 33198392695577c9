//! File access shared by every loader: memory maps for binary payloads and a
//! line-oriented reader for whitespace-delimited text tables.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str;

use memmap2::{Advice, Mmap};

use crate::shared::error::{Diagnostic, GremlError, Result};

/// Memory-maps `path` read-only.
pub fn open_mmap(path: &Path, advice: Advice) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| GremlError::io(path, e))?;
    // The mapping is read-only and owned by the returned value.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| GremlError::io(path, e))?;
    #[cfg(unix)]
    mmap.advise(advice).map_err(|e| GremlError::io(path, e))?;
    #[cfg(not(unix))]
    let _ = advice;
    Ok(mmap)
}

/// Appends `.{extension}` to a prefix unless it already ends with it.
pub fn with_suffix(prefix: &Path, extension: &str) -> PathBuf {
    if prefix.extension().is_some_and(|ext| ext == extension) {
        return prefix.to_path_buf();
    }
    let mut raw = prefix.as_os_str().to_owned();
    raw.push(".");
    raw.push(extension);
    PathBuf::from(raw)
}

/// Strips a trailing `.bed`, `.bim` or `.fam` so the result can be used as a PLINK prefix.
pub fn plink_prefix(path: &Path) -> PathBuf {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("bed" | "bim" | "fam") => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

/// Reads a text file line by line, tracking 1-based line numbers and skipping
/// blank lines.
pub struct LineReader {
    path: PathBuf,
    reader: BufReader<File>,
    line: Vec<u8>,
    line_no: usize,
}

impl LineReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| GremlError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line: Vec::with_capacity(1024),
            line_no: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the next non-blank line with its line number.
    pub fn next_record(&mut self) -> Result<Option<Record<'_>>> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.line)
                .map_err(|e| GremlError::io(&self.path, e))?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            while matches!(self.line.last(), Some(b'\n' | b'\r')) {
                self.line.pop();
            }
            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let text = str::from_utf8(&self.line).map_err(|err| {
                GremlError::value(
                    format!("line is not valid UTF-8: {err}"),
                    Diagnostic::at_line(&self.path, self.line_no),
                )
            })?;
            return Ok(Some(Record {
                line: self.line_no,
                fields: text.split_whitespace().collect(),
            }));
        }
    }
}

/// One non-blank line split on tabs or spaces.
#[derive(Debug)]
pub struct Record<'a> {
    pub line: usize,
    pub fields: Vec<&'a str>,
}

/// A whitespace-delimited table whose first line is a header.
#[derive(Debug)]
pub struct HeaderedTable {
    pub path: PathBuf,
    pub header: Vec<String>,
    pub rows: Vec<OwnedRecord>,
}

#[derive(Debug, Clone)]
pub struct OwnedRecord {
    pub line: usize,
    pub fields: Vec<String>,
}

impl HeaderedTable {
    /// Reads the whole table, requiring at least `min_columns` header columns
    /// and the header width on every data row.
    pub fn read(path: &Path, min_columns: usize) -> Result<Self> {
        let mut reader = LineReader::open(path)?;
        let header: Vec<String> = match reader.next_record()? {
            Some(record) => record.fields.iter().map(|s| s.to_string()).collect(),
            None => {
                return Err(GremlError::shape(
                    "file is empty; a header line is required",
                    Diagnostic::file(path),
                ));
            }
        };
        if header.len() < min_columns {
            return Err(GremlError::shape(
                format!(
                    "header has {} columns but at least {min_columns} are required",
                    header.len()
                ),
                Diagnostic::at_line(path, 1),
            ));
        }

        let mut rows = Vec::new();
        while let Some(record) = reader.next_record()? {
            if record.fields.len() != header.len() {
                return Err(GremlError::shape(
                    format!(
                        "row has {} columns but the header declares {}",
                        record.fields.len(),
                        header.len()
                    ),
                    Diagnostic::at_line(path, record.line),
                ));
            }
            rows.push(OwnedRecord {
                line: record.line,
                fields: record.fields.iter().map(|s| s.to_string()).collect(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            rows,
        })
    }

    /// [`HeaderedTable::read`] for per-sample tables, whose header must open
    /// with `FID` and `IID`.
    pub fn read_samples(path: &Path, min_columns: usize) -> Result<Self> {
        let table = Self::read(path, min_columns.max(2))?;
        if table.header[0] != "FID" || table.header[1] != "IID" {
            return Err(GremlError::shape(
                format!(
                    "first two columns are '{}' and '{}', but expected 'FID' and 'IID'",
                    table.header[0], table.header[1]
                ),
                Diagnostic::at_line(path, 1),
            ));
        }
        Ok(table)
    }
}

/// Parses a numeric field. Missing markers and IEEE specials come back as
/// non-finite values so callers can decide whether to drop the row.
pub fn parse_number(token: &str, path: &Path, line: usize, column: usize) -> Result<f64> {
    if is_missing_token(token) {
        return Ok(f64::NAN);
    }
    token.parse::<f64>().map_err(|_| {
        GremlError::value(
            "expected a number",
            Diagnostic::at_line(path, line)
                .with_column(column)
                .with_token(token),
        )
    })
}

/// `nan`, `inf`, `+inf` and `-inf` (any case) mark a missing value.
pub fn is_missing_token(token: &str) -> bool {
    matches!(
        token.to_ascii_lowercase().as_str(),
        "nan" | "inf" | "+inf" | "-inf"
    )
}
