//! CSV output for snapshot exports
//!
//! One header row, then one row per record. Backtraces span several lines,
//! so any field holding a comma, quote or line break is quoted.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// A row type with a fixed set of columns
pub trait CsvRecord {
    const HEADER: &'static [&'static str];

    /// Unescaped field values, one per header column
    fn fields(&self) -> Vec<String>;
}

/// CSV output formatter
#[derive(Debug)]
pub struct CsvOutput<'a, R: CsvRecord> {
    records: &'a [R],
}

impl<'a, R: CsvRecord> CsvOutput<'a, R> {
    pub fn new(records: &'a [R]) -> Self {
        Self { records }
    }

    fn header() -> String {
        R::HEADER.join(",")
    }

    /// Escape CSV field (handle commas, quotes, newlines)
    pub fn escape_field(field: &str) -> String {
        if field.contains([',', '"', '\n', '\r']) {
            format!("\"{}\"", field.replace('"', "\"\""))
        } else {
            field.to_string()
        }
    }

    fn format_record(record: &R) -> String {
        record
            .fields()
            .iter()
            .map(|f| Self::escape_field(f))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Generate CSV output as string
    pub fn to_csv(&self) -> String {
        let mut output = Self::header();
        output.push('\n');
        for record in self.records {
            output.push_str(&Self::format_record(record));
            output.push('\n');
        }
        output
    }

    /// Write the CSV document to `dest`, replacing any existing file
    pub fn write_to(&self, dest: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(dest)?);
        out.write_all(self.to_csv().as_bytes())?;
        out.flush()
    }
}
