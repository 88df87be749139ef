//! Capture log reading.
//!
//! A capture is JSON lines, one record per message the relay forwarded:
//!
//! ```text
//! {"timestamp":"2024-05-01T12:00:00.5Z","source":"miner","message":{"id":1,"method":"mining.subscribe","params":[]}}
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

/// Which side sent a captured message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Miner,
    Pool,
}

/// One captured message.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source: Source,
    pub message: Value,
}

/// Streams records out of a capture file.
pub struct CaptureReader<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl CaptureReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> CaptureReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for CaptureReader<R> {
    type Item = Result<CaptureRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;

            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }

            let line_no = self.line_no;
            return Some(
                serde_json::from_str(&line)
                    .with_context(|| format!("line {}: not a capture record", line_no)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_records_and_skips_blank_lines() {
        let input = concat!(
            r#"{"timestamp":"2024-05-01T12:00:00Z","source":"miner","message":{"id":1,"method":"mining.subscribe","params":[]}}"#,
            "\n\n",
            r#"{"timestamp":"2024-05-01T12:00:01Z","source":"pool","message":{"id":1,"result":true,"error":null}}"#,
            "\n",
        );
        let records: Vec<_> = CaptureReader::new(input.as_bytes())
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source, Source::Miner);
        assert_eq!(records[1].source, Source::Pool);
        assert_eq!(records[1].message["result"], true);
    }

    #[test]
    fn test_bad_line_reports_line_number() {
        let input = "\n{\"nope\":1}\n";
        let err = CaptureReader::new(input.as_bytes()).next().unwrap().unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
