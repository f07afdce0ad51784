//! File-based source: one JSON-encoded record per line.
//!
//! The file must already be sorted by (timestamp, id); the stream checks
//! this as it reads instead of sorting, so memory stays bounded.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;

use crate::{
    error::{FraudError, FraudResult},
    record::Record,
    source::{RecordSource, RecordStream},
    window::TimeWindow,
};

pub struct JsonlRecordSource {
    path: PathBuf,
}

impl JsonlRecordSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSource for JsonlRecordSource {
    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }

    fn open(&self, window: &TimeWindow) -> FraudResult<RecordStream> {
        let file = File::open(&self.path).map_err(|e| {
            FraudError::SourceUnavailable(format!("{}: {e}", self.path.display()))
        })?;
        Ok(Box::new(JsonlRecords {
            lines:    BufReader::new(file).lines(),
            window:   *window,
            path:     self.path.clone(),
            line_no:  0,
            previous: None,
            done:     false,
        }))
    }
}

struct JsonlRecords {
    lines:    Lines<BufReader<File>>,
    window:   TimeWindow,
    path:     PathBuf,
    line_no:  usize,
    previous: Option<(DateTime<Utc>, String)>,
    done:     bool,
}

impl JsonlRecords {
    fn fail(&mut self, message: String) -> Option<FraudResult<Record>> {
        self.done = true;
        Some(Err(FraudError::SourceQuery(format!(
            "{}:{}: {message}",
            self.path.display(),
            self.line_no
        ))))
    }
}

impl Iterator for JsonlRecords {
    type Item = FraudResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let line = match self.lines.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(FraudError::SourceUnavailable(format!(
                        "{}: read failed: {e}",
                        self.path.display()
                    ))));
                }
                Some(Ok(line)) => line,
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let record: Record = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => return self.fail(format!("invalid record: {e}")),
            };

            if let Some((ts, id)) = &self.previous {
                if (record.timestamp, record.id.as_str()) <= (*ts, id.as_str()) {
                    let message = format!(
                        "record {} is not after {} ({} <= {}); file must be sorted by timestamp, id",
                        record.id, id, record.timestamp, ts
                    );
                    return self.fail(message);
                }
            }
            self.previous = Some((record.timestamp, record.id.clone()));

            if record.timestamp >= self.window.end() {
                // Sorted input: nothing later can fall inside the window.
                self.done = true;
                return None;
            }
            if self.window.contains(record.timestamp) {
                return Some(Ok(record));
            }
        }
        None
    }
}
