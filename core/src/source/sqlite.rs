//! SQLite-backed claims source with keyset pagination.

use std::collections::VecDeque;
use std::path::PathBuf;

use crate::{
    error::{FraudError, FraudResult},
    record::Record,
    source::{RecordSource, RecordStream},
    store::{ClaimSchema, ClaimStore, PageCursor},
    window::TimeWindow,
};

pub struct SqliteRecordSource {
    path:      PathBuf,
    page_size: usize,
}

impl SqliteRecordSource {
    pub fn new(path: impl Into<PathBuf>, page_size: usize) -> Self {
        Self { path: path.into(), page_size: page_size.max(1) }
    }
}

impl RecordSource for SqliteRecordSource {
    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    fn open(&self, window: &TimeWindow) -> FraudResult<RecordStream> {
        let store = ClaimStore::open_read_only(&self.path.to_string_lossy())?;
        let schema = store.detect_schema()?;
        if !schema.beneficiary {
            log::warn!(
                "{}: acte_trans has no id_beneficiaire column; beneficiary rules will not fire",
                self.describe()
            );
        }
        let missing = schema.missing();
        if !missing.is_empty() {
            log::info!("{}: absent optional schema parts: {}", self.describe(), missing.join(", "));
        }

        // A claim whose date cannot be read would fall outside every window
        // without a trace.
        if let Some((claim, raw)) = store.first_undated_claim()? {
            return Err(FraudError::SourceQuery(format!(
                "claim {claim} has an unreadable care date '{}'",
                raw.unwrap_or_default()
            )));
        }

        Ok(Box::new(ClaimPages {
            store,
            window: *window,
            schema,
            page_size: self.page_size,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            pages: 0,
        }))
    }
}

/// Streams one page at a time; at most `page_size` records are held.
struct ClaimPages {
    store:     ClaimStore,
    window:    TimeWindow,
    schema:    ClaimSchema,
    page_size: usize,
    cursor:    Option<PageCursor>,
    buffer:    VecDeque<Record>,
    exhausted: bool,
    pages:     u64,
}

impl ClaimPages {
    fn fetch_next_page(&mut self) -> FraudResult<()> {
        let page = self.store.fetch_claims_page(
            &self.window,
            self.cursor.as_ref(),
            self.schema,
            self.page_size,
        )?;
        self.pages += 1;
        log::debug!("claims page {} -> {} records", self.pages, page.len());

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(PageCursor {
                timestamp: last.timestamp,
                record_id: last.id.clone(),
            });
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for ClaimPages {
    type Item = FraudResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_next_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
