//! ResultCursor: lazy, forward-only iteration over a snapshot table.
//!
//! A cursor pages through one redb table in key order, [`PAGE_SIZE`]
//! entries at a time, remembering only the last key it has seen. It holds
//! an `Arc` of the snapshot's read transaction and nothing else, so it can
//! be dropped at any point without cleanup.
//!
//! Once `next()` has returned `None` it keeps returning `None`
//! ([`FusedIterator`]). A storage or decode error is yielded once, after
//! which the cursor is exhausted.

use std::collections::VecDeque;
use std::fmt;
use std::iter::FusedIterator;
use std::ops::Bound;
use std::sync::Arc;

use redb::{ReadTransaction, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;

use crate::error::{StateError, StateResult};

/// Number of table entries scanned per page.
pub const PAGE_SIZE: usize = 64;

/// Value predicate applied after decoding.
pub type CursorFilter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// A JSON-valued table with string keys.
pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    /// More pages may be available.
    Open,
    /// The table range is consumed; only the buffer remains.
    Drained,
    /// Everything has been returned.
    Exhausted,
}

/// Lazy sequence of decoded values from one snapshot query.
pub struct ResultCursor<T> {
    txn: Arc<ReadTransaction>,
    table: JsonTable,
    query: &'static str,
    prefix: Option<String>,
    filter: Option<CursorFilter<T>>,
    resume_after: Option<String>,
    buffer: VecDeque<T>,
    state: CursorState,
}

impl<T: DeserializeOwned> ResultCursor<T> {
    /// Open a cursor over `table`. Verifies the table is readable up front
    /// so that a broken snapshot fails at query time rather than mid-scan.
    pub(crate) fn open(
        txn: Arc<ReadTransaction>,
        table: JsonTable,
        query: &'static str,
    ) -> StateResult<Self> {
        txn.open_table(table)
            .map_err(|e| StateError::Table(e.to_string()).in_query(query))?;
        Ok(Self {
            txn,
            table,
            query,
            prefix: None,
            filter: None,
            resume_after: None,
            buffer: VecDeque::new(),
            state: CursorState::Open,
        })
    }

    /// Restrict the cursor to keys starting with `prefix`.
    pub(crate) fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Skip values for which `filter` returns false.
    pub(crate) fn with_filter(mut self, filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// True once the cursor has returned its final `None`.
    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted
    }

    /// Scan the next page of the table into the buffer.
    fn fill_page(&mut self) -> StateResult<()> {
        let txn = Arc::clone(&self.txn);
        let table = txn
            .open_table(self.table)
            .map_err(|e| StateError::Table(e.to_string()))?;

        let resume_after = self.resume_after.clone();
        let prefix = self.prefix.clone();
        let start: Bound<&str> = match (&resume_after, &prefix) {
            (Some(key), _) => Bound::Excluded(key.as_str()),
            (None, Some(p)) => Bound::Included(p.as_str()),
            (None, None) => Bound::Unbounded,
        };

        let range = table
            .range::<&str>((start, Bound::Unbounded))
            .map_err(|e| StateError::Read(e.to_string()))?;

        let mut scanned = 0;
        for entry in range {
            let (key, value) = entry.map_err(|e| StateError::Read(e.to_string()))?;
            let key = key.value();
            if let Some(p) = &prefix {
                if !key.starts_with(p.as_str()) {
                    self.state = CursorState::Drained;
                    return Ok(());
                }
            }
            self.resume_after = Some(key.to_string());
            scanned += 1;

            let item: T = serde_json::from_slice(value.value())
                .map_err(|e| StateError::Deserialize(e.to_string()))?;
            if self.filter.as_ref().is_none_or(|f| f(&item)) {
                self.buffer.push_back(item);
            }
            if scanned >= PAGE_SIZE {
                return Ok(());
            }
        }

        self.state = CursorState::Drained;
        Ok(())
    }
}

impl<T: DeserializeOwned> Iterator for ResultCursor<T> {
    type Item = StateResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            match self.state {
                CursorState::Open => {
                    if let Err(e) = self.fill_page() {
                        self.state = CursorState::Exhausted;
                        self.buffer.clear();
                        return Some(Err(e.in_query(self.query)));
                    }
                }
                CursorState::Drained | CursorState::Exhausted => {
                    self.state = CursorState::Exhausted;
                    return None;
                }
            }
        }
    }
}

impl<T: DeserializeOwned> FusedIterator for ResultCursor<T> {}

impl<T> fmt::Debug for ResultCursor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCursor")
            .field("query", &self.query)
            .field("prefix", &self.prefix)
            .field("resume_after", &self.resume_after)
            .field("buffered", &self.buffer.len())
            .field("state", &self.state)
            .finish()
    }
}
