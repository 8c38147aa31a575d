//! In-memory page reader implementation for testing.

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use super::PageReader;
use crate::error::{Error, Result};
use crate::row::Row;

/// In-memory page reader over a fixed row set.
///
/// Logs every `read_page` call so tests can assert how many round
/// trips the extraction loop made and from which page it resumed.
#[derive(Debug)]
pub struct InMemoryPageReader {
    rows: RwLock<Vec<Row>>,
    page_size: u64,
    pages_read: Mutex<Vec<u64>>,
}

impl InMemoryPageReader {
    /// Creates a reader over the given rows.
    #[must_use]
    pub fn new(rows: Vec<Row>, page_size: u64) -> Self {
        Self {
            rows: RwLock::new(rows),
            page_size,
            pages_read: Mutex::new(Vec::new()),
        }
    }

    /// Number of `read_page` calls observed.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.pages_read.lock().map(|pages| pages.len()).unwrap_or(0)
    }

    /// The pages requested, in call order.
    #[must_use]
    pub fn pages_read(&self) -> Vec<u64> {
        self.pages_read
            .lock()
            .map(|pages| pages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PageReader for InMemoryPageReader {
    async fn read_page(&self, page: u64) -> Result<Vec<Row>> {
        self.pages_read
            .lock()
            .map_err(|_| Error::store("lock poisoned"))?
            .push(page);

        let rows = self.rows.read().map_err(|_| Error::store("lock poisoned"))?;
        let start = usize::try_from(page * self.page_size).unwrap_or(usize::MAX);
        let end = usize::try_from((page + 1) * self.page_size).unwrap_or(usize::MAX);

        if start >= rows.len() {
            return Ok(Vec::new());
        }
        Ok(rows[start..end.min(rows.len())].to_vec())
    }

    async fn total_rows(&self) -> Result<u64> {
        let rows = self.rows.read().map_err(|_| Error::store("lock poisoned"))?;
        Ok(rows.len() as u64)
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }
}
