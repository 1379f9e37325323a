//! Heap table storage for NimbusDB
//!
//! A heap table stores tuples of one fixed schema in a paged file named
//! `{table}.heap`. Rows are addressed by a record id (page, slot); deletes
//! tombstone the slot and indexes are never reused, so surviving record ids
//! stay stable.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::Schema;
use crate::error::{Error, Result};
use crate::storage::disk::StorageManager;
use crate::storage::page::{new_page_buf, HeapPage, PageBuf};
use crate::storage::tuple::Tuple;

/// A record identifier: (page number, slot number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub page_num: u32,
    pub slot_num: u16,
}

impl RecordId {
    /// Sentinel for "no record". Only used where a record id is optional;
    /// page 0 slot 0 is still handed out for the first row of a table.
    pub const NULL: RecordId = RecordId {
        page_num: 0,
        slot_num: 0,
    };

    pub fn new(page_num: u32, slot_num: u16) -> Self {
        Self { page_num, slot_num }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.page_num, self.slot_num)
    }
}

/// Heap file for one table
#[derive(Debug, Clone)]
pub struct HeapTable {
    name: String,
    filename: String,
    schema: Schema,
    storage: Arc<StorageManager>,
}

impl HeapTable {
    /// Bind a heap table to its file. No I/O happens until an operation runs.
    pub fn new(name: impl Into<String>, schema: Schema, storage: Arc<StorageManager>) -> Self {
        let name = name.into();
        let filename = format!("{}.heap", name);
        Self {
            name,
            filename,
            schema,
            storage,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Create the heap file and write an initialized page 0
    pub fn create(&self) -> Result<()> {
        self.storage.open_file(&self.filename)?;
        let mut buf = new_page_buf();
        HeapPage::new(&mut buf).init();
        self.storage.write_page(&self.filename, 0, &buf)?;
        debug!(table = %self.name, "created heap file");
        Ok(())
    }

    /// Close the heap file. Removing it from disk is the executor's job.
    pub fn drop_table(&self) -> Result<()> {
        self.storage.close_file(&self.filename);
        debug!(table = %self.name, "closed heap file");
        Ok(())
    }

    /// Insert a tuple, returning its record id.
    ///
    /// Walks pages from the start looking for room; a page read past
    /// end-of-file comes back zeroed, gets initialized here, and becomes the
    /// new last page. This loop therefore always terminates.
    pub fn insert(&self, tuple: &Tuple) -> Result<RecordId> {
        let payload = tuple.to_bytes();
        let mut buf = new_page_buf();

        let mut page_num = 0u32;
        loop {
            self.storage.read_page(&self.filename, page_num, &mut buf)?;
            let mut page = HeapPage::new(&mut buf);
            let fresh = !page.is_initialized();
            if fresh {
                page.init();
                if !page.can_fit(payload.len()) {
                    return Err(Error::TupleTooLarge(payload.len()));
                }
            }
            if let Some(slot_num) = page.append(&payload) {
                self.storage.write_page(&self.filename, page_num, &buf)?;
                return Ok(RecordId::new(page_num, slot_num));
            }
            page_num += 1;
        }
    }

    /// Fetch a tuple by record id. Returns None for uninitialized pages,
    /// out-of-range slots and tombstones. Fields are coerced to the declared
    /// column types on the way out.
    pub fn get(&self, rid: RecordId) -> Result<Option<Tuple>> {
        let mut buf = new_page_buf();
        self.storage
            .read_page(&self.filename, rid.page_num, &mut buf)?;
        let page = HeapPage::new(&mut buf);
        if !page.is_initialized() {
            return Ok(None);
        }
        match page.payload(rid.slot_num) {
            Some(bytes) => {
                let tuple = Tuple::from_bytes(bytes)?;
                Ok(Some(self.coerce_to_schema(tuple)?))
            }
            None => Ok(None),
        }
    }

    /// Tombstone a record. Returns false when there was nothing to remove.
    pub fn remove(&self, rid: RecordId) -> Result<bool> {
        let mut buf = new_page_buf();
        self.storage
            .read_page(&self.filename, rid.page_num, &mut buf)?;
        let mut page = HeapPage::new(&mut buf);
        if !page.is_initialized() || !page.tombstone(rid.slot_num) {
            return Ok(false);
        }
        self.storage.write_page(&self.filename, rid.page_num, &buf)?;
        Ok(true)
    }

    /// Replace a record: tombstone the old slot and insert the new tuple.
    /// The returned record id may differ from the input.
    pub fn update(&self, rid: RecordId, tuple: &Tuple) -> Result<RecordId> {
        if !self.remove(rid)? {
            return Err(Error::StorageError(format!(
                "no tuple at {} in '{}'",
                rid, self.name
            )));
        }
        self.insert(tuple)
    }

    /// Scan live tuples in insertion order
    pub fn scan(&self) -> HeapScan {
        HeapScan {
            storage: self.storage.clone(),
            filename: self.filename.clone(),
            schema: self.schema.clone(),
            buf: new_page_buf(),
            page_num: 0,
            slot_num: 0,
            loaded: false,
            done: false,
        }
    }

    /// Count live tuples by walking every page
    pub fn tuple_count(&self) -> Result<u64> {
        let mut count = 0u64;
        let mut buf = new_page_buf();
        let mut page_num = 0u32;
        loop {
            self.storage.read_page(&self.filename, page_num, &mut buf)?;
            let page = HeapPage::new(&mut buf);
            if !page.is_initialized() {
                return Ok(count);
            }
            count += page.live_slots() as u64;
            page_num += 1;
        }
    }

    fn coerce_to_schema(&self, tuple: Tuple) -> Result<Tuple> {
        if tuple.len() != self.schema.len() {
            return Err(Error::StorageError(format!(
                "tuple has {} fields, schema of '{}' has {}",
                tuple.len(),
                self.name,
                self.schema.len()
            )));
        }
        let values = tuple
            .into_values()
            .into_iter()
            .zip(self.schema.columns())
            .map(|(v, col)| v.coerce(&col.data_type))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tuple::new(values))
    }
}

/// Pull cursor over the live tuples of a heap file.
///
/// Holds a single page buffer; pages are visited in order and the scan
/// terminates at the first uninitialized page.
pub struct HeapScan {
    storage: Arc<StorageManager>,
    filename: String,
    schema: Schema,
    buf: Box<PageBuf>,
    page_num: u32,
    slot_num: u16,
    loaded: bool,
    done: bool,
}

impl HeapScan {
    /// Advance to the next live tuple, or None at end of table
    pub fn next(&mut self) -> Result<Option<(RecordId, Tuple)>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if !self.loaded {
                self.storage
                    .read_page(&self.filename, self.page_num, &mut self.buf)?;
                self.loaded = true;
            }
            let page = HeapPage::new(&mut self.buf);
            if !page.is_initialized() {
                self.done = true;
                return Ok(None);
            }

            while self.slot_num < page.num_slots() {
                let slot = self.slot_num;
                self.slot_num += 1;
                if let Some(bytes) = page.payload(slot) {
                    let tuple = Tuple::from_bytes(bytes)?;
                    let values = tuple
                        .into_values()
                        .into_iter()
                        .zip(self.schema.columns())
                        .map(|(v, col)| v.coerce(&col.data_type))
                        .collect::<Result<Vec<_>>>()?;
                    return Ok(Some((
                        RecordId::new(self.page_num, slot),
                        Tuple::new(values),
                    )));
                }
            }

            self.page_num += 1;
            self.slot_num = 0;
            self.loaded = false;
        }
    }
}
