//! Storage manager for NimbusDB
//!
//! Mediates all file I/O for the engine: owns the data directory and an
//! open-file cache keyed by relative filename. Pages are read and written
//! synchronously; there is no buffer pool.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::error::Result;
use crate::storage::page::{PageBuf, PAGE_SIZE};

/// I/O statistics, updated on every page operation
#[derive(Debug, Default)]
pub struct StorageStats {
    pub files_opened: AtomicU64,
    pub pages_read: AtomicU64,
    pub pages_written: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

/// Storage manager
#[derive(Debug)]
pub struct StorageManager {
    /// Directory where data files are stored
    data_dir: PathBuf,
    /// Open file handles by relative filename
    open_files: Mutex<HashMap<String, File>>,
    /// I/O counters
    stats: StorageStats,
}

impl StorageManager {
    /// Create a storage manager over a data directory, creating the
    /// directory if it is missing.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            std::fs::create_dir_all(&data_dir)?;
        }
        Ok(Self {
            data_dir,
            open_files: Mutex::new(HashMap::new()),
            stats: StorageStats::default(),
        })
    }

    /// The data directory this manager owns
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Open a file, creating it if absent. Idempotent.
    ///
    /// Files are opened read+write, never append: pages are rewritten in
    /// place at arbitrary offsets.
    pub fn open_file(&self, filename: &str) -> Result<()> {
        let mut open_files = self.open_files.lock().unwrap();
        self.ensure_open(&mut open_files, filename)?;
        Ok(())
    }

    /// Close and forget a file handle. Returns false if it was not open.
    pub fn close_file(&self, filename: &str) -> bool {
        let mut open_files = self.open_files.lock().unwrap();
        open_files.remove(filename).is_some()
    }

    /// Read one page. Reads past end-of-file zero-fill the buffer and
    /// succeed, which is how callers allocate fresh pages.
    pub fn read_page(&self, filename: &str, page_num: u32, buf: &mut PageBuf) -> Result<()> {
        let mut open_files = self.open_files.lock().unwrap();
        let file = self.ensure_open(&mut open_files, filename)?;

        file.seek(SeekFrom::Start(page_num as u64 * PAGE_SIZE as u64))?;

        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf[filled..].fill(0);

        self.stats.pages_read.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Write one page and flush it to the OS
    pub fn write_page(&self, filename: &str, page_num: u32, buf: &PageBuf) -> Result<()> {
        let mut open_files = self.open_files.lock().unwrap();
        let file = self.ensure_open(&mut open_files, filename)?;

        file.seek(SeekFrom::Start(page_num as u64 * PAGE_SIZE as u64))?;
        file.write_all(buf)?;
        file.flush()?;

        self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Number of whole pages currently on disk for a file
    pub fn page_count(&self, filename: &str) -> Result<u64> {
        let mut open_files = self.open_files.lock().unwrap();
        let file = self.ensure_open(&mut open_files, filename)?;
        let len = file.metadata()?.len();
        Ok(len.div_ceil(PAGE_SIZE as u64))
    }

    /// Close a file and remove it from disk. Missing files are fine.
    pub fn delete_file(&self, filename: &str) -> Result<()> {
        self.close_file(filename);
        let path = self.data_dir.join(filename);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// I/O counters
    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }

    fn ensure_open<'a>(
        &self,
        open_files: &'a mut HashMap<String, File>,
        filename: &str,
    ) -> Result<&'a mut File> {
        if !open_files.contains_key(filename) {
            let path = self.data_dir.join(filename);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            debug!(file = %path.display(), "opened data file");
            self.stats.files_opened.fetch_add(1, Ordering::Relaxed);
            open_files.insert(filename.to_string(), file);
        }
        Ok(open_files.get_mut(filename).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::new_page_buf;

    fn setup() -> (tempfile::TempDir, StorageManager) {
        let dir = tempfile::tempdir().unwrap();
        let sm = StorageManager::new(dir.path()).unwrap();
        (dir, sm)
    }

    #[test]
    fn test_read_past_eof_zero_fills() {
        let (_dir, sm) = setup();
        let mut buf = new_page_buf();
        buf.fill(0xFF);

        sm.read_page("t.heap", 7, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_then_read_is_identity() {
        let (_dir, sm) = setup();
        let mut out = new_page_buf();
        for (i, b) in out.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        sm.write_page("t.heap", 3, &out).unwrap();

        let mut back = new_page_buf();
        sm.read_page("t.heap", 3, &mut back).unwrap();
        assert_eq!(&out[..], &back[..]);

        // pages before the written one read as zeros
        sm.read_page("t.heap", 1, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_page_count_and_delete() {
        let (_dir, sm) = setup();
        let buf = new_page_buf();

        assert_eq!(sm.page_count("t.heap").unwrap(), 0);
        sm.write_page("t.heap", 0, &buf).unwrap();
        sm.write_page("t.heap", 1, &buf).unwrap();
        assert_eq!(sm.page_count("t.heap").unwrap(), 2);

        sm.delete_file("t.heap").unwrap();
        assert_eq!(sm.page_count("t.heap").unwrap(), 0);
    }

    #[test]
    fn test_stats_counters() {
        let (_dir, sm) = setup();
        let mut buf = new_page_buf();
        sm.write_page("t.heap", 0, &buf).unwrap();
        sm.read_page("t.heap", 0, &mut buf).unwrap();

        assert_eq!(sm.stats().pages_written.load(Ordering::Relaxed), 1);
        assert_eq!(sm.stats().pages_read.load(Ordering::Relaxed), 1);
        assert_eq!(sm.stats().files_opened.load(Ordering::Relaxed), 1);
    }
}
