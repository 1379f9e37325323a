//! B+ tree index for NimbusDB
//!
//! An ordered key to record-id index stored in its own paged file. The root
//! lives at page 0 for the lifetime of the tree; splitting the root moves
//! its halves to fresh pages and rewrites page 0 one level taller. Leaves
//! are chained through `right_sibling` for range scans.
//!
//! Node page layout:
//!
//! ```text
//! magic         : u32   0x42545245 ("BTRE")
//! version       : u32
//! page_type     : u16   0 = root (internal), 1 = internal, 2 = leaf
//! num_keys      : u16
//! parent        : u32
//! right_sibling : i32   (-1 terminates the leaf chain)
//! lsn           : u64
//! entries...
//! ```
//!
//! Leaf entries are (key, rid) pairs sorted by key with the record id as the
//! tie break, so equal keys keep their insertion order. Internal entries are
//! child0 followed by (separator, child) pairs.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::catalog::DataType;
use crate::error::{Error, Result};
use crate::storage::disk::StorageManager;
use crate::storage::heap::RecordId;
use crate::storage::page::{new_page_buf, PageBuf, PAGE_SIZE};
use crate::storage::tuple::Value;

/// Node page magic, "BTRE"
pub const BTREE_MAGIC: u32 = 0x4254_5245;

/// Node format version
pub const BTREE_VERSION: u32 = 1;

/// Maximum entries per node before a split
pub const BTREE_ORDER: usize = 128;

/// Largest accepted key encoding. Anything bigger could defeat splitting.
const MAX_KEY_SIZE: usize = 1024;

const NODE_HEADER_SIZE: usize = 24;

const PAGE_TYPE_ROOT: u16 = 0;
const PAGE_TYPE_INTERNAL: u16 = 1;
const PAGE_TYPE_LEAF: u16 = 2;

/// Decoded node, either a leaf or an internal node
#[derive(Debug, Clone)]
struct Node {
    is_leaf: bool,
    parent: u32,
    right_sibling: i32,
    keys: Vec<Value>,
    /// Leaf payloads, one per key
    rids: Vec<RecordId>,
    /// Internal children, keys.len() + 1 entries
    children: Vec<u32>,
}

impl Node {
    fn leaf() -> Self {
        Self {
            is_leaf: true,
            parent: 0,
            right_sibling: -1,
            keys: Vec::new(),
            rids: Vec::new(),
            children: Vec::new(),
        }
    }

    fn internal(keys: Vec<Value>, children: Vec<u32>) -> Self {
        Self {
            is_leaf: false,
            parent: 0,
            right_sibling: -1,
            keys,
            rids: Vec::new(),
            children,
        }
    }

    fn encoded_len(&self) -> usize {
        let keys: usize = self.keys.iter().map(Value::encoded_len).sum();
        if self.is_leaf {
            NODE_HEADER_SIZE + keys + self.keys.len() * 6
        } else {
            NODE_HEADER_SIZE + keys + 4 + self.keys.len() * 4
        }
    }

    fn overflows(&self) -> bool {
        self.keys.len() > BTREE_ORDER || self.encoded_len() > PAGE_SIZE
    }

    fn encode(&self, is_root: bool, buf: &mut PageBuf) {
        buf.fill(0);
        let page_type = if self.is_leaf {
            PAGE_TYPE_LEAF
        } else if is_root {
            PAGE_TYPE_ROOT
        } else {
            PAGE_TYPE_INTERNAL
        };
        buf[0..4].copy_from_slice(&BTREE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&BTREE_VERSION.to_le_bytes());
        buf[8..10].copy_from_slice(&page_type.to_le_bytes());
        buf[10..12].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        buf[12..16].copy_from_slice(&self.parent.to_le_bytes());
        buf[16..20].copy_from_slice(&self.right_sibling.to_le_bytes());
        // lsn stays 0, crash recovery is outside this engine

        let mut bytes = Vec::with_capacity(self.encoded_len() - NODE_HEADER_SIZE);
        if self.is_leaf {
            for (key, rid) in self.keys.iter().zip(&self.rids) {
                key.encode(&mut bytes);
                bytes.extend_from_slice(&rid.page_num.to_le_bytes());
                bytes.extend_from_slice(&rid.slot_num.to_le_bytes());
            }
        } else {
            bytes.extend_from_slice(&self.children[0].to_le_bytes());
            for (key, child) in self.keys.iter().zip(self.children.iter().skip(1)) {
                key.encode(&mut bytes);
                bytes.extend_from_slice(&child.to_le_bytes());
            }
        }
        buf[NODE_HEADER_SIZE..NODE_HEADER_SIZE + bytes.len()].copy_from_slice(&bytes);
    }

    fn decode(page_num: u32, buf: &PageBuf) -> Result<Node> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != BTREE_MAGIC {
            return Err(Error::CorruptedPage(page_num));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != BTREE_VERSION {
            return Err(Error::CorruptedPage(page_num));
        }
        let page_type = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let num_keys = u16::from_le_bytes(buf[10..12].try_into().unwrap()) as usize;
        let parent = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let right_sibling = i32::from_le_bytes(buf[16..20].try_into().unwrap());

        let is_leaf = page_type == PAGE_TYPE_LEAF;
        let mut offset = NODE_HEADER_SIZE;
        let take_u32 = |buf: &PageBuf, offset: &mut usize| -> Result<u32> {
            let slice = buf
                .get(*offset..*offset + 4)
                .ok_or(Error::CorruptedPage(page_num))?;
            *offset += 4;
            Ok(u32::from_le_bytes(slice.try_into().unwrap()))
        };
        let take_u16 = |buf: &PageBuf, offset: &mut usize| -> Result<u16> {
            let slice = buf
                .get(*offset..*offset + 2)
                .ok_or(Error::CorruptedPage(page_num))?;
            *offset += 2;
            Ok(u16::from_le_bytes(slice.try_into().unwrap()))
        };

        let mut node = if is_leaf { Node::leaf() } else { Node::internal(Vec::new(), Vec::new()) };
        node.parent = parent;
        node.right_sibling = right_sibling;

        if is_leaf {
            for _ in 0..num_keys {
                node.keys.push(Value::decode(&buf[..], &mut offset)?);
                let page = take_u32(buf, &mut offset)?;
                let slot = take_u16(buf, &mut offset)?;
                node.rids.push(RecordId::new(page, slot));
            }
        } else {
            node.children.push(take_u32(buf, &mut offset)?);
            for _ in 0..num_keys {
                node.keys.push(Value::decode(&buf[..], &mut offset)?);
                node.children.push(take_u32(buf, &mut offset)?);
            }
        }
        Ok(node)
    }
}

/// B+ tree index over a single key column
#[derive(Debug, Clone)]
pub struct BTreeIndex {
    filename: String,
    key_type: DataType,
    storage: Arc<StorageManager>,
}

impl BTreeIndex {
    /// Bind an index to its file. No I/O happens until an operation runs.
    pub fn new(
        filename: impl Into<String>,
        key_type: DataType,
        storage: Arc<StorageManager>,
    ) -> Self {
        Self {
            filename: filename.into(),
            key_type,
            storage,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn key_type(&self) -> &DataType {
        &self.key_type
    }

    /// Create the index file with an empty root leaf
    pub fn create(&self) -> Result<()> {
        self.storage.open_file(&self.filename)?;
        self.write_node(0, &Node::leaf())?;
        debug!(index = %self.filename, "created index file");
        Ok(())
    }

    /// Insert a (key, rid) entry. Duplicate keys are allowed and keep their
    /// insertion order through the rid tie break.
    pub fn insert(&self, key: &Value, rid: RecordId) -> Result<()> {
        let key = self.check_key(key)?;
        if key.encoded_len() > MAX_KEY_SIZE {
            return Err(Error::StorageError(format!(
                "index key of {} bytes is too large",
                key.encoded_len()
            )));
        }

        // descend to the target leaf, remembering the internal path
        let mut path: Vec<(u32, Node)> = Vec::new();
        let mut page_num = 0u32;
        let mut node = self.read_node(0)?;
        while !node.is_leaf {
            let idx = upper_bound(&node.keys, &key);
            let child = node.children[idx];
            path.push((page_num, node));
            page_num = child;
            node = self.read_node(page_num)?;
        }

        let pos = upper_bound(&node.keys, &key);
        node.keys.insert(pos, key);
        node.rids.insert(pos, rid);

        if !node.overflows() {
            return self.write_node(page_num, &node);
        }
        self.split_leaf(page_num, node, path)
    }

    /// Remove the first entry matching both key and rid. Leaves are never
    /// rebalanced or merged.
    pub fn delete(&self, key: &Value, rid: RecordId) -> Result<bool> {
        let key = self.check_key(key)?;
        let (mut page_num, mut node) = self.descend_to_leaf(Some(&key))?;

        loop {
            let start = lower_bound(&node.keys, &key);
            for i in start..node.keys.len() {
                match node.keys[i].compare(&key) {
                    Some(Ordering::Equal) => {
                        if node.rids[i] == rid {
                            node.keys.remove(i);
                            node.rids.remove(i);
                            self.write_node(page_num, &node)?;
                            return Ok(true);
                        }
                    }
                    Some(Ordering::Greater) => return Ok(false),
                    _ => {}
                }
            }
            if node.right_sibling < 0 {
                return Ok(false);
            }
            page_num = node.right_sibling as u32;
            node = self.read_node(page_num)?;
        }
    }

    /// All record ids stored under a key, in insertion order
    pub fn search(&self, key: &Value) -> Result<Vec<RecordId>> {
        let key = self.check_key(key)?;
        let mut scan = self.scan(Some(key.clone()), Some(key))?;
        let mut rids = Vec::new();
        while let Some((_, rid)) = scan.next()? {
            rids.push(rid);
        }
        Ok(rids)
    }

    /// All entries with min <= key <= max, in key order
    pub fn range_search(
        &self,
        min: Option<&Value>,
        max: Option<&Value>,
    ) -> Result<Vec<(Value, RecordId)>> {
        let mut scan = self.scan(min.cloned(), max.cloned())?;
        let mut entries = Vec::new();
        while let Some(entry) = scan.next()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Streaming cursor over the leaf chain for min <= key <= max
    pub fn scan(&self, min: Option<Value>, max: Option<Value>) -> Result<BTreeScan> {
        let min = match min {
            Some(v) => Some(self.check_key(&v)?),
            None => None,
        };
        let max = match max {
            Some(v) => Some(self.check_key(&v)?),
            None => None,
        };
        let (page_num, node) = self.descend_to_leaf(min.as_ref())?;
        Ok(BTreeScan {
            index: self.clone(),
            node: Some(node),
            page_num,
            pos: 0,
            min,
            max,
            done: false,
        })
    }

    /// Coerce a query key to the declared key type
    fn check_key(&self, key: &Value) -> Result<Value> {
        key.coerce(&self.key_type)
    }

    /// Walk down to the leftmost leaf that could hold `key` (or the first
    /// leaf when key is None)
    fn descend_to_leaf(&self, key: Option<&Value>) -> Result<(u32, Node)> {
        let mut page_num = 0u32;
        let mut node = self.read_node(0)?;
        while !node.is_leaf {
            let idx = match key {
                Some(k) => lower_bound(&node.keys, k),
                None => 0,
            };
            page_num = node.children[idx];
            node = self.read_node(page_num)?;
        }
        Ok((page_num, node))
    }

    fn split_leaf(&self, page_num: u32, mut node: Node, path: Vec<(u32, Node)>) -> Result<()> {
        let mid = node.keys.len() / 2;
        let mut right = Node::leaf();
        right.keys = node.keys.split_off(mid);
        right.rids = node.rids.split_off(mid);
        right.right_sibling = node.right_sibling;
        let separator = right.keys[0].clone();

        if path.is_empty() {
            // root leaf split: both halves move to fresh pages and page 0
            // becomes an internal root
            let left_page = self.allocate_page()?;
            let right_page = left_page + 1;
            node.right_sibling = right_page as i32;
            node.parent = 0;
            right.parent = 0;
            self.write_node(left_page, &node)?;
            self.write_node(right_page, &right)?;

            let root = Node::internal(vec![separator], vec![left_page, right_page]);
            return self.write_node(0, &root);
        }

        let right_page = self.allocate_page()?;
        node.right_sibling = right_page as i32;
        right.parent = path.last().unwrap().0;
        node.parent = right.parent;
        self.write_node(page_num, &node)?;
        self.write_node(right_page, &right)?;
        self.insert_into_parent(path, separator, right_page)
    }

    fn insert_into_parent(
        &self,
        mut path: Vec<(u32, Node)>,
        separator: Value,
        new_child: u32,
    ) -> Result<()> {
        let (page_num, mut node) = path.pop().unwrap();
        let idx = upper_bound(&node.keys, &separator);
        node.keys.insert(idx, separator);
        node.children.insert(idx + 1, new_child);

        if !node.overflows() {
            return self.write_node(page_num, &node);
        }

        let mid = node.keys.len() / 2;
        let promoted = node.keys[mid].clone();
        let right_keys = node.keys.split_off(mid + 1);
        node.keys.pop();
        let right_children = node.children.split_off(mid + 1);
        let mut right = Node::internal(right_keys, right_children);

        if path.is_empty() {
            debug_assert_eq!(page_num, 0);
            let left_page = self.allocate_page()?;
            let right_page = left_page + 1;
            node.parent = 0;
            right.parent = 0;
            self.write_node(left_page, &node)?;
            self.write_node(right_page, &right)?;
            self.reparent(&node.children, left_page)?;
            self.reparent(&right.children, right_page)?;

            let root = Node::internal(vec![promoted], vec![left_page, right_page]);
            return self.write_node(0, &root);
        }

        let right_page = self.allocate_page()?;
        right.parent = path.last().unwrap().0;
        node.parent = right.parent;
        self.write_node(page_num, &node)?;
        self.write_node(right_page, &right)?;
        self.reparent(&right.children, right_page)?;
        self.insert_into_parent(path, promoted, right_page)
    }

    /// Rewrite the parent field of moved children
    fn reparent(&self, children: &[u32], parent: u32) -> Result<()> {
        for &child in children {
            let mut node = self.read_node(child)?;
            node.parent = parent;
            self.write_node(child, &node)?;
        }
        Ok(())
    }

    fn allocate_page(&self) -> Result<u32> {
        Ok(self.storage.page_count(&self.filename)? as u32)
    }

    fn read_node(&self, page_num: u32) -> Result<Node> {
        let mut buf = new_page_buf();
        self.storage.read_page(&self.filename, page_num, &mut buf)?;
        Node::decode(page_num, &buf)
    }

    fn write_node(&self, page_num: u32, node: &Node) -> Result<()> {
        let mut buf = new_page_buf();
        node.encode(page_num == 0 && !node.is_leaf, &mut buf);
        self.storage.write_page(&self.filename, page_num, &buf)
    }
}

/// First index whose key is >= `key`
fn lower_bound(keys: &[Value], key: &Value) -> usize {
    keys.partition_point(|k| matches!(k.compare(key), Some(Ordering::Less)))
}

/// First index whose key is > `key`
fn upper_bound(keys: &[Value], key: &Value) -> usize {
    keys.partition_point(|k| {
        matches!(k.compare(key), Some(Ordering::Less) | Some(Ordering::Equal))
    })
}

/// Streaming cursor over the leaf chain
pub struct BTreeScan {
    index: BTreeIndex,
    node: Option<Node>,
    page_num: u32,
    pos: usize,
    min: Option<Value>,
    max: Option<Value>,
    done: bool,
}

impl BTreeScan {
    /// Next entry within bounds, or None when the range is exhausted
    pub fn next(&mut self) -> Result<Option<(Value, RecordId)>> {
        loop {
            if self.done {
                return Ok(None);
            }
            let node = match self.node.take() {
                Some(n) => n,
                None => self.index.read_node(self.page_num)?,
            };

            while self.pos < node.keys.len() {
                let i = self.pos;
                self.pos += 1;
                let key = &node.keys[i];
                if let Some(min) = &self.min {
                    if matches!(key.compare(min), Some(Ordering::Less)) {
                        continue;
                    }
                }
                if let Some(max) = &self.max {
                    if matches!(key.compare(max), Some(Ordering::Greater)) {
                        self.done = true;
                        return Ok(None);
                    }
                }
                let entry = (node.keys[i].clone(), node.rids[i]);
                self.node = Some(node);
                return Ok(Some(entry));
            }

            if node.right_sibling < 0 {
                self.done = true;
                return Ok(None);
            }
            self.page_num = node.right_sibling as u32;
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(key_type: DataType) -> (tempfile::TempDir, BTreeIndex) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageManager::new(dir.path()).unwrap());
        let index = BTreeIndex::new("t_idx.idx", key_type, storage);
        index.create().unwrap();
        (dir, index)
    }

    fn rid(page: u32, slot: u16) -> RecordId {
        RecordId::new(page, slot)
    }

    #[test]
    fn test_insert_and_search() {
        let (_dir, index) = setup(DataType::Int64);

        for i in [5i64, 3, 7, 1] {
            index.insert(&Value::Int64(i), rid(0, i as u16)).unwrap();
        }

        assert_eq!(index.search(&Value::Int64(5)).unwrap(), vec![rid(0, 5)]);
        assert_eq!(index.search(&Value::Int64(1)).unwrap(), vec![rid(0, 1)]);
        assert!(index.search(&Value::Int64(99)).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_keys_keep_insertion_order() {
        let (_dir, index) = setup(DataType::Int64);

        index.insert(&Value::Int64(10), rid(1, 1)).unwrap();
        index.insert(&Value::Int64(20), rid(1, 2)).unwrap();
        index.insert(&Value::Int64(10), rid(2, 1)).unwrap();

        assert_eq!(
            index.search(&Value::Int64(10)).unwrap(),
            vec![rid(1, 1), rid(2, 1)]
        );
        assert_eq!(index.search(&Value::Int64(20)).unwrap(), vec![rid(1, 2)]);
    }

    #[test]
    fn test_splits_preserve_sorted_scan() {
        let (_dir, index) = setup(DataType::Int64);

        // enough entries to split the root leaf and at least one child
        let mut keys: Vec<i64> = (0..500).collect();
        // shuffle deterministically
        keys.sort_by_key(|k| (k * 2654435761i64) % 1000);
        for &k in &keys {
            index.insert(&Value::Int64(k), rid(0, (k % 32) as u16)).unwrap();
        }

        let entries = index.range_search(None, None).unwrap();
        assert_eq!(entries.len(), 500);
        let scanned: Vec<i64> = entries
            .iter()
            .map(|(k, _)| k.as_i64().unwrap())
            .collect();
        let mut sorted = scanned.clone();
        sorted.sort();
        assert_eq!(scanned, sorted);

        // every key still findable after the splits
        for k in 0..500 {
            assert_eq!(index.search(&Value::Int64(k)).unwrap().len(), 1, "key {}", k);
        }
    }

    #[test]
    fn test_range_search_bounds() {
        let (_dir, index) = setup(DataType::Int64);
        for k in [1i64, 3, 5, 7, 9, 11] {
            index.insert(&Value::Int64(k), rid(0, k as u16)).unwrap();
        }

        let entries = index
            .range_search(Some(&Value::Int64(5)), Some(&Value::Int64(9)))
            .unwrap();
        let keys: Vec<i64> = entries.iter().map(|(k, _)| k.as_i64().unwrap()).collect();
        assert_eq!(keys, vec![5, 7, 9]);

        let open_start = index.range_search(None, Some(&Value::Int64(3))).unwrap();
        assert_eq!(open_start.len(), 2);

        let open_end = index.range_search(Some(&Value::Int64(9)), None).unwrap();
        assert_eq!(open_end.len(), 2);
    }

    #[test]
    fn test_delete_specific_entry() {
        let (_dir, index) = setup(DataType::Int64);
        index.insert(&Value::Int64(10), rid(1, 1)).unwrap();
        index.insert(&Value::Int64(10), rid(2, 1)).unwrap();

        assert!(index.delete(&Value::Int64(10), rid(1, 1)).unwrap());
        assert_eq!(index.search(&Value::Int64(10)).unwrap(), vec![rid(2, 1)]);
        // already gone
        assert!(!index.delete(&Value::Int64(10), rid(1, 1)).unwrap());
        // wrong rid
        assert!(!index.delete(&Value::Int64(10), rid(9, 9)).unwrap());
    }

    #[test]
    fn test_text_keys() {
        let (_dir, index) = setup(DataType::Text);
        for (i, name) in ["mango", "apple", "peach", "banana"].iter().enumerate() {
            index
                .insert(&Value::Text(name.to_string()), rid(0, i as u16))
                .unwrap();
        }

        let entries = index.range_search(None, None).unwrap();
        let keys: Vec<String> = entries
            .iter()
            .map(|(k, _)| k.as_text().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["apple", "banana", "mango", "peach"]);
    }

    #[test]
    fn test_key_type_mismatch() {
        let (_dir, index) = setup(DataType::Int64);
        assert!(index.insert(&Value::Text("x".into()), rid(0, 0)).is_err());
        // a narrower integer coerces
        index.insert(&Value::Int32(7), rid(0, 0)).unwrap();
        assert_eq!(index.search(&Value::Int64(7)).unwrap().len(), 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Arc::new(StorageManager::new(dir.path()).unwrap());
            let index = BTreeIndex::new("p.idx", DataType::Int64, storage);
            index.create().unwrap();
            for k in 0..200 {
                index.insert(&Value::Int64(k), rid(0, (k % 32) as u16)).unwrap();
            }
        }
        {
            let storage = Arc::new(StorageManager::new(dir.path()).unwrap());
            let index = BTreeIndex::new("p.idx", DataType::Int64, storage);
            for k in 0..200 {
                assert_eq!(index.search(&Value::Int64(k)).unwrap().len(), 1);
            }
        }
    }
}
