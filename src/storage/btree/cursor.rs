//! Range cursors over B+tree leaves
//!
//! A cursor copies the qualifying entries of one leaf at a time and holds no
//! latch while the caller consumes them. Moving to a sibling validates the
//! back link (`next.prev == current` forward, `prev.next == current` in
//! reverse); if a concurrent split or merge broke it, the cursor re-descends
//! from the last key it returned.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use super::node::Node;
use super::BTree;
use crate::error::Result;
use crate::storage::page::{PageId, INVALID_PAGE_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Where a cursor stopped. A cursor can be resumed from it; the leaf LSN
/// tells whether the leaf changed in the meantime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorPosition {
    pub leaf_page_id: PageId,
    pub leaf_lsn: u64,
    /// In-leaf index of the next entry to return
    pub offset: usize,
    /// Last key returned, used to re-seek when the leaf changed
    pub last_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
struct LeafInfo {
    page_id: PageId,
    lsn: u64,
    prev: PageId,
    next: PageId,
    /// Whether the range may continue past this leaf
    more: bool,
}

/// Lazy iterator over `(key, value)` pairs in a key range
pub struct RangeCursor {
    tree: Arc<BTree>,
    lo: Bound<Vec<u8>>,
    hi: Bound<Vec<u8>>,
    dir: Direction,
    buffer: VecDeque<(usize, Vec<u8>, Vec<u8>)>,
    leaf: Option<LeafInfo>,
    last_key: Option<Vec<u8>>,
    resume_at: Option<CursorPosition>,
    started: bool,
    done: bool,
}

fn above_lo(key: &[u8], lo: &Bound<Vec<u8>>) -> bool {
    match lo {
        Bound::Unbounded => true,
        Bound::Included(b) => key >= b.as_slice(),
        Bound::Excluded(b) => key > b.as_slice(),
    }
}

fn below_hi(key: &[u8], hi: &Bound<Vec<u8>>) -> bool {
    match hi {
        Bound::Unbounded => true,
        Bound::Included(b) => key <= b.as_slice(),
        Bound::Excluded(b) => key < b.as_slice(),
    }
}

impl RangeCursor {
    pub(super) fn new(tree: Arc<BTree>, lo: Bound<Vec<u8>>, hi: Bound<Vec<u8>>, dir: Direction) -> Self {
        Self {
            tree,
            lo,
            hi,
            dir,
            buffer: VecDeque::new(),
            leaf: None,
            last_key: None,
            resume_at: None,
            started: false,
            done: false,
        }
    }

    /// Continue a scan from a saved position.
    pub fn resume(
        tree: Arc<BTree>,
        lo: Bound<Vec<u8>>,
        hi: Bound<Vec<u8>>,
        dir: Direction,
        position: CursorPosition,
    ) -> Self {
        let mut cursor = Self::new(tree, lo, hi, dir);
        cursor.last_key = position.last_key.clone();
        cursor.resume_at = Some(position);
        cursor
    }

    /// Position of the next entry, if the cursor is inside a leaf.
    pub fn position(&self) -> Option<CursorPosition> {
        let leaf = self.leaf?;
        let offset = match self.buffer.front() {
            Some((idx, _, _)) => *idx,
            None => return None,
        };
        Some(CursorPosition {
            leaf_page_id: leaf.page_id,
            leaf_lsn: leaf.lsn,
            offset,
            last_key: self.last_key.clone(),
        })
    }

    fn in_range(&self, key: &[u8]) -> bool {
        if !above_lo(key, &self.lo) || !below_hi(key, &self.hi) {
            return false;
        }
        match (&self.last_key, self.dir) {
            (None, _) => true,
            (Some(last), Direction::Forward) => key > last.as_slice(),
            (Some(last), Direction::Reverse) => key < last.as_slice(),
        }
    }

    /// Copy qualifying entries of `node`, starting at `from` when given.
    fn load(&mut self, page_id: PageId, lsn: u64, node: Node, from: Option<usize>) {
        let more = match self.dir {
            Direction::Forward => {
                node.next != INVALID_PAGE_ID
                    && node
                        .high_key
                        .as_deref()
                        .map_or(true, |high| below_hi(high, &self.hi))
            }
            Direction::Reverse => {
                node.prev != INVALID_PAGE_ID
                    && node.keys.first().map_or(true, |first| match &self.lo {
                        Bound::Unbounded => true,
                        Bound::Included(b) | Bound::Excluded(b) => first.as_slice() > b.as_slice(),
                    })
            }
        };
        self.leaf = Some(LeafInfo {
            page_id,
            lsn,
            prev: node.prev,
            next: node.next,
            more,
        });
        let entries = node
            .keys
            .into_iter()
            .zip(node.values)
            .enumerate()
            .filter(|(idx, _)| match (from, self.dir) {
                (None, _) => true,
                (Some(from), Direction::Forward) => *idx >= from,
                (Some(from), Direction::Reverse) => *idx <= from,
            })
            .map(|(idx, (k, v))| (idx, k, v));
        let mut picked: Vec<_> = entries.filter(|(_, k, _)| self.in_range(k)).collect();
        if self.dir == Direction::Reverse {
            picked.reverse();
        }
        self.buffer.extend(picked);
    }

    /// Descend to the leaf where the scan (re)starts.
    fn seek(&mut self) -> Result<()> {
        let tree = Arc::clone(&self.tree);
        let anchor = match (&self.last_key, self.dir) {
            (Some(last), _) => Some(last.clone()),
            (None, Direction::Forward) => match &self.lo {
                Bound::Included(k) | Bound::Excluded(k) => Some(k.clone()),
                Bound::Unbounded => None,
            },
            (None, Direction::Reverse) => match &self.hi {
                Bound::Included(k) | Bound::Excluded(k) => Some(k.clone()),
                Bound::Unbounded => None,
            },
        };
        let (guard, node) = match (anchor, self.dir) {
            (Some(key), _) => tree.find_leaf(Some(&key))?,
            (None, Direction::Forward) => tree.first_leaf()?,
            (None, Direction::Reverse) => tree.find_leaf(None)?,
        };
        let page_id = guard.page_id();
        let lsn = guard.lsn();
        drop(guard);
        self.load(page_id, lsn, node, None);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        if let Some(pos) = self.resume_at.take() {
            if let Some((guard, node)) = self.tree.read_leaf(pos.leaf_page_id)? {
                if guard.lsn() == pos.leaf_lsn {
                    let page_id = guard.page_id();
                    drop(guard);
                    self.load(page_id, pos.leaf_lsn, node, Some(pos.offset));
                    return Ok(());
                }
            }
        }
        self.seek()
    }

    /// Step to the neighbouring leaf, re-seeking if the link is stale.
    fn advance(&mut self) -> Result<()> {
        let leaf = match self.leaf {
            Some(leaf) if leaf.more => leaf,
            _ => {
                self.done = true;
                return Ok(());
            }
        };
        let target = match self.dir {
            Direction::Forward => leaf.next,
            Direction::Reverse => leaf.prev,
        };
        let tree = Arc::clone(&self.tree);
        if let Some((guard, node)) = tree.read_leaf(target)? {
            let linked = match self.dir {
                Direction::Forward => node.prev == leaf.page_id,
                Direction::Reverse => node.next == leaf.page_id,
            };
            if linked {
                let lsn = guard.lsn();
                drop(guard);
                self.load(target, lsn, node, None);
                return Ok(());
            }
        }
        self.seek()
    }
}

impl Iterator for RangeCursor {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((_, key, value)) = self.buffer.pop_front() {
                self.last_key = Some(key.clone());
                return Some(Ok((key, value)));
            }
            if self.done {
                return None;
            }
            let step = if self.started {
                self.advance()
            } else {
                self.start()
            };
            if let Err(e) = step {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer_pool::BufferPool;
    use crate::storage::disk::DiskManager;
    use tempfile::TempDir;

    fn tree_with(n: u32) -> (TempDir, Arc<BTree>) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path(), 1024));
        disk.create_table_file(1).unwrap();
        let pool = BufferPool::new(64, disk, None);
        let tree = Arc::new(BTree::create(pool, 1, "idx").unwrap());
        for i in 0..n {
            tree.insert(&i.to_be_bytes(), b"").unwrap();
        }
        (dir, tree)
    }

    #[test]
    fn test_resume_from_position() {
        let (_dir, tree) = tree_with(400);
        let mut cursor = tree.range(Bound::Unbounded, Bound::Unbounded, Direction::Forward);
        for _ in 0..150 {
            cursor.next().unwrap().unwrap();
        }
        let pos = cursor.position().unwrap();
        drop(cursor);
        let rest: Vec<_> = RangeCursor::resume(
            Arc::clone(&tree),
            Bound::Unbounded,
            Bound::Unbounded,
            Direction::Forward,
            pos,
        )
        .map(|r| r.unwrap().0)
        .collect();
        assert_eq!(rest.len(), 250);
        assert_eq!(rest[0], 150u32.to_be_bytes().to_vec());
    }

    #[test]
    fn test_resume_after_leaf_changed() {
        let (_dir, tree) = tree_with(400);
        let mut cursor = tree.range(Bound::Unbounded, Bound::Unbounded, Direction::Forward);
        for _ in 0..10 {
            cursor.next().unwrap().unwrap();
        }
        let pos = cursor.position().unwrap();
        drop(cursor);
        // removing an entry in the same leaf bumps its lsn
        tree.delete(&3u32.to_be_bytes()).unwrap();
        let rest: Vec<_> = RangeCursor::resume(
            Arc::clone(&tree),
            Bound::Unbounded,
            Bound::Unbounded,
            Direction::Forward,
            pos,
        )
        .map(|r| r.unwrap().0)
        .collect();
        assert_eq!(rest.len(), 390);
        assert_eq!(rest[0], 10u32.to_be_bytes().to_vec());
    }

    #[test]
    fn test_scan_survives_concurrent_splits() {
        let (_dir, tree) = tree_with(0);
        for i in (0..400u32).step_by(2) {
            tree.insert(&i.to_be_bytes(), b"").unwrap();
        }
        let mut cursor = tree.range(Bound::Unbounded, Bound::Unbounded, Direction::Forward);
        let mut seen = Vec::new();
        for _ in 0..20 {
            seen.push(cursor.next().unwrap().unwrap().0);
        }
        for i in (1..400u32).step_by(2) {
            tree.insert(&i.to_be_bytes(), &[0u8; 40]).unwrap();
        }
        for item in cursor {
            seen.push(item.unwrap().0);
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        // every even key present at the start is returned exactly once
        let evens = seen
            .iter()
            .filter(|k| u32::from_be_bytes([k[0], k[1], k[2], k[3]]) % 2 == 0)
            .count();
        assert_eq!(evens, 200);
    }
}
