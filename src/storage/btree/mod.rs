//! B+ Tree Index for EmberDB
//!
//! A concurrent B+tree stored in the pages of its table file. Keys and values
//! are opaque byte strings compared lexicographically; the index layer builds
//! order-preserving keys with [`crate::storage::codec`].
//!
//! Concurrency follows latch crabbing:
//!
//! * readers couple shared latches from the root down and never hold a latch
//!   while acquiring a sibling;
//! * writers first try an optimistic descent that takes only the leaf
//!   exclusively. If the leaf would split or underflow they restart on the
//!   pessimistic path, which serializes structure modifications behind one
//!   mutex and exclusive-latches the path, releasing every ancestor above a
//!   node that cannot split or underflow.
//!
//! The root page id never changes: a root split moves the root's content
//! into two new children and a root collapse copies its only child back.

mod cursor;
mod node;

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

pub use cursor::{CursorPosition, Direction, RangeCursor};
pub use node::Node;

use super::buffer_pool::{BufferPool, GlobalPageId, PageReadGuard, PageWriteGuard};
use super::disk::TableId;
use super::page::{Page, PageId, PageKind, INVALID_PAGE_ID};
use crate::error::{Error, Result};

/// Retries of an optimistic or move-right descent before giving up
const MAX_RESTARTS: usize = 1 << 12;

/// A page-resident B+tree
#[derive(Debug)]
pub struct BTree {
    name: String,
    table_id: TableId,
    root: PageId,
    pool: Arc<BufferPool>,
    smo: Mutex<()>,
}

/// Result of a structural self-check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeCheck {
    pub depth: usize,
    pub leaves: usize,
    pub entries: usize,
    pub errors: Vec<String>,
}

enum InsertMode {
    Unique,
    IfAbsent,
}

impl BTree {
    /// Allocate an empty tree whose root is a fresh leaf.
    pub fn create(pool: Arc<BufferPool>, table_id: TableId, name: impl Into<String>) -> Result<Self> {
        let root = {
            let mut page = pool.allocate_page(table_id, PageKind::BTreeLeaf)?;
            Node::new_leaf().write(&mut page);
            page.page_id()
        };
        let name = name.into();
        debug!(table_id, root, index = %name, "created B+tree");
        Ok(Self::open(pool, table_id, root, name))
    }

    pub fn open(pool: Arc<BufferPool>, table_id: TableId, root: PageId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_id,
            root,
            pool,
            smo: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_page_id(&self) -> PageId {
        self.root
    }

    fn capacity(&self) -> usize {
        Page::body_capacity(self.pool.page_size())
    }

    /// Longest key the tree accepts for this page size.
    pub fn max_key_size(page_size: usize) -> usize {
        Page::body_capacity(page_size) / 4 - 16
    }

    fn min_fill(&self) -> usize {
        self.capacity() / 4
    }

    fn gid(&self, page_id: PageId) -> GlobalPageId {
        GlobalPageId::new(self.table_id, page_id)
    }

    fn read_node(&self, page_id: PageId) -> Result<(PageReadGuard, Node)> {
        let guard = self.pool.fetch_read(self.gid(page_id))?;
        let node = Node::read(&guard)?;
        Ok((guard, node))
    }

    fn write_node(&self, page_id: PageId) -> Result<(PageWriteGuard, Node)> {
        let guard = self.pool.fetch_write(self.gid(page_id))?;
        let node = Node::read(&guard)?;
        Ok((guard, node))
    }

    fn check_key(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let limit = Self::max_key_size(self.pool.page_size());
        if key.len() + value.len() > limit {
            return Err(Error::InvalidArgument(format!(
                "index entry of {} bytes exceeds the limit of {} bytes for index '{}'",
                key.len() + value.len(),
                limit,
                self.name
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Descend to the leaf covering `key` (the rightmost leaf for `None`).
    pub(crate) fn find_leaf(&self, key: Option<&[u8]>) -> Result<(PageReadGuard, Node)> {
        'restart: for _ in 0..MAX_RESTARTS {
            let (mut guard, mut node) = self.read_node(self.root)?;
            loop {
                // a concurrent split moved our key to the right
                if moved_right(&node, key) {
                    let next = node.next;
                    let level = node.level;
                    drop(guard);
                    match self.read_node(next) {
                        Ok((g, n)) if n.level == level => {
                            guard = g;
                            node = n;
                            continue;
                        }
                        Ok(_) | Err(Error::InternalInvariant(_)) => continue 'restart,
                        Err(e) => return Err(e),
                    }
                }
                if node.is_leaf() {
                    return Ok((guard, node));
                }
                let idx = match key {
                    Some(key) => node.child_index(key),
                    None => node.children.len() - 1,
                };
                let (child_guard, child) = self.read_node(node.children[idx])?;
                guard = child_guard;
                node = child;
            }
        }
        Err(Error::InternalInvariant(format!(
            "B+tree '{}' descent did not converge",
            self.name
        )))
    }

    /// Leftmost leaf, used by forward scans without a lower bound.
    pub(crate) fn first_leaf(&self) -> Result<(PageReadGuard, Node)> {
        let (mut guard, mut node) = self.read_node(self.root)?;
        while !node.is_leaf() {
            let (child_guard, child) = self.read_node(node.children[0])?;
            guard = child_guard;
            node = child;
        }
        Ok((guard, node))
    }

    pub(crate) fn read_leaf(&self, page_id: PageId) -> Result<Option<(PageReadGuard, Node)>> {
        if page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let guard = self.pool.fetch_read(self.gid(page_id))?;
        if guard.kind() != Some(PageKind::BTreeLeaf) {
            return Ok(None);
        }
        let node = Node::read(&guard)?;
        Ok(Some((guard, node)))
    }

    /// Exact lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (_guard, node) = self.find_leaf(Some(key))?;
        Ok(node.find(key).ok().map(|i| node.values[i].clone()))
    }

    /// Cursor positioned at the first entry `>= key`.
    pub fn search(self: &Arc<Self>, key: &[u8]) -> RangeCursor {
        RangeCursor::new(
            Arc::clone(self),
            std::ops::Bound::Included(key.to_vec()),
            std::ops::Bound::Unbounded,
            Direction::Forward,
        )
    }

    /// Lazy cursor over `[lo, hi]` in `dir` order.
    pub fn range(
        self: &Arc<Self>,
        lo: std::ops::Bound<Vec<u8>>,
        hi: std::ops::Bound<Vec<u8>>,
        dir: Direction,
    ) -> RangeCursor {
        RangeCursor::new(Arc::clone(self), lo, hi, dir)
    }

    // ---------------------------------------------------------------------
    // Insert
    // ---------------------------------------------------------------------

    /// Insert a new entry; an existing equal key is a `DuplicateKey` error.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.insert_with(key, value, InsertMode::Unique).map(|_| ())
    }

    /// Insert unless the key already exists. Returns whether it was added.
    pub fn insert_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.insert_with(key, value, InsertMode::IfAbsent)
    }

    fn duplicate(&self, key: &[u8]) -> Error {
        Error::DuplicateKey {
            table: self.name.clone(),
            key: hex(key),
        }
    }

    fn insert_with(&self, key: &[u8], value: &[u8], mode: InsertMode) -> Result<bool> {
        self.check_key(key, value)?;
        if let Some(done) = self.insert_optimistic(key, value, &mode)? {
            return Ok(done);
        }
        self.insert_pessimistic(key, value, &mode)
    }

    /// Exclusive-latch only the leaf. Returns `None` if the leaf would split.
    fn insert_optimistic(&self, key: &[u8], value: &[u8], mode: &InsertMode) -> Result<Option<bool>> {
        let (mut guard, mut node) = match self.leaf_for_write(key)? {
            Some(found) => found,
            None => return Ok(None),
        };
        let pos = match node.find(key) {
            Ok(_) => {
                return match mode {
                    InsertMode::Unique => Err(self.duplicate(key)),
                    InsertMode::IfAbsent => Ok(Some(false)),
                }
            }
            Err(pos) => pos,
        };
        node.keys.insert(pos, key.to_vec());
        node.values.insert(pos, value.to_vec());
        if node.encoded_size() > self.capacity() {
            return Ok(None);
        }
        node.write(&mut guard);
        Ok(Some(true))
    }

    /// Read-couple down to the leaf's parent, then exclusive-latch the leaf.
    fn leaf_for_write(&self, key: &[u8]) -> Result<Option<(PageWriteGuard, Node)>> {
        let (mut guard, mut node) = self.read_node(self.root)?;
        if node.is_leaf() {
            drop(guard);
            let (wguard, wnode) = self.write_node(self.root)?;
            return Ok(wnode.is_leaf().then_some((wguard, wnode)));
        }
        loop {
            if node.beyond_high_key(key) {
                return Ok(None);
            }
            let child = node.children[node.child_index(key)];
            if node.level == 1 {
                let (leaf_guard, leaf) = self.write_node(child)?;
                drop(guard);
                if !leaf.is_leaf() || leaf.beyond_high_key(key) {
                    return Ok(None);
                }
                return Ok(Some((leaf_guard, leaf)));
            }
            let (child_guard, child_node) = self.read_node(child)?;
            guard = child_guard;
            node = child_node;
        }
    }

    /// Write-latch the path from the root, keeping only unsafe ancestors.
    fn write_path(&self, key: &[u8], safe: impl Fn(&Node) -> bool) -> Result<Vec<(PageWriteGuard, Node)>> {
        let mut path: Vec<(PageWriteGuard, Node)> = Vec::new();
        let mut page_id = self.root;
        loop {
            let (guard, node) = self.write_node(page_id)?;
            if safe(&node) {
                path.clear();
            }
            let leaf = node.is_leaf();
            let next = if leaf {
                INVALID_PAGE_ID
            } else {
                node.children[node.child_index(key)]
            };
            path.push((guard, node));
            if leaf {
                return Ok(path);
            }
            page_id = next;
        }
    }

    fn insert_pessimistic(&self, key: &[u8], value: &[u8], mode: &InsertMode) -> Result<bool> {
        let _smo = self.smo.lock();
        let capacity = self.capacity();
        let headroom = Self::max_key_size(self.pool.page_size()) + 8;
        let mut path = self.write_path(key, |n| n.encoded_size() + headroom <= capacity)?;

        let (mut guard, mut node) = path.pop().ok_or_else(|| {
            Error::InternalInvariant(format!("empty write path in B+tree '{}'", self.name))
        })?;
        let pos = match node.find(key) {
            Ok(_) => {
                return match mode {
                    InsertMode::Unique => Err(self.duplicate(key)),
                    InsertMode::IfAbsent => Ok(false),
                }
            }
            Err(pos) => pos,
        };
        node.keys.insert(pos, key.to_vec());
        node.values.insert(pos, value.to_vec());

        loop {
            if node.encoded_size() <= capacity {
                node.write(&mut guard);
                return Ok(true);
            }
            let page_id = guard.page_id();
            if page_id == self.root {
                self.split_root(&mut guard, node)?;
                return Ok(true);
            }
            let (separator, right_id) = self.split_node(&mut guard, &mut node)?;
            drop(guard);
            let (parent_guard, mut parent) = path.pop().ok_or_else(|| {
                Error::InternalInvariant(format!("split of {} lost its parent", page_id))
            })?;
            let idx = parent.child_index(&separator);
            parent.keys.insert(idx, separator);
            parent.children.insert(idx + 1, right_id);
            guard = parent_guard;
            node = parent;
        }
    }

    /// Split a non-root node in place. Returns the separator and new page.
    fn split_node(&self, guard: &mut PageWriteGuard, node: &mut Node) -> Result<(Vec<u8>, PageId)> {
        let page_id = guard.page_id();
        let (separator, mut right) = node.split();
        let mut right_guard = self.pool.allocate_page(self.table_id, PageKind::BTreeLeaf)?;
        let right_id = right_guard.page_id();
        right.prev = page_id;
        node.next = right_id;
        if right.is_leaf() && right.next != INVALID_PAGE_ID {
            let (mut after_guard, mut after) = self.write_node(right.next)?;
            after.prev = right_id;
            after.write(&mut after_guard);
        }
        right.write(&mut right_guard);
        node.write(guard);
        trace!(index = %self.name, page_id, right_id, level = node.level, "split node");
        Ok((separator, right_id))
    }

    /// Move an overflowing root's content into two children.
    fn split_root(&self, guard: &mut PageWriteGuard, mut node: Node) -> Result<()> {
        let (separator, mut right) = node.split();
        let mut left_guard = self.pool.allocate_page(self.table_id, PageKind::BTreeLeaf)?;
        let mut right_guard = self.pool.allocate_page(self.table_id, PageKind::BTreeLeaf)?;
        let left_id = left_guard.page_id();
        let right_id = right_guard.page_id();
        node.prev = INVALID_PAGE_ID;
        node.next = right_id;
        right.prev = left_id;
        right.next = INVALID_PAGE_ID;
        let level = node.level + 1;
        node.write(&mut left_guard);
        right.write(&mut right_guard);

        let mut root = Node::new_internal(level, left_id);
        root.keys.push(separator);
        root.children.push(right_id);
        root.write(guard);
        debug!(index = %self.name, level, "root split");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Delete
    // ---------------------------------------------------------------------

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        if let Some(done) = self.delete_optimistic(key)? {
            return Ok(done);
        }
        self.delete_pessimistic(key)
    }

    fn delete_optimistic(&self, key: &[u8]) -> Result<Option<bool>> {
        let (mut guard, mut node) = match self.leaf_for_write(key)? {
            Some(found) => found,
            None => return Ok(None),
        };
        let pos = match node.find(key) {
            Ok(pos) => pos,
            Err(_) => return Ok(Some(false)),
        };
        node.keys.remove(pos);
        node.values.remove(pos);
        if guard.page_id() != self.root && node.encoded_size() < self.min_fill() {
            return Ok(None);
        }
        node.write(&mut guard);
        Ok(Some(true))
    }

    fn delete_pessimistic(&self, key: &[u8]) -> Result<bool> {
        let _smo = self.smo.lock();
        let min_fill = self.min_fill();
        let headroom = Self::max_key_size(self.pool.page_size()) + 8;
        let root = self.root;
        let mut path = self.write_path(key, |n| n.encoded_size() >= min_fill + headroom)?;

        let (mut guard, mut node) = path.pop().ok_or_else(|| {
            Error::InternalInvariant(format!("empty write path in B+tree '{}'", self.name))
        })?;
        match node.find(key) {
            Ok(pos) => {
                node.keys.remove(pos);
                node.values.remove(pos);
            }
            Err(_) => return Ok(false),
        }

        loop {
            let page_id = guard.page_id();
            if page_id == root {
                if !node.is_leaf() && node.keys.is_empty() {
                    self.collapse_root(&mut guard, &node)?;
                } else {
                    node.write(&mut guard);
                }
                return Ok(true);
            }
            if node.encoded_size() >= min_fill {
                node.write(&mut guard);
                return Ok(true);
            }
            let (parent_guard, mut parent) = match path.pop() {
                Some(entry) => entry,
                None => {
                    // ancestor was safe and released; underflow is tolerated
                    node.write(&mut guard);
                    return Ok(true);
                }
            };
            let idx = parent
                .children
                .iter()
                .position(|c| *c == page_id)
                .ok_or_else(|| {
                    Error::InternalInvariant(format!(
                        "page {} missing from its parent {}",
                        page_id,
                        parent_guard.page_id()
                    ))
                })?;
            self.fix_underflow(&mut parent, idx, guard, node)?;
            guard = parent_guard;
            node = parent;
        }
    }

    /// Merge or rebalance child `idx` of `parent` with a sibling, preferring
    /// the left one.
    fn fix_underflow(&self, parent: &mut Node, idx: usize, mut guard: PageWriteGuard, node: Node) -> Result<()> {
        if parent.children.len() < 2 {
            node.write(&mut guard);
            return Ok(());
        }
        let (left_idx, mut left_guard, left, mut right_guard, right) = if idx > 0 {
            let (g, n) = self.write_node(parent.children[idx - 1])?;
            (idx - 1, g, n, guard, node)
        } else {
            let (g, n) = self.write_node(parent.children[idx + 1])?;
            (idx, guard, node, g, n)
        };
        let separator = parent.keys[left_idx].clone();
        let right_id = right_guard.page_id();
        let left_id = left_guard.page_id();

        let mut merged = left.clone();
        merged.absorb(separator.clone(), right.clone());
        if merged.encoded_size() <= self.capacity() {
            if merged.is_leaf() && merged.next != INVALID_PAGE_ID {
                let (mut after_guard, mut after) = self.write_node(merged.next)?;
                after.prev = left_id;
                after.write(&mut after_guard);
            }
            merged.write(&mut left_guard);
            parent.keys.remove(left_idx);
            parent.children.remove(left_idx + 1);
            drop(right_guard);
            drop(left_guard);
            self.pool.free_page(self.gid(right_id))?;
            trace!(index = %self.name, left_id, right_id, "merged nodes");
            return Ok(());
        }

        // rebalance by bytes, keeping both pages
        let (new_separator, mut new_right) = merged.split();
        if parent.encoded_size() + new_separator.len() > self.capacity() + separator.len() {
            // the parent cannot take a longer separator; leave the underflow
            left.write(&mut left_guard);
            right.write(&mut right_guard);
            return Ok(());
        }
        new_right.prev = left_id;
        merged.next = right_id;
        merged.write(&mut left_guard);
        new_right.write(&mut right_guard);
        parent.keys[left_idx] = new_separator;
        trace!(index = %self.name, left_id, right_id, "rebalanced nodes");
        Ok(())
    }

    /// Replace an empty internal root with its only child.
    fn collapse_root(&self, guard: &mut PageWriteGuard, node: &Node) -> Result<()> {
        let child_id = node.children[0];
        {
            let (_child_guard, mut child) = self.write_node(child_id)?;
            child.prev = INVALID_PAGE_ID;
            child.next = INVALID_PAGE_ID;
            child.high_key = None;
            child.write(guard);
        }
        self.pool.free_page(self.gid(child_id))?;
        debug!(index = %self.name, "root collapsed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Whole-tree operations
    // ---------------------------------------------------------------------

    /// Free every page of the tree, root included.
    pub fn destroy(&self) -> Result<()> {
        let _smo = self.smo.lock();
        let mut pages = Vec::new();
        let mut queue = VecDeque::from([self.root]);
        while let Some(page_id) = queue.pop_front() {
            let (_guard, node) = self.read_node(page_id)?;
            queue.extend(node.children.iter().copied());
            pages.push(page_id);
        }
        for page_id in pages {
            self.pool.free_page(self.gid(page_id))?;
        }
        Ok(())
    }

    /// Number of entries, counted by walking the leaves.
    pub fn len(&self) -> Result<usize> {
        let (guard, mut node) = self.first_leaf()?;
        drop(guard);
        let mut count = node.len();
        while node.next != INVALID_PAGE_ID {
            match self.read_leaf(node.next)? {
                Some((_g, next)) => {
                    count += next.len();
                    node = next;
                }
                None => break,
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Verify ordering, balance, high keys and leaf links.
    pub fn check(&self) -> Result<TreeCheck> {
        let _smo = self.smo.lock();
        let mut report = TreeCheck::default();
        let mut leaf_depth = None;
        let mut leaves = Vec::new();
        // (page, depth, lower bound, upper bound)
        let mut stack = vec![(self.root, 1usize, None::<Vec<u8>>, None::<Vec<u8>>)];
        while let Some((page_id, depth, lower, upper)) = stack.pop() {
            let (_guard, node) = self.read_node(page_id)?;
            if node.high_key != upper && page_id != self.root {
                report
                    .errors
                    .push(format!("page {}: high key does not match parent separator", page_id));
            }
            for pair in node.keys.windows(2) {
                if pair[0] >= pair[1] {
                    report.errors.push(format!("page {}: keys out of order", page_id));
                }
            }
            if let (Some(first), Some(lo)) = (node.keys.first(), &lower) {
                if first < lo {
                    report.errors.push(format!("page {}: key below lower bound", page_id));
                }
            }
            if let (Some(last), Some(hi)) = (node.keys.last(), &upper) {
                if last >= hi {
                    report.errors.push(format!("page {}: key at or above high key", page_id));
                }
            }
            if node.is_leaf() {
                match leaf_depth {
                    None => leaf_depth = Some(depth),
                    Some(d) if d != depth => report
                        .errors
                        .push(format!("page {}: leaf at depth {} instead of {}", page_id, depth, d)),
                    _ => {}
                }
                report.entries += node.len();
                leaves.push((lower.clone(), page_id, node.prev, node.next));
                continue;
            }
            if node.children.len() != node.keys.len() + 1 {
                report
                    .errors
                    .push(format!("page {}: child count does not match keys", page_id));
                continue;
            }
            for (i, child) in node.children.iter().enumerate() {
                let lo = if i == 0 { lower.clone() } else { Some(node.keys[i - 1].clone()) };
                let hi = if i == node.keys.len() { upper.clone() } else { Some(node.keys[i].clone()) };
                stack.push((*child, depth + 1, lo, hi));
            }
        }
        // leaves in key order must be doubly linked
        leaves.sort_by(|a, b| a.0.cmp(&b.0));
        for (i, (_, page_id, prev, next)) in leaves.iter().enumerate() {
            let want_prev = if i == 0 { INVALID_PAGE_ID } else { leaves[i - 1].1 };
            let want_next = leaves.get(i + 1).map_or(INVALID_PAGE_ID, |l| l.1);
            if *prev != want_prev || *next != want_next {
                report.errors.push(format!("page {}: broken leaf links", page_id));
            }
        }
        report.depth = leaf_depth.unwrap_or(1);
        report.leaves = leaves.len();
        Ok(report)
    }
}

fn moved_right(node: &Node, key: Option<&[u8]>) -> bool {
    if node.next == INVALID_PAGE_ID {
        return false;
    }
    match key {
        Some(key) => node.beyond_high_key(key),
        // rightmost descent: anything with a finite high key has a right sibling
        None => node.high_key.is_some(),
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
