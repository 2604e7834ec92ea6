//! On-page B+tree node format
//!
//! ```text
//! prev u32 | next u32 | level u16 | count u16 | high_len u16 | high_key
//! leaf entries:     (key_len u16, key, value_len u16, value) * count
//! internal entries: child0 u32, (key_len u16, key, child u32) * count
//! ```
//!
//! Level 0 is a leaf. Every key stored below a node is strictly less than the
//! node's high key; a missing high key means +infinity. Internal key `i`
//! separates `children[i]` (keys below it) from `children[i + 1]`.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::storage::page::{Page, PageId, PageKind, INVALID_PAGE_ID};

pub const NODE_HEADER_SIZE: usize = 14;
const NO_HIGH_KEY: u16 = u16::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub level: u16,
    pub prev: PageId,
    pub next: PageId,
    pub high_key: Option<Vec<u8>>,
    pub keys: Vec<Vec<u8>>,
    /// Leaf payloads, parallel to `keys`
    pub values: Vec<Vec<u8>>,
    /// Internal child pointers, one more than `keys`
    pub children: Vec<PageId>,
}

impl Node {
    pub fn new_leaf() -> Self {
        Self {
            level: 0,
            prev: INVALID_PAGE_ID,
            next: INVALID_PAGE_ID,
            high_key: None,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn new_internal(level: u16, first_child: PageId) -> Self {
        Self {
            level,
            children: vec![first_child],
            ..Self::new_leaf()
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn page_kind(&self) -> PageKind {
        if self.is_leaf() {
            PageKind::BTreeLeaf
        } else {
            PageKind::BTreeInternal
        }
    }

    /// Decode a node, failing if the page is not a B+tree page.
    pub fn read(page: &Page) -> Result<Node> {
        match page.kind() {
            Some(PageKind::BTreeLeaf) | Some(PageKind::BTreeInternal) => {}
            other => {
                return Err(Error::InternalInvariant(format!(
                    "page {} is {:?}, not a B+tree node",
                    page.page_id(),
                    other
                )))
            }
        }
        let malformed = || {
            Error::InternalInvariant(format!("malformed B+tree node on page {}", page.page_id()))
        };
        let mut buf = page.body();
        let prev = buf.get_u32();
        let next = buf.get_u32();
        let level = buf.get_u16();
        let count = buf.get_u16() as usize;
        let high_len = buf.get_u16();
        let high_key = if high_len == NO_HIGH_KEY {
            None
        } else {
            Some(take(&mut buf, high_len as usize).ok_or_else(malformed)?)
        };
        let mut node = Node {
            level,
            prev,
            next,
            high_key,
            keys: Vec::with_capacity(count),
            values: Vec::new(),
            children: Vec::new(),
        };
        if level == 0 {
            node.values.reserve(count);
            for _ in 0..count {
                let klen = get_u16(&mut buf).ok_or_else(malformed)? as usize;
                node.keys.push(take(&mut buf, klen).ok_or_else(malformed)?);
                let vlen = get_u16(&mut buf).ok_or_else(malformed)? as usize;
                node.values.push(take(&mut buf, vlen).ok_or_else(malformed)?);
            }
        } else {
            node.children.reserve(count + 1);
            node.children.push(get_u32(&mut buf).ok_or_else(malformed)?);
            for _ in 0..count {
                let klen = get_u16(&mut buf).ok_or_else(malformed)? as usize;
                node.keys.push(take(&mut buf, klen).ok_or_else(malformed)?);
                node.children.push(get_u32(&mut buf).ok_or_else(malformed)?);
            }
        }
        Ok(node)
    }

    /// Encode into `page`, switching its kind if needed and bumping its LSN.
    pub fn write(&self, page: &mut Page) {
        let lsn = page.lsn();
        let page_id = page.page_id();
        page.reset(page_id, self.page_kind());
        let mut out: &mut [u8] = page.body_mut();
        out.put_u32(self.prev);
        out.put_u32(self.next);
        out.put_u16(self.level);
        out.put_u16(self.keys.len() as u16);
        match &self.high_key {
            None => out.put_u16(NO_HIGH_KEY),
            Some(high) => {
                out.put_u16(high.len() as u16);
                out.put_slice(high);
            }
        }
        if self.is_leaf() {
            for (key, value) in self.keys.iter().zip(&self.values) {
                out.put_u16(key.len() as u16);
                out.put_slice(key);
                out.put_u16(value.len() as u16);
                out.put_slice(value);
            }
        } else {
            out.put_u32(self.children[0]);
            for (key, child) in self.keys.iter().zip(&self.children[1..]) {
                out.put_u16(key.len() as u16);
                out.put_slice(key);
                out.put_u32(*child);
            }
        }
        page.set_lsn(lsn + 1);
    }

    pub fn entry_size(&self, i: usize) -> usize {
        if self.is_leaf() {
            4 + self.keys[i].len() + self.values[i].len()
        } else {
            6 + self.keys[i].len()
        }
    }

    pub fn encoded_size(&self) -> usize {
        let fixed = NODE_HEADER_SIZE
            + self.high_key.as_ref().map_or(0, |h| h.len())
            + if self.is_leaf() { 0 } else { 4 };
        fixed + (0..self.len()).map(|i| self.entry_size(i)).sum::<usize>()
    }

    /// Exact match position, or the insertion point.
    pub fn find(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.keys.binary_search_by(|k| k.as_slice().cmp(key))
    }

    /// Index of the child whose range contains `key`.
    pub fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|sep| sep.as_slice() <= key)
    }

    /// Whether `key` lies at or beyond the high key.
    pub fn beyond_high_key(&self, key: &[u8]) -> bool {
        self.high_key.as_deref().map_or(false, |high| key >= high)
    }

    /// Split off the upper half by byte count. Returns the separator to push
    /// into the parent and the new right sibling, whose `prev` is left unset.
    pub fn split(&mut self) -> (Vec<u8>, Node) {
        let total: usize = (0..self.len()).map(|i| self.entry_size(i)).sum();
        let (lo, hi) = if self.is_leaf() {
            (1, self.len() - 1)
        } else {
            (1, self.len().saturating_sub(2).max(1))
        };
        let mut best = lo;
        let mut best_diff = usize::MAX;
        let mut left = 0;
        for m in 0..self.len() {
            if m >= lo && m <= hi {
                let right = total - left;
                let diff = left.abs_diff(right);
                if diff < best_diff {
                    best_diff = diff;
                    best = m;
                }
            }
            left += self.entry_size(m);
        }

        let mut right = Node {
            level: self.level,
            prev: INVALID_PAGE_ID,
            next: self.next,
            high_key: self.high_key.take(),
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        };
        let separator = if self.is_leaf() {
            right.keys = self.keys.split_off(best);
            right.values = self.values.split_off(best);
            right.keys[0].clone()
        } else {
            right.keys = self.keys.split_off(best + 1);
            right.children = self.children.split_off(best + 1);
            // the middle key moves up
            self.keys.pop().unwrap_or_default()
        };
        self.high_key = Some(separator.clone());
        (separator, right)
    }

    /// Append the right sibling's content. `separator` is the parent key
    /// between the two nodes.
    pub fn absorb(&mut self, separator: Vec<u8>, right: Node) {
        if self.is_leaf() {
            self.keys.extend(right.keys);
            self.values.extend(right.values);
        } else {
            self.keys.push(separator);
            self.keys.extend(right.keys);
            self.children.extend(right.children);
        }
        self.high_key = right.high_key;
        self.next = right.next;
    }
}

fn get_u16(buf: &mut &[u8]) -> Option<u16> {
    (buf.remaining() >= 2).then(|| buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Option<u32> {
    (buf.remaining() >= 4).then(|| buf.get_u32())
}

fn take(buf: &mut &[u8], len: usize) -> Option<Vec<u8>> {
    if buf.remaining() < len {
        return None;
    }
    let out = buf[..len].to_vec();
    buf.advance(len);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(keys: &[&[u8]]) -> Node {
        let mut node = Node::new_leaf();
        for key in keys {
            node.keys.push(key.to_vec());
            node.values.push(b"v".to_vec());
        }
        node
    }

    #[test]
    fn test_write_read_leaf() {
        let mut node = leaf(&[b"a", b"b"]);
        node.next = 9;
        node.high_key = Some(b"c".to_vec());
        let mut page = Page::new(3, PageKind::Free, 1024);
        node.write(&mut page);
        assert_eq!(page.kind(), Some(PageKind::BTreeLeaf));
        assert_eq!(page.lsn(), 1);
        assert_eq!(Node::read(&page).unwrap(), node);
    }

    #[test]
    fn test_write_read_internal() {
        let mut node = Node::new_internal(1, 4);
        node.keys.push(b"m".to_vec());
        node.children.push(5);
        let mut page = Page::new(3, PageKind::Free, 1024);
        node.write(&mut page);
        assert_eq!(page.kind(), Some(PageKind::BTreeInternal));
        let read = Node::read(&page).unwrap();
        assert_eq!(read.child_index(b"a"), 0);
        assert_eq!(read.child_index(b"m"), 1);
        assert_eq!(read.child_index(b"z"), 1);
    }

    #[test]
    fn test_leaf_split_balances_bytes() {
        let mut node = Node::new_leaf();
        node.keys = vec![vec![1; 100], vec![2; 10], vec![3; 10], vec![4; 10]];
        node.values = vec![Vec::new(); 4];
        let (sep, right) = node.split();
        // the single large entry outweighs the three small ones
        assert_eq!(node.len(), 1);
        assert_eq!(right.len(), 3);
        assert_eq!(sep, vec![2; 10]);
        assert_eq!(node.high_key, Some(sep));
        assert_eq!(right.high_key, None);
    }

    #[test]
    fn test_internal_split_moves_middle_key_up() {
        let mut node = Node::new_internal(1, 10);
        for (i, k) in [b"b", b"d", b"f", b"h"].iter().enumerate() {
            node.keys.push(k.to_vec());
            node.children.push(11 + i as u32);
        }
        let (sep, right) = node.split();
        assert_eq!(node.keys.len() + right.keys.len() + 1, 4);
        assert_eq!(node.children.len(), node.keys.len() + 1);
        assert_eq!(right.children.len(), right.keys.len() + 1);
        assert!(node.keys.iter().all(|k| k < &sep));
        assert!(right.keys.iter().all(|k| k > &sep));
    }

    #[test]
    fn test_absorb_restores_split() {
        let original = leaf(&[b"a", b"b", b"c", b"d"]);
        let mut left = original.clone();
        let (sep, right) = left.split();
        left.absorb(sep, right);
        assert_eq!(left, original);
    }
}
