//! Generic B-tree node decoding and search, shared by the catalog and the
//! extents-overflow trees.
//!
//! Nodes start with a 14-byte descriptor; record offsets are stored as
//! big-endian u16s at the end of the node, growing backward, with one extra
//! entry marking the start of free space.

use std::cmp::Ordering;

use log::{trace, warn};

use super::raw::{bytes, u16_at, u32_at, u8_at};
use crate::error::{HfsError, Result};

const NODE_DESCRIPTOR_SIZE: usize = 14;
/// Bytes needed from node 0 to decode the header record.
pub const HEADER_NODE_PREFIX: usize = 256;
/// Key compare type for case-sensitive HFSX catalogs.
pub const BINARY_COMPARE: u8 = 0xBC;

const MAX_TREE_DEPTH: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeId {
    Catalog,
    Extents,
}

impl TreeId {
    /// Catalog node ID of the metadata file holding the tree.
    pub fn file_id(self) -> u32 {
        match self {
            TreeId::Catalog => super::CATALOG_FILE_ID,
            TreeId::Extents => super::EXTENTS_FILE_ID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Index,
    Header,
    Map,
}

impl NodeKind {
    fn from_raw(kind: i8) -> Option<Self> {
        match kind {
            -1 => Some(NodeKind::Leaf),
            0 => Some(NodeKind::Index),
            1 => Some(NodeKind::Header),
            2 => Some(NodeKind::Map),
            _ => None,
        }
    }
}

/// B-tree header record (after the node descriptor in node 0).
#[derive(Debug, Clone, Copy)]
pub struct BTreeHeader {
    pub depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_len: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub key_compare_type: u8,
}

impl BTreeHeader {
    /// Parse from the leading bytes of node 0.
    pub fn parse(node0: &[u8]) -> Result<Self> {
        let kind = u8_at(node0, 8)? as i8;
        if NodeKind::from_raw(kind) != Some(NodeKind::Header) {
            return Err(HfsError::corrupt(format!(
                "B-tree node 0 has kind {kind}, expected header"
            )));
        }
        let rec = bytes(node0, NODE_DESCRIPTOR_SIZE, 106)?;
        let header = BTreeHeader {
            depth: u16_at(rec, 0)?,
            root_node: u32_at(rec, 2)?,
            leaf_records: u32_at(rec, 6)?,
            first_leaf_node: u32_at(rec, 10)?,
            last_leaf_node: u32_at(rec, 14)?,
            node_size: u16_at(rec, 18)?,
            max_key_len: u16_at(rec, 20)?,
            total_nodes: u32_at(rec, 22)?,
            free_nodes: u32_at(rec, 26)?,
            key_compare_type: u8_at(rec, 37)?,
        };
        if header.node_size < 512 || !header.node_size.is_power_of_two() {
            return Err(HfsError::corrupt(format!(
                "invalid B-tree node size {}",
                header.node_size
            )));
        }
        Ok(header)
    }
}

/// One B-tree node read into an owned buffer.
#[derive(Debug, Clone)]
pub struct Node {
    pub index: u32,
    pub kind: NodeKind,
    pub height: u8,
    pub next: u32,
    pub prev: u32,
    data: Vec<u8>,
    offsets: Vec<u16>,
}

impl Node {
    /// Decode the descriptor and validate the record offset table.
    pub fn parse(index: u32, data: Vec<u8>) -> Result<Self> {
        let raw_kind = u8_at(&data, 8)? as i8;
        let kind = NodeKind::from_raw(raw_kind).ok_or_else(|| {
            HfsError::corrupt(format!("node {index} has unknown kind {raw_kind}"))
        })?;
        let num_records = u16_at(&data, 10)? as usize;
        let table_len = 2 * (num_records + 1);
        if NODE_DESCRIPTOR_SIZE + table_len > data.len() {
            return Err(HfsError::corrupt(format!(
                "node {index} claims {num_records} records, too many for {} bytes",
                data.len()
            )));
        }

        let table_start = data.len() - table_len;
        let mut offsets = Vec::with_capacity(num_records + 1);
        for i in 0..=num_records {
            offsets.push(u16_at(&data, data.len() - 2 * (i + 1))?);
        }
        let mut prev = NODE_DESCRIPTOR_SIZE as u16;
        for &off in &offsets {
            if off < prev || off as usize > table_start {
                return Err(HfsError::corrupt(format!(
                    "node {index} has out-of-order record offset {off}"
                )));
            }
            prev = off;
        }

        Ok(Node {
            index,
            kind,
            height: u8_at(&data, 9)?,
            next: u32_at(&data, 0)?,
            prev: u32_at(&data, 4)?,
            data,
            offsets,
        })
    }

    pub fn num_records(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Raw bytes of record `slot`.
    pub fn record(&self, slot: usize) -> Result<&[u8]> {
        if slot >= self.num_records() {
            return Err(HfsError::corrupt(format!(
                "record {slot} out of range in node {} ({} records)",
                self.index,
                self.num_records()
            )));
        }
        let start = self.offsets[slot] as usize;
        let end = self.offsets[slot + 1] as usize;
        Ok(&self.data[start..end])
    }

    /// Split record `slot` into key and data.
    pub fn key_and_data(&self, slot: usize, format: KeyFormat) -> Result<(&[u8], &[u8])> {
        split_record(self.record(slot)?, format)
    }
}

/// On-disk key-length encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// 1-byte key length; data padded to an even offset.
    Classic,
    /// 2-byte key length; data follows the key directly.
    Plus,
}

/// Returns (key bytes without the length prefix, data bytes).
pub fn split_record(rec: &[u8], format: KeyFormat) -> Result<(&[u8], &[u8])> {
    let (prefix, key_len) = match format {
        KeyFormat::Classic => (1, u8_at(rec, 0)? as usize),
        KeyFormat::Plus => (2, u16_at(rec, 0)? as usize),
    };
    let key = bytes(rec, prefix, key_len)?;
    let mut data_start = prefix + key_len;
    if format == KeyFormat::Classic && data_start % 2 != 0 {
        data_start += 1;
    }
    let data = rec.get(data_start..).ok_or_else(|| {
        HfsError::corrupt(format!("record data offset {data_start} past end of record"))
    })?;
    Ok((key, data))
}

/// Fetches nodes for a tree; implemented by the mounted volume.
pub trait NodeSource {
    fn read_node(&mut self, tree: TreeId, index: u32) -> Result<Node>;
}

/// Where a search ended.
#[derive(Debug)]
pub struct SearchResult {
    pub node: Node,
    /// Matching slot, or the slot of the greatest key below the search key.
    /// `None` when every key in the leaf is greater.
    pub slot: Option<usize>,
    pub found: bool,
}

impl SearchResult {
    /// The matching slot, or `NotFound` naming `what`.
    pub fn exact(&self, what: impl FnOnce() -> String) -> Result<usize> {
        match (self.found, self.slot) {
            (true, Some(slot)) => Ok(slot),
            _ => Err(HfsError::NotFound(what())),
        }
    }
}

/// A tree's header plus the key format it uses.
#[derive(Debug, Clone, Copy)]
pub struct BTree {
    pub id: TreeId,
    pub header: BTreeHeader,
    pub format: KeyFormat,
}

impl BTree {
    /// Descend from the root to the leaf that holds, or would hold, a key.
    ///
    /// `cmp` receives a record key (without its length prefix) and returns
    /// how that key orders against the search key.
    pub fn search<S, F>(&self, src: &mut S, mut cmp: F) -> Result<SearchResult>
    where
        S: NodeSource,
        F: FnMut(&[u8]) -> Result<Ordering>,
    {
        if self.header.root_node == 0 {
            return Err(HfsError::NotFound(format!("{:?} tree is empty", self.id)));
        }

        let mut node_index = self.header.root_node;
        for _ in 0..MAX_TREE_DEPTH {
            let node = src.read_node(self.id, node_index)?;
            let (slot, found) = self.floor_slot(&node, &mut cmp)?;
            match node.kind {
                NodeKind::Leaf => {
                    trace!(
                        "{:?} search ended in leaf {node_index}, slot {slot:?}, found={found}",
                        self.id
                    );
                    return Ok(SearchResult { node, slot, found });
                }
                NodeKind::Index => {
                    let (_, data) = node.key_and_data(slot.unwrap_or(0), self.format)?;
                    let child = u32_at(data, 0)?;
                    trace!("{:?} index node {node_index} -> child {child}", self.id);
                    if child == 0 || child >= self.header.total_nodes {
                        return Err(HfsError::corrupt(format!(
                            "index node {node_index} points at invalid child {child}"
                        )));
                    }
                    node_index = child;
                }
                kind => {
                    return Err(HfsError::corrupt(format!(
                        "unexpected {kind:?} node {node_index} during {:?} search",
                        self.id
                    )));
                }
            }
        }
        Err(HfsError::corrupt(format!(
            "{:?} tree deeper than {MAX_TREE_DEPTH} levels",
            self.id
        )))
    }

    /// Binary search one node for the greatest key <= the search key.
    fn floor_slot<F>(&self, node: &Node, cmp: &mut F) -> Result<(Option<usize>, bool)>
    where
        F: FnMut(&[u8]) -> Result<Ordering>,
    {
        let mut lo = 0usize;
        let mut hi = node.num_records();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (key, _) = node.key_and_data(mid, self.format)?;
            match cmp(key)? {
                Ordering::Equal => return Ok((Some(mid), true)),
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
            }
        }
        Ok((lo.checked_sub(1), false))
    }

    /// Follow a leaf's forward link. `None` at the end of the tree.
    pub fn next_leaf<S: NodeSource>(&self, src: &mut S, node: &Node) -> Result<Option<Node>> {
        if node.next == 0 {
            if node.index != self.header.last_leaf_node {
                warn!(
                    "{:?} leaf {} has no forward link but last leaf is {}",
                    self.id, node.index, self.header.last_leaf_node
                );
            }
            return Ok(None);
        }
        if node.next == node.index {
            return Err(HfsError::corrupt(format!(
                "{:?} leaf {} links to itself",
                self.id, node.index
            )));
        }
        let next = src.read_node(self.id, node.next)?;
        if next.kind != NodeKind::Leaf {
            return Err(HfsError::corrupt(format!(
                "leaf {} links to non-leaf node {}",
                node.index, next.index
            )));
        }
        Ok(Some(next))
    }
}
