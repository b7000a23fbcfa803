//! Catalog keys and records, path resolution, and directory iteration.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::io::{Read, Seek};

use log::debug;

use super::btree::{KeyFormat, Node, NodeKind, NodeSource, TreeId};
use super::entry::{mac_time_to_unix, DirEntry, EntryKind, FileFlags};
use super::names::{
    compare_binary, compare_mac_roman, compare_unicode, mac_roman_to_utf8, read_utf16be,
    utf16_to_utf8, utf8_to_mac_roman, utf8_to_utf16, MAX_CLASSIC_NAME, MAX_PLUS_NAME,
};
use super::raw::{bytes, i16_at, u16_at, u32_at, u8_at};
use super::volume::{ExtentRecord, ForkData};
use super::HfsVolume;
use crate::error::{HfsError, Result};

/// Parent ID of the root folder.
pub const ROOT_PARENT_ID: u32 = 1;
pub const ROOT_FOLDER_ID: u32 = 2;

/// Folder in the volume root holding hard-link targets.
pub const PRIVATE_DATA_DIR: &str = "\0\0\0\0HFS+ Private Data";
const HARD_LINK_TYPE: [u8; 4] = *b"hlnk";
const HARD_LINK_CREATOR: [u8; 4] = *b"hfs+";

const FOLDER_RECORD: i16 = 1;
const FILE_RECORD: i16 = 2;
const FOLDER_THREAD_RECORD: i16 = 3;
const FILE_THREAD_RECORD: i16 = 4;

// Record payload sizes.
const PLUS_FOLDER_SIZE: usize = 88;
const PLUS_FILE_SIZE: usize = 248;
const CLASSIC_FOLDER_SIZE: usize = 70;
const CLASSIC_FILE_SIZE: usize = 102;
const CLASSIC_THREAD_SIZE: usize = 46;

/// A catalog node name in its on-disk encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogName {
    /// Mac Roman, at most 31 bytes.
    Roman(Vec<u8>),
    /// UTF-16, at most 255 code units.
    Unicode(Vec<u16>),
}

impl CatalogName {
    pub fn is_empty(&self) -> bool {
        match self {
            CatalogName::Roman(b) => b.is_empty(),
            CatalogName::Unicode(u) => u.is_empty(),
        }
    }

    pub fn to_utf8(&self) -> String {
        match self {
            CatalogName::Roman(b) => mac_roman_to_utf8(b),
            CatalogName::Unicode(u) => utf16_to_utf8(u),
        }
    }

    /// Classic Str31: length byte followed by the bytes.
    fn parse_pascal(data: &[u8], at: usize) -> Result<Self> {
        let len = u8_at(data, at)? as usize;
        if len > MAX_CLASSIC_NAME {
            return Err(HfsError::corrupt(format!("classic name length {len}")));
        }
        Ok(CatalogName::Roman(bytes(data, at + 1, len)?.to_vec()))
    }

    /// HFSUniStr255: u16 length followed by UTF-16BE units.
    fn parse_unicode(data: &[u8], at: usize) -> Result<Self> {
        let len = u16_at(data, at)? as usize;
        if len > MAX_PLUS_NAME {
            return Err(HfsError::corrupt(format!("unicode name length {len}")));
        }
        Ok(CatalogName::Unicode(read_utf16be(bytes(
            data,
            at + 2,
            len * 2,
        )?)))
    }
}

impl fmt::Display for CatalogName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_utf8())
    }
}

/// How a volume orders catalog names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collation {
    MacRoman,
    CaseFolding,
    Binary,
}

impl Collation {
    pub fn compare(self, a: &CatalogName, b: &CatalogName) -> Ordering {
        match (a, b) {
            (CatalogName::Roman(x), CatalogName::Roman(y)) => compare_mac_roman(x, y),
            (CatalogName::Unicode(x), CatalogName::Unicode(y)) => match self {
                Collation::Binary => compare_binary(x, y),
                _ => compare_unicode(x, y),
            },
            _ => a.to_utf8().cmp(&b.to_utf8()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKey {
    pub parent_id: u32,
    pub name: CatalogName,
}

impl CatalogKey {
    /// Decode a key (without its length prefix).
    pub fn parse(key: &[u8], format: KeyFormat) -> Result<Self> {
        match format {
            // reserved(1) parentID(4) Str31
            KeyFormat::Classic => Ok(CatalogKey {
                parent_id: u32_at(key, 1)?,
                name: CatalogName::parse_pascal(key, 5)?,
            }),
            // parentID(4) HFSUniStr255
            KeyFormat::Plus => Ok(CatalogKey {
                parent_id: u32_at(key, 0)?,
                name: CatalogName::parse_unicode(key, 4)?,
            }),
        }
    }

    /// Parent ID first (unsigned), then name.
    pub fn compare(&self, other: &CatalogKey, collation: Collation) -> Ordering {
        self.parent_id
            .cmp(&other.parent_id)
            .then_with(|| collation.compare(&self.name, &other.name))
    }
}

/// Ownership and mode from an HFS+ record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub file_mode: u16,
    /// Inode number for hard links, link count for inodes.
    pub special: u32,
}

impl BsdInfo {
    fn parse(data: &[u8]) -> Result<Self> {
        Ok(BsdInfo {
            owner_id: u32_at(data, 0)?,
            group_id: u32_at(data, 4)?,
            file_mode: u16_at(data, 10)?,
            special: u32_at(data, 12)?,
        })
    }
}

#[derive(Debug, Clone)]
pub enum CatalogRecord {
    Folder {
        folder_id: u32,
        valence: u32,
        modify_date: u32,
        bsd: Option<BsdInfo>,
    },
    File {
        file_id: u32,
        modify_date: u32,
        bsd: Option<BsdInfo>,
        file_type: [u8; 4],
        creator: [u8; 4],
        data_fork: ForkData,
    },
    FolderThread {
        parent_id: u32,
        name: CatalogName,
    },
    FileThread {
        parent_id: u32,
        name: CatalogName,
    },
}

impl CatalogRecord {
    pub fn parse(data: &[u8], format: KeyFormat) -> Result<Self> {
        match format {
            KeyFormat::Plus => Self::parse_plus(data),
            KeyFormat::Classic => Self::parse_classic(data),
        }
    }

    fn parse_plus(data: &[u8]) -> Result<Self> {
        match i16_at(data, 0)? {
            FOLDER_RECORD => {
                let rec = bytes(data, 0, PLUS_FOLDER_SIZE)?;
                Ok(CatalogRecord::Folder {
                    folder_id: u32_at(rec, 8)?,
                    valence: u32_at(rec, 4)?,
                    modify_date: u32_at(rec, 16)?,
                    bsd: Some(BsdInfo::parse(bytes(rec, 32, 16)?)?),
                })
            }
            FILE_RECORD => {
                let rec = bytes(data, 0, PLUS_FILE_SIZE)?;
                Ok(CatalogRecord::File {
                    file_id: u32_at(rec, 8)?,
                    modify_date: u32_at(rec, 16)?,
                    bsd: Some(BsdInfo::parse(bytes(rec, 32, 16)?)?),
                    file_type: fourcc(rec, 48)?,
                    creator: fourcc(rec, 52)?,
                    data_fork: ForkData::parse_plus(bytes(rec, 88, 80)?)?,
                })
            }
            FOLDER_THREAD_RECORD => Ok(CatalogRecord::FolderThread {
                parent_id: u32_at(data, 4)?,
                name: CatalogName::parse_unicode(data, 8)?,
            }),
            FILE_THREAD_RECORD => Ok(CatalogRecord::FileThread {
                parent_id: u32_at(data, 4)?,
                name: CatalogName::parse_unicode(data, 8)?,
            }),
            other => Err(HfsError::corrupt(format!("unknown catalog record type {other}"))),
        }
    }

    fn parse_classic(data: &[u8]) -> Result<Self> {
        match u8_at(data, 0)? as i8 as i16 {
            FOLDER_RECORD => {
                let rec = bytes(data, 0, CLASSIC_FOLDER_SIZE)?;
                Ok(CatalogRecord::Folder {
                    folder_id: u32_at(rec, 6)?,
                    valence: u16_at(rec, 4)? as u32,
                    modify_date: u32_at(rec, 14)?,
                    bsd: None,
                })
            }
            FILE_RECORD => {
                let rec = bytes(data, 0, CLASSIC_FILE_SIZE)?;
                Ok(CatalogRecord::File {
                    file_id: u32_at(rec, 20)?,
                    modify_date: u32_at(rec, 48)?,
                    bsd: None,
                    file_type: fourcc(rec, 4)?,
                    creator: fourcc(rec, 8)?,
                    data_fork: ForkData {
                        logical_size: u32_at(rec, 26)? as u64,
                        extents: ExtentRecord::parse_classic(bytes(rec, 74, 12)?)?,
                    },
                })
            }
            FOLDER_THREAD_RECORD => {
                let rec = bytes(data, 0, CLASSIC_THREAD_SIZE)?;
                Ok(CatalogRecord::FolderThread {
                    parent_id: u32_at(rec, 10)?,
                    name: CatalogName::parse_pascal(rec, 14)?,
                })
            }
            FILE_THREAD_RECORD => {
                let rec = bytes(data, 0, CLASSIC_THREAD_SIZE)?;
                Ok(CatalogRecord::FileThread {
                    parent_id: u32_at(rec, 10)?,
                    name: CatalogName::parse_pascal(rec, 14)?,
                })
            }
            other => Err(HfsError::corrupt(format!("unknown catalog record type {other}"))),
        }
    }

    pub fn flags(&self) -> FileFlags {
        let (kind, bsd) = match self {
            CatalogRecord::Folder { bsd, .. } => (EntryKind::Directory, bsd),
            CatalogRecord::File { bsd, .. } => (EntryKind::File, bsd),
            _ => return FileFlags::unknown(),
        };
        FileFlags {
            kind,
            mode: bsd.and_then(|b| (b.file_mode != 0).then_some(b.file_mode)),
            owner_not_root: bsd.is_some_and(|b| b.owner_id != 0),
        }
    }

    /// Modification time in Unix seconds; 0 for thread records.
    pub fn mtime(&self) -> u32 {
        match self {
            CatalogRecord::Folder { modify_date, .. } | CatalogRecord::File { modify_date, .. } => {
                mac_time_to_unix(*modify_date)
            }
            _ => 0,
        }
    }

    /// Inode number when this is an HFS+ hard-link placeholder.
    pub fn hard_link_inode(&self) -> Option<u32> {
        match self {
            CatalogRecord::File {
                file_type,
                creator,
                bsd: Some(bsd),
                ..
            } if *file_type == HARD_LINK_TYPE && *creator == HARD_LINK_CREATOR => {
                Some(bsd.special)
            }
            _ => None,
        }
    }
}

fn fourcc(data: &[u8], at: usize) -> Result<[u8; 4]> {
    let mut code = [0u8; 4];
    code.copy_from_slice(bytes(data, at, 4)?);
    Ok(code)
}

/// A decoded catalog leaf record and where it was found.
#[derive(Debug, Clone)]
pub struct CatalogHit {
    pub key: CatalogKey,
    pub record: CatalogRecord,
    pub node: u32,
    pub slot: usize,
}

impl CatalogHit {
    /// Folder ID when the hit is a folder or a folder's thread.
    pub fn directory_id(&self) -> Option<u32> {
        match self.record {
            CatalogRecord::Folder { folder_id, .. } => Some(folder_id),
            CatalogRecord::FolderThread { .. } => Some(self.key.parent_id),
            _ => None,
        }
    }

    pub fn to_dir_entry(&self) -> DirEntry {
        let (name, size, id) = match &self.record {
            CatalogRecord::Folder { folder_id, .. } => (self.key.name.to_utf8(), 0, *folder_id),
            CatalogRecord::File {
                file_id, data_fork, ..
            } => (self.key.name.to_utf8(), data_fork.logical_size, *file_id),
            CatalogRecord::FolderThread { name, .. } | CatalogRecord::FileThread { name, .. } => {
                (name.to_utf8(), 0, self.key.parent_id)
            }
        };
        DirEntry {
            name,
            flags: self.record.flags(),
            mtime: self.record.mtime(),
            size,
            id,
        }
    }
}

/// Position of a directory listing.
///
/// Tied to the mount that produced it; a cursor from an earlier mount is
/// rejected rather than followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirIndex(Cursor);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Cursor {
    #[default]
    Start,
    At {
        generation: u32,
        dir_id: u32,
        node: u32,
        slot: usize,
    },
    Exhausted,
}

impl DirIndex {
    pub const START: DirIndex = DirIndex(Cursor::Start);

    pub fn is_exhausted(&self) -> bool {
        self.0 == Cursor::Exhausted
    }

    /// (node, slot) of the next record to return, once positioned.
    pub fn position(&self) -> Option<(u32, usize)> {
        match self.0 {
            Cursor::At { node, slot, .. } => Some((node, slot)),
            _ => None,
        }
    }
}

fn leaf_key(node: &Node, slot: usize, format: KeyFormat) -> Result<CatalogKey> {
    let (key, _) = node.key_and_data(slot, format)?;
    CatalogKey::parse(key, format)
}

fn split_path(path: &str) -> VecDeque<String> {
    path.split(|c| c == '/' || c == '\\')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

impl<R: Read + Seek> HfsVolume<R> {
    /// Build a lookup key in the volume's name encoding.
    pub fn catalog_key(&self, parent_id: u32, name: &str) -> Result<CatalogKey> {
        let name = if self.header.is_plus() {
            CatalogName::Unicode(utf8_to_utf16(name)?)
        } else {
            CatalogName::Roman(utf8_to_mac_roman(name)?)
        };
        Ok(CatalogKey { parent_id, name })
    }

    /// Exact catalog lookup.
    pub fn lookup(&mut self, key: &CatalogKey) -> Result<CatalogHit> {
        let tree = self.tree(TreeId::Catalog)?;
        let format = tree.format;
        let collation = self.collation;
        let res = tree.search(self, |trial| {
            Ok(CatalogKey::parse(trial, format)?.compare(key, collation))
        })?;
        let slot = res.exact(|| format!("'{}' in folder {}", key.name, key.parent_id))?;
        let (k, d) = res.node.key_and_data(slot, format)?;
        Ok(CatalogHit {
            key: CatalogKey::parse(k, format)?,
            record: CatalogRecord::parse(d, format)?,
            node: res.node.index,
            slot,
        })
    }

    /// Resolve a '/' or '\' separated path relative to folder `start_dir`.
    ///
    /// An empty path resolves to the folder's thread record. Hard-link
    /// placeholders are followed into the private data folder, up to
    /// `max_link_depth` times.
    pub fn resolve_path(&mut self, path: &str, start_dir: u32) -> Result<CatalogHit> {
        let mut pending = split_path(path);
        let mut dir = start_dir;
        let mut links = 0u32;

        if pending.is_empty() {
            let key = self.catalog_key(dir, "")?;
            return self.lookup(&key);
        }

        while let Some(component) = pending.pop_front() {
            let key = self.catalog_key(dir, &component)?;
            let hit = self.lookup(&key)?;
            match hit.record {
                CatalogRecord::Folder { folder_id, .. } => {
                    if pending.is_empty() {
                        return Ok(hit);
                    }
                    dir = folder_id;
                }
                CatalogRecord::File { .. } => {
                    if let Some(inode) = self.hard_link_target(&hit.record) {
                        if links >= self.config.max_link_depth {
                            return Err(HfsError::corrupt(format!(
                                "hard link chain through '{component}' exceeds depth {}",
                                self.config.max_link_depth
                            )));
                        }
                        links += 1;
                        debug!("hard link '{component}' -> iNode{inode}");
                        pending.push_front(format!("iNode{inode}"));
                        pending.push_front(PRIVATE_DATA_DIR.to_string());
                        dir = ROOT_FOLDER_ID;
                        continue;
                    }
                    if !pending.is_empty() {
                        return Err(HfsError::NotFound(format!(
                            "{path}: '{component}' is not a directory"
                        )));
                    }
                    return Ok(hit);
                }
                CatalogRecord::FolderThread { .. } | CatalogRecord::FileThread { .. } => {
                    return Err(HfsError::corrupt(format!(
                        "name lookup of '{component}' returned a thread record"
                    )));
                }
            }
        }
        Err(HfsError::NotFound(path.to_string()))
    }

    fn hard_link_target(&self, record: &CatalogRecord) -> Option<u32> {
        if self.header.is_plus() {
            record.hard_link_inode()
        } else {
            None
        }
    }

    /// Resolve a path and describe it. Folders reached through their thread
    /// record (an empty path) are reported as the folder itself.
    pub fn stat(&mut self, path: &str) -> Result<DirEntry> {
        let hit = self.resolve_path(path, ROOT_FOLDER_ID)?;
        if let CatalogRecord::FolderThread { parent_id, name } = &hit.record {
            let key = CatalogKey {
                parent_id: *parent_id,
                name: name.clone(),
            };
            return Ok(self.lookup(&key)?.to_dir_entry());
        }
        Ok(hit.to_dir_entry())
    }

    /// Return the next entry of directory `dir_path` and advance `cursor`.
    ///
    /// `dir_path` is only consulted when `cursor` is at its start. `None`
    /// means the listing is exhausted; the cursor then stays exhausted.
    pub fn dir_entry(&mut self, dir_path: &str, cursor: &mut DirIndex) -> Result<Option<DirEntry>> {
        let (dir_id, node_index, mut slot) = match cursor.0 {
            Cursor::Exhausted => return Ok(None),
            Cursor::Start => {
                let hit = self.resolve_path(dir_path, ROOT_FOLDER_ID)?;
                let dir_id = hit.directory_id().ok_or_else(|| {
                    HfsError::NotFound(format!("{dir_path}: not a directory"))
                })?;
                let thread = match hit.record {
                    CatalogRecord::FolderThread { .. } => hit,
                    _ => {
                        let key = self.catalog_key(dir_id, "")?;
                        self.lookup(&key)?
                    }
                };
                (dir_id, thread.node, thread.slot + 1)
            }
            Cursor::At {
                generation,
                dir_id,
                node,
                slot,
            } => {
                if generation != self.generation {
                    return Err(HfsError::NotFound(
                        "directory cursor belongs to another mount".into(),
                    ));
                }
                (dir_id, node, slot)
            }
        };

        let tree = self.tree(TreeId::Catalog)?;
        let format = tree.format;
        let mut node = self.read_node(TreeId::Catalog, node_index)?;
        if node.kind != NodeKind::Leaf {
            return Err(HfsError::corrupt(format!(
                "directory cursor points at non-leaf node {node_index}"
            )));
        }

        // Key just before the read position, for checking leaf order.
        let mut prev = match slot.checked_sub(1) {
            Some(last) if last < node.num_records() => Some(leaf_key(&node, last, format)?),
            _ => None,
        };
        let mut hops = 0u32;

        loop {
            if slot >= node.num_records() {
                if let Some(last) = node.num_records().checked_sub(1) {
                    prev = Some(leaf_key(&node, last, format)?);
                }
                match tree.next_leaf(self, &node)? {
                    Some(next) => {
                        hops += 1;
                        if hops >= tree.header.total_nodes {
                            return Err(HfsError::corrupt(format!(
                                "catalog leaf chain from node {node_index} does not terminate"
                            )));
                        }
                        if let Some(before) = prev.as_ref().filter(|_| next.num_records() > 0) {
                            let first = leaf_key(&next, 0, format)?;
                            if first.compare(before, self.collation) != Ordering::Greater {
                                return Err(HfsError::corrupt(format!(
                                    "catalog leaf {} sorts before leaf {}",
                                    next.index, node.index
                                )));
                            }
                        }
                        node = next;
                        slot = 0;
                        continue;
                    }
                    None => {
                        cursor.0 = Cursor::Exhausted;
                        return Ok(None);
                    }
                }
            }

            let (k, d) = node.key_and_data(slot, format)?;
            let key = CatalogKey::parse(k, format)?;
            if key.parent_id != dir_id {
                cursor.0 = Cursor::Exhausted;
                return Ok(None);
            }
            let hit = CatalogHit {
                key,
                record: CatalogRecord::parse(d, format)?,
                node: node.index,
                slot,
            };
            cursor.0 = Cursor::At {
                generation: self.generation,
                dir_id,
                node: node.index,
                slot: slot + 1,
            };
            return Ok(Some(hit.to_dir_entry()));
        }
    }
}
