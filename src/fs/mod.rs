pub mod btree;
pub mod catalog;
pub mod entry;
pub mod extents;
pub mod names;
pub(crate) mod raw;
pub mod volume;

use std::io::{Read, Seek};
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, trace, warn};

use crate::cache::BlockCache;
use crate::config::LoaderConfig;
use crate::error::{HfsError, Result};
use btree::{
    BTree, BTreeHeader, KeyFormat, Node, NodeSource, TreeId, BINARY_COMPARE, HEADER_NODE_PREFIX,
};
use volume::{read_volume_header, ForkData, VolumeFormat, VolumeHeader};

pub use catalog::{
    CatalogHit, CatalogKey, CatalogName, CatalogRecord, Collation, DirIndex, ROOT_FOLDER_ID,
    ROOT_PARENT_ID,
};
pub use entry::{DirEntry, EntryKind, FileFlags};

/// Catalog node ID of the extents overflow file.
pub const EXTENTS_FILE_ID: u32 = 3;
/// Catalog node ID of the catalog file.
pub const CATALOG_FILE_ID: u32 = 4;

static NEXT_GENERATION: AtomicU32 = AtomicU32::new(1);

/// A mounted HFS or HFS+ volume.
///
/// Owns the device reader behind a block cache, plus the decoded volume
/// header and the lazily loaded B-tree headers. All lookups go through
/// `&mut self` because they may fill the cache.
pub struct HfsVolume<R: Read + Seek> {
    cache: BlockCache<R>,
    header: VolumeHeader,
    catalog: Option<BTree>,
    extents: Option<BTree>,
    collation: Collation,
    config: LoaderConfig,
    generation: u32,
}

impl<R: Read + Seek> HfsVolume<R> {
    /// Detect and mount the volume at `config.partition_offset`.
    pub fn mount(reader: R, config: LoaderConfig) -> Result<Self> {
        let mut cache = BlockCache::new(reader, 512, config.cache_blocks);
        let header = read_volume_header(&mut cache, config.partition_offset)?;
        cache.reinit(header.block_size);

        let mut volume = HfsVolume {
            cache,
            header,
            catalog: None,
            extents: None,
            collation: Collation::MacRoman,
            config,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        };

        let catalog = volume.tree(TreeId::Catalog)?;
        let node_size = catalog.header.node_size as u32;
        if node_size > volume.header.block_size {
            volume.cache.reinit(node_size);
        }
        volume.collation = match volume.header.format {
            VolumeFormat::Hfs => Collation::MacRoman,
            VolumeFormat::Hfsx if catalog.header.key_compare_type == BINARY_COMPARE => {
                Collation::Binary
            }
            _ => Collation::CaseFolding,
        };

        if volume.header.is_plus() {
            volume.load_volume_name()?;
        }

        debug!(
            "mounted {} volume '{}': {} blocks of {} bytes, catalog node size {}, {:?} names",
            volume.header.fs_type(),
            volume.header.volume_name,
            volume.header.total_blocks,
            volume.header.block_size,
            node_size,
            volume.collation
        );
        Ok(volume)
    }

    /// HFS+ keeps the volume name in the root folder's thread record.
    fn load_volume_name(&mut self) -> Result<()> {
        let key = self.catalog_key(ROOT_FOLDER_ID, "")?;
        match self.lookup(&key) {
            Ok(CatalogHit {
                record: CatalogRecord::FolderThread { name, .. },
                ..
            }) => {
                self.header.volume_name = name.to_utf8();
                Ok(())
            }
            Ok(hit) => Err(HfsError::corrupt(format!(
                "root thread key holds {:?}",
                hit.record
            ))),
            Err(HfsError::NotFound(_)) => {
                warn!("volume has no root folder thread record");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn volume_name(&self) -> &str {
        &self.header.volume_name
    }

    pub fn collation(&self) -> Collation {
        self.collation
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Identifies this mount; directory cursors carry it.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Block cache (hits, misses).
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    pub fn into_inner(self) -> R {
        self.cache.into_inner()
    }

    fn fork_of(&self, id: TreeId) -> ForkData {
        match id {
            TreeId::Catalog => self.header.catalog_fork,
            TreeId::Extents => self.header.extents_fork,
        }
    }

    /// Header of a B-tree, read from node 0 on first use.
    pub(crate) fn tree(&mut self, id: TreeId) -> Result<BTree> {
        let cached = match id {
            TreeId::Catalog => self.catalog,
            TreeId::Extents => self.extents,
        };
        if let Some(tree) = cached {
            return Ok(tree);
        }

        let fork = self.fork_of(id);
        let mut node0 = [0u8; HEADER_NODE_PREFIX];
        let n = self.read_extent(&fork, id.file_id(), 0, &mut node0, true)?;
        let header = BTreeHeader::parse(&node0[..n])?;
        let tree = BTree {
            id,
            header,
            format: if self.header.is_plus() {
                KeyFormat::Plus
            } else {
                KeyFormat::Classic
            },
        };
        debug!(
            "{id:?} tree: root={}, depth={}, node_size={}, total_nodes={}, leaf_records={}",
            header.root_node,
            header.depth,
            header.node_size,
            header.total_nodes,
            header.leaf_records
        );
        match id {
            TreeId::Catalog => self.catalog = Some(tree),
            TreeId::Extents => self.extents = Some(tree),
        }
        Ok(tree)
    }

    /// Resolve `path` to a regular file that may be loaded.
    fn open_file(&mut self, path: &str) -> Result<(ForkData, u32)> {
        let hit = self.resolve_path(path, ROOT_FOLDER_ID)?;
        let (fork, file_id) = match &hit.record {
            CatalogRecord::File {
                data_fork, file_id, ..
            } => (*data_fork, *file_id),
            _ => return Err(HfsError::NotAFile(path.to_string())),
        };
        self.check_ownership(path, &hit.record.flags())?;
        Ok((fork, file_id))
    }

    fn check_ownership(&self, path: &str, flags: &FileFlags) -> Result<()> {
        if !self.config.enforce_ownership {
            return Ok(());
        }
        if flags.owner_not_root {
            return Err(HfsError::PermissionDenied(format!(
                "{path}: not owned by root"
            )));
        }
        if flags.group_or_other_writable() {
            return Err(HfsError::PermissionDenied(format!(
                "{path}: mode {:o} is group or other writable",
                flags.permissions()
            )));
        }
        Ok(())
    }

    /// Read a whole file's data fork.
    pub fn load_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let (fork, file_id) = self.open_file(path)?;
        let limit = self.config.max_file_size;
        if fork.logical_size > limit {
            return Err(HfsError::FileTooLarge {
                size: fork.logical_size,
                limit,
            });
        }
        let mut data = vec![0u8; fork.logical_size as usize];
        let n = self.read_extent(&fork, file_id, 0, &mut data, false)?;
        data.truncate(n);
        trace!("loaded {path}: {n} bytes");
        Ok(data)
    }

    /// Read a whole file's data fork into `buf`, returning its length.
    pub fn load_file_into(&mut self, path: &str, buf: &mut [u8]) -> Result<usize> {
        let (fork, file_id) = self.open_file(path)?;
        let limit = (buf.len() as u64).min(self.config.max_file_size);
        if fork.logical_size > limit {
            return Err(HfsError::FileTooLarge {
                size: fork.logical_size,
                limit,
            });
        }
        let len = fork.logical_size as usize;
        self.read_extent(&fork, file_id, 0, &mut buf[..len], false)
    }

    /// Read part of a file's data fork. Returns 0 at or past end of file.
    ///
    /// On a device error the prefix of `buf` reported by
    /// [`HfsError::bytes_copied`] is valid.
    pub fn read_file_range(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let (fork, file_id) = self.open_file(path)?;
        self.read_extent(&fork, file_id, offset, buf, false)
    }
}

impl<R: Read + Seek> NodeSource for HfsVolume<R> {
    fn read_node(&mut self, id: TreeId, index: u32) -> Result<Node> {
        let tree = self.tree(id)?;
        if index >= tree.header.total_nodes {
            return Err(HfsError::corrupt(format!(
                "{id:?} node {index} out of range ({} nodes)",
                tree.header.total_nodes
            )));
        }
        let size = tree.header.node_size as usize;
        let fork = self.fork_of(id);
        let mut data = vec![0u8; size];
        let n = self.read_extent(&fork, id.file_id(), index as u64 * size as u64, &mut data, true)?;
        if n < size {
            return Err(HfsError::corrupt(format!(
                "{id:?} node {index} lies past the end of its file"
            )));
        }
        trace!("read {id:?} node {index}");
        Node::parse(index, data)
    }
}
