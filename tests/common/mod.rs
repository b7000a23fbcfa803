//! Synthetic HFS / HFS+ image writer for the end-to-end tests.
//!
//! Produces complete in-memory volumes: volume header or MDB, catalog and
//! extents-overflow B-trees, thread records, and file data. Files can be
//! split into deliberately non-adjacent fragments so that extent mapping and
//! overflow lookups are exercised; the gap blocks between fragments are
//! filled with `GAP_FILL` so a mapping mistake shows up in the data.

#![allow(dead_code)]

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};
use hfs_boot::fs::catalog::PRIVATE_DATA_DIR;
use hfs_boot::fs::names::{
    compare_binary, compare_mac_roman, compare_unicode, utf8_to_mac_roman, utf8_to_utf16,
};

pub const ROOT: u32 = 2;
pub const GAP_FILL: u8 = 0xEE;
/// Unix modification time given to every record.
pub const MTIME: u32 = 1_000_000;
const MAC_EPOCH_OFFSET: u32 = 2_082_844_800;

const EXTENTS_FILE_ID: u32 = 3;
const CATALOG_FILE_ID: u32 = 4;
const FIRST_USER_ID: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Plus,
    /// HFSX; `binary` selects the 0xBC key compare type.
    Hfsx { binary: bool },
    Classic,
}

#[derive(Debug, Clone, Copy)]
pub struct FileOptions {
    pub owner: u32,
    pub mode: u16,
    /// Number of separate runs the data fork is split into.
    pub fragments: usize,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            owner: 0,
            mode: 0o100644,
            fragments: 1,
        }
    }
}

#[derive(Debug, Clone)]
enum Item {
    Folder {
        parent: u32,
        name: String,
        id: u32,
    },
    File {
        parent: u32,
        name: String,
        id: u32,
        data: Vec<u8>,
        opts: FileOptions,
        /// Inode number when this is a hard-link placeholder.
        link: Option<u32>,
    },
}

pub struct ImageBuilder {
    flavor: Flavor,
    block_size: u32,
    node_size: usize,
    leaf_fanout: usize,
    catalog_fragments: usize,
    volume_name: String,
    system_dir: u32,
    next_id: u32,
    private_dir: Option<u32>,
    items: Vec<Item>,
}

impl ImageBuilder {
    pub fn plus() -> Self {
        Self::new(Flavor::Plus, 4096, 4096)
    }

    pub fn hfsx(binary: bool) -> Self {
        Self::new(Flavor::Hfsx { binary }, 4096, 4096)
    }

    pub fn classic() -> Self {
        Self::new(Flavor::Classic, 512, 512)
    }

    fn new(flavor: Flavor, block_size: u32, node_size: usize) -> Self {
        Self {
            flavor,
            block_size,
            node_size,
            leaf_fanout: usize::MAX,
            catalog_fragments: 1,
            volume_name: "Boot".to_string(),
            system_dir: 0,
            next_id: FIRST_USER_ID,
            private_dir: None,
            items: Vec::new(),
        }
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn node_size(mut self, node_size: usize) -> Self {
        self.node_size = node_size;
        self
    }

    /// Cap the records per B-tree node to force deeper trees.
    pub fn leaf_fanout(mut self, fanout: usize) -> Self {
        self.leaf_fanout = fanout.max(2);
        self
    }

    /// Split the catalog file into this many runs.
    pub fn catalog_fragments(mut self, fragments: usize) -> Self {
        self.catalog_fragments = fragments.max(1);
        self
    }

    pub fn volume_name(mut self, name: &str) -> Self {
        self.volume_name = name.to_string();
        self
    }

    pub fn set_system_dir(&mut self, id: u32) {
        self.system_dir = id;
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn folder(&mut self, parent: u32, name: &str) -> u32 {
        let id = self.alloc_id();
        self.items.push(Item::Folder {
            parent,
            name: name.to_string(),
            id,
        });
        id
    }

    pub fn file(&mut self, parent: u32, name: &str, data: &[u8]) -> u32 {
        self.file_with(parent, name, data, FileOptions::default())
    }

    pub fn file_with(&mut self, parent: u32, name: &str, data: &[u8], opts: FileOptions) -> u32 {
        let id = self.alloc_id();
        self.items.push(Item::File {
            parent,
            name: name.to_string(),
            id,
            data: data.to_vec(),
            opts,
            link: None,
        });
        id
    }

    pub fn private_dir(&mut self) -> u32 {
        match self.private_dir {
            Some(id) => id,
            None => {
                let id = self.folder(ROOT, PRIVATE_DATA_DIR);
                self.private_dir = Some(id);
                id
            }
        }
    }

    /// A hard-link placeholder pointing at `iNode<inode>`.
    pub fn link_placeholder(&mut self, parent: u32, name: &str, inode: u32) -> u32 {
        let id = self.alloc_id();
        self.items.push(Item::File {
            parent,
            name: name.to_string(),
            id,
            data: Vec::new(),
            opts: FileOptions::default(),
            link: Some(inode),
        });
        id
    }

    /// A hard-linked file: the data lives in the private folder as
    /// `iNode<id>`, and `parent/name` is a placeholder. Returns the inode ID.
    pub fn hard_link(&mut self, parent: u32, name: &str, data: &[u8]) -> u32 {
        let private = self.private_dir();
        let inode = self.alloc_id();
        self.items.push(Item::File {
            parent: private,
            name: format!("iNode{inode}"),
            id: inode,
            data: data.to_vec(),
            opts: FileOptions::default(),
            link: None,
        });
        self.link_placeholder(parent, name, inode);
        inode
    }

    fn is_classic(&self) -> bool {
        self.flavor == Flavor::Classic
    }

    fn inline_slots(&self) -> usize {
        if self.is_classic() {
            3
        } else {
            8
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut layout = if self.is_classic() {
            // Allocation block 0 at sector 8.
            Layout::new(self.block_size, 4096, 0)
        } else {
            Layout::new(self.block_size, 0, 4096u32.div_ceil(self.block_size))
        };

        let mut forks: Vec<(u32, Vec<(u32, u32)>)> = Vec::new();
        for item in &self.items {
            if let Item::File { id, data, opts, .. } = item {
                forks.push((*id, layout.allocate(data, opts.fragments)));
            }
        }

        let catalog = self.catalog_tree(&forks);
        let catalog_extents = layout.allocate(&catalog, self.catalog_fragments);

        let mut overflow: Vec<(u32, u32, Vec<(u32, u32)>)> = Vec::new();
        for (id, extents) in forks
            .iter()
            .map(|(id, e)| (*id, e))
            .chain(std::iter::once((CATALOG_FILE_ID, &catalog_extents)))
        {
            let mut covered: u32 = extents
                .iter()
                .take(self.inline_slots())
                .map(|e| e.1)
                .sum();
            let slots = self.inline_slots();
            for chunk in extents[extents.len().min(slots)..].chunks(slots) {
                overflow.push((id, covered, chunk.to_vec()));
                covered += chunk.iter().map(|e| e.1).sum::<u32>();
            }
        }
        overflow.sort_by_key(|(id, start, _)| (*id, *start));
        assert!(overflow.iter().all(|(id, _, _)| *id != EXTENTS_FILE_ID));

        let extents_tree = self.extents_tree(&overflow);
        let extents_extents = layout.allocate(&extents_tree, 1);

        let total_blocks = layout.next_block + 1;
        layout.ensure(layout.block_offset(total_blocks) as usize);

        let header = if self.is_classic() {
            self.mdb(
                &layout,
                total_blocks,
                (catalog.len() as u32, &catalog_extents),
                (extents_tree.len() as u32, &extents_extents),
            )
        } else {
            self.plus_header(
                total_blocks,
                (catalog.len() as u64, &catalog_extents),
                (extents_tree.len() as u64, &extents_extents),
            )
        };
        layout.write(1024, &header);
        layout.image
    }

    fn mac_time() -> u32 {
        MTIME + MAC_EPOCH_OFFSET
    }

    // -- catalog ----------------------------------------------------------

    fn encode_name(&self, name: &str) -> Name {
        if self.is_classic() {
            Name::Roman(utf8_to_mac_roman(name).expect("name encodes as Mac Roman"))
        } else {
            Name::Unicode(utf8_to_utf16(name).expect("name encodes as UTF-16"))
        }
    }

    fn compare(&self, a: &(u32, Name), b: &(u32, Name)) -> Ordering {
        a.0.cmp(&b.0).then_with(|| match (&a.1, &b.1) {
            (Name::Roman(x), Name::Roman(y)) => compare_mac_roman(x, y),
            (Name::Unicode(x), Name::Unicode(y)) => match self.flavor {
                Flavor::Hfsx { binary: true } => compare_binary(x, y),
                _ => compare_unicode(x, y),
            },
            _ => unreachable!("mixed name encodings"),
        })
    }

    fn catalog_key(&self, parent: u32, name: &Name) -> Vec<u8> {
        match name {
            Name::Roman(bytes) => {
                let mut key = vec![0u8; 6 + bytes.len()];
                BigEndian::write_u32(&mut key[1..5], parent);
                key[5] = bytes.len() as u8;
                key[6..].copy_from_slice(bytes);
                key
            }
            Name::Unicode(units) => {
                let mut key = vec![0u8; 6 + units.len() * 2];
                BigEndian::write_u32(&mut key[0..4], parent);
                BigEndian::write_u16(&mut key[4..6], units.len() as u16);
                for (i, u) in units.iter().enumerate() {
                    BigEndian::write_u16(&mut key[6 + i * 2..8 + i * 2], *u);
                }
                key
            }
        }
    }

    fn catalog_tree(&self, forks: &[(u32, Vec<(u32, u32)>)]) -> Vec<u8> {
        let mut valence: std::collections::HashMap<u32, u32> = Default::default();
        for item in &self.items {
            let parent = match item {
                Item::Folder { parent, .. } | Item::File { parent, .. } => *parent,
            };
            *valence.entry(parent).or_default() += 1;
        }
        let valence_of = |id: u32| valence.get(&id).copied().unwrap_or(0);

        let mut records: Vec<((u32, Name), Vec<u8>)> = Vec::new();
        let volume = self.encode_name(&self.volume_name);
        records.push(((1, volume.clone()), self.folder_record(ROOT, valence_of(ROOT))));
        records.push(((ROOT, self.empty_name()), self.thread_record(3, 1, &volume)));

        for item in &self.items {
            match item {
                Item::Folder { parent, name, id } => {
                    let name = self.encode_name(name);
                    let record = self.folder_record(*id, valence_of(*id));
                    records.push(((*parent, name.clone()), record));
                    records.push(((*id, self.empty_name()), self.thread_record(3, *parent, &name)));
                }
                Item::File {
                    parent,
                    name,
                    id,
                    data,
                    opts,
                    link,
                } => {
                    let extents = &forks
                        .iter()
                        .find(|(fid, _)| fid == id)
                        .expect("fork allocated")
                        .1;
                    let name = self.encode_name(name);
                    records.push((
                        (*parent, name.clone()),
                        self.file_record(*id, data.len() as u64, extents, opts, *link),
                    ));
                    records.push(((*id, self.empty_name()), self.thread_record(4, *parent, &name)));
                }
            }
        }
        records.sort_by(|a, b| self.compare(&a.0, &b.0));

        let leaves: Vec<(Vec<u8>, Vec<u8>)> = records
            .into_iter()
            .map(|((parent, name), data)| (self.catalog_key(parent, &name), data))
            .collect();

        let shape = if self.is_classic() {
            TreeShape {
                node_size: self.node_size,
                wide_keys: false,
                fanout: self.leaf_fanout,
                max_key_len: 37,
                key_compare: 0,
                attributes: 0,
                fixed_index_key: Some(37),
            }
        } else {
            TreeShape {
                node_size: self.node_size,
                wide_keys: true,
                fanout: self.leaf_fanout,
                max_key_len: 516,
                key_compare: match self.flavor {
                    Flavor::Hfsx { binary: true } => 0xBC,
                    Flavor::Hfsx { binary: false } => 0xCF,
                    _ => 0,
                },
                attributes: 6,
                fixed_index_key: None,
            }
        };
        build_tree(&shape, leaves)
    }

    fn empty_name(&self) -> Name {
        if self.is_classic() {
            Name::Roman(Vec::new())
        } else {
            Name::Unicode(Vec::new())
        }
    }

    fn folder_record(&self, id: u32, valence: u32) -> Vec<u8> {
        if self.is_classic() {
            let mut rec = vec![0u8; 70];
            rec[0] = 1;
            BigEndian::write_u16(&mut rec[4..6], valence as u16);
            BigEndian::write_u32(&mut rec[6..10], id);
            BigEndian::write_u32(&mut rec[10..14], Self::mac_time());
            BigEndian::write_u32(&mut rec[14..18], Self::mac_time());
            rec
        } else {
            let mut rec = vec![0u8; 88];
            BigEndian::write_i16(&mut rec[0..2], 1);
            BigEndian::write_u32(&mut rec[4..8], valence);
            BigEndian::write_u32(&mut rec[8..12], id);
            BigEndian::write_u32(&mut rec[12..16], Self::mac_time());
            BigEndian::write_u32(&mut rec[16..20], Self::mac_time());
            BigEndian::write_u16(&mut rec[42..44], 0o040755);
            rec
        }
    }

    fn file_record(
        &self,
        id: u32,
        logical_size: u64,
        extents: &[(u32, u32)],
        opts: &FileOptions,
        link: Option<u32>,
    ) -> Vec<u8> {
        let total: u32 = extents.iter().map(|e| e.1).sum();
        if self.is_classic() {
            let mut rec = vec![0u8; 102];
            rec[0] = 2;
            rec[4..8].copy_from_slice(b"BINA");
            rec[8..12].copy_from_slice(b"hfsb");
            BigEndian::write_u32(&mut rec[20..24], id);
            BigEndian::write_u32(&mut rec[26..30], logical_size as u32);
            BigEndian::write_u32(&mut rec[30..34], total * self.block_size);
            BigEndian::write_u32(&mut rec[44..48], Self::mac_time());
            BigEndian::write_u32(&mut rec[48..52], Self::mac_time());
            for (i, &(start, count)) in extents.iter().take(3).enumerate() {
                BigEndian::write_u16(&mut rec[74 + i * 4..76 + i * 4], start as u16);
                BigEndian::write_u16(&mut rec[76 + i * 4..78 + i * 4], count as u16);
            }
            rec
        } else {
            let mut rec = vec![0u8; 248];
            BigEndian::write_i16(&mut rec[0..2], 2);
            BigEndian::write_u32(&mut rec[8..12], id);
            BigEndian::write_u32(&mut rec[12..16], Self::mac_time());
            BigEndian::write_u32(&mut rec[16..20], Self::mac_time());
            BigEndian::write_u32(&mut rec[32..36], opts.owner);
            BigEndian::write_u16(&mut rec[42..44], opts.mode);
            match link {
                Some(inode) => {
                    BigEndian::write_u32(&mut rec[44..48], inode);
                    rec[48..52].copy_from_slice(b"hlnk");
                    rec[52..56].copy_from_slice(b"hfs+");
                }
                None => {
                    BigEndian::write_u32(&mut rec[44..48], 1);
                    rec[48..52].copy_from_slice(b"BINA");
                    rec[52..56].copy_from_slice(b"hfsb");
                }
            }
            rec[88..168].copy_from_slice(&plus_fork(logical_size, total, extents));
            rec
        }
    }

    fn thread_record(&self, kind: u8, parent: u32, name: &Name) -> Vec<u8> {
        match name {
            Name::Roman(bytes) => {
                let mut rec = vec![0u8; 46];
                rec[0] = kind;
                BigEndian::write_u32(&mut rec[10..14], parent);
                rec[14] = bytes.len() as u8;
                rec[15..15 + bytes.len()].copy_from_slice(bytes);
                rec
            }
            Name::Unicode(units) => {
                let mut rec = vec![0u8; 10 + units.len() * 2];
                BigEndian::write_i16(&mut rec[0..2], kind as i16);
                BigEndian::write_u32(&mut rec[4..8], parent);
                BigEndian::write_u16(&mut rec[8..10], units.len() as u16);
                for (i, u) in units.iter().enumerate() {
                    BigEndian::write_u16(&mut rec[10 + i * 2..12 + i * 2], *u);
                }
                rec
            }
        }
    }

    // -- extents overflow -------------------------------------------------

    fn extents_tree(&self, overflow: &[(u32, u32, Vec<(u32, u32)>)]) -> Vec<u8> {
        let leaves = overflow
            .iter()
            .map(|(id, start, extents)| {
                if self.is_classic() {
                    let mut key = vec![0u8; 7];
                    BigEndian::write_u32(&mut key[1..5], *id);
                    BigEndian::write_u16(&mut key[5..7], *start as u16);
                    let mut data = vec![0u8; 12];
                    for (i, &(s, c)) in extents.iter().enumerate() {
                        BigEndian::write_u16(&mut data[i * 4..i * 4 + 2], s as u16);
                        BigEndian::write_u16(&mut data[i * 4 + 2..i * 4 + 4], c as u16);
                    }
                    (key, data)
                } else {
                    let mut key = vec![0u8; 10];
                    BigEndian::write_u32(&mut key[2..6], *id);
                    BigEndian::write_u32(&mut key[6..10], *start);
                    let mut data = vec![0u8; 64];
                    for (i, &(s, c)) in extents.iter().enumerate() {
                        BigEndian::write_u32(&mut data[i * 8..i * 8 + 4], s);
                        BigEndian::write_u32(&mut data[i * 8 + 4..i * 8 + 8], c);
                    }
                    (key, data)
                }
            })
            .collect();

        let shape = TreeShape {
            node_size: if self.is_classic() { 512 } else { self.node_size },
            wide_keys: !self.is_classic(),
            fanout: self.leaf_fanout,
            max_key_len: if self.is_classic() { 7 } else { 10 },
            key_compare: 0,
            attributes: if self.is_classic() { 0 } else { 2 },
            fixed_index_key: None,
        };
        build_tree(&shape, leaves)
    }

    // -- volume headers ---------------------------------------------------

    fn plus_header(
        &self,
        total_blocks: u32,
        catalog: (u64, &[(u32, u32)]),
        extents: (u64, &[(u32, u32)]),
    ) -> Vec<u8> {
        let mut vh = vec![0u8; 512];
        let (sig, version) = match self.flavor {
            Flavor::Hfsx { .. } => (0x4858, 5),
            _ => (0x482B, 4),
        };
        BigEndian::write_u16(&mut vh[0..2], sig);
        BigEndian::write_u16(&mut vh[2..4], version);
        BigEndian::write_u32(&mut vh[16..20], Self::mac_time());
        BigEndian::write_u32(&mut vh[20..24], Self::mac_time());
        BigEndian::write_u32(&mut vh[40..44], self.block_size);
        BigEndian::write_u32(&mut vh[44..48], total_blocks);
        BigEndian::write_u32(&mut vh[64..68], self.next_id);
        BigEndian::write_u32(&mut vh[80 + 20..80 + 24], self.system_dir);
        let catalog_blocks = catalog.1.iter().map(|e| e.1).sum();
        let extents_blocks = extents.1.iter().map(|e| e.1).sum();
        vh[192..272].copy_from_slice(&plus_fork(extents.0, extents_blocks, extents.1));
        vh[272..352].copy_from_slice(&plus_fork(catalog.0, catalog_blocks, catalog.1));
        vh
    }

    fn mdb(
        &self,
        layout: &Layout,
        total_blocks: u32,
        catalog: (u32, &[(u32, u32)]),
        extents: (u32, &[(u32, u32)]),
    ) -> Vec<u8> {
        let mut mdb = vec![0u8; 512];
        BigEndian::write_u16(&mut mdb[0..2], 0x4244);
        BigEndian::write_u32(&mut mdb[2..6], Self::mac_time());
        BigEndian::write_u32(&mut mdb[6..10], Self::mac_time());
        BigEndian::write_u16(&mut mdb[18..20], total_blocks as u16);
        BigEndian::write_u32(&mut mdb[20..24], self.block_size);
        BigEndian::write_u16(&mut mdb[28..30], (layout.alloc_offset / 512) as u16);
        BigEndian::write_u32(&mut mdb[30..34], self.next_id);
        let name = utf8_to_mac_roman(&self.volume_name).expect("volume name encodes");
        mdb[36] = name.len() as u8;
        mdb[37..37 + name.len()].copy_from_slice(&name);
        BigEndian::write_u32(&mut mdb[92 + 20..92 + 24], self.system_dir);
        BigEndian::write_u32(&mut mdb[130..134], extents.0);
        write_classic_extents(&mut mdb[134..146], extents.1);
        BigEndian::write_u32(&mut mdb[146..150], catalog.0);
        write_classic_extents(&mut mdb[150..162], catalog.1);
        mdb
    }
}

#[derive(Debug, Clone)]
enum Name {
    Roman(Vec<u8>),
    Unicode(Vec<u16>),
}

fn plus_fork(logical_size: u64, total_blocks: u32, extents: &[(u32, u32)]) -> [u8; 80] {
    let mut fork = [0u8; 80];
    BigEndian::write_u64(&mut fork[0..8], logical_size);
    BigEndian::write_u32(&mut fork[12..16], total_blocks);
    for (i, &(start, count)) in extents.iter().take(8).enumerate() {
        BigEndian::write_u32(&mut fork[16 + i * 8..20 + i * 8], start);
        BigEndian::write_u32(&mut fork[20 + i * 8..24 + i * 8], count);
    }
    fork
}

fn write_classic_extents(out: &mut [u8], extents: &[(u32, u32)]) {
    for (i, &(start, count)) in extents.iter().take(3).enumerate() {
        BigEndian::write_u16(&mut out[i * 4..i * 4 + 2], start as u16);
        BigEndian::write_u16(&mut out[i * 4 + 2..i * 4 + 4], count as u16);
    }
}

/// Image bytes plus the allocation cursor.
struct Layout {
    image: Vec<u8>,
    block_size: u32,
    alloc_offset: u64,
    next_block: u32,
}

impl Layout {
    fn new(block_size: u32, alloc_offset: u64, first_block: u32) -> Self {
        Self {
            image: Vec::new(),
            block_size,
            alloc_offset,
            next_block: first_block,
        }
    }

    fn block_offset(&self, block: u32) -> u64 {
        self.alloc_offset + block as u64 * self.block_size as u64
    }

    fn ensure(&mut self, len: usize) {
        if self.image.len() < len {
            self.image.resize(len, 0);
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        self.ensure(start + data.len());
        self.image[start..start + data.len()].copy_from_slice(data);
    }

    /// Place `data` in `fragments` runs separated by one gap block each.
    fn allocate(&mut self, data: &[u8], fragments: usize) -> Vec<(u32, u32)> {
        let bs = self.block_size as usize;
        let blocks = data.len().div_ceil(bs).max(fragments.max(1)) as u32;
        if data.is_empty() && fragments <= 1 {
            return Vec::new();
        }
        let fragments = fragments.clamp(1, blocks as usize) as u32;
        let per = blocks / fragments;

        let mut extents = Vec::new();
        let mut written = 0usize;
        for i in 0..fragments {
            let count = if i + 1 == fragments {
                blocks - per * (fragments - 1)
            } else {
                per
            };
            let start = self.next_block;
            let span = (count as usize * bs).min(data.len() - written);
            let offset = self.block_offset(start);
            self.ensure((offset as usize) + count as usize * bs);
            self.write(offset, &data[written..written + span]);
            written += span;
            self.next_block += count;
            extents.push((start, count));

            if i + 1 < fragments {
                let gap = self.block_offset(self.next_block);
                self.write(gap, &vec![GAP_FILL; bs]);
                self.next_block += 1;
            }
        }
        extents
    }
}

// -- B-tree writer ----------------------------------------------------------

struct TreeShape {
    node_size: usize,
    /// u16 key lengths (HFS+) rather than u8 (HFS).
    wide_keys: bool,
    fanout: usize,
    max_key_len: u16,
    key_compare: u8,
    attributes: u32,
    /// Classic catalog index keys are padded to a fixed length.
    fixed_index_key: Option<usize>,
}

fn encode_record(key: &[u8], data: &[u8], wide_keys: bool) -> Vec<u8> {
    let mut rec = Vec::with_capacity(key.len() + data.len() + 2);
    if wide_keys {
        rec.extend_from_slice(&(key.len() as u16).to_be_bytes());
    } else {
        rec.push(key.len() as u8);
    }
    rec.extend_from_slice(key);
    if !wide_keys && rec.len() % 2 != 0 {
        rec.push(0);
    }
    rec.extend_from_slice(data);
    if rec.len() % 2 != 0 {
        rec.push(0);
    }
    rec
}

fn write_node(
    node_size: usize,
    kind: i8,
    height: u8,
    next: u32,
    prev: u32,
    records: &[Vec<u8>],
) -> Vec<u8> {
    let mut node = vec![0u8; node_size];
    BigEndian::write_u32(&mut node[0..4], next);
    BigEndian::write_u32(&mut node[4..8], prev);
    node[8] = kind as u8;
    node[9] = height;
    BigEndian::write_u16(&mut node[10..12], records.len() as u16);
    let mut pos = 14usize;
    for (i, rec) in records.iter().enumerate() {
        node[pos..pos + rec.len()].copy_from_slice(rec);
        BigEndian::write_u16(&mut node[node_size - 2 * (i + 1)..node_size - 2 * i], pos as u16);
        pos += rec.len();
    }
    let n = records.len();
    BigEndian::write_u16(&mut node[node_size - 2 * (n + 1)..node_size - 2 * n], pos as u16);
    assert!(pos <= node_size - 2 * (n + 1), "node overflow");
    node
}

/// Group encoded records into nodes.
fn pack(records: Vec<(Vec<u8>, Vec<u8>)>, shape: &TreeShape) -> Vec<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut groups = Vec::new();
    let mut current: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut used = 14 + 2;
    for (key, rec) in records {
        let need = rec.len() + 2;
        assert!(16 + need <= shape.node_size, "record larger than a node");
        if !current.is_empty() && (used + need > shape.node_size || current.len() >= shape.fanout) {
            groups.push(std::mem::take(&mut current));
            used = 14 + 2;
        }
        used += need;
        current.push((key, rec));
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Lay out a whole B-tree file from sorted leaf (key, data) pairs.
fn build_tree(shape: &TreeShape, leaves: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<u8> {
    let ns = shape.node_size;
    let leaf_count = leaves.len() as u32;
    let mut nodes: Vec<Vec<u8>> = vec![Vec::new()];
    let (mut root, mut depth, mut first_leaf, mut last_leaf) = (0u32, 0u16, 0u32, 0u32);

    if !leaves.is_empty() {
        let encoded = leaves
            .into_iter()
            .map(|(k, d)| {
                let rec = encode_record(&k, &d, shape.wide_keys);
                (k, rec)
            })
            .collect();
        let groups = pack(encoded, shape);
        let base = nodes.len() as u32;
        let count = groups.len() as u32;
        let mut level: Vec<(Vec<u8>, u32)> = Vec::new();
        for (i, group) in groups.iter().enumerate() {
            let index = base + i as u32;
            let next = if i as u32 + 1 < count { index + 1 } else { 0 };
            let prev = if i > 0 { index - 1 } else { 0 };
            let recs: Vec<Vec<u8>> = group.iter().map(|(_, r)| r.clone()).collect();
            nodes.push(write_node(ns, -1, 1, next, prev, &recs));
            level.push((group[0].0.clone(), index));
        }
        first_leaf = base;
        last_leaf = base + count - 1;
        let mut height = 1u8;

        while level.len() > 1 {
            height += 1;
            let entries = level
                .into_iter()
                .map(|(key, child)| {
                    let key = match shape.fixed_index_key {
                        Some(len) => {
                            let mut k = key;
                            k.resize(len, 0);
                            k
                        }
                        None => key,
                    };
                    let rec = encode_record(&key, &child.to_be_bytes(), shape.wide_keys);
                    (key, rec)
                })
                .collect();
            let groups = pack(entries, shape);
            let base = nodes.len() as u32;
            let count = groups.len() as u32;
            level = Vec::new();
            for (i, group) in groups.iter().enumerate() {
                let index = base + i as u32;
                let next = if i as u32 + 1 < count { index + 1 } else { 0 };
                let prev = if i > 0 { index - 1 } else { 0 };
                let recs: Vec<Vec<u8>> = group.iter().map(|(_, r)| r.clone()).collect();
                nodes.push(write_node(ns, 0, height, next, prev, &recs));
                level.push((group[0].0.clone(), index));
            }
        }
        root = level[0].1;
        depth = height as u16;
    }

    let total_nodes = nodes.len() as u32;
    let mut header = vec![0u8; 106];
    BigEndian::write_u16(&mut header[0..2], depth);
    BigEndian::write_u32(&mut header[2..6], root);
    BigEndian::write_u32(&mut header[6..10], leaf_count);
    BigEndian::write_u32(&mut header[10..14], first_leaf);
    BigEndian::write_u32(&mut header[14..18], last_leaf);
    BigEndian::write_u16(&mut header[18..20], ns as u16);
    BigEndian::write_u16(&mut header[20..22], shape.max_key_len);
    BigEndian::write_u32(&mut header[22..26], total_nodes);
    BigEndian::write_u32(&mut header[32..36], ns as u32);
    header[37] = shape.key_compare;
    BigEndian::write_u32(&mut header[38..42], shape.attributes);
    let user_data = vec![0u8; 128];
    let map = vec![0u8; ns - 256];
    nodes[0] = write_node(ns, 1, 0, 0, 0, &[header, user_data, map]);

    nodes.concat()
}

/// Byte offset of catalog node `index` in an HFS+ image with an unfragmented
/// catalog.
pub fn catalog_node_offset(image: &[u8], index: u32) -> usize {
    let vh = &image[1024..1536];
    let block_size = BigEndian::read_u32(&vh[40..44]) as usize;
    let start_block = BigEndian::read_u32(&vh[272 + 16..272 + 20]) as usize;
    let node_size = BigEndian::read_u16(&image[start_block * block_size + 32..]) as usize;
    start_block * block_size + index as usize * node_size
}

/// Deterministic, position-dependent test bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + i / 251) as u8).wrapping_add(seed))
        .collect()
}

/// Wrap an HFS+ image in a classic HFS volume, as Mac OS 8.1+ formatted
/// disks do. The embedded volume starts at byte 3072.
pub fn wrap_in_hfs(plus: &[u8], wrapper_name: &str) -> Vec<u8> {
    const WRAPPER_BLOCK: u32 = 512;
    const FIRST_ALLOC_SECTOR: u16 = 4;
    const EMBED_START: u16 = 2;
    let embedded_offset =
        FIRST_ALLOC_SECTOR as usize * 512 + EMBED_START as usize * WRAPPER_BLOCK as usize;
    let embed_count = plus.len().div_ceil(WRAPPER_BLOCK as usize) as u16;

    let mut image = vec![0u8; embedded_offset + plus.len() + WRAPPER_BLOCK as usize];
    image[embedded_offset..embedded_offset + plus.len()].copy_from_slice(plus);

    let mdb = &mut image[1024..1536];
    BigEndian::write_u16(&mut mdb[0..2], 0x4244);
    BigEndian::write_u16(&mut mdb[18..20], EMBED_START + embed_count + 1);
    BigEndian::write_u32(&mut mdb[20..24], WRAPPER_BLOCK);
    BigEndian::write_u16(&mut mdb[28..30], FIRST_ALLOC_SECTOR);
    let name = wrapper_name.as_bytes();
    mdb[36] = name.len() as u8;
    mdb[37..37 + name.len()].copy_from_slice(name);
    BigEndian::write_u16(&mut mdb[124..126], 0x482B);
    BigEndian::write_u16(&mut mdb[126..128], EMBED_START);
    BigEndian::write_u16(&mut mdb[128..130], embed_count);
    image
}
