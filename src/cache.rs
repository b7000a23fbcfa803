//! Block-granular read cache in front of the raw device.
//!
//! Volume metadata (B-tree nodes, the volume header) is read repeatedly
//! during path resolution, so those reads go through a small in-memory
//! cache keyed by granule index. Bulk file data is read with
//! `cacheable = false` and bypasses it.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Seek, SeekFrom};

use log::trace;

/// A cached granule and how many of its bytes came from the device.
struct Granule {
    data: Vec<u8>,
    valid: usize,
}

pub struct BlockCache<R: Read + Seek> {
    reader: R,
    granularity: u32,
    capacity: usize,
    blocks: BTreeMap<u64, Granule>,
    /// Insertion order, oldest first. Used to evict when full.
    order: VecDeque<u64>,
    hits: u64,
    misses: u64,
}

impl<R: Read + Seek> BlockCache<R> {
    pub fn new(reader: R, granularity: u32, capacity: usize) -> Self {
        Self {
            reader,
            granularity: granularity.max(512),
            capacity: capacity.max(1),
            blocks: BTreeMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Drop every cached granule and switch to a new granule size.
    pub fn reinit(&mut self, granularity: u32) {
        trace!(
            "block cache reinit: granularity {} -> {}",
            self.granularity,
            granularity
        );
        self.granularity = granularity.max(512);
        self.blocks.clear();
        self.order.clear();
    }

    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Fill `buf` from device byte `offset`.
    pub fn read(&mut self, buf: &mut [u8], offset: u64, cacheable: bool) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if !cacheable {
            self.reader.seek(SeekFrom::Start(offset))?;
            return self.reader.read_exact(buf);
        }

        let gran = self.granularity as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let index = pos / gran;
            let within = (pos % gran) as usize;
            let want = (buf.len() - done).min(gran as usize - within);

            let granule = self.granule(index)?;
            if within + want > granule.valid {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read past end of device at byte {pos}"),
                ));
            }
            buf[done..done + want].copy_from_slice(&granule.data[within..within + want]);
            done += want;
        }
        Ok(())
    }

    fn granule(&mut self, index: u64) -> io::Result<&Granule> {
        if self.blocks.contains_key(&index) {
            self.hits += 1;
        } else {
            self.misses += 1;
            let granule = self.load(index)?;
            if self.blocks.len() >= self.capacity {
                if let Some(old) = self.order.pop_front() {
                    self.blocks.remove(&old);
                }
            }
            self.blocks.insert(index, granule);
            self.order.push_back(index);
        }
        self.blocks
            .get(&index)
            .ok_or_else(|| io::Error::other("cache granule vanished"))
    }

    /// Read one granule. A short final granule is zero-padded and its valid
    /// length recorded so reads past the device end still fail.
    fn load(&mut self, index: u64) -> io::Result<Granule> {
        let gran = self.granularity as usize;
        let mut data = vec![0u8; gran];
        self.reader.seek(SeekFrom::Start(index * gran as u64))?;
        let mut valid = 0;
        while valid < gran {
            let n = self.reader.read(&mut data[valid..])?;
            if n == 0 {
                break;
            }
            valid += n;
        }
        Ok(Granule { data, valid })
    }
}
