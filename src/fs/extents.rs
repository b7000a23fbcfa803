//! Mapping logical fork offsets to physical allocation-block runs.
//!
//! A fork's first extent record lives inline in its catalog (or volume
//! header) entry. Files with more runs continue in the extents-overflow
//! tree, keyed by the logical block at which each further record begins.

use std::io::{Read, Seek};

use log::trace;

use super::btree::{KeyFormat, TreeId};
use super::raw::{u16_at, u32_at, u8_at};
use super::volume::{ExtentDescriptor, ExtentRecord, ForkData};
use super::{HfsVolume, EXTENTS_FILE_ID};
use crate::error::{HfsError, Result};

pub const DATA_FORK: u8 = 0x00;
pub const RESOURCE_FORK: u8 = 0xFF;

/// Extents-overflow key. Field order is the tree's sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExtentKey {
    pub file_id: u32,
    pub fork_type: u8,
    pub start_block: u32,
}

impl ExtentKey {
    /// Decode a key (without its length prefix).
    pub fn parse(key: &[u8], format: KeyFormat) -> Result<Self> {
        match format {
            // forkType(1) pad(1) fileID(4) startBlock(4)
            KeyFormat::Plus => Ok(ExtentKey {
                fork_type: u8_at(key, 0)?,
                file_id: u32_at(key, 2)?,
                start_block: u32_at(key, 6)?,
            }),
            // forkType(1) fileID(4) startBlock(2)
            KeyFormat::Classic => Ok(ExtentKey {
                fork_type: u8_at(key, 0)?,
                file_id: u32_at(key, 1)?,
                start_block: u16_at(key, 5)? as u32,
            }),
        }
    }
}

/// Find the extent covering logical block `target` in a record whose first
/// extent starts at logical block `base`. Returns the extent and the logical
/// block at which it begins.
fn locate(record: &ExtentRecord, base: u32, target: u32) -> Option<(ExtentDescriptor, u32)> {
    let mut first = base;
    for ext in record.extents() {
        let end = first.saturating_add(ext.block_count);
        if target >= first && target < end {
            return Some((*ext, first));
        }
        first = end;
    }
    None
}

impl<R: Read + Seek> HfsVolume<R> {
    /// Copy fork bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied: `buf.len()` clamped to the fork's
    /// logical length, and 0 when `offset` is at or past the end. A device
    /// failure comes back as `ShortRead` carrying the bytes already copied.
    pub fn read_extent(
        &mut self,
        fork: &ForkData,
        file_id: u32,
        offset: u64,
        buf: &mut [u8],
        cacheable: bool,
    ) -> Result<usize> {
        if offset >= fork.logical_size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(fork.logical_size - offset) as usize;
        let block_size = self.header.block_size as u64;

        let mut record = fork.extents;
        let mut record_base = 0u32;
        let mut copied = 0usize;

        while copied < len {
            let pos = offset + copied as u64;
            let target = u32::try_from(pos / block_size).map_err(|_| {
                HfsError::corrupt(format!("fork offset {pos} beyond 32-bit block range"))
            })?;

            let (ext, ext_first) = loop {
                if target < record_base {
                    record = fork.extents;
                    record_base = 0;
                }
                if let Some(hit) = locate(&record, record_base, target) {
                    break hit;
                }
                let covered = record_base
                    .checked_add(record.total_blocks())
                    .ok_or_else(|| HfsError::corrupt("extent block count overflow"))?;
                record = self.overflow_record(file_id, covered)?;
                if record.total_blocks() == 0 {
                    return Err(HfsError::corrupt(format!(
                        "empty overflow extent record for file {file_id} at block {covered}"
                    )));
                }
                record_base = covered;
            };

            let intra = (target - ext_first) as u64 * block_size + pos % block_size;
            let run_left = ext.block_count as u64 * block_size - intra;
            let chunk = run_left.min((len - copied) as u64) as usize;
            let physical =
                self.header.allocation_offset + ext.start_block as u64 * block_size + intra;

            trace!(
                "file {file_id}: logical {pos} -> block {} + {intra} ({chunk} bytes)",
                ext.start_block
            );
            self.cache
                .read(&mut buf[copied..copied + chunk], physical, cacheable)
                .map_err(|source| HfsError::ShortRead { copied, source })?;
            copied += chunk;
        }
        Ok(copied)
    }

    /// Fetch the data-fork overflow record that begins at `start_block`.
    fn overflow_record(&mut self, file_id: u32, start_block: u32) -> Result<ExtentRecord> {
        if file_id == EXTENTS_FILE_ID {
            return Err(HfsError::corrupt(
                "extents overflow file runs past its inline extents",
            ));
        }
        let tree = self.tree(TreeId::Extents)?;
        let want = ExtentKey {
            file_id,
            fork_type: DATA_FORK,
            start_block,
        };
        let format = tree.format;
        trace!("extents overflow lookup {want:?}");
        let res = tree.search(self, |key| Ok(ExtentKey::parse(key, format)?.cmp(&want)))?;
        let slot = res.exact(|| {
            format!("extent record for file {file_id} at block {start_block}")
        })?;
        let (_, data) = res.node.key_and_data(slot, format)?;
        match format {
            KeyFormat::Plus => ExtentRecord::parse_plus(data),
            KeyFormat::Classic => ExtentRecord::parse_classic(data),
        }
    }
}
