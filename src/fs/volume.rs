//! Volume detection: classic Master Directory Block, HFS+/HFSX volume
//! header, and HFS+ volumes embedded in an HFS wrapper.

use std::io::{Read, Seek};

use log::debug;

use super::names::mac_roman_to_utf8;
use super::raw::{bytes, u16_at, u32_at, u64_at, u8_at};
use crate::cache::BlockCache;
use crate::error::{HfsError, Result};

pub const HFS_SIGNATURE: u16 = 0x4244;
pub const HFS_PLUS_SIGNATURE: u16 = 0x482B;
pub const HFSX_SIGNATURE: u16 = 0x4858;

/// Byte offset of the MDB / volume header from the start of a volume.
pub const VOLUME_HEADER_OFFSET: u64 = 1024;
const VOLUME_HEADER_SIZE: usize = 512;

pub const EXTENT_RECORD_SLOTS: usize = 8;

/// One contiguous run of allocation blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

/// An extent record. Classic records only use the first three slots; a zero
/// `block_count` ends the meaningful entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentRecord(pub [ExtentDescriptor; EXTENT_RECORD_SLOTS]);

impl ExtentRecord {
    /// HFS+ record: 8 x (u32 start, u32 count).
    pub fn parse_plus(data: &[u8]) -> Result<Self> {
        let mut rec = ExtentRecord::default();
        for (i, slot) in rec.0.iter_mut().enumerate() {
            *slot = ExtentDescriptor {
                start_block: u32_at(data, i * 8)?,
                block_count: u32_at(data, i * 8 + 4)?,
            };
        }
        Ok(rec)
    }

    /// Classic record: 3 x (u16 start, u16 count).
    pub fn parse_classic(data: &[u8]) -> Result<Self> {
        let mut rec = ExtentRecord::default();
        for (i, slot) in rec.0.iter_mut().take(3).enumerate() {
            *slot = ExtentDescriptor {
                start_block: u16_at(data, i * 4)? as u32,
                block_count: u16_at(data, i * 4 + 2)? as u32,
            };
        }
        Ok(rec)
    }

    pub fn extents(&self) -> impl Iterator<Item = &ExtentDescriptor> {
        self.0.iter().take_while(|e| e.block_count != 0)
    }

    pub fn total_blocks(&self) -> u32 {
        self.extents()
            .fold(0u32, |acc, e| acc.saturating_add(e.block_count))
    }
}

/// Logical length plus the inline extents of a fork.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForkData {
    pub logical_size: u64,
    pub extents: ExtentRecord,
}

impl ForkData {
    /// HFS+ fork data (80 bytes).
    pub fn parse_plus(data: &[u8]) -> Result<Self> {
        Ok(ForkData {
            logical_size: u64_at(data, 0)?,
            extents: ExtentRecord::parse_plus(bytes(data, 16, 64)?)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    /// Classic HFS.
    Hfs,
    /// HFS+ at the start of the partition.
    HfsPlus,
    /// Case-sensitive capable HFS+ variant.
    Hfsx,
    /// HFS+ living inside an HFS wrapper volume.
    EmbeddedHfsPlus,
}

/// Geometry and metadata-file locations for a mounted volume.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub format: VolumeFormat,
    /// Bytes per allocation block.
    pub block_size: u32,
    /// Device byte offset of allocation block 0.
    pub allocation_offset: u64,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub finder_info: [u32; 8],
    pub catalog_fork: ForkData,
    pub extents_fork: ForkData,
    /// Classic volumes carry their name in the MDB; HFS+ names come from the
    /// root folder thread and are filled in after mount.
    pub volume_name: String,
}

impl VolumeHeader {
    pub fn is_plus(&self) -> bool {
        self.format != VolumeFormat::Hfs
    }

    /// Blessed system folder ID from Finder info slot 5, if set.
    pub fn system_dir_id(&self) -> Option<u32> {
        match self.finder_info[5] {
            0 => None,
            id => Some(id),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_blocks as u64 * self.block_size as u64
    }

    pub fn fs_type(&self) -> &'static str {
        match self.format {
            VolumeFormat::Hfs => "HFS",
            VolumeFormat::HfsPlus => "HFS+",
            VolumeFormat::Hfsx => "HFSX",
            VolumeFormat::EmbeddedHfsPlus => "HFS+ (embedded)",
        }
    }
}

/// HFS Master Directory Block, the fields this reader needs.
#[derive(Debug)]
struct MasterDirectoryBlock {
    create_date: u32,
    modify_date: u32,
    total_blocks: u16,
    block_size: u32,
    /// First allocation block, in 512-byte sectors from the volume start.
    first_alloc_block: u16,
    free_blocks: u16,
    volume_name: String,
    finder_info: [u32; 8],
    embedded_signature: u16,
    embedded_start_block: u16,
    extents_file_size: u32,
    extents_file_extents: ExtentRecord,
    catalog_file_size: u32,
    catalog_file_extents: ExtentRecord,
}

impl MasterDirectoryBlock {
    fn parse(data: &[u8]) -> Result<Self> {
        let name_len = (u8_at(data, 36)? as usize).min(27);
        Ok(MasterDirectoryBlock {
            create_date: u32_at(data, 2)?,
            modify_date: u32_at(data, 6)?,
            total_blocks: u16_at(data, 18)?,
            block_size: u32_at(data, 20)?,
            first_alloc_block: u16_at(data, 28)?,
            free_blocks: u16_at(data, 34)?,
            volume_name: mac_roman_to_utf8(bytes(data, 37, name_len)?),
            finder_info: parse_finder_info(bytes(data, 92, 32)?)?,
            embedded_signature: u16_at(data, 124)?,
            embedded_start_block: u16_at(data, 126)?,
            extents_file_size: u32_at(data, 130)?,
            extents_file_extents: ExtentRecord::parse_classic(bytes(data, 134, 12)?)?,
            catalog_file_size: u32_at(data, 146)?,
            catalog_file_extents: ExtentRecord::parse_classic(bytes(data, 150, 12)?)?,
        })
    }

    fn has_embedded_hfs_plus(&self) -> bool {
        self.embedded_signature == HFS_PLUS_SIGNATURE
    }
}

fn parse_finder_info(data: &[u8]) -> Result<[u32; 8]> {
    let mut info = [0u32; 8];
    for (i, slot) in info.iter_mut().enumerate() {
        *slot = u32_at(data, i * 4)?;
    }
    Ok(info)
}

/// Decode a classic MDB into a header, rejecting wrapper volumes.
fn classic_header(mdb: MasterDirectoryBlock, volume_offset: u64) -> Result<VolumeHeader> {
    check_block_size(mdb.block_size, false)?;
    Ok(VolumeHeader {
        format: VolumeFormat::Hfs,
        block_size: mdb.block_size,
        allocation_offset: volume_offset + mdb.first_alloc_block as u64 * 512,
        total_blocks: mdb.total_blocks as u32,
        free_blocks: mdb.free_blocks as u32,
        create_date: mdb.create_date,
        modify_date: mdb.modify_date,
        finder_info: mdb.finder_info,
        catalog_fork: ForkData {
            logical_size: mdb.catalog_file_size as u64,
            extents: mdb.catalog_file_extents,
        },
        extents_fork: ForkData {
            logical_size: mdb.extents_file_size as u64,
            extents: mdb.extents_file_extents,
        },
        volume_name: mdb.volume_name,
    })
}

/// Decode an HFS+/HFSX volume header. `allocation_offset` is the device
/// byte offset of the volume (and therefore of its allocation block 0).
pub fn parse_plus_header(
    data: &[u8],
    allocation_offset: u64,
    embedded: bool,
) -> Result<VolumeHeader> {
    let signature = u16_at(data, 0)?;
    let format = match (signature, embedded) {
        (HFS_PLUS_SIGNATURE, true) => VolumeFormat::EmbeddedHfsPlus,
        (HFS_PLUS_SIGNATURE, false) => VolumeFormat::HfsPlus,
        (HFSX_SIGNATURE, _) => VolumeFormat::Hfsx,
        _ => return Err(HfsError::NotHfsVolume { signature }),
    };
    let block_size = u32_at(data, 40)?;
    check_block_size(block_size, true)?;

    Ok(VolumeHeader {
        format,
        block_size,
        allocation_offset,
        total_blocks: u32_at(data, 44)?,
        free_blocks: u32_at(data, 48)?,
        create_date: u32_at(data, 16)?,
        modify_date: u32_at(data, 20)?,
        finder_info: parse_finder_info(bytes(data, 80, 32)?)?,
        extents_fork: ForkData::parse_plus(bytes(data, 192, 80)?)?,
        catalog_fork: ForkData::parse_plus(bytes(data, 272, 80)?)?,
        volume_name: String::new(),
    })
}

fn check_block_size(block_size: u32, plus: bool) -> Result<()> {
    let valid = block_size >= 512
        && block_size % 512 == 0
        && (!plus || block_size.is_power_of_two());
    if valid {
        Ok(())
    } else {
        Err(HfsError::corrupt(format!(
            "invalid allocation block size {block_size}"
        )))
    }
}

/// Read and decode the volume header of the volume at `volume_offset`.
///
/// A classic MDB that wraps an HFS+ volume is followed into the embedded
/// volume; the returned header then describes the embedded volume, with
/// `allocation_offset` pointing at its first allocation block.
pub fn read_volume_header<R: Read + Seek>(
    cache: &mut BlockCache<R>,
    volume_offset: u64,
) -> Result<VolumeHeader> {
    let mut buf = [0u8; VOLUME_HEADER_SIZE];
    cache.read(&mut buf, volume_offset + VOLUME_HEADER_OFFSET, true)?;
    let signature = u16_at(&buf, 0)?;

    match signature {
        HFS_SIGNATURE => {
            let mdb = MasterDirectoryBlock::parse(&buf)?;
            if !mdb.has_embedded_hfs_plus() {
                debug!(
                    "HFS volume: block_size={}, first_alloc_block={}, total_blocks={}",
                    mdb.block_size, mdb.first_alloc_block, mdb.total_blocks
                );
                return classic_header(mdb, volume_offset);
            }
            check_block_size(mdb.block_size, false)?;
            let embedded_offset = volume_offset
                + mdb.first_alloc_block as u64 * 512
                + mdb.embedded_start_block as u64 * mdb.block_size as u64;
            debug!(
                "HFS wrapper with embedded HFS+ at byte {embedded_offset} (wrapper block {})",
                mdb.embedded_start_block
            );
            cache.read(&mut buf, embedded_offset + VOLUME_HEADER_OFFSET, true)?;
            let header = parse_plus_header(&buf, embedded_offset, true)?;
            if header.format != VolumeFormat::EmbeddedHfsPlus {
                return Err(HfsError::corrupt(format!(
                    "embedded volume signature 0x{:04X} is not HFS+",
                    u16_at(&buf, 0)?
                )));
            }
            Ok(header)
        }
        HFS_PLUS_SIGNATURE | HFSX_SIGNATURE => {
            let header = parse_plus_header(&buf, volume_offset, false)?;
            debug!(
                "{} volume: block_size={}, total_blocks={}",
                header.fs_type(),
                header.block_size,
                header.total_blocks
            );
            Ok(header)
        }
        _ => Err(HfsError::NotHfsVolume { signature }),
    }
}
