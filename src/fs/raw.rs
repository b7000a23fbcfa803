//! Bounds-checked big-endian field readers for on-disk structures.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{HfsError, Result};

pub(crate) fn bytes(data: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    at.checked_add(len)
        .and_then(|end| data.get(at..end))
        .ok_or_else(|| {
            HfsError::corrupt(format!(
                "truncated structure: need {len} bytes at offset {at}, have {}",
                data.len()
            ))
        })
}

pub(crate) fn u8_at(data: &[u8], at: usize) -> Result<u8> {
    Ok(bytes(data, at, 1)?[0])
}

pub(crate) fn u16_at(data: &[u8], at: usize) -> Result<u16> {
    Ok(BigEndian::read_u16(bytes(data, at, 2)?))
}

pub(crate) fn i16_at(data: &[u8], at: usize) -> Result<i16> {
    Ok(BigEndian::read_i16(bytes(data, at, 2)?))
}

pub(crate) fn u32_at(data: &[u8], at: usize) -> Result<u32> {
    Ok(BigEndian::read_u32(bytes(data, at, 4)?))
}

pub(crate) fn u64_at(data: &[u8], at: usize) -> Result<u64> {
    Ok(BigEndian::read_u64(bytes(data, at, 8)?))
}
