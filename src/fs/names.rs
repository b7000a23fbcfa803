//! Catalog name codecs and collation.
//!
//! Classic HFS stores names as Mac Roman Pascal strings (at most 31 bytes)
//! and orders them case-insensitively. HFS+ stores UTF-16BE names (at most
//! 255 code units) and orders them with a case-folding compare that skips
//! ignorable code points and sorts U+0000 last. HFSX volumes may instead use
//! a plain binary compare.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{HfsError, Result};

pub const MAX_CLASSIC_NAME: usize = 31;
pub const MAX_PLUS_NAME: usize = 255;

/// Mac Roman to Unicode lookup table for bytes 0x80-0xFF.
static MAC_ROMAN_TABLE: [char; 128] = [
    '\u{00C4}', '\u{00C5}', '\u{00C7}', '\u{00C9}', '\u{00D1}', '\u{00D6}', '\u{00DC}', '\u{00E1}',
    '\u{00E0}', '\u{00E2}', '\u{00E4}', '\u{00E3}', '\u{00E5}', '\u{00E7}', '\u{00E9}', '\u{00E8}',
    '\u{00EA}', '\u{00EB}', '\u{00ED}', '\u{00EC}', '\u{00EE}', '\u{00EF}', '\u{00F1}', '\u{00F3}',
    '\u{00F2}', '\u{00F4}', '\u{00F6}', '\u{00F5}', '\u{00FA}', '\u{00F9}', '\u{00FB}', '\u{00FC}',
    '\u{2020}', '\u{00B0}', '\u{00A2}', '\u{00A3}', '\u{00A7}', '\u{2022}', '\u{00B6}', '\u{00DF}',
    '\u{00AE}', '\u{00A9}', '\u{2122}', '\u{00B4}', '\u{00A8}', '\u{2260}', '\u{00C6}', '\u{00D8}',
    '\u{221E}', '\u{00B1}', '\u{2264}', '\u{2265}', '\u{00A5}', '\u{00B5}', '\u{2202}', '\u{2211}',
    '\u{220F}', '\u{03C0}', '\u{222B}', '\u{00AA}', '\u{00BA}', '\u{03A9}', '\u{00E6}', '\u{00F8}',
    '\u{00BF}', '\u{00A1}', '\u{00AC}', '\u{221A}', '\u{0192}', '\u{2248}', '\u{2206}', '\u{00AB}',
    '\u{00BB}', '\u{2026}', '\u{00A0}', '\u{00C0}', '\u{00C3}', '\u{00D5}', '\u{0152}', '\u{0153}',
    '\u{2013}', '\u{2014}', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}', '\u{00F7}', '\u{25CA}',
    '\u{00FF}', '\u{0178}', '\u{2044}', '\u{20AC}', '\u{2039}', '\u{203A}', '\u{FB01}', '\u{FB02}',
    '\u{2021}', '\u{00B7}', '\u{201A}', '\u{201E}', '\u{2030}', '\u{00C2}', '\u{00CA}', '\u{00C1}',
    '\u{00CB}', '\u{00C8}', '\u{00CD}', '\u{00CE}', '\u{00CF}', '\u{00CC}', '\u{00D3}', '\u{00D4}',
    '\u{F8FF}', '\u{00D2}', '\u{00DA}', '\u{00DB}', '\u{00D9}', '\u{0131}', '\u{02C6}', '\u{02DC}',
    '\u{00AF}', '\u{02D8}', '\u{02D9}', '\u{02DA}', '\u{00B8}', '\u{02DD}', '\u{02DB}', '\u{02C7}',
];

/// Decode a Mac Roman byte string to UTF-8.
pub fn mac_roman_to_utf8(data: &[u8]) -> String {
    data.iter().map(|&b| mac_roman_char(b)).collect()
}

fn mac_roman_char(b: u8) -> char {
    if b < 0x80 {
        b as char
    } else {
        MAC_ROMAN_TABLE[(b - 0x80) as usize]
    }
}

fn mac_roman_byte(c: char) -> Option<u8> {
    if (c as u32) < 0x80 {
        return Some(c as u8);
    }
    MAC_ROMAN_TABLE
        .iter()
        .position(|&t| t == c)
        .map(|i| 0x80 + i as u8)
}

/// Encode a UTF-8 path component as a classic catalog name.
pub fn utf8_to_mac_roman(name: &str) -> Result<Vec<u8>> {
    let bytes = name
        .chars()
        .map(|c| {
            mac_roman_byte(c).ok_or_else(|| {
                HfsError::NotFound(format!("{name}: not representable in Mac Roman"))
            })
        })
        .collect::<Result<Vec<u8>>>()?;
    if bytes.len() > MAX_CLASSIC_NAME {
        return Err(HfsError::NotFound(format!(
            "{name}: longer than {MAX_CLASSIC_NAME} bytes"
        )));
    }
    Ok(bytes)
}

/// Decode on-disk UTF-16 units to UTF-8. On-disk '/' is shown as ':'.
pub fn utf16_to_utf8(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
        .chars()
        .map(|c| if c == '/' { ':' } else { c })
        .collect()
}

/// Encode a UTF-8 path component as an HFS+ catalog name. ':' is stored as '/'.
pub fn utf8_to_utf16(name: &str) -> Result<Vec<u16>> {
    let units: Vec<u16> = name
        .chars()
        .map(|c| if c == ':' { '/' } else { c })
        .collect::<String>()
        .encode_utf16()
        .collect();
    if units.len() > MAX_PLUS_NAME {
        return Err(HfsError::NotFound(format!(
            "{name}: longer than {MAX_PLUS_NAME} UTF-16 units"
        )));
    }
    Ok(units)
}

/// Read big-endian UTF-16 code units.
pub fn read_utf16be(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2).map(BigEndian::read_u16).collect()
}

/// Case-insensitive Mac Roman compare used by classic catalogs.
///
/// Accented letters sort after their base letter and before the next one,
/// so "Apple" < "Äpfel" < "Banana".
pub fn compare_mac_roman(a: &[u8], b: &[u8]) -> Ordering {
    let wa = a.iter().map(|&x| roman_weight(x));
    let wb = b.iter().map(|&x| roman_weight(x));
    wa.cmp(wb)
}

/// Base letter in the high byte, diacritic variant in the low byte.
fn roman_weight(b: u8) -> u16 {
    let folded = fold_mac_roman(b);
    match base_letter(mac_roman_char(folded)) {
        Some(base) => (u16::from(base) << 8) | u16::from(folded),
        None => u16::from(folded) << 8,
    }
}

/// Base letter of an upper-case accented Mac Roman letter.
fn base_letter(c: char) -> Option<u8> {
    let base = match c {
        'Ä' | 'Å' | 'Æ' | 'À' | 'Ã' | 'Â' | 'Á' => b'A',
        'Ç' => b'C',
        'É' | 'Ê' | 'Ë' | 'È' => b'E',
        'Í' | 'Î' | 'Ï' | 'Ì' => b'I',
        'Ñ' => b'N',
        'Ö' | 'Ø' | 'Õ' | 'Œ' | 'Ó' | 'Ô' | 'Ò' => b'O',
        'ß' => b'S',
        'Ü' | 'Ú' | 'Û' | 'Ù' => b'U',
        'Ÿ' => b'Y',
        _ => return None,
    };
    Some(base)
}

fn fold_mac_roman(b: u8) -> u8 {
    if b.is_ascii_lowercase() {
        return b.to_ascii_uppercase();
    }
    if b < 0x80 {
        return b;
    }
    let mut upper = mac_roman_char(b).to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) => mac_roman_byte(u).unwrap_or(b),
        _ => b,
    }
}

/// Case-folding compare used by HFS+ catalogs.
pub fn compare_unicode(a: &[u16], b: &[u16]) -> Ordering {
    let mut ia = a.iter().filter_map(|&u| fold_unicode(u));
    let mut ib = b.iter().filter_map(|&u| fold_unicode(u));
    loop {
        match (ia.next(), ib.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x != y => return x.cmp(&y),
            _ => {}
        }
    }
}

/// Binary compare used by case-sensitive HFSX catalogs.
pub fn compare_binary(a: &[u16], b: &[u16]) -> Ordering {
    a.cmp(b)
}

/// Fold one code unit; `None` means the unit is ignored for ordering.
fn fold_unicode(u: u16) -> Option<u16> {
    match u {
        0 => Some(0xFFFF),
        0x200C..=0x200F | 0x202A..=0x202E | 0x206A..=0x206F | 0xFEFF => None,
        0xD800..=0xDFFF => Some(u),
        _ => {
            let Some(c) = char::from_u32(u as u32) else {
                return Some(u);
            };
            let mut lower = c.to_lowercase();
            match (lower.next(), lower.next()) {
                (Some(l), None) if (l as u32) <= 0xFFFF => Some(l as u16),
                _ => Some(u),
            }
        }
    }
}
