//! Byte and GUID helpers shared by the parser and the builder.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{format, string::String, vec::Vec};
use r_efi::efi;

use crate::{pi, FirmwareImageError};

/// Largest size a 3-byte size field can express; the value itself is the extended size sentinel.
pub const SIZE3_SENTINEL: u32 = 0x00FF_FFFF;

/// 8-bit wrapping sum.
pub fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// 16-bit wrapping sum over little-endian words. A trailing odd byte is ignored.
pub fn sum16(bytes: &[u8]) -> u16 {
    bytes.chunks_exact(2).fold(0u16, |sum, word| sum.wrapping_add(u16::from_le_bytes([word[0], word[1]])))
}

/// Value that makes the 8-bit sum of `bytes` plus the value equal zero.
pub fn checksum8(bytes: &[u8]) -> u8 {
    0u8.wrapping_sub(sum8(bytes))
}

/// Value that makes the 16-bit sum of `bytes` plus the value equal zero.
pub fn checksum16(bytes: &[u8]) -> u16 {
    0u16.wrapping_sub(sum16(bytes))
}

pub fn decode_size3(size: &[u8; 3]) -> u32 {
    u32::from_le_bytes([size[0], size[1], size[2], 0])
}

/// Encodes `size` into a 3-byte field.
///
/// Sizes at or above [`SIZE3_SENTINEL`] need the extended size variant and fail with
/// [`FirmwareImageError::SizeOverflow`].
pub fn encode_size3(size: u32) -> Result<[u8; 3], FirmwareImageError> {
    if size >= SIZE3_SENTINEL {
        Err(FirmwareImageError::SizeOverflow)?;
    }
    let bytes = size.to_le_bytes();
    Ok([bytes[0], bytes[1], bytes[2]])
}

pub fn erase_polarity(attributes: u32) -> bool {
    attributes & pi::fv::attributes::ERASE_POLARITY != 0
}

/// Byte value of erased flash for the given polarity.
pub fn empty_byte(erase_polarity: bool) -> u8 {
    if erase_polarity {
        0xFF
    } else {
        0x00
    }
}

pub fn align_up(value: usize, align: usize) -> Result<usize, FirmwareImageError> {
    if !align.is_power_of_two() {
        Err(FirmwareImageError::InvalidParameter)?;
    }
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask).ok_or(FirmwareImageError::SizeOverflow)
}

pub fn align_down(value: usize, align: usize) -> Result<usize, FirmwareImageError> {
    if !align.is_power_of_two() {
        Err(FirmwareImageError::InvalidParameter)?;
    }
    Ok(value & !(align - 1))
}

/// Formats a GUID in the registry form, e.g. `8C8CE578-8A3D-4F1C-9935-896185C32DD3`.
pub fn guid_to_string(guid: &efi::Guid) -> String {
    format!("{:X}", uuid::Uuid::from_bytes_le(*guid.as_bytes()).hyphenated())
}

/// Parses a GUID in the registry form. Case is ignored.
pub fn string_to_guid(text: &str) -> Result<efi::Guid, FirmwareImageError> {
    let text = text.trim();
    if text.len() != uuid::fmt::Hyphenated::LENGTH {
        Err(FirmwareImageError::InvalidParameter)?;
    }
    let uuid = uuid::Uuid::parse_str(text).map_err(|_| FirmwareImageError::InvalidParameter)?;
    Ok(efi::Guid::from_bytes(&uuid.to_bytes_le()))
}

/// Parses a hex string into bytes and per-nibble masks.
///
/// A `.` stands for a wildcard nibble. Whitespace is not allowed and the string must describe
/// whole bytes.
pub fn parse_hex_pattern(text: &str) -> Result<(Vec<u8>, Vec<u8>), FirmwareImageError> {
    let text = text.as_bytes();
    if text.is_empty() || text.len() % 2 != 0 {
        Err(FirmwareImageError::InvalidParameter)?;
    }
    let mut bytes = Vec::with_capacity(text.len() / 2);
    let mut masks = Vec::with_capacity(text.len() / 2);
    for pair in text.chunks_exact(2) {
        let (high, high_mask) = hex_nibble(pair[0])?;
        let (low, low_mask) = hex_nibble(pair[1])?;
        bytes.push(high << 4 | low);
        masks.push(high_mask << 4 | low_mask);
    }
    Ok((bytes, masks))
}

fn hex_nibble(digit: u8) -> Result<(u8, u8), FirmwareImageError> {
    match digit {
        b'.' => Ok((0, 0)),
        b'0'..=b'9' => Ok((digit - b'0', 0xF)),
        b'a'..=b'f' => Ok((digit - b'a' + 10, 0xF)),
        b'A'..=b'F' => Ok((digit - b'A' + 10, 0xF)),
        _ => Err(FirmwareImageError::InvalidParameter),
    }
}

/// Parses a hex string with no wildcards.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, FirmwareImageError> {
    let (bytes, masks) = parse_hex_pattern(text)?;
    if masks.iter().any(|mask| *mask != 0xFF) {
        Err(FirmwareImageError::InvalidParameter)?;
    }
    Ok(bytes)
}

/// Decodes a NUL-terminated UTF-16LE string, replacing invalid code units.
pub fn utf16_to_string(bytes: &[u8]) -> String {
    let units = bytes.chunks_exact(2).map(|unit| u16::from_le_bytes([unit[0], unit[1]])).take_while(|unit| *unit != 0);
    char::decode_utf16(units).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksums_cancel_the_sum() {
        let data = [0x12u8, 0x34, 0x56, 0x78, 0x9A];
        assert_eq!(sum8(&data).wrapping_add(checksum8(&data)), 0);

        let words = [0x12u8, 0x34, 0xFF, 0xFF, 0x01, 0x80];
        assert_eq!(sum16(&words).wrapping_add(checksum16(&words)), 0);
        assert_eq!(sum16(&[0x01, 0x00, 0x02]), 1);
    }

    #[test]
    fn size3_limits() {
        assert_eq!(encode_size3(36).unwrap(), [36, 0, 0]);
        assert_eq!(decode_size3(&encode_size3(0x00FF_FFFE).unwrap()), 0x00FF_FFFE);
        assert_eq!(encode_size3(SIZE3_SENTINEL), Err(FirmwareImageError::SizeOverflow));
        assert_eq!(encode_size3(0x0100_0000), Err(FirmwareImageError::SizeOverflow));
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 8).unwrap(), 0);
        assert_eq!(align_up(36, 8).unwrap(), 40);
        assert_eq!(align_up(40, 8).unwrap(), 40);
        assert_eq!(align_down(0x1237, 0x10).unwrap(), 0x1230);
        assert_eq!(align_up(3, 6), Err(FirmwareImageError::InvalidParameter));
        assert_eq!(align_up(usize::MAX, 8), Err(FirmwareImageError::SizeOverflow));
    }

    #[test]
    fn guid_text_is_lossless() {
        let text = "8C8CE578-8A3D-4F1C-9935-896185C32DD3";
        let guid = string_to_guid(text).unwrap();
        assert_eq!(guid, pi::guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID);
        assert_eq!(guid_to_string(&guid), text);
        assert_eq!(string_to_guid(&text.to_lowercase()).unwrap(), guid);

        let odd = efi::Guid::from_bytes(&[0xFF, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 0xFE]);
        assert_eq!(string_to_guid(&guid_to_string(&odd)).unwrap(), odd);

        assert!(string_to_guid("8C8CE5788A3D4F1C9935896185C32DD3").is_err());
        assert!(string_to_guid("not-a-guid").is_err());
    }

    #[test]
    fn hex_patterns_with_wildcards() {
        let (bytes, masks) = parse_hex_pattern("4D5a..9.").unwrap();
        assert_eq!(bytes, [0x4D, 0x5A, 0x00, 0x90]);
        assert_eq!(masks, [0xFF, 0xFF, 0x00, 0xF0]);
        assert!(parse_hex_pattern("ABC").is_err());
        assert!(parse_hex_pattern("GG").is_err());
        assert!(parse_hex("AB.0").is_err());
        assert_eq!(parse_hex("00ff").unwrap(), [0x00, 0xFF]);
    }

    #[test]
    fn polarity_and_ui_text() {
        assert!(erase_polarity(0x0004_FEFF));
        assert!(!erase_polarity(0x0000_0001));
        assert_eq!(empty_byte(true), 0xFF);
        assert_eq!(utf16_to_string(&[b'S', 0, b'h', 0, 0, 0, b'x', 0]), "Sh");
    }
}
