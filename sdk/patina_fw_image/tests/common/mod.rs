//! Image builders shared by the integration tests.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![allow(dead_code)]

use patina_fw_image::{
    pi::{
        self,
        ffs::{file, section},
    },
    section::{SectionComposer, SectionExtractor, SectionMetaData},
    utils, FirmwareImageError,
};
use r_efi::efi;

pub const FILE_GUID: efi::Guid =
    efi::Guid::from_fields(0x11111111, 0x2222, 0x3333, 0x44, 0x55, &[0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB]);
pub const INNER_FILE_GUID: efi::Guid =
    efi::Guid::from_fields(0x5A5A5A5A, 0x0102, 0x0304, 0x05, 0x06, &[0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C]);

pub const UNKNOWN_FILE_SYSTEM_GUID: efi::Guid =
    efi::Guid::from_fields(0x0BADF00D, 0x1234, 0x5678, 0x9A, 0xBC, &[0xDE, 0xF0, 0x12, 0x34, 0x56, 0x78]);

pub fn init_logging() {
    patina_internal_test_logger::init();
}

pub struct NoCodecs;

impl SectionExtractor for NoCodecs {
    fn extract(&self, _metadata: &SectionMetaData, _content: &[u8]) -> Result<Vec<u8>, FirmwareImageError> {
        Err(FirmwareImageError::UnsupportedEncoding)
    }
}

impl SectionComposer for NoCodecs {
    fn compose(
        &self,
        _metadata: &SectionMetaData,
        _payload: &[u8],
    ) -> Result<(SectionMetaData, Vec<u8>), FirmwareImageError> {
        Err(FirmwareImageError::UnsupportedEncoding)
    }
}

pub fn section(section_type: u8, body: &[u8]) -> Vec<u8> {
    let mut bytes = utils::encode_size3((section::COMMON_HEADER_SIZE + body.len()) as u32).unwrap().to_vec();
    bytes.push(section_type);
    bytes.extend_from_slice(body);
    bytes
}

pub fn guid_defined_section(guid: &efi::Guid, attributes: u16, data: &[u8]) -> Vec<u8> {
    let data_offset = section::COMMON_HEADER_SIZE + section::guid_defined::HEADER_SIZE;
    let mut bytes = utils::encode_size3((data_offset + data.len()) as u32).unwrap().to_vec();
    bytes.push(section::r#type::GUID_DEFINED);
    bytes.extend_from_slice(guid.as_bytes());
    bytes.extend_from_slice(&(data_offset as u16).to_le_bytes());
    bytes.extend_from_slice(&attributes.to_le_bytes());
    bytes.extend_from_slice(data);
    bytes
}

/// A file with valid checksums and every construction state bit set, for erase polarity 1.
pub fn ffs_file(name: &efi::Guid, file_type: u8, body: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; file::HEADER_SIZE];
    bytes[..16].copy_from_slice(name.as_bytes());
    bytes[18] = file_type;
    bytes[20..23].copy_from_slice(&utils::encode_size3((file::HEADER_SIZE + body.len()) as u32).unwrap());
    bytes[16] = utils::checksum8(&bytes);
    bytes[17] = file::FIXED_CHECKSUM;
    bytes[23] = 0xF8;
    bytes.extend_from_slice(body);
    bytes
}

/// A revision 2 FFS2 volume with erase polarity 1 and a single block of `fv_length` bytes.
pub fn volume(files: &[Vec<u8>], fv_length: usize) -> Vec<u8> {
    volume_with_guid(&pi::guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, files, fv_length)
}

pub fn volume_with_guid(file_system: &efi::Guid, files: &[Vec<u8>], fv_length: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; 72];
    bytes[16..32].copy_from_slice(file_system.as_bytes());
    bytes[32..40].copy_from_slice(&(fv_length as u64).to_le_bytes());
    bytes[40..44].copy_from_slice(b"_FVH");
    bytes[44..48].copy_from_slice(&0x0004_FEFFu32.to_le_bytes());
    bytes[48..50].copy_from_slice(&72u16.to_le_bytes());
    bytes[55] = 2;
    bytes[56..60].copy_from_slice(&1u32.to_le_bytes());
    bytes[60..64].copy_from_slice(&(fv_length as u32).to_le_bytes());
    let checksum = utils::checksum16(&bytes);
    bytes[50..52].copy_from_slice(&checksum.to_le_bytes());
    for file in files {
        while bytes.len() % 8 != 0 {
            bytes.push(0xFF);
        }
        bytes.extend_from_slice(file);
    }
    assert!(bytes.len() <= fv_length);
    bytes.resize(fv_length, 0xFF);
    bytes
}

/// Volume, one RAW file of 36 bytes, one 8-byte RAW section followed by 4 bytes of zero fill.
pub fn single_raw_file_volume(fv_length: usize) -> Vec<u8> {
    let mut body = section(section::r#type::RAW, &[0xA5, 0x5A, 0xC3, 0x3C]);
    body.extend_from_slice(&[0; 4]);
    volume(&[ffs_file(&FILE_GUID, file::r#type::RAW, &body)], fv_length)
}

/// A firmware volume image file whose nested volume holds a file named [`INNER_FILE_GUID`].
pub fn nested_volume_image() -> Vec<u8> {
    let inner_file = ffs_file(&INNER_FILE_GUID, file::r#type::FREEFORM, &section(section::r#type::RAW, &[0; 4]));
    let inner_volume = volume(&[inner_file], 0x80);
    let fv_section = section(section::r#type::FIRMWARE_VOLUME_IMAGE, &inner_volume);
    volume(&[ffs_file(&FILE_GUID, file::r#type::FIRMWARE_VOLUME_IMAGE, &fv_section)], 0x200)
}

/// Like [`nested_volume_image`], but the nested volume has a file system nothing decodes and
/// [`INNER_FILE_GUID`] lies somewhere in its body.
pub fn opaque_nested_volume_image() -> Vec<u8> {
    let mut stored = vec![0u8; 8];
    stored.extend_from_slice(INNER_FILE_GUID.as_bytes());
    let inner_volume = volume_with_guid(&UNKNOWN_FILE_SYSTEM_GUID, &[stored], 0x80);
    let fv_section = section(section::r#type::FIRMWARE_VOLUME_IMAGE, &inner_volume);
    volume(&[ffs_file(&FILE_GUID, file::r#type::FIRMWARE_VOLUME_IMAGE, &fv_section)], 0x200)
}

/// Standard (unauthenticated) VSS variable.
pub fn vss_variable(state: u8, vendor: &efi::Guid, name: &str, data: &[u8]) -> Vec<u8> {
    use pi::nvram::vss;

    let name: Vec<u8> = name.encode_utf16().chain([0]).flat_map(u16::to_le_bytes).collect();
    let mut bytes = vss::VARIABLE_START_ID.to_le_bytes().to_vec();
    bytes.extend_from_slice(&[state, 0]);
    bytes.extend_from_slice(&vss::attributes::NON_VOLATILE.to_le_bytes());
    bytes.extend_from_slice(&(name.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
    bytes.extend_from_slice(vendor.as_bytes());
    bytes.extend_from_slice(&name);
    bytes.extend_from_slice(data);
    bytes
}

/// NVRAM volume of `fv_length` bytes with one `$VSS` store of `store_len` bytes.
pub fn nvram_volume(variables: &[Vec<u8>], store_len: usize, fv_length: usize) -> Vec<u8> {
    use pi::nvram::vss;

    let mut store = vss::STORE_SIGNATURE.to_le_bytes().to_vec();
    store.extend_from_slice(&(store_len as u32).to_le_bytes());
    store.extend_from_slice(&[0x5A, 0xFE, 0, 0, 0, 0, 0, 0]);
    for variable in variables {
        store.extend_from_slice(variable);
    }
    store.resize(store_len, 0xFF);
    volume_with_guid(&pi::guid::NVRAM_MAIN_STORE_VOLUME_GUID, &[store], fv_length)
}
