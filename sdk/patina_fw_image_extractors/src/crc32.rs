//! CRC32 GUID-defined sections.
//!
//! The four GUID specific bytes hold the CRC32 of the section data, which is otherwise stored
//! as is.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use patina_fw_image::{
    pi::guid::CRC32_SECTION_GUID,
    section::{SectionComposer, SectionExtractor, SectionMetaData},
    FirmwareImageError,
};

const CRC32_SIZE: usize = 4;

/// Verifies and recomputes CRC32 sections.
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32SectionExtractor;

impl SectionExtractor for Crc32SectionExtractor {
    fn extract(&self, metadata: &SectionMetaData, content: &[u8]) -> Result<Vec<u8>, FirmwareImageError> {
        let SectionMetaData::GuidDefined(header, guid_specific) = metadata else {
            return Err(FirmwareImageError::UnsupportedEncoding);
        };
        if header.section_definition_guid != CRC32_SECTION_GUID {
            return Err(FirmwareImageError::UnsupportedEncoding);
        }

        let stored = guid_specific
            .get(..CRC32_SIZE)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or(FirmwareImageError::DataCorrupt)?;
        let computed = crc32fast::hash(content);
        if stored != computed {
            log::warn!("CRC32 section stores {:#010x}, data hashes to {:#010x}", stored, computed);
            Err(FirmwareImageError::ChecksumMismatch)?;
        }
        Ok(content.to_vec())
    }
}

impl SectionComposer for Crc32SectionExtractor {
    fn compose(
        &self,
        metadata: &SectionMetaData,
        payload: &[u8],
    ) -> Result<(SectionMetaData, Vec<u8>), FirmwareImageError> {
        match metadata {
            SectionMetaData::GuidDefined(header, guid_specific)
                if header.section_definition_guid == CRC32_SECTION_GUID =>
            {
                let mut guid_specific = guid_specific.clone();
                if guid_specific.len() < CRC32_SIZE {
                    guid_specific.resize(CRC32_SIZE, 0);
                }
                guid_specific[..CRC32_SIZE].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());
                Ok((SectionMetaData::GuidDefined(*header, guid_specific), payload.to_vec()))
            }
            _ => Err(FirmwareImageError::UnsupportedEncoding),
        }
    }
}
