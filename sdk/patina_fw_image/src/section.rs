//! Section header metadata and the codec seams used to decode and re-encode encapsulations.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{vec, vec::Vec};
use r_efi::efi;
use scroll::{Pwrite, LE};

use crate::{
    pi::ffs::section::{self, compression, guid_defined},
    utils, FirmwareImageError,
};

/// Turns the body of an encapsulation section into its decoded payload.
///
/// Implementations return [`FirmwareImageError::UnsupportedEncoding`] for sections they do not
/// handle so that composites can fall through to the next codec.
pub trait SectionExtractor {
    fn extract(&self, metadata: &SectionMetaData, content: &[u8]) -> Result<Vec<u8>, FirmwareImageError>;
}

/// Inverse of [`SectionExtractor`]: encodes a payload and returns the updated metadata with it.
pub trait SectionComposer {
    fn compose(
        &self,
        metadata: &SectionMetaData,
        payload: &[u8],
    ) -> Result<(SectionMetaData, Vec<u8>), FirmwareImageError>;
}

/// Type-specific header data that follows the common section header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionMetaData {
    /// Sections with nothing past the common header.
    Standard(u8),
    Compression(section::Compression),
    /// GUID-defined header plus the GUID specific bytes up to `data_offset`.
    GuidDefined(section::GuidDefined, Vec<u8>),
    Version(u16),
    FreeformSubtypeGuid(efi::Guid),
    /// Insyde or Phoenix SCT postcode section.
    Postcode(u8, u32),
}

impl SectionMetaData {
    pub fn section_type(&self) -> u8 {
        match self {
            SectionMetaData::Standard(section_type) => *section_type,
            SectionMetaData::Compression(_) => section::r#type::COMPRESSION,
            SectionMetaData::GuidDefined(_, _) => section::r#type::GUID_DEFINED,
            SectionMetaData::Version(_) => section::r#type::VERSION,
            SectionMetaData::FreeformSubtypeGuid(_) => section::r#type::FREEFORM_SUBTYPE_GUID,
            SectionMetaData::Postcode(section_type, _) => *section_type,
        }
    }

    pub fn definition_guid(&self) -> Option<efi::Guid> {
        match self {
            SectionMetaData::GuidDefined(header, _) => Some(header.section_definition_guid),
            _ => None,
        }
    }

    pub fn processing_required(&self) -> bool {
        match self {
            SectionMetaData::GuidDefined(header, _) => header.attributes & guid_defined::PROCESSING_REQUIRED != 0,
            _ => false,
        }
    }

    /// Serializes the type-specific header data. `common_header_size` is needed to place the
    /// GUID-defined `data_offset`.
    pub fn serialize_extra(&self, common_header_size: usize) -> Result<Vec<u8>, FirmwareImageError> {
        match self {
            SectionMetaData::Standard(_) => Ok(Vec::new()),
            SectionMetaData::Compression(header) => {
                let mut extra = vec![0u8; compression::HEADER_SIZE];
                extra.pwrite_with(*header, 0, LE)?;
                Ok(extra)
            }
            SectionMetaData::GuidDefined(header, guid_specific) => {
                let data_offset = common_header_size + guid_defined::HEADER_SIZE + guid_specific.len();
                let data_offset: u16 = data_offset.try_into().map_err(|_| FirmwareImageError::SizeOverflow)?;
                let mut extra = vec![0u8; guid_defined::HEADER_SIZE];
                let mut offset = 0;
                extra.gwrite_with(header.section_definition_guid.as_bytes().as_slice(), &mut offset, ())?;
                extra.gwrite_with(data_offset, &mut offset, LE)?;
                extra.gwrite_with(header.attributes, &mut offset, LE)?;
                extra.extend_from_slice(guid_specific);
                Ok(extra)
            }
            SectionMetaData::Version(build_number) => Ok(build_number.to_le_bytes().to_vec()),
            SectionMetaData::FreeformSubtypeGuid(guid) => Ok(guid.as_bytes().to_vec()),
            SectionMetaData::Postcode(_, postcode) => Ok(postcode.to_le_bytes().to_vec()),
        }
    }

    /// Builds a full section header for `content_len` bytes of content.
    ///
    /// The extended header is used when `force_extended` is set or when the size does not fit the
    /// 3-byte field and `allow_extended` is set; otherwise an oversized section is an error.
    pub fn serialize_header(
        &self,
        content_len: usize,
        force_extended: bool,
        allow_extended: bool,
    ) -> Result<Vec<u8>, FirmwareImageError> {
        let standard_extra = self.serialize_extra(section::COMMON_HEADER_SIZE)?;
        let standard_size = section::COMMON_HEADER_SIZE + standard_extra.len() + content_len;
        let extended = force_extended || standard_size >= utils::SIZE3_SENTINEL as usize;
        if extended && !force_extended && !allow_extended {
            Err(FirmwareImageError::SizeOverflow)?;
        }

        let mut header = Vec::new();
        if extended {
            let extra = self.serialize_extra(section::EXTENDED_HEADER_SIZE)?;
            let size = section::EXTENDED_HEADER_SIZE + extra.len() + content_len;
            let size: u32 = size.try_into().map_err(|_| FirmwareImageError::SizeOverflow)?;
            header.extend_from_slice(&[0xFF, 0xFF, 0xFF, self.section_type()]);
            header.extend_from_slice(&size.to_le_bytes());
            header.extend_from_slice(&extra);
        } else {
            let size = utils::encode_size3(standard_size as u32)?;
            header.extend_from_slice(&size);
            header.push(self.section_type());
            header.extend_from_slice(&standard_extra);
        }
        Ok(header)
    }
}
