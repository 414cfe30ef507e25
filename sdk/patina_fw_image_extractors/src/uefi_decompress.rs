//! UEFI and Tiano decompression.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use mu_rust_helpers::uefi_decompress::{decompress_into_with_algo, DecompressionAlgorithm};
use patina_fw_image::{
    pi::{ffs::section::compression, guid::TIANO_DECOMPRESS_SECTION_GUID},
    section::{SectionExtractor, SectionMetaData},
    FirmwareImageError,
};

/// Decodes standard compression sections and Tiano GUID-defined sections.
///
/// Standard compression sections are produced by either the EFI 1.1 or the Tiano compressor
/// depending on the build tools, so both algorithms are tried.
#[derive(Debug, Default, Clone, Copy)]
pub struct UefiDecompressSectionExtractor;

impl SectionExtractor for UefiDecompressSectionExtractor {
    fn extract(&self, metadata: &SectionMetaData, content: &[u8]) -> Result<Vec<u8>, FirmwareImageError> {
        match metadata {
            SectionMetaData::GuidDefined(header, _)
                if header.section_definition_guid == TIANO_DECOMPRESS_SECTION_GUID =>
            {
                decompress(content, DecompressionAlgorithm::TianoDecompress)
            }
            SectionMetaData::Compression(header) => match header.compression_type {
                compression::NOT_COMPRESSED => Ok(content.to_vec()),
                compression::STANDARD_COMPRESSION => decompress(content, DecompressionAlgorithm::UefiDecompress)
                    .or_else(|_| decompress(content, DecompressionAlgorithm::TianoDecompress)),
                _ => Err(FirmwareImageError::UnsupportedEncoding),
            },
            _ => Err(FirmwareImageError::UnsupportedEncoding),
        }
    }
}

fn decompress(src: &[u8], algo: DecompressionAlgorithm) -> Result<Vec<u8>, FirmwareImageError> {
    // Compressed size and decompressed size lead the data.
    let &[c0, c1, c2, c3, d0, d1, d2, d3, ..] = src else {
        return Err(FirmwareImageError::DataCorrupt);
    };
    let compressed_size = u32::from_le_bytes([c0, c1, c2, c3]) as usize;
    if compressed_size > src.len() {
        Err(FirmwareImageError::DataCorrupt)?;
    }

    let decompressed_size = u32::from_le_bytes([d0, d1, d2, d3]) as usize;
    if decompressed_size > crate::decoded_size_limit(src.len()) {
        log::warn!("{:#x} bytes claim to decompress to {:#x} bytes", src.len(), decompressed_size);
        Err(FirmwareImageError::UnsupportedEncoding)?;
    }
    let mut decompressed = Vec::new();
    decompressed.try_reserve_exact(decompressed_size).map_err(|_| FirmwareImageError::UnsupportedEncoding)?;
    decompressed.resize(decompressed_size, 0);
    decompress_into_with_algo(src, &mut decompressed, algo).map_err(|_| {
        log::debug!("{:#x} bytes did not decompress", src.len());
        FirmwareImageError::DataCorrupt
    })?;
    Ok(decompressed)
}
