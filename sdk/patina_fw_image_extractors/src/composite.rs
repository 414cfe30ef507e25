//! Composite of the codecs enabled by feature flags.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use patina_fw_image::{
    section::{SectionComposer, SectionExtractor, SectionMetaData},
    FirmwareImageError,
};

#[cfg(feature = "brotli")]
use crate::BrotliSectionExtractor;
#[cfg(feature = "crc32")]
use crate::Crc32SectionExtractor;
#[cfg(feature = "lzma")]
use crate::LzmaSectionExtractor;
#[cfg(feature = "uefi_decompress")]
use crate::UefiDecompressSectionExtractor;

/// Tries each enabled codec in turn. A codec answering
/// [`UnsupportedEncoding`](FirmwareImageError::UnsupportedEncoding) passes the section on; any
/// other result is final.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompositeSectionExtractor {
    #[cfg(feature = "uefi_decompress")]
    uefi_decompress: UefiDecompressSectionExtractor,
    #[cfg(feature = "brotli")]
    brotli: BrotliSectionExtractor,
    #[cfg(feature = "crc32")]
    crc32: Crc32SectionExtractor,
    #[cfg(feature = "lzma")]
    lzma: LzmaSectionExtractor,
}

impl SectionExtractor for CompositeSectionExtractor {
    fn extract(&self, metadata: &SectionMetaData, content: &[u8]) -> Result<Vec<u8>, FirmwareImageError> {
        #[cfg(feature = "uefi_decompress")]
        {
            match self.uefi_decompress.extract(metadata, content) {
                Err(FirmwareImageError::UnsupportedEncoding) => (),
                result => return result,
            }
        }

        #[cfg(feature = "brotli")]
        {
            match self.brotli.extract(metadata, content) {
                Err(FirmwareImageError::UnsupportedEncoding) => (),
                result => return result,
            }
        }

        #[cfg(feature = "crc32")]
        {
            match self.crc32.extract(metadata, content) {
                Err(FirmwareImageError::UnsupportedEncoding) => (),
                result => return result,
            }
        }

        #[cfg(feature = "lzma")]
        {
            match self.lzma.extract(metadata, content) {
                Err(FirmwareImageError::UnsupportedEncoding) => (),
                result => return result,
            }
        }

        let _ = (metadata, content);
        Err(FirmwareImageError::UnsupportedEncoding)
    }
}

impl SectionComposer for CompositeSectionExtractor {
    fn compose(
        &self,
        metadata: &SectionMetaData,
        payload: &[u8],
    ) -> Result<(SectionMetaData, Vec<u8>), FirmwareImageError> {
        #[cfg(feature = "crc32")]
        {
            match self.crc32.compose(metadata, payload) {
                Err(FirmwareImageError::UnsupportedEncoding) => (),
                result => return result,
            }
        }

        #[cfg(feature = "lzma")]
        {
            match self.lzma.compose(metadata, payload) {
                Err(FirmwareImageError::UnsupportedEncoding) => (),
                result => return result,
            }
        }

        let _ = (metadata, payload);
        Err(FirmwareImageError::UnsupportedEncoding)
    }
}
