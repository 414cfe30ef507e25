//! Brotli GUID-defined sections.
//!
//! The section data starts with the 64-bit decompressed size and the 64-bit scratch buffer size
//! used by the EDK II decoder, followed by the Brotli stream.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{boxed::Box, vec, vec::Vec};
use alloc_no_stdlib::{define_index_ops_mut, SliceWrapper, SliceWrapperMut};
use brotli_decompressor::{BrotliDecompressStream, BrotliResult, BrotliState, HuffmanCode};
use patina_fw_image::{
    pi::guid::BROTLI_SECTION_GUID,
    section::{SectionExtractor, SectionMetaData},
    FirmwareImageError,
};

const SIZES_LEN: usize = 16;

// Heap backed allocator for the decoder state.
struct Rebox<T>(Box<[T]>);

impl<T> Default for Rebox<T> {
    fn default() -> Self {
        Rebox(Vec::new().into_boxed_slice())
    }
}
define_index_ops_mut!(T, Rebox<T>);

impl<T> SliceWrapper<T> for Rebox<T> {
    fn slice(&self) -> &[T] {
        &self.0
    }
}

impl<T> SliceWrapperMut<T> for Rebox<T> {
    fn slice_mut(&mut self) -> &mut [T] {
        &mut self.0
    }
}

struct HeapAllocator<T: Clone> {
    default_value: T,
}

impl<T: Clone> alloc_no_stdlib::Allocator<T> for HeapAllocator<T> {
    type AllocatedMemory = Rebox<T>;

    fn alloc_cell(&mut self, len: usize) -> Rebox<T> {
        Rebox(vec![self.default_value.clone(); len].into_boxed_slice())
    }

    fn free_cell(&mut self, _data: Rebox<T>) {}
}

/// Decodes Brotli GUID-defined sections.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrotliSectionExtractor;

impl SectionExtractor for BrotliSectionExtractor {
    fn extract(&self, metadata: &SectionMetaData, content: &[u8]) -> Result<Vec<u8>, FirmwareImageError> {
        if metadata.definition_guid() != Some(BROTLI_SECTION_GUID) {
            return Err(FirmwareImageError::UnsupportedEncoding);
        }
        let Some((sizes, stream)) = content.split_at_checked(SIZES_LEN) else {
            log::debug!("Brotli section of {:#x} bytes has no size fields", content.len());
            return Err(FirmwareImageError::DataCorrupt);
        };
        let out_size = sizes[..8]
            .try_into()
            .map(u64::from_le_bytes)
            .map_err(|_| FirmwareImageError::DataCorrupt)?;
        let out_size = match usize::try_from(out_size) {
            Ok(size) if size <= crate::MAX_DECODED_SIZE => size,
            _ => {
                log::warn!("Brotli section claims {:#x} decompressed bytes", out_size);
                return Err(FirmwareImageError::UnsupportedEncoding);
            }
        };

        let mut state = BrotliState::new(
            HeapAllocator::<u8> { default_value: 0 },
            HeapAllocator::<u32> { default_value: 0 },
            HeapAllocator::<HuffmanCode> { default_value: Default::default() },
        );
        let mut out_data = Vec::new();
        out_data.try_reserve_exact(out_size).map_err(|_| FirmwareImageError::UnsupportedEncoding)?;
        out_data.resize(out_size, 0);
        let mut total_out = 0;
        let result = BrotliDecompressStream(
            &mut stream.len(),
            &mut 0,
            stream,
            &mut out_data.len(),
            &mut 0,
            out_data.as_mut_slice(),
            &mut total_out,
            &mut state,
        );

        match result {
            BrotliResult::ResultSuccess => Ok(out_data),
            _ => {
                log::debug!("Brotli stream did not decode to {:#x} bytes", out_size);
                Err(FirmwareImageError::DataCorrupt)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patina_fw_image::pi::guid;

    use crate::tests::*;

    #[test]
    fn size_fields_are_required() {
        let metadata = guid_defined(BROTLI_SECTION_GUID, 1, &[]);
        assert_eq!(BrotliSectionExtractor.extract(&metadata, &[0; 12]), Err(FirmwareImageError::DataCorrupt));
    }

    #[test]
    fn implausible_sizes_are_refused() {
        let metadata = guid_defined(BROTLI_SECTION_GUID, 1, &[]);
        let mut content = vec![0u8; 24];
        content[..8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert_eq!(BrotliSectionExtractor.extract(&metadata, &content), Err(FirmwareImageError::UnsupportedEncoding));
    }

    #[test]
    fn other_sections_are_not_handled() {
        let lzma = guid_defined(guid::LZMA_SECTION_GUID, 1, &[]);
        assert_eq!(BrotliSectionExtractor.extract(&lzma, &[0; 32]), Err(FirmwareImageError::UnsupportedEncoding));
    }
}
