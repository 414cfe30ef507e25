//! LZMA GUID-defined sections and customized compression sections.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use std::io::{self, Cursor, Write};

use alloc::vec::Vec;
use patina_fw_image::{
    pi::{ffs::section::compression, guid::LZMA_SECTION_GUID},
    section::{SectionComposer, SectionExtractor, SectionMetaData},
    FirmwareImageError,
};

use crate::MAX_DECODED_SIZE;

/// Size field value meaning the stream carries an end marker instead.
pub const LZMA_UNKNOWN_UNPACKED_SIZE_MAGIC_VALUE: u64 = 0xFFFF_FFFF_FFFF_FFFF;

// Properties byte and dictionary size precede the unpacked size.
const UNPACKED_SIZE_OFFSET: usize = 5;

/// Decodes and encodes LZMA sections.
///
/// Sections using the x86 branch converter on top of LZMA are not handled.
#[derive(Debug, Default, Clone, Copy)]
pub struct LzmaSectionExtractor;

impl LzmaSectionExtractor {
    fn handles(metadata: &SectionMetaData) -> bool {
        match metadata {
            SectionMetaData::GuidDefined(header, _) => header.section_definition_guid == LZMA_SECTION_GUID,
            SectionMetaData::Compression(header) => header.compression_type == compression::CUSTOMIZED_COMPRESSION,
            _ => false,
        }
    }
}

impl SectionExtractor for LzmaSectionExtractor {
    fn extract(&self, metadata: &SectionMetaData, content: &[u8]) -> Result<Vec<u8>, FirmwareImageError> {
        if !Self::handles(metadata) {
            return Err(FirmwareImageError::UnsupportedEncoding);
        }

        let unpacked_size = content
            .get(UNPACKED_SIZE_OFFSET..UNPACKED_SIZE_OFFSET + 8)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or(FirmwareImageError::DataCorrupt)?;
        let declared = match unpacked_size {
            LZMA_UNKNOWN_UNPACKED_SIZE_MAGIC_VALUE => None,
            size => match usize::try_from(size) {
                Ok(size) if size <= MAX_DECODED_SIZE => Some(size),
                _ => {
                    log::warn!("LZMA stream claims {:#x} unpacked bytes", size);
                    return Err(FirmwareImageError::UnsupportedEncoding);
                }
            },
        };

        let capacity = declared.unwrap_or(0).min(crate::decoded_size_limit(content.len()));
        let mut output = BoundedOutput::new(capacity, declared.unwrap_or(MAX_DECODED_SIZE));
        let options = lzma_rs::decompress::Options { memlimit: Some(MAX_DECODED_SIZE), ..Default::default() };
        if let Err(err) = lzma_rs::lzma_decompress_with_options(&mut Cursor::new(content), &mut output, &options) {
            if output.exhausted {
                log::warn!("LZMA stream decodes past {:#x} bytes", output.limit);
                return Err(FirmwareImageError::UnsupportedEncoding);
            }
            log::debug!("LZMA stream did not decode: {:?}", err);
            return Err(FirmwareImageError::DataCorrupt);
        }
        if declared.is_some_and(|size| size != output.bytes.len()) {
            log::debug!("LZMA stream decoded to {:#x} bytes, {:?} declared", output.bytes.len(), declared);
            return Err(FirmwareImageError::DataCorrupt);
        }
        Ok(output.bytes)
    }
}

/// Decoder output that refuses to grow past `limit` bytes.
struct BoundedOutput {
    bytes: Vec<u8>,
    limit: usize,
    exhausted: bool,
}

impl BoundedOutput {
    fn new(capacity: usize, limit: usize) -> Self {
        Self { bytes: Vec::with_capacity(capacity), limit, exhausted: false }
    }
}

impl Write for BoundedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > self.limit - self.bytes.len() {
            self.exhausted = true;
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "decoded size limit reached"));
        }
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SectionComposer for LzmaSectionExtractor {
    fn compose(
        &self,
        metadata: &SectionMetaData,
        payload: &[u8],
    ) -> Result<(SectionMetaData, Vec<u8>), FirmwareImageError> {
        if !Self::handles(metadata) {
            return Err(FirmwareImageError::UnsupportedEncoding);
        }

        let options = lzma_rs::compress::Options {
            unpacked_size: lzma_rs::compress::UnpackedSize::WriteToHeader(Some(payload.len() as u64)),
        };
        let mut compressed = Vec::new();
        lzma_rs::lzma_compress_with_options(&mut Cursor::new(payload), &mut compressed, &options).map_err(|err| {
            log::error!("LZMA compression failed: {:?}", err);
            FirmwareImageError::ComposeFailed
        })?;

        let mut metadata = metadata.clone();
        if let SectionMetaData::Compression(header) = &mut metadata {
            header.uncompressed_length = u32::try_from(payload.len()).map_err(|_| FirmwareImageError::SizeOverflow)?;
        }
        Ok((metadata, compressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patina_fw_image::pi::{ffs::section::guid_defined::PROCESSING_REQUIRED, guid};

    use crate::tests::*;

    // "Hello, World!" with an unknown unpacked size and an end marker.
    const HELLO_WORLD: &[u8] = &[
        0x5D, 0x00, 0x00, 0x80, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x24, 0x19, 0x49, 0x98,
        0x6F, 0x16, 0x02, 0x89, 0x0A, 0x98, 0xE7, 0x3F, 0xA8, 0xC3, 0x95, 0x48, 0x4D, 0xFF, 0xFF, 0x75, 0xF0, 0x00,
        0x00,
    ];

    #[test]
    fn decodes_a_stream_with_an_end_marker() {
        let metadata = guid_defined(LZMA_SECTION_GUID, PROCESSING_REQUIRED, &[]);
        assert_eq!(LzmaSectionExtractor.extract(&metadata, HELLO_WORLD).unwrap(), b"Hello, World!");
    }

    #[test]
    fn corrupt_streams_are_reported() {
        let metadata = guid_defined(LZMA_SECTION_GUID, PROCESSING_REQUIRED, &[]);
        let truncated = [0x00, 0x01, 0x02, 0x03];
        assert_eq!(LzmaSectionExtractor.extract(&metadata, &truncated), Err(FirmwareImageError::DataCorrupt));
    }

    #[test]
    fn implausible_sizes_are_refused() {
        let metadata = guid_defined(LZMA_SECTION_GUID, PROCESSING_REQUIRED, &[]);
        let mut huge = HELLO_WORLD.to_vec();
        huge[5..13].copy_from_slice(&0x4000_0000_0000_0000u64.to_le_bytes());
        assert_eq!(LzmaSectionExtractor.extract(&metadata, &huge), Err(FirmwareImageError::UnsupportedEncoding));
    }

    #[test]
    fn output_stops_at_its_limit() {
        let mut output = BoundedOutput::new(0, 4);
        assert_eq!(output.write(b"abc").unwrap(), 3);
        assert!(output.write(b"de").is_err());
        assert!(output.exhausted);
        assert_eq!(output.bytes, b"abc");
    }

    #[test]
    fn other_sections_are_not_handled() {
        let f86 = guid_defined(guid::LZMA_F86_SECTION_GUID, PROCESSING_REQUIRED, &[]);
        assert_eq!(LzmaSectionExtractor.extract(&f86, HELLO_WORLD), Err(FirmwareImageError::UnsupportedEncoding));
        let standard = compressed(compression::STANDARD_COMPRESSION, 13);
        assert_eq!(LzmaSectionExtractor.compose(&standard, b"x"), Err(FirmwareImageError::UnsupportedEncoding));
    }

    #[test]
    fn composed_sections_decode_to_the_payload() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(0x300).collect();

        let metadata = guid_defined(LZMA_SECTION_GUID, PROCESSING_REQUIRED, &[]);
        let (composed, body) = LzmaSectionExtractor.compose(&metadata, &payload).unwrap();
        assert_eq!(composed, metadata);
        assert_eq!(LzmaSectionExtractor.extract(&composed, &body).unwrap(), payload);

        let (composed, body) =
            LzmaSectionExtractor.compose(&compressed(compression::CUSTOMIZED_COMPRESSION, 0), &payload).unwrap();
        assert_eq!(composed, compressed(compression::CUSTOMIZED_COMPRESSION, 0x300));
        assert_eq!(LzmaSectionExtractor.extract(&composed, &body).unwrap(), payload);
    }
}
