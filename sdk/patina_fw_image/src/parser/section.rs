//! Recursive section stream decoding.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{format, vec, vec::Vec};
use scroll::{Pread, LE};

use super::{ParseContext, Parser};
use crate::{
    node::{Diagnostic, DiagnosticKind, Node, NodeKind, ParsingData, SectionData},
    pi::{
        ffs::section::{self, compression, guid_defined},
        guid,
    },
    section::SectionMetaData,
    utils, FirmwareImageError,
};

/// Parsed section header: metadata, header length and total length.
pub(crate) fn section_header(bytes: &[u8]) -> Result<(SectionMetaData, bool, usize, usize), FirmwareImageError> {
    let common = bytes.pread_with::<section::CommonHeader>(0, LE)?;
    let size3 = utils::decode_size3(&common.size);
    let (extended, common_size, size) = if size3 == utils::SIZE3_SENTINEL {
        (true, section::EXTENDED_HEADER_SIZE, bytes.pread_with::<u32>(section::COMMON_HEADER_SIZE, LE)? as usize)
    } else {
        (false, section::COMMON_HEADER_SIZE, size3 as usize)
    };
    if size < common_size || size > bytes.len() {
        Err(FirmwareImageError::MalformedHeader)?;
    }
    let bytes = &bytes[..size];

    let (metadata, header_size) = match common.section_type {
        section::r#type::COMPRESSION => {
            let header = bytes.pread_with::<section::Compression>(common_size, LE)?;
            (SectionMetaData::Compression(header), common_size + compression::HEADER_SIZE)
        }
        section::r#type::GUID_DEFINED => {
            let header = bytes.pread_with::<section::GuidDefined>(common_size, LE)?;
            let data_offset = header.data_offset as usize;
            let fixed = common_size + guid_defined::HEADER_SIZE;
            if data_offset < fixed || data_offset > size {
                Err(FirmwareImageError::MalformedHeader)?;
            }
            (SectionMetaData::GuidDefined(header, bytes[fixed..data_offset].to_vec()), data_offset)
        }
        section::r#type::VERSION => {
            (SectionMetaData::Version(bytes.pread_with::<u16>(common_size, LE)?), common_size + 2)
        }
        section::r#type::FREEFORM_SUBTYPE_GUID => {
            let mut offset = common_size;
            (SectionMetaData::FreeformSubtypeGuid(crate::pi::gread_guid(bytes, &mut offset)?), offset)
        }
        section::r#type::INSYDE_POSTCODE | section::r#type::SCT_POSTCODE => (
            SectionMetaData::Postcode(common.section_type, bytes.pread_with::<u32>(common_size, LE)?),
            common_size + 4,
        ),
        section_type => (SectionMetaData::Standard(section_type), common_size),
    };
    if header_size > size {
        Err(FirmwareImageError::MalformedHeader)?;
    }
    Ok((metadata, extended, header_size, size))
}

impl Parser<'_> {
    /// Decodes a section stream. Sections are 4-byte aligned from the start of `bytes`.
    ///
    /// A section that cannot be decoded turns the rest of the stream into one opaque node.
    /// Problems with the stream itself (non-empty gaps) are added to `diagnostics`, which belong to
    /// the node owning the stream.
    pub(crate) fn decode_sections(
        &self,
        bytes: &[u8],
        context: ParseContext,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<Node> {
        if let Some(raw) = self.too_deep(bytes, context) {
            return vec![raw];
        }
        let is_fill = |b: &u8| *b == 0x00 || context.erase_polarity.is_some_and(|p| *b == utils::empty_byte(p));

        let mut sections = Vec::new();
        let mut position = 0;
        while position < bytes.len() {
            let remaining = &bytes[position..];
            if remaining.iter().all(is_fill) {
                break;
            }
            match self.decode_section(remaining, position, context) {
                Ok(node) => {
                    let end = position + node.total_len();
                    sections.push(node);
                    let next = end.next_multiple_of(4).min(bytes.len());
                    if !bytes[end..next].iter().all(is_fill) {
                        diagnostics.push(Diagnostic::new(
                            DiagnosticKind::InconsistentLayout,
                            format!("non-empty alignment bytes after the section at {position:#x}"),
                        ));
                    }
                    position = next;
                }
                Err(_) => {
                    let mut raw = Node::leaf(NodeKind::Raw, remaining, position);
                    raw.add_diagnostic(
                        DiagnosticKind::MalformedHeader,
                        format!("invalid section header at offset {position:#x}"),
                    );
                    sections.push(raw);
                    break;
                }
            }
        }
        sections
    }

    /// Decodes the section at the start of `bytes` and, recursively, its contents.
    pub(crate) fn decode_section(
        &self,
        bytes: &[u8],
        offset: usize,
        context: ParseContext,
    ) -> Result<Node, FirmwareImageError> {
        let (metadata, extended, header_size, size) = section_header(bytes)?;
        let section_type = metadata.section_type();
        let mut node = Node::new(
            NodeKind::Section(section_type),
            bytes[..header_size].to_vec(),
            bytes[header_size..size].to_vec(),
            Vec::new(),
            offset,
        );
        if let Some(guid) = metadata.definition_guid() {
            node.name = Some(self.guid_name(&guid));
        } else if let SectionMetaData::FreeformSubtypeGuid(guid) = &metadata {
            node.name = Some(self.guid_name(guid));
        }
        node.parsing_data = ParsingData::Section(SectionData { metadata, extended, decoded: None });
        self.decode_section_contents(&mut node, context)?;
        Ok(node)
    }

    /// Fills in the children (and decoded payload) of a section whose header and body are set.
    pub(crate) fn decode_section_contents(
        &self,
        node: &mut Node,
        context: ParseContext,
    ) -> Result<(), FirmwareImageError> {
        let ParsingData::Section(data) = &node.parsing_data else {
            return Ok(());
        };
        let metadata = data.metadata.clone();
        let child_context = context.child_context(node);
        let mut diagnostics = Vec::new();
        let mut decoded = None;

        let children = match &metadata {
            SectionMetaData::Standard(section::r#type::FIRMWARE_VOLUME_IMAGE) => {
                self.parse_bios_space(&node.body, child_context)?
            }
            SectionMetaData::Standard(section::r#type::RAW) => {
                let children = self.parse_bios_space(&node.body, child_context)?;
                if children.iter().any(|child| child.kind.is_volume() || child.kind.is_vendor()) {
                    children
                } else {
                    Vec::new()
                }
            }
            SectionMetaData::Standard(section::r#type::DISPOSABLE) => {
                self.decode_sections(&node.body, child_context, &mut diagnostics)
            }
            SectionMetaData::Standard(section::r#type::USER_INTERFACE) | SectionMetaData::Version(_) => {
                node.text = Some(utils::utf16_to_string(&node.body));
                Vec::new()
            }
            SectionMetaData::Compression(header) if header.compression_type == compression::NOT_COMPRESSED => {
                self.decode_sections(&node.body, child_context, &mut diagnostics)
            }
            SectionMetaData::Compression(header) => match self.extractor.extract(&metadata, &node.body) {
                Ok(payload) => {
                    if payload.len() != header.uncompressed_length as usize {
                        diagnostics.push(Diagnostic::new(
                            DiagnosticKind::InconsistentLayout,
                            format!(
                                "decompressed {:#x} bytes, header declares {:#x}",
                                payload.len(),
                                header.uncompressed_length
                            ),
                        ));
                    }
                    let children = self.decode_sections(&payload, child_context, &mut diagnostics);
                    decoded = Some(payload);
                    children
                }
                Err(err) => {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::UnsupportedEncoding,
                        format!("compression type {} could not be decoded: {:?}", header.compression_type, err),
                    ));
                    Vec::new()
                }
            },
            SectionMetaData::GuidDefined(header, _) => {
                let definition = header.section_definition_guid;
                match self.extractor.extract(&metadata, &node.body) {
                    Ok(payload) => {
                        let children = self.decode_sections(&payload, child_context, &mut diagnostics);
                        decoded = Some(payload);
                        children
                    }
                    Err(err) if definition == guid::CRC32_SECTION_GUID => {
                        // The payload is stored as is, so it can be walked without a codec.
                        if err != FirmwareImageError::UnsupportedEncoding {
                            let message = format!("CRC32 section data failed verification: {err:?}");
                            diagnostics.push(Diagnostic::new(DiagnosticKind::ChecksumMismatch, message));
                        }
                        self.decode_sections(&node.body, child_context, &mut diagnostics)
                    }
                    Err(FirmwareImageError::UnsupportedEncoding) if !metadata.processing_required() => {
                        log::debug!("GUID-defined section {} left opaque", utils::guid_to_string(&definition));
                        Vec::new()
                    }
                    Err(err) => {
                        diagnostics.push(Diagnostic::new(
                            DiagnosticKind::UnsupportedEncoding,
                            format!(
                                "GUID-defined section {} was not decoded: {:?}",
                                utils::guid_to_string(&definition),
                                err
                            ),
                        ));
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        if let ParsingData::Section(data) = &mut node.parsing_data {
            data.decoded = decoded;
        }
        node.children = children;
        node.diagnostics.extend(diagnostics);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use super::*;
    use crate::{pi::ffs::section::r#type, section::SectionExtractor};
    use alloc::vec::Vec;

    fn stream(parser: &Parser, bytes: &[u8]) -> (Vec<Node>, Vec<Diagnostic>) {
        let mut diagnostics = Vec::new();
        let context = ParseContext { depth: 1, erase_polarity: Some(true), ..Default::default() };
        let sections = parser.decode_sections(bytes, context, &mut diagnostics);
        (sections, diagnostics)
    }

    /// Treats every GUID-defined body as a section stream that ends with a copy of itself.
    struct SelfReferencing;

    impl SectionExtractor for SelfReferencing {
        fn extract(&self, _metadata: &SectionMetaData, content: &[u8]) -> Result<Vec<u8>, FirmwareImageError> {
            let inner = guid_defined_section(&FILE_GUID, guid_defined::PROCESSING_REQUIRED, &[], content);
            Ok(inner)
        }
    }

    #[test]
    fn leaf_sections_are_aligned() {
        let parser = Parser::new(&NoCodecs);
        let bytes = section_stream(&[
            section(r#type::PE32, &[1, 2, 3, 4, 5]),
            section(r#type::TE, &[6, 7, 8, 9]),
            section(r#type::VERSION, &[0x01, 0x00, b'1', 0, 0, 0]),
        ]);
        let (sections, diagnostics) = stream(&parser, &bytes);
        assert!(diagnostics.is_empty());
        let offsets: Vec<usize> = sections.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, [0, 12, 20]);
        assert_eq!(sections[2].section_data().unwrap().metadata, SectionMetaData::Version(1));
        assert_eq!(sections[2].text.as_deref(), Some("1"));
    }

    #[test]
    fn non_zero_gap_is_a_diagnostic() {
        let parser = Parser::new(&NoCodecs);
        let mut bytes = section(r#type::PE32, &[1, 2, 3, 4, 5]);
        bytes.extend_from_slice(&[0x77, 0x00, 0x00]);
        bytes.extend_from_slice(&section(r#type::RAW, &[0; 4]));
        let (sections, diagnostics) = stream(&parser, &bytes);
        assert_eq!(sections.len(), 2);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::InconsistentLayout);
    }

    #[test]
    fn malformed_section_turns_the_rest_into_raw() {
        let parser = Parser::new(&NoCodecs);
        let mut bytes = section(r#type::PE32, &[1, 2, 3, 4]);
        bytes.extend_from_slice(&[0x40, 0x00, 0x00, 0x19, 1, 2, 3, 4]);
        let (sections, _) = stream(&parser, &bytes);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].kind, NodeKind::Raw);
        assert_eq!(sections[1].offset, 8);
        assert!(sections[1].has_diagnostic(DiagnosticKind::MalformedHeader));
    }

    #[test]
    fn extended_size_header() {
        let parser = Parser::new(&NoCodecs);
        let mut bytes = vec![0xFF, 0xFF, 0xFF, r#type::RAW];
        bytes.extend_from_slice(&12u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        let (sections, _) = stream(&parser, &bytes);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].header.len(), 8);
        assert!(sections[0].section_data().unwrap().extended);
        assert_eq!(sections[0].body, [1, 2, 3, 4]);
    }

    #[test]
    fn crc32_sections_are_walked_without_a_codec() {
        let parser = Parser::new(&NoCodecs);
        let inner = section(r#type::PE32, &[0x4D, 0x5A, 0x90, 0x00]);
        let bytes = guid_defined_section(&guid::CRC32_SECTION_GUID, guid_defined::AUTH_STATUS_VALID, &[0; 4], &inner);
        let (sections, diagnostics) = stream(&parser, &bytes);
        assert!(diagnostics.is_empty());
        assert!(sections[0].diagnostics.is_empty());
        assert_eq!(sections[0].children.len(), 1);
        assert_eq!(sections[0].children[0].kind, NodeKind::Section(r#type::PE32));
        assert!(!sections[0].is_decoded());
    }

    #[test]
    fn guid_defined_sections_without_a_codec() {
        let parser = Parser::new(&NoCodecs);
        let inner = section(r#type::PE32, &[0x4D, 0x5A, 0x90, 0x00]);
        let bytes = guid_defined_section(&guid::LZMA_SECTION_GUID, guid_defined::PROCESSING_REQUIRED, &[], &inner);
        let (sections, _) = stream(&parser, &bytes);
        assert!(sections[0].children.is_empty());
        assert!(sections[0].has_diagnostic(DiagnosticKind::UnsupportedEncoding));

        // An unknown GUID without the processing required bit stays opaque but is not an error.
        let bytes = guid_defined_section(&FILE_GUID, 0, &[], &inner);
        let (sections, _) = stream(&parser, &bytes);
        assert!(sections[0].children.is_empty());
        assert!(sections[0].diagnostics.is_empty());
        assert_eq!(sections[0].body, inner);
    }

    #[test]
    fn not_compressed_and_disposable_recurse() {
        let parser = Parser::new(&NoCodecs);
        let inner = section(r#type::RAW, &[1, 2, 3, 4]);
        let mut compressed = Vec::new();
        compressed.extend_from_slice(&(inner.len() as u32).to_le_bytes());
        compressed.push(compression::NOT_COMPRESSED);
        compressed.extend_from_slice(&inner);
        let bytes = section_stream(&[section(r#type::COMPRESSION, &compressed), section(r#type::DISPOSABLE, &inner)]);
        let (sections, _) = stream(&parser, &bytes);
        assert_eq!(sections[0].header.len(), 9);
        assert_eq!(sections[0].children.len(), 1);
        assert_eq!(sections[1].children.len(), 1);
    }

    #[test]
    fn self_referencing_encapsulation_stops_at_the_depth_limit() {
        let parser = Parser::new(&SelfReferencing)
            .with_options(crate::ParseOptions { max_depth: 6, ..Default::default() });
        let bytes = guid_defined_section(&FILE_GUID, guid_defined::PROCESSING_REQUIRED, &[], &[0; 4]);
        let (sections, _) = stream(&parser, &bytes);

        let mut node = &sections[0];
        let mut levels = 0;
        while let Some(child) = node.children.first() {
            node = child;
            levels += 1;
        }
        assert_eq!(node.kind, NodeKind::Raw);
        assert!(node.has_diagnostic(DiagnosticKind::RecursionLimitExceeded));
        assert_eq!(levels, 6);
    }
}
