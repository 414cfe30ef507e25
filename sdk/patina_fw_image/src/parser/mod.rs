//! Decoding of raw image bytes into a [`FirmwareImage`] tree.
//!
//! The parser is a depth-first recursive descent over an immutable buffer:
//!
//! ```text
//! image (capsule / descriptor / BIOS space)
//!   └─ volume
//!        └─ file
//!             └─ section ─┬─ section ... (encapsulations)
//!                         └─ volume ...   (volume image sections)
//! ```
//!
//! Problems in the input are attached to the node they concern as diagnostics; only input too
//! small to be an image at all fails [`Parser::parse`].
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
mod file;
mod image;
mod me;
mod nvram;
mod section;
mod vendor;
mod volume;

pub use nvram::{NvarDecoder, VssStoreDecoder};
pub use vendor::{MicrocodeDecoder, VendorDecoder};

pub(crate) use section::section_header;

use alloc::{string::String, vec, vec::Vec};
use r_efi::efi;

use crate::{
    config::ParseOptions,
    node::{DiagnosticKind, FirmwareImage, Node, NodeKind, ParsingData},
    pi,
    section::SectionExtractor,
    utils, FirmwareImageError,
};

/// Resolves GUIDs to display names.
pub trait GuidNameLookup {
    fn lookup(&self, guid: &efi::Guid) -> Option<&str>;
}

/// Lookup that knows no names; nodes are labelled with GUID text.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGuidNames;

impl GuidNameLookup for NoGuidNames {
    fn lookup(&self, _guid: &efi::Guid) -> Option<&str> {
        None
    }
}

static NO_GUID_NAMES: NoGuidNames = NoGuidNames;
static MICROCODE_DECODER: MicrocodeDecoder = MicrocodeDecoder;
static NVAR_DECODER: NvarDecoder = NvarDecoder;
static VSS_STORE_DECODER: VssStoreDecoder = VssStoreDecoder;

/// State inherited from the enclosing structures while descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParseContext {
    /// Number of volumes and encapsulating sections above the current position.
    pub depth: usize,
    /// Erase polarity of the enclosing volume, if any.
    pub erase_polarity: Option<bool>,
    pub ffs_version: u8,
    pub volume_revision: u8,
}

impl Default for ParseContext {
    fn default() -> Self {
        Self { depth: 0, erase_polarity: None, ffs_version: 2, volume_revision: 2 }
    }
}

impl ParseContext {
    pub fn nested(self) -> Self {
        Self { depth: self.depth + 1, ..self }
    }

    /// Context used to decode the children of `node`.
    pub fn child_context(self, node: &Node) -> Self {
        match &node.parsing_data {
            ParsingData::Volume(data) => Self {
                depth: self.depth + 1,
                erase_polarity: Some(data.erase_polarity),
                ffs_version: data.ffs_version.unwrap_or(2),
                volume_revision: data.revision,
            },
            ParsingData::File(data) if is_raw_file_type(data.file_type) => self.nested(),
            ParsingData::Section(_) => self.nested(),
            _ => self,
        }
    }

    /// Context used to decode the children of the node at `path`.
    pub fn for_children_of(root: &Node, path: &[usize]) -> Result<Self, FirmwareImageError> {
        let mut context = Self::default().child_context(root);
        let mut node = root;
        for index in path {
            node = node.children.get(*index).ok_or(FirmwareImageError::NotFound)?;
            context = context.child_context(node);
        }
        Ok(context)
    }
}

pub(crate) fn is_raw_file_type(file_type: u8) -> bool {
    matches!(file_type, pi::ffs::file::r#type::RAW | pi::ffs::file::r#type::ALL)
}

/// Decodes firmware images.
///
/// The parser holds only configuration and collaborators, so one instance can parse any number
/// of images.
pub struct Parser<'a> {
    options: ParseOptions,
    extractor: &'a dyn SectionExtractor,
    names: &'a dyn GuidNameLookup,
    vendor_decoders: Vec<&'a dyn VendorDecoder>,
}

impl<'a> Parser<'a> {
    /// Creates a parser with default options, no GUID names and the microcode, NVAR and VSS
    /// store decoders.
    pub fn new(extractor: &'a dyn SectionExtractor) -> Self {
        Self {
            options: ParseOptions::default(),
            extractor,
            names: &NO_GUID_NAMES,
            vendor_decoders: vec![&MICROCODE_DECODER, &NVAR_DECODER, &VSS_STORE_DECODER],
        }
    }

    pub fn with_options(mut self, options: ParseOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_names(mut self, names: &'a dyn GuidNameLookup) -> Self {
        self.names = names;
        self
    }

    /// Adds a decoder for vendor structures found in padding and raw areas.
    pub fn with_vendor_decoder(mut self, decoder: &'a dyn VendorDecoder) -> Self {
        self.vendor_decoders.push(decoder);
        self
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Display name for a GUID: the looked up name, or the GUID text.
    pub(crate) fn guid_name(&self, guid: &efi::Guid) -> String {
        match self.names.lookup(guid) {
            Some(name) => String::from(name),
            None => utils::guid_to_string(guid),
        }
    }

    /// Node standing in for a branch nested deeper than `max_depth`.
    pub(crate) fn too_deep(&self, bytes: &[u8], context: ParseContext) -> Option<Node> {
        if context.depth <= self.options.max_depth {
            return None;
        }
        let mut node = Node::leaf(NodeKind::Raw, bytes, 0);
        node.add_diagnostic(
            DiagnosticKind::RecursionLimitExceeded,
            alloc::format!("nesting depth {} exceeds the limit of {}", context.depth, self.options.max_depth),
        );
        Some(node)
    }

    /// Decodes `bytes` into a tree.
    ///
    /// The root is a capsule, an Intel flash image, a bare volume when the input is exactly one
    /// volume, or otherwise a BIOS image whose children are the volumes and padding found in it.
    pub fn parse(&self, bytes: &[u8]) -> Result<FirmwareImage, FirmwareImageError> {
        if bytes.len() < pi::fv::HEADER_SIZE {
            log::error!("image of {} bytes is too small to decode", bytes.len());
            Err(FirmwareImageError::InvalidParameter)?;
        }
        let root = self.parse_root(bytes, ParseContext::default())?;
        Ok(FirmwareImage::new(root))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    //! Image builders shared by the parser, search and build tests.
    use super::*;

    pub(crate) use super::image::tests::intel_image;
    pub(crate) use super::nvram::tests::{nvar_entry_bytes, vss_store, vss_variable_bytes};
    use crate::{
        pi::ffs::{file, section as sec},
        section::SectionMetaData,
    };
    use alloc::vec;

    pub const FILE_GUID: efi::Guid =
        efi::Guid::from_fields(0x11111111, 0x2222, 0x3333, 0x44, 0x55, &[0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB]);
    pub const OTHER_FILE_GUID: efi::Guid =
        efi::Guid::from_fields(0xDEADBEEF, 0x0001, 0x0002, 0x03, 0x04, &[0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]);

    /// Codec that knows no encodings.
    pub struct NoCodecs;

    impl SectionExtractor for NoCodecs {
        fn extract(&self, _metadata: &SectionMetaData, _content: &[u8]) -> Result<Vec<u8>, FirmwareImageError> {
            Err(FirmwareImageError::UnsupportedEncoding)
        }
    }

    impl crate::section::SectionComposer for NoCodecs {
        fn compose(
            &self,
            _metadata: &SectionMetaData,
            _payload: &[u8],
        ) -> Result<(SectionMetaData, Vec<u8>), FirmwareImageError> {
            Err(FirmwareImageError::UnsupportedEncoding)
        }
    }

    pub fn section(section_type: u8, body: &[u8]) -> Vec<u8> {
        let mut bytes = utils::encode_size3((4 + body.len()) as u32).unwrap().to_vec();
        bytes.push(section_type);
        bytes.extend_from_slice(body);
        bytes
    }

    pub fn guid_defined_section(guid: &efi::Guid, attributes: u16, guid_specific: &[u8], data: &[u8]) -> Vec<u8> {
        let data_offset = 4 + 20 + guid_specific.len();
        let mut bytes = utils::encode_size3((data_offset + data.len()) as u32).unwrap().to_vec();
        bytes.push(sec::r#type::GUID_DEFINED);
        bytes.extend_from_slice(guid.as_bytes());
        bytes.extend_from_slice(&(data_offset as u16).to_le_bytes());
        bytes.extend_from_slice(&attributes.to_le_bytes());
        bytes.extend_from_slice(guid_specific);
        bytes.extend_from_slice(data);
        bytes
    }

    /// Concatenates sections with 4-byte alignment.
    pub fn section_stream(sections: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for section in sections {
            while bytes.len() % 4 != 0 {
                bytes.push(0);
            }
            bytes.extend_from_slice(section);
        }
        bytes
    }

    /// A file with valid checksums in a revision 2 volume with erase polarity 1.
    pub fn ffs_file(name: &efi::Guid, file_type: u8, attributes: u8, body: &[u8]) -> Vec<u8> {
        let size = file::HEADER_SIZE + body.len();
        let mut bytes = vec![0u8; file::HEADER_SIZE];
        bytes[..16].copy_from_slice(name.as_bytes());
        bytes[18] = file_type;
        bytes[19] = attributes;
        bytes[20..23].copy_from_slice(&utils::encode_size3(size as u32).unwrap());
        bytes[16] = utils::checksum8(&bytes);
        bytes[17] = if attributes & file::attributes::CHECKSUM != 0 {
            utils::checksum8(body)
        } else {
            file::FIXED_CHECKSUM
        };
        // HEADER_CONSTRUCTION | HEADER_VALID | DATA_VALID, inverted for erase polarity 1.
        bytes[23] = 0xF8;
        bytes.extend_from_slice(body);
        bytes
    }

    /// A revision 2 FFS2 volume with erase polarity 1, 72-byte header and one block map entry.
    pub fn volume(files: &[Vec<u8>], fv_length: usize) -> Vec<u8> {
        volume_with_guid(&pi::guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, files, fv_length)
    }

    pub fn volume_with_guid(fs_guid: &efi::Guid, files: &[Vec<u8>], fv_length: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; 72];
        bytes[16..32].copy_from_slice(fs_guid.as_bytes());
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

    /// Volume → File(Raw) → Section(Raw, 8 bytes), the file declaring 36 bytes: an 8-byte
    /// section followed by 4 bytes of zero padding.
    pub fn single_raw_file_volume(fv_length: usize) -> Vec<u8> {
        let mut body = section(sec::r#type::RAW, &[0xA5, 0x5A, 0xC3, 0x3C]);
        body.extend_from_slice(&[0; 4]);
        volume(&[ffs_file(&FILE_GUID, file::r#type::RAW, 0, &body)], fv_length)
    }

    #[test]
    fn tiny_input_is_rejected() {
        let parser = Parser::new(&NoCodecs);
        assert_eq!(parser.parse(&[0xFF; 16]), Err(FirmwareImageError::InvalidParameter));
    }

    #[test]
    fn context_follows_volumes_and_encapsulations() {
        let parser = Parser::new(&NoCodecs);
        let bytes = single_raw_file_volume(0x100);
        let image = parser.parse(&bytes).unwrap();

        let root_children = ParseContext::for_children_of(&image.root, &[]).unwrap();
        assert_eq!(root_children.depth, 1);
        assert_eq!(root_children.erase_polarity, Some(true));
        // Raw file bodies are scanned like BIOS space, one level down.
        let file_children = ParseContext::for_children_of(&image.root, &[0]).unwrap();
        assert_eq!(file_children.depth, 2);
        assert_eq!(ParseContext::for_children_of(&image.root, &[9]), Err(FirmwareImageError::NotFound));
    }

    #[test]
    fn depth_guard_produces_a_raw_node() {
        let parser = Parser::new(&NoCodecs).with_options(ParseOptions { max_depth: 1, ..Default::default() });
        let context = ParseContext { depth: 2, ..Default::default() };
        let node = parser.too_deep(&[1, 2, 3], context).unwrap();
        assert_eq!(node.kind, NodeKind::Raw);
        assert!(node.has_diagnostic(DiagnosticKind::RecursionLimitExceeded));
        assert!(parser.too_deep(&[1], ParseContext::default()).is_none());
    }
}
