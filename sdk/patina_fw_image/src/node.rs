//! The firmware image tree.
//!
//! Every structural element of an image (capsule, region, volume, file, section, padding) is a
//! [`Node`] owning three disjoint byte ranges (header, body, tail) and its children in disk order.
//! Nodes do not point back to their parents; a node is addressed from the root with a
//! [`NodePath`].
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{string::String, vec::Vec};
use core::fmt;
use r_efi::efi;

use crate::{
    pi::{self, ffs::file::state},
    section::SectionMetaData,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsuleType {
    Efi,
    Fmp,
    Intel,
    Lenovo,
    Lenovo2,
    Toshiba,
    AptioSigned,
    AptioUnsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// Flash image starting with an Intel flash descriptor.
    Intel,
    /// Anything else, scanned for volumes.
    Bios,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Descriptor,
    Gbe,
    Me,
    Bios,
    Pdr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingType {
    Zero,
    One,
    Data,
}

impl PaddingType {
    pub fn classify(bytes: &[u8]) -> Self {
        if bytes.iter().all(|b| *b == 0x00) {
            PaddingType::Zero
        } else if bytes.iter().all(|b| *b == 0xFF) {
            PaddingType::One
        } else {
            PaddingType::Data
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeType {
    Ffs2,
    Ffs3,
    /// NVRAM volume holding variable stores instead of files.
    Nvram,
    /// Unknown file system; the body is kept opaque.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvramType {
    /// `$VSS` variable store, or one of its Apple variants.
    VssStore,
    VssVariable,
    /// AMI NVAR entry.
    NvarEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeType {
    /// `$FPT` header followed by its entries.
    PartitionTable,
    Partition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Capsule(CapsuleType),
    Image(ImageType),
    Region(RegionType),
    Padding(PaddingType),
    Volume(VolumeType),
    /// FFS file, carrying the file type byte.
    File(u8),
    /// Section, carrying the section type byte.
    Section(u8),
    FreeSpace,
    Microcode,
    Nvram(NvramType),
    Me(MeType),
    /// Opaque bytes, e.g. the remainder of a branch that could not be decoded.
    Raw,
}

impl NodeKind {
    pub fn is_volume(&self) -> bool {
        matches!(self, NodeKind::Volume(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::File(_))
    }

    pub fn is_section(&self) -> bool {
        matches!(self, NodeKind::Section(_))
    }

    /// Structures claimed from padding and raw areas by a vendor decoder.
    pub fn is_vendor(&self) -> bool {
        matches!(self, NodeKind::Microcode | NodeKind::Nvram(_))
    }
}

/// Lifecycle of an FFS file, taken from the highest set bit of the polarity corrected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Unset,
    HeaderConstruction,
    HeaderValid,
    DataValid,
    MarkedForUpdate,
    Deleted,
    HeaderInvalid,
}

impl FileState {
    pub fn from_state(raw_state: u8, erase_polarity: bool) -> Self {
        let corrected = (if erase_polarity { !raw_state } else { raw_state }) & !state::ERASE_POLARITY;
        match corrected {
            0 => FileState::Unset,
            s if s & state::HEADER_INVALID != 0 => FileState::HeaderInvalid,
            s if s & state::DELETED != 0 => FileState::Deleted,
            s if s & state::MARKED_FOR_UPDATE != 0 => FileState::MarkedForUpdate,
            s if s & state::DATA_VALID != 0 => FileState::DataValid,
            s if s & state::HEADER_VALID != 0 => FileState::HeaderValid,
            _ => FileState::HeaderConstruction,
        }
    }

    /// Deleted or invalidated files are kept in the tree but are not live content.
    pub fn is_live(&self) -> bool {
        !matches!(self, FileState::Deleted | FileState::HeaderInvalid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeData {
    pub file_system_guid: efi::Guid,
    pub attributes: u32,
    pub revision: u8,
    pub erase_polarity: bool,
    /// 2 or 3 for FFS volumes, `None` for unknown file systems.
    pub ffs_version: Option<u8>,
    pub block_map: Vec<pi::fv::BlockMapEntry>,
    pub ext_header: Option<pi::fv::ExtHeader>,
    pub header_length: usize,
    pub fv_length: u64,
}

impl VolumeData {
    /// Required alignment of the volume in its container, from the attributes.
    pub fn alignment(&self) -> usize {
        use pi::fv::attributes;
        if self.revision > 1 {
            1usize << ((self.attributes & attributes::ALIGNMENT) >> attributes::ALIGNMENT_SHIFT)
        } else {
            // Revision 1 sets one bit per supported alignment; the highest one is required.
            let bits = (self.attributes >> attributes::ALIGNMENT_SHIFT) & 0xFFFF;
            if self.attributes & attributes::ALIGNMENT_CAP == 0 || bits == 0 {
                1
            } else {
                1usize << (32 - bits.leading_zeros() as usize)
            }
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_map.first().map(|entry| entry.length as usize).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub name: efi::Guid,
    pub file_type: u8,
    pub attributes: u8,
    pub state: u8,
    pub lifecycle: FileState,
    /// 32-byte header with a 64-bit size.
    pub large: bool,
    /// Revision 1 volumes only.
    pub has_tail: bool,
    pub erase_polarity: bool,
    pub volume_revision: u8,
    pub ffs_version: u8,
}

impl FileData {
    pub fn data_alignment(&self) -> usize {
        use pi::ffs::file::{attributes, ALIGNMENT2_TABLE, ALIGNMENT_TABLE};
        let index = ((self.attributes & attributes::DATA_ALIGNMENT) >> 3) as usize;
        if self.ffs_version >= 3 && self.attributes & attributes::DATA_ALIGNMENT_2 != 0 {
            1usize << ALIGNMENT2_TABLE[index]
        } else {
            1usize << ALIGNMENT_TABLE[index]
        }
    }

    pub fn has_checksum(&self) -> bool {
        self.attributes & pi::ffs::file::attributes::CHECKSUM != 0
    }

    /// Data checksum byte of a file without [`has_checksum`](Self::has_checksum).
    pub fn fixed_checksum(&self) -> u8 {
        if self.volume_revision == 1 {
            pi::ffs::file::FIXED_CHECKSUM_REVISION1
        } else {
            pi::ffs::file::FIXED_CHECKSUM
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionData {
    pub metadata: SectionMetaData,
    /// 8-byte header with a 32-bit size.
    pub extended: bool,
    /// Decoded payload of an encapsulation. Children offsets are relative to it when present,
    /// otherwise to the body.
    pub decoded: Option<Vec<u8>>,
}

/// Variable metadata shared by NVAR entries and VSS variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvramData {
    /// `None` for invalid entries and for NVAR data-only links.
    pub vendor_guid: Option<efi::Guid>,
    pub attributes: u32,
    /// Entries marked deleted or invalid are kept in the tree but are not live.
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsingData {
    None,
    Capsule { header_size: usize },
    Region { offset: usize, size: usize },
    Volume(VolumeData),
    File(FileData),
    Section(SectionData),
    Microcode(pi::microcode::Header),
    Nvram(NvramData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    MalformedHeader,
    ChecksumMismatch,
    UnsupportedEncoding,
    RecursionLimitExceeded,
    /// Misaligned data, duplicated GUIDs, non-empty gaps and similar layout problems.
    InconsistentLayout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        let message = message.into();
        log::warn!("{:?}: {}", kind, message);
        Self { kind, message }
    }
}

/// Child indices from the root; the empty path is the root itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NodePath(pub Vec<usize>);

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, parent) = self.0.split_last()?;
        Some(Self(parent.to_vec()))
    }

    pub fn last(&self) -> Option<usize> {
        self.0.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[usize]> for NodePath {
    fn from(value: &[usize]) -> Self {
        Self(value.to_vec())
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/")?;
        for (i, index) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{index}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub name: Option<String>,
    pub text: Option<String>,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
    pub tail: Vec<u8>,
    /// Offset from the start of the parent's body, or of its decoded payload.
    pub offset: usize,
    pub parsing_data: ParsingData,
    pub children: Vec<Node>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Node {
    pub fn new(kind: NodeKind, header: Vec<u8>, body: Vec<u8>, tail: Vec<u8>, offset: usize) -> Self {
        Self {
            kind,
            name: None,
            text: None,
            header,
            body,
            tail,
            offset,
            parsing_data: ParsingData::None,
            children: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// A headerless node covering `bytes`.
    pub fn leaf(kind: NodeKind, bytes: &[u8], offset: usize) -> Self {
        Self::new(kind, Vec::new(), bytes.to_vec(), Vec::new(), offset)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parsing_data(mut self, parsing_data: ParsingData) -> Self {
        self.parsing_data = parsing_data;
        self
    }

    pub fn total_len(&self) -> usize {
        self.header.len() + self.body.len() + self.tail.len()
    }

    /// Header, body and tail as stored on disk.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.total_len());
        bytes.extend_from_slice(&self.header);
        bytes.extend_from_slice(&self.body);
        bytes.extend_from_slice(&self.tail);
        bytes
    }

    /// Bytes the children were decoded from.
    pub fn payload(&self) -> &[u8] {
        match &self.parsing_data {
            ParsingData::Section(SectionData { decoded: Some(decoded), .. }) => decoded,
            _ => &self.body,
        }
    }

    /// True when the children live in a decoded payload rather than in the body.
    pub fn is_decoded(&self) -> bool {
        matches!(&self.parsing_data, ParsingData::Section(SectionData { decoded: Some(_), .. }))
    }

    pub fn add_diagnostic(&mut self, kind: DiagnosticKind, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(kind, message));
    }

    pub fn has_diagnostic(&self, kind: DiagnosticKind) -> bool {
        self.diagnostics.iter().any(|diagnostic| diagnostic.kind == kind)
    }

    pub fn file_data(&self) -> Option<&FileData> {
        match &self.parsing_data {
            ParsingData::File(data) => Some(data),
            _ => None,
        }
    }

    pub fn volume_data(&self) -> Option<&VolumeData> {
        match &self.parsing_data {
            ParsingData::Volume(data) => Some(data),
            _ => None,
        }
    }

    pub fn section_data(&self) -> Option<&SectionData> {
        match &self.parsing_data {
            ParsingData::Section(data) => Some(data),
            _ => None,
        }
    }

    /// The identifying GUID of the node: file name, volume file system, section definition or variable vendor.
    pub fn guid(&self) -> Option<efi::Guid> {
        match &self.parsing_data {
            ParsingData::File(data) => Some(data.name),
            ParsingData::Volume(data) => Some(data.file_system_guid),
            ParsingData::Nvram(data) => data.vendor_guid,
            ParsingData::Section(data) => match &data.metadata {
                SectionMetaData::FreeformSubtypeGuid(guid) => Some(*guid),
                metadata => metadata.definition_guid(),
            },
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        match &self.parsing_data {
            ParsingData::File(data) => data.lifecycle.is_live(),
            ParsingData::Nvram(data) => data.valid,
            _ => true,
        }
    }

    pub fn get(&self, path: &[usize]) -> Option<&Node> {
        match path.split_first() {
            None => Some(self),
            Some((index, rest)) => self.children.get(*index)?.get(rest),
        }
    }

    pub fn get_mut(&mut self, path: &[usize]) -> Option<&mut Node> {
        match path.split_first() {
            None => Some(self),
            Some((index, rest)) => self.children.get_mut(*index)?.get_mut(rest),
        }
    }

    /// Visits the subtree in pre-order.
    pub fn walk<'a>(&'a self, path: &mut Vec<usize>, visit: &mut dyn FnMut(&[usize], &'a Node)) {
        visit(path, self);
        for (index, child) in self.children.iter().enumerate() {
            path.push(index);
            child.walk(path, visit);
            path.pop();
        }
    }
}

/// A decoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub root: Node,
}

impl FirmwareImage {
    pub fn new(root: Node) -> Self {
        Self { root }
    }

    pub fn node(&self, path: &NodePath) -> Option<&Node> {
        self.root.get(&path.0)
    }

    /// Every diagnostic in the tree with the path of the node carrying it, in pre-order.
    pub fn diagnostics(&self) -> Vec<(NodePath, DiagnosticKind, String)> {
        let mut diagnostics = Vec::new();
        self.root.walk(&mut Vec::new(), &mut |path, node| {
            for diagnostic in &node.diagnostics {
                diagnostics.push((NodePath::from(path), diagnostic.kind, diagnostic.message.clone()));
            }
        });
        diagnostics
    }

    /// The bytes the image was parsed from, or the edited image after a build operation.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.root.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn sample_tree() -> Node {
        let mut root = Node::leaf(NodeKind::Image(ImageType::Bios), &[0u8; 8], 0);
        let mut volume = Node::new(NodeKind::Volume(VolumeType::Ffs2), vec![1, 2], vec![3], vec![], 0);
        volume.add_diagnostic(DiagnosticKind::ChecksumMismatch, "volume header checksum");
        let mut file = Node::new(NodeKind::File(1), vec![4], vec![5, 6], vec![7], 0);
        file.add_diagnostic(DiagnosticKind::InconsistentLayout, "unaligned data");
        volume.children.push(file);
        root.children.push(Node::leaf(NodeKind::Padding(PaddingType::One), &[0xFF], 0));
        root.children.push(volume);
        root
    }

    #[test]
    fn file_state_uses_the_highest_corrected_bit() {
        assert_eq!(FileState::from_state(0xF8, true), FileState::DataValid);
        assert_eq!(FileState::from_state(0x07, false), FileState::DataValid);
        assert_eq!(FileState::from_state(0xE8, true), FileState::Deleted);
        assert_eq!(FileState::from_state(0x0F, false), FileState::MarkedForUpdate);
        assert_eq!(FileState::from_state(0xFF, true), FileState::Unset);
        assert!(!FileState::from_state(0x17, false).is_live());
    }

    #[test]
    fn diagnostics_are_flattened_with_their_paths() {
        let image = FirmwareImage::new(sample_tree());
        let diagnostics = image.diagnostics();
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].0, NodePath(vec![1]));
        assert_eq!(diagnostics[0].1, DiagnosticKind::ChecksumMismatch);
        assert_eq!(diagnostics[1].0, NodePath(vec![1, 0]));
        assert_eq!(image.node(&NodePath(vec![1, 0])).unwrap().to_bytes(), [4, 5, 6, 7]);
        assert!(image.node(&NodePath(vec![3])).is_none());
    }

    #[test]
    fn paths_navigate() {
        let path = NodePath::root().child(1).child(0);
        assert_eq!(path.parent(), Some(NodePath(vec![1])));
        assert_eq!(path.last(), Some(0));
        assert_eq!(alloc::format!("{path}"), "/1/0");
        assert!(NodePath::root().parent().is_none());
    }

    #[test]
    fn volume_alignment_from_attributes() {
        let mut data = VolumeData {
            file_system_guid: pi::guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID,
            attributes: 0x0004_0800,
            revision: 2,
            erase_polarity: true,
            ffs_version: Some(2),
            block_map: vec![],
            ext_header: None,
            header_length: 72,
            fv_length: 0x1000,
        };
        assert_eq!(data.alignment(), 16);
        data.revision = 1;
        data.attributes = pi::fv::attributes::ALIGNMENT_CAP | 0x0008_0000;
        assert_eq!(data.alignment(), 16);
        data.attributes = 0;
        assert_eq!(data.alignment(), 1);
    }
}
