//! Editing operations on a decoded image: extract, insert, replace and remove.
//!
//! Every operation works on a copy of the tree and only swaps it into the [`FirmwareImage`] once
//! the edited node and all of its ancestors have been reconstructed. A failed operation leaves the
//! image exactly as it was.
//!
//! Reconstruction runs bottom-up along the edited path:
//!
//! - sections re-encode their payload through the [`SectionComposer`] and rewrite their size;
//! - files recompute sizes, checksums and the revision 1 tail;
//! - volumes lay their files out again, regenerate pad files for aligned data and free space,
//!   keep the volume top file at the end and fix the header checksum;
//! - capsules patch their image size, while Intel regions must keep their length.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{vec, vec::Vec};
use scroll::{Pread, Pwrite, LE};

use crate::{
    config::{BuildPolicy, SizeOverflowPolicy, VolumeGrowthPolicy},
    node::{
        CapsuleType, DiagnosticKind, FileData, FileState, FirmwareImage, ImageType, Node, NodeKind, NodePath,
        PaddingType, ParsingData, SectionData, VolumeData, VolumeType,
    },
    parser::{is_raw_file_type, section_header, ParseContext, Parser},
    pi::{
        capsule,
        ffs::{
            file,
            section::{self, compression},
        },
        fv, guid,
    },
    section::{SectionComposer, SectionMetaData},
    utils, FirmwareImageError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Header, body and tail as stored.
    AsIs,
    /// The body without header and tail.
    BodyOnly,
    /// The decoded payload of an encapsulation, the body otherwise.
    BodyUncompressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// As a child of the target.
    Into,
    /// As the sibling preceding the target.
    Before,
    /// As the sibling following the target.
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// The blob is a complete object of the same category as the target.
    AsIs,
    /// The blob replaces the body; the header is regenerated.
    BodyOnly,
}

/// Applies edits to decoded images.
///
/// The builder reuses the parser (and its extractor) to decode inserted and replaced blobs, so
/// new subtrees look exactly as if they had been parsed from the image.
pub struct Builder<'a> {
    parser: &'a Parser<'a>,
    composer: &'a dyn SectionComposer,
    policy: BuildPolicy,
}

impl<'a> Builder<'a> {
    pub fn new(parser: &'a Parser<'a>, composer: &'a dyn SectionComposer) -> Self {
        Self { parser, composer, policy: BuildPolicy::default() }
    }

    pub fn with_policy(mut self, policy: BuildPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &BuildPolicy {
        &self.policy
    }

    /// Copies the bytes of a node out of the image.
    pub fn extract(
        &self,
        image: &FirmwareImage,
        path: &NodePath,
        mode: ExtractMode,
    ) -> Result<Vec<u8>, FirmwareImageError> {
        let node = image.node(path).ok_or(FirmwareImageError::NotFound)?;
        match mode {
            ExtractMode::AsIs => Ok(node.to_bytes()),
            ExtractMode::BodyOnly => Ok(node.body.clone()),
            ExtractMode::BodyUncompressed => {
                if let Some(data) = node.section_data() {
                    if data.decoded.is_none() && is_opaque_encoding(&data.metadata) {
                        log::error!("section at {} is encoded and could not be decoded", path);
                        Err(FirmwareImageError::UnsupportedEncoding)?;
                    }
                }
                Ok(node.payload().to_vec())
            }
        }
    }

    /// Decodes `bytes` and inserts the result relative to the node at `path`.
    ///
    /// Returns the path of the first inserted node.
    pub fn insert(
        &self,
        image: &mut FirmwareImage,
        path: &NodePath,
        bytes: &[u8],
        mode: InsertMode,
    ) -> Result<NodePath, FirmwareImageError> {
        self.insert_node(image, path, bytes, mode)
            .inspect_err(|err| log::error!("insert {:?} {} failed: {:?}", mode, path, err))
    }

    /// Replaces the node at `path` with `bytes`.
    pub fn replace(
        &self,
        image: &mut FirmwareImage,
        path: &NodePath,
        bytes: &[u8],
        mode: ReplaceMode,
    ) -> Result<(), FirmwareImageError> {
        self.replace_node(image, path, bytes, mode)
            .inspect_err(|err| log::error!("replace {:?} {} failed: {:?}", mode, path, err))
    }

    /// Removes the node at `path`. The space it occupied becomes free space in a volume.
    pub fn remove(&self, image: &mut FirmwareImage, path: &NodePath) -> Result<(), FirmwareImageError> {
        self.remove_node(image, path).inspect_err(|err| log::error!("remove {} failed: {:?}", path, err))
    }

    /// Serialized bytes of the node at `path`.
    ///
    /// Edits keep every node on the edited path reconstructed, so this is the stored header, body
    /// and tail. An unmodified image rebuilds to the bytes it was parsed from.
    pub fn rebuild(&self, image: &FirmwareImage, path: &NodePath) -> Result<Vec<u8>, FirmwareImageError> {
        image.node(path).map(Node::to_bytes).ok_or(FirmwareImageError::NotFound)
    }

    /// Reconstructs the subtree at `path` and its ancestors after the tree was edited directly.
    pub fn reconstruct_at(&self, image: &mut FirmwareImage, path: &NodePath) -> Result<(), FirmwareImageError> {
        let mut root = image.root.clone();
        let node = root.get_mut(&path.0).ok_or(FirmwareImageError::NotFound)?;
        self.reconstruct_subtree(node)?;
        if let Some(parent) = path.parent() {
            self.reconstruct_path(&mut root, &parent.0)?;
        }
        image.root = root;
        Ok(())
    }

    /// Replaces the payload of the section at `path`, the decoded payload for encapsulations.
    pub(crate) fn replace_payload(
        &self,
        image: &mut FirmwareImage,
        path: &NodePath,
        payload: Vec<u8>,
    ) -> Result<(), FirmwareImageError> {
        let mut root = image.root.clone();
        check_mutable(&root, &path.0)?;
        let context = self.context_of(&root, path)?;
        let node = root.get_mut(&path.0).ok_or(FirmwareImageError::NotFound)?;
        if !node.kind.is_section() {
            Err(FirmwareImageError::IncompatibleKind)?;
        }

        if node.is_decoded() {
            let mut diagnostics = Vec::new();
            node.children = self.parser.decode_sections(&payload, context.child_context(node), &mut diagnostics);
            if let ParsingData::Section(data) = &mut node.parsing_data {
                data.decoded = Some(payload);
            }
            node.diagnostics.retain(|diagnostic| diagnostic.kind != DiagnosticKind::InconsistentLayout);
            node.diagnostics.extend(diagnostics);
            // Children laid out again would drop trailing fill, so encode the payload as given.
            let children = core::mem::take(&mut node.children);
            self.reconstruct_section(node)?;
            node.children = children;
        } else {
            self.replace_body(node, &payload, context)?;
        }

        if let Some(parent) = path.parent() {
            self.reconstruct_path(&mut root, &parent.0)?;
        }
        image.root = root;
        Ok(())
    }

    fn insert_node(
        &self,
        image: &mut FirmwareImage,
        path: &NodePath,
        bytes: &[u8],
        mode: InsertMode,
    ) -> Result<NodePath, FirmwareImageError> {
        if bytes.is_empty() {
            Err(FirmwareImageError::InvalidParameter)?;
        }
        let target = image.node(path).ok_or(FirmwareImageError::NotFound)?;
        let (parent_path, index) = match mode {
            InsertMode::Into => (path.clone(), insertion_index(target)),
            InsertMode::Before | InsertMode::After => {
                if is_fixed(target.kind) {
                    Err(FirmwareImageError::FrozenRegion)?;
                }
                let parent_path = path.parent().ok_or(FirmwareImageError::InvalidParameter)?;
                let last = path.last().ok_or(FirmwareImageError::InvalidParameter)?;
                (parent_path, if mode == InsertMode::After { last + 1 } else { last })
            }
        };

        let mut root = image.root.clone();
        let context = ParseContext::for_children_of(&root, &parent_path.0)?;
        let parent = root.get_mut(&parent_path.0).ok_or(FirmwareImageError::NotFound)?;
        if is_frozen_container(parent) {
            Err(FirmwareImageError::FrozenRegion)?;
        }
        let nodes = self.decode_for(parent, bytes, context)?;
        let first = nodes.first().cloned().ok_or(FirmwareImageError::IncompatibleKind)?;
        parent.children.splice(index..index, nodes);

        self.reconstruct_path(&mut root, &parent_path.0)?;

        let parent = root.get(&parent_path.0).ok_or(FirmwareImageError::NotFound)?;
        let position = locate(&parent.children, &first, index).ok_or(FirmwareImageError::NotFound)?;
        log::info!("inserted {:?} at {}", first.kind, parent_path.child(position));
        image.root = root;
        Ok(parent_path.child(position))
    }

    fn replace_node(
        &self,
        image: &mut FirmwareImage,
        path: &NodePath,
        bytes: &[u8],
        mode: ReplaceMode,
    ) -> Result<(), FirmwareImageError> {
        let mut root = image.root.clone();
        check_mutable(&root, &path.0)?;
        let context = self.context_of(&root, path)?;
        let target = root.get_mut(&path.0).ok_or(FirmwareImageError::NotFound)?;
        match mode {
            ReplaceMode::AsIs => {
                let mut replacement = self.decode_same_kind(target.kind, bytes, context)?;
                replacement.offset = target.offset;
                *target = replacement;
            }
            ReplaceMode::BodyOnly => self.replace_body(target, bytes, context)?,
        }

        if let Some(parent) = path.parent() {
            self.reconstruct_path(&mut root, &parent.0)?;
        }
        image.root = root;
        Ok(())
    }

    fn remove_node(&self, image: &mut FirmwareImage, path: &NodePath) -> Result<(), FirmwareImageError> {
        let parent_path = path.parent().ok_or(FirmwareImageError::InvalidParameter)?;
        let index = path.last().ok_or(FirmwareImageError::InvalidParameter)?;
        let mut root = image.root.clone();
        check_mutable(&root, &path.0)?;

        let parent = root.get_mut(&parent_path.0).ok_or(FirmwareImageError::NotFound)?;
        if matches!(parent.kind, NodeKind::Capsule(_)) {
            Err(FirmwareImageError::IncompatibleKind)?;
        }
        if index >= parent.children.len() {
            Err(FirmwareImageError::NotFound)?;
        }
        let removed = parent.children.remove(index);
        log::info!("removed {:?} at {}", removed.kind, path);

        self.reconstruct_path(&mut root, &parent_path.0)?;
        image.root = root;
        Ok(())
    }

    /// Context the node at `path` was decoded with.
    fn context_of(&self, root: &Node, path: &NodePath) -> Result<ParseContext, FirmwareImageError> {
        match path.parent() {
            Some(parent) => ParseContext::for_children_of(root, &parent.0),
            None => Ok(ParseContext::default()),
        }
    }

    /// Decodes an inserted blob as children of `parent`.
    fn decode_for(&self, parent: &Node, bytes: &[u8], context: ParseContext) -> Result<Vec<Node>, FirmwareImageError> {
        match parent.kind {
            NodeKind::Volume(VolumeType::Unknown | VolumeType::Nvram) => Err(FirmwareImageError::IncompatibleKind),
            NodeKind::Volume(_) => self.decode_files(bytes, context).map_err(|err| self.misplaced(bytes, context, err)),
            NodeKind::File(file::r#type::PAD) => Err(FirmwareImageError::IncompatibleKind),
            NodeKind::File(file_type) if is_raw_file_type(file_type) => self
                .decode_volume(bytes, context)
                .map(|volume| vec![volume])
                .or_else(|_| self.decode_stream(bytes, context))
                .map_err(|err| self.misplaced(bytes, context, err)),
            NodeKind::File(_) => {
                self.reject_misplaced_file(bytes, context)?;
                self.decode_stream(bytes, context)
            }
            NodeKind::Section(
                section::r#type::DISPOSABLE | section::r#type::COMPRESSION | section::r#type::GUID_DEFINED,
            ) => {
                if let Some(data) = parent.section_data() {
                    if data.decoded.is_none() && is_opaque_encoding(&data.metadata) {
                        Err(FirmwareImageError::UnsupportedEncoding)?;
                    }
                }
                self.reject_misplaced_file(bytes, context)?;
                self.decode_stream(bytes, context)
            }
            NodeKind::Section(section::r#type::FIRMWARE_VOLUME_IMAGE | section::r#type::RAW)
            | NodeKind::Image(ImageType::Bios) => self
                .decode_volume(bytes, context)
                .map(|volume| vec![volume])
                .map_err(|err| self.misplaced(bytes, context, err)),
            _ => Err(FirmwareImageError::IncompatibleKind),
        }
    }

    /// A sequence of 8-byte aligned files covering `bytes`.
    fn decode_files(&self, bytes: &[u8], context: ParseContext) -> Result<Vec<Node>, FirmwareImageError> {
        let mut files = Vec::new();
        let mut position = 0;
        while position < bytes.len() {
            let file = self.parser.parse_file(&bytes[position..], position, context)?;
            if file.has_diagnostic(DiagnosticKind::ChecksumMismatch) {
                Err(FirmwareImageError::ChecksumMismatch)?;
            }
            position = utils::align_up(position + file.total_len(), 8)?;
            files.push(file);
        }
        Ok(files)
    }

    /// A volume covering exactly `bytes`.
    fn decode_volume(&self, bytes: &[u8], context: ParseContext) -> Result<Node, FirmwareImageError> {
        let volume = self.parser.parse_volume(bytes, context)?;
        if volume.total_len() != bytes.len() {
            Err(FirmwareImageError::MalformedHeader)?;
        }
        Ok(volume)
    }

    /// A section stream that decodes without any problem.
    fn decode_stream(&self, bytes: &[u8], context: ParseContext) -> Result<Vec<Node>, FirmwareImageError> {
        let mut diagnostics = Vec::new();
        let sections = self.parser.decode_sections(bytes, context, &mut diagnostics);
        if sections.is_empty() || !diagnostics.is_empty() || sections.iter().any(|node| node.kind == NodeKind::Raw) {
            Err(FirmwareImageError::MalformedHeader)?;
        }
        Ok(sections)
    }

    fn reject_misplaced_file(&self, bytes: &[u8], context: ParseContext) -> Result<(), FirmwareImageError> {
        if self.is_exact_file(bytes, context) || self.decode_volume(bytes, context).is_ok() {
            Err(FirmwareImageError::IncompatibleKind)?;
        }
        Ok(())
    }

    fn is_exact_file(&self, bytes: &[u8], context: ParseContext) -> bool {
        self.parser.parse_file(bytes, 0, context).is_ok_and(|file| {
            file.total_len() == bytes.len() && !file.has_diagnostic(DiagnosticKind::ChecksumMismatch)
        })
    }

    /// Maps a decode failure to `IncompatibleKind` when the blob is a valid object of another kind.
    fn misplaced(&self, bytes: &[u8], context: ParseContext, err: FirmwareImageError) -> FirmwareImageError {
        let exact_section = section_header(bytes).is_ok_and(|(_, _, _, size)| size == bytes.len());
        if exact_section || self.is_exact_file(bytes, context) || self.decode_volume(bytes, context).is_ok() {
            FirmwareImageError::IncompatibleKind
        } else {
            err
        }
    }

    fn decode_same_kind(
        &self,
        kind: NodeKind,
        bytes: &[u8],
        context: ParseContext,
    ) -> Result<Node, FirmwareImageError> {
        let node = match kind {
            NodeKind::Volume(_) => self.decode_volume(bytes, context).ok(),
            NodeKind::File(_) => {
                self.parser.parse_file(bytes, 0, context).ok().filter(|file| file.total_len() == bytes.len())
            }
            NodeKind::Section(_) => {
                self.parser.decode_section(bytes, 0, context).ok().filter(|section| section.total_len() == bytes.len())
            }
            _ => None,
        };
        let node = node.ok_or(FirmwareImageError::IncompatibleKind)?;
        if node.has_diagnostic(DiagnosticKind::ChecksumMismatch) {
            log::error!("replacement {:?} fails its checksum", node.kind);
            Err(FirmwareImageError::ChecksumMismatch)?;
        }
        Ok(node)
    }

    fn replace_body(&self, node: &mut Node, bytes: &[u8], context: ParseContext) -> Result<(), FirmwareImageError> {
        match node.kind {
            NodeKind::Volume(_) => {
                if bytes.len() != node.body.len() {
                    Err(FirmwareImageError::SizeOverflow)?;
                }
                let mut volume_bytes = node.header.clone();
                volume_bytes.extend_from_slice(bytes);
                let mut volume = self.parser.parse_volume(&volume_bytes, context)?;
                volume.offset = node.offset;
                *node = volume;
            }
            NodeKind::File(_) => {
                node.body = bytes.to_vec();
                node.children.clear();
                node.diagnostics.clear();
                self.reconstruct_file(node)?;
                self.parser.parse_file_children(node, context)?;
                self.parser.propagate_ui_text(node);
            }
            NodeKind::Section(_) => {
                node.body = bytes.to_vec();
                node.children.clear();
                node.diagnostics.clear();
                node.text = None;
                if let ParsingData::Section(data) = &mut node.parsing_data {
                    data.decoded = None;
                }
                self.reconstruct_section(node)?;
                self.parser.decode_section_contents(node, context)?;
            }
            NodeKind::Padding(_) | NodeKind::FreeSpace | NodeKind::Microcode | NodeKind::Raw => {
                if bytes.len() != node.body.len() {
                    Err(FirmwareImageError::SizeOverflow)?;
                }
                if let NodeKind::Padding(_) = node.kind {
                    node.kind = NodeKind::Padding(PaddingType::classify(bytes));
                }
                node.body = bytes.to_vec();
            }
            _ => Err(FirmwareImageError::IncompatibleKind)?,
        }
        Ok(())
    }

    fn reconstruct_path(&self, node: &mut Node, path: &[usize]) -> Result<(), FirmwareImageError> {
        if let Some((index, rest)) = path.split_first() {
            let child = node.children.get_mut(*index).ok_or(FirmwareImageError::NotFound)?;
            self.reconstruct_path(child, rest)?;
        }
        self.reconstruct(node)
    }

    fn reconstruct_subtree(&self, node: &mut Node) -> Result<(), FirmwareImageError> {
        for child in node.children.iter_mut() {
            self.reconstruct_subtree(child)?;
        }
        self.reconstruct(node)
    }

    /// Recomputes the header, body and tail of `node` from its children.
    fn reconstruct(&self, node: &mut Node) -> Result<(), FirmwareImageError> {
        match node.kind {
            NodeKind::Section(_) => self.reconstruct_section(node),
            NodeKind::File(_) => self.reconstruct_file(node),
            NodeKind::Volume(_) => self.reconstruct_volume(node),
            NodeKind::Capsule(capsule_type) => reconstruct_capsule(node, capsule_type),
            NodeKind::Image(_) => {
                if !node.children.is_empty() {
                    node.body = layout_children(&mut node.children);
                }
                Ok(())
            }
            NodeKind::Region(region_type) => {
                if node.children.is_empty() {
                    return Ok(());
                }
                let body = layout_children(&mut node.children);
                if body.len() != node.body.len() {
                    log::error!(
                        "{:?} region would change size from {:#x} to {:#x}",
                        region_type,
                        node.body.len(),
                        body.len()
                    );
                    Err(FirmwareImageError::SizeOverflow)?;
                }
                node.body = body;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn reconstruct_section(&self, node: &mut Node) -> Result<(), FirmwareImageError> {
        let Some(data) = node.section_data().cloned() else {
            return Ok(());
        };
        let payload =
            if node.children.is_empty() { node.payload().to_vec() } else { layout_children(&mut node.children) };
        let was_decoded = data.decoded.is_some();
        // GUID-defined data stored as is, e.g. CRC32 sections walked without a codec.
        let walked = !was_decoded
            && matches!(data.metadata, SectionMetaData::GuidDefined(..))
            && !is_opaque_encoding(&data.metadata);

        let (metadata, body) = if was_decoded || walked {
            match self.composer.compose(&data.metadata, &payload) {
                Ok(composed) => {
                    node.diagnostics.retain(|diagnostic| diagnostic.kind != DiagnosticKind::ChecksumMismatch);
                    composed
                }
                Err(FirmwareImageError::UnsupportedEncoding) if walked && payload == node.body => {
                    (data.metadata.clone(), payload.clone())
                }
                Err(FirmwareImageError::UnsupportedEncoding) => {
                    log::error!("no codec can encode {:?}, its stored data would go stale", data.metadata);
                    Err(FirmwareImageError::UnsupportedEncoding)?
                }
                Err(err) => {
                    log::error!("encoding {:?} failed: {:?}", data.metadata, err);
                    Err(FirmwareImageError::ComposeFailed)?
                }
            }
        } else {
            let mut metadata = data.metadata.clone();
            if let SectionMetaData::Compression(header) = &mut metadata {
                if header.compression_type == compression::NOT_COMPRESSED {
                    header.uncompressed_length =
                        u32::try_from(payload.len()).map_err(|_| FirmwareImageError::SizeOverflow)?;
                }
            }
            (metadata, payload.clone())
        };

        let promote = self.policy.size_overflow == SizeOverflowPolicy::Promote;
        let header = metadata.serialize_header(body.len(), data.extended, promote)?;
        let extended = header.starts_with(&[0xFF; 3]);
        node.header = header;
        node.body = body;
        node.parsing_data =
            ParsingData::Section(SectionData { metadata, extended, decoded: was_decoded.then_some(payload) });
        Ok(())
    }

    fn reconstruct_file(&self, node: &mut Node) -> Result<(), FirmwareImageError> {
        let Some(mut data) = node.file_data().cloned() else {
            return Ok(());
        };
        if !node.children.is_empty() {
            node.body = layout_children(&mut node.children);
        }

        let tail_size = if data.has_tail { file::TAIL_SIZE } else { 0 };
        if !data.large && file::HEADER_SIZE + node.body.len() + tail_size >= utils::SIZE3_SENTINEL as usize {
            if self.policy.size_overflow != SizeOverflowPolicy::Promote || data.ffs_version < 3 {
                log::error!("file {} no longer fits a 3-byte size", utils::guid_to_string(&data.name));
                Err(FirmwareImageError::SizeOverflow)?;
            }
            data.large = true;
            data.attributes |= file::attributes::LARGE_FILE;
        }
        let header_size = if data.large { file::HEADER2_SIZE } else { file::HEADER_SIZE };
        let total = header_size + node.body.len() + tail_size;
        let size = if data.large { [0; 3] } else { utils::encode_size3(total as u32)? };

        let mut header = vec![0u8; header_size];
        header.pwrite_with(
            file::Header {
                name: data.name,
                integrity_check_header: 0,
                integrity_check_file: 0,
                file_type: data.file_type,
                attributes: data.attributes,
                size,
                state: 0,
            },
            0,
            LE,
        )?;
        if data.large {
            header.pwrite_with(total as u64, file::EXTENDED_SIZE_OFFSET, LE)?;
        }
        header[file::INTEGRITY_CHECK_HEADER_OFFSET] = utils::checksum8(&header);
        header[file::INTEGRITY_CHECK_FILE_OFFSET] =
            if data.has_checksum() { utils::checksum8(&node.body) } else { data.fixed_checksum() };
        header[file::STATE_OFFSET] = data.state;

        node.tail = if data.has_tail {
            let integrity = u16::from_le_bytes([
                header[file::INTEGRITY_CHECK_HEADER_OFFSET],
                header[file::INTEGRITY_CHECK_FILE_OFFSET],
            ]);
            (!integrity).to_le_bytes().to_vec()
        } else {
            Vec::new()
        };
        node.header = header;
        node.parsing_data = ParsingData::File(data);
        node.diagnostics.retain(|diagnostic| diagnostic.kind != DiagnosticKind::ChecksumMismatch);
        self.parser.propagate_ui_text(node);
        Ok(())
    }

    fn reconstruct_volume(&self, node: &mut Node) -> Result<(), FirmwareImageError> {
        let Some(mut data) = node.volume_data().cloned() else {
            return Ok(());
        };
        if data.ffs_version.is_none() {
            return write_volume_header(node, &data);
        }
        let empty = utils::empty_byte(data.erase_polarity);
        let header_len = node.header.len();
        let mut fv_length = node.total_len();

        // Files keep their order, anything after the last file stays anchored to the volume end.
        let children = core::mem::take(&mut node.children);
        let last_file = children.iter().rposition(|child| child.kind.is_file());
        let mut files = Vec::new();
        let mut trailing = Vec::new();
        let mut top_file = None;
        for (index, child) in children.into_iter().enumerate() {
            if child.kind == NodeKind::FreeSpace {
                continue;
            }
            if child.file_data().is_some_and(|file| file.name == guid::EFI_FFS_VOLUME_TOP_FILE_GUID) {
                if let Some(previous) = top_file.replace(child) {
                    files.push(previous);
                }
            } else if last_file.is_some_and(|last| index <= last) {
                files.push(child);
            } else {
                trailing.push(child);
            }
        }
        let files = drop_stale_pad_files(files, empty);

        let mut placed = Vec::new();
        let mut position = header_len;
        for mut item in files {
            position = utils::align_up(position, 8)?;
            let alignment = item.file_data().map(FileData::data_alignment).unwrap_or(1);
            if alignment > 8 && (position + item.header.len()) % alignment != 0 {
                let misalignment = (position + file::HEADER_SIZE + item.header.len()) % alignment;
                let pad_size = file::HEADER_SIZE + (alignment - misalignment) % alignment;
                let mut pad = self.pad_file(&data, pad_size)?;
                pad.offset = position - header_len;
                position += pad_size;
                placed.push(pad);
            }
            item.offset = position - header_len;
            position += item.total_len();
            placed.push(item);
        }

        let tail_len = trailing.iter().chain(top_file.iter()).map(Node::total_len).sum::<usize>();
        let free_start = utils::align_up(position, 8)?;
        let required = if tail_len == 0 { position } else { free_start + tail_len };
        if required > fv_length {
            if self.policy.volume_growth != VolumeGrowthPolicy::Grow {
                log::error!("volume content needs {:#x} bytes but the volume holds {:#x}", required, fv_length);
                Err(FirmwareImageError::SizeOverflow)?;
            }
            let last = data.block_map.last_mut().ok_or(FirmwareImageError::InvalidBlockMap)?;
            let block_length = last.length as usize;
            if block_length == 0 {
                Err(FirmwareImageError::InvalidBlockMap)?;
            }
            let blocks = (required - fv_length).div_ceil(block_length);
            last.num_blocks = u32::try_from(blocks)
                .ok()
                .and_then(|blocks| last.num_blocks.checked_add(blocks))
                .ok_or(FirmwareImageError::SizeOverflow)?;
            fv_length += blocks * block_length;
            log::info!("volume grows by {} blocks to {:#x} bytes", blocks, fv_length);
        }

        let tail_start = fv_length - tail_len;
        let mut children = placed;
        if free_start < tail_start {
            let free_space = vec![empty; tail_start - free_start];
            children.push(Node::leaf(NodeKind::FreeSpace, &free_space, free_start - header_len));
        }
        let mut tail_position = tail_start;
        for mut item in trailing.into_iter().chain(top_file) {
            item.offset = tail_position - header_len;
            tail_position += item.total_len();
            children.push(item);
        }

        let mut body = vec![empty; fv_length - header_len];
        for child in &children {
            body[child.offset..child.offset + child.total_len()].copy_from_slice(&child.to_bytes());
        }
        data.fv_length = fv_length as u64;
        node.body = body;
        node.children = children;
        node.diagnostics.retain(|diagnostic| diagnostic.kind != DiagnosticKind::ChecksumMismatch);
        write_volume_header(node, &data)?;
        node.parsing_data = ParsingData::Volume(data);
        Ok(())
    }

    /// A pad file of `size` bytes for a volume described by `volume`.
    fn pad_file(&self, volume: &VolumeData, size: usize) -> Result<Node, FirmwareImageError> {
        use file::state;
        let valid = state::HEADER_CONSTRUCTION | state::HEADER_VALID | state::DATA_VALID;
        let raw_state = if volume.erase_polarity { !valid } else { valid };
        let data = FileData {
            name: guid::EFI_FFS_PAD_FILE_GUID,
            file_type: file::r#type::PAD,
            attributes: 0,
            state: raw_state,
            lifecycle: FileState::DataValid,
            large: false,
            has_tail: false,
            erase_polarity: volume.erase_polarity,
            volume_revision: volume.revision,
            ffs_version: volume.ffs_version.unwrap_or(2),
        };
        let body = vec![utils::empty_byte(volume.erase_polarity); size - file::HEADER_SIZE];
        let mut pad = Node::new(NodeKind::File(file::r#type::PAD), Vec::new(), body, Vec::new(), 0)
            .with_name("Pad-file")
            .with_parsing_data(ParsingData::File(data));
        self.reconstruct_file(&mut pad)?;
        Ok(pad)
    }
}

/// Encapsulations whose payload is only available through a codec.
fn is_opaque_encoding(metadata: &SectionMetaData) -> bool {
    match metadata {
        SectionMetaData::Compression(header) => header.compression_type != compression::NOT_COMPRESSED,
        SectionMetaData::GuidDefined(header, _) => header.section_definition_guid != guid::CRC32_SECTION_GUID,
        _ => false,
    }
}

fn is_frozen_container(node: &Node) -> bool {
    is_fixed(node.kind)
        || matches!(node.kind, NodeKind::Image(ImageType::Intel) | NodeKind::Volume(VolumeType::Nvram))
}

/// Kinds whose layout no codec here can rewrite.
fn is_fixed(kind: NodeKind) -> bool {
    matches!(kind, NodeKind::Region(_) | NodeKind::Nvram(_) | NodeKind::Me(_))
}

/// Regions of a descriptor image keep their place and size; nodes directly in them are fixed too.
/// Variable stores and ME partitions are read only.
fn check_mutable(root: &Node, path: &[usize]) -> Result<(), FirmwareImageError> {
    let node = root.get(path).ok_or(FirmwareImageError::NotFound)?;
    let parent_frozen =
        path.split_last().and_then(|(_, parent)| root.get(parent)).is_some_and(is_frozen_container);
    if is_fixed(node.kind) || parent_frozen {
        Err(FirmwareImageError::FrozenRegion)?;
    }
    Ok(())
}

/// Default position for a child inserted into `parent`.
fn insertion_index(parent: &Node) -> usize {
    let after_last = match parent.kind {
        NodeKind::Volume(_) => parent.children.iter().rposition(|child| child.kind.is_file()),
        NodeKind::Image(ImageType::Bios) => parent.children.iter().rposition(|child| child.kind.is_volume()),
        _ => return parent.children.len(),
    };
    match after_last {
        Some(index) => index + 1,
        None => {
            parent.children.iter().position(|child| child.kind == NodeKind::FreeSpace).unwrap_or(parent.children.len())
        }
    }
}

/// Index of the child matching `inserted` closest to where it was spliced in.
fn locate(children: &[Node], inserted: &Node, hint: usize) -> Option<usize> {
    children
        .iter()
        .enumerate()
        .filter(|(_, child)| {
            child.kind == inserted.kind && child.header == inserted.header && child.body == inserted.body
        })
        .min_by_key(|(index, _)| index.abs_diff(hint))
        .map(|(index, _)| index)
}

/// Empty pad files in front of aligned files; they are regenerated during layout.
fn drop_stale_pad_files(files: Vec<Node>, empty: u8) -> Vec<Node> {
    let mut kept = Vec::with_capacity(files.len());
    let mut files = files.into_iter().peekable();
    while let Some(item) = files.next() {
        let stale = item.kind == NodeKind::File(file::r#type::PAD)
            && item.body.iter().all(|byte| *byte == empty)
            && files.peek().and_then(Node::file_data).is_some_and(|next| next.data_alignment() > 8);
        if !stale {
            kept.push(item);
        }
    }
    kept
}

/// Concatenates children, 4-byte aligned with zero fill for section streams, and updates their
/// offsets.
fn layout_children(children: &mut [Node]) -> Vec<u8> {
    let alignment = if children.iter().any(|child| child.kind.is_section()) { 4 } else { 1 };
    let mut bytes = Vec::new();
    for child in children.iter_mut() {
        bytes.resize(bytes.len().next_multiple_of(alignment), 0);
        child.offset = bytes.len();
        bytes.extend_from_slice(&child.to_bytes());
    }
    bytes
}

fn write_volume_header(node: &mut Node, data: &VolumeData) -> Result<(), FirmwareImageError> {
    let header = &mut node.header;
    header.pwrite_with(data.fv_length, fv::FV_LENGTH_OFFSET, LE)?;
    let mut offset = fv::HEADER_SIZE;
    for entry in &data.block_map {
        header.gwrite_with(*entry, &mut offset, LE)?;
    }
    header.pwrite_with(0u16, fv::CHECKSUM_OFFSET, LE)?;
    let length = data.header_length.min(header.len());
    let checksum = utils::checksum16(&header[..length]);
    header.pwrite_with(checksum, fv::CHECKSUM_OFFSET, LE)?;
    Ok(())
}

fn reconstruct_capsule(node: &mut Node, capsule_type: CapsuleType) -> Result<(), FirmwareImageError> {
    if node.children.is_empty() {
        return Ok(());
    }
    let body = layout_children(&mut node.children);
    let size_offset = match capsule_type {
        CapsuleType::Toshiba => capsule::TOSHIBA_FULL_SIZE_OFFSET,
        _ => capsule::IMAGE_SIZE_OFFSET,
    };
    let declared = node.header.pread_with::<u32>(size_offset, LE)?;
    let declared = (declared as usize + body.len())
        .checked_sub(node.body.len())
        .and_then(|size| u32::try_from(size).ok())
        .ok_or(FirmwareImageError::SizeOverflow)?;
    node.header.pwrite_with(declared, size_offset, LE)?;
    node.body = body;
    Ok(())
}
