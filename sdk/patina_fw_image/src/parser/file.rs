//! FFS file header decoding and validation.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{format, string::String, vec::Vec};
use scroll::{Pread, LE};

use super::{is_raw_file_type, ParseContext, Parser};
use crate::{
    node::{DiagnosticKind, FileData, FileState, Node, NodeKind, ParsingData},
    pi::{
        ffs::{file, section},
        guid,
    },
    utils, FirmwareImageError,
};

/// Header size, total size and tail size of the file at the start of `bytes`.
pub(crate) fn file_layout(
    header: &file::Header,
    bytes: &[u8],
    context: ParseContext,
) -> Result<(usize, usize, usize), FirmwareImageError> {
    let large = context.ffs_version >= 3 && header.attributes & file::attributes::LARGE_FILE != 0;
    let (header_size, total) = if large {
        let size = bytes.pread_with::<u64>(file::EXTENDED_SIZE_OFFSET, LE)?;
        (file::HEADER2_SIZE, usize::try_from(size).map_err(|_| FirmwareImageError::MalformedHeader)?)
    } else {
        (file::HEADER_SIZE, utils::decode_size3(&header.size) as usize)
    };
    let tail_size = if !large && context.volume_revision == 1 && header.attributes & file::attributes::TAIL_PRESENT != 0
    {
        file::TAIL_SIZE
    } else {
        0
    };
    if total < header_size + tail_size || total > bytes.len() {
        Err(FirmwareImageError::MalformedHeader)?;
    }
    Ok((header_size, total, tail_size))
}

impl Parser<'_> {
    /// Parses the file at the start of `bytes`, `offset` being its position in the volume body.
    ///
    /// Sizes that do not fit the available bytes are fatal; checksum problems are diagnostics.
    pub(crate) fn parse_file(
        &self,
        bytes: &[u8],
        offset: usize,
        context: ParseContext,
    ) -> Result<Node, FirmwareImageError> {
        let header = bytes.pread_with::<file::Header>(0, LE)?;
        let (header_size, total, tail_size) = file_layout(&header, bytes, context)?;
        let erase_polarity = context.erase_polarity.unwrap_or(true);

        let header_bytes = &bytes[..header_size];
        let body = &bytes[header_size..total - tail_size];
        let tail = &bytes[total - tail_size..total];

        let data = FileData {
            name: header.name,
            file_type: header.file_type,
            attributes: header.attributes,
            state: header.state,
            lifecycle: FileState::from_state(header.state, erase_polarity),
            large: header_size == file::HEADER2_SIZE,
            has_tail: tail_size != 0,
            erase_polarity,
            volume_revision: context.volume_revision,
            ffs_version: context.ffs_version,
        };

        let name = if header.file_type == file::r#type::PAD {
            String::from("Pad-file")
        } else if header.name == guid::EFI_FFS_VOLUME_TOP_FILE_GUID {
            String::from("Volume Top File")
        } else {
            self.guid_name(&header.name)
        };

        let mut node =
            Node::new(NodeKind::File(header.file_type), header_bytes.to_vec(), body.to_vec(), tail.to_vec(), offset)
                .with_name(name);

        let header_sum = utils::sum8(header_bytes).wrapping_sub(header.state).wrapping_sub(header.integrity_check_file);
        if header_sum != 0 {
            node.add_diagnostic(
                DiagnosticKind::ChecksumMismatch,
                format!(
                    "file {} header checksum {:#04x} is invalid",
                    utils::guid_to_string(&header.name),
                    header.integrity_check_header
                ),
            );
        }

        if data.has_checksum() {
            let expected = utils::checksum8(body);
            if expected != header.integrity_check_file {
                node.add_diagnostic(
                    DiagnosticKind::ChecksumMismatch,
                    format!("file data checksum {:#04x}, expected {:#04x}", header.integrity_check_file, expected),
                );
            }
        } else if header.integrity_check_file != data.fixed_checksum() {
            node.add_diagnostic(
                DiagnosticKind::ChecksumMismatch,
                format!(
                    "file checksum {:#04x}, revision {} volumes expect {:#04x}",
                    header.integrity_check_file,
                    data.volume_revision,
                    data.fixed_checksum()
                ),
            );
        }

        if tail_size != 0 {
            let integrity = u16::from_le_bytes([header.integrity_check_header, header.integrity_check_file]);
            let stored = u16::from_le_bytes([tail[0], tail[1]]);
            if stored != !integrity {
                node.add_diagnostic(
                    DiagnosticKind::ChecksumMismatch,
                    format!("file tail {stored:#06x} does not match"),
                );
            }
        }

        if !data.lifecycle.is_live() {
            log::debug!("file {} is {:?}", utils::guid_to_string(&header.name), data.lifecycle);
        }

        node.parsing_data = ParsingData::File(data);
        self.parse_file_children(&mut node, context)?;
        self.propagate_ui_text(&mut node);
        Ok(node)
    }

    /// Decodes the children of a file: nothing for pad files, BIOS space or a section stream for
    /// raw files, and a section stream for everything else.
    pub(crate) fn parse_file_children(&self, node: &mut Node, context: ParseContext) -> Result<(), FirmwareImageError> {
        let NodeKind::File(file_type) = node.kind else {
            return Ok(());
        };
        node.children.clear();
        if node.body.is_empty() || file_type == file::r#type::PAD {
            return Ok(());
        }
        let child_context = context.child_context(node);
        let mut diagnostics = Vec::new();

        let children = if !is_raw_file_type(file_type) {
            self.decode_sections(&node.body, child_context, &mut diagnostics)
        } else if !self.options.parse_raw_files {
            Vec::new()
        } else {
            let children = self.parse_bios_space(&node.body, child_context)?;
            if children.iter().any(|child| child.kind.is_volume() || child.kind.is_vendor()) {
                children
            } else {
                // Raw files sometimes carry a plain section stream.
                let sections = self.decode_sections(&node.body, child_context, &mut diagnostics);
                let clean = diagnostics.is_empty()
                    && !sections.is_empty()
                    && sections.iter().all(|child| child.kind != NodeKind::Raw && child.diagnostics.is_empty());
                if clean {
                    sections
                } else {
                    diagnostics.clear();
                    Vec::new()
                }
            }
        };
        node.children = children;
        node.diagnostics.extend(diagnostics);
        Ok(())
    }

    /// Copies the text of the first user interface section to the file.
    pub(crate) fn propagate_ui_text(&self, node: &mut Node) {
        fn find_ui(nodes: &[Node]) -> Option<String> {
            for child in nodes {
                match child.kind {
                    NodeKind::Section(section::r#type::USER_INTERFACE) => return child.text.clone(),
                    NodeKind::Section(_) => {
                        if let Some(text) = find_ui(&child.children) {
                            return Some(text);
                        }
                    }
                    _ => (),
                }
            }
            None
        }
        node.text = find_ui(&node.children);
    }
}
