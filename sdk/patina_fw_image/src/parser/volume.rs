//! Firmware volume header validation and FFS file enumeration.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{collections::BTreeSet, format, string::String, vec::Vec};
use scroll::{Pread, LE};

use super::{ParseContext, Parser};
use crate::{
    node::{DiagnosticKind, Node, NodeKind, PaddingType, ParsingData, VolumeData, VolumeType},
    pi::{self, ffs::file, fv, guid},
    utils, FirmwareImageError,
};

/// FFS version implied by a volume file system GUID.
pub(crate) fn ffs_version(file_system_guid: &r_efi::efi::Guid) -> Option<u8> {
    if *file_system_guid == guid::EFI_FIRMWARE_FILE_SYSTEM_GUID
        || *file_system_guid == guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID
        || *file_system_guid == guid::EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM_GUID
    {
        Some(2)
    } else if *file_system_guid == guid::EFI_FIRMWARE_FILE_SYSTEM3_GUID {
        Some(3)
    } else {
        None
    }
}

fn is_nvram(file_system_guid: &r_efi::efi::Guid) -> bool {
    *file_system_guid == guid::NVRAM_MAIN_STORE_VOLUME_GUID
        || *file_system_guid == guid::NVRAM_ADDITIONAL_STORE_VOLUME_GUID
}

impl Parser<'_> {
    /// Parses the volume at the start of `bytes`.
    ///
    /// A bad signature, header length or volume length is fatal; the caller keeps the bytes as
    /// padding. Checksum and block map problems are recorded on the returned node.
    pub(crate) fn parse_volume(&self, bytes: &[u8], context: ParseContext) -> Result<Node, FirmwareImageError> {
        let header = bytes.pread_with::<fv::Header>(0, LE)?;
        if header.signature != fv::SIGNATURE {
            Err(FirmwareImageError::MalformedHeader)?;
        }
        let header_length = header.header_length as usize;
        if header_length < fv::HEADER_SIZE || header_length > bytes.len() || header_length % 2 != 0 {
            log::debug!("volume header length {:#x} is invalid", header_length);
            Err(FirmwareImageError::MalformedHeader)?;
        }
        let fv_length: usize = header.fv_length.try_into().map_err(|_| FirmwareImageError::MalformedHeader)?;
        if fv_length < header_length || fv_length > bytes.len() {
            log::debug!("volume length {:#x} does not fit the {:#x} available bytes", fv_length, bytes.len());
            Err(FirmwareImageError::MalformedHeader)?;
        }
        let volume = &bytes[..fv_length];

        let mut diagnostics = Vec::new();
        if utils::sum16(&volume[..header_length]) != 0 {
            diagnostics.push((
                DiagnosticKind::ChecksumMismatch,
                format!("volume header checksum {:#06x} is invalid", header.checksum),
            ));
        }

        let mut block_map = Vec::new();
        let mut offset = fv::HEADER_SIZE;
        let mut terminated = false;
        while offset + fv::BLOCK_MAP_ENTRY_SIZE <= header_length {
            let entry = volume.gread_with::<fv::BlockMapEntry>(&mut offset, LE)?;
            if entry.num_blocks == 0 && entry.length == 0 {
                terminated = true;
                break;
            }
            block_map.push(entry);
        }
        let mapped = block_map.iter().map(|entry| entry.num_blocks as u64 * entry.length as u64).sum::<u64>();
        if !terminated {
            diagnostics.push((DiagnosticKind::MalformedHeader, String::from("block map is not terminated")));
        } else if mapped != header.fv_length {
            diagnostics.push((
                DiagnosticKind::InconsistentLayout,
                format!("block map describes {:#x} bytes, volume length is {:#x}", mapped, header.fv_length),
            ));
        }

        // The extended header, when present, sits in front of the first file.
        let mut data_offset = header_length;
        let mut ext_header = None;
        if header.revision > 1 && header.ext_header_offset != 0 {
            let ext_offset = header.ext_header_offset as usize;
            match volume.get(ext_offset..).map(|ext| ext.pread_with::<fv::ExtHeader>(0, LE)) {
                Some(Ok(ext))
                    if ext_offset >= header_length
                        && ext.ext_header_size as usize >= fv::EXT_HEADER_SIZE
                        && ext_offset + ext.ext_header_size as usize <= fv_length =>
                {
                    data_offset = utils::align_up(ext_offset + ext.ext_header_size as usize, 8)?.min(fv_length);
                    ext_header = Some(ext);
                }
                _ => diagnostics
                    .push((DiagnosticKind::MalformedHeader, format!("extended header at {ext_offset:#x} is invalid"))),
            }
        }

        let ffs_version = ffs_version(&header.file_system_guid);
        let volume_type = match ffs_version {
            Some(3) => VolumeType::Ffs3,
            Some(_) => VolumeType::Ffs2,
            None if is_nvram(&header.file_system_guid) => VolumeType::Nvram,
            None => VolumeType::Unknown,
        };
        let data = VolumeData {
            file_system_guid: header.file_system_guid,
            attributes: header.attributes,
            revision: header.revision,
            erase_polarity: utils::erase_polarity(header.attributes),
            ffs_version,
            block_map,
            ext_header,
            header_length,
            fv_length: header.fv_length,
        };
        let name_guid = ext_header.map(|ext| ext.fv_name).unwrap_or(header.file_system_guid);

        let mut node = Node::new(
            NodeKind::Volume(volume_type),
            volume[..data_offset].to_vec(),
            volume[data_offset..].to_vec(),
            Vec::new(),
            0,
        )
        .with_name(self.guid_name(&name_guid))
        .with_parsing_data(ParsingData::Volume(data));
        for (kind, message) in diagnostics {
            node.add_diagnostic(kind, message);
        }
        log::debug!("volume {} of {:#x} bytes, {:?}", utils::guid_to_string(&name_guid), fv_length, volume_type);

        if volume_type == VolumeType::Unknown {
            node.add_diagnostic(
                DiagnosticKind::UnsupportedEncoding,
                format!("unknown file system {}", utils::guid_to_string(&header.file_system_guid)),
            );
            return Ok(node);
        }
        if volume_type == VolumeType::Nvram {
            let mut children = Vec::new();
            self.parse_padding(&node.body, 0, &mut children);
            node.children = children;
            return Ok(node);
        }

        let child_context = context.child_context(&node);
        let children = match self.too_deep(&node.body, child_context) {
            Some(raw) => alloc::vec![raw],
            None => self.parse_volume_body(&mut node, data_offset, child_context)?,
        };
        node.children = children;
        Ok(node)
    }

    /// Enumerates the files of a volume body. Positions are relative to the volume start so that
    /// 8-byte file alignment is checked against the volume, not the body.
    fn parse_volume_body(
        &self,
        volume: &mut Node,
        data_offset: usize,
        context: ParseContext,
    ) -> Result<Vec<Node>, FirmwareImageError> {
        let polarity = context.erase_polarity.unwrap_or(true);
        let empty = utils::empty_byte(polarity);
        let fv_length = data_offset + volume.body.len();
        let body = &volume.body;

        let mut children = Vec::new();
        let mut diagnostics = Vec::new();
        let mut seen = BTreeSet::new();
        let mut garbage_start: Option<usize> = None;
        let mut resync_attempts = 0;
        let mut position = data_offset;

        let flush_garbage = |garbage_start: &mut Option<usize>, end: usize, children: &mut Vec<Node>| {
            if let Some(start) = garbage_start.take() {
                let bytes = &body[start - data_offset..end - data_offset];
                let kind = NodeKind::Padding(PaddingType::classify(bytes));
                let mut padding = Node::leaf(kind, bytes, start - data_offset);
                padding.add_diagnostic(
                    DiagnosticKind::MalformedHeader,
                    format!("{:#x} bytes at volume offset {:#x} are not a valid file", bytes.len(), start),
                );
                children.push(padding);
            }
        };

        while position < fv_length {
            let remaining = &body[position - data_offset..];

            if remaining.len() < file::HEADER_SIZE {
                flush_garbage(&mut garbage_start, position, &mut children);
                let kind = if remaining.iter().all(|b| *b == empty) {
                    NodeKind::FreeSpace
                } else {
                    NodeKind::Padding(PaddingType::classify(remaining))
                };
                children.push(Node::leaf(kind, remaining, position - data_offset));
                break;
            }

            if remaining[..file::HEADER_SIZE].iter().all(|b| *b == empty) {
                flush_garbage(&mut garbage_start, position, &mut children);
                match remaining.iter().position(|b| *b != empty) {
                    None => {
                        children.push(Node::leaf(NodeKind::FreeSpace, remaining, position - data_offset));
                        break;
                    }
                    Some(first) => {
                        // Resume at the first non-empty 8-byte slot, e.g. a volume top file.
                        let end = utils::align_down(first, 8)?;
                        children.push(Node::leaf(NodeKind::FreeSpace, &remaining[..end], position - data_offset));
                        position += end;
                        continue;
                    }
                }
            }

            match self.parse_file(remaining, position - data_offset, context) {
                Ok(mut file_node) => {
                    flush_garbage(&mut garbage_start, position, &mut children);
                    self.check_file_placement(&mut file_node, position, fv_length, &mut seen);
                    position += file_node.total_len();
                    children.push(file_node);
                    position = utils::align_up(position, 8)?;
                }
                Err(err) => {
                    if garbage_start.is_none() {
                        log::debug!("invalid file header at volume offset {:#x}: {:?}", position, err);
                        garbage_start = Some(position);
                    }
                    resync_attempts += 1;
                    if resync_attempts > self.options.max_resync_attempts {
                        diagnostics.push(format!("gave up resynchronising after {} attempts", resync_attempts - 1));
                        position = fv_length;
                        break;
                    }
                    position += 8;
                }
            }
        }
        flush_garbage(&mut garbage_start, position.min(fv_length), &mut children);

        for message in diagnostics {
            volume.add_diagnostic(DiagnosticKind::MalformedHeader, message);
        }
        Ok(children)
    }

    fn check_file_placement(
        &self,
        file_node: &mut Node,
        position: usize,
        fv_length: usize,
        seen: &mut BTreeSet<[u8; 16]>,
    ) {
        let Some(data) = file_node.file_data().cloned() else {
            return;
        };
        if data.file_type != file::r#type::PAD && !seen.insert(*data.name.as_bytes()) {
            file_node.add_diagnostic(
                DiagnosticKind::InconsistentLayout,
                format!("duplicate file GUID {}", utils::guid_to_string(&data.name)),
            );
        }
        let data_start = position + file_node.header.len();
        let alignment = data.data_alignment();
        if alignment > 1 && data_start % alignment != 0 {
            file_node.add_diagnostic(
                DiagnosticKind::InconsistentLayout,
                format!("file data at volume offset {data_start:#x} is not {alignment:#x}-byte aligned"),
            );
        }
        if data.name == pi::guid::EFI_FFS_VOLUME_TOP_FILE_GUID && position + file_node.total_len() != fv_length {
            file_node.add_diagnostic(DiagnosticKind::InconsistentLayout, "volume top file does not end the volume");
        }
    }
}
