//! Image roots: capsules, Intel flash images and BIOS space.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{format, vec, vec::Vec};
use r_efi::efi;
use scroll::{Pread, LE};

use super::{ParseContext, Parser};
use crate::{
    node::{CapsuleType, Diagnostic, DiagnosticKind, ImageType, Node, NodeKind, PaddingType, ParsingData, RegionType},
    pi::{self, capsule, descriptor, fv, guid},
    utils, FirmwareImageError,
};

/// Capsule type announced by the GUID at the start of `bytes`.
fn capsule_type(bytes: &[u8]) -> Option<CapsuleType> {
    let capsule_guid = pi::gread_guid(bytes, &mut 0).ok()?;
    let known: [(efi::Guid, CapsuleType); 8] = [
        (guid::EFI_CAPSULE_GUID, CapsuleType::Efi),
        (guid::EFI_FMP_CAPSULE_GUID, CapsuleType::Fmp),
        (guid::INTEL_CAPSULE_GUID, CapsuleType::Intel),
        (guid::LENOVO_CAPSULE_GUID, CapsuleType::Lenovo),
        (guid::LENOVO2_CAPSULE_GUID, CapsuleType::Lenovo2),
        (guid::TOSHIBA_CAPSULE_GUID, CapsuleType::Toshiba),
        (guid::APTIO_SIGNED_CAPSULE_GUID, CapsuleType::AptioSigned),
        (guid::APTIO_UNSIGNED_CAPSULE_GUID, CapsuleType::AptioUnsigned),
    ];
    known.iter().find(|(known_guid, _)| *known_guid == capsule_guid).map(|(_, capsule_type)| *capsule_type)
}

fn has_descriptor(bytes: &[u8]) -> bool {
    bytes.len() >= descriptor::DESCRIPTOR_SIZE
        && bytes.pread_with::<u32>(descriptor::SIGNATURE_OFFSET, LE).is_ok_and(|sig| sig == descriptor::SIGNATURE)
}

fn region_name(region_type: RegionType) -> &'static str {
    match region_type {
        RegionType::Descriptor => "Descriptor region",
        RegionType::Gbe => "GbE region",
        RegionType::Me => "ME region",
        RegionType::Bios => "BIOS region",
        RegionType::Pdr => "PDR region",
    }
}

pub(super) fn padding(bytes: &[u8], offset: usize) -> Node {
    Node::leaf(NodeKind::Padding(PaddingType::classify(bytes)), bytes, offset)
}

impl Parser<'_> {
    pub(crate) fn parse_root(&self, bytes: &[u8], context: ParseContext) -> Result<Node, FirmwareImageError> {
        let mut capsule_diagnostic = None;
        if let Some(capsule_type) = capsule_type(bytes) {
            match self.parse_capsule(bytes, capsule_type, context) {
                Ok(node) => return Ok(node),
                Err(err) => {
                    capsule_diagnostic = Some(Diagnostic::new(
                        DiagnosticKind::MalformedHeader,
                        format!("{:?} capsule header is invalid: {:?}", capsule_type, err),
                    ))
                }
            }
        } else if !has_descriptor(bytes) {
            if let Ok(volume) = self.parse_volume(bytes, context) {
                if volume.total_len() == bytes.len() {
                    return Ok(volume);
                }
            }
        }

        let mut image = self.parse_image(bytes, context)?;
        image.diagnostics.extend(capsule_diagnostic);
        Ok(image)
    }

    fn parse_capsule(
        &self,
        bytes: &[u8],
        capsule_type: CapsuleType,
        context: ParseContext,
    ) -> Result<Node, FirmwareImageError> {
        let (header_size, image_size) = match capsule_type {
            CapsuleType::Toshiba => {
                let header = bytes.pread_with::<capsule::ToshibaHeader>(0, LE)?;
                (header.header_size as usize, header.full_size as usize)
            }
            CapsuleType::AptioSigned | CapsuleType::AptioUnsigned => {
                let header = bytes.pread_with::<capsule::AptioHeader>(0, LE)?;
                if (header.rom_image_offset as usize) < capsule::APTIO_HEADER_SIZE {
                    Err(FirmwareImageError::MalformedHeader)?;
                }
                (header.rom_image_offset as usize, header.capsule.capsule_image_size as usize)
            }
            _ => {
                let header = bytes.pread_with::<capsule::Header>(0, LE)?;
                (header.header_size as usize, header.capsule_image_size as usize)
            }
        };
        if header_size < capsule::HEADER_SIZE || header_size > bytes.len() || image_size > bytes.len() {
            log::debug!(
                "capsule header size {:#x}, image size {:#x}, {:#x} bytes",
                header_size,
                image_size,
                bytes.len()
            );
            Err(FirmwareImageError::MalformedHeader)?;
        }

        let name = match capsule_type {
            CapsuleType::Toshiba => "Toshiba capsule",
            CapsuleType::AptioSigned => "AMI Aptio signed capsule",
            CapsuleType::AptioUnsigned => "AMI Aptio capsule",
            _ => "UEFI capsule",
        };
        let (header, body) = bytes.split_at(header_size);
        let mut node = Node::new(NodeKind::Capsule(capsule_type), header.to_vec(), body.to_vec(), Vec::new(), 0)
            .with_name(name)
            .with_parsing_data(ParsingData::Capsule { header_size });
        node.text = pi::gread_guid(bytes, &mut 0).ok().map(|capsule_guid| utils::guid_to_string(&capsule_guid));
        if image_size != bytes.len() {
            node.add_diagnostic(
                DiagnosticKind::InconsistentLayout,
                format!("capsule declares {:#x} bytes, {:#x} are present", image_size, bytes.len()),
            );
        }
        log::debug!("{} with a {:#x}-byte header", name, header_size);

        let image = self.parse_image(&node.body, context)?;
        node.children = vec![image];
        Ok(node)
    }

    /// An Intel flash image when a valid descriptor is present, otherwise BIOS space.
    fn parse_image(&self, bytes: &[u8], context: ParseContext) -> Result<Node, FirmwareImageError> {
        let mut descriptor_diagnostic = None;
        if has_descriptor(bytes) {
            match self.parse_intel_image(bytes, context) {
                Ok(image) => return Ok(image),
                Err(err) => {
                    descriptor_diagnostic = Some(Diagnostic::new(
                        DiagnosticKind::MalformedHeader,
                        format!("flash descriptor is invalid: {err:?}"),
                    ))
                }
            }
        }
        let mut image = Node::leaf(NodeKind::Image(ImageType::Bios), bytes, 0).with_name("BIOS image");
        image.children = self.parse_bios_space(bytes, context)?;
        image.diagnostics.extend(descriptor_diagnostic);
        Ok(image)
    }

    fn parse_intel_image(&self, bytes: &[u8], context: ParseContext) -> Result<Node, FirmwareImageError> {
        let map = bytes.pread_with::<descriptor::Map>(descriptor::MAP_OFFSET, LE)?;
        let regions = bytes.pread_with::<descriptor::RegionSection>(
            map.region_base as usize * descriptor::MAP_BASE_GRANULARITY,
            LE,
        )?;

        let mut layout = vec![(RegionType::Descriptor, 0, descriptor::DESCRIPTOR_SIZE)];
        for (region_type, base, limit) in [
            (RegionType::Gbe, regions.gbe_base, regions.gbe_limit),
            (RegionType::Me, regions.me_base, regions.me_limit),
            (RegionType::Bios, regions.bios_base, regions.bios_limit),
            (RegionType::Pdr, regions.pdr_base, regions.pdr_limit),
        ] {
            let size = descriptor::region_size(base, limit);
            if size != 0 {
                layout.push((region_type, descriptor::region_offset(base), size));
            }
        }
        if !layout.iter().any(|(region_type, _, _)| *region_type == RegionType::Bios) {
            log::error!("flash descriptor has no BIOS region");
            Err(FirmwareImageError::MalformedHeader)?;
        }
        layout.sort_by_key(|(_, offset, _)| *offset);

        let mut children = Vec::new();
        let mut position = 0;
        for (region_type, offset, size) in layout {
            if offset < position || offset + size > bytes.len() {
                log::error!(
                    "{} at {:#x} of {:#x} bytes overlaps or exceeds the image",
                    region_name(region_type),
                    offset,
                    size
                );
                Err(FirmwareImageError::MalformedHeader)?;
            }
            if offset > position {
                children.push(padding(&bytes[position..offset], position));
            }
            let body = &bytes[offset..offset + size];
            let mut region = Node::leaf(NodeKind::Region(region_type), body, offset)
                .with_name(region_name(region_type))
                .with_parsing_data(ParsingData::Region { offset, size });
            match region_type {
                RegionType::Bios | RegionType::Pdr => region.children = self.parse_bios_space(body, context)?,
                RegionType::Me => super::me::parse_me_region(&mut region),
                _ => {}
            }
            children.push(region);
            position = offset + size;
        }
        if position < bytes.len() {
            children.push(padding(&bytes[position..], position));
        }

        let mut image = Node::leaf(NodeKind::Image(ImageType::Intel), bytes, 0).with_name("Intel image");
        image.children = children;
        Ok(image)
    }

    /// Splits `bytes` into volumes and the padding between them. Child offsets are relative to
    /// `bytes`.
    pub(crate) fn parse_bios_space(
        &self,
        bytes: &[u8],
        context: ParseContext,
    ) -> Result<Vec<Node>, FirmwareImageError> {
        if let Some(raw) = self.too_deep(bytes, context) {
            return Ok(vec![raw]);
        }
        let signature = fv::SIGNATURE.to_le_bytes();
        let mut children = Vec::new();
        let mut position = 0;
        let mut search = fv::SIGNATURE_OFFSET;

        while search + signature.len() <= bytes.len() {
            let Some(found) = bytes[search..].windows(signature.len()).position(|window| window == signature) else {
                break;
            };
            let found = search + found;
            let start = found - fv::SIGNATURE_OFFSET;
            match self.parse_volume(&bytes[start..], context) {
                Ok(mut volume) => {
                    self.parse_padding(&bytes[position..start], position, &mut children);
                    volume.offset = start;
                    let alignment = volume.volume_data().map(|data| data.alignment()).unwrap_or(1);
                    if start % alignment != 0 {
                        volume.add_diagnostic(
                            DiagnosticKind::InconsistentLayout,
                            format!("volume at {start:#x} is not {alignment:#x}-byte aligned"),
                        );
                    }
                    position = start + volume.total_len();
                    search = position + fv::SIGNATURE_OFFSET;
                    children.push(volume);
                }
                Err(err) => {
                    log::debug!("volume signature at {:#x} is not a volume: {:?}", found, err);
                    search = found + 1;
                }
            }
        }
        self.parse_padding(&bytes[position..], position, &mut children);
        Ok(children)
    }

    /// Turns a gap into padding, letting vendor decoders claim structures inside it.
    pub(super) fn parse_padding(&self, bytes: &[u8], offset: usize, children: &mut Vec<Node>) {
        if bytes.is_empty() {
            return;
        }
        if !self.options.decode_vendor_areas || self.vendor_decoders.is_empty() {
            children.push(padding(bytes, offset));
            return;
        }

        let mut start = 0;
        let mut position = 0;
        'scan: while position < bytes.len() {
            for decoder in &self.vendor_decoders {
                if (offset + position) % decoder.alignment().max(1) != 0 {
                    continue;
                }
                if let Some(mut node) = decoder.decode(&bytes[position..]) {
                    if node.total_len() == 0 {
                        continue;
                    }
                    if position > start {
                        children.push(padding(&bytes[start..position], offset + start));
                    }
                    node.offset = offset + position;
                    position += node.total_len();
                    start = position;
                    children.push(node);
                    continue 'scan;
                }
            }
            position += 1;
        }
        if start < bytes.len() {
            children.push(padding(&bytes[start..], offset + start));
        }
    }
}
