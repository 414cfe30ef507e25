//! NVRAM variable stores.
//!
//! Two layouts are decoded: AMI NVAR entries, kept in NVAR store files and padding, and
//! TianoCore `$VSS` stores, kept in NVRAM volumes. Both decoders are [`VendorDecoder`]s so they
//! are offered every padding and raw area the parser finds.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use r_efi::efi;
use scroll::{Pread, LE};

use super::{image::padding, vendor::VendorDecoder};
use crate::{
    node::{DiagnosticKind, Node, NodeKind, NvramData, NvramType, ParsingData},
    pi::{
        self,
        nvram::{nvar, vss},
    },
    utils,
};

/// AMI NVAR entry.
///
/// Each call decodes one entry. An entry that keeps its GUID in the store's GUID list is
/// resolved against the end of `bytes`, where the list is stored.
#[derive(Debug, Default, Clone, Copy)]
pub struct NvarDecoder;

impl VendorDecoder for NvarDecoder {
    fn alignment(&self) -> usize {
        1
    }

    fn decode(&self, bytes: &[u8]) -> Option<Node> {
        nvar_at(bytes, 0)
    }
}

fn nvar_at(bytes: &[u8], depth: usize) -> Option<Node> {
    let header = bytes.pread_with::<nvar::Header>(0, LE).ok()?;
    let size = header.size as usize;
    if header.signature != nvar::SIGNATURE || size < nvar::HEADER_SIZE || size > bytes.len() {
        return None;
    }
    Some(nvar_entry(&header, &bytes[..size], bytes, depth))
}

/// Name and GUID of a full NVAR entry, and the header length they extend it to.
struct NvarIdentity {
    vendor_guid: Option<efi::Guid>,
    name: Option<String>,
    header_len: usize,
}

fn nvar_identity(header: &nvar::Header, entry: &[u8], body_end: usize, area: &[u8]) -> Result<NvarIdentity, String> {
    let (vendor_guid, name_offset) = if header.attributes & nvar::attributes::GUID != 0 {
        let mut offset = nvar::HEADER_SIZE;
        let guid = pi::gread_guid(entry, &mut offset).map_err(|_| "GUID is truncated")?;
        (Some(guid), nvar::HEADER_SIZE + 16)
    } else {
        let index = *entry.get(nvar::HEADER_SIZE).ok_or("GUID index is truncated")? as usize;
        // The GUID list grows backwards from the end of the store.
        let guid = area
            .len()
            .checked_sub(16 * (index + 1))
            .filter(|start| *start >= entry.len())
            .and_then(|mut start| pi::gread_guid(area, &mut start).ok());
        if guid.is_none() {
            return Err(format!("GUID index {index} is outside the GUID list"));
        }
        (guid, nvar::HEADER_SIZE + 1)
    };

    let name_bytes = entry.get(name_offset..body_end).ok_or("name is truncated")?;
    let (name, name_len) = if header.attributes & nvar::attributes::ASCII_NAME != 0 {
        let end = name_bytes.iter().position(|byte| *byte == 0).ok_or("ASCII name is not terminated")?;
        (String::from_utf8_lossy(&name_bytes[..end]).to_string(), end + 1)
    } else {
        let units = name_bytes
            .chunks_exact(2)
            .position(|unit| unit == [0, 0])
            .ok_or("UCS-2 name is not terminated")?;
        (utils::utf16_to_string(&name_bytes[..units * 2]), (units + 1) * 2)
    };
    Ok(NvarIdentity { vendor_guid, name: Some(name), header_len: name_offset + name_len })
}

/// Levels of NVAR stores nested in entry data that are decoded.
const MAX_NESTED_STORES: usize = 4;

fn nvar_entry(header: &nvar::Header, entry: &[u8], area: &[u8], depth: usize) -> Node {
    let attributes = header.attributes;
    let valid = attributes & nvar::attributes::VALID != 0;
    let mut diagnostics = Vec::new();

    // The extended header trails the data; its size is the last word of the entry.
    let mut tail_len = 0;
    if valid && attributes & nvar::attributes::EXT_HEADER != 0 {
        let body_len = entry.len() - nvar::HEADER_SIZE;
        let ext_size = entry.pread_with::<u16>(entry.len() - 2, LE).map(usize::from).unwrap_or(0);
        if ext_size < 2 || ext_size > body_len {
            diagnostics.push((
                DiagnosticKind::MalformedHeader,
                format!("extended header of {ext_size:#x} bytes does not fit the {body_len:#x}-byte body"),
            ));
        } else {
            tail_len = ext_size;
            let ext_attributes = entry[entry.len() - ext_size];
            if ext_attributes & nvar::ext_attributes::CHECKSUM != 0 {
                let sum = utils::sum8(&entry[nvar::HEADER_SIZE..])
                    .wrapping_add(utils::sum8(&entry[4..6]))
                    .wrapping_add(attributes);
                if sum != 0 {
                    diagnostics.push((DiagnosticKind::ChecksumMismatch, format!("NVAR entry sum is {sum:02X}")));
                }
            }
        }
    }
    let body_end = entry.len() - tail_len;

    let data_only = attributes & nvar::attributes::DATA_ONLY != 0;
    let identity = if valid && !data_only {
        nvar_identity(header, entry, body_end, area).unwrap_or_else(|message| {
            diagnostics.push((DiagnosticKind::MalformedHeader, message));
            NvarIdentity { vendor_guid: None, name: None, header_len: nvar::HEADER_SIZE }
        })
    } else {
        NvarIdentity { vendor_guid: None, name: None, header_len: nvar::HEADER_SIZE }
    };

    let label = match identity.vendor_guid {
        _ if !valid => String::from("Invalid"),
        _ if data_only => String::from("NVAR data"),
        Some(guid) => utils::guid_to_string(&guid),
        None => String::from("NVAR entry"),
    };
    let mut node = Node::new(
        NodeKind::Nvram(NvramType::NvarEntry),
        entry[..identity.header_len].to_vec(),
        entry[identity.header_len..body_end].to_vec(),
        entry[body_end..].to_vec(),
        0,
    )
    .with_name(label)
    .with_parsing_data(ParsingData::Nvram(NvramData {
        vendor_guid: identity.vendor_guid,
        attributes: u32::from(attributes),
        valid,
    }));
    node.text = identity.name;
    for (kind, message) in diagnostics {
        node.add_diagnostic(kind, message);
    }

    // Entry data may itself be an NVAR store.
    if valid && depth < MAX_NESTED_STORES && node.body.starts_with(&nvar::SIGNATURE.to_le_bytes()) {
        node.children = nvar_entries(&node.body, depth + 1);
    }
    if valid && header.next() != nvar::LAST_ENTRY {
        log::trace!("NVAR entry {:?} continues {:#x} bytes further", node.name, header.next());
    }
    node
}

/// Consecutive entries at the start of `bytes`, then whatever follows them.
fn nvar_entries(bytes: &[u8], depth: usize) -> Vec<Node> {
    let mut children = Vec::new();
    let mut position = 0;
    while let Some(mut entry) = nvar_at(&bytes[position..], depth) {
        entry.offset = position;
        position += entry.total_len();
        children.push(entry);
    }
    if position < bytes.len() {
        children.push(padding(&bytes[position..], position));
    }
    children
}

/// TianoCore `$VSS` variable store and its Apple `$SVS` and `$NSS` variants.
#[derive(Debug, Default, Clone, Copy)]
pub struct VssStoreDecoder;

impl VendorDecoder for VssStoreDecoder {
    fn alignment(&self) -> usize {
        4
    }

    fn decode(&self, bytes: &[u8]) -> Option<Node> {
        let header = bytes.pread_with::<vss::StoreHeader>(0, LE).ok()?;
        let name = match header.signature {
            vss::STORE_SIGNATURE => "VSS store",
            vss::APPLE_SVS_STORE_SIGNATURE => "SVS store",
            vss::APPLE_NSS_STORE_SIGNATURE => "NSS store",
            _ => return None,
        };
        let size = header.size as usize;
        if size < vss::STORE_HEADER_SIZE || size > bytes.len() {
            log::debug!("{} of {:#x} bytes does not fit the {:#x} available", name, size, bytes.len());
            return None;
        }

        let store = &bytes[..size];
        let mut node = Node::leaf(NodeKind::Nvram(NvramType::VssStore), &store[vss::STORE_HEADER_SIZE..], 0)
            .with_name(name);
        node.header = store[..vss::STORE_HEADER_SIZE].to_vec();
        node.text = Some(format!("format {:02X}, state {:02X}", header.format, header.state));
        node.children = vss_variables(&node.body);
        if !node.children.iter().any(|child| child.kind == NodeKind::Nvram(NvramType::VssVariable))
            && node.children.iter().any(|child| matches!(child.kind, NodeKind::Padding(_)))
        {
            node.add_diagnostic(DiagnosticKind::InconsistentLayout, "store body holds no VSS variables");
        }
        log::debug!("{} of {:#x} bytes with {} children", name, size, node.children.len());
        Some(node)
    }
}

fn vss_variables(body: &[u8]) -> Vec<Node> {
    let mut children = Vec::new();
    let mut position = 0;
    while let Some(mut variable) = vss_variable(&body[position..]) {
        variable.offset = position;
        position += variable.total_len();
        children.push(variable);
    }
    let rest = &body[position..];
    if !rest.is_empty() {
        let node = match rest.iter().all(|byte| *byte == 0xFF) {
            true => Node::leaf(NodeKind::FreeSpace, rest, position),
            false => padding(rest, position),
        };
        children.push(node);
    }
    children
}

fn vss_variable(bytes: &[u8]) -> Option<Node> {
    let header = bytes.pread_with::<vss::VariableHeader>(0, LE).ok()?;
    let prefix = header.prefix;
    if prefix.start_id != vss::VARIABLE_START_ID {
        return None;
    }
    if prefix.attributes & vss::attributes::APPLE_DATA_CHECKSUM != 0
        || matches!(prefix.state, vss::state::INTEL_VALID | vss::state::INTEL_INVALID)
    {
        log::debug!(
            "VSS variable with state {:02X} and attributes {:08X} is not decoded",
            prefix.state,
            prefix.attributes
        );
        return None;
    }
    let total = header.total_size().filter(|total| *total <= bytes.len())?;
    let header_len = header.header_size + header.name_size as usize;

    let valid = matches!(prefix.state, vss::state::ADDED | vss::state::HEADER_VALID);
    let label = if valid { utils::guid_to_string(&header.vendor_guid) } else { String::from("Invalid") };
    let mut node = Node::new(
        NodeKind::Nvram(NvramType::VssVariable),
        bytes[..header_len].to_vec(),
        bytes[header_len..total].to_vec(),
        Vec::new(),
        0,
    )
    .with_name(label)
    .with_parsing_data(ParsingData::Nvram(NvramData {
        vendor_guid: valid.then_some(header.vendor_guid),
        attributes: prefix.attributes,
        valid,
    }));
    if valid {
        node.text = Some(utils::utf16_to_string(&bytes[header.header_size..header_len]));
    }
    Some(node)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{node::PaddingType, parser::tests::FILE_GUID};
    use alloc::vec;

    fn ucs2(name: &str) -> Vec<u8> {
        name.encode_utf16().chain([0]).flat_map(u16::to_le_bytes).collect()
    }

    /// NVAR entry named `name` with the GUID stored in place.
    pub fn nvar_entry_bytes(attributes: u8, guid: &efi::Guid, name: &str, data: &[u8]) -> Vec<u8> {
        let mut bytes = b"NVAR".to_vec();
        bytes.extend_from_slice(&[0, 0, 0xFF, 0xFF, 0xFF, attributes | nvar::attributes::GUID]);
        bytes.extend_from_slice(guid.as_bytes());
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(data);
        let size = bytes.len() as u16;
        bytes[4..6].copy_from_slice(&size.to_le_bytes());
        bytes
    }

    pub fn vss_variable_bytes(state: u8, guid: &efi::Guid, name: &str, data: &[u8]) -> Vec<u8> {
        let name = ucs2(name);
        let mut bytes = vec![0u8; vss::VARIABLE_HEADER_SIZE];
        bytes[..2].copy_from_slice(&vss::VARIABLE_START_ID.to_le_bytes());
        bytes[2] = state;
        let attributes = vss::attributes::NON_VOLATILE | vss::attributes::BOOTSERVICE_ACCESS;
        bytes[4..8].copy_from_slice(&attributes.to_le_bytes());
        bytes[8..12].copy_from_slice(&(name.len() as u32).to_le_bytes());
        bytes[12..16].copy_from_slice(&(data.len() as u32).to_le_bytes());
        bytes[16..32].copy_from_slice(guid.as_bytes());
        bytes.extend_from_slice(&name);
        bytes.extend_from_slice(data);
        bytes
    }

    /// `$VSS` store of `size` bytes holding `variables`, the rest erased.
    pub fn vss_store(variables: &[Vec<u8>], size: usize) -> Vec<u8> {
        let mut bytes = vec![0xFF; size];
        bytes[..4].copy_from_slice(&vss::STORE_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&(size as u32).to_le_bytes());
        bytes[8] = 0x5A;
        bytes[9] = 0xFE;
        bytes[10..16].fill(0);
        let mut offset = vss::STORE_HEADER_SIZE;
        for variable in variables {
            bytes[offset..offset + variable.len()].copy_from_slice(variable);
            offset += variable.len();
        }
        bytes
    }

    #[test]
    fn nvar_entry_with_inline_guid() {
        let attributes = nvar::attributes::VALID | nvar::attributes::ASCII_NAME;
        let mut bytes = nvar_entry_bytes(attributes, &FILE_GUID, "Setup", &[1, 2]);
        bytes.extend_from_slice(&[0xFF; 16]);
        let node = NvarDecoder.decode(&bytes).unwrap();
        assert_eq!(node.kind, NodeKind::Nvram(NvramType::NvarEntry));
        assert!(node.diagnostics.is_empty());
        assert_eq!(node.text.as_deref(), Some("Setup"));
        assert_eq!(node.guid(), Some(FILE_GUID));
        assert_eq!(node.header.len(), nvar::HEADER_SIZE + 16 + 6);
        assert_eq!(node.body, [1, 2]);
        assert_eq!(node.total_len(), bytes.len() - 16);
    }

    #[test]
    fn nvar_guid_index_reads_the_list_at_the_end() {
        let mut bytes = b"NVAR".to_vec();
        bytes.extend_from_slice(&[0, 0, 0xFF, 0xFF, 0xFF, nvar::attributes::VALID]);
        bytes.push(1);
        bytes.extend_from_slice(&ucs2("Boot"));
        bytes.push(0x42);
        let size = bytes.len() as u16;
        bytes[4..6].copy_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(&[0xFF; 8]);
        bytes.extend_from_slice(FILE_GUID.as_bytes());
        bytes.extend_from_slice(pi::guid::LZMA_SECTION_GUID.as_bytes());

        let node = NvarDecoder.decode(&bytes).unwrap();
        assert!(node.diagnostics.is_empty());
        assert_eq!(node.guid(), Some(FILE_GUID));
        assert_eq!(node.text.as_deref(), Some("Boot"));
        assert_eq!(node.body, [0x42]);

        // Index 3 points in front of the list.
        bytes[nvar::HEADER_SIZE] = 3;
        let node = NvarDecoder.decode(&bytes).unwrap();
        assert!(node.has_diagnostic(DiagnosticKind::MalformedHeader));
        assert_eq!(node.guid(), None);
    }

    #[test]
    fn nvar_extended_header_checksum() {
        let attributes = nvar::attributes::VALID | nvar::attributes::ASCII_NAME | nvar::attributes::EXT_HEADER;
        let mut bytes = nvar_entry_bytes(attributes, &FILE_GUID, "Lang", &[b'e', b'n']);
        // Extended attributes, checksum, extended header size.
        bytes.extend_from_slice(&[nvar::ext_attributes::CHECKSUM, 0, 4, 0]);
        let size = bytes.len() as u16;
        bytes[4..6].copy_from_slice(&size.to_le_bytes());
        let sum =
            utils::sum8(&bytes[nvar::HEADER_SIZE..]).wrapping_add(utils::sum8(&bytes[4..6])).wrapping_add(bytes[9]);
        let checksum_at = bytes.len() - 3;
        bytes[checksum_at] = 0u8.wrapping_sub(sum);

        let node = NvarDecoder.decode(&bytes).unwrap();
        assert!(node.diagnostics.is_empty(), "{:?}", node.diagnostics);
        assert_eq!(node.body, b"en");
        assert_eq!(node.tail.len(), 4);

        bytes[checksum_at] ^= 0x01;
        let node = NvarDecoder.decode(&bytes).unwrap();
        assert!(node.has_diagnostic(DiagnosticKind::ChecksumMismatch));
    }

    #[test]
    fn invalid_nvar_entries_are_kept_but_not_live() {
        let bytes = nvar_entry_bytes(nvar::attributes::ASCII_NAME, &FILE_GUID, "Old", &[7]);
        let node = NvarDecoder.decode(&bytes).unwrap();
        assert_eq!(node.name.as_deref(), Some("Invalid"));
        assert!(!node.is_live());
        assert_eq!(node.total_len(), bytes.len());
    }

    #[test]
    fn nvar_data_holding_a_store_has_children() {
        let attributes = nvar::attributes::VALID | nvar::attributes::ASCII_NAME;
        let mut inner = nvar_entry_bytes(attributes, &FILE_GUID, "Inner", &[9; 3]);
        inner.extend_from_slice(&[0xFF; 5]);
        let bytes = nvar_entry_bytes(attributes, &FILE_GUID, "Outer", &inner);

        let node = NvarDecoder.decode(&bytes).unwrap();
        assert_eq!(node.body, inner);
        assert_eq!(node.children.len(), 2);
        assert_eq!(node.children[0].text.as_deref(), Some("Inner"));
        assert_eq!(node.children[1].offset, inner.len() - 5);
        assert_eq!(node.children[1].kind, NodeKind::Padding(PaddingType::One));
    }

    #[test]
    fn other_data_is_not_nvar() {
        assert!(NvarDecoder.decode(&[0xFF; 32]).is_none());
        let bytes = nvar_entry_bytes(nvar::attributes::VALID, &FILE_GUID, "X", &[0; 8]);
        assert!(NvarDecoder.decode(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn vss_store_lists_variables_then_free_space() {
        let live = vss_variable_bytes(vss::state::ADDED, &FILE_GUID, "BootOrder", &[0, 0, 1, 0]);
        let deleted = vss_variable_bytes(vss::state::DELETED, &FILE_GUID, "Timeout", &[5, 0]);
        let bytes = vss_store(&[deleted.clone(), live.clone()], 0x200);

        let store = VssStoreDecoder.decode(&bytes).unwrap();
        assert_eq!(store.kind, NodeKind::Nvram(NvramType::VssStore));
        assert!(store.diagnostics.is_empty());
        assert_eq!(store.total_len(), 0x200);
        let kinds: Vec<NodeKind> = store.children.iter().map(|child| child.kind).collect();
        assert_eq!(
            kinds,
            [NodeKind::Nvram(NvramType::VssVariable), NodeKind::Nvram(NvramType::VssVariable), NodeKind::FreeSpace]
        );

        let old = &store.children[0];
        assert_eq!(old.name.as_deref(), Some("Invalid"));
        assert!(!old.is_live());
        let current = &store.children[1];
        assert_eq!(current.offset, deleted.len());
        assert_eq!(current.text.as_deref(), Some("BootOrder"));
        assert_eq!(current.guid(), Some(FILE_GUID));
        assert_eq!(current.body, [0, 0, 1, 0]);

        let rebuilt: Vec<u8> = store.children.iter().flat_map(Node::to_bytes).collect();
        assert_eq!(rebuilt, store.body);
    }

    #[test]
    fn vss_store_must_fit() {
        let mut bytes = vss_store(&[], 0x100);
        bytes[4..8].copy_from_slice(&0x200u32.to_le_bytes());
        assert!(VssStoreDecoder.decode(&bytes).is_none());
        assert!(VssStoreDecoder.decode(&[0xFF; 0x100]).is_none());
    }

    #[test]
    fn vss_store_of_garbage_is_a_diagnostic() {
        let mut bytes = vss_store(&[], 0x40);
        bytes[vss::STORE_HEADER_SIZE..].fill(0x5C);
        let store = VssStoreDecoder.decode(&bytes).unwrap();
        assert!(store.has_diagnostic(DiagnosticKind::InconsistentLayout));
        assert_eq!(store.children[0].kind, NodeKind::Padding(PaddingType::Data));
    }
}
