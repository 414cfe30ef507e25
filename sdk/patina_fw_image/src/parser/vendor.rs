//! Pluggable decoders for vendor structures that live outside the FFS hierarchy.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::format;
use scroll::{Pread, LE};

use crate::{
    node::{DiagnosticKind, Node, NodeKind, ParsingData},
    pi::microcode,
};

/// Recognizes a vendor structure at the start of a padding or raw area.
///
/// A decoder returns `None` when the bytes are not its structure. Otherwise the returned node
/// covers exactly the bytes it consumed, starting at `bytes[0]`.
pub trait VendorDecoder {
    /// Candidate positions are multiples of this value.
    fn alignment(&self) -> usize;
    fn decode(&self, bytes: &[u8]) -> Option<Node>;
}

/// Intel microcode update.
#[derive(Debug, Default, Clone, Copy)]
pub struct MicrocodeDecoder;

fn is_bcd(value: u32) -> bool {
    let mut value = value;
    while value != 0 {
        if value & 0xF > 9 {
            return false;
        }
        value >>= 4;
    }
    true
}

impl VendorDecoder for MicrocodeDecoder {
    fn alignment(&self) -> usize {
        16
    }

    fn decode(&self, bytes: &[u8]) -> Option<Node> {
        let header = bytes.pread_with::<microcode::Header>(0, LE).ok()?;
        if header.header_version != microcode::HEADER_VERSION || header.loader_revision != microcode::LOADER_REVISION {
            return None;
        }
        if !is_bcd(header.date_year as u32)
            || !is_bcd(header.date_day as u32)
            || !is_bcd(header.date_month as u32)
            || !(0x01..=0x12).contains(&header.date_month)
            || !(0x01..=0x31).contains(&header.date_day)
            || header.date_year < 0x1990
        {
            return None;
        }
        if header.reserved.iter().any(|b| *b != 0) {
            return None;
        }

        let data_size = if header.data_size == 0 { microcode::DEFAULT_DATA_SIZE } else { header.data_size };
        let total_size =
            if header.total_size == 0 { data_size + microcode::HEADER_SIZE as u32 } else { header.total_size };
        if data_size % 4 != 0
            || total_size % 4 != 0
            || total_size > microcode::MAX_SIZE
            || (total_size as usize) < microcode::HEADER_SIZE + data_size as usize
            || total_size as usize > bytes.len()
        {
            return None;
        }

        let update = &bytes[..total_size as usize];
        let mut node = Node::new(
            NodeKind::Microcode,
            update[..microcode::HEADER_SIZE].to_vec(),
            update[microcode::HEADER_SIZE..].to_vec(),
            alloc::vec::Vec::new(),
            0,
        )
        .with_name("Intel microcode")
        .with_parsing_data(ParsingData::Microcode(header));
        node.text = Some(format!(
            "CPUID {:08X}, revision {:08X}, date {:02X}.{:02X}.{:04X}",
            header.processor_signature, header.update_revision, header.date_day, header.date_month, header.date_year
        ));

        let sum = update
            .chunks_exact(4)
            .fold(0u32, |sum, dword| sum.wrapping_add(u32::from_le_bytes([dword[0], dword[1], dword[2], dword[3]])));
        if sum != 0 {
            node.add_diagnostic(DiagnosticKind::ChecksumMismatch, format!("microcode dword sum is {sum:08X}"));
        }
        log::debug!("microcode update for CPUID {:08X}, {} bytes", header.processor_signature, total_size);
        Some(node)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::{vec, vec::Vec};

    /// A 1 KiB microcode update with a valid checksum.
    pub fn microcode_update(signature: u32) -> Vec<u8> {
        let total_size = 0x400u32;
        let mut bytes = vec![0u8; total_size as usize];
        bytes[0..4].copy_from_slice(&1u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&0x0000_00B4u32.to_le_bytes());
        bytes[8..10].copy_from_slice(&0x2019u16.to_le_bytes());
        bytes[10] = 0x25;
        bytes[11] = 0x11;
        bytes[12..16].copy_from_slice(&signature.to_le_bytes());
        bytes[20..24].copy_from_slice(&1u32.to_le_bytes());
        bytes[24] = 0x22;
        bytes[28..32].copy_from_slice(&(total_size - 48).to_le_bytes());
        bytes[32..36].copy_from_slice(&total_size.to_le_bytes());
        for (i, byte) in bytes[48..].iter_mut().enumerate() {
            *byte = i as u8;
        }
        let sum = bytes
            .chunks_exact(4)
            .fold(0u32, |sum, d| sum.wrapping_add(u32::from_le_bytes([d[0], d[1], d[2], d[3]])));
        bytes[16..20].copy_from_slice(&0u32.wrapping_sub(sum).to_le_bytes());
        bytes
    }

    #[test]
    fn microcode_is_recognized() {
        let mut bytes = microcode_update(0x000906EA);
        bytes.extend_from_slice(&[0xFF; 64]);
        let node = MicrocodeDecoder.decode(&bytes).unwrap();
        assert_eq!(node.kind, NodeKind::Microcode);
        assert_eq!(node.total_len(), 0x400);
        assert!(node.diagnostics.is_empty());
        assert_eq!(node.text.as_deref(), Some("CPUID 000906EA, revision 000000B4, date 25.11.2019"));
    }

    #[test]
    fn bad_microcode_checksum_is_a_diagnostic() {
        let mut bytes = microcode_update(0x000806EC);
        bytes[0x200] ^= 0x01;
        let node = MicrocodeDecoder.decode(&bytes).unwrap();
        assert!(node.has_diagnostic(DiagnosticKind::ChecksumMismatch));
    }

    #[test]
    fn other_data_is_not_microcode() {
        assert!(MicrocodeDecoder.decode(&[0xFF; 0x400]).is_none());
        let mut bytes = microcode_update(0x000806EC);
        bytes[10] = 0x1A;
        assert!(MicrocodeDecoder.decode(&bytes).is_none());
        let bytes = microcode_update(0x000806EC);
        assert!(MicrocodeDecoder.decode(&bytes[..0x200]).is_none());
    }
}
