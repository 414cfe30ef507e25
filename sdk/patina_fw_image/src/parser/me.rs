//! Intel Management Engine region: firmware version and `$FPT` flash partition table.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{format, string::String, vec, vec::Vec};
use scroll::{Pread, LE};

use super::image::padding;
use crate::{
    node::{DiagnosticKind, MeType, Node, NodeKind},
    pi::me,
    utils,
};

/// Splits an ME region into its partition table, the partitions it lists and the gaps between
/// them. A region without a partition table stays opaque.
pub(super) fn parse_me_region(region: &mut Node) {
    region.text = version(&region.body);
    let Some(table_offset) = fpt_offset(&region.body) else {
        log::debug!("ME region of {:#x} bytes has no partition table", region.body.len());
        return;
    };
    match partition_table(&region.body, table_offset) {
        Ok(children) => region.children = children,
        Err(message) => region.add_diagnostic(DiagnosticKind::MalformedHeader, message),
    }
}

fn fpt_offset(bytes: &[u8]) -> Option<usize> {
    let signature = me::FPT_SIGNATURE.to_le_bytes();
    [0, me::ROM_BYPASS_VECTOR_SIZE]
        .into_iter()
        .find(|offset| bytes.get(*offset..*offset + signature.len()) == Some(signature.as_slice()))
}

fn version(bytes: &[u8]) -> Option<String> {
    let position = bytes
        .windows(me::VERSION_SIGNATURE.len())
        .position(|window| window == me::VERSION_SIGNATURE || window == me::VERSION_SIGNATURE2)?;
    let version = bytes.pread_with::<me::Version>(position, LE).ok()?;
    Some(format!("version {}.{}.{}.{}", version.major, version.minor, version.bugfix, version.build))
}

fn partition_name(entry: &me::FptEntry) -> String {
    entry.name.iter().take_while(|byte| **byte != 0).map(|byte| char::from(*byte)).collect()
}

fn partition_table(bytes: &[u8], table_offset: usize) -> Result<Vec<Node>, String> {
    let header = bytes
        .pread_with::<me::FptHeader>(table_offset, LE)
        .map_err(|_| String::from("FPT header is truncated"))?;
    let header_end = table_offset + me::FPT_HEADER_SIZE;
    let table_end = (header.num_entries as usize)
        .checked_mul(me::FPT_ENTRY_SIZE)
        .and_then(|entries| entries.checked_add(header_end))
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| format!("{} FPT entries do not fit the region", header.num_entries))?;

    let mut table = Node::new(
        NodeKind::Me(MeType::PartitionTable),
        bytes[..header_end].to_vec(),
        bytes[header_end..table_end].to_vec(),
        Vec::new(),
        0,
    )
    .with_name("FPT partition table");
    table.text = Some(format!(
        "{} entries, FITC {}.{}.{}.{}",
        header.num_entries, header.fitc_major, header.fitc_minor, header.fitc_hotfix, header.fitc_build
    ));
    if utils::sum8(&bytes[table_offset..header_end]) != 0 {
        table.add_diagnostic(
            DiagnosticKind::ChecksumMismatch,
            format!("FPT header checksum {:02X} is invalid", header.checksum),
        );
    }

    let mut entries = Vec::new();
    for offset in (header_end..table_end).step_by(me::FPT_ENTRY_SIZE) {
        let entry = bytes.pread_with::<me::FptEntry>(offset, LE).map_err(|_| String::from("FPT entry is truncated"))?;
        if entry.is_present() {
            entries.push(entry);
        }
    }
    entries.sort_by_key(|entry| entry.offset);

    let mut partitions = Vec::new();
    let mut position = table_end;
    for entry in entries {
        let name = partition_name(&entry);
        let start = entry.offset as usize;
        if start < position {
            table.add_diagnostic(
                DiagnosticKind::InconsistentLayout,
                format!("partition {name} at {start:#x} overlaps the table or a previous partition, skipped"),
            );
            continue;
        }
        if start >= bytes.len() {
            table.add_diagnostic(
                DiagnosticKind::InconsistentLayout,
                format!("partition {name} at {start:#x} is outside the region, skipped"),
            );
            continue;
        }
        let mut end = start.saturating_add(entry.length as usize);
        if end > bytes.len() {
            table.add_diagnostic(
                DiagnosticKind::InconsistentLayout,
                format!("partition {name} is truncated from {:#x} to {:#x} bytes", entry.length, bytes.len() - start),
            );
            end = bytes.len();
        }
        if start > position {
            partitions.push(padding(&bytes[position..start], position));
        }
        let mut partition = Node::leaf(NodeKind::Me(MeType::Partition), &bytes[start..end], start).with_name(name);
        partition.text = Some(format!("type {:02X}", entry.partition_type()));
        partitions.push(partition);
        position = end;
    }
    if position < bytes.len() {
        partitions.push(padding(&bytes[position..], position));
    }
    log::debug!("FPT at {:#x} lists {} partitions", table_offset, header.num_entries);

    let mut children = vec![table];
    children.extend(partitions);
    Ok(children)
}
