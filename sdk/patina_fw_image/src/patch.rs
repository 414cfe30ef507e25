//! Patch scripts: byte replacements applied to the sections of named files.
//!
//! A script has one entry per line. Blank lines and lines starting with `#` are skipped:
//!
//! ```text
//! # file GUID                          type  patches...
//! 8C8CE578-8A3D-4F1C-9935-896185C32DD3 10    P:0FBA6C2438:0FBA742438 O:1A0:90
//! ```
//!
//! The section type is hex. `P:find:replace` replaces every match of `find`, `O:offset:replace`
//! writes at a hex offset. In both, `.` in the replacement keeps the original nibble and `.` in
//! the find pattern matches any nibble.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use r_efi::efi;

use crate::{
    build::Builder,
    node::{FirmwareImage, Node, NodeKind, NodePath},
    search::Pattern,
    utils, FirmwareImageError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchKind {
    Offset(usize),
    Pattern(Pattern),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub kind: PatchKind,
    pub replace: Vec<u8>,
    /// Per-nibble mask of `replace`; cleared nibbles keep the original data.
    pub replace_mask: Vec<u8>,
}

impl Patch {
    /// Applies the patch to a copy of `data`.
    ///
    /// A replacement that would run past the end of `data` fails with
    /// [`FirmwareImageError::InvalidParameter`].
    pub fn apply(&self, data: &[u8]) -> Result<Vec<u8>, FirmwareImageError> {
        let mut patched = data.to_vec();
        match &self.kind {
            PatchKind::Offset(offset) => self.write_at(&mut patched, *offset)?,
            PatchKind::Pattern(find) => {
                for position in find.find_in(data) {
                    self.write_at(&mut patched, position)?;
                }
            }
        }
        Ok(patched)
    }

    fn write_at(&self, data: &mut [u8], offset: usize) -> Result<(), FirmwareImageError> {
        let end = offset.checked_add(self.replace.len()).ok_or(FirmwareImageError::InvalidParameter)?;
        let target = data.get_mut(offset..end).ok_or_else(|| {
            log::error!("patch at {:#x} of {:#x} bytes is out of bounds", offset, self.replace.len());
            FirmwareImageError::InvalidParameter
        })?;
        for (byte, (replace, mask)) in target.iter_mut().zip(self.replace.iter().zip(&self.replace_mask)) {
            *byte = (*byte & !mask) | (replace & mask);
        }
        Ok(())
    }
}

/// All patches for the sections of one type inside one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEntry {
    pub file_guid: efi::Guid,
    pub section_type: u8,
    pub patches: Vec<Patch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Number of sections whose content changed.
    Patched(usize),
    NothingToPatch,
}

/// Parses a patch script. Lines with fewer than three fields and patches of unknown type are
/// skipped; malformed GUIDs, section types and hex strings are errors.
pub fn parse_script(script: &str) -> Result<Vec<PatchEntry>, FirmwareImageError> {
    let mut entries = Vec::new();
    for (number, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            log::debug!("patch line {} has no patches", number + 1);
            continue;
        }
        let entry = parse_entry(&fields).inspect_err(|err| log::error!("patch line {}: {:?}", number + 1, err))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn parse_entry(fields: &[&str]) -> Result<PatchEntry, FirmwareImageError> {
    let file_guid = utils::string_to_guid(fields[0])?;
    let section_type = u8::from_str_radix(fields[1], 16).map_err(|_| FirmwareImageError::InvalidParameter)?;
    let mut patches = Vec::new();
    for field in &fields[2..] {
        let parts: Vec<&str> = field.split(':').collect();
        let [kind, location, replace] = parts.as_slice() else {
            return Err(FirmwareImageError::InvalidParameter);
        };
        let kind = match *kind {
            "P" => PatchKind::Pattern(Pattern::from_hex(location)?),
            "O" => PatchKind::Offset(
                usize::from_str_radix(location, 16).map_err(|_| FirmwareImageError::InvalidParameter)?,
            ),
            other => {
                log::warn!("unknown patch type {:?} ignored", other);
                continue;
            }
        };
        let (replace, replace_mask) = utils::parse_hex_pattern(replace)?;
        patches.push(Patch { kind, replace, replace_mask });
    }
    Ok(PatchEntry { file_guid, section_type, patches })
}

/// Sections of `section_type` whose nearest enclosing live file is named `file_guid`.
fn matching_sections(root: &Node, file_guid: &efi::Guid, section_type: u8) -> Vec<NodePath> {
    fn visit(node: &Node, path: &mut Vec<usize>, in_file: bool, entry: (&efi::Guid, u8), out: &mut Vec<NodePath>) {
        if !node.is_live() {
            return;
        }
        let in_file = match node.file_data() {
            Some(file) => file.name == *entry.0,
            None => in_file,
        };
        if in_file && node.kind == NodeKind::Section(entry.1) {
            out.push(NodePath(path.clone()));
        }
        for (index, child) in node.children.iter().enumerate() {
            path.push(index);
            visit(child, path, in_file, entry, out);
            path.pop();
        }
    }
    let mut paths = Vec::new();
    visit(root, &mut Vec::new(), false, (file_guid, section_type), &mut paths);
    paths
}

/// Applies every entry to `image` and rebuilds the edited sections.
///
/// Nested matches are patched innermost first so that the enclosing payload includes the inner
/// changes. The image is left untouched by a failing patch.
pub fn apply(
    builder: &Builder,
    image: &mut FirmwareImage,
    entries: &[PatchEntry],
) -> Result<PatchOutcome, FirmwareImageError> {
    let mut patched_image = image.clone();
    let mut count = 0;
    for entry in entries {
        let mut paths = matching_sections(&patched_image.root, &entry.file_guid, entry.section_type);
        paths.sort_by_key(|path| core::cmp::Reverse(path.depth()));
        for path in paths {
            let node = patched_image.node(&path).ok_or(FirmwareImageError::NotFound)?;
            let original = node.payload();
            let mut payload = original.to_vec();
            for patch in &entry.patches {
                payload = patch.apply(&payload)?;
            }
            if payload != original {
                builder.replace_payload(&mut patched_image, &path, payload)?;
                log::info!("patched section {} of file {}", path, utils::guid_to_string(&entry.file_guid));
                count += 1;
            }
        }
    }
    if count == 0 {
        log::info!("nothing to patch");
        return Ok(PatchOutcome::NothingToPatch);
    }
    *image = patched_image;
    Ok(PatchOutcome::Patched(count))
}
