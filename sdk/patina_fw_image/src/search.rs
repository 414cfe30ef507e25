//! Structural and byte-pattern search over a decoded image.
//!
//! Every node is searched after its children, over bytes no child occupies, so a match is found
//! once at the innermost node holding it. Hits are attributed to the nearest enclosing file:
//!
//! ```rust,ignore
//! let pattern = Pattern::from_hex("4D5A..00")?;
//! for hit in search::find_pattern(&image.root, &pattern, SearchScope::Body) {
//!     log::info!("{}", utils::guid_to_string(&hit.file));
//! }
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use core::ops::Range;
use r_efi::efi;

use crate::{
    node::{Node, NodeKind, NodePath},
    pi::ffs::section,
    utils, FirmwareImageError,
};

/// Which bytes of each node a pattern is matched against.
///
/// Leaves are matched on their header, body (decoded payload for decoded encapsulations) or all
/// three ranges. Nodes with children contribute their header outside `Body` and, outside `Header`,
/// the body bytes no child occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Header,
    Body,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Ascii,
    /// UTF-16LE, as used by user interface sections.
    Utf16,
}

/// A byte pattern with a per-nibble mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<u8>,
    masks: Vec<u8>,
    ignore_case: bool,
}

impl Pattern {
    /// Parses a hex string where `.` matches any nibble, e.g. `"4D5A..00"`. At least one nibble
    /// must be fixed.
    pub fn from_hex(text: &str) -> Result<Self, FirmwareImageError> {
        let (bytes, masks) = utils::parse_hex_pattern(text)?;
        if masks.iter().all(|mask| *mask == 0) {
            log::error!("pattern {} matches everywhere", text);
            Err(FirmwareImageError::InvalidParameter)?;
        }
        Ok(Self { bytes, masks, ignore_case: false })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FirmwareImageError> {
        if bytes.is_empty() {
            Err(FirmwareImageError::InvalidParameter)?;
        }
        Ok(Self { bytes: bytes.to_vec(), masks: alloc::vec![0xFF; bytes.len()], ignore_case: false })
    }

    /// Matches the on-disk form of `guid`.
    pub fn from_guid(guid: &efi::Guid) -> Self {
        Self { bytes: guid.as_bytes().to_vec(), masks: alloc::vec![0xFF; 16], ignore_case: false }
    }

    /// Matches `text` without a terminator. `ignore_case` folds ASCII letters only.
    pub fn from_text(text: &str, encoding: TextEncoding, ignore_case: bool) -> Result<Self, FirmwareImageError> {
        let bytes: Vec<u8> = match encoding {
            TextEncoding::Ascii => text.as_bytes().to_vec(),
            TextEncoding::Utf16 => text.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect(),
        };
        let mut pattern = Self::from_bytes(&bytes)?;
        pattern.ignore_case = ignore_case;
        Ok(pattern)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn matches_at(&self, haystack: &[u8], position: usize) -> bool {
        let Some(window) = haystack.get(position..position + self.len()) else {
            return false;
        };
        window.iter().zip(self.bytes.iter().zip(&self.masks)).all(|(byte, (expected, mask))| {
            if self.ignore_case {
                byte.to_ascii_lowercase() & mask == expected.to_ascii_lowercase() & mask
            } else {
                byte & mask == expected & mask
            }
        })
    }

    pub fn contains(&self, haystack: &[u8]) -> bool {
        haystack.len() >= self.len()
            && (0..=haystack.len() - self.len()).any(|position| self.matches_at(haystack, position))
    }

    /// Start positions of every match in `haystack`, overlapping matches included.
    pub fn find_in(&self, haystack: &[u8]) -> Vec<usize> {
        if self.is_empty() || haystack.len() < self.len() {
            return Vec::new();
        }
        (0..=haystack.len() - self.len()).filter(|position| self.matches_at(haystack, *position)).collect()
    }
}

/// A pattern match: the file it belongs to and, when it lies in a freeform subtype GUID section,
/// that section's GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchHit {
    pub file: efi::Guid,
    pub subtype: Option<efi::Guid>,
}

/// Paths of every node satisfying `predicate`, in pre-order. Subtrees of deleted files are not
/// visited.
pub fn find(root: &Node, predicate: impl Fn(&Node) -> bool) -> Vec<NodePath> {
    fn visit(node: &Node, path: &mut Vec<usize>, predicate: &dyn Fn(&Node) -> bool, found: &mut Vec<NodePath>) {
        if !node.is_live() {
            return;
        }
        if predicate(node) {
            found.push(NodePath::from(path.as_slice()));
        }
        for (index, child) in node.children.iter().enumerate() {
            path.push(index);
            visit(child, path, predicate, found);
            path.pop();
        }
    }
    let mut found = Vec::new();
    visit(root, &mut Vec::new(), &predicate, &mut found);
    found
}

/// Files, volumes and GUID-identified sections carrying `guid`.
pub fn find_by_guid(root: &Node, guid: &efi::Guid) -> Vec<NodePath> {
    find(root, |node| node.guid().as_ref() == Some(guid))
}

pub fn find_by_kind(root: &Node, kind: NodeKind) -> Vec<NodePath> {
    find(root, |node| node.kind == kind)
}

/// Distinct hits of `pattern`, in the order they are first reported.
pub fn find_pattern(root: &Node, pattern: &Pattern, scope: SearchScope) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    search_node(root, pattern, scope, None, None, &mut hits);
    log::debug!("{} distinct hits for a {}-byte pattern", hits.len(), pattern.len());
    hits
}

pub fn count_pattern(root: &Node, pattern: &Pattern, scope: SearchScope) -> usize {
    find_pattern(root, pattern, scope).len()
}

pub fn find_text(
    root: &Node,
    text: &str,
    encoding: TextEncoding,
    ignore_case: bool,
    scope: SearchScope,
) -> Result<Vec<SearchHit>, FirmwareImageError> {
    let pattern = Pattern::from_text(text, encoding, ignore_case)?;
    Ok(find_pattern(root, &pattern, scope))
}

fn search_node(
    node: &Node,
    pattern: &Pattern,
    scope: SearchScope,
    file: Option<efi::Guid>,
    subtype: Option<efi::Guid>,
    hits: &mut Vec<SearchHit>,
) {
    if !node.is_live() {
        return;
    }
    let (file, subtype) = match (node.file_data(), node.kind) {
        (Some(data), _) => (Some(data.name), None),
        (None, NodeKind::Section(section::r#type::FREEFORM_SUBTYPE_GUID)) => (file, node.guid()),
        _ => (file, subtype),
    };

    for child in &node.children {
        search_node(child, pattern, scope, file, subtype, hits);
    }

    let Some(file) = file else {
        return;
    };
    let hit = SearchHit { file, subtype };
    let found = if node.children.is_empty() {
        match scope {
            SearchScope::Header => pattern.contains(&node.header),
            SearchScope::Body => pattern.contains(node.payload()),
            SearchScope::All => {
                let mut all = node.header.clone();
                all.extend_from_slice(node.payload());
                all.extend_from_slice(&node.tail);
                pattern.contains(&all)
            }
        }
    } else {
        // Children cover their whole range; only the gaps between them belong to the container body.
        let header = scope != SearchScope::Body && pattern.contains(&node.header);
        header
            || (scope != SearchScope::Header
                && uncovered(node).any(|range| pattern.contains(&node.payload()[range])))
    };
    if found && !hits.contains(&hit) {
        hits.push(hit);
    }
}

/// Ranges of the payload of `node` outside every child.
fn uncovered(node: &Node) -> impl Iterator<Item = Range<usize>> + '_ {
    let end = node.payload().len();
    let mut children: Vec<Range<usize>> = node
        .children
        .iter()
        .map(|child| child.offset.min(end)..(child.offset + child.total_len()).min(end))
        .collect();
    children.sort_by_key(|range| range.start);
    let mut position = 0;
    children
        .into_iter()
        .chain(core::iter::once(end..end))
        .filter_map(move |child| {
            let gap = position..child.start.max(position);
            position = position.max(child.end);
            (!gap.is_empty()).then_some(gap)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        parser::tests::*,
        pi::ffs::{file, section::r#type},
        Parser,
    };
    use alloc::vec;

    fn image(files: &[Vec<u8>]) -> Node {
        Parser::new(&NoCodecs).parse(&volume(files, 0x200)).unwrap().root
    }

    #[test]
    fn hex_patterns_with_wildcards() {
        let pattern = Pattern::from_hex("4D5A..00").unwrap();
        assert_eq!(pattern.find_in(&[0x00, 0x4D, 0x5A, 0x90, 0x00, 0x4D, 0x5A]), [1]);
        let pattern = Pattern::from_hex("A.").unwrap();
        assert_eq!(pattern.find_in(&[0xA0, 0xB0, 0xAF]), [0, 2]);
        assert_eq!(Pattern::from_hex("4D5"), Err(FirmwareImageError::InvalidParameter));
        assert_eq!(Pattern::from_hex("...."), Err(FirmwareImageError::InvalidParameter));
        assert!(Pattern::from_hex("..0.").is_ok());
    }

    #[test]
    fn text_patterns() {
        let pattern = Pattern::from_text("shell", TextEncoding::Utf16, true).unwrap();
        let haystack: Vec<u8> = "EFI Shell".encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect();
        assert_eq!(pattern.find_in(&haystack), [8]);
        let pattern = Pattern::from_text("shell", TextEncoding::Ascii, false).unwrap();
        assert!(pattern.find_in(b"EFI Shell").is_empty());
        assert_eq!(Pattern::from_text("", TextEncoding::Ascii, false), Err(FirmwareImageError::InvalidParameter));
    }

    #[test]
    fn structural_queries() {
        let root = Parser::new(&NoCodecs).parse(&single_raw_file_volume(0x100)).unwrap().root;
        assert_eq!(find_by_kind(&root, NodeKind::Section(r#type::RAW)), [NodePath(vec![0, 0])]);
        assert_eq!(find_by_guid(&root, &FILE_GUID), [NodePath(vec![0])]);
        assert_eq!(find(&root, |node| node.kind.is_volume()), [NodePath::root()]);
    }

    #[test]
    fn match_is_reported_once_per_file() {
        let root = Parser::new(&NoCodecs).parse(&single_raw_file_volume(0x100)).unwrap().root;
        let pattern = Pattern::from_hex("A55AC33C").unwrap();
        assert_eq!(find_pattern(&root, &pattern, SearchScope::Body), [SearchHit { file: FILE_GUID, subtype: None }]);
        assert_eq!(count_pattern(&root, &pattern, SearchScope::All), 1);
        assert!(find_pattern(&root, &pattern, SearchScope::Header).is_empty());

        // Spanning the section header and body, only the section's own header and body hold it.
        let spanning = Pattern::from_hex("19A55A").unwrap();
        assert_eq!(count_pattern(&root, &spanning, SearchScope::Body), 0);
        assert_eq!(count_pattern(&root, &spanning, SearchScope::All), 1);

        // The zero fill after the section belongs to the file body.
        let fill = Pattern::from_hex("3C00000000").unwrap();
        assert_eq!(count_pattern(&root, &fill, SearchScope::Body), 0);
        let fill = Pattern::from_hex("00000000").unwrap();
        assert_eq!(count_pattern(&root, &fill, SearchScope::Body), 1);
    }

    #[test]
    fn section_headers_are_not_body() {
        let opaque = guid_defined_section(&crate::pi::guid::LZMA_SECTION_GUID, 1, &[], &[0x5D; 12]);
        let root = image(&[ffs_file(&FILE_GUID, file::r#type::FREEFORM, 0, &opaque)]);
        let definition = Pattern::from_guid(&crate::pi::guid::LZMA_SECTION_GUID);

        assert!(find_pattern(&root, &definition, SearchScope::Body).is_empty());
        assert_eq!(count_pattern(&root, &definition, SearchScope::Header), 1);
        assert_eq!(count_pattern(&root, &definition, SearchScope::All), 1);
    }

    #[test]
    fn header_scope_finds_file_names() {
        let root = image(&[
            ffs_file(&FILE_GUID, file::r#type::FREEFORM, 0, &section(r#type::RAW, &[0; 4])),
            ffs_file(&OTHER_FILE_GUID, file::r#type::FREEFORM, 0, &section(r#type::RAW, &[0; 4])),
        ]);
        let hits = find_pattern(&root, &Pattern::from_guid(&OTHER_FILE_GUID), SearchScope::Header);
        assert_eq!(hits, [SearchHit { file: OTHER_FILE_GUID, subtype: None }]);
    }

    #[test]
    fn deleted_files_are_skipped() {
        let mut deleted = ffs_file(&OTHER_FILE_GUID, file::r#type::FREEFORM, 0, &section(r#type::RAW, b"MAGIC..."));
        // DELETED is the highest set bit once inverted for erase polarity 1.
        deleted[file::STATE_OFFSET] = 0xE8;
        let live = ffs_file(&FILE_GUID, file::r#type::FREEFORM, 0, &section(r#type::RAW, b"MAGIC!!!"));
        let root = image(&[deleted, live]);

        let hits = find_text(&root, "MAGIC", TextEncoding::Ascii, false, SearchScope::Body).unwrap();
        assert_eq!(hits, [SearchHit { file: FILE_GUID, subtype: None }]);
        assert!(find_by_guid(&root, &OTHER_FILE_GUID).is_empty());
    }

    #[test]
    fn freeform_subtype_is_reported() {
        let mut body = OTHER_FILE_GUID.as_bytes().to_vec();
        body.extend_from_slice(b"payload!");
        let subtype_section = section(r#type::FREEFORM_SUBTYPE_GUID, &body);
        let root = image(&[ffs_file(&FILE_GUID, file::r#type::FREEFORM, 0, &subtype_section)]);

        let hits = find_text(&root, "payload", TextEncoding::Ascii, false, SearchScope::Body).unwrap();
        assert_eq!(hits, [SearchHit { file: FILE_GUID, subtype: Some(OTHER_FILE_GUID) }]);
    }
}
