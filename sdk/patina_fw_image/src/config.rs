//! Parser and builder configuration.
//!
//! Both structures implement `Default`; platforms only override the knobs they care about:
//!
//! ```rust,ignore
//! let options = patina_fw_image::ParseOptions { max_depth: 8, ..Default::default() };
//! let policy = patina_fw_image::BuildPolicy {
//!     size_overflow: patina_fw_image::config::SizeOverflowPolicy::Promote,
//!     ..Default::default()
//! };
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Default: encapsulations nested deeper than this are left opaque.
pub const DEFAULT_MAX_DEPTH: usize = 16;
/// Default: malformed file headers tolerated per volume before the rest is treated as padding.
pub const DEFAULT_MAX_RESYNC_ATTEMPTS: usize = 64;
/// Default: RAW and ALL-type files are scanned for nested volumes.
pub const DEFAULT_PARSE_RAW_FILES: bool = true;
/// Default: padding and raw areas are offered to vendor decoders (e.g. microcode).
pub const DEFAULT_DECODE_VENDOR_AREAS: bool = true;

/// Controls how far and how aggressively an image is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Maximum nesting of volumes and encapsulation sections.
    pub max_depth: usize,
    /// Maximum number of 8-byte resynchronisations per volume.
    pub max_resync_attempts: usize,
    /// Parse RAW and ALL-type file bodies as BIOS space.
    pub parse_raw_files: bool,
    /// Run vendor decoders over padding and raw areas.
    pub decode_vendor_areas: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_resync_attempts: DEFAULT_MAX_RESYNC_ATTEMPTS,
            parse_raw_files: DEFAULT_PARSE_RAW_FILES,
            decode_vendor_areas: DEFAULT_DECODE_VENDOR_AREAS,
        }
    }
}

/// What to do when a rebuilt file or section no longer fits a 3-byte size field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeOverflowPolicy {
    #[default]
    Fail,
    /// Switch to the large file header (FFS3 volumes only) or the extended section header.
    Promote,
}

/// What to do when rebuilt files no longer fit in their volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeGrowthPolicy {
    #[default]
    Fail,
    /// Extend the volume by whole blocks. Only volumes that are not inside a region can grow.
    Grow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildPolicy {
    pub size_overflow: SizeOverflowPolicy,
    pub volume_growth: VolumeGrowthPolicy,
}
