//! Support for decoding, validating and rebuilding UEFI firmware images.
//!
//! This crate turns a raw firmware image (capsule, Intel flash image, BIOS
//! space or bare firmware volume) into a tree of [`node::Node`]s following the
//! Firmware Volume / FFS File / Section structure described in the UEFI
//! Platform Initialization Specification, Volume 3. The tree can be searched,
//! extracted from, edited and serialized back to bytes.
//!
//! Codecs for compressed and GUID-defined sections are not part of this crate;
//! they are supplied through the [`section::SectionExtractor`] and
//! [`section::SectionComposer`] traits.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod build;
pub mod config;
pub mod node;
pub mod parser;
pub mod patch;
pub mod pi;
pub mod search;
pub mod section;
pub mod utils;

pub use build::Builder;
pub use config::{BuildPolicy, ParseOptions};
pub use node::{FirmwareImage, Node, NodeKind, NodePath};
pub use parser::Parser;

use r_efi::efi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareImageError {
    /// A caller supplied argument is out of range or does not address a node.
    InvalidParameter,
    /// A signature, size or field is out of range.
    MalformedHeader,
    InvalidBlockMap,
    ChecksumMismatch,
    /// No codec is available for the encapsulation, or the codec failed.
    UnsupportedEncoding,
    RecursionLimitExceeded,
    DataCorrupt,
    NotFound,
    /// The insertion point cannot host the new subtree.
    IncompatibleKind,
    /// The result does not fit the size field of its header.
    SizeOverflow,
    /// Flash descriptor regions are read-only.
    FrozenRegion,
    ComposeFailed,
}

impl From<scroll::Error> for FirmwareImageError {
    fn from(_value: scroll::Error) -> Self {
        FirmwareImageError::MalformedHeader
    }
}

impl From<FirmwareImageError> for efi::Status {
    fn from(value: FirmwareImageError) -> Self {
        match value {
            FirmwareImageError::InvalidParameter | FirmwareImageError::IncompatibleKind => {
                efi::Status::INVALID_PARAMETER
            }
            FirmwareImageError::UnsupportedEncoding => efi::Status::UNSUPPORTED,
            FirmwareImageError::MalformedHeader
            | FirmwareImageError::InvalidBlockMap
            | FirmwareImageError::ChecksumMismatch
            | FirmwareImageError::RecursionLimitExceeded
            | FirmwareImageError::DataCorrupt => efi::Status::VOLUME_CORRUPTED,
            FirmwareImageError::NotFound => efi::Status::NOT_FOUND,
            FirmwareImageError::SizeOverflow => efi::Status::BAD_BUFFER_SIZE,
            FirmwareImageError::FrozenRegion => efi::Status::WRITE_PROTECTED,
            FirmwareImageError::ComposeFailed => efi::Status::DEVICE_ERROR,
        }
    }
}
