//! Section codecs for [`patina_fw_image`].
//!
//! Each codec implements [`SectionExtractor`](patina_fw_image::section::SectionExtractor) for the
//! encapsulations it understands and returns
//! [`UnsupportedEncoding`](patina_fw_image::FirmwareImageError::UnsupportedEncoding) for anything
//! else. Codecs that can also encode implement
//! [`SectionComposer`](patina_fw_image::section::SectionComposer).
//! [`CompositeSectionExtractor`] chains every codec enabled by feature flags.
//!
//! | Feature           | Decodes                                         | Encodes |
//! |-------------------|-------------------------------------------------|---------|
//! | `crc32`           | CRC32 GUID-defined sections (verification)      | yes     |
//! | `uefi_decompress` | standard compression, Tiano GUID-defined        | no      |
//! | `brotli`          | Brotli GUID-defined sections                    | no      |
//! | `lzma`            | LZMA GUID-defined sections, customized compression | yes  |
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

mod composite;
mod null;

#[cfg(feature = "brotli")]
mod brotli;
#[cfg(feature = "crc32")]
mod crc32;
#[cfg(feature = "lzma")]
mod lzma;
#[cfg(feature = "uefi_decompress")]
mod uefi_decompress;

/// Largest payload a codec produces for one section.
pub const MAX_DECODED_SIZE: usize = 0x1000_0000;

/// Largest ratio between the decoded and encoded size of a section whose decoder needs its output
/// buffer allocated up front.
pub const MAX_EXPANSION_RATIO: usize = 1024;

/// Decoded size a section of `encoded_len` bytes may declare before anything is allocated.
#[cfg(any(feature = "lzma", feature = "uefi_decompress"))]
pub(crate) fn decoded_size_limit(encoded_len: usize) -> usize {
    encoded_len.saturating_mul(MAX_EXPANSION_RATIO).min(MAX_DECODED_SIZE)
}

pub use composite::CompositeSectionExtractor;
pub use null::NullSectionProcessor;

#[cfg(feature = "brotli")]
pub use brotli::BrotliSectionExtractor;
#[cfg(feature = "crc32")]
pub use crc32::Crc32SectionExtractor;
#[cfg(feature = "lzma")]
pub use lzma::LzmaSectionExtractor;
#[cfg(feature = "uefi_decompress")]
pub use uefi_decompress::UefiDecompressSectionExtractor;
