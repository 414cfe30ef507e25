//! Codec that handles no encapsulation at all.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use patina_fw_image::{
    section::{SectionComposer, SectionExtractor, SectionMetaData},
    FirmwareImageError,
};

/// Leaves every encoded section opaque. Parsing with it still walks uncompressed and
/// non-processing-required encapsulations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSectionProcessor;

impl SectionExtractor for NullSectionProcessor {
    fn extract(&self, _metadata: &SectionMetaData, _content: &[u8]) -> Result<Vec<u8>, FirmwareImageError> {
        Err(FirmwareImageError::UnsupportedEncoding)
    }
}

impl SectionComposer for NullSectionProcessor {
    fn compose(
        &self,
        _metadata: &SectionMetaData,
        _payload: &[u8],
    ) -> Result<(SectionMetaData, Vec<u8>), FirmwareImageError> {
        Err(FirmwareImageError::UnsupportedEncoding)
    }
}
