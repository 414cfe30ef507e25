//! On-disk structures used by firmware images.
//!
//! Layouts follow the UEFI Platform Initialization Specification, Volume 3
//! (firmware volumes, FFS files and sections) plus the capsule, Intel flash
//! descriptor and Intel microcode headers found at the root of vendor images.
//! Every structure is read with `scroll` so that truncated input is reported
//! as an error instead of an out-of-bounds access.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use r_efi::efi;
use scroll::{ctx, Endian, Pread, Pwrite};

/// Reads a GUID in its on-disk (mixed-endian) byte layout.
pub(crate) fn gread_guid(src: &[u8], offset: &mut usize) -> Result<efi::Guid, scroll::Error> {
    let bytes: &[u8] = src.gread_with(offset, 16)?;
    let mut raw = [0u8; 16];
    raw.copy_from_slice(bytes);
    Ok(efi::Guid::from_bytes(&raw))
}

pub mod guid {
    use r_efi::efi;

    pub const EFI_FIRMWARE_FILE_SYSTEM_GUID: efi::Guid =
        efi::Guid::from_fields(0x7A9354D9, 0x0468, 0x444A, 0x81, 0xCE, &[0x0B, 0xF6, 0x17, 0xD8, 0x90, 0xDF]);
    pub const EFI_FIRMWARE_FILE_SYSTEM2_GUID: efi::Guid =
        efi::Guid::from_fields(0x8C8CE578, 0x8A3D, 0x4F1C, 0x99, 0x35, &[0x89, 0x61, 0x85, 0xC3, 0x2D, 0xD3]);
    pub const EFI_FIRMWARE_FILE_SYSTEM3_GUID: efi::Guid =
        efi::Guid::from_fields(0x5473C07A, 0x3DCB, 0x4DCA, 0xBD, 0x6F, &[0x1E, 0x96, 0x89, 0xE7, 0x34, 0x9A]);
    pub const EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM_GUID: efi::Guid =
        efi::Guid::from_fields(0x04ADEEAD, 0x61FF, 0x4D31, 0xB6, 0xBA, &[0x64, 0xF8, 0xBF, 0x90, 0x1F, 0x5A]);

    pub const EFI_FFS_VOLUME_TOP_FILE_GUID: efi::Guid =
        efi::Guid::from_fields(0x1BA0062E, 0xC779, 0x4582, 0x85, 0x66, &[0x33, 0x6A, 0xE8, 0xF7, 0x8F, 0x09]);
    pub const EFI_FFS_PAD_FILE_GUID: efi::Guid =
        efi::Guid::from_fields(0xE4536585, 0x7909, 0x4A60, 0xB5, 0xC6, &[0xEC, 0xDE, 0xA6, 0xEB, 0xFB, 0x54]);

    pub const CRC32_SECTION_GUID: efi::Guid =
        efi::Guid::from_fields(0xFC1BCDB0, 0x7D31, 0x49AA, 0x93, 0x6A, &[0xA4, 0x60, 0x0D, 0x9D, 0xD0, 0x83]);
    pub const TIANO_DECOMPRESS_SECTION_GUID: efi::Guid =
        efi::Guid::from_fields(0xA31280AD, 0x481E, 0x41B6, 0x95, 0xE8, &[0x12, 0x7F, 0x4C, 0x98, 0x47, 0x79]);
    pub const LZMA_SECTION_GUID: efi::Guid =
        efi::Guid::from_fields(0xEE4E5898, 0x3914, 0x4259, 0x9D, 0x6E, &[0xDC, 0x7B, 0xD7, 0x94, 0x03, 0xCF]);
    pub const LZMA_F86_SECTION_GUID: efi::Guid =
        efi::Guid::from_fields(0xD42AE6BD, 0x1352, 0x4BFB, 0x90, 0x9A, &[0xCA, 0x72, 0xA6, 0xEA, 0xE8, 0x89]);
    pub const BROTLI_SECTION_GUID: efi::Guid =
        efi::Guid::from_fields(0x3D532050, 0x5CDA, 0x4FD0, 0x87, 0x9E, &[0x0F, 0x7F, 0x63, 0x0D, 0x5A, 0xFB]);
    pub const GZIP_SECTION_GUID: efi::Guid =
        efi::Guid::from_fields(0x1D301FE9, 0xBE79, 0x4353, 0x91, 0xC2, &[0xD2, 0x3B, 0xC9, 0x59, 0xAE, 0x0C]);
    pub const FIRMWARE_CONTENTS_SIGNED_GUID: efi::Guid =
        efi::Guid::from_fields(0x0F9D89E8, 0x9259, 0x4F76, 0xA5, 0xAF, &[0x0C, 0x89, 0xE3, 0x40, 0x23, 0xDF]);

    pub const NVRAM_MAIN_STORE_VOLUME_GUID: efi::Guid =
        efi::Guid::from_fields(0xFFF12B8D, 0x7696, 0x4C8B, 0xA9, 0x85, &[0x27, 0x47, 0x07, 0x5B, 0x4F, 0x50]);
    pub const NVRAM_ADDITIONAL_STORE_VOLUME_GUID: efi::Guid =
        efi::Guid::from_fields(0x00504624, 0x8A59, 0x4EEB, 0xBD, 0x0F, &[0x6B, 0x36, 0xE9, 0x61, 0x28, 0xE0]);
    pub const NVRAM_NVAR_STORE_FILE_GUID: efi::Guid =
        efi::Guid::from_fields(0xCEF5B9A3, 0x476D, 0x497F, 0x9F, 0xDC, &[0xE9, 0x81, 0x43, 0xE0, 0x42, 0x2C]);

    pub const EFI_CAPSULE_GUID: efi::Guid =
        efi::Guid::from_fields(0x3B6686BD, 0x0D76, 0x4030, 0xB7, 0x0E, &[0xB5, 0x51, 0x9E, 0x2F, 0xC5, 0xA0]);
    pub const EFI_FMP_CAPSULE_GUID: efi::Guid =
        efi::Guid::from_fields(0x6DCBD5ED, 0xE82D, 0x4C44, 0xBD, 0xA1, &[0x71, 0x94, 0x19, 0x9A, 0xD9, 0x2A]);
    pub const INTEL_CAPSULE_GUID: efi::Guid = efi::Guid::from_bytes(&[
        0xB9, 0x82, 0x91, 0x53, 0xB5, 0xAB, 0x91, 0x43, 0xB6, 0x9A, 0xE3, 0xA9, 0x43, 0xF7, 0x2F, 0xCC,
    ]);
    pub const LENOVO_CAPSULE_GUID: efi::Guid = efi::Guid::from_bytes(&[
        0xD3, 0xAF, 0x0B, 0xE2, 0x14, 0x99, 0x4F, 0x4F, 0x95, 0x37, 0x31, 0x29, 0xE0, 0x90, 0xEB, 0x3C,
    ]);
    pub const LENOVO2_CAPSULE_GUID: efi::Guid = efi::Guid::from_bytes(&[
        0x76, 0xFE, 0xB5, 0x25, 0x43, 0x82, 0x5C, 0x4A, 0xA9, 0xBD, 0x7E, 0xE3, 0x24, 0x61, 0x98, 0xB5,
    ]);
    pub const TOSHIBA_CAPSULE_GUID: efi::Guid = efi::Guid::from_bytes(&[
        0x62, 0x70, 0xE0, 0x3B, 0x51, 0x1D, 0xD2, 0x45, 0x83, 0x2B, 0xF0, 0x93, 0x25, 0x7E, 0xD4, 0x61,
    ]);
    pub const APTIO_SIGNED_CAPSULE_GUID: efi::Guid = efi::Guid::from_bytes(&[
        0x8B, 0xA6, 0x3C, 0x4A, 0x23, 0x77, 0xFB, 0x48, 0x80, 0x3D, 0x57, 0x8C, 0xC1, 0xFE, 0xC4, 0x4D,
    ]);
    pub const APTIO_UNSIGNED_CAPSULE_GUID: efi::Guid = efi::Guid::from_bytes(&[
        0x90, 0xBB, 0xEE, 0x14, 0x0A, 0x89, 0xDB, 0x43, 0xAE, 0xD1, 0x5D, 0x3C, 0x45, 0x88, 0xA4, 0x18,
    ]);
}

pub mod fv {
    use super::*;

    pub const SIGNATURE: u32 = u32::from_le_bytes(*b"_FVH");
    /// Offset of the signature from the start of the volume header.
    pub const SIGNATURE_OFFSET: usize = 0x28;
    /// Size of the fixed header, not counting the block map.
    pub const HEADER_SIZE: usize = 56;
    pub const BLOCK_MAP_ENTRY_SIZE: usize = 8;
    pub const EXT_HEADER_SIZE: usize = 20;

    pub const FV_LENGTH_OFFSET: usize = 32;
    pub const CHECKSUM_OFFSET: usize = 50;

    pub mod attributes {
        pub const ERASE_POLARITY: u32 = 0x0000_0800;
        /// Revision 2 alignment field, a power of two exponent.
        pub const ALIGNMENT: u32 = 0x001F_0000;
        pub const ALIGNMENT_SHIFT: u32 = 16;
        /// Revision 1 alignment capability bit.
        pub const ALIGNMENT_CAP: u32 = 0x0000_8000;
        /// Revision 1 alignment bits for 2 bytes through 64 KiB, lowest first.
        pub const ALIGNMENT_2: u32 = 0x0001_0000;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Header {
        pub zero_vector: [u8; 16],
        pub file_system_guid: efi::Guid,
        pub fv_length: u64,
        pub signature: u32,
        pub attributes: u32,
        pub header_length: u16,
        pub checksum: u16,
        pub ext_header_offset: u16,
        pub reserved: u8,
        pub revision: u8,
    }

    impl<'a> ctx::TryFromCtx<'a, Endian> for Header {
        type Error = scroll::Error;

        fn try_from_ctx(src: &'a [u8], ctx: Endian) -> Result<(Self, usize), Self::Error> {
            let mut offset = 0;
            let zero: &[u8] = src.gread_with(&mut offset, 16)?;
            let mut zero_vector = [0u8; 16];
            zero_vector.copy_from_slice(zero);
            let file_system_guid = gread_guid(src, &mut offset)?;
            let header = Header {
                zero_vector,
                file_system_guid,
                fv_length: src.gread_with(&mut offset, ctx)?,
                signature: src.gread_with(&mut offset, ctx)?,
                attributes: src.gread_with(&mut offset, ctx)?,
                header_length: src.gread_with(&mut offset, ctx)?,
                checksum: src.gread_with(&mut offset, ctx)?,
                ext_header_offset: src.gread_with(&mut offset, ctx)?,
                reserved: src.gread_with(&mut offset, ctx)?,
                revision: src.gread_with(&mut offset, ctx)?,
            };
            Ok((header, offset))
        }
    }

    impl ctx::TryIntoCtx<Endian> for Header {
        type Error = scroll::Error;

        fn try_into_ctx(self, dest: &mut [u8], ctx: Endian) -> Result<usize, Self::Error> {
            let mut offset = 0;
            dest.gwrite_with(self.zero_vector.as_slice(), &mut offset, ())?;
            dest.gwrite_with(self.file_system_guid.as_bytes().as_slice(), &mut offset, ())?;
            dest.gwrite_with(self.fv_length, &mut offset, ctx)?;
            dest.gwrite_with(self.signature, &mut offset, ctx)?;
            dest.gwrite_with(self.attributes, &mut offset, ctx)?;
            dest.gwrite_with(self.header_length, &mut offset, ctx)?;
            dest.gwrite_with(self.checksum, &mut offset, ctx)?;
            dest.gwrite_with(self.ext_header_offset, &mut offset, ctx)?;
            dest.gwrite_with(self.reserved, &mut offset, ctx)?;
            dest.gwrite_with(self.revision, &mut offset, ctx)?;
            Ok(offset)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
    pub struct BlockMapEntry {
        pub num_blocks: u32,
        pub length: u32,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtHeader {
        pub fv_name: efi::Guid,
        pub ext_header_size: u32,
    }

    impl<'a> ctx::TryFromCtx<'a, Endian> for ExtHeader {
        type Error = scroll::Error;

        fn try_from_ctx(src: &'a [u8], ctx: Endian) -> Result<(Self, usize), Self::Error> {
            let mut offset = 0;
            let fv_name = gread_guid(src, &mut offset)?;
            let ext_header_size = src.gread_with(&mut offset, ctx)?;
            Ok((ExtHeader { fv_name, ext_header_size }, offset))
        }
    }
}

pub mod ffs {
    pub mod file {
        use super::super::*;

        pub const HEADER_SIZE: usize = 24;
        pub const HEADER2_SIZE: usize = 32;
        pub const MAX_SIZE: usize = 0x00FF_FFFF;
        pub const TAIL_SIZE: usize = 2;

        pub const INTEGRITY_CHECK_HEADER_OFFSET: usize = 16;
        pub const INTEGRITY_CHECK_FILE_OFFSET: usize = 17;
        pub const SIZE_OFFSET: usize = 20;
        pub const STATE_OFFSET: usize = 23;
        pub const EXTENDED_SIZE_OFFSET: usize = 24;

        /// Fixed file checksum used when `CHECKSUM` is clear, revision 2 volumes.
        pub const FIXED_CHECKSUM: u8 = 0xAA;
        /// Fixed file checksum used when `CHECKSUM` is clear, revision 1 volumes.
        pub const FIXED_CHECKSUM_REVISION1: u8 = 0x5A;

        pub mod attributes {
            pub const LARGE_FILE: u8 = 0x01;
            pub const TAIL_PRESENT: u8 = 0x01;
            pub const DATA_ALIGNMENT_2: u8 = 0x02;
            pub const RECOVERY: u8 = 0x02;
            pub const FIXED: u8 = 0x04;
            pub const DATA_ALIGNMENT: u8 = 0x38;
            pub const CHECKSUM: u8 = 0x40;
        }

        /// Power of two exponents selected by the `DATA_ALIGNMENT` bits.
        pub const ALIGNMENT_TABLE: [u8; 8] = [0, 4, 7, 9, 10, 12, 15, 16];
        /// Exponents used instead when `DATA_ALIGNMENT_2` is set in an FFS3 volume.
        pub const ALIGNMENT2_TABLE: [u8; 8] = [17, 18, 19, 20, 21, 22, 23, 24];

        pub mod state {
            pub const HEADER_CONSTRUCTION: u8 = 0x01;
            pub const HEADER_VALID: u8 = 0x02;
            pub const DATA_VALID: u8 = 0x04;
            pub const MARKED_FOR_UPDATE: u8 = 0x08;
            pub const DELETED: u8 = 0x10;
            pub const HEADER_INVALID: u8 = 0x20;
            pub const ERASE_POLARITY: u8 = 0x80;
        }

        pub mod r#type {
            pub const ALL: u8 = 0x00;
            pub const RAW: u8 = 0x01;
            pub const FREEFORM: u8 = 0x02;
            pub const SECURITY_CORE: u8 = 0x03;
            pub const PEI_CORE: u8 = 0x04;
            pub const DXE_CORE: u8 = 0x05;
            pub const PEIM: u8 = 0x06;
            pub const DRIVER: u8 = 0x07;
            pub const COMBINED_PEIM_DRIVER: u8 = 0x08;
            pub const APPLICATION: u8 = 0x09;
            pub const MM: u8 = 0x0A;
            pub const FIRMWARE_VOLUME_IMAGE: u8 = 0x0B;
            pub const COMBINED_MM_DXE: u8 = 0x0C;
            pub const MM_CORE: u8 = 0x0D;
            pub const MM_STANDALONE: u8 = 0x0E;
            pub const MM_CORE_STANDALONE: u8 = 0x0F;
            pub const OEM_MIN: u8 = 0xC0;
            pub const DEBUG_MIN: u8 = 0xE0;
            pub const FFS_MIN: u8 = 0xF0;
            pub const PAD: u8 = 0xF0;
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct Header {
            pub name: efi::Guid,
            pub integrity_check_header: u8,
            pub integrity_check_file: u8,
            pub file_type: u8,
            pub attributes: u8,
            pub size: [u8; 3],
            pub state: u8,
        }

        impl<'a> ctx::TryFromCtx<'a, Endian> for Header {
            type Error = scroll::Error;

            fn try_from_ctx(src: &'a [u8], ctx: Endian) -> Result<(Self, usize), Self::Error> {
                let mut offset = 0;
                let name = gread_guid(src, &mut offset)?;
                let integrity_check_header = src.gread_with(&mut offset, ctx)?;
                let integrity_check_file = src.gread_with(&mut offset, ctx)?;
                let file_type = src.gread_with(&mut offset, ctx)?;
                let attributes = src.gread_with(&mut offset, ctx)?;
                let size: &[u8] = src.gread_with(&mut offset, 3)?;
                let state = src.gread_with(&mut offset, ctx)?;
                let header = Header {
                    name,
                    integrity_check_header,
                    integrity_check_file,
                    file_type,
                    attributes,
                    size: [size[0], size[1], size[2]],
                    state,
                };
                Ok((header, offset))
            }
        }

        impl ctx::TryIntoCtx<Endian> for Header {
            type Error = scroll::Error;

            fn try_into_ctx(self, dest: &mut [u8], ctx: Endian) -> Result<usize, Self::Error> {
                let mut offset = 0;
                dest.gwrite_with(self.name.as_bytes().as_slice(), &mut offset, ())?;
                dest.gwrite_with(self.integrity_check_header, &mut offset, ctx)?;
                dest.gwrite_with(self.integrity_check_file, &mut offset, ctx)?;
                dest.gwrite_with(self.file_type, &mut offset, ctx)?;
                dest.gwrite_with(self.attributes, &mut offset, ctx)?;
                dest.gwrite_with(self.size.as_slice(), &mut offset, ())?;
                dest.gwrite_with(self.state, &mut offset, ctx)?;
                Ok(offset)
            }
        }
    }

    pub mod section {
        use super::super::*;

        pub const COMMON_HEADER_SIZE: usize = 4;
        pub const EXTENDED_HEADER_SIZE: usize = 8;

        pub mod r#type {
            pub const ALL: u8 = 0x00;
            pub const COMPRESSION: u8 = 0x01;
            pub const GUID_DEFINED: u8 = 0x02;
            pub const DISPOSABLE: u8 = 0x03;
            pub const PE32: u8 = 0x10;
            pub const PIC: u8 = 0x11;
            pub const TE: u8 = 0x12;
            pub const DXE_DEPEX: u8 = 0x13;
            pub const VERSION: u8 = 0x14;
            pub const USER_INTERFACE: u8 = 0x15;
            pub const COMPATIBILITY16: u8 = 0x16;
            pub const FIRMWARE_VOLUME_IMAGE: u8 = 0x17;
            pub const FREEFORM_SUBTYPE_GUID: u8 = 0x18;
            pub const RAW: u8 = 0x19;
            pub const PEI_DEPEX: u8 = 0x1B;
            pub const MM_DEPEX: u8 = 0x1C;
            pub const INSYDE_POSTCODE: u8 = 0x20;
            pub const SCT_POSTCODE: u8 = 0xF0;
        }

        pub mod compression {
            pub const HEADER_SIZE: usize = 5;
            pub const NOT_COMPRESSED: u8 = 0x00;
            pub const STANDARD_COMPRESSION: u8 = 0x01;
            pub const CUSTOMIZED_COMPRESSION: u8 = 0x02;
        }

        pub mod guid_defined {
            pub const HEADER_SIZE: usize = 20;
            pub const PROCESSING_REQUIRED: u16 = 0x01;
            pub const AUTH_STATUS_VALID: u16 = 0x02;
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct CommonHeader {
            pub size: [u8; 3],
            pub section_type: u8,
        }

        impl<'a> ctx::TryFromCtx<'a, Endian> for CommonHeader {
            type Error = scroll::Error;

            fn try_from_ctx(src: &'a [u8], ctx: Endian) -> Result<(Self, usize), Self::Error> {
                let mut offset = 0;
                let size: &[u8] = src.gread_with(&mut offset, 3)?;
                let section_type = src.gread_with(&mut offset, ctx)?;
                Ok((CommonHeader { size: [size[0], size[1], size[2]], section_type }, offset))
            }
        }

        impl ctx::TryIntoCtx<Endian> for CommonHeader {
            type Error = scroll::Error;

            fn try_into_ctx(self, dest: &mut [u8], ctx: Endian) -> Result<usize, Self::Error> {
                let mut offset = 0;
                dest.gwrite_with(self.size.as_slice(), &mut offset, ())?;
                dest.gwrite_with(self.section_type, &mut offset, ctx)?;
                Ok(offset)
            }
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
        pub struct Compression {
            pub uncompressed_length: u32,
            pub compression_type: u8,
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct GuidDefined {
            pub section_definition_guid: efi::Guid,
            pub data_offset: u16,
            pub attributes: u16,
        }

        impl<'a> ctx::TryFromCtx<'a, Endian> for GuidDefined {
            type Error = scroll::Error;

            fn try_from_ctx(src: &'a [u8], ctx: Endian) -> Result<(Self, usize), Self::Error> {
                let mut offset = 0;
                let section_definition_guid = gread_guid(src, &mut offset)?;
                let data_offset = src.gread_with(&mut offset, ctx)?;
                let attributes = src.gread_with(&mut offset, ctx)?;
                Ok((GuidDefined { section_definition_guid, data_offset, attributes }, offset))
            }
        }
    }
}

pub mod capsule {
    use super::*;

    pub const HEADER_SIZE: usize = 28;
    pub const IMAGE_SIZE_OFFSET: usize = 24;
    pub const APTIO_HEADER_SIZE: usize = 32;
    pub const TOSHIBA_HEADER_SIZE: usize = 28;
    pub const TOSHIBA_FULL_SIZE_OFFSET: usize = 20;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Header {
        pub capsule_guid: efi::Guid,
        pub header_size: u32,
        pub flags: u32,
        pub capsule_image_size: u32,
    }

    impl<'a> ctx::TryFromCtx<'a, Endian> for Header {
        type Error = scroll::Error;

        fn try_from_ctx(src: &'a [u8], ctx: Endian) -> Result<(Self, usize), Self::Error> {
            let mut offset = 0;
            let capsule_guid = gread_guid(src, &mut offset)?;
            let header = Header {
                capsule_guid,
                header_size: src.gread_with(&mut offset, ctx)?,
                flags: src.gread_with(&mut offset, ctx)?,
                capsule_image_size: src.gread_with(&mut offset, ctx)?,
            };
            Ok((header, offset))
        }
    }

    impl ctx::TryIntoCtx<Endian> for Header {
        type Error = scroll::Error;

        fn try_into_ctx(self, dest: &mut [u8], ctx: Endian) -> Result<usize, Self::Error> {
            let mut offset = 0;
            dest.gwrite_with(self.capsule_guid.as_bytes().as_slice(), &mut offset, ())?;
            dest.gwrite_with(self.header_size, &mut offset, ctx)?;
            dest.gwrite_with(self.flags, &mut offset, ctx)?;
            dest.gwrite_with(self.capsule_image_size, &mut offset, ctx)?;
            Ok(offset)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ToshibaHeader {
        pub capsule_guid: efi::Guid,
        pub header_size: u32,
        pub full_size: u32,
        pub flags: u32,
    }

    impl<'a> ctx::TryFromCtx<'a, Endian> for ToshibaHeader {
        type Error = scroll::Error;

        fn try_from_ctx(src: &'a [u8], ctx: Endian) -> Result<(Self, usize), Self::Error> {
            let mut offset = 0;
            let capsule_guid = gread_guid(src, &mut offset)?;
            let header = ToshibaHeader {
                capsule_guid,
                header_size: src.gread_with(&mut offset, ctx)?,
                full_size: src.gread_with(&mut offset, ctx)?,
                flags: src.gread_with(&mut offset, ctx)?,
            };
            Ok((header, offset))
        }
    }

    /// AMI Aptio capsule: an EFI capsule header followed by the ROM image and layout offsets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AptioHeader {
        pub capsule: Header,
        pub rom_image_offset: u16,
        pub rom_layout_offset: u16,
    }

    impl<'a> ctx::TryFromCtx<'a, Endian> for AptioHeader {
        type Error = scroll::Error;

        fn try_from_ctx(src: &'a [u8], ctx: Endian) -> Result<(Self, usize), Self::Error> {
            let mut offset = 0;
            let capsule = src.gread_with::<Header>(&mut offset, ctx)?;
            let rom_image_offset = src.gread_with(&mut offset, ctx)?;
            let rom_layout_offset = src.gread_with(&mut offset, ctx)?;
            Ok((AptioHeader { capsule, rom_image_offset, rom_layout_offset }, offset))
        }
    }
}

pub mod descriptor {
    use super::*;

    pub const SIGNATURE: u32 = 0x0FF0_A55A;
    pub const SIGNATURE_OFFSET: usize = 16;
    pub const MAP_OFFSET: usize = 20;
    pub const DESCRIPTOR_SIZE: usize = 0x1000;
    /// Region base and limit registers hold bits 12 and up of the flash address.
    pub const REGION_GRANULARITY: usize = 0x1000;
    /// Map base fields hold bits 4 to 11 of the descriptor address.
    pub const MAP_BASE_GRANULARITY: usize = 0x10;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
    pub struct Map {
        pub component_base: u8,
        pub number_of_flash_chips: u8,
        pub region_base: u8,
        pub number_of_regions: u8,
        pub master_base: u8,
        pub number_of_masters: u8,
        pub pch_straps_base: u8,
        pub number_of_pch_straps: u8,
        pub proc_straps_base: u8,
        pub number_of_proc_straps: u8,
        pub icc_table_base: u8,
        pub number_of_icc_table_entries: u8,
        pub dmi_table_base: u8,
        pub number_of_dmi_table_entries: u8,
        pub reserved_zero: u16,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
    pub struct RegionSection {
        pub reserved_zero: u16,
        pub flash_block_erase_size: u16,
        pub bios_base: u16,
        pub bios_limit: u16,
        pub me_base: u16,
        pub me_limit: u16,
        pub gbe_base: u16,
        pub gbe_limit: u16,
        pub pdr_base: u16,
        pub pdr_limit: u16,
    }

    pub const fn region_offset(base: u16) -> usize {
        base as usize * REGION_GRANULARITY
    }

    /// Zero when the region is absent (limit of zero).
    pub const fn region_size(base: u16, limit: u16) -> usize {
        if limit == 0 || limit < base {
            0
        } else {
            (limit as usize + 1 - base as usize) * REGION_GRANULARITY
        }
    }
}

pub mod microcode {
    use super::*;

    pub const HEADER_SIZE: usize = 48;
    pub const HEADER_VERSION: u32 = 1;
    pub const LOADER_REVISION: u32 = 1;
    /// Encrypted data size implied by a `data_size` of zero.
    pub const DEFAULT_DATA_SIZE: u32 = 2000;
    pub const MAX_SIZE: u32 = 0x0100_0000;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
    pub struct Header {
        pub header_version: u32,
        pub update_revision: u32,
        pub date_year: u16,
        pub date_day: u8,
        pub date_month: u8,
        pub processor_signature: u32,
        pub checksum: u32,
        pub loader_revision: u32,
        pub processor_flags: u8,
        pub processor_flags_reserved: [u8; 3],
        pub data_size: u32,
        pub total_size: u32,
        pub reserved: [u8; 12],
    }
}

/// Variable stores: AMI NVAR entries and TianoCore VSS stores.
pub mod nvram {
    use super::*;

    pub mod nvar {
        use super::*;

        /// `NVAR`
        pub const SIGNATURE: u32 = 0x5241_564E;
        pub const HEADER_SIZE: usize = 10;
        /// `next` value of the last entry in a chain, for an erase polarity of 1.
        pub const LAST_ENTRY: u32 = 0x00FF_FFFF;

        pub mod attributes {
            pub const RUNTIME: u8 = 0x01;
            pub const ASCII_NAME: u8 = 0x02;
            pub const GUID: u8 = 0x04;
            pub const DATA_ONLY: u8 = 0x08;
            pub const EXT_HEADER: u8 = 0x10;
            pub const HW_ERROR_RECORD: u8 = 0x20;
            pub const AUTH_WRITE: u8 = 0x40;
            pub const VALID: u8 = 0x80;
        }

        pub mod ext_attributes {
            pub const CHECKSUM: u8 = 0x01;
            pub const AUTH_WRITE: u8 = 0x10;
            pub const TIME_BASED: u8 = 0x20;
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
        pub struct Header {
            pub signature: u32,
            /// Entry size including this header.
            pub size: u16,
            /// 24-bit offset of the next entry in the chain, relative to this entry.
            pub next: [u8; 3],
            pub attributes: u8,
        }

        impl Header {
            pub fn next(&self) -> u32 {
                u32::from_le_bytes([self.next[0], self.next[1], self.next[2], 0])
            }
        }
    }

    pub mod vss {
        use super::*;

        /// `$VSS`
        pub const STORE_SIGNATURE: u32 = 0x5353_5624;
        /// `$SVS`
        pub const APPLE_SVS_STORE_SIGNATURE: u32 = 0x5356_5324;
        /// `$NSS`
        pub const APPLE_NSS_STORE_SIGNATURE: u32 = 0x5353_4E24;
        pub const STORE_HEADER_SIZE: usize = 16;
        pub const VARIABLE_START_ID: u16 = 0x55AA;
        pub const VARIABLE_HEADER_SIZE: usize = 32;
        pub const AUTH_VARIABLE_HEADER_SIZE: usize = 60;

        pub mod state {
            pub const IN_DELETED_TRANSITION: u8 = 0xFE;
            pub const DELETED: u8 = 0xFD;
            pub const HEADER_VALID: u8 = 0x7F;
            pub const ADDED: u8 = 0x3F;
            pub const INTEL_VALID: u8 = 0xFC;
            pub const INTEL_INVALID: u8 = 0xF8;
        }

        pub mod attributes {
            pub const NON_VOLATILE: u32 = 0x0000_0001;
            pub const BOOTSERVICE_ACCESS: u32 = 0x0000_0002;
            pub const RUNTIME_ACCESS: u32 = 0x0000_0004;
            pub const HARDWARE_ERROR_RECORD: u32 = 0x0000_0008;
            pub const AUTHENTICATED_WRITE_ACCESS: u32 = 0x0000_0010;
            pub const TIME_BASED_AUTHENTICATED_WRITE_ACCESS: u32 = 0x0000_0020;
            pub const APPEND_WRITE: u32 = 0x0000_0040;
            pub const APPLE_DATA_CHECKSUM: u32 = 0x8000_0000;
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
        pub struct StoreHeader {
            pub signature: u32,
            /// Store size including this header.
            pub size: u32,
            pub format: u8,
            pub state: u8,
            pub unknown: u16,
            pub reserved: u32,
        }

        /// Common prefix of every variable header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
        pub struct VariablePrefix {
            pub start_id: u16,
            pub state: u8,
            pub reserved: u8,
            pub attributes: u32,
        }

        /// Sizes and vendor GUID of a variable, read from either header layout.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct VariableHeader {
            pub prefix: VariablePrefix,
            pub name_size: u32,
            pub data_size: u32,
            pub vendor_guid: efi::Guid,
            pub header_size: usize,
        }

        impl VariableHeader {
            /// Authenticated variables carry a monotonic counter, a timestamp and a key index
            /// between the prefix and the sizes.
            pub fn is_authenticated(prefix: &VariablePrefix) -> bool {
                prefix.attributes
                    & (attributes::AUTHENTICATED_WRITE_ACCESS
                        | attributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS
                        | attributes::APPEND_WRITE)
                    != 0
            }

            pub fn total_size(&self) -> Option<usize> {
                self.header_size.checked_add(self.name_size as usize)?.checked_add(self.data_size as usize)
            }
        }

        impl<'a> ctx::TryFromCtx<'a, Endian> for VariableHeader {
            type Error = scroll::Error;

            fn try_from_ctx(src: &'a [u8], ctx: Endian) -> Result<(Self, usize), Self::Error> {
                let mut offset = 0;
                let prefix: VariablePrefix = src.gread_with(&mut offset, ctx)?;
                let (header_size, sizes_offset) = if Self::is_authenticated(&prefix) {
                    (AUTH_VARIABLE_HEADER_SIZE, 36)
                } else {
                    (VARIABLE_HEADER_SIZE, 8)
                };
                offset = sizes_offset;
                let name_size = src.gread_with(&mut offset, ctx)?;
                let data_size = src.gread_with(&mut offset, ctx)?;
                let vendor_guid = gread_guid(src, &mut offset)?;
                Ok((VariableHeader { prefix, name_size, data_size, vendor_guid, header_size }, offset))
            }
        }
    }
}

/// Intel Management Engine region structures.
pub mod me {
    use super::*;

    /// `$FPT`
    pub const FPT_SIGNATURE: u32 = 0x5450_4624;
    pub const FPT_HEADER_SIZE: usize = 32;
    pub const FPT_ENTRY_SIZE: usize = 32;
    /// Some regions start with a ROM bypass vector in front of the partition table.
    pub const ROM_BYPASS_VECTOR_SIZE: usize = 16;
    pub const VERSION_SIGNATURE: &[u8; 4] = b"$MAN";
    pub const VERSION_SIGNATURE2: &[u8; 4] = b"$MN2";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
    pub struct FptHeader {
        pub signature: u32,
        pub num_entries: u32,
        pub header_version: u8,
        pub entry_version: u8,
        pub header_length: u8,
        pub checksum: u8,
        pub ticks_to_add: u16,
        pub tokens_to_add: u16,
        pub uma_size: u32,
        pub flash_layout: u32,
        pub fitc_major: u16,
        pub fitc_minor: u16,
        pub fitc_hotfix: u16,
        pub fitc_build: u16,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
    pub struct FptEntry {
        pub name: [u8; 4],
        pub reserved1: [u8; 4],
        pub offset: u32,
        pub length: u32,
        pub reserved2: [u8; 12],
        pub flags: u32,
    }

    impl FptEntry {
        pub fn partition_type(&self) -> u8 {
            (self.flags & 0x7F) as u8
        }

        /// Present partitions have a location, a length and a valid marker.
        pub fn is_present(&self) -> bool {
            let entry_valid = (self.flags >> 24) as u8;
            self.offset != 0 && self.offset != u32::MAX && self.length != 0 && entry_valid != 0xFF
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
    pub struct Version {
        pub signature: u32,
        pub reserved: u32,
        pub major: u16,
        pub minor: u16,
        pub bugfix: u16,
        pub build: u16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::LE;

    #[test]
    fn volume_header_reads_fields_at_their_offsets() {
        let mut bytes = [0u8; fv::HEADER_SIZE];
        bytes[16..32].copy_from_slice(guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID.as_bytes());
        bytes[32..40].copy_from_slice(&0x1000u64.to_le_bytes());
        bytes[40..44].copy_from_slice(b"_FVH");
        bytes[44..48].copy_from_slice(&0x800u32.to_le_bytes());
        bytes[48..50].copy_from_slice(&72u16.to_le_bytes());
        bytes[55] = 2;

        let header = bytes.pread_with::<fv::Header>(0, LE).unwrap();
        assert_eq!(header.file_system_guid, guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID);
        assert_eq!(header.fv_length, 0x1000);
        assert_eq!(header.signature, fv::SIGNATURE);
        assert_eq!(header.attributes, fv::attributes::ERASE_POLARITY);
        assert_eq!(header.header_length, 72);
        assert_eq!(header.revision, 2);

        let mut out = [0u8; fv::HEADER_SIZE];
        assert_eq!(out.pwrite_with(header, 0, LE).unwrap(), fv::HEADER_SIZE);
        assert_eq!(out, bytes);
    }

    #[test]
    fn truncated_file_header_is_an_error() {
        let bytes = [0u8; ffs::file::HEADER_SIZE - 1];
        assert!(bytes.pread_with::<ffs::file::Header>(0, LE).is_err());
    }

    #[test]
    fn descriptor_region_math() {
        assert_eq!(descriptor::region_offset(0x200), 0x20_0000);
        assert_eq!(descriptor::region_size(0x200, 0x3FF), 0x20_0000);
        assert_eq!(descriptor::region_size(0x1, 0), 0);
    }

    #[test]
    fn header_layout_sizes() {
        assert_eq!(core::mem::size_of::<microcode::Header>(), microcode::HEADER_SIZE);
        let entry = fv::BlockMapEntry { num_blocks: 2, length: 0x1000 };
        let mut out = [0u8; fv::BLOCK_MAP_ENTRY_SIZE];
        assert_eq!(out.pwrite_with(entry, 0, LE).unwrap(), fv::BLOCK_MAP_ENTRY_SIZE);
        assert_eq!(out.pread_with::<fv::BlockMapEntry>(0, LE).unwrap(), entry);
        assert_eq!(core::mem::size_of::<me::FptHeader>(), me::FPT_HEADER_SIZE);
        assert_eq!(core::mem::size_of::<me::FptEntry>(), me::FPT_ENTRY_SIZE);
    }

    #[test]
    fn nvar_header_packs_next_and_attributes() {
        let bytes = [b'N', b'V', b'A', b'R', 0x20, 0x00, 0xFF, 0xFF, 0xFF, 0x83];
        let header = bytes.pread_with::<nvram::nvar::Header>(0, LE).unwrap();
        assert_eq!(header.signature, nvram::nvar::SIGNATURE);
        assert_eq!(header.size, 0x20);
        assert_eq!(header.next(), nvram::nvar::LAST_ENTRY);
        assert_eq!(header.attributes, nvram::nvar::attributes::VALID | 0x03);
    }

    #[test]
    fn authenticated_vss_variables_have_a_longer_header() {
        use nvram::vss;

        let mut bytes = [0u8; vss::AUTH_VARIABLE_HEADER_SIZE];
        bytes[..2].copy_from_slice(&vss::VARIABLE_START_ID.to_le_bytes());
        bytes[2] = vss::state::ADDED;
        bytes[4..8].copy_from_slice(&(vss::attributes::NON_VOLATILE | vss::attributes::APPEND_WRITE).to_le_bytes());
        bytes[36..40].copy_from_slice(&8u32.to_le_bytes());
        bytes[40..44].copy_from_slice(&3u32.to_le_bytes());
        bytes[44..60].copy_from_slice(guid::LZMA_SECTION_GUID.as_bytes());
        let variable = bytes.pread_with::<vss::VariableHeader>(0, LE).unwrap();
        assert_eq!(variable.header_size, vss::AUTH_VARIABLE_HEADER_SIZE);
        assert_eq!((variable.name_size, variable.data_size), (8, 3));
        assert_eq!(variable.vendor_guid, guid::LZMA_SECTION_GUID);
        assert_eq!(variable.total_size(), Some(71));

        // Without authentication attributes the sizes follow the prefix directly.
        bytes[4..8].copy_from_slice(&vss::attributes::NON_VOLATILE.to_le_bytes());
        let variable = bytes.pread_with::<vss::VariableHeader>(0, LE).unwrap();
        assert_eq!(variable.header_size, vss::VARIABLE_HEADER_SIZE);
        assert_eq!((variable.name_size, variable.data_size), (0, 0));
    }
}
