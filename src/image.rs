//! On-disk image layout.  All multi-byte integers are native-endian of
//! the producing process; the loader assumes it runs on the same
//! architecture (pointer width and struct layout of the source dictate
//! the image contents).
//!
//! ```text
//! header | root offsets | named roots | data fix-ups | fptr fix-ups
//!        | fragment index | payload | fptr symbol table
//! ```
use static_assertions::const_assert;
use static_assertions::const_assert_eq;

use crate::error::Error;
use crate::error::Result;

/// "FLATTEN\0", little-endian in the magic field.
pub const IMAGE_MAGIC: u64 = 0x4e45_5454_414c_46;
pub const IMAGE_VERSION: u32 = 2;

/// Fixed header size: magic + version + padding, then eleven `usize`
/// fields.
pub const HEADER_SIZE: usize = 16 + 11 * 8;

// Image arithmetic is done in `usize` units of the source pointer width.
const_assert!(std::mem::size_of::<usize>() == 8);
const_assert_eq!(HEADER_SIZE, 104);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u64,
    pub version: u32,
    /// Base address of the last in-place fix-up mapping; zero until a
    /// loader rewrites the file.
    pub last_load_addr: usize,
    /// Address the payload pointers are relative to; zero until a loader
    /// rewrites the file.
    pub last_mem_addr: usize,
    pub image_size: usize,
    /// Payload byte size.
    pub memory_size: usize,
    pub ptr_count: usize,
    pub fptr_count: usize,
    pub root_addr_count: usize,
    pub root_addr_extended_count: usize,
    /// Byte size of the named-root table.
    pub root_addr_extended_size: usize,
    /// Byte size of the function-pointer symbol table.
    pub fptrmapsz: usize,
    /// Fragment count; zero when the index was skipped.
    pub mcount: usize,
}

impl ImageHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&self.magic.to_ne_bytes());
        out[8..12].copy_from_slice(&self.version.to_ne_bytes());
        // Four bytes of padding keep the usize fields 8-aligned.
        let fields = [
            self.last_load_addr,
            self.last_mem_addr,
            self.image_size,
            self.memory_size,
            self.ptr_count,
            self.fptr_count,
            self.root_addr_count,
            self.root_addr_extended_count,
            self.root_addr_extended_size,
            self.fptrmapsz,
            self.mcount,
        ];
        for (i, field) in fields.iter().enumerate() {
            let at = 16 + i * 8;
            out[at..at + 8].copy_from_slice(&field.to_ne_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ImageHeader> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::TruncatedImage);
        }

        let field = |i: usize| {
            let at = 16 + i * 8;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            usize::from_ne_bytes(buf)
        };

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[8..12]);

        Ok(ImageHeader {
            magic: u64::from_ne_bytes(magic),
            version: u32::from_ne_bytes(version),
            last_load_addr: field(0),
            last_mem_addr: field(1),
            image_size: field(2),
            memory_size: field(3),
            ptr_count: field(4),
            fptr_count: field(5),
            root_addr_count: field(6),
            root_addr_extended_count: field(7),
            root_addr_extended_size: field(8),
            fptrmapsz: field(9),
            mcount: field(10),
        })
    }

    /// Validates magic, version, and the section-size constraint against
    /// the real file size.
    pub fn validate(&self, file_size: usize) -> Result<()> {
        if self.magic != IMAGE_MAGIC {
            return Err(Error::InvalidMagic);
        }
        if self.version != IMAGE_VERSION {
            return Err(Error::UnsupportedVersion(self.version));
        }
        if self.image_size > file_size {
            return Err(Error::TruncatedImage);
        }

        let total = self.sections_size()?;
        if total > self.image_size {
            return Err(Error::MemorySizeBiggerThanImage);
        }
        Ok(())
    }

    /// Byte size of everything between the header and the symbol table,
    /// plus the symbol table; checked arithmetic throughout.
    fn sections_size(&self) -> Result<usize> {
        let mul = |a: usize, b: usize| a.checked_mul(b).ok_or(Error::Overflow);
        let add = |a: usize, b: usize| a.checked_add(b).ok_or(Error::Overflow);

        let mut total = mul(self.ptr_count, 8)?;
        total = add(total, mul(self.fptr_count, 8)?)?;
        total = add(total, mul(self.root_addr_count, 8)?)?;
        total = add(total, self.root_addr_extended_size)?;
        total = add(total, self.fptrmapsz)?;
        total = add(total, mul(self.mcount, 16)?)?;
        add(total, self.memory_size)
    }

    /// Byte size of the region the loader materializes as one block:
    /// fix-up arrays, fragment index, and payload.
    pub fn mem_block_size(&self) -> Result<usize> {
        let mul = |a: usize, b: usize| a.checked_mul(b).ok_or(Error::Overflow);
        let add = |a: usize, b: usize| a.checked_add(b).ok_or(Error::Overflow);

        let mut total = mul(self.ptr_count, 8)?;
        total = add(total, mul(self.fptr_count, 8)?)?;
        total = add(total, mul(self.mcount, 16)?)?;
        add(total, self.memory_size)
    }

    /// Offset of the payload within the materialized memory block.
    pub fn payload_offset_in_block(&self) -> usize {
        self.ptr_count * 8 + self.fptr_count * 8 + self.mcount * 16
    }
}
