use gimli::Format;

use crate::reader::Reader;
use crate::Endian;

/// The parameters that determine the width and byte order of every DWARF primitive.
///
/// A context is derived from the file configuration and then refined by each record header that
/// declares its own format, version, or address size. It is a small `Copy` value; decoders take
/// it by value and hold no other state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SchemaContext {
    /// Byte order of all multi-byte values.
    pub endian: Endian,
    /// 32-bit or 64-bit DWARF, selecting the width of section offsets.
    pub format: Format,
    /// Size of a target address in bytes.
    pub address_size: u8,
    /// DWARF version of the enclosing unit.
    pub version: u16,
}

impl SchemaContext {
    /// Creates a context.
    pub fn new(endian: Endian, format: Format, address_size: u8, version: u16) -> Self {
        SchemaContext {
            endian,
            format,
            address_size,
            version,
        }
    }

    /// Width of a section offset or length in bytes.
    pub fn offset_size(&self) -> u8 {
        self.format.word_size()
    }

    /// Size of the initial length field of records in this format.
    pub fn initial_length_size(&self) -> u8 {
        self.format.initial_length_size()
    }

    /// The largest representable target address.
    ///
    /// # Examples
    ///
    /// ```
    /// use dwarfkit_dwarf::{Endian, SchemaContext};
    /// use dwarfkit_dwarf::gimli::Format;
    ///
    /// let ctx = SchemaContext::new(Endian::Little, Format::Dwarf32, 4, 4);
    /// assert_eq!(ctx.max_address(), 0xffff_ffff);
    /// ```
    pub fn max_address(&self) -> u64 {
        1u64.checked_shl(u32::from(self.address_size) * 8)
            .map_or(u64::MAX, |limit| limit - 1)
    }

    /// Returns a copy with a different format.
    pub fn with_format(self, format: Format) -> Self {
        SchemaContext { format, ..self }
    }

    /// Returns a copy with a different address size.
    pub fn with_address_size(self, address_size: u8) -> Self {
        SchemaContext {
            address_size,
            ..self
        }
    }

    /// Returns a copy with a different version.
    pub fn with_version(self, version: u16) -> Self {
        SchemaContext { version, ..self }
    }

    /// Creates a reader over `data` at `offset` using this context's byte order.
    pub fn reader_at<'d>(&self, data: &'d [u8], offset: u64) -> Reader<'d> {
        Reader::at(data, offset, self.endian)
    }
}
