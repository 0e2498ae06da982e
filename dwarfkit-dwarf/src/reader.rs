//! Primitive decoders over a section byte buffer.

use std::fmt;

use gimli::{Endianity, Format};

use crate::error::{DwarfError, Result};
use crate::Endian;

/// The escape value of an initial length field announcing 64-bit DWARF.
const DWARF64_ESCAPE: u32 = 0xffff_ffff;

/// First initial length value reserved by the DWARF standard.
const RESERVED_LENGTHS: u32 = 0xffff_fff0;

/// A cursor decoding DWARF primitives from a section.
///
/// Positions are always section offsets: a reader restricted with [`bounded`](Self::bounded)
/// still reports offsets relative to the start of the section it was created for, so errors
/// point at the exact byte that failed to decode.
#[derive(Clone, Copy)]
pub struct Reader<'d> {
    data: &'d [u8],
    pos: usize,
    endian: Endian,
}

impl fmt::Debug for Reader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("position", &format_args!("{:#x}", self.pos))
            .field("len()", &self.data.len())
            .field("endian", &self.endian)
            .finish()
    }
}

impl<'d> Reader<'d> {
    /// Creates a reader at the start of `data`.
    pub fn new(data: &'d [u8], endian: Endian) -> Self {
        Reader {
            data,
            pos: 0,
            endian,
        }
    }

    /// Creates a reader positioned at `offset`.
    pub fn at(data: &'d [u8], offset: u64, endian: Endian) -> Self {
        let mut reader = Self::new(data, endian);
        reader.seek(offset);
        reader
    }

    /// The byte order of this reader.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The current section offset.
    #[inline]
    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    /// Moves the cursor to a section offset.
    ///
    /// Seeking past the end is allowed; the next read fails with the out-of-bounds offset.
    pub fn seek(&mut self, offset: u64) {
        self.pos = usize::try_from(offset).unwrap_or(usize::MAX);
    }

    /// Number of bytes left before the end of the readable range.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Whether the cursor reached the end of the readable range.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns a copy of this reader that cannot read past the section offset `end`.
    ///
    /// Used to confine decoding to a record whose length is declared in its header.
    pub fn bounded(&self, end: u64) -> Result<Self> {
        let end = usize::try_from(end).unwrap_or(usize::MAX);
        if end > self.data.len() || end < self.pos {
            return Err(DwarfError::malformed(
                self.position(),
                format!("record end {end:#x} outside of section"),
            ));
        }

        Ok(Reader {
            data: &self.data[..end],
            pos: self.pos,
            endian: self.endian,
        })
    }

    /// Reads `len` raw bytes.
    pub fn bytes(&mut self, len: u64) -> Result<&'d [u8]> {
        let start = self.pos;
        let bytes = usize::try_from(len)
            .ok()
            .and_then(|len| start.checked_add(len))
            .and_then(|end| self.data.get(start..end))
            .ok_or_else(|| self.truncated(len))?;

        self.pos += bytes.len();
        Ok(bytes)
    }

    /// Skips `len` bytes.
    pub fn skip(&mut self, len: u64) -> Result<()> {
        self.bytes(len).map(drop)
    }

    fn truncated(&self, len: u64) -> DwarfError {
        DwarfError::malformed(
            self.position(),
            format!("expected {len} bytes, found {}", self.remaining()),
        )
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.bytes(N as u64)?;
        let mut array = [0; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    /// Reads an unsigned byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Reads a signed byte.
    pub fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    /// Reads an unsigned 2-byte integer.
    pub fn u16(&mut self) -> Result<u16> {
        let buf = self.array::<2>()?;
        Ok(self.endian.read_u16(&buf))
    }

    /// Reads a signed 2-byte integer.
    pub fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    /// Reads an unsigned 3-byte integer.
    pub fn u24(&mut self) -> Result<u32> {
        let [a, b, c] = self.array::<3>()?;
        Ok(if self.endian.is_big_endian() {
            u32::from_be_bytes([0, a, b, c])
        } else {
            u32::from_le_bytes([a, b, c, 0])
        })
    }

    /// Reads an unsigned 4-byte integer.
    pub fn u32(&mut self) -> Result<u32> {
        let buf = self.array::<4>()?;
        Ok(self.endian.read_u32(&buf))
    }

    /// Reads a signed 4-byte integer.
    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    /// Reads an unsigned 8-byte integer.
    pub fn u64(&mut self) -> Result<u64> {
        let buf = self.array::<8>()?;
        Ok(self.endian.read_u64(&buf))
    }

    /// Reads a signed 8-byte integer.
    pub fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    /// Reads an unsigned integer of 1, 2, 3, 4 or 8 bytes.
    pub fn uint(&mut self, size: u8) -> Result<u64> {
        match size {
            1 => self.u8().map(u64::from),
            2 => self.u16().map(u64::from),
            3 => self.u24().map(u64::from),
            4 => self.u32().map(u64::from),
            8 => self.u64(),
            _ => Err(DwarfError::unsupported(
                self.position(),
                format!("{size}-byte integers"),
            )),
        }
    }

    /// Reads a target address of `address_size` bytes.
    pub fn address(&mut self, address_size: u8) -> Result<u64> {
        self.uint(address_size)
    }

    /// Reads a section offset or length whose width depends on the DWARF format.
    pub fn offset(&mut self, format: Format) -> Result<u64> {
        match format {
            Format::Dwarf32 => self.u32().map(u64::from),
            Format::Dwarf64 => self.u64(),
        }
    }

    /// Reads an unsigned LEB128 number.
    ///
    /// The encoding may be arbitrarily long. Bits beyond the 64th are discarded.
    pub fn uleb128(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0x7f) << shift;
            }
            shift = shift.saturating_add(7);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    /// Reads a signed LEB128 number.
    ///
    /// The encoding may be arbitrarily long. Bits beyond the 64th are discarded.
    pub fn sleb128(&mut self) -> Result<i64> {
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0x7f) << shift;
            }
            shift = shift.saturating_add(7);
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Reads an initial length field and returns the length along with the DWARF format it
    /// selects.
    ///
    /// A 4-byte value of `0xffffffff` is followed by the actual 8-byte length and marks 64-bit
    /// DWARF. The other values from `0xfffffff0` upward are reserved and rejected.
    pub fn initial_length(&mut self) -> Result<(u64, Format)> {
        let offset = self.position();
        match self.u32()? {
            DWARF64_ESCAPE => Ok((self.u64()?, Format::Dwarf64)),
            value if value >= RESERVED_LENGTHS => Err(DwarfError::malformed(
                offset,
                format!("reserved initial length {value:#x}"),
            )),
            value => Ok((value.into(), Format::Dwarf32)),
        }
    }

    /// Reads a NUL-terminated string and returns it without the terminator.
    pub fn cstr(&mut self) -> Result<&'d [u8]> {
        let rest = self.data.get(self.pos..).unwrap_or_default();
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DwarfError::malformed(self.position(), "unterminated string"))?;

        let string = &rest[..len];
        self.pos += len + 1;
        Ok(string)
    }
}

/// Reads a NUL-terminated string at `offset` of a string section.
pub(crate) fn cstr_at(data: &[u8], offset: u64) -> Result<&[u8]> {
    Reader::at(data, offset, Endian::default()).cstr()
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    fn reader(data: &[u8]) -> Reader<'_> {
        Reader::new(data, Endian::Little)
    }

    #[test]
    fn test_initial_length_32() -> Result<()> {
        let mut r = reader(&[0x10, 0x00, 0x00, 0x00]);
        assert_eq!(r.initial_length()?, (0x10, Format::Dwarf32));
        assert_eq!(r.position(), 4);
        Ok(())
    }

    #[test]
    fn test_initial_length_64() -> Result<()> {
        let mut r = reader(&[0xff, 0xff, 0xff, 0xff, 0x34, 0x12, 0, 0, 0, 0, 0, 0]);
        assert_eq!(r.initial_length()?, (0x1234, Format::Dwarf64));
        assert_eq!(r.position(), 12);
        Ok(())
    }

    #[test]
    fn test_initial_length_reserved() {
        let mut r = reader(&[0xf0, 0xff, 0xff, 0xff]);
        let err = r.initial_length().unwrap_err();
        assert!(matches!(err, DwarfError::MalformedRecord { offset: 0, .. }));
    }

    #[test]
    fn test_uleb128_long_encoding() -> Result<()> {
        // Redundant continuation bytes past 64 bits are legal.
        let mut data = vec![0x81];
        data.extend(std::iter::repeat(0x80).take(11));
        data.push(0x00);

        let mut r = reader(&data);
        assert_eq!(r.uleb128()?, 1);
        assert!(r.is_empty());
        Ok(())
    }

    #[test]
    fn test_uleb128_roundtrip() -> Result<()> {
        let values = [0, 1, 127, 128, 624_485, u64::from(u32::MAX), u64::MAX];
        let mut writer = dwarfkit_testutils::SectionWriter::little();
        for value in values {
            writer.uleb(value);
        }

        let data = writer.finish();
        let mut r = reader(&data);
        for value in values {
            assert_eq!(r.uleb128()?, value);
        }
        Ok(())
    }

    #[test]
    fn test_sleb128() -> Result<()> {
        let mut r = reader(&[0x7f, 0x80, 0x7f, 0xc0, 0xbb, 0x78, 0x3f]);
        assert_eq!(r.sleb128()?, -1);
        assert_eq!(r.sleb128()?, -128);
        assert_eq!(r.sleb128()?, -123_456);
        assert_eq!(r.sleb128()?, 63);
        Ok(())
    }

    #[test]
    fn test_truncated_offset() {
        let mut r = Reader::at(&[1, 2, 3], 2, Endian::Big);
        let err = r.u16().unwrap_err();
        assert_eq!(err.offset(), Some(2));
    }

    #[test]
    fn test_bounded() -> Result<()> {
        let data = [1, 0, 2, 0, 3, 0];
        let mut r = Reader::at(&data, 2, Endian::Little).bounded(4)?;
        assert_eq!(r.u16()?, 2);
        assert!(r.is_empty());
        assert_eq!(r.u16().unwrap_err().offset(), Some(4));
        Ok(())
    }

    #[test]
    fn test_cstr() -> Result<()> {
        let mut r = reader(b"main\0\0x");
        assert_eq!(r.cstr()?, b"main");
        assert_eq!(r.cstr()?, b"");
        assert!(r.cstr().is_err());
        Ok(())
    }

    #[test]
    fn test_big_endian_u24() -> Result<()> {
        let mut r = Reader::new(&[0x01, 0x02, 0x03], Endian::Big);
        assert_eq!(r.u24()?, 0x010203);
        Ok(())
    }
}
