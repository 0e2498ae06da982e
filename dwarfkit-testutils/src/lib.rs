//! Test helpers for `dwarfkit`.
//!
//! Tests assemble their input sections byte by byte with [`SectionWriter`] rather than loading
//! compiled binaries, so the bytes under test are always visible next to the assertions.
#![warn(missing_docs)]

/// A placeholder for an initial length field, returned by [`SectionWriter::begin_unit`].
#[derive(Clone, Copy, Debug)]
#[must_use = "a unit must be closed with `SectionWriter::end_unit`"]
pub struct UnitMarker {
    /// Offset of the length field itself, including the 64-bit escape if present.
    field: usize,
    /// Offset of the first byte counted by the length.
    start: usize,
    dwarf64: bool,
}

impl UnitMarker {
    /// Offset of the unit's initial length field in the section.
    pub fn offset(&self) -> usize {
        self.field
    }
}

/// Assembles a DWARF section in memory.
///
/// All writer methods return `&mut Self` so that records can be written as a single chain.
///
/// # Example
///
/// ```
/// use dwarfkit_testutils::SectionWriter;
///
/// let mut w = SectionWriter::little();
/// let unit = w.begin_unit(false);
/// w.u16(4).u32(0).u8(8);
/// w.end_unit(unit);
///
/// assert_eq!(w.as_slice(), &[7, 0, 0, 0, 4, 0, 0, 0, 0, 0, 8]);
/// ```
#[derive(Clone, Debug, Default)]
pub struct SectionWriter {
    data: Vec<u8>,
    big_endian: bool,
}

impl SectionWriter {
    /// Creates a writer producing little-endian data.
    pub fn little() -> Self {
        Self::default()
    }

    /// Creates a writer producing big-endian data.
    pub fn big() -> Self {
        SectionWriter {
            data: Vec::new(),
            big_endian: true,
        }
    }

    /// Current write offset, which is also the section offset of the next record.
    pub fn position(&self) -> usize {
        self.data.len()
    }

    /// Returns the bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the writer and returns the section contents.
    pub fn finish(self) -> Vec<u8> {
        self.data
    }

    fn int(&mut self, value: u64, size: usize) -> &mut Self {
        let bytes = value.to_le_bytes();
        if self.big_endian {
            self.data.extend(bytes[..size].iter().rev());
        } else {
            self.data.extend_from_slice(&bytes[..size]);
        }
        self
    }

    /// Writes a single byte.
    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    /// Writes a 2-byte integer.
    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.int(value.into(), 2)
    }

    /// Writes the low 3 bytes of `value`.
    pub fn u24(&mut self, value: u32) -> &mut Self {
        self.int(value.into(), 3)
    }

    /// Writes a 4-byte integer.
    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.int(value.into(), 4)
    }

    /// Writes an 8-byte integer.
    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.int(value, 8)
    }

    /// Writes a signed byte.
    pub fn i8(&mut self, value: i8) -> &mut Self {
        self.u8(value as u8)
    }

    /// Writes a signed 2-byte integer.
    pub fn i16(&mut self, value: i16) -> &mut Self {
        self.u16(value as u16)
    }

    /// Writes a signed 4-byte integer.
    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.u32(value as u32)
    }

    /// Writes an offset: 4 bytes in 32-bit DWARF, 8 bytes in 64-bit DWARF.
    pub fn offset(&mut self, value: u64, dwarf64: bool) -> &mut Self {
        self.int(value, if dwarf64 { 8 } else { 4 })
    }

    /// Writes a target address of the given size in bytes.
    pub fn address(&mut self, value: u64, size: u8) -> &mut Self {
        self.int(value, size.into())
    }

    /// Writes an unsigned LEB128 number.
    pub fn uleb(&mut self, mut value: u64) -> &mut Self {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.data.push(byte);
                return self;
            }
            self.data.push(byte | 0x80);
        }
    }

    /// Writes a signed LEB128 number.
    pub fn sleb(&mut self, mut value: i64) -> &mut Self {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                self.data.push(byte);
                return self;
            }
            self.data.push(byte | 0x80);
        }
    }

    /// Writes raw bytes.
    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Writes a NUL-terminated string.
    pub fn cstr(&mut self, string: &str) -> &mut Self {
        self.data.extend_from_slice(string.as_bytes());
        self.data.push(0);
        self
    }

    /// Writes `count` zero bytes.
    pub fn zeros(&mut self, count: usize) -> &mut Self {
        self.data.resize(self.data.len() + count, 0);
        self
    }

    /// Pads with zeros until the position is a multiple of `align`.
    pub fn align(&mut self, align: usize) -> &mut Self {
        while self.data.len() % align != 0 {
            self.data.push(0);
        }
        self
    }

    /// Starts a record with an initial length field, to be patched by [`end_unit`].
    ///
    /// With `dwarf64`, the field is written as the `0xffffffff` escape followed by 8 bytes.
    ///
    /// [`end_unit`]: Self::end_unit
    pub fn begin_unit(&mut self, dwarf64: bool) -> UnitMarker {
        let field = self.position();
        if dwarf64 {
            self.u32(0xffff_ffff).u64(0);
        } else {
            self.u32(0);
        }

        UnitMarker {
            field,
            start: self.position(),
            dwarf64,
        }
    }

    /// Patches the initial length of a record started with [`begin_unit`].
    ///
    /// [`begin_unit`]: Self::begin_unit
    pub fn end_unit(&mut self, marker: UnitMarker) -> &mut Self {
        let length = (self.position() - marker.start) as u64;
        let (at, size) = if marker.dwarf64 {
            (marker.field + 4, 8)
        } else {
            (marker.field, 4)
        };

        let mut patch = SectionWriter {
            data: Vec::new(),
            big_endian: self.big_endian,
        };
        patch.int(length, size);
        self.data[at..at + size].copy_from_slice(&patch.data);
        self
    }
}
