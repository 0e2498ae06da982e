//! Links to supplementary object files.

use crate::dwarfinfo::DwarfInfo;
use crate::error::Result;
use crate::reader::Reader;

/// Length of the build-id checksum in `.gnu_debugaltlink`.
const ALTLINK_CHECKSUM_SIZE: u64 = 20;

/// The section a [`SupplementaryLink`] was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkSource {
    /// The standard `.debug_sup` section of the given version.
    DebugSup {
        /// Version of the section.
        version: u16,
    },
    /// The GNU `.gnu_debugaltlink` section written by `dwz`.
    GnuDebugAltLink,
}

/// Names the supplementary file that `DW_FORM_*_sup` and `DW_FORM_GNU_*_alt` forms refer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupplementaryLink<'d> {
    /// Where the link was found.
    pub source: LinkSource,
    /// Path of the supplementary file, as written by the producer.
    pub filename: &'d [u8],
    /// Checksum or build id identifying the supplementary file. May be empty.
    pub checksum: &'d [u8],
}

impl<'d> DwarfInfo<'d> {
    /// Reads the link to the supplementary file.
    ///
    /// `.debug_sup` is consulted first and only names a link if this file is not itself the
    /// supplementary file. Otherwise `.gnu_debugaltlink` is used. Returns `None` if neither
    /// section names a link.
    pub fn supplementary_link(&self) -> Result<Option<SupplementaryLink<'d>>> {
        let endian = self.endian();

        if let Some(section) = self.sections().sup {
            let mut reader = Reader::new(section.data, endian);
            let version = reader.u16()?;
            let is_supplementary = reader.u8()?;
            let filename = reader.cstr()?;

            if is_supplementary == 0 {
                // Producers that predate the final DWARF 5 layout omit the checksum.
                let checksum = if reader.is_empty() {
                    &[][..]
                } else {
                    let len = reader.uleb128()?;
                    reader.bytes(len)?
                };

                return Ok(Some(SupplementaryLink {
                    source: LinkSource::DebugSup { version },
                    filename,
                    checksum,
                }));
            }
        }

        if let Some(section) = self.sections().gnu_debugaltlink {
            let mut reader = Reader::new(section.data, endian);
            let filename = reader.cstr()?;
            let checksum = reader.bytes(ALTLINK_CHECKSUM_SIZE)?;

            return Ok(Some(SupplementaryLink {
                source: LinkSource::GnuDebugAltLink,
                filename,
                checksum,
            }));
        }

        Ok(None)
    }
}
