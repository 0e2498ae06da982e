use std::borrow::Cow;

use gimli::constants::DwForm;
use thiserror::Error;

/// An error decoding DWARF debugging information.
///
/// Every variant that concerns the contents of a section carries the byte offset at which decoding
/// failed. The offset is relative to the start of the section being decoded, which is always known
/// from the operation that returned the error.
#[non_exhaustive]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DwarfError {
    /// The framing of a record, an opcode, or a length field violates the format.
    #[error("malformed record at {offset:#x}: {reason}")]
    MalformedRecord {
        /// Section offset of the violation.
        offset: u64,
        /// What was expected and what was found.
        reason: Cow<'static, str>,
    },

    /// An attribute form code that is not defined by any DWARF version or known extension.
    #[error("unknown attribute form {form:#x} at {offset:#x}")]
    UnknownForm {
        /// Section offset of the attribute.
        offset: u64,
        /// The numeric form code.
        form: u64,
    },

    /// A recognized attribute form that cannot be resolved, such as type signature references.
    #[error("unsupported attribute form {form} at {offset:#x}")]
    UnsupportedForm {
        /// Section offset of the attribute.
        offset: u64,
        /// The form.
        form: DwForm,
    },

    /// An offset or index points outside of any known unit or table.
    #[error("dangling reference from {offset:#x} to {target:#x}")]
    DanglingReference {
        /// Offset of the referencing record.
        offset: u64,
        /// The offset or index that could not be resolved.
        target: u64,
    },

    /// A DIE uses an abbreviation code that its unit's abbreviation table does not declare.
    #[error("abbreviation code {code} not found for entry at {offset:#x}")]
    AbbreviationNotFound {
        /// Section offset of the DIE.
        offset: u64,
        /// The abbreviation code read from the DIE.
        code: u64,
    },

    /// An encoding this decoder does not implement, such as segmented addressing.
    #[error("unsupported encoding at {offset:#x}: {reason}")]
    UnsupportedEncoding {
        /// Section offset of the record.
        offset: u64,
        /// Description of the encoding.
        reason: Cow<'static, str>,
    },

    /// A section required to resolve a value was not provided.
    #[error("missing section .{0}")]
    MissingSection(&'static str),

    /// An indexed attribute form was used, but the unit's root DIE lacks the base attribute.
    #[error("unit at {unit_offset:#x} needs {attribute}")]
    MissingBase {
        /// Section offset of the unit header.
        unit_offset: u64,
        /// Name of the missing `DW_AT_*_base` attribute.
        attribute: &'static str,
    },
}

impl DwarfError {
    /// Creates a [`DwarfError::MalformedRecord`].
    pub fn malformed(offset: u64, reason: impl Into<Cow<'static, str>>) -> Self {
        DwarfError::MalformedRecord {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a [`DwarfError::UnsupportedEncoding`].
    pub fn unsupported(offset: u64, reason: impl Into<Cow<'static, str>>) -> Self {
        DwarfError::UnsupportedEncoding {
            offset,
            reason: reason.into(),
        }
    }

    /// Returns the section offset this error refers to, if any.
    pub fn offset(&self) -> Option<u64> {
        match *self {
            DwarfError::MalformedRecord { offset, .. }
            | DwarfError::UnknownForm { offset, .. }
            | DwarfError::UnsupportedForm { offset, .. }
            | DwarfError::DanglingReference { offset, .. }
            | DwarfError::AbbreviationNotFound { offset, .. }
            | DwarfError::UnsupportedEncoding { offset, .. } => Some(offset),
            DwarfError::MissingSection(_) | DwarfError::MissingBase { .. } => None,
        }
    }
}

/// Result type used throughout the decoder.
pub type Result<T, E = DwarfError> = std::result::Result<T, E>;
