use std::error::Error;
use std::fmt;

use dwarfkit_dwarf::DwarfError;
use thiserror::Error;

/// The error type for [`CfiError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfiErrorKind {
    /// The requested frame section was not provided.
    MissingSection,

    /// The framing or header of a CIE or FDE is invalid.
    MalformedEntry,

    /// An unknown or truncated call frame instruction.
    BadInstruction,

    /// A `DW_CFA_restore` instruction in a CIE, which has no initial row to restore from.
    RestoreInCie,

    /// A pointer encoding or augmentation this decoder does not implement.
    UnsupportedEncoding,

    /// The expression operand of an instruction could not be decoded.
    BadExpression,
}

impl fmt::Display for CfiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSection => write!(f, "missing call frame section"),
            Self::MalformedEntry => write!(f, "malformed call frame entry"),
            Self::BadInstruction => write!(f, "bad call frame instruction"),
            Self::RestoreInCie => write!(f, "restore instruction in a CIE"),
            Self::UnsupportedEncoding => write!(f, "unsupported pointer encoding"),
            Self::BadExpression => write!(f, "bad call frame expression"),
        }
    }
}

/// An error returned when decoding call frame information.
#[derive(Debug, Error)]
#[error("{kind}{}", offset_suffix(.offset))]
pub struct CfiError {
    kind: CfiErrorKind,
    offset: Option<u64>,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

fn offset_suffix(offset: &Option<u64>) -> String {
    match offset {
        Some(offset) => format!(" at {offset:#x}"),
        None => String::new(),
    }
}

impl CfiError {
    /// Creates a new CFI error from a known kind of error as well as an
    /// arbitrary error payload.
    pub(crate) fn new<E>(kind: CfiErrorKind, offset: u64, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            kind,
            offset: Some(offset),
            source: Some(source.into()),
        }
    }

    /// Creates an error of the given kind without a payload.
    pub(crate) fn at(kind: CfiErrorKind, offset: u64) -> Self {
        Self {
            kind,
            offset: Some(offset),
            source: None,
        }
    }

    /// Returns the corresponding [`CfiErrorKind`] for this error.
    pub fn kind(&self) -> CfiErrorKind {
        self.kind
    }

    /// Returns the section offset of the entry or instruction that failed to decode.
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }
}

impl From<CfiErrorKind> for CfiError {
    fn from(kind: CfiErrorKind) -> Self {
        Self {
            kind,
            offset: None,
            source: None,
        }
    }
}

impl From<DwarfError> for CfiError {
    fn from(e: DwarfError) -> Self {
        let kind = match e {
            DwarfError::MissingSection(_) => CfiErrorKind::MissingSection,
            DwarfError::UnsupportedEncoding { .. } => CfiErrorKind::UnsupportedEncoding,
            _ => CfiErrorKind::MalformedEntry,
        };

        Self {
            kind,
            offset: e.offset(),
            source: Some(Box::new(e)),
        }
    }
}

/// Result type used by the call frame decoder.
pub type Result<T, E = CfiError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    #[test]
    fn test_from_dwarf_error() {
        let error = CfiError::from(DwarfError::malformed(0x24, "unexpected end of data"));
        assert_eq!(error.kind(), CfiErrorKind::MalformedEntry);
        assert_eq!(error.offset(), Some(0x24));
        assert_eq!(error.to_string(), "malformed call frame entry at 0x24");
        assert!(error.source().is_some());

        let error = CfiError::from(DwarfError::MissingSection("eh_frame"));
        assert_eq!(error.kind(), CfiErrorKind::MissingSection);
        assert_eq!(error.to_string(), "missing call frame section");
    }
}
