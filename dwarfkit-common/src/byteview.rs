//! Shared, cheaply clonable access to the bytes of an object file.
//!
//! See the [`ByteView`] struct for more documentation.

use std::borrow::Cow;
use std::fs::File;
use std::io;
use std::ops::{Deref, Range};
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

/// Where the bytes behind a [`ByteView`] live.
#[derive(Debug)]
enum Backing<'a> {
    Buf(Cow<'a, [u8]>),
    Mmap(Mmap),
}

impl Deref for Backing<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match *self {
            Backing::Buf(ref buf) => buf,
            Backing::Mmap(ref mmap) => mmap,
        }
    }
}

/// A smart pointer to the raw bytes of an object file.
///
/// Debug sections are always decoded from memory. A `ByteView` owns or borrows that memory,
/// either as a plain buffer or as a read-only memory mapping of a file, and dereferences into
/// `&[u8]`. Clones share the same backing storage.
///
/// Container readers locate the debug sections and report them as file offset and size pairs.
/// [`range`](Self::range) turns such a pair into a slice without risking a panic on corrupt
/// headers.
///
/// # Example
///
/// ```
/// use std::io::Write;
/// use dwarfkit_common::ByteView;
///
/// fn main() -> Result<(), std::io::Error> {
///     let mut file = tempfile::tempfile()?;
///     file.write_all(b"\x7fELF....debug")?;
///
///     let view = ByteView::map_file(file)?;
///     assert_eq!(view.range(8, 5), Some(&b"debug"[..]));
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug)]
pub struct ByteView<'a> {
    backing: Arc<Backing<'a>>,
}

impl<'a> ByteView<'a> {
    fn with_backing(backing: Backing<'a>) -> Self {
        ByteView {
            backing: Arc::new(backing),
        }
    }

    /// Constructs a `ByteView` from a `Cow`.
    pub fn from_cow(cow: Cow<'a, [u8]>) -> Self {
        ByteView::with_backing(Backing::Buf(cow))
    }

    /// Constructs a `ByteView` borrowing a byte slice.
    ///
    /// # Example
    ///
    /// ```
    /// use dwarfkit_common::ByteView;
    ///
    /// let view = ByteView::from_slice(b"\x01\x02");
    /// assert_eq!(view.len(), 2);
    /// ```
    pub fn from_slice(buffer: &'a [u8]) -> Self {
        ByteView::from_cow(Cow::Borrowed(buffer))
    }

    /// Constructs a `ByteView` that owns a vector of bytes.
    pub fn from_vec(buffer: Vec<u8>) -> Self {
        ByteView::from_cow(Cow::Owned(buffer))
    }

    /// Constructs a `ByteView` by memory mapping an open file.
    ///
    /// Empty files cannot be mapped on all platforms, so they are backed by an empty buffer
    /// instead.
    pub fn map_file(file: File) -> Result<Self, io::Error> {
        Self::map_file_ref(&file)
    }

    /// Constructs a `ByteView` by memory mapping a borrowed file handle.
    ///
    /// The mapping stays valid after the handle is closed.
    pub fn map_file_ref(file: &File) -> Result<Self, io::Error> {
        let backing = match unsafe { Mmap::map(file) } {
            Ok(mmap) => Backing::Mmap(mmap),
            Err(err) => {
                // Mapping an empty file fails with EINVAL on Linux.
                if err.kind() == io::ErrorKind::InvalidInput
                    || (cfg!(windows) && err.raw_os_error() == Some(1006))
                {
                    Backing::Buf(Cow::Borrowed(b""))
                } else {
                    return Err(err);
                }
            }
        };

        Ok(ByteView::with_backing(backing))
    }

    /// Opens and memory maps the file at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let file = File::open(path)?;
        Self::map_file(file)
    }

    /// Returns the entire contents as a slice.
    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        self.backing.deref()
    }

    /// Returns the `len` bytes starting at `offset`, or `None` if any of them is out of bounds.
    ///
    /// # Example
    ///
    /// ```
    /// use dwarfkit_common::ByteView;
    ///
    /// let view = ByteView::from_slice(b"abcdef");
    /// assert_eq!(view.range(2, 3), Some(&b"cde"[..]));
    /// assert_eq!(view.range(4, 3), None);
    /// assert_eq!(view.range(u64::MAX, 2), None);
    /// ```
    pub fn range(&self, offset: u64, len: u64) -> Option<&[u8]> {
        let range = byte_range(offset, len)?;
        self.as_slice().get(range)
    }
}

fn byte_range(offset: u64, len: u64) -> Option<Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    Some(start..end)
}

impl AsRef<[u8]> for ByteView<'_> {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Deref for ByteView<'_> {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}
