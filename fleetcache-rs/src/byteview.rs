//! Provides an immutable view on the bytes of a cached value.
//!
//! A [ByteView](ByteView) is what a [Group](crate::group::Group) hands out to its callers. As
//! the underlying buffer is shared with the cache entry which holds it, there is no way to
//! mutate the cached data through a view. If a caller needs an owned and modifiable copy, it
//! can use [byte_slice](ByteView::byte_slice).
//!
//! # Example
//!
//! ```
//! # use fleetcache::byteview::ByteView;
//! let view = ByteView::from("Hello");
//! assert_eq!(view.len(), 5);
//!
//! // Modifying a copy doesn't affect the view...
//! let mut copy = view.byte_slice();
//! copy[0] = b'J';
//! assert_eq!(view.to_string_lossy(), "Hello");
//! ```
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};

use bytes::Bytes;

use crate::lru::ByteSize;

/// Represents an immutable snapshot of the bytes of a cached value.
///
/// Cloning a view is cheap, as only a reference count is incremented.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ByteView {
    data: Bytes,
}

impl ByteView {
    /// Creates a new view for the given data.
    pub fn new(data: impl Into<Bytes>) -> Self {
        ByteView { data: data.into() }
    }

    /// Returns the number of bytes in this view.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if this view is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a copy of the underlying data.
    pub fn byte_slice(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Provides read-only access to the underlying data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the data as string while replacing invalid UTF-8 sequences.
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

impl ByteSize for ByteView {
    fn allocated_size(&self) -> usize {
        self.data.len()
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(data: Vec<u8>) -> Self {
        ByteView::new(data)
    }
}

impl From<Bytes> for ByteView {
    fn from(data: Bytes) -> Self {
        ByteView { data }
    }
}

impl From<String> for ByteView {
    fn from(data: String) -> Self {
        ByteView::new(data)
    }
}

impl From<&str> for ByteView {
    fn from(data: &str) -> Self {
        ByteView::new(Bytes::copy_from_slice(data.as_bytes()))
    }
}

impl Display for ByteView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}

impl Debug for ByteView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteView({:?})", self.data)
    }
}
