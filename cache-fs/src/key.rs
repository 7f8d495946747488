//! The object key: a 16-byte MD5 digest of the canonical URL, used as the
//! primary key of the fragment index.

use cache_fs_common::ByteSizeOf;
use std::fmt;

pub const OBJECT_KEY_LEN: usize = 16;

/// A 16-byte object key. Equality and hashing are defined on the raw bytes;
/// this type does not compute the digest itself, it only carries it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey([u8; OBJECT_KEY_LEN]);

impl ObjectKey {
    pub const fn new(bytes: [u8; OBJECT_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; OBJECT_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub const fn as_bytes(&self) -> &[u8; OBJECT_KEY_LEN] {
        &self.0
    }

    /// Computes the canonical key for a URL the way the outer admission
    /// layer is expected to: MD5 of the raw URL bytes. This engine never
    /// parses URLs itself; it only needs a stable way to derive test keys.
    #[cfg(feature = "test-util")]
    pub fn from_url(url: &str) -> Self {
        use md5::{Digest, Md5};
        let digest = Md5::digest(url.as_bytes());
        Self(digest.into())
    }
}

impl ByteSizeOf for ObjectKey {
    fn allocated_bytes(&self) -> usize {
        0
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}
