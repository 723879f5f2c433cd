//! Content fingerprints using blake3.
//!
//! A fingerprint identifies content for caching and event correlation. It is
//! deterministic (identical bytes give identical fingerprints) and is never
//! used as an integrity guarantee.

use std::fmt;
use std::path::Path;

/// A 256-bit content fingerprint (blake3 output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint arbitrary bytes.
    #[inline]
    pub fn of<T: AsRef<[u8]> + ?Sized>(data: &T) -> Self {
        Self(*blake3::hash(data.as_ref()).as_bytes())
    }

    /// Fingerprint a path by its textual form.
    ///
    /// The path itself is the unit of resolution: the same file referenced
    /// through the same composite path hits the same cache entry before it
    /// is ever read.
    pub fn of_path(path: &Path) -> Self {
        Self::of(path.as_os_str().as_encoded_bytes())
    }

    /// Convert to hex string.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 16 hex chars are plenty for logs
        write!(f, "{}", &self.to_hex()[..16])
    }
}
