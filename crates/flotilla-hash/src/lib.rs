//! Hash families and the multi-hasher tee.
//!
//! Every backend advertises the set of digest families it can compute
//! server-side; the sync engine intersects those sets to verify transfers
//! without re-reading data. This crate provides:
//!
//! - [`HashType`]: the closed enum of supported digest families
//! - [`HashSet`]: a compact bitmask over families with pure set operations
//! - [`MultiHasher`]: a write sink that tees one byte stream into every
//!   requested hasher at once
//! - Custom digests with no ecosystem crate: [`quickxor`] (OneDrive) and
//!   [`mrhash`] (Mail.ru), plus the block-wise [`dropbox`] digest
//!
//! All digests are rendered as lowercase hex on the wire regardless of how a
//! backend stores them; [`decode_base64_hash`] normalizes base64 storage.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use thiserror::Error;

pub mod dropbox;
pub mod mrhash;
pub mod multihasher;
pub mod quickxor;

pub use multihasher::{hash_bytes, MultiHasher};

/// Errors from hash parsing and computation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashError {
    /// The named hash family is not known to this build
    #[error("unsupported hash type: {0}")]
    Unsupported(String),

    /// A digest string did not have the expected format
    #[error("malformed hash value: {0}")]
    Malformed(String),
}

/// A digest family a backend may support.
///
/// The discriminants are stable bit positions; [`HashSet`] relies on them
/// staying in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum HashType {
    /// MD5, 128 bits
    Md5 = 1 << 0,
    /// SHA-1, 160 bits
    Sha1 = 1 << 1,
    /// CRC-32 (IEEE), 32 bits
    Crc32 = 1 << 2,
    /// Dropbox content hash: SHA-256 per 4 MiB block, then SHA-256 of the
    /// concatenated block digests
    Dropbox = 1 << 3,
    /// Microsoft QuickXorHash, 160 bits
    QuickXor = 1 << 4,
    /// Whirlpool, 512 bits
    Whirlpool = 1 << 5,
    /// Mail.ru Cloud fingerprint, 160 bits
    Mailru = 1 << 6,
}

/// All families, in stable enum order.
const ALL: [HashType; 7] = [
    HashType::Md5,
    HashType::Sha1,
    HashType::Crc32,
    HashType::Dropbox,
    HashType::QuickXor,
    HashType::Whirlpool,
    HashType::Mailru,
];

impl HashType {
    /// The stable wire name of this family.
    pub fn name(self) -> &'static str {
        match self {
            HashType::Md5 => "MD5",
            HashType::Sha1 => "SHA-1",
            HashType::Crc32 => "CRC32",
            HashType::Dropbox => "DropboxHash",
            HashType::QuickXor => "QuickXorHash",
            HashType::Whirlpool => "Whirlpool",
            HashType::Mailru => "MailruHash",
        }
    }

    /// Digest width in bytes.
    pub fn width(self) -> usize {
        match self {
            HashType::Md5 => 16,
            HashType::Sha1 => 20,
            HashType::Crc32 => 4,
            HashType::Dropbox => 32,
            HashType::QuickXor => 20,
            HashType::Whirlpool => 64,
            HashType::Mailru => 20,
        }
    }

    /// The set of every supported family.
    pub fn supported() -> HashSet {
        HashSet::from_types(&ALL)
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashType {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL.iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| HashError::Unsupported(s.to_string()))
    }
}

/// A compact bitmask over [`HashType`]s.
///
/// All set operations are pure and allocation-free; only [`HashSet::array`]
/// and the `Display` impl allocate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HashSet(u32);

impl HashSet {
    /// The empty set.
    pub const fn new() -> Self {
        HashSet(0)
    }

    /// Build a set from a slice of types.
    pub fn from_types(types: &[HashType]) -> Self {
        types.iter().fold(HashSet(0), |s, &t| s.add(t))
    }

    /// Return the set with `t` added.
    #[must_use]
    pub const fn add(self, t: HashType) -> Self {
        HashSet(self.0 | t as u32)
    }

    /// Whether `t` is a member.
    pub const fn contains(self, t: HashType) -> bool {
        self.0 & t as u32 != 0
    }

    /// Number of members.
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Whether the set has no members.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The intersection of the two sets.
    #[must_use]
    pub const fn overlap(self, other: HashSet) -> Self {
        HashSet(self.0 & other.0)
    }

    /// Whether every member of `self` is also in `other`.
    pub const fn subset_of(self, other: HashSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// An arbitrary but deterministic member: the first in enum order.
    /// Returns `None` for the empty set.
    pub fn get_one(self) -> Option<HashType> {
        ALL.iter().copied().find(|&t| self.contains(t))
    }

    /// Members in stable enum order.
    pub fn array(self) -> Vec<HashType> {
        ALL.iter().copied().filter(|&t| self.contains(t)).collect()
    }
}

impl fmt::Display for HashSet {
    /// Prints `[NAME1, NAME2, …]` with members in enum order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, t) in self.array().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{t}")?;
        }
        write!(f, "]")
    }
}

impl FromIterator<HashType> for HashSet {
    fn from_iter<I: IntoIterator<Item = HashType>>(iter: I) -> Self {
        iter.into_iter().fold(HashSet::new(), |s, t| s.add(t))
    }
}

/// Render a digest as lowercase hex.
pub fn to_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use fmt::Write as _;
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Normalize a digest a backend stored in base64 into lowercase hex.
///
/// Several object stores return MD5 or QuickXorHash values base64-encoded;
/// consumers always see hex.
pub fn decode_base64_hash(value: &str) -> Result<String, HashError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|_| HashError::Malformed(value.to_string()))?;
    Ok(to_hex(&raw))
}

/// Parse a compound checksum header of the form `NAME:hex`.
pub fn parse_compound(header: &str) -> Result<(HashType, String), HashError> {
    let (name, hex) = header
        .split_once(':')
        .ok_or_else(|| HashError::Malformed(header.to_string()))?;
    let t: HashType = name.trim().parse()?;
    let hex = hex.trim();
    if hex.len() != t.width() * 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HashError::Malformed(header.to_string()));
    }
    Ok((t, hex.to_ascii_lowercase()))
}

/// Format a compound checksum header.
pub fn format_compound(t: HashType, hex: &str) -> String {
    format!("{}:{}", t.name(), hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names_round_trip() {
        for t in ALL {
            assert_eq!(t.name().parse::<HashType>().unwrap(), t);
        }
        assert_eq!("md5".parse::<HashType>().unwrap(), HashType::Md5);
        assert!(matches!(
            "nope".parse::<HashType>(),
            Err(HashError::Unsupported(_))
        ));
    }

    #[test]
    fn test_set_basics() {
        let mut h = HashSet::new();
        assert_eq!(h.count(), 0);
        assert!(h.array().is_empty());
        assert_eq!(h.get_one(), None);

        h = h.add(HashType::Md5);
        assert_eq!(h.count(), 1);
        assert_eq!(h.get_one(), Some(HashType::Md5));
        assert_eq!(h.array(), vec![HashType::Md5]);

        h = h.overlap(HashType::supported());
        assert_eq!(h.count(), 1);
        assert!(h.subset_of(HashType::supported()));
        assert!(h.subset_of(HashSet::from_types(&[HashType::Md5])));

        h = h.add(HashType::Sha1);
        assert_eq!(h.count(), 2);
        let one = h.get_one().unwrap();
        assert!(one == HashType::Md5 || one == HashType::Sha1);
        assert!(h.subset_of(HashType::supported()));
        assert!(!h.subset_of(HashSet::from_types(&[HashType::Md5])));
        assert!(!h.subset_of(HashSet::from_types(&[HashType::Sha1])));
        assert!(h.subset_of(HashSet::from_types(&[HashType::Md5, HashType::Sha1])));
    }

    #[test]
    fn test_set_overlap() {
        let h = HashSet::from_types(&[HashType::Md5, HashType::Sha1]);

        let ol = h.overlap(HashSet::from_types(&[HashType::Md5]));
        assert_eq!(ol.count(), 1);
        assert!(ol.contains(HashType::Md5));
        assert!(!ol.contains(HashType::Sha1));

        let ol = h.overlap(HashSet::from_types(&[HashType::Md5, HashType::Sha1]));
        assert_eq!(ol.count(), 2);
    }

    #[test]
    fn test_overlap_count_bound() {
        let s = HashSet::from_types(&[HashType::Md5, HashType::Crc32, HashType::Mailru]);
        let t = HashSet::from_types(&[HashType::Md5, HashType::Whirlpool]);
        assert!(s.overlap(t).count() <= s.count().min(t.count()));
    }

    #[test]
    fn test_set_stringer() {
        let h = HashSet::from_types(&[
            HashType::Sha1,
            HashType::Md5,
            HashType::Dropbox,
            HashType::QuickXor,
        ]);
        assert_eq!(h.to_string(), "[MD5, SHA-1, DropboxHash, QuickXorHash]");
        assert_eq!(
            HashSet::from_types(&[HashType::Sha1]).to_string(),
            "[SHA-1]"
        );
        assert_eq!(HashSet::new().to_string(), "[]");
    }

    #[test]
    fn test_type_stringer() {
        assert_eq!(HashType::Md5.to_string(), "MD5");
        assert_eq!(HashType::QuickXor.to_string(), "QuickXorHash");
    }

    #[test]
    fn test_decode_base64_hash() {
        // "1B2M2Y8AsgTpgAmY7PhCfg==" is the base64 MD5 of the empty string
        assert_eq!(
            decode_base64_hash("1B2M2Y8AsgTpgAmY7PhCfg==").unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert!(decode_base64_hash("!!!").is_err());
    }

    #[test]
    fn test_compound_round_trip() {
        let hex = "d41d8cd98f00b204e9800998ecf8427e";
        let header = format_compound(HashType::Md5, hex);
        assert_eq!(header, format!("MD5:{hex}"));
        let (t, h) = parse_compound(&header).unwrap();
        assert_eq!(t, HashType::Md5);
        assert_eq!(h, hex);

        assert!(parse_compound("MD5").is_err());
        assert!(parse_compound("MD5:zz").is_err());
        assert!(parse_compound("XXH3:00").is_err());
    }
}
