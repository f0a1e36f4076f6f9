//! The multi-hasher tee.
//!
//! A [`MultiHasher`] is constructed from a [`HashSet`] and fans every write
//! out to one hasher per requested family, so a stream needs to be read only
//! once no matter how many digests the caller wants.

use std::collections::HashMap;
use std::io;

use md5::{Digest as _, Md5};
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncReadExt};
use whirlpool::Whirlpool;

use crate::dropbox::DropboxHash;
use crate::mrhash::MailruHash;
use crate::quickxor::QuickXorHash;
use crate::{to_hex, HashSet, HashType};

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Crc32(crc32fast::Hasher),
    Dropbox(DropboxHash),
    QuickXor(QuickXorHash),
    Whirlpool(Whirlpool),
    Mailru(MailruHash),
}

impl Hasher {
    fn new(t: HashType) -> Self {
        match t {
            HashType::Md5 => Hasher::Md5(Md5::new()),
            HashType::Sha1 => Hasher::Sha1(Sha1::new()),
            HashType::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
            HashType::Dropbox => Hasher::Dropbox(DropboxHash::new()),
            HashType::QuickXor => Hasher::QuickXor(QuickXorHash::new()),
            HashType::Whirlpool => Hasher::Whirlpool(Whirlpool::new()),
            HashType::Mailru => Hasher::Mailru(MailruHash::new()),
        }
    }

    fn update(&mut self, p: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(p),
            Hasher::Sha1(h) => h.update(p),
            Hasher::Crc32(h) => h.update(p),
            Hasher::Dropbox(h) => h.update(p),
            Hasher::QuickXor(h) => h.update(p),
            Hasher::Whirlpool(h) => h.update(p),
            Hasher::Mailru(h) => h.update(p),
        }
    }

    fn finalize(self) -> String {
        match self {
            Hasher::Md5(h) => to_hex(&h.finalize()),
            Hasher::Sha1(h) => to_hex(&h.finalize()),
            // CRC32 renders as the big-endian hex of the 32-bit value
            Hasher::Crc32(h) => to_hex(&h.finalize().to_be_bytes()),
            Hasher::Dropbox(h) => to_hex(&h.finalize()),
            Hasher::QuickXor(h) => to_hex(&h.finalize()),
            Hasher::Whirlpool(h) => to_hex(&h.finalize()),
            Hasher::Mailru(h) => to_hex(&h.finalize()),
        }
    }
}

/// Tees one byte stream into every hasher in a [`HashSet`].
///
/// Writes are delivered to each constituent hasher in enum order. Digests
/// come out of [`MultiHasher::finalize`] as lowercase hex; the map is
/// produced once, consuming the hasher.
pub struct MultiHasher {
    hashers: Vec<(HashType, Hasher)>,
    written: u64,
}

impl MultiHasher {
    /// A hasher for every family in `set`.
    pub fn new(set: HashSet) -> Self {
        MultiHasher {
            hashers: set.array().into_iter().map(|t| (t, Hasher::new(t))).collect(),
            written: 0,
        }
    }

    /// A hasher for every supported family.
    pub fn all() -> Self {
        Self::new(HashType::supported())
    }

    /// Total bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Absorb `p` into every constituent hasher.
    pub fn update(&mut self, p: &[u8]) {
        for (_, h) in &mut self.hashers {
            h.update(p);
        }
        self.written += p.len() as u64;
    }

    /// Finalize every digest, lowercase hex keyed by family.
    pub fn finalize(self) -> HashMap<HashType, String> {
        self.hashers
            .into_iter()
            .map(|(t, h)| (t, h.finalize()))
            .collect()
    }

    /// Finalize and pull out a single family's digest.
    pub fn finalize_one(self, t: HashType) -> Option<String> {
        self.finalize().remove(&t)
    }
}

impl io::Write for MultiHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hash an in-memory buffer with the requested families.
pub fn hash_bytes(set: HashSet, data: &[u8]) -> HashMap<HashType, String> {
    let mut mh = MultiHasher::new(set);
    mh.update(data);
    mh.finalize()
}

/// Drain `reader` through a [`MultiHasher`], returning all requested digests.
pub async fn hash_reader<R>(set: HashSet, reader: &mut R) -> io::Result<HashMap<HashType, String>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut mh = MultiHasher::new(set);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        mh.update(&buf[..n]);
    }
    Ok(mh.finalize())
}

/// Drain `reader` computing every supported digest.
pub async fn hash_stream<R>(reader: &mut R) -> io::Result<HashMap<HashType, String>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    hash_reader(HashType::supported(), reader).await
}
