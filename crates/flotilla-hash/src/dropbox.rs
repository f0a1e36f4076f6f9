//! Dropbox content hash.
//!
//! The input is split into 4 MiB blocks; each block is hashed with SHA-256,
//! and the digest of the concatenated block digests is the content hash. An
//! empty input has zero blocks, so its hash is SHA-256 of the empty string.

use sha2::{Digest, Sha256};

/// Block size the digest is defined over.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Digest width in bytes.
pub const SIZE: usize = 32;

/// Streaming Dropbox content hash state.
#[derive(Debug, Clone)]
pub struct DropboxHash {
    block: Sha256,
    block_fill: usize,
    overall: Sha256,
}

impl DropboxHash {
    pub fn new() -> Self {
        DropboxHash {
            block: Sha256::new(),
            block_fill: 0,
            overall: Sha256::new(),
        }
    }

    pub fn update(&mut self, mut p: &[u8]) {
        while !p.is_empty() {
            let room = BLOCK_SIZE - self.block_fill;
            let take = p.len().min(room);
            self.block.update(&p[..take]);
            self.block_fill += take;
            p = &p[take..];

            if self.block_fill == BLOCK_SIZE {
                let digest = std::mem::replace(&mut self.block, Sha256::new()).finalize();
                self.overall.update(digest);
                self.block_fill = 0;
            }
        }
    }

    pub fn finalize(mut self) -> [u8; SIZE] {
        if self.block_fill > 0 {
            let digest = self.block.finalize();
            self.overall.update(digest);
        }
        self.overall.finalize().into()
    }
}

impl Default for DropboxHash {
    fn default() -> Self {
        Self::new()
    }
}
