//! Mail.ru Cloud content fingerprint.
//!
//! Small payloads (at most 20 bytes) are their own fingerprint, zero-padded
//! to 20 bytes; anything larger is fingerprinted by SHA-1. Both forms render
//! as 40 hex digits so the two cases are indistinguishable on the wire.

use sha1::{Digest, Sha1};

/// Digest width in bytes.
pub const SIZE: usize = 20;

/// Streaming Mail.ru fingerprint state.
#[derive(Debug, Clone)]
pub struct MailruHash {
    /// First [`SIZE`] bytes of input, kept for the small-payload case
    head: [u8; SIZE],
    len: u64,
    sha1: Sha1,
}

impl MailruHash {
    pub fn new() -> Self {
        MailruHash {
            head: [0; SIZE],
            len: 0,
            sha1: Sha1::new(),
        }
    }

    pub fn update(&mut self, p: &[u8]) {
        if (self.len as usize) < SIZE {
            let take = p.len().min(SIZE - self.len as usize);
            let start = self.len as usize;
            self.head[start..start + take].copy_from_slice(&p[..take]);
        }
        self.sha1.update(p);
        self.len += p.len() as u64;
    }

    pub fn finalize(self) -> [u8; SIZE] {
        if self.len <= SIZE as u64 {
            self.head
        } else {
            self.sha1.finalize().into()
        }
    }
}

impl Default for MailruHash {
    fn default() -> Self {
        Self::new()
    }
}
