//! The optional-capability record every backend advertises.
//!
//! A flat record of flags plus chunked-upload limits. Once a handle
//! advertises a capability it must behave as specified for the handle's
//! entire life; the engine branches on these flags and never inspects the
//! concrete backend type.

/// Limits governing chunked uploads on a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    /// Preferred part size when the caller does not specify one.
    pub default_chunk_size: u64,
    /// Hard ceiling on part size; a transfer whose part count cannot be
    /// brought under `max_upload_parts` without exceeding this fails.
    pub max_chunk_size: u64,
    /// Maximum number of parts in one upload manifest.
    pub max_upload_parts: u32,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        ChunkLimits {
            default_chunk_size: 4 * 1024 * 1024,
            max_chunk_size: 4 * 1024 * 1024 * 1024,
            max_upload_parts: 50_000,
        }
    }
}

/// Capability flags for one backend handle.
#[derive(Debug, Clone, Default)]
pub struct Features {
    /// Server-side single-object copy.
    pub copy: bool,
    /// Server-side single-object move.
    pub move_obj: bool,
    /// Server-side whole-directory move.
    pub dir_move: bool,
    /// One-shot recursive delete.
    pub purge: bool,
    /// Uploads of unknown length.
    pub put_stream: bool,
    /// One-call recursive listing (`Fs::list_recursive`).
    pub list_r: bool,
    /// Public link creation.
    pub public_link: bool,
    /// Quota reporting.
    pub about: bool,
    /// Server-side garbage collection.
    pub clean_up: bool,
    pub read_mime_type: bool,
    pub write_mime_type: bool,
    /// Whether a directory can exist with nothing in it. Bucket stores
    /// usually cannot; the engine defers empty-directory creation for them.
    pub can_have_empty_directories: bool,
    /// Flat namespace of buckets rather than a hierarchy.
    pub bucket_based: bool,
    pub set_tier: bool,
    /// Random-access writes into an upload.
    pub open_writer_at: bool,
    /// Chunked-upload sessions (`Fs::open_chunk_writer`).
    pub open_chunk_writer: bool,
    /// Arbitrary key/value metadata on objects; enables the `mtime`
    /// metadata convention when precision is unsupported.
    pub user_metadata: bool,
    pub dir_set_mod_time: bool,
    pub mkdir_metadata: bool,
    /// Chunked-upload limits; meaningful when `open_chunk_writer` is set.
    pub chunk_limits: ChunkLimits,
}

impl Features {
    /// Start from no capabilities.
    pub fn none() -> Self {
        Features::default()
    }
}
