//! Flotilla core - the filesystem abstraction layer.
//!
//! This crate defines the contract every storage backend implements and the
//! shared machinery the engine layers sit on:
//!
//! - The [`Fs`](fal::Fs) / [`Object`](fal::Object) capability traits and the
//!   [`Features`](features::Features) record backends advertise
//! - The error taxonomy ([`FsError`](error::FsError)) with kind,
//!   retryability and exit-code classification
//! - `remote:path` parsing ([`path`]) and the reserved-character
//!   [`encoder`] between logical and backend-native names
//! - Include/exclude [`filter`] rules
//! - Transfer [`accounting`]
//! - The backend [`registry`] with the process-wide Fs cache
//! - [`config`] maps and the credential obscure codec
//! - Modification-time metadata conventions ([`meta`])

pub mod accounting;
pub mod config;
pub mod context;
pub mod encoder;
pub mod error;
pub mod fal;
pub mod features;
pub mod filter;
pub mod meta;
pub mod path;
pub mod registry;

pub use context::Ctx;
pub use error::{ErrorKind, FsError, FsResult};
pub use fal::{ByteReader, ChunkWriter, DirEntry, Directory, Fs, Object, ObjectMeta, OpenOption, Precision};
pub use features::Features;
