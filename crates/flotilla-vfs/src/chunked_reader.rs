//! Lazy range reader over `Object::open`.
//!
//! Remote reads are issued as bounded range requests. Sequential consumption
//! doubles the request window up to a cap so long streams settle into large
//! requests; a seek abandons the open request (closing it is mandatory) and
//! halves the window, so scattered access stays cheap. A read after `close`
//! fails with [`VfsError::FileClosed`].

use std::io::SeekFrom;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::trace;

use flotilla_core::fal::{ByteReader, Object, OpenOption};

use crate::error::{VfsError, VfsResult};

/// Default initial window: 128 KiB.
pub const DEFAULT_INITIAL_WINDOW: u64 = 128 * 1024;
/// Default window cap: 16 MiB.
pub const DEFAULT_MAX_WINDOW: u64 = 16 * 1024 * 1024;

/// Stitches contiguous and sparse reads over range requests.
pub struct ChunkedReader {
    object: Arc<dyn Object>,
    pos: u64,
    window: u64,
    initial_window: u64,
    max_window: u64,
    /// The open range request and the offset where it ends.
    current: Option<(ByteReader, u64)>,
    closed: bool,
}

impl ChunkedReader {
    pub fn new(object: Arc<dyn Object>) -> Self {
        Self::with_windows(object, DEFAULT_INITIAL_WINDOW, DEFAULT_MAX_WINDOW)
    }

    pub fn with_windows(object: Arc<dyn Object>, initial: u64, max: u64) -> Self {
        let initial = initial.max(1);
        let max = max.max(initial);
        ChunkedReader {
            object,
            pos: 0,
            window: initial,
            initial_window: initial,
            max_window: max,
            current: None,
            closed: false,
        }
    }

    /// Current logical position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// The window the next range request will use.
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Read into `buf` at the current position.
    pub async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        if self.closed {
            return Err(VfsError::FileClosed);
        }
        if buf.is_empty() || self.pos >= self.object.size() {
            return Ok(0);
        }

        if self.current.is_none() {
            let len = self.window.min(self.object.size() - self.pos);
            trace!(offset = self.pos, len, "opening range request");
            let reader = self
                .object
                .open(&[OpenOption::Range {
                    offset: self.pos,
                    count: Some(len),
                }])
                .await
                .map_err(VfsError::from_backend)?;
            self.current = Some((reader, self.pos + len));
        }

        let (reader, end) = self.current.as_mut().expect("request just opened");
        let n = reader.read(buf).await?;
        self.pos += n as u64;

        if self.pos >= *end || n == 0 {
            // Window exhausted while reading sequentially: grow it for the
            // next request.
            self.current = None;
            self.window = (self.window * 2).min(self.max_window);
        }
        Ok(n)
    }

    /// Read the exact length of `buf`, erroring on a short read.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> VfsResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(VfsError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read",
                )));
            }
            filled += n;
        }
        Ok(())
    }

    /// Reposition; abandons the open range request and shrinks the window.
    pub fn seek(&mut self, from: SeekFrom) -> VfsResult<u64> {
        if self.closed {
            return Err(VfsError::FileClosed);
        }
        let size = self.object.size();
        let next = match from {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::End(delta) => size as i64 + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if next < 0 {
            return Err(VfsError::Einval);
        }
        let next = next as u64;
        if next != self.pos {
            // Dropping the reader closes the outstanding request.
            self.current = None;
            self.window = (self.window / 2).max(self.initial_window);
            self.pos = next;
        }
        Ok(self.pos)
    }

    /// Close the reader; further reads fail with [`VfsError::FileClosed`].
    pub fn close(&mut self) {
        self.current = None;
        self.closed = true;
    }
}
