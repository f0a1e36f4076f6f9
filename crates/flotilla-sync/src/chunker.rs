//! Chunked uploads for large objects.
//!
//! The part size is rounded up so the part count stays under the backend's
//! manifest limit, doubling until it fits; exceeding the backend's hard
//! maximum part size fails the transfer before any bytes move. Parts upload
//! concurrently, bounded by a token dispenser, each as an independent
//! retryable unit; the manifest commits only after every part acknowledges.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use flotilla_core::error::{FsError, FsResult};
use flotilla_core::fal::{ByteReader, ChunkWriter, Fs, Object, ObjectMeta};
use flotilla_core::features::ChunkLimits;
use flotilla_core::Ctx;
use flotilla_pacer::{SharedPacer, TokenDispenser, Verdict};

/// A resolved chunking decision for one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_size: u64,
    pub parts: u32,
}

/// Choose a chunk size for `size` bytes within the backend's limits.
pub fn plan(size: u64, requested: u64, limits: &ChunkLimits) -> FsResult<ChunkPlan> {
    if requested == 0 {
        return Err(FsError::Validation("chunk size must be positive".into()));
    }
    let max_parts = u64::from(limits.max_upload_parts.max(1));

    let mut chunk_size = requested;
    loop {
        let parts = size.div_ceil(chunk_size).max(1);
        if parts <= max_parts {
            return Ok(ChunkPlan {
                chunk_size,
                parts: parts as u32,
            });
        }
        let doubled = chunk_size.saturating_mul(2);
        if doubled > limits.max_chunk_size {
            return Err(FsError::Validation(format!(
                "{size} bytes cannot fit in {max_parts} parts without exceeding the \
                 {}-byte chunk ceiling",
                limits.max_chunk_size
            )));
        }
        debug!(
            from = chunk_size,
            to = doubled,
            "doubling chunk size to fit the part limit"
        );
        chunk_size = doubled;
    }
}

/// Upload `reader` in `plan.chunk_size` parts and commit the manifest.
pub async fn upload_chunked(
    ctx: &Ctx,
    dst_fs: &Arc<dyn Fs>,
    meta: &ObjectMeta,
    mut reader: ByteReader,
    plan: &ChunkPlan,
    dispenser: &TokenDispenser,
    pacer: &SharedPacer,
) -> FsResult<Arc<dyn Object>> {
    let writer: Arc<dyn ChunkWriter> =
        Arc::from(dst_fs.open_chunk_writer(meta, plan.chunk_size).await?);

    let mut tasks: JoinSet<FsResult<()>> = JoinSet::new();
    let mut index: u32 = 0;
    let outcome: FsResult<()> = async {
        loop {
            ctx.check()?;
            let chunk = read_full_chunk(&mut reader, plan.chunk_size as usize).await?;
            if chunk.is_empty() {
                break;
            }

            let token = dispenser.get().await;
            let writer = Arc::clone(&writer);
            let pacer = Arc::clone(pacer);
            let this_index = index;
            trace!(index = this_index, len = chunk.len(), "scheduling part");
            tasks.spawn(async move {
                let _token = token;
                pacer
                    .call(|| {
                        let writer = Arc::clone(&writer);
                        let chunk = chunk.clone();
                        async move {
                            match writer.write_chunk(this_index, chunk).await {
                                Ok(()) => Verdict::Done(()),
                                Err(e) if e.is_retryable() => Verdict::Retry(e),
                                Err(e) => Verdict::Fail(e),
                            }
                        }
                    })
                    .await
            });
            index += 1;

            // Keep failures from going unnoticed while we read ahead.
            while let Some(done) = tasks.try_join_next() {
                done.map_err(|e| FsError::Fatal(format!("chunk task panicked: {e}")))??;
            }
        }

        while let Some(done) = tasks.join_next().await {
            done.map_err(|e| FsError::Fatal(format!("chunk task panicked: {e}")))??;
        }
        Ok(())
    }
    .await;

    if let Err(err) = outcome {
        warn!(remote = %meta.remote, error = %err, "aborting chunked upload");
        if let Err(abort_err) = writer.abort().await {
            warn!(remote = %meta.remote, error = %abort_err, "abort failed");
        }
        return Err(err);
    }

    debug!(remote = %meta.remote, parts = index, "committing manifest");
    writer.commit().await
}

/// Read exactly one chunk (shorter only at end of stream).
async fn read_full_chunk(reader: &mut ByteReader, chunk_size: usize) -> FsResult<Bytes> {
    let mut buf = Vec::with_capacity(chunk_size.min(1 << 20));
    let mut remaining = chunk_size;
    while remaining > 0 {
        let mut tmp = vec![0u8; remaining.min(64 * 1024)];
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        remaining -= n;
    }
    Ok(Bytes::from(buf))
}
