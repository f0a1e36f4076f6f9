//! The per-transfer pipeline.
//!
//! One transfer moves one object: open the source, tee the stream through a
//! multi-hasher parameterized by the hash families both sides understand,
//! upload (simple or chunked by size), verify the destination digest against
//! the tee, and finally align the stored modification time. A verify
//! mismatch deletes the bad destination object and retries, bounded.
//!
//! Server-side copy and move short-circuit the pipeline when source and
//! destination are the same backend and the capability is advertised.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, info, trace, warn};

use flotilla_core::error::{FsError, FsResult};
use flotilla_core::fal::{ByteReader, Fs, Object, ObjectMeta, Precision};
use flotilla_core::meta::{format_meta_mtime, MTIME_KEY};
use flotilla_core::Ctx;
use flotilla_hash::{HashType, MultiHasher};
use flotilla_pacer::{SharedPacer, TokenDispenser, Verdict};

use crate::chunker;

/// Transfer pipeline tuning.
#[derive(Debug, Clone)]
pub struct TransferOpts {
    /// Objects at or above this size use the chunked uploader when the
    /// destination supports it.
    pub upload_cutoff: u64,
    /// Requested chunk size; `None` uses the backend default.
    pub chunk_size: Option<u64>,
    /// Outstanding chunk uploads per transfer.
    pub chunk_concurrency: usize,
    /// Compare digests after upload when a common family exists.
    pub verify: bool,
    /// Upload-and-verify attempts before the transfer fails.
    pub attempts: u32,
}

impl Default for TransferOpts {
    fn default() -> Self {
        TransferOpts {
            upload_cutoff: 200 * 1024 * 1024,
            chunk_size: None,
            chunk_concurrency: 4,
            verify: true,
            attempts: 3,
        }
    }
}

/// Lifecycle of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Opening,
    Transferring,
    Verifying,
    Finalizing,
    Done,
    Failed,
    Fatal,
}

/// One scheduled file movement.
pub struct Transfer {
    src_fs: Arc<dyn Fs>,
    dst_fs: Arc<dyn Fs>,
    src: Arc<dyn Object>,
    dst_remote: String,
    state: Mutex<TransferState>,
}

impl Transfer {
    pub fn new(
        src_fs: Arc<dyn Fs>,
        dst_fs: Arc<dyn Fs>,
        src: Arc<dyn Object>,
        dst_remote: impl Into<String>,
    ) -> Self {
        Transfer {
            src_fs,
            dst_fs,
            src,
            dst_remote: dst_remote.into(),
            state: Mutex::new(TransferState::Queued),
        }
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: TransferState) {
        trace!(remote = %self.dst_remote, ?next, "transfer state");
        *self.state.lock().unwrap() = next;
    }

    /// Run the pipeline to completion, recording bytes and outcome in the
    /// context's accounting.
    pub async fn run(&self, ctx: &Ctx, opts: &TransferOpts, pacer: &SharedPacer) -> FsResult<()> {
        let handle = ctx
            .stats()
            .start_transfer(self.dst_remote.clone(), Some(self.src.size()));

        let result = self.run_inner(ctx, opts, pacer).await;
        match &result {
            Ok(_) => {
                self.set_state(TransferState::Done);
                handle.done(None);
            }
            Err(err) if err.is_fatal() => {
                self.set_state(TransferState::Fatal);
                handle.done(Some(err));
            }
            Err(err) => {
                self.set_state(TransferState::Failed);
                handle.done(Some(err));
            }
        }
        result.map(|_| ())
    }

    async fn run_inner(
        &self,
        ctx: &Ctx,
        opts: &TransferOpts,
        pacer: &SharedPacer,
    ) -> FsResult<Arc<dyn Object>> {
        ctx.check()?;

        // Server-side acceleration within one backend.
        if self.src_fs.name() == self.dst_fs.name() && self.dst_fs.features().copy {
            self.set_state(TransferState::Transferring);
            match self.dst_fs.copy(Arc::clone(&self.src), &self.dst_remote).await {
                Ok(obj) => {
                    debug!(remote = %self.dst_remote, "server-side copy");
                    ctx.stats().add_server_side_copy();
                    return Ok(obj);
                }
                Err(FsError::CantCopy) => {}
                Err(err) => return Err(err),
            }
        }

        let tee_set = self.src_fs.hashes().overlap(self.dst_fs.hashes());
        let mut last_err = FsError::Validation("transfer never attempted".into());

        for attempt in 1..=opts.attempts.max(1) {
            ctx.check()?;
            match self.attempt(ctx, opts, pacer, tee_set).await {
                Ok(obj) => {
                    self.set_state(TransferState::Finalizing);
                    self.finalize_mtime(&obj).await?;
                    return Ok(obj);
                }
                Err(err) => {
                    warn!(
                        remote = %self.dst_remote,
                        attempt,
                        error = %err,
                        "transfer attempt failed"
                    );
                    if err.is_fatal() || matches!(err, FsError::Cancelled) {
                        return Err(err);
                    }
                    ctx.stats().add_retry();
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// One open → tee → upload → verify pass.
    async fn attempt(
        &self,
        ctx: &Ctx,
        opts: &TransferOpts,
        pacer: &SharedPacer,
        tee_set: flotilla_hash::HashSet,
    ) -> FsResult<Arc<dyn Object>> {
        self.set_state(TransferState::Opening);
        let size = self.src.size();
        let mod_time = self.src.mod_time();

        let mut meta = ObjectMeta::new(self.dst_remote.clone(), Some(size), mod_time);
        if self.dst_fs.features().user_metadata
            && self.dst_fs.precision() == Precision::NotSupported
        {
            meta.metadata
                .insert(MTIME_KEY.to_string(), format_meta_mtime(mod_time));
        }

        self.set_state(TransferState::Transferring);
        let use_chunked =
            self.dst_fs.features().open_chunk_writer && size >= opts.upload_cutoff;

        let (dst_obj, sums) = if use_chunked {
            let reader = self.open_source(pacer).await?;
            let (tee, sums) = TeeReader::new(reader, tee_set, ctx.clone());
            let limits = self.dst_fs.features().chunk_limits;
            let requested = opts.chunk_size.unwrap_or(limits.default_chunk_size);
            let plan = chunker::plan(size, requested, &limits)?;
            let dispenser = TokenDispenser::new(opts.chunk_concurrency);
            let obj = chunker::upload_chunked(
                ctx,
                &self.dst_fs,
                &meta,
                Box::new(tee),
                &plan,
                &dispenser,
                pacer,
            )
            .await?;
            (obj, sums.take())
        } else {
            let sums_slot: Mutex<Option<HashMap<HashType, String>>> = Mutex::new(None);
            let sums_slot_ref = &sums_slot;
            let src = &self.src;
            let dst_fs = &self.dst_fs;
            let meta_ref = &meta;
            let obj = pacer
                .call(|| async move {
                    let reader = match src.open(&[]).await {
                        Ok(r) => r,
                        Err(e) => return verdict_from(e),
                    };
                    let (tee, sums) = TeeReader::new(reader, tee_set, ctx.clone());
                    match dst_fs.put(Box::new(tee), meta_ref).await {
                        Ok(obj) => {
                            *sums_slot_ref.lock().unwrap() = Some(sums.take());
                            Verdict::Done(obj)
                        }
                        Err(e) => verdict_from(e),
                    }
                })
                .await?;
            let sums = sums_slot.into_inner().unwrap().unwrap_or_default();
            (obj, sums)
        };

        if opts.verify {
            self.set_state(TransferState::Verifying);
            if let Err(err) = self.verify(&dst_obj, &sums).await {
                // A corrupt destination object must not survive.
                if let Err(rm) = dst_obj.remove().await {
                    warn!(remote = %self.dst_remote, error = %rm, "could not remove bad object");
                }
                return Err(err);
            }
        }

        Ok(dst_obj)
    }

    async fn open_source(&self, pacer: &SharedPacer) -> FsResult<ByteReader> {
        let src = &self.src;
        pacer
            .call(|| async move {
                match src.open(&[]).await {
                    Ok(r) => Verdict::Done(r),
                    Err(e) => verdict_from(e),
                }
            })
            .await
    }

    /// Compare the teed digest with what the destination stored.
    async fn verify(
        &self,
        dst_obj: &Arc<dyn Object>,
        sums: &HashMap<HashType, String>,
    ) -> FsResult<()> {
        if dst_obj.size() != self.src.size() {
            return Err(FsError::Transient(format!(
                "size mismatch after upload: {} != {}",
                dst_obj.size(),
                self.src.size()
            )));
        }
        for (family, expect) in sums {
            if let Some(actual) = dst_obj.hash(*family).await? {
                if &actual != expect {
                    return Err(FsError::Transient(format!(
                        "{family} mismatch after upload: {actual} != {expect}"
                    )));
                }
                // One agreeing family is enough.
                debug!(remote = %self.dst_remote, %family, "digest verified");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Align the stored mtime with the source when the backend can.
    async fn finalize_mtime(&self, dst_obj: &Arc<dyn Object>) -> FsResult<()> {
        let want = self.src.mod_time();
        match self.dst_fs.precision() {
            Precision::NotSupported => Ok(()),
            Precision::Granular(granularity) => {
                let delta = (dst_obj.mod_time() - want)
                    .abs()
                    .to_std()
                    .unwrap_or_default();
                if delta <= granularity {
                    return Ok(());
                }
                match dst_obj.set_mod_time(want).await {
                    Ok(()) => Ok(()),
                    Err(FsError::CantSetModTime) => {
                        debug!(remote = %self.dst_remote, "backend cannot set mtime");
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }
}

/// Move one object: server-side when possible, else copy then delete.
pub async fn move_object(
    ctx: &Ctx,
    src_fs: &Arc<dyn Fs>,
    dst_fs: &Arc<dyn Fs>,
    src: &Arc<dyn Object>,
    dst_remote: &str,
    opts: &TransferOpts,
    pacer: &SharedPacer,
) -> FsResult<()> {
    if src_fs.name() == dst_fs.name() && dst_fs.features().move_obj {
        match dst_fs.move_obj(Arc::clone(src), dst_remote).await {
            Ok(_) => {
                info!(remote = %dst_remote, "server-side move");
                ctx.stats().add_server_side_move();
                return Ok(());
            }
            Err(FsError::CantMove) => {}
            Err(err) => return Err(err),
        }
    }

    let transfer = Transfer::new(
        Arc::clone(src_fs),
        Arc::clone(dst_fs),
        Arc::clone(src),
        dst_remote,
    );
    transfer.run(ctx, opts, pacer).await?;
    delete_object(ctx, src).await
}

/// Delete one destination object, pacing retries through accounting.
pub async fn delete_object(ctx: &Ctx, obj: &Arc<dyn Object>) -> FsResult<()> {
    ctx.check()?;
    obj.remove().await?;
    ctx.stats().add_delete();
    debug!(remote = %obj.remote(), "deleted");
    Ok(())
}

fn verdict_from<T>(err: FsError) -> Verdict<T, FsError> {
    if let Some(hint) = err.retry_after() {
        Verdict::RetryAfter(err, hint)
    } else if err.is_retryable() {
        Verdict::Retry(err)
    } else {
        Verdict::Fail(err)
    }
}

/// Shared slot the tee writes its finalized digests into.
pub struct TeeSums(Arc<Mutex<Option<MultiHasher>>>);

impl TeeSums {
    /// Finalize and take the digests; empty if the stream never finished.
    pub fn take(&self) -> HashMap<HashType, String> {
        self.0
            .lock()
            .unwrap()
            .take()
            .map(|h| h.finalize())
            .unwrap_or_default()
    }
}

/// Tees everything read through it into a [`MultiHasher`] and the byte
/// accounting, so uploads hash and meter without a second read.
pub struct TeeReader {
    inner: ByteReader,
    hasher: Arc<Mutex<Option<MultiHasher>>>,
    ctx: Ctx,
}

impl TeeReader {
    pub fn new(inner: ByteReader, set: flotilla_hash::HashSet, ctx: Ctx) -> (Self, TeeSums) {
        let hasher = Arc::new(Mutex::new(Some(MultiHasher::new(set))));
        let sums = TeeSums(Arc::clone(&hasher));
        (
            TeeReader {
                inner,
                hasher,
                ctx,
            },
            sums,
        )
    }
}

impl AsyncRead for TeeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                if !fresh.is_empty() {
                    if let Some(h) = me.hasher.lock().unwrap().as_mut() {
                        h.update(fresh);
                    }
                    if me.ctx.stats().add_bytes(fresh.len() as u64).is_err() {
                        return Poll::Ready(Err(std::io::Error::other(
                            "transfer byte budget exhausted",
                        )));
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use flotilla_memfs::{seed, MemFs};
    use flotilla_pacer::Pacer;
    use tokio::io::AsyncReadExt;

    fn t0() -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    fn pacer() -> SharedPacer {
        Arc::new(Pacer::with_defaults())
    }

    #[tokio::test]
    async fn test_tee_reader_hashes_and_counts() {
        let ctx = Ctx::new();
        let data: Vec<u8> = (1..=14).collect();
        let inner: ByteReader = Box::new(std::io::Cursor::new(data));
        let (mut tee, sums) = TeeReader::new(
            inner,
            flotilla_hash::HashSet::from_types(&[HashType::Md5, HashType::Crc32]),
            ctx.clone(),
        );

        let mut out = Vec::new();
        tee.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 14);
        assert_eq!(ctx.stats().bytes(), 14);

        let sums = sums.take();
        assert_eq!(sums[&HashType::Md5], "bf13fc19e5151ac57d4252e0e0f87abe");
        assert_eq!(sums[&HashType::Crc32], "a6041d7e");
    }

    #[tokio::test]
    async fn test_copy_between_stores_verifies() {
        let ctx = Ctx::new();
        let src_fs = MemFs::new("src");
        let dst_fs = MemFs::new("dst");
        seed(&src_fs, &[("b/f.bin", b"payload", t0())]).await.unwrap();

        let src_dyn = src_fs.clone() as Arc<dyn Fs>;
        let dst_dyn = dst_fs.clone() as Arc<dyn Fs>;
        let src = src_dyn.new_object("b/f.bin").await.unwrap();

        let transfer = Transfer::new(
            Arc::clone(&src_dyn),
            Arc::clone(&dst_dyn),
            src,
            "b/f.bin",
        );
        transfer
            .run(&ctx, &TransferOpts::default(), &pacer())
            .await
            .unwrap();
        assert_eq!(transfer.state(), TransferState::Done);

        let copied = dst_dyn.new_object("b/f.bin").await.unwrap();
        assert_eq!(copied.size(), 7);
        assert_eq!(copied.mod_time(), t0());
        assert_eq!(ctx.stats().transfers(), 1);
        assert_eq!(ctx.stats().bytes(), 7);
        // Cross-store copies move bytes, not manifests.
        assert_eq!(ctx.stats().server_side_copies(), 0);
    }

    #[tokio::test]
    async fn test_same_backend_uses_server_side_copy() {
        let ctx = Ctx::new();
        let fs = MemFs::new("mem");
        seed(&fs, &[("b/f.bin", b"payload", t0())]).await.unwrap();
        let fs_dyn = fs.clone() as Arc<dyn Fs>;
        let src = fs_dyn.new_object("b/f.bin").await.unwrap();

        let transfer = Transfer::new(
            Arc::clone(&fs_dyn),
            Arc::clone(&fs_dyn),
            src,
            "b/copy.bin",
        );
        transfer
            .run(&ctx, &TransferOpts::default(), &pacer())
            .await
            .unwrap();

        assert_eq!(ctx.stats().server_side_copies(), 1);
        // No bytes flowed through the engine.
        assert_eq!(ctx.stats().bytes(), 0);
        assert!(fs_dyn.new_object("b/copy.bin").await.is_ok());
    }

    #[tokio::test]
    async fn test_transient_put_failure_is_retried() {
        let ctx = Ctx::new();
        let src_fs = MemFs::new("src");
        let dst_fs = MemFs::new("dst");
        seed(&src_fs, &[("b/f.bin", b"payload", t0())]).await.unwrap();
        dst_fs.store().inject_put_failures(2);

        let src_dyn = src_fs as Arc<dyn Fs>;
        let dst_dyn = dst_fs.clone() as Arc<dyn Fs>;
        let src = src_dyn.new_object("b/f.bin").await.unwrap();

        let transfer = Transfer::new(Arc::clone(&src_dyn), Arc::clone(&dst_dyn), src, "b/f.bin");
        transfer
            .run(&ctx, &TransferOpts::default(), &pacer())
            .await
            .unwrap();
        assert!(dst_dyn.new_object("b/f.bin").await.is_ok());
    }

    #[tokio::test]
    async fn test_large_object_takes_chunked_path() {
        let ctx = Ctx::new();
        let src_fs = MemFs::new("src");
        let dst_fs = MemFs::new("dst");
        let payload: Vec<u8> = (0..4096).map(|i| (i % 197) as u8).collect();
        seed(&src_fs, &[("b/large.bin", &payload, t0())]).await.unwrap();

        let src_dyn = src_fs as Arc<dyn Fs>;
        let dst_dyn = dst_fs.clone() as Arc<dyn Fs>;
        let src = src_dyn.new_object("b/large.bin").await.unwrap();

        let opts = TransferOpts {
            upload_cutoff: 1024,
            chunk_size: Some(512),
            ..Default::default()
        };
        let transfer = Transfer::new(Arc::clone(&src_dyn), Arc::clone(&dst_dyn), src, "b/large.bin");
        transfer.run(&ctx, &opts, &pacer()).await.unwrap();

        let copied = dst_dyn.new_object("b/large.bin").await.unwrap();
        assert_eq!(copied.size(), 4096);
        let mut reader = copied.open(&[]).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
        assert_eq!(ctx.stats().bytes(), 4096);
    }

    #[tokio::test]
    async fn test_move_object_cross_backend() {
        let ctx = Ctx::new();
        let src_fs = MemFs::new("src");
        let dst_fs = MemFs::new("dst");
        seed(&src_fs, &[("b/f.bin", b"payload", t0())]).await.unwrap();

        let src_dyn = src_fs.clone() as Arc<dyn Fs>;
        let dst_dyn = dst_fs as Arc<dyn Fs>;
        let src = src_dyn.new_object("b/f.bin").await.unwrap();

        move_object(
            &ctx,
            &src_dyn,
            &dst_dyn,
            &src,
            "b/f.bin",
            &TransferOpts::default(),
            &pacer(),
        )
        .await
        .unwrap();

        assert!(dst_dyn.new_object("b/f.bin").await.is_ok());
        assert!(matches!(
            src_dyn.new_object("b/f.bin").await,
            Err(FsError::ObjectNotFound(_))
        ));
        assert_eq!(ctx.stats().deletes(), 1);
    }

    #[tokio::test]
    async fn test_move_object_same_backend_is_server_side() {
        let ctx = Ctx::new();
        let fs = MemFs::new("mem");
        seed(&fs, &[("b/f.bin", b"payload", t0())]).await.unwrap();
        let fs_dyn = fs as Arc<dyn Fs>;
        let src = fs_dyn.new_object("b/f.bin").await.unwrap();

        move_object(
            &ctx,
            &fs_dyn,
            &fs_dyn,
            &src,
            "b/moved.bin",
            &TransferOpts::default(),
            &pacer(),
        )
        .await
        .unwrap();

        assert_eq!(ctx.stats().server_side_moves(), 1);
        assert!(fs_dyn.new_object("b/moved.bin").await.is_ok());
        assert!(matches!(
            fs_dyn.new_object("b/f.bin").await,
            Err(FsError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_byte_budget_stops_transfer() {
        let stats = flotilla_core::accounting::Stats::with_max_transfer(Some(3));
        let ctx = Ctx::with_stats(stats);
        let src_fs = MemFs::new("src");
        let dst_fs = MemFs::new("dst");
        seed(&src_fs, &[("b/f.bin", b"payload", t0())]).await.unwrap();

        let src_dyn = src_fs as Arc<dyn Fs>;
        let dst_dyn = dst_fs as Arc<dyn Fs>;
        let src = src_dyn.new_object("b/f.bin").await.unwrap();

        let transfer = Transfer::new(Arc::clone(&src_dyn), Arc::clone(&dst_dyn), src, "b/f.bin");
        let err = transfer
            .run(&ctx, &TransferOpts::default(), &pacer())
            .await
            .unwrap_err();
        assert!(
            ctx.stats().max_transfer_reached() || !err.is_retryable(),
            "budget breach should surface: {err}"
        );
    }
}
