//! Sync orchestration: walk both sides, diff, and drain the decisions
//! through a bounded worker pool.
//!
//! Workers are independent except that a given destination remote is only
//! ever written by one worker at a time (a per-path lock map enforces the
//! ordering guarantee). A single failed object records its error and the
//! run continues; a fatal error cancels the context and drains the pool.
//! Deletions run before, during or after the transfer phase as configured;
//! empty directories on the destination are pruned deepest-first at the end.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use flotilla_core::error::{FsError, FsResult};
use flotilla_core::fal::{DirEntry, Fs, Object};
use flotilla_core::filter::Filter;
use flotilla_core::Ctx;
use flotilla_pacer::{Pacer, PacerConfig, SharedPacer};

use crate::diff::{diff, Action, DiffOpts};
use crate::transfer::{move_object, Transfer, TransferOpts};
use crate::walk::{walk, WalkOpts};

/// When destination-only files are removed relative to the transfer phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Never delete (plain copy).
    Off,
    Before,
    During,
    After,
}

/// Orchestration tuning.
#[derive(Debug, Clone)]
pub struct SyncOpts {
    /// Size of the transfer worker pool.
    pub transfers: usize,
    pub walk: WalkOpts,
    pub diff: DiffOpts,
    pub transfer: TransferOpts,
    pub delete_mode: DeleteMode,
    /// Mirror empty source directories when the destination can represent
    /// them; otherwise their creation is deferred until a file lands inside.
    pub create_empty_dirs: bool,
    pub pacer: PacerConfig,
}

impl Default for SyncOpts {
    fn default() -> Self {
        SyncOpts {
            transfers: 4,
            walk: WalkOpts::default(),
            diff: DiffOpts::default(),
            transfer: TransferOpts::default(),
            delete_mode: DeleteMode::During,
            create_empty_dirs: true,
            pacer: PacerConfig::default(),
        }
    }
}

/// Aggregate of one run.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub transferred: u64,
    pub checked: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub deleted_dirs: u64,
    pub errors: u64,
    /// The error that should drive the exit code, when any occurred.
    pub most_severe: Option<FsError>,
}

impl SyncOutcome {
    fn from_ctx(ctx: &Ctx) -> Self {
        let stats = ctx.stats();
        SyncOutcome {
            transferred: stats.transfers(),
            checked: stats.checks(),
            skipped: stats.skipped(),
            deleted: stats.deletes(),
            deleted_dirs: stats.deleted_dirs(),
            errors: stats.errors(),
            most_severe: stats.last_error(),
        }
    }
}

/// Make the destination mirror the source, deleting what the source lacks.
pub async fn sync(
    ctx: &Ctx,
    src_fs: &Arc<dyn Fs>,
    dst_fs: &Arc<dyn Fs>,
    filter: &Filter,
    opts: &SyncOpts,
) -> FsResult<SyncOutcome> {
    run(ctx, src_fs, dst_fs, filter, opts).await
}

/// Copy source to destination without deleting anything.
pub async fn copy_dirs(
    ctx: &Ctx,
    src_fs: &Arc<dyn Fs>,
    dst_fs: &Arc<dyn Fs>,
    filter: &Filter,
    opts: &SyncOpts,
) -> FsResult<SyncOutcome> {
    let opts = SyncOpts {
        delete_mode: DeleteMode::Off,
        ..opts.clone()
    };
    run(ctx, src_fs, dst_fs, filter, &opts).await
}

/// Move source to destination: server-side when the backend can, else copy
/// and delete. Empty source directories are pruned afterwards.
pub async fn move_dirs(
    ctx: &Ctx,
    src_fs: &Arc<dyn Fs>,
    dst_fs: &Arc<dyn Fs>,
    filter: &Filter,
    opts: &SyncOpts,
) -> FsResult<SyncOutcome> {
    let pacer: SharedPacer = Arc::new(Pacer::new(opts.pacer.clone()));

    // Whole-subtree server-side move when nothing filters the tree.
    if filter.is_default()
        && src_fs.name() == dst_fs.name()
        && dst_fs.features().dir_move
    {
        match dst_fs.dir_move(Arc::clone(src_fs), "", "").await {
            Ok(()) => {
                info!(src = %src_fs.string(), dst = %dst_fs.string(), "server-side directory move");
                ctx.stats().add_server_side_move();
                return Ok(SyncOutcome::from_ctx(ctx));
            }
            Err(FsError::CantDirMove) => {}
            Err(err) => {
                debug!(error = %err, "directory move fast path unavailable");
            }
        }
    }

    let entries = walk(ctx, src_fs, "", filter, &opts.walk).await?;
    for entry in &entries {
        ctx.check()?;
        if let DirEntry::Object(src) = entry {
            let remote = src.remote();
            if let Err(err) = move_object(
                ctx,
                src_fs,
                dst_fs,
                src,
                &remote,
                &opts.transfer,
                &pacer,
            )
            .await
            {
                if err.is_fatal() {
                    ctx.stats().error(&err);
                    return Err(err);
                }
                ctx.stats().error(&err);
            }
        }
    }

    // Prune now-empty source directories, children before parents.
    let mut dirs: Vec<String> = entries
        .iter()
        .filter(|e| e.is_dir())
        .map(|e| e.remote())
        .collect();
    dirs.sort_by(|a, b| b.cmp(a));
    for dir in dirs {
        if let Err(err) = src_fs.rmdir(&dir).await {
            debug!(dir = %dir, error = %err, "source directory not pruned");
        }
    }

    Ok(SyncOutcome::from_ctx(ctx))
}

enum Job {
    Transfer {
        src: Arc<dyn Object>,
        remote: String,
    },
    Delete {
        dst: Arc<dyn Object>,
    },
}

async fn run(
    ctx: &Ctx,
    src_fs: &Arc<dyn Fs>,
    dst_fs: &Arc<dyn Fs>,
    filter: &Filter,
    opts: &SyncOpts,
) -> FsResult<SyncOutcome> {
    let pacer: SharedPacer = Arc::new(Pacer::new(opts.pacer.clone()));

    // Make sure the destination root exists before anything lands in it.
    dst_fs.mkdir("").await.ok();

    eprintln!("DEBUG: about to walk");
    let (src_entries, dst_listing) = tokio::join!(
        walk(ctx, src_fs, "", filter, &opts.walk),
        walk(ctx, dst_fs, "", filter, &opts.walk)
    );
    eprintln!("DEBUG: walked");
    let src_entries = src_entries?;
    let dst_entries = match dst_listing {
        Ok(entries) => entries,
        // An absent destination is an empty one.
        Err(FsError::DirNotFound(_)) => Vec::new(),
        Err(err) => return Err(err),
    };
    eprintln!("DEBUG: about to diff, src={} dst={}", src_entries.len(), dst_entries.len());

    let decisions = diff(ctx, src_fs, dst_fs, &src_entries, &dst_entries, &opts.diff).await?;
    eprintln!("DEBUG: diffed, decisions={}", decisions.len());

    let mut makedirs: Vec<String> = Vec::new();
    let mut rmdirs: Vec<String> = Vec::new();
    let mut deletes: Vec<Arc<dyn Object>> = Vec::new();
    let mut moves: Vec<(Arc<dyn Object>, String)> = Vec::new();

    for d in &decisions {
        match (&d.action, &d.src, &d.dst) {
            (Action::MakeDir, _, _) => makedirs.push(d.remote.clone()),
            (Action::RemoveDir, _, _) => rmdirs.push(d.remote.clone()),
            (Action::Delete, _, Some(DirEntry::Object(o))) => deletes.push(Arc::clone(o)),
            (Action::Copy | Action::Update, Some(DirEntry::Object(o)), _) => {
                moves.push((Arc::clone(o), d.remote.clone()))
            }
            _ => {}
        }
    }

    let deleting = opts.delete_mode != DeleteMode::Off;

    // Directories are mirrored before files land in them.
    if opts.create_empty_dirs && dst_fs.features().can_have_empty_directories {
        for dir in &makedirs {
            ctx.check()?;
            if let Err(err) = dst_fs.mkdir(dir).await {
                ctx.stats().error(&err);
            }
        }
    }

    eprintln!("DEBUG: makedirs done");
    if deleting && opts.delete_mode == DeleteMode::Before {
        eprintln!("DEBUG: deleting before, n={}", deletes.len());
        delete_files(ctx, &deletes).await;
        eprintln!("DEBUG: deleted before");
    }

    // The transfer pool. A FIFO feeds `transfers` workers; the per-remote
    // lock map keeps a destination path single-writer.
    let (tx, rx) = mpsc::channel::<Job>(opts.transfers.max(1) * 2);
    let rx = Arc::new(Mutex::new(rx));
    let locks: Arc<DashMap<String, Arc<Mutex<()>>>> = Arc::new(DashMap::new());

    let mut workers: JoinSet<()> = JoinSet::new();
    for _ in 0..opts.transfers.max(1) {
        let rx = Arc::clone(&rx);
        let locks = Arc::clone(&locks);
        let ctx = ctx.clone();
        let src_fs = Arc::clone(src_fs);
        let dst_fs = Arc::clone(dst_fs);
        let topts = opts.transfer.clone();
        let pacer = Arc::clone(&pacer);
        workers.spawn(async move {
            loop {
                let job = { rx.lock().await.recv().await };
                let Some(job) = job else { break };
                if ctx.is_cancelled() {
                    continue;
                }
                match job {
                    Job::Transfer { src, remote } => {
                        let lock = Arc::clone(
                            locks
                                .entry(remote.clone())
                                .or_insert_with(|| Arc::new(Mutex::new(())))
                                .value(),
                        );
                        let _guard = lock.lock().await;
                        let transfer = Transfer::new(
                            Arc::clone(&src_fs),
                            Arc::clone(&dst_fs),
                            src,
                            remote,
                        );
                        if let Err(err) = transfer.run(&ctx, &topts, &pacer).await {
                            if err.is_fatal() {
                                warn!(error = %err, "fatal error, stopping the pool");
                                ctx.cancel();
                            }
                        }
                    }
                    Job::Delete { dst } => {
                        let remote = dst.remote();
                        let lock = Arc::clone(
                            locks
                                .entry(remote)
                                .or_insert_with(|| Arc::new(Mutex::new(())))
                                .value(),
                        );
                        let _guard = lock.lock().await;
                        match dst.remove().await {
                            Ok(()) => ctx.stats().add_delete(),
                            Err(err) => ctx.stats().error(&err),
                        }
                    }
                }
            }
        });
    }

    // Feed the FIFO: deletes interleave with transfers in During mode.
    if deleting && opts.delete_mode == DeleteMode::During {
        for dst in &deletes {
            if tx.send(Job::Delete { dst: Arc::clone(dst) }).await.is_err() {
                break;
            }
        }
    }
    for (src, remote) in moves {
        if ctx.stats().max_transfer_reached() {
            break;
        }
        if tx.send(Job::Transfer { src, remote }).await.is_err() {
            break;
        }
    }
    drop(tx);
    while workers.join_next().await.is_some() {}

    if deleting && opts.delete_mode == DeleteMode::After {
        delete_files(ctx, &deletes).await;
    }

    // Destination-only directories go last, children before parents.
    if deleting {
        rmdirs.sort_by(|a, b| b.cmp(a));
        for dir in rmdirs {
            ctx.check()?;
            match dst_fs.rmdir(&dir).await {
                Ok(()) => ctx.stats().add_deleted_dir(),
                // Filtered-out content legitimately keeps a directory alive.
                Err(FsError::DirectoryNotEmpty(_)) | Err(FsError::DirNotFound(_)) => {}
                Err(err) => ctx.stats().error(&err),
            }
        }
    }

    if ctx.is_cancelled() {
        // Backends that leak resumable-upload sessions on abort get a
        // chance to collect them.
        if dst_fs.features().clean_up {
            if let Err(err) = dst_fs.clean_up().await {
                debug!(error = %err, "cleanup after cancellation failed");
            }
        }
        if !ctx.stats().had_fatal_error() {
            return Err(FsError::Cancelled);
        }
    }

    let outcome = SyncOutcome::from_ctx(ctx);
    info!(
        transferred = outcome.transferred,
        checked = outcome.checked,
        skipped = outcome.skipped,
        deleted = outcome.deleted,
        errors = outcome.errors,
        "sync finished"
    );
    Ok(outcome)
}

async fn delete_files(ctx: &Ctx, deletes: &[Arc<dyn Object>]) {
    for dst in deletes {
        if ctx.is_cancelled() {
            return;
        }
        match dst.remove().await {
            Ok(()) => ctx.stats().add_delete(),
            Err(err) => ctx.stats().error(&err),
        }
    }
}
