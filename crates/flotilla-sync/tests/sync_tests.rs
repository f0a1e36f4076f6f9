//! End-to-end engine tests over the in-memory and local backends.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tokio::io::AsyncReadExt;

use flotilla_core::error::{exitcode, FsError};
use flotilla_core::fal::{ByteReader, Fs, ObjectMeta};
use flotilla_core::filter::{Filter, FilterOpts, FilterRule};
use flotilla_core::Ctx;
use flotilla_local::LocalFs;
use flotilla_memfs::{seed, MemFs};
use flotilla_sync::{copy_dirs, move_dirs, sync, DeleteMode, SyncOpts};

fn t(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
}

async fn contents(fs: &Arc<dyn Fs>, remote: &str) -> Vec<u8> {
    let obj = fs.new_object(remote).await.unwrap();
    let mut reader = obj.open(&[]).await.unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn test_sync_fresh_destination() {
    let ctx = Ctx::new();
    let src = MemFs::new("src");
    let dst = MemFs::new("dst");
    seed(
        &src,
        &[
            ("b/a.txt", b"alpha", t(0)),
            ("b/sub/b.txt", b"bravo", t(0)),
            ("b/sub/deep/c.txt", b"charlie", t(0)),
        ],
    )
    .await
    .unwrap();

    let src = src as Arc<dyn Fs>;
    let dst = dst as Arc<dyn Fs>;
    let outcome = sync(&ctx, &src, &dst, &Filter::include_all(), &SyncOpts::default())
        .await
        .unwrap();

    assert_eq!(outcome.transferred, 3);
    assert_eq!(outcome.errors, 0);
    assert_eq!(contents(&dst, "b/a.txt").await, b"alpha");
    assert_eq!(contents(&dst, "b/sub/deep/c.txt").await, b"charlie");

    // Completed transfers preserve size and modification time.
    let obj = dst.new_object("b/sub/b.txt").await.unwrap();
    assert_eq!(obj.size(), 5);
    assert_eq!(obj.mod_time(), t(0));
}

#[tokio::test]
async fn test_sync_skips_identical_and_updates_changed() {
    let ctx = Ctx::new();
    let src = MemFs::new("src");
    let dst = MemFs::new("dst");
    seed(
        &src,
        &[
            ("b/same.txt", b"unchanged", t(0)),
            ("b/changed.txt", b"new version", t(10)),
        ],
    )
    .await
    .unwrap();
    seed(
        &dst,
        &[
            ("b/same.txt", b"unchanged", t(0)),
            ("b/changed.txt", b"old", t(0)),
        ],
    )
    .await
    .unwrap();

    let src = src as Arc<dyn Fs>;
    let dst = dst as Arc<dyn Fs>;
    let outcome = sync(&ctx, &src, &dst, &Filter::include_all(), &SyncOpts::default())
        .await
        .unwrap();

    assert_eq!(outcome.transferred, 1);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(contents(&dst, "b/changed.txt").await, b"new version");
}

#[tokio::test]
async fn test_sync_deletes_destination_only_files() {
    for mode in [DeleteMode::Before, DeleteMode::During, DeleteMode::After] {
        let ctx = Ctx::new();
        let src = MemFs::new("src");
        let dst = MemFs::new("dst");
        seed(&src, &[("b/keep.txt", b"k", t(0))]).await.unwrap();
        seed(
            &dst,
            &[
                ("b/keep.txt", b"k", t(0)),
                ("b/stale.txt", b"s", t(0)),
                ("b/dead/d.txt", b"d", t(0)),
            ],
        )
        .await
        .unwrap();

        let src = src as Arc<dyn Fs>;
        let dst = dst as Arc<dyn Fs>;
        let opts = SyncOpts {
            delete_mode: mode,
            ..Default::default()
        };
        let outcome = sync(&ctx, &src, &dst, &Filter::include_all(), &opts)
            .await
            .unwrap();

        assert_eq!(outcome.deleted, 2, "mode {mode:?}");
        assert!(dst.new_object("b/keep.txt").await.is_ok());
        assert!(matches!(
            dst.new_object("b/stale.txt").await,
            Err(FsError::ObjectNotFound(_))
        ));
        assert!(matches!(
            dst.new_object("b/dead/d.txt").await,
            Err(FsError::ObjectNotFound(_))
        ));
    }
}

#[tokio::test]
async fn test_copy_does_not_delete() {
    let ctx = Ctx::new();
    let src = MemFs::new("src");
    let dst = MemFs::new("dst");
    seed(&src, &[("b/new.txt", b"n", t(0))]).await.unwrap();
    seed(&dst, &[("b/existing.txt", b"e", t(0))]).await.unwrap();

    let src = src as Arc<dyn Fs>;
    let dst = dst as Arc<dyn Fs>;
    let outcome = copy_dirs(&ctx, &src, &dst, &Filter::include_all(), &SyncOpts::default())
        .await
        .unwrap();

    assert_eq!(outcome.transferred, 1);
    assert_eq!(outcome.deleted, 0);
    assert!(dst.new_object("b/existing.txt").await.is_ok());
}

#[tokio::test]
async fn test_sync_respects_filters() {
    let ctx = Ctx::new();
    let src = MemFs::new("src");
    let dst = MemFs::new("dst");
    seed(
        &src,
        &[
            ("b/keep.txt", b"k", t(0)),
            ("b/noise.log", b"n", t(0)),
            ("b/tmp/scratch.txt", b"s", t(0)),
        ],
    )
    .await
    .unwrap();

    let filter = Filter::new(FilterOpts {
        rules: vec![
            FilterRule::Exclude("**/*.log".into()),
            FilterRule::Exclude("b/tmp/**".into()),
        ],
        ..Default::default()
    })
    .unwrap();

    let src = src as Arc<dyn Fs>;
    let dst = dst as Arc<dyn Fs>;
    let outcome = sync(&ctx, &src, &dst, &filter, &SyncOpts::default())
        .await
        .unwrap();

    assert_eq!(outcome.transferred, 1);
    assert!(dst.new_object("b/keep.txt").await.is_ok());
    assert!(dst.new_object("b/noise.log").await.is_err());
    assert!(dst.new_object("b/tmp/scratch.txt").await.is_err());
}

#[tokio::test]
async fn test_sync_local_to_memfs() {
    let ctx = Ctx::new();
    let tmp = tempfile::tempdir().unwrap();
    let local = LocalFs::new("", tmp.path());
    for (remote, data) in [("a.txt", &b"alpha"[..]), ("nested/b.txt", b"bravo")] {
        let info = ObjectMeta::new(remote, Some(data.len() as u64), t(0));
        let reader: ByteReader = Box::new(std::io::Cursor::new(data.to_vec()));
        local.put(reader, &info).await.unwrap();
    }

    let src = local as Arc<dyn Fs>;
    let dst = MemFs::with_store(flotilla_memfs::MemStore::new(), "dst", "bucket");
    let dst = dst as Arc<dyn Fs>;

    let outcome = sync(&ctx, &src, &dst, &Filter::include_all(), &SyncOpts::default())
        .await
        .unwrap();

    assert_eq!(outcome.transferred, 2);
    assert_eq!(contents(&dst, "a.txt").await, b"alpha");
    assert_eq!(contents(&dst, "nested/b.txt").await, b"bravo");

    // Cross-backend verification used the common hash families.
    let obj = dst.new_object("a.txt").await.unwrap();
    assert_eq!(obj.mod_time(), t(0));
}

#[tokio::test]
async fn test_sync_memfs_to_local() {
    let ctx = Ctx::new();
    let src = MemFs::new("src");
    seed(&src, &[("b/data.bin", b"payload", t(0))]).await.unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let dst = LocalFs::new("", tmp.path()) as Arc<dyn Fs>;
    let src = src as Arc<dyn Fs>;

    let outcome = sync(&ctx, &src, &dst, &Filter::include_all(), &SyncOpts::default())
        .await
        .unwrap();

    assert_eq!(outcome.transferred, 1);
    assert_eq!(contents(&dst, "b/data.bin").await, b"payload");
    let obj = dst.new_object("b/data.bin").await.unwrap();
    assert_eq!(obj.mod_time(), t(0));
}

#[tokio::test]
async fn test_move_dirs_empties_source() {
    let ctx = Ctx::new();
    let src = MemFs::new("src");
    let dst = MemFs::new("dst");
    seed(
        &src,
        &[("b/a.txt", b"a", t(0)), ("b/sub/c.txt", b"c", t(0))],
    )
    .await
    .unwrap();

    let src = src as Arc<dyn Fs>;
    let dst = dst as Arc<dyn Fs>;
    move_dirs(&ctx, &src, &dst, &Filter::include_all(), &SyncOpts::default())
        .await
        .unwrap();

    assert!(dst.new_object("b/a.txt").await.is_ok());
    assert!(dst.new_object("b/sub/c.txt").await.is_ok());
    assert!(src.new_object("b/a.txt").await.is_err());
    assert!(src.new_object("b/sub/c.txt").await.is_err());
}

#[tokio::test]
async fn test_transient_failures_retry_to_success() {
    let ctx = Ctx::new();
    let src = MemFs::new("src");
    let dst = MemFs::new("dst");
    seed(&src, &[("b/f.txt", b"flaky", t(0))]).await.unwrap();
    dst.store().inject_put_failures(2);

    let src = src as Arc<dyn Fs>;
    let dst_dyn = dst as Arc<dyn Fs>;
    let outcome = sync(&ctx, &src, &dst_dyn, &Filter::include_all(), &SyncOpts::default())
        .await
        .unwrap();

    assert_eq!(outcome.transferred, 1);
    assert_eq!(outcome.errors, 0);
    assert_eq!(contents(&dst_dyn, "b/f.txt").await, b"flaky");
}

#[tokio::test]
async fn test_failed_object_does_not_abort_run() {
    let ctx = Ctx::new();
    let src = MemFs::new("src");
    let dst = MemFs::new("dst");
    // Many puts fail; with the retry budget they exhaust for the first
    // object scheduled but later ones succeed.
    seed(
        &src,
        &[("b/one.txt", b"1", t(0)), ("b/two.txt", b"2", t(0))],
    )
    .await
    .unwrap();
    dst.store().inject_put_failures(50);

    let src = src as Arc<dyn Fs>;
    let dst_dyn = dst.clone() as Arc<dyn Fs>;
    let opts = SyncOpts {
        transfers: 1,
        // Keep the backoff sleeps out of the test's wall clock.
        pacer: flotilla_sync::PacerConfig {
            min_sleep: std::time::Duration::from_millis(1),
            max_sleep: std::time::Duration::from_millis(2),
            decay_constant: 1,
            retries: 10,
        },
        ..Default::default()
    };
    let outcome = sync(&ctx, &src, &dst_dyn, &Filter::include_all(), &opts)
        .await
        .unwrap();

    // The run finished and recorded the failures instead of aborting.
    assert!(outcome.errors > 0);
    assert_eq!(
        ctx.stats().exit_code(false),
        exitcode::RETRY_ERROR
    );
}

#[tokio::test]
async fn test_outcome_exit_code_success() {
    let ctx = Ctx::new();
    let src = MemFs::new("src");
    let dst = MemFs::new("dst");
    seed(&src, &[("b/a.txt", b"a", t(0))]).await.unwrap();

    let src = src as Arc<dyn Fs>;
    let dst = dst as Arc<dyn Fs>;
    sync(&ctx, &src, &dst, &Filter::include_all(), &SyncOpts::default())
        .await
        .unwrap();

    assert_eq!(ctx.stats().exit_code(false), exitcode::SUCCESS);
    assert_eq!(ctx.stats().exit_code(true), exitcode::SUCCESS);
}

#[tokio::test]
async fn test_no_transfers_exit_code() {
    let ctx = Ctx::new();
    let src = MemFs::new("src");
    let dst = MemFs::new("dst");
    seed(&src, &[("b/a.txt", b"same", t(0))]).await.unwrap();
    seed(&dst, &[("b/a.txt", b"same", t(0))]).await.unwrap();

    let src = src as Arc<dyn Fs>;
    let dst = dst as Arc<dyn Fs>;
    sync(&ctx, &src, &dst, &Filter::include_all(), &SyncOpts::default())
        .await
        .unwrap();

    assert_eq!(ctx.stats().exit_code(false), exitcode::SUCCESS);
    assert_eq!(
        ctx.stats().exit_code(true),
        exitcode::NO_FILES_TRANSFERRED
    );
}

#[tokio::test]
async fn test_cancellation_stops_work() {
    let ctx = Ctx::new();
    ctx.cancel();

    let src = MemFs::new("src");
    seed(&src, &[("b/a.txt", b"a", t(0))]).await.unwrap();
    let dst = MemFs::new("dst");

    let src = src as Arc<dyn Fs>;
    let dst = dst as Arc<dyn Fs>;
    let err = sync(&ctx, &src, &dst, &Filter::include_all(), &SyncOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::Cancelled));
}
