//! Directory traversal.
//!
//! The walker runs `list` breadth-first with a bounded number of concurrent
//! listings. When the backend advertises one-call recursive enumeration and
//! the caller allows it, the whole subtree is delegated to
//! `Fs::list_recursive` and filtered as pages arrive. A failed listing
//! aborts only that subtree: the error is recorded in accounting and the
//! walk continues elsewhere; only a failure to list the root is returned.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use flotilla_core::error::{FsError, FsResult};
use flotilla_core::fal::{DirEntry, Fs};
use flotilla_core::filter::Filter;
use flotilla_core::Ctx;

/// Walker tuning.
#[derive(Debug, Clone)]
pub struct WalkOpts {
    /// Maximum directory depth below the starting point; `None` descends
    /// without bound.
    pub max_depth: Option<usize>,
    /// Concurrent `list` calls in flight.
    pub checkers: usize,
    /// Use `Fs::list_recursive` when the backend advertises it.
    pub use_list_r: bool,
}

impl Default for WalkOpts {
    fn default() -> Self {
        WalkOpts {
            max_depth: None,
            checkers: 8,
            use_list_r: true,
        }
    }
}

/// Enumerate everything under `dir`, filtered and sorted by remote path.
///
/// Directory entries appear before anything beneath them (lexicographic
/// order guarantees this).
pub async fn walk(
    ctx: &Ctx,
    fs: &Arc<dyn Fs>,
    dir: &str,
    filter: &Filter,
    opts: &WalkOpts,
) -> FsResult<Vec<DirEntry>> {
    let mut entries =
        if opts.use_list_r && fs.features().list_r && opts.max_depth.is_none() {
            walk_list_r(ctx, fs, dir, filter).await?
        } else {
            walk_bfs(ctx, fs, dir, filter, opts).await?
        };
    entries.sort_by_key(|e| e.remote());
    Ok(entries)
}

/// Fast path: the backend enumerates the subtree, pages are filtered as they
/// arrive.
async fn walk_list_r(
    ctx: &Ctx,
    fs: &Arc<dyn Fs>,
    dir: &str,
    filter: &Filter,
) -> FsResult<Vec<DirEntry>> {
    debug!(fs = %fs.string(), dir, "walking via recursive listing");
    let (tx, mut rx) = mpsc::channel::<Vec<DirEntry>>(4);

    let lister = fs.list_recursive(dir, tx);
    let collector = async {
        let mut out = Vec::new();
        while let Some(page) = rx.recv().await {
            ctx.check()?;
            for entry in page {
                if keep(filter, &entry) {
                    out.push(entry);
                }
            }
        }
        Ok::<_, FsError>(out)
    };

    let (listed, collected) = tokio::join!(lister, collector);
    listed?;
    collected
}

/// Breadth-first traversal with up to `checkers` listings in flight.
async fn walk_bfs(
    ctx: &Ctx,
    fs: &Arc<dyn Fs>,
    dir: &str,
    filter: &Filter,
    opts: &WalkOpts,
) -> FsResult<Vec<DirEntry>> {
    let root = dir.to_string();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    queue.push_back((root.clone(), 0));

    let mut in_flight = FuturesUnordered::new();
    let mut out = Vec::new();

    loop {
        ctx.check()?;

        while in_flight.len() < opts.checkers.max(1) {
            let Some((next, depth)) = queue.pop_front() else {
                break;
            };
            let fs = Arc::clone(fs);
            in_flight.push(async move {
                let listed = fs.list(&next).await;
                (next, depth, listed)
            });
        }

        let Some((listed_dir, depth, listed)) = in_flight.next().await else {
            break;
        };

        let entries = match listed {
            Ok(entries) => entries,
            Err(err) if listed_dir == root => return Err(err),
            Err(err) => {
                // One unlistable subtree does not stop the walk.
                warn!(dir = %listed_dir, error = %err, "skipping unlistable subtree");
                ctx.stats().error(&err);
                continue;
            }
        };

        for entry in entries {
            match &entry {
                DirEntry::Dir(d) => {
                    if !filter.include_directory(&d.remote) {
                        debug!(dir = %d.remote, "pruned by filter");
                        continue;
                    }
                    let descend = opts.max_depth.map_or(true, |max| depth + 1 < max);
                    if descend {
                        queue.push_back((d.remote.clone(), depth + 1));
                    }
                    out.push(entry);
                }
                DirEntry::Object(_) => {
                    if keep(filter, &entry) {
                        out.push(entry);
                    }
                }
            }
        }
    }

    Ok(out)
}

fn keep(filter: &Filter, entry: &DirEntry) -> bool {
    match entry {
        DirEntry::Dir(d) => filter.include_directory(&d.remote),
        DirEntry::Object(o) => filter.include_file(&o.remote(), o.size(), o.mod_time()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use flotilla_core::filter::{FilterOpts, FilterRule};
    use flotilla_memfs::{seed, MemFs};

    fn t0() -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    async fn fixture() -> Arc<dyn Fs> {
        let fs = MemFs::new("mem");
        seed(
            &fs,
            &[
                ("b/a.txt", b"a", t0()),
                ("b/sub/x.log", b"x", t0()),
                ("b/sub/y.txt", b"y", t0()),
                ("b/sub/deep/z.txt", b"z", t0()),
            ],
        )
        .await
        .unwrap();
        fs as Arc<dyn Fs>
    }

    fn names(entries: &[DirEntry]) -> Vec<String> {
        entries.iter().map(|e| e.remote()).collect()
    }

    #[tokio::test]
    async fn test_walk_list_r_and_bfs_agree() {
        let ctx = Ctx::new();
        let fs = fixture().await;
        let filter = Filter::include_all();

        let fast = walk(&ctx, &fs, "b", &filter, &WalkOpts::default())
            .await
            .unwrap();
        let slow = walk(
            &ctx,
            &fs,
            "b",
            &filter,
            &WalkOpts {
                use_list_r: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(names(&fast), names(&slow));
        assert_eq!(
            names(&fast),
            vec![
                "b/a.txt",
                "b/sub",
                "b/sub/deep",
                "b/sub/deep/z.txt",
                "b/sub/x.log",
                "b/sub/y.txt",
            ]
        );
    }

    #[tokio::test]
    async fn test_walk_filter_prunes() {
        let ctx = Ctx::new();
        let fs = fixture().await;
        let filter = Filter::new(FilterOpts {
            rules: vec![FilterRule::Exclude("**/*.log".into())],
            ..Default::default()
        })
        .unwrap();

        for use_list_r in [true, false] {
            let entries = walk(
                &ctx,
                &fs,
                "b",
                &filter,
                &WalkOpts {
                    use_list_r,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            assert!(
                !names(&entries).iter().any(|n| n.ends_with(".log")),
                "list_r={use_list_r}"
            );
        }
    }

    #[tokio::test]
    async fn test_walk_directory_prune_stops_descent() {
        let ctx = Ctx::new();
        let fs = fixture().await;
        let filter = Filter::new(FilterOpts {
            rules: vec![FilterRule::Exclude("b/sub/**".into())],
            ..Default::default()
        })
        .unwrap();

        let entries = walk(
            &ctx,
            &fs,
            "b",
            &filter,
            &WalkOpts {
                use_list_r: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(names(&entries), vec!["b/a.txt"]);
    }

    #[tokio::test]
    async fn test_walk_max_depth() {
        let ctx = Ctx::new();
        let fs = fixture().await;
        let filter = Filter::include_all();

        let entries = walk(
            &ctx,
            &fs,
            "b",
            &filter,
            &WalkOpts {
                max_depth: Some(1),
                use_list_r: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(names(&entries), vec!["b/a.txt", "b/sub"]);
    }

    #[tokio::test]
    async fn test_walk_missing_root_fails() {
        let ctx = Ctx::new();
        let fs = fixture().await;
        let filter = Filter::include_all();
        let err = walk(&ctx, &fs, "missing", &filter, &WalkOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::DirNotFound(_)));
    }

    #[tokio::test]
    async fn test_walk_cancelled() {
        let ctx = Ctx::new();
        ctx.cancel();
        let fs = fixture().await;
        let filter = Filter::include_all();
        let err = walk(
            &ctx,
            &fs,
            "b",
            &filter,
            &WalkOpts {
                use_list_r: false,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FsError::Cancelled));
    }
}
