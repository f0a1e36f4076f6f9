//! The differ: pairing source and destination listings into transfer
//! decisions.
//!
//! Both listings arrive sorted by remote path; a single merge pass yields
//! one decision per name (two for kind mismatches, where the stale
//! destination entry is deleted before the source kind replaces it).
//!
//! For a name present on both sides the comparison runs size → common hash →
//! modification time within the combined precision window. A side whose
//! backend cannot represent mtimes forces the hash comparison, and with no
//! common hash either the pair is updated unconditionally.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use flotilla_core::error::FsResult;
use flotilla_core::fal::{DirEntry, Fs, Object};
use flotilla_core::Ctx;

/// What the engine should do about one name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Present on the source only: transfer it.
    Copy,
    /// Present on both but different: transfer over the destination.
    Update,
    /// Identical on both sides: nothing to move.
    Skip,
    /// Present on the destination only: remove it (when deletes are on).
    Delete,
    /// Source directory missing on the destination.
    MakeDir,
    /// Destination directory with no source counterpart.
    RemoveDir,
}

/// One differ decision.
#[derive(Debug, Clone)]
pub struct Decision {
    pub remote: String,
    pub action: Action,
    pub src: Option<DirEntry>,
    pub dst: Option<DirEntry>,
}

/// Differ tuning.
#[derive(Debug, Clone)]
pub struct DiffOpts {
    /// Extra slack added to the combined backend precision when comparing
    /// modification times.
    pub mod_window: Duration,
    /// Only update when the source is strictly newer.
    pub update_newer_only: bool,
}

impl Default for DiffOpts {
    fn default() -> Self {
        DiffOpts {
            mod_window: Duration::from_millis(1),
            update_newer_only: false,
        }
    }
}

/// Merge sorted listings into decisions, in lexicographic remote order.
pub async fn diff(
    ctx: &Ctx,
    src_fs: &Arc<dyn Fs>,
    dst_fs: &Arc<dyn Fs>,
    src_entries: &[DirEntry],
    dst_entries: &[DirEntry],
    opts: &DiffOpts,
) -> FsResult<Vec<Decision>> {
    let mut out = Vec::new();
    let mut s = src_entries.iter().peekable();
    let mut d = dst_entries.iter().peekable();

    loop {
        ctx.check()?;
        match (s.peek(), d.peek()) {
            (None, None) => break,
            (Some(se), None) => {
                out.push(source_only(se));
                s.next();
            }
            (None, Some(de)) => {
                out.push(dest_only(de));
                d.next();
            }
            (Some(se), Some(de)) => {
                let sr = se.remote();
                let dr = de.remote();
                if sr < dr {
                    out.push(source_only(se));
                    s.next();
                } else if sr > dr {
                    out.push(dest_only(de));
                    d.next();
                } else {
                    out.extend(matched(ctx, src_fs, dst_fs, se, de, opts).await?);
                    s.next();
                    d.next();
                }
            }
        }
    }
    Ok(out)
}

fn source_only(entry: &DirEntry) -> Decision {
    let action = if entry.is_dir() {
        Action::MakeDir
    } else {
        Action::Copy
    };
    trace!(remote = %entry.remote(), ?action, "source only");
    Decision {
        remote: entry.remote(),
        action,
        src: Some(entry.clone()),
        dst: None,
    }
}

fn dest_only(entry: &DirEntry) -> Decision {
    let action = if entry.is_dir() {
        Action::RemoveDir
    } else {
        Action::Delete
    };
    trace!(remote = %entry.remote(), ?action, "destination only");
    Decision {
        remote: entry.remote(),
        action,
        src: None,
        dst: Some(entry.clone()),
    }
}

async fn matched(
    ctx: &Ctx,
    src_fs: &Arc<dyn Fs>,
    dst_fs: &Arc<dyn Fs>,
    se: &DirEntry,
    de: &DirEntry,
    opts: &DiffOpts,
) -> FsResult<Vec<Decision>> {
    let remote = se.remote();
    match (se, de) {
        (DirEntry::Dir(_), DirEntry::Dir(_)) => Ok(vec![Decision {
            remote,
            action: Action::Skip,
            src: Some(se.clone()),
            dst: Some(de.clone()),
        }]),
        // Kind mismatch: clear the stale destination entry first, then let
        // the source kind take its place.
        (DirEntry::Dir(_), DirEntry::Object(_)) => Ok(vec![
            Decision {
                remote: remote.clone(),
                action: Action::Delete,
                src: None,
                dst: Some(de.clone()),
            },
            Decision {
                remote,
                action: Action::MakeDir,
                src: Some(se.clone()),
                dst: None,
            },
        ]),
        (DirEntry::Object(_), DirEntry::Dir(_)) => Ok(vec![
            Decision {
                remote: remote.clone(),
                action: Action::RemoveDir,
                src: None,
                dst: Some(de.clone()),
            },
            Decision {
                remote,
                action: Action::Copy,
                src: Some(se.clone()),
                dst: None,
            },
        ]),
        (DirEntry::Object(so), DirEntry::Object(dobj)) => {
            ctx.stats().add_check();
            let action = need_transfer(ctx, src_fs, dst_fs, so, dobj, opts).await?;
            if action == Action::Skip {
                ctx.stats().add_skip();
            }
            Ok(vec![Decision {
                remote,
                action,
                src: Some(se.clone()),
                dst: Some(de.clone()),
            }])
        }
    }
}

/// Decide whether a matched object pair needs to move.
async fn need_transfer(
    ctx: &Ctx,
    src_fs: &Arc<dyn Fs>,
    dst_fs: &Arc<dyn Fs>,
    src: &Arc<dyn Object>,
    dst: &Arc<dyn Object>,
    opts: &DiffOpts,
) -> FsResult<Action> {
    let remote = src.remote();

    // 1. Size.
    if src.size() != dst.size() {
        debug!(remote = %remote, src = src.size(), dst = dst.size(), "size differs");
        return Ok(Action::Update);
    }

    // 2. A common hash family settles it when both sides know the value.
    let common = src_fs.hashes().overlap(dst_fs.hashes());
    if let Some(family) = common.get_one() {
        ctx.check()?;
        let sh = src.hash(family).await?;
        let dh = dst.hash(family).await?;
        if let (Some(sh), Some(dh)) = (sh, dh) {
            if sh != dh {
                debug!(remote = %remote, %family, "hash differs");
                return Ok(Action::Update);
            }
            return Ok(Action::Skip);
        }
    }

    // 3. Modification time within the combined window. A side that cannot
    // represent mtimes forced the hash comparison above; arriving here
    // without one means there is nothing left to compare, so transfer.
    let (sp, dp) = (src_fs.precision(), dst_fs.precision());
    let window = match (sp.as_duration(), dp.as_duration()) {
        (Some(sp), Some(dp)) => sp.max(dp) + opts.mod_window,
        _ => {
            debug!(remote = %remote, "no mtime and no conclusive hash, updating");
            return Ok(Action::Update);
        }
    };

    let delta = (src.mod_time() - dst.mod_time())
        .abs()
        .to_std()
        .unwrap_or(Duration::MAX);
    if delta <= window {
        return Ok(Action::Skip);
    }
    if opts.update_newer_only && src.mod_time() <= dst.mod_time() {
        debug!(remote = %remote, "destination newer, leaving in place");
        return Ok(Action::Skip);
    }
    Ok(Action::Update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use flotilla_core::filter::Filter;
    use flotilla_memfs::{seed, MemFs};

    use crate::walk::{walk, WalkOpts};

    fn t(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    async fn listed(fs: &Arc<dyn Fs>) -> Vec<DirEntry> {
        let ctx = Ctx::new();
        walk(&ctx, fs, "b", &Filter::include_all(), &WalkOpts::default())
            .await
            .unwrap_or_default()
    }

    async fn decide(
        src: &[(&str, &[u8], chrono::DateTime<Utc>)],
        dst: &[(&str, &[u8], chrono::DateTime<Utc>)],
        opts: &DiffOpts,
    ) -> Vec<Decision> {
        let ctx = Ctx::new();
        let sfs = MemFs::new("src");
        let dfs = MemFs::new("dst");
        seed(&sfs, src).await.unwrap();
        seed(&dfs, dst).await.unwrap();
        let sfs = sfs as Arc<dyn Fs>;
        let dfs = dfs as Arc<dyn Fs>;
        let se = listed(&sfs).await;
        let de = listed(&dfs).await;
        diff(&ctx, &sfs, &dfs, &se, &de, opts).await.unwrap()
    }

    fn action_of<'a>(decisions: &'a [Decision], remote: &str) -> &'a Decision {
        decisions
            .iter()
            .find(|d| d.remote == remote)
            .unwrap_or_else(|| panic!("no decision for {remote}"))
    }

    #[tokio::test]
    async fn test_source_only_copies_dest_only_deletes() {
        let decisions = decide(
            &[("b/new.txt", b"x", t(0))],
            &[("b/old.txt", b"y", t(0))],
            &DiffOpts::default(),
        )
        .await;
        assert_eq!(action_of(&decisions, "b/new.txt").action, Action::Copy);
        assert_eq!(action_of(&decisions, "b/old.txt").action, Action::Delete);
    }

    #[tokio::test]
    async fn test_identical_hash_skips() {
        let decisions = decide(
            &[("b/same.txt", b"identical", t(0))],
            // Different mtime but same bytes: the hash settles it.
            &[("b/same.txt", b"identical", t(5000))],
            &DiffOpts::default(),
        )
        .await;
        assert_eq!(action_of(&decisions, "b/same.txt").action, Action::Skip);
    }

    #[tokio::test]
    async fn test_same_size_different_hash_updates() {
        let decisions = decide(
            &[("b/f.txt", b"aaaa", t(0))],
            &[("b/f.txt", b"bbbb", t(0))],
            &DiffOpts::default(),
        )
        .await;
        assert_eq!(action_of(&decisions, "b/f.txt").action, Action::Update);
    }

    #[tokio::test]
    async fn test_size_difference_updates() {
        let decisions = decide(
            &[("b/f.txt", b"longer content", t(0))],
            &[("b/f.txt", b"short", t(0))],
            &DiffOpts::default(),
        )
        .await;
        assert_eq!(action_of(&decisions, "b/f.txt").action, Action::Update);
    }

    #[tokio::test]
    async fn test_update_newer_only() {
        // Destination is newer and content differs: --update leaves it.
        let decisions = decide(
            &[("b/f.txt", b"aaaa", t(0))],
            &[("b/f.txt", b"bbbb", t(100))],
            &DiffOpts {
                update_newer_only: true,
                ..Default::default()
            },
        )
        .await;
        // Hash differs so the decision is still Update; --update applies to
        // the mtime fallback only.
        assert_eq!(action_of(&decisions, "b/f.txt").action, Action::Update);
    }

    #[tokio::test]
    async fn test_directory_mirroring() {
        let decisions = decide(
            &[("b/dir/inner.txt", b"x", t(0))],
            &[],
            &DiffOpts::default(),
        )
        .await;
        assert_eq!(action_of(&decisions, "b/dir").action, Action::MakeDir);
        assert_eq!(action_of(&decisions, "b/dir/inner.txt").action, Action::Copy);
        // Directories sort before their contents.
        let dir_pos = decisions.iter().position(|d| d.remote == "b/dir").unwrap();
        let file_pos = decisions
            .iter()
            .position(|d| d.remote == "b/dir/inner.txt")
            .unwrap();
        assert!(dir_pos < file_pos);
    }

    #[tokio::test]
    async fn test_kind_mismatch_file_replaces_dir() {
        let decisions = decide(
            &[("b/thing", b"now a file", t(0))],
            &[("b/thing/nested.txt", b"was a dir", t(0))],
            &DiffOpts::default(),
        )
        .await;
        // The nested file goes, the directory goes, then the file lands.
        assert_eq!(
            action_of(&decisions, "b/thing/nested.txt").action,
            Action::Delete
        );
        let thing: Vec<&Decision> =
            decisions.iter().filter(|d| d.remote == "b/thing").collect();
        assert_eq!(thing.len(), 2);
        assert_eq!(thing[0].action, Action::RemoveDir);
        assert_eq!(thing[1].action, Action::Copy);
    }

    #[tokio::test]
    async fn test_identical_everything_skips() {
        let decisions = decide(
            &[("b/f.txt", b"same", t(0))],
            &[("b/f.txt", b"same", t(0))],
            &DiffOpts::default(),
        )
        .await;
        assert_eq!(action_of(&decisions, "b/f.txt").action, Action::Skip);
    }
}
