//! `remote:path` syntax.
//!
//! User-visible paths use forward slashes, are case-sensitive, and carry no
//! trailing slash except for the root. A leading `name:` selects a
//! configured remote; a path without a colon (or with a single-letter prefix,
//! which is a Windows drive) is local.

use crate::error::{FsError, FsResult};

/// A parsed remote specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    /// Configured remote name, or `None` for a local path.
    pub remote: Option<String>,
    /// Path within the remote (or the local path itself).
    pub path: String,
}

impl Parsed {
    pub fn is_local(&self) -> bool {
        self.remote.is_none()
    }
}

/// Split `spec` into remote name and path.
///
/// `"s3:bucket/dir"` → `(Some("s3"), "bucket/dir")`; `"s3:"` → the remote's
/// root; `"/tmp/x"` and `"C:\\x"` → local.
pub fn parse_remote(spec: &str) -> FsResult<Parsed> {
    if spec.is_empty() {
        return Err(FsError::Validation("empty remote specification".into()));
    }

    let colon = spec.find(':');
    let parsed = match colon {
        // `:` before any `/` means a remote name, except single-character
        // names which are Windows drive letters.
        Some(idx) if idx > 1 && !spec[..idx].contains('/') => {
            let name = &spec[..idx];
            if let Some(bad) = name.chars().find(|c| !valid_name_char(*c)) {
                return Err(FsError::Validation(format!(
                    "invalid character {bad:?} in remote name {name:?}"
                )));
            }
            Parsed {
                remote: Some(name.to_string()),
                path: normalize(&spec[idx + 1..]),
            }
        }
        _ => Parsed {
            remote: None,
            path: normalize(spec),
        },
    };
    Ok(parsed)
}

/// Strip a trailing slash (the root keeps its single slash) and collapse
/// doubled separators.
fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

fn valid_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '+' | '@' | ' ')
}

/// Join a directory and a leaf into a remote path. Either side may be
/// empty, in which case the other is returned unchanged.
pub fn join(dir: &str, leaf: &str) -> String {
    if dir.is_empty() {
        leaf.to_string()
    } else if leaf.is_empty() {
        dir.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), leaf)
    }
}

/// Split a remote path into `(parent, leaf)`.
pub fn split(remote: &str) -> (&str, &str) {
    match remote.rfind('/') {
        Some(idx) => (&remote[..idx], &remote[idx + 1..]),
        None => ("", remote),
    }
}
