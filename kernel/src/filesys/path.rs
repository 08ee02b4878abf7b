//! Path normalisation and the shell's working directory.

use alloc::{string::String, vec::Vec};
use lazy_static::lazy_static;
use spin::Mutex;

lazy_static! {
    static ref CWD: Mutex<String> = Mutex::new(String::from("/"));
}

/// Resolve `path` against `base` into a normalised absolute path.
///
/// Collapses `.`, `..` and repeated slashes; `..` at the root stays at the root.
pub fn normalize(base: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let joined = if path.starts_with('/') { [path, ""] } else { [base, path] };
    for segment in joined.iter().flat_map(|half| half.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }

    let mut out = String::with_capacity(path.len() + base.len() + 1);
    for part in &parts {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// `path` made absolute against the current working directory.
pub fn resolve_path(path: &str) -> String {
    normalize(&CWD.lock(), path)
}

pub fn cwd() -> String {
    CWD.lock().clone()
}

/// Replace the working directory. `path` must already be absolute and normalised.
pub fn set_cwd(path: &str) {
    let mut cwd = CWD.lock();
    cwd.clear();
    cwd.push_str(path);
}

/// Everything before the last component; `/` for top-level names.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last component of a normalised path; empty for `/`.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/", ""), "/");
        assert_eq!(normalize("/home", "docs"), "/home/docs");
        assert_eq!(normalize("/home", "/etc//x/./y/"), "/etc/x/y");
        assert_eq!(normalize("/a/b", "../c"), "/a/c");
        assert_eq!(normalize("/", "../../.."), "/");
        assert_eq!(normalize("/a", "b/../../../c"), "/c");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let cases = ["", ".", "a//b/", "/x/../y/./z", "../..", "a/b/c/../../d"];
        for base in ["/", "/tmp", "/a/b"] {
            for case in cases {
                let once = normalize(base, case);
                assert_eq!(normalize(base, &once), once);
                assert!(once.starts_with('/'));
            }
        }
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/a/b"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(file_name("/a/b.txt"), "b.txt");
        assert_eq!(file_name("/"), "");
    }

    #[test]
    fn test_resolve_uses_cwd() {
        let _guard = crate::test_support::lock_globals();
        set_cwd("/work");
        assert_eq!(resolve_path("notes"), "/work/notes");
        assert_eq!(resolve_path("/abs"), "/abs");
        set_cwd("/");
        assert_eq!(resolve_path("notes"), "/notes");
    }
}
