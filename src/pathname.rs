//! Lexical path handling for the interception surface.
//!
//! Paths are evaluated purely textually: `.` and empty segments drop out and
//! `..` pops, without consulting the real filesystem. The one exception is a
//! single `readlink` hop used to catch symlinks pointing into the virtual
//! tree; that read is performed with rustix (a direct syscall) so it cannot
//! re-enter the interposed libc entry points.

use std::ffi::CStr;

/// The distinguished leading segment that routes a file operation to the
/// virtual tree.
pub const MAGIC_PREFIX: &str = "sandstorm-magic";

/// Splits `path` into normalized segments. Relative paths are evaluated
/// against `base`, itself an already-normalized absolute segment list.
/// `..` at the root stays at the root.
pub fn eval(path: &str, base: &[String]) -> Vec<String> {
    let mut out: Vec<String> = if path.starts_with('/') {
        Vec::new()
    } else {
        base.to_vec()
    };
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            _ => out.push(seg.to_string()),
        }
    }
    out
}

/// The current working directory as normalized segments. An unreadable or
/// non-UTF-8 cwd degrades to the root, which can never alias the magic
/// prefix onto an unrelated relative path.
pub fn current_dir_segments() -> Vec<String> {
    match std::env::current_dir() {
        Ok(dir) => match dir.to_str() {
            Some(dir) => eval(dir, &[]),
            None => Vec::new(),
        },
        Err(_) => Vec::new(),
    }
}

/// Whether normalized `segments` name something under the virtual tree.
pub fn is_magic(segments: &[String]) -> bool {
    segments.first().is_some_and(|s| s.as_str() == MAGIC_PREFIX)
}

/// If `path` is a symlink, its target evaluated lexically (relative targets
/// against the link's parent directory). Exactly one hop; the target is not
/// itself dereferenced.
pub fn symlink_target(path: &CStr, segments: &[String]) -> Option<Vec<String>> {
    let target = rustix::fs::readlink(path, Vec::new()).ok()?;
    let target = target.to_str().ok()?.to_owned();
    let parent = segments.split_last().map(|(_, p)| p).unwrap_or(&[]);
    Some(eval(&target, parent))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_eval_absolute() {
        assert_eq!(eval("/a/b/c", &[]), segs(&["a", "b", "c"]));
        assert_eq!(eval("/a//b/./c/", &[]), segs(&["a", "b", "c"]));
        assert_eq!(eval("/a/b/../c", &[]), segs(&["a", "c"]));
        assert_eq!(eval("/", &[]), segs(&[]));
    }

    #[test]
    fn test_eval_dotdot_clamps_at_root() {
        assert_eq!(eval("/../../etc", &[]), segs(&["etc"]));
        assert_eq!(eval("/a/../../b", &[]), segs(&["b"]));
    }

    #[test]
    fn test_eval_relative() {
        let base = segs(&["home", "user"]);
        assert_eq!(eval("x/y", &base), segs(&["home", "user", "x", "y"]));
        assert_eq!(eval("../z", &base), segs(&["home", "z"]));
        assert_eq!(eval(".", &base), base);
    }

    #[test]
    fn test_is_magic() {
        assert!(is_magic(&eval("/sandstorm-magic/f", &[])));
        assert!(is_magic(&eval("/sandstorm-magic", &[])));
        assert!(is_magic(&eval("/tmp/../sandstorm-magic/f", &[])));
        assert!(!is_magic(&eval("/sandstorm-magic/../etc/passwd", &[])));
        assert!(!is_magic(&eval("/etc/passwd", &[])));
        assert!(!is_magic(&eval("/", &[])));
    }
}
