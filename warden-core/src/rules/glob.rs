//! Path glob matching for rule configs
//!
//! Supports `**` (any number of path segments), `*` (any run of characters
//! within a segment) and `?` (one character). Paths and patterns are compared
//! segment by segment; empty and `.` segments are ignored.

use std::path::Path;

/// Whether `path` matches `pattern`
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pat: Vec<&str> = segments(pattern).collect();
    let segs: Vec<&str> = segments(path).collect();
    match_segments(&pat, &segs)
}

/// Whether `path` matches any of `patterns`
pub fn any_match<S: AsRef<str>>(patterns: &[S], path: &str) -> bool {
    patterns.iter().any(|p| glob_match(p.as_ref(), path))
}

/// Express `path` relative to `root` when it lies inside it
pub fn relative_to(root: &Path, path: &str) -> String {
    let p = Path::new(path);
    if p.is_absolute() {
        if let Ok(rel) = p.strip_prefix(root) {
            return rel.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

fn segments(s: &str) -> impl Iterator<Item = &str> {
    s.split(['/', '\\']).filter(|seg| !seg.is_empty() && *seg != ".")
}

fn match_segments(pat: &[&str], segs: &[&str]) -> bool {
    match pat.split_first() {
        None => segs.is_empty(),
        Some((&"**", rest)) => (0..=segs.len()).any(|skip| match_segments(rest, &segs[skip..])),
        Some((p, rest)) => match segs.split_first() {
            Some((s, seg_rest)) => match_segment(p, s) && match_segments(rest, seg_rest),
            None => false,
        },
    }
}

fn match_segment(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_file_patterns() {
        assert!(glob_match("**/*.test.*", "src/auth/token.test.ts"));
        assert!(glob_match("**/*.test.*", "token.test.ts"));
        assert!(!glob_match("**/*.test.*", "src/auth/token.ts"));
        assert!(glob_match("**/tests/**", "crates/core/tests/store.rs"));
        assert!(glob_match("**/*_test.*", "pkg/store_test.go"));
        assert!(glob_match("**/*.test.ts", "/abs/project/src/x.test.ts"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        assert!(glob_match("src/*.ts", "src/a.ts"));
        assert!(!glob_match("src/*.ts", "src/nested/a.ts"));
        assert!(glob_match("src/**", "src/nested/a.ts"));
        assert!(glob_match("src/**/*.ts", "src/a.ts"));
    }

    #[test]
    fn test_question_mark_and_dot_segments() {
        assert!(glob_match("docs/v?.md", "./docs/v2.md"));
        assert!(!glob_match("docs/v?.md", "docs/v10.md"));
    }

    #[test]
    fn test_relative_to_root() {
        let root = Path::new("/work/project");
        assert_eq!(relative_to(root, "/work/project/src/a.rs"), "src/a.rs");
        assert_eq!(relative_to(root, "/elsewhere/a.rs"), "/elsewhere/a.rs");
        assert_eq!(relative_to(root, "src/a.rs"), "src/a.rs");
    }
}
