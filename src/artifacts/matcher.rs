use log::warn;
use regex::Regex;

use crate::error::{Result, SensorError};

/// Compiled set of recursive-glob path patterns.
///
/// Supported syntax: `**` as a whole path segment matches zero or more
/// segments, `*` and `?` match within one segment, `[...]` / `[!...]`
/// character classes, `{a,b}` alternation and `\` escapes. Patterns that
/// fail to compile are logged and ignored, so they never match.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    patterns: Vec<(String, Regex)>,
}

impl PathMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match compile_glob(pattern) {
                Ok(re) => compiled.push((pattern.to_string(), re)),
                Err(e) => warn!("Ignoring pattern: {}", e),
            }
        }
        PathMatcher { patterns: compiled }
    }

    /// True when any pattern matches the full path
    pub fn is_match(&self, path: &str) -> bool {
        self.patterns.iter().any(|(_, re)| re.is_match(path))
    }

    /// The first pattern that matches, for logging
    pub fn matching_pattern(&self, path: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(path))
            .map(|(p, _)| p.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

/// Match a single glob against a path
pub fn glob_match(pattern: &str, path: &str) -> Result<bool> {
    Ok(compile_glob(pattern)?.is_match(path))
}

/// Translate a glob into an anchored regex
pub fn compile_glob(pattern: &str) -> Result<Regex> {
    let source = glob_to_regex(pattern)?;
    Regex::new(&source).map_err(|e| invalid(pattern, &e.to_string()))
}

fn invalid(pattern: &str, reason: &str) -> SensorError {
    SensorError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

fn glob_to_regex(pattern: &str) -> Result<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut alt_depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    let seg_start = i == 0 || chars[i - 1] == '/';
                    let seg_end = i + 2 == chars.len() || chars[i + 2] == '/';
                    if seg_start && seg_end {
                        let at_end = i + 2 == chars.len();
                        if at_end {
                            if out.ends_with('/') {
                                // trailing "/**": the directory itself or anything below it
                                out.pop();
                                out.push_str("(?:/.*)?");
                            } else {
                                out.push_str(".*");
                            }
                            i += 2;
                        } else {
                            // "**/" matches zero or more leading segments
                            out.push_str("(?:.*/)?");
                            i += 3;
                        }
                        continue;
                    }
                    // "**" inside a segment behaves like "*"
                    out.push_str("[^/]*");
                    i += 2;
                    continue;
                }
                out.push_str("[^/]*");
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                let (class, next) = parse_class(pattern, &chars, i)?;
                out.push_str(&class);
                i = next;
                continue;
            }
            '{' => {
                alt_depth += 1;
                out.push_str("(?:");
            }
            '}' if alt_depth > 0 => {
                alt_depth -= 1;
                out.push(')');
            }
            ',' if alt_depth > 0 => out.push('|'),
            '\\' => {
                i += 1;
                match chars.get(i) {
                    Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                    None => return Err(invalid(pattern, "trailing escape")),
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }

    if alt_depth > 0 {
        return Err(invalid(pattern, "unclosed '{'"));
    }

    out.push('$');
    Ok(out)
}

fn parse_class(pattern: &str, chars: &[char], start: usize) -> Result<(String, usize)> {
    let mut i = start + 1;
    let mut class = String::from("[");

    if i < chars.len() && (chars[i] == '!' || chars[i] == '^') {
        class.push('^');
        i += 1;
    }

    let body_start = i;
    while i < chars.len() {
        let c = chars[i];
        if c == ']' && i > body_start {
            class.push(']');
            return Ok((class, i + 1));
        }
        match c {
            '\\' => {
                i += 1;
                match chars.get(i) {
                    Some(escaped) => {
                        class.push('\\');
                        class.push(*escaped);
                    }
                    None => break,
                }
            }
            '[' | ']' | '^' | '&' | '~' => {
                class.push('\\');
                class.push(c);
            }
            _ => class.push(c),
        }
        i += 1;
    }

    Err(invalid(pattern, "unclosed '['"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn m(pattern: &str, path: &str) -> bool {
        glob_match(pattern, path).unwrap()
    }

    #[test]
    fn test_double_star_segments() {
        assert!(m("/var/cache/**", "/var/cache"));
        assert!(m("/var/cache/**", "/var/cache/apt/archives/x.deb"));
        assert!(!m("/var/cache/**", "/var/cachex/file"));

        assert!(m("**/*.pyc", "/app/__pycache__/mod.pyc"));
        assert!(m("**/*.pyc", "mod.pyc"));

        assert!(m("/usr/**/doc", "/usr/doc"));
        assert!(m("/usr/**/doc", "/usr/share/local/doc"));
        assert!(!m("/usr/**/doc", "/usr/share/docs"));

        assert!(m("**", "/anything/at/all"));
    }

    #[test]
    fn test_single_segment_wildcards() {
        assert!(m("/etc/*.conf", "/etc/host.conf"));
        assert!(!m("/etc/*.conf", "/etc/ssl/openssl.conf"));
        assert!(m("/tmp/file?.log", "/tmp/file1.log"));
        assert!(!m("/tmp/file?.log", "/tmp/file10.log"));
    }

    #[test]
    fn test_classes_and_alternation() {
        assert!(m("/lib/lib[cm].so", "/lib/libc.so"));
        assert!(!m("/lib/lib[!cm].so", "/lib/libm.so"));
        assert!(m("/lib/lib[!cm].so", "/lib/libz.so"));
        assert!(m("/app/*.{js,mjs}", "/app/index.mjs"));
        assert!(!m("/app/*.{js,mjs}", "/app/index.ts"));
        assert!(m("/data/\\*", "/data/*"));
        assert!(!m("/data/\\*", "/data/x"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        assert!(m("/opt/app+1/(x)", "/opt/app+1/(x)"));
        assert!(!m("/opt/a.c", "/opt/abc"));
    }

    #[test]
    fn test_malformed_pattern_never_matches() {
        assert!(compile_glob("/etc/[abc").is_err());
        assert!(compile_glob("/etc/{a,b").is_err());

        let matcher = PathMatcher::new(&["/etc/[abc", "/var/log/**"]);
        assert_eq!(matcher.len(), 1);
        assert!(!matcher.is_match("/etc/[abc"));
        assert!(matcher.is_match("/var/log/syslog"));
        assert_eq!(matcher.matching_pattern("/var/log/syslog"), Some("/var/log/**"));
    }

    proptest! {
        #[test]
        fn prop_literal_pattern_matches_itself(segments in prop::collection::vec("[a-z0-9._-]{1,8}", 1..5)) {
            let path = format!("/{}", segments.join("/"));
            prop_assert!(m(&path, &path));
        }

        #[test]
        fn prop_trailing_double_star_covers_subtree(
            base in prop::collection::vec("[a-z]{1,6}", 1..3),
            rest in prop::collection::vec("[a-z0-9.]{1,6}", 0..4),
        ) {
            let root = format!("/{}", base.join("/"));
            let pattern = format!("{}/**", root);
            let mut path = root.clone();
            for part in &rest {
                path.push('/');
                path.push_str(part);
            }
            prop_assert!(m(&pattern, &path));
        }
    }
}
