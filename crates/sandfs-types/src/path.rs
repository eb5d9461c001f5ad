//! Sandbox paths and the path resolver.
//!
//! Every path that reaches the tree is a [`VfsPath`]: absolute, made of
//! non-empty segments, with no `.` or `..` left in it. The only way to build
//! one from user input is [`resolve`], so nothing downstream re-normalizes.
//!
//! ```
//! use sandfs_types::{resolve, VfsPath};
//!
//! let cwd = VfsPath::parse("/workspace/src").unwrap();
//! let p = resolve("../README.md", &cwd).unwrap();
//! assert_eq!(p.to_string(), "/workspace/README.md");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PathError;

/// A normalized absolute path inside the sandbox.
///
/// The root is the empty segment list and displays as `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VfsPath {
    segments: Vec<String>,
}

/// Resolve `raw` against `cwd` into a normalized sandbox path.
///
/// Relative paths are joined onto `cwd`, `.` segments are dropped and `..`
/// pops one segment. A `..` at the root fails with
/// [`PathError::EscapesRoot`] instead of clamping. Repeated slashes (empty
/// segments) are rejected as malformed; a single trailing slash is accepted.
/// An empty `raw` resolves to `cwd`.
pub fn resolve(raw: &str, cwd: &VfsPath) -> Result<VfsPath, PathError> {
    if raw.contains('\0') {
        return Err(PathError::malformed(raw, "contains a NUL byte"));
    }

    let (mut stack, rest) = match raw.strip_prefix('/') {
        Some(rest) => (Vec::new(), rest),
        None => (cwd.segments.clone(), raw),
    };

    if rest.is_empty() {
        return Ok(VfsPath { segments: stack });
    }

    let rest = rest.strip_suffix('/').unwrap_or(rest);
    for segment in rest.split('/') {
        match segment {
            "" => return Err(PathError::malformed(raw, "empty path segment")),
            "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(PathError::EscapesRoot(raw.to_string()));
                }
            }
            name => stack.push(name.to_string()),
        }
    }

    Ok(VfsPath { segments: stack })
}

impl VfsPath {
    /// The sandbox root, `/`.
    pub fn root() -> Self {
        Self::default()
    }

    /// Resolve an absolute (or root-relative) path.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        resolve(raw, &Self::root())
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments below the root.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Final segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent path, or `None` for the root.
    pub fn parent(&self) -> Option<VfsPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(VfsPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Ancestor made of the first `depth` segments (clamped to this path).
    pub fn ancestor(&self, depth: usize) -> VfsPath {
        VfsPath {
            segments: self.segments[..depth.min(self.segments.len())].to_vec(),
        }
    }

    /// Append a single child name.
    ///
    /// The name must be a plain segment: non-empty, no `/`, not `.` or `..`.
    pub fn join(&self, name: &str) -> Result<VfsPath, PathError> {
        validate_name(name)?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(VfsPath { segments })
    }

    /// Append already-validated relative segments.
    pub fn join_segments<I, S>(&self, names: I) -> Result<VfsPath, PathError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = self.clone();
        for name in names {
            out = out.join(name.as_ref())?;
        }
        Ok(out)
    }

    /// True if `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &VfsPath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// Segments below `prefix`, if `prefix` is an ancestor-or-self.
    pub fn strip_prefix(&self, prefix: &VfsPath) -> Option<&[String]> {
        if self.starts_with(prefix) {
            Some(&self.segments[prefix.segments.len()..])
        } else {
            None
        }
    }

    /// Rewrite the `from` prefix of this path to `to`.
    pub fn rebase(&self, from: &VfsPath, to: &VfsPath) -> Option<VfsPath> {
        let rest = self.strip_prefix(from)?;
        let mut segments = to.segments.clone();
        segments.extend(rest.iter().cloned());
        Some(VfsPath { segments })
    }

    /// Every ancestor from the root down to (and including) this path.
    pub fn ancestors_and_self(&self) -> impl Iterator<Item = VfsPath> + '_ {
        (0..=self.segments.len()).map(|n| VfsPath {
            segments: self.segments[..n].to_vec(),
        })
    }
}

fn validate_name(name: &str) -> Result<(), PathError> {
    match name {
        "" => Err(PathError::malformed(name, "empty name")),
        "." | ".." => Err(PathError::malformed(name, "reserved name")),
        _ if name.contains('/') => Err(PathError::malformed(name, "name contains '/'")),
        _ if name.contains('\0') => Err(PathError::malformed(name, "contains a NUL byte")),
        _ => Ok(()),
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for VfsPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VfsPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VfsPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        VfsPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> VfsPath {
        VfsPath::parse(s).unwrap()
    }

    #[test]
    fn root_displays_as_slash() {
        assert_eq!(VfsPath::root().to_string(), "/");
        assert!(p("/").is_root());
    }

    #[test]
    fn relative_joins_cwd() {
        let cwd = p("/a/b");
        assert_eq!(resolve("c/d", &cwd).unwrap(), p("/a/b/c/d"));
        assert_eq!(resolve("", &cwd).unwrap(), cwd);
        assert_eq!(resolve("./c", &cwd).unwrap(), p("/a/b/c"));
    }

    #[test]
    fn parent_and_name() {
        let path = p("/a/b/c.txt");
        assert_eq!(path.name(), Some("c.txt"));
        assert_eq!(path.parent(), Some(p("/a/b")));
        assert_eq!(VfsPath::root().parent(), None);
    }

    #[test]
    fn prefix_matching_is_segment_aware() {
        assert!(p("/blue/work/note.md").starts_with(&p("/blue/work")));
        assert!(p("/blue/work").starts_with(&p("/blue/work")));
        assert!(!p("/blue/workshop").starts_with(&p("/blue/work")));
        assert!(p("/anything").starts_with(&VfsPath::root()));
    }

    #[test]
    fn rebase_moves_prefix() {
        let moved = p("/a/b/c").rebase(&p("/a"), &p("/x/y")).unwrap();
        assert_eq!(moved, p("/x/y/b/c"));
        assert!(p("/q").rebase(&p("/a"), &p("/x")).is_none());
    }

    #[test]
    fn join_rejects_bad_names() {
        let root = VfsPath::root();
        assert!(root.join("ok").is_ok());
        assert!(root.join("").is_err());
        assert!(root.join("..").is_err());
        assert!(root.join("a/b").is_err());
    }

    #[test]
    fn ancestors_include_root_and_self() {
        let all: Vec<String> = p("/a/b").ancestors_and_self().map(|a| a.to_string()).collect();
        assert_eq!(all, vec!["/", "/a", "/a/b"]);
    }

    #[test]
    fn serde_round_trips_as_string() {
        let json = serde_json::to_string(&p("/docs/readme.md")).unwrap();
        assert_eq!(json, "\"/docs/readme.md\"");
        let back: VfsPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p("/docs/readme.md"));
        assert!(serde_json::from_str::<VfsPath>("\"/../x\"").is_err());
    }
}
