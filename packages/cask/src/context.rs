// Per-request context threaded explicitly through every call
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Permission requested from the access gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Read => write!(f, "read"),
            Permission::Write => write!(f, "write"),
        }
    }
}

/// Who is doing what, to which path.
///
/// Built once per operation and only ever borrowed afterwards; the
/// `with_*` helpers return a new value instead of mutating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub trace_id: Uuid,
    pub actor: String,
    pub path: String,
}

impl RequestContext {
    pub fn new(actor: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            actor: actor.into(),
            path: normalize_path(&path.into()),
        }
    }

    /// Same actor and trace, different target path.
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id,
            actor: self.actor.clone(),
            path: normalize_path(&path.into()),
        }
    }

    /// Directory portion of the path (`/` for top-level files).
    pub fn directory(&self) -> &str {
        match self.path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &self.path[..idx],
        }
    }

    /// Final path segment.
    pub fn filename(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[idx + 1..],
            None => &self.path,
        }
    }
}

/// Collapse repeated separators, resolve `.` and `..`, and force a leading `/`.
///
/// `..` never climbs above the root.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Directory segments of a directory path, root excluded.
pub fn segments(dir: &str) -> Vec<&str> {
    dir.split('/').filter(|s| !s.is_empty()).collect()
}
