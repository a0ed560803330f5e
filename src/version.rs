use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Cached regex for `2013v3.0`-style version identifiers
static VERSION_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_version_regex() -> &'static Regex {
    VERSION_REGEX.get_or_init(|| {
        Regex::new(r"^(\d{4})v?(\d+)?\.?(\d+)?").expect("Failed to compile version regex")
    })
}

/// Chronological sort key for a version identifier.
///
/// `2013v3.0` becomes `(2013, 3, 0)`; identifiers that do not follow the
/// year-first convention sort before all others.
pub fn version_sort_key(id: &str) -> (u32, u32, u32) {
    let Some(caps) = get_version_regex().captures(id) else {
        return (0, 0, 0);
    };
    let part = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0)
    };
    (part(1), part(2), part(3))
}

/// Compare two version identifiers chronologically, falling back to the raw string
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    version_sort_key(a)
        .cmp(&version_sort_key(b))
        .then_with(|| a.cmp(b))
}

/// One schema release: an identifier plus the directory holding its documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub id: String,
    pub root: PathBuf,
}

impl SchemaVersion {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_versions(&self.id, &other.id).then_with(|| self.root.cmp(&other.root))
    }
}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort a list of version identifiers in place, oldest first
pub fn sort_version_ids(ids: &mut [String]) {
    ids.sort_by(|a, b| compare_versions(a, b));
}
