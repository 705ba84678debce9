//! Dataset path handling.
//!
//! Paths are `/`-separated regardless of the platform the engine runs on.
//! A protocol-qualified prefix such as `s3://bucket` is carried verbatim and
//! never takes part in segment math.

use std::fmt;

/// Extension shared by every data file in a dataset.
pub const PARQUET_EXT: &str = ".parquet";

/// A normalized location inside (or of) a dataset.
///
/// Backslashes are rewritten to forward slashes on construction and a single
/// trailing slash is dropped, so two spellings of the same location compare
/// equal and enumeration order is stable.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetPath {
    raw: String,
}

impl DatasetPath {
    /// Build a path from any string-ish spelling.
    pub fn new(raw: impl Into<String>) -> Self {
        let mut raw: String = raw.into();
        if raw.contains('\\') {
            raw = raw.replace('\\', "/");
        }
        while raw.len() > 1 && raw.ends_with('/') && !raw.ends_with("://") {
            raw.pop();
        }
        Self { raw }
    }

    /// The normalized string form.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Split off the `scheme://authority` prefix, when present.
    ///
    /// Returns `(prefix, path_portion)`; the prefix includes the authority
    /// but not the slash that separates it from the path.
    fn split_authority(&self) -> (&str, &str) {
        if let Some(scheme_end) = self.raw.find("://") {
            let after = scheme_end + 3;
            match self.raw[after..].find('/') {
                Some(slash) => {
                    let cut = after + slash;
                    (&self.raw[..cut], &self.raw[cut..])
                }
                None => (&self.raw[..], ""),
            }
        } else {
            ("", &self.raw[..])
        }
    }

    /// Append one segment.
    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        let segment = segment.as_ref();
        if self.raw.is_empty() {
            return Self::new(segment);
        }
        Self {
            raw: format!("{}/{}", self.raw, segment),
        }
    }

    /// Final path segment, if any.
    pub fn filename(&self) -> Option<&str> {
        let (_, path) = self.split_authority();
        path.rsplit('/').next().filter(|s| !s.is_empty())
    }

    /// Everything up to the final segment.
    pub fn parent(&self) -> Option<Self> {
        let (authority, path) = self.split_authority();
        let trimmed = path.trim_end_matches('/');
        let idx = trimmed.rfind('/')?;
        let parent_path = &trimmed[..idx];
        if authority.is_empty() && parent_path.is_empty() {
            return Some(Self::new("/"));
        }
        Some(Self {
            raw: format!("{authority}{parent_path}"),
        })
    }

    /// The path relative to `base`, or `None` when `self` is not under it.
    pub fn strip_prefix(&self, base: &DatasetPath) -> Option<&str> {
        let rest = self.raw.strip_prefix(&base.raw)?;
        if rest.is_empty() {
            return Some("");
        }
        rest.strip_prefix('/')
    }

    /// Whether the final segment carries the Parquet extension.
    pub fn is_parquet(&self) -> bool {
        self.filename()
            .map(|name| name.ends_with(PARQUET_EXT))
            .unwrap_or(false)
    }

    /// Hive partition values encoded in the segments between `root` and the
    /// filename, in path order.
    ///
    /// Segments without a `key=value` shape are skipped; a flat layout yields
    /// an empty mapping.
    pub fn partition_values_below(&self, root: &DatasetPath) -> Vec<(String, String)> {
        let Some(rel) = self.strip_prefix(root) else {
            return Vec::new();
        };
        let mut segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
        // Drop the filename itself.
        segments.pop();
        segments
            .into_iter()
            .filter_map(|segment| {
                segment
                    .split_once('=')
                    .filter(|(key, _)| !key.is_empty())
                    .map(|(key, value)| (key.to_string(), value.to_string()))
            })
            .collect()
    }

    /// Local-filesystem form of the path.
    ///
    /// Accepts plain paths and `file://` URLs; any other scheme has no local
    /// representation.
    pub fn to_local(&self) -> Option<std::path::PathBuf> {
        if let Some(rest) = self.raw.strip_prefix("file://") {
            return Some(std::path::PathBuf::from(rest));
        }
        if self.raw.contains("://") {
            return None;
        }
        Some(std::path::PathBuf::from(&self.raw))
    }
}

impl fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatasetPath({})", self.raw)
    }
}

impl From<&str> for DatasetPath {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for DatasetPath {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&std::path::Path> for DatasetPath {
    fn from(path: &std::path::Path) -> Self {
        Self::new(path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_trailing_slash() {
        let path = DatasetPath::new(r"data\warehouse\events/");
        assert_eq!(path.as_str(), "data/warehouse/events");
    }

    #[test]
    fn preserves_authority() {
        let path = DatasetPath::new("s3://bucket/events/day=2024-01-01/part-0.parquet");
        assert_eq!(path.filename(), Some("part-0.parquet"));
        assert_eq!(
            path.parent().unwrap().as_str(),
            "s3://bucket/events/day=2024-01-01"
        );

        let root = DatasetPath::new("s3://bucket/events");
        assert_eq!(
            path.strip_prefix(&root),
            Some("day=2024-01-01/part-0.parquet")
        );
    }

    #[test]
    fn parses_hive_segments() {
        let root = DatasetPath::new("/data/events");
        let file = root
            .child("day=2024-01-01")
            .child("region=eu")
            .child("part-00000-abc.parquet");
        assert_eq!(
            file.partition_values_below(&root),
            vec![
                ("day".to_string(), "2024-01-01".to_string()),
                ("region".to_string(), "eu".to_string()),
            ]
        );
    }

    #[test]
    fn flat_layout_has_no_partitions() {
        let root = DatasetPath::new("/data/events");
        let file = root.child("part-00000-abc.parquet");
        assert!(file.partition_values_below(&root).is_empty());
        assert!(file.is_parquet());
    }

    #[test]
    fn strip_prefix_rejects_foreign_paths() {
        let root = DatasetPath::new("/data/events");
        let other = DatasetPath::new("/data/events2/file.parquet");
        assert_eq!(other.strip_prefix(&root), None);
    }

    #[test]
    fn local_form() {
        assert_eq!(
            DatasetPath::new("file:///tmp/ds").to_local().unwrap(),
            std::path::PathBuf::from("/tmp/ds")
        );
        assert!(DatasetPath::new("s3://bucket/ds").to_local().is_none());
    }
}
