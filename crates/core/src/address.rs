//! Directory-scatter addressing of internal ids.
//!
//! Filesystem-like stores place an object at `aa/bb/cc/rest`, taking
//! [`DIRECTORY_LEVELS`] groups of [`DIGITS_PER_LEVEL`] characters from the
//! front of the id. Registered ids (prefixed with [`REGISTERED_FLAG`]) name a
//! file placed by someone else and are used verbatim.

use std::fmt;

/// Number of characters per directory level.
pub const DIGITS_PER_LEVEL: usize = 2;

/// Number of directory levels above the object.
pub const DIRECTORY_LEVELS: usize = 3;

/// Prefix marking an internal id as a registered (externally placed) file.
pub const REGISTERED_FLAG: &str = "-R";

/// Strip everything up to the last path separator.
///
/// Anything that looks like traversal collapses to its final segment, so
/// `../../etc/passwd` addresses `passwd`.
pub fn sanitize(id: &str) -> &str {
    match id.rfind(['/', '\\']) {
        Some(pos) => &id[pos + 1..],
        None => id,
    }
}

/// Whether an internal id refers to a registered file.
pub fn is_registered(internal_id: &str) -> bool {
    internal_id.starts_with(REGISTERED_FLAG)
}

/// Build the internal id for a registered file at `path`.
pub fn registered_id(path: &str) -> String {
    format!("{REGISTERED_FLAG}{path}")
}

/// A scattered relative location: directory segments plus file name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScatterPath {
    segments: Vec<String>,
    file_name: String,
}

impl ScatterPath {
    /// Scatter a (sanitized) id into nested directories.
    ///
    /// Ids no longer than one group map to themselves with no nesting. The
    /// file name always keeps at least one character, so concatenating the
    /// segments and the file name reproduces the id.
    pub fn new(id: &str) -> Self {
        let id = sanitize(id);
        let chars: Vec<char> = id.chars().collect();
        let levels = DIRECTORY_LEVELS.min(chars.len().saturating_sub(1) / DIGITS_PER_LEVEL);

        let segments = (0..levels)
            .map(|level| {
                let start = level * DIGITS_PER_LEVEL;
                chars[start..start + DIGITS_PER_LEVEL].iter().collect()
            })
            .collect();
        let file_name = chars[levels * DIGITS_PER_LEVEL..].iter().collect();

        Self {
            segments,
            file_name,
        }
    }

    /// Directory segments, outermost first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Number of directories between the store root and the object.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Relative key using `/` separators.
    pub fn to_key(&self) -> String {
        let mut key = String::new();
        for segment in &self.segments {
            key.push_str(segment);
            key.push('/');
        }
        key.push_str(&self.file_name);
        key
    }
}

impl fmt::Display for ScatterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

/// Where an internal id lives relative to a store root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentAddress {
    /// Repository-owned content, scattered across directories.
    Scattered(ScatterPath),
    /// Externally placed file, path taken verbatim.
    Registered(String),
}

impl ContentAddress {
    pub fn of(internal_id: &str) -> Self {
        match internal_id.strip_prefix(REGISTERED_FLAG) {
            Some(path) => Self::Registered(path.to_string()),
            None => Self::Scattered(ScatterPath::new(internal_id)),
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered(_))
    }

    /// Relative object key using `/` separators.
    pub fn to_key(&self) -> String {
        match self {
            Self::Scattered(path) => path.to_key(),
            Self::Registered(path) => path.clone(),
        }
    }

    /// Directory levels that may be pruned after removal.
    pub fn prunable_depth(&self) -> usize {
        match self {
            Self::Scattered(path) => path.depth(),
            Self::Registered(_) => 0,
        }
    }
}
