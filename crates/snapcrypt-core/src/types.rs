use serde::{Deserialize, Serialize};

/// Separator used to derive synthetic directories from blob names.
pub const PATH_DELIMITER: &str = "/";

/// Well-known blob at a repository's base path holding the wrapped data key.
pub const METADATA_BLOB: &str = "repository_metadata.json";

/// A listed blob: full or prefix-relative name plus its stored size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobEntry {
    pub name: String,
    pub size_bytes: u64,
}

/// Aggregate outcome of a recursive delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub blobs_deleted: u64,
    pub bytes_deleted: u64,
}

impl DeleteResult {
    pub fn add(&mut self, size_bytes: u64) {
        self.blobs_deleted += 1;
        self.bytes_deleted += size_bytes;
    }
}

/// Join a base path and a relative blob name with exactly one delimiter.
pub fn join_path(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        format!("{base}/")
    } else {
        format!("{base}/{name}")
    }
}

/// Normalise a prefix into directory form (`a/b/`); empty stays empty.
pub fn dir_path(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_path_handles_slashes() {
        assert_eq!(join_path("repo", "meta"), "repo/meta");
        assert_eq!(join_path("repo/", "/meta"), "repo/meta");
        assert_eq!(join_path("", "meta"), "meta");
        assert_eq!(join_path("repo", ""), "repo/");
    }

    #[test]
    fn dir_path_normalises() {
        assert_eq!(dir_path("a/b"), "a/b/");
        assert_eq!(dir_path("/a/b/"), "a/b/");
        assert_eq!(dir_path(""), "");
        assert_eq!(dir_path("/"), "");
    }

    #[test]
    fn delete_result_accumulates() {
        let mut result = DeleteResult::default();
        result.add(10);
        result.add(32);
        assert_eq!(result.blobs_deleted, 2);
        assert_eq!(result.bytes_deleted, 42);
    }
}
