//! Where the import database lives on disk.
//!
//! Defaults to `data/imports.duckdb` under the workspace root. Set
//! [`DATA_DIR_ENV`] to keep the database somewhere else.

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "FACILITY_IMPORT_DATA_DIR";

/// Workspace root, two levels above this crate's manifest.
#[must_use]
pub fn project_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .ancestors()
        .nth(2)
        .unwrap_or(manifest_dir)
        .to_path_buf()
}

/// Directory holding the import database.
#[must_use]
pub fn data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV)
        .filter(|dir| !dir.is_empty())
        .map_or_else(|| project_root().join("data"), PathBuf::from)
}

/// Default location of the import `DuckDB` file.
#[must_use]
pub fn import_db_path() -> PathBuf {
    data_dir().join("imports.duckdb")
}

/// Creates `path` and its parents when missing.
///
/// # Errors
///
/// Returns the I/O error from creating the directory.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_file_sits_in_the_data_dir() {
        let path = import_db_path();
        assert_eq!(path.file_name().unwrap(), "imports.duckdb");
        assert_eq!(path.parent().unwrap(), data_dir());
    }

    #[test]
    fn ensure_dir_creates_nested_directories() {
        let root = std::env::temp_dir().join(format!("facility-paths-{}", uuid::Uuid::new_v4()));
        let nested = root.join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir(&nested).unwrap();
        std::fs::remove_dir_all(root).unwrap();
    }
}
