//! Migration Registry
//!
//! Discovers the forward-only scripts that define a tenant namespace's
//! target shape. Scripts are named `<version>_<description>.<ext>`; the
//! version is the integer before the first `_`.

use crate::error::{DatabaseError, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const VERSION_SEPARATOR: char = '_';

/// A versioned migration script on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub version: i64,
    /// File name, recorded in the ledger
    pub name: String,
    pub path: PathBuf,
}

/// Script body plus its SHA-256 checksum (hex)
#[derive(Debug, Clone)]
pub struct MigrationScript {
    pub sql: String,
    pub checksum: String,
}

impl MigrationFile {
    pub async fn load(&self) -> Result<MigrationScript> {
        let sql = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| DatabaseError::MigrationDiscovery {
                path: self.path.clone(),
                source,
            })?;
        let checksum = checksum(&sql);
        Ok(MigrationScript { sql, checksum })
    }
}

pub fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// Parse the version prefix of a migration file name.
///
/// Only plain ASCII digits are accepted, so `+1_x.sql` or `-1_x.sql` are not
/// migrations.
pub fn parse_version(file_name: &str) -> Option<i64> {
    let prefix = file_name.split(VERSION_SEPARATOR).next()?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok()
}

/// Ordered migration set for one directory
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: Vec<MigrationFile>,
}

impl MigrationRegistry {
    /// Scan `dir` and order its migrations by ascending version.
    ///
    /// Entries without a numeric version prefix are ignored. Two files with
    /// the same version are rejected.
    pub async fn scan(dir: &Path) -> Result<Self> {
        let discovery = |source| DatabaseError::MigrationDiscovery {
            path: dir.to_path_buf(),
            source,
        };

        let mut entries = tokio::fs::read_dir(dir).await.map_err(discovery)?;
        let mut by_version: BTreeMap<i64, MigrationFile> = BTreeMap::new();

        while let Some(entry) = entries.next_entry().await.map_err(discovery)? {
            if !entry.file_type().await.map_err(discovery)?.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(version) = parse_version(&name) else {
                tracing::debug!("Skipping {} in {}: no version prefix", name, dir.display());
                continue;
            };

            let file = MigrationFile {
                version,
                name,
                path: entry.path(),
            };

            if let Some(existing) = by_version.get(&version) {
                // read_dir order is platform dependent; report the pair sorted
                let (first, second) = if existing.path <= file.path {
                    (existing.path.clone(), file.path)
                } else {
                    (file.path, existing.path.clone())
                };
                return Err(DatabaseError::DuplicateMigrationVersion {
                    version,
                    first,
                    second,
                });
            }
            by_version.insert(version, file);
        }

        let migrations: Vec<MigrationFile> = by_version.into_values().collect();
        tracing::debug!(
            "Discovered {} migrations in {}",
            migrations.len(),
            dir.display()
        );

        Ok(Self { migrations })
    }

    pub fn migrations(&self) -> &[MigrationFile] {
        &self.migrations
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Highest version in the set
    pub fn target_version(&self) -> Option<i64> {
        self.migrations.last().map(|m| m.version)
    }

    /// Versions not contained in `applied`
    pub fn pending<'a>(&'a self, applied: &'a [i64]) -> impl Iterator<Item = &'a MigrationFile> {
        self.migrations
            .iter()
            .filter(move |m| !applied.contains(&m.version))
    }
}

impl IntoIterator for MigrationRegistry {
    type Item = MigrationFile;
    type IntoIter = std::vec::IntoIter<MigrationFile>;

    fn into_iter(self) -> Self::IntoIter {
        self.migrations.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScratchDir(PathBuf);

    impl ScratchDir {
        fn new(files: &[&str]) -> Self {
            let dir = std::env::temp_dir().join(format!("medrec-migrations-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            for file in files {
                std::fs::write(dir.join(file), format!("-- {}\n", file)).unwrap();
            }
            Self(dir)
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("0001_create_patients.sql"), Some(1));
        assert_eq!(parse_version("12_x.sql"), Some(12));
        assert_eq!(parse_version("7.sql"), None);
        assert_eq!(parse_version("README.md"), None);
        assert_eq!(parse_version("_1_x.sql"), None);
        assert_eq!(parse_version("+1_x.sql"), None);
        assert_eq!(parse_version("-1_x.sql"), None);
        assert_eq!(parse_version("99999999999999999999_x.sql"), None);
    }

    #[tokio::test]
    async fn test_scan_orders_numerically_and_skips_noise() {
        let dir = ScratchDir::new(&[
            "10_late.sql",
            "2_second.sql",
            "0001_first.sql",
            "notes.txt",
            "abc_x.sql",
        ]);
        std::fs::create_dir(dir.0.join("3_subdir")).unwrap();

        let registry = MigrationRegistry::scan(&dir.0).await.unwrap();
        let versions: Vec<i64> = registry.migrations().iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 10]);
        assert_eq!(registry.target_version(), Some(10));
        assert_eq!(registry.migrations()[0].name, "0001_first.sql");
    }

    #[tokio::test]
    async fn test_scan_empty_directory() {
        let dir = ScratchDir::new(&[]);
        let registry = MigrationRegistry::scan(&dir.0).await.unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.target_version(), None);
    }

    #[tokio::test]
    async fn test_scan_rejects_duplicate_versions() {
        let dir = ScratchDir::new(&["1_a.sql", "0001_b.sql"]);
        let err = MigrationRegistry::scan(&dir.0).await.unwrap_err();
        match err {
            DatabaseError::DuplicateMigrationVersion { version, first, second } => {
                assert_eq!(version, 1);
                assert!(first.ends_with("0001_b.sql"));
                assert!(second.ends_with("1_a.sql"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_scan_missing_directory() {
        let missing = std::env::temp_dir().join(format!("medrec-missing-{}", uuid::Uuid::new_v4()));
        let err = MigrationRegistry::scan(&missing).await.unwrap_err();
        assert!(matches!(err, DatabaseError::MigrationDiscovery { .. }));
    }

    #[tokio::test]
    async fn test_pending_and_checksum() {
        let dir = ScratchDir::new(&["1_a.sql", "2_b.sql", "3_c.sql"]);
        let registry = MigrationRegistry::scan(&dir.0).await.unwrap();
        let pending: Vec<i64> = registry.pending(&[1, 3]).map(|m| m.version).collect();
        assert_eq!(pending, vec![2]);

        let script = registry.migrations()[0].load().await.unwrap();
        assert_eq!(script.sql, "-- 1_a.sql\n");
        assert_eq!(script.checksum, checksum("-- 1_a.sql\n"));
        assert_eq!(script.checksum.len(), 64);
    }
}
