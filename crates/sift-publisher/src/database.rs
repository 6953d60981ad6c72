//! The metadata store: the cross-run file-hash dedup table, package-version
//! rows and the per-distribution table of contents.
//!
//! Pointed at by the `DATABASE` environment variable. The dedup table keys
//! on the first eight bytes of the file SHA-256; a truncated-hash collision
//! merely skips an upload of bytes that already exist under the full-hash
//! address, so it is tolerated. The short hash must not be used as a content
//! identifier anywhere else.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params_from_iter, Connection};
use sift_analysis::{FileNode, Package};

pub const DB_BATCH_SIZE: usize = 2048;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS files (
    short_hash INTEGER PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS package_versions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    distro      TEXT NOT NULL,
    pkg_name    TEXT NOT NULL,
    pkg_version TEXT NOT NULL,
    epoch       INTEGER NOT NULL,
    UNIQUE (distro, pkg_name, pkg_version)
);
CREATE TABLE IF NOT EXISTS distribution_contents (
    distro   TEXT NOT NULL,
    pkg_name TEXT NOT NULL,
    current  INTEGER NOT NULL,
    UNIQUE (distro, pkg_name)
);
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageVersion {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub epoch: i64,
}

pub struct Database {
    conn: Mutex<Connection>,
    batch_size: usize,
}

/// First eight bytes of the SHA-256, as the table's integer key.
fn short_hash(sha256: &[u8; 32]) -> i64 {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&sha256[..8]);
    i64::from_le_bytes(prefix)
}

impl Database {
    pub fn connect(path: &Path, batch_size: usize) -> Result<Database> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply schema")?;
        Ok(Database {
            conn: Mutex::new(conn),
            batch_size,
        })
    }

    #[cfg(test)]
    pub fn in_memory(batch_size: usize) -> Result<Database> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Database {
            conn: Mutex::new(conn),
            batch_size,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))
    }

    /// Returns the subset of `files` whose short hash is not yet recorded.
    /// Every returned file must be uploaded to the content-addressed store
    /// and then passed to [`Database::record_hashes`].
    pub fn dedup(&self, files: &[FileNode]) -> Result<Vec<FileNode>> {
        let mut unseen = Vec::new();
        let conn = self.lock()?;
        for batch in files.chunks(self.batch_size) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let query = format!(
                "SELECT DISTINCT short_hash FROM files WHERE short_hash IN ({placeholders})"
            );
            let mut statement = conn.prepare(&query)?;
            let hashes = batch.iter().map(|f| short_hash(&f.sha256));
            let mut existing = std::collections::HashSet::new();
            let mut rows = statement.query(params_from_iter(hashes))?;
            while let Some(row) = rows.next()? {
                existing.insert(row.get::<_, i64>(0)?);
            }
            for file in batch {
                if !existing.contains(&short_hash(&file.sha256)) {
                    unseen.push(file.clone());
                }
            }
        }
        Ok(unseen)
    }

    /// Records uploaded hashes, ignoring any already present. Idempotent;
    /// callers may flush partial batches at any time.
    pub fn record_hashes(&self, hashes: &[[u8; 32]]) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        for batch in hashes.chunks(self.batch_size) {
            let placeholders = vec!["(?)"; batch.len()].join(", ");
            let query = format!(
                "INSERT INTO files (short_hash) VALUES {placeholders} \
                 ON CONFLICT (short_hash) DO NOTHING"
            );
            conn.execute(&query, params_from_iter(batch.iter().map(short_hash)))?;
        }
        Ok(())
    }

    /// Upserts the package-version row for a processed archive and returns
    /// it with its id.
    pub fn record_package_version(&self, pkg: &Package, epoch: i64) -> Result<PackageVersion> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO package_versions (distro, pkg_name, pkg_version, epoch) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (distro, pkg_name, pkg_version) \
             DO UPDATE SET epoch = excluded.epoch",
            rusqlite::params![pkg.distro, pkg.name, pkg.version, epoch],
        )?;
        let id = conn.query_row(
            "SELECT id FROM package_versions \
             WHERE distro = ?1 AND pkg_name = ?2 AND pkg_version = ?3",
            rusqlite::params![pkg.distro, pkg.name, pkg.version],
            |row| row.get(0),
        )?;
        Ok(PackageVersion {
            id,
            name: pkg.name.clone(),
            version: pkg.version.clone(),
            epoch,
        })
    }

    /// Looks up the recorded versions of the given packages, batched.
    pub fn list_existing(
        &self,
        distro: &str,
        packages: &HashMap<String, Package>,
    ) -> Result<HashMap<String, PackageVersion>> {
        let list: Vec<&Package> = packages.values().collect();
        let mut existing = HashMap::new();
        let conn = self.lock()?;
        for batch in list.chunks(self.batch_size) {
            let placeholders = vec!["(?, ?)"; batch.len()].join(", ");
            let query = format!(
                "SELECT id, pkg_name, pkg_version, epoch FROM package_versions \
                 WHERE distro = ? AND (pkg_name, pkg_version) IN ({placeholders})"
            );
            let mut values: Vec<&str> = vec![distro];
            for pkg in batch {
                values.push(&pkg.name);
                values.push(&pkg.version);
            }
            let mut statement = conn.prepare(&query)?;
            let mut rows = statement.query(params_from_iter(values))?;
            while let Some(row) = rows.next()? {
                let pv = PackageVersion {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    version: row.get(2)?,
                    epoch: row.get(3)?,
                };
                existing.insert(pv.name.clone(), pv);
            }
        }
        Ok(existing)
    }

    pub fn list_distro_contents(&self, distro: &str) -> Result<Vec<PackageVersion>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT pv.id, pv.pkg_name, pv.pkg_version, pv.epoch \
             FROM distribution_contents dc \
             JOIN package_versions pv ON dc.current = pv.id \
             WHERE dc.distro = ?1 \
             ORDER BY pv.pkg_name",
        )?;
        let rows = statement.query_map([distro], |row| {
            Ok(PackageVersion {
                id: row.get(0)?,
                name: row.get(1)?,
                version: row.get(2)?,
                epoch: row.get(3)?,
            })
        })?;
        let mut contents = Vec::new();
        for row in rows {
            contents.push(row?);
        }
        Ok(contents)
    }

    /// Rebuilds the table of contents: every given package version becomes
    /// current, and rows for packages absent from this crawl are deleted.
    pub fn update_distro_contents(&self, distro: &str, pvs: &[PackageVersion]) -> Result<()> {
        {
            let conn = self.lock()?;
            for batch in pvs.chunks(self.batch_size) {
                let placeholders = vec!["(?, ?, ?)"; batch.len()].join(", ");
                let query = format!(
                    "REPLACE INTO distribution_contents (distro, pkg_name, current) \
                     VALUES {placeholders}"
                );
                let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(batch.len() * 3);
                for pv in batch {
                    values.push(distro.to_string().into());
                    values.push(pv.name.clone().into());
                    values.push(pv.id.into());
                }
                conn.execute(&query, params_from_iter(values))?;
            }
        }

        let seen: std::collections::HashSet<&str> =
            pvs.iter().map(|pv| pv.name.as_str()).collect();
        let stale: Vec<i64> = self
            .list_distro_contents(distro)?
            .into_iter()
            .filter(|pv| !seen.contains(pv.name.as_str()))
            .map(|pv| pv.id)
            .collect();
        if !stale.is_empty() {
            let conn = self.lock()?;
            let placeholders = vec!["?"; stale.len()].join(", ");
            let query =
                format!("DELETE FROM distribution_contents WHERE current IN ({placeholders})");
            conn.execute(&query, params_from_iter(stale))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file(fill: u8) -> FileNode {
        FileNode {
            size: 1,
            sha256: [fill; 32],
            local_path: PathBuf::from(format!("/tmp/{fill}")),
        }
    }

    fn package(name: &str, version: &str) -> Package {
        Package {
            distro: "hirsute".into(),
            name: name.into(),
            version: version.into(),
            files: Vec::new(),
            directory: String::new(),
            mirror: url::Url::parse("https://mirror.example.org").unwrap(),
        }
    }

    #[test]
    fn dedup_then_record_then_dedup_is_empty() {
        let db = Database::in_memory(2).unwrap();
        let files = vec![file(1), file(2), file(3), file(4), file(5)];

        let unseen = db.dedup(&files).unwrap();
        assert_eq!(5, unseen.len(), "nothing recorded yet");

        let hashes: Vec<[u8; 32]> = unseen.iter().map(|f| f.sha256).collect();
        db.record_hashes(&hashes).unwrap();

        assert!(db.dedup(&files).unwrap().is_empty(), "all recorded");
    }

    #[test]
    fn record_hashes_is_idempotent() {
        let db = Database::in_memory(DB_BATCH_SIZE).unwrap();
        let hashes = vec![[7u8; 32]];
        db.record_hashes(&hashes).unwrap();
        db.record_hashes(&hashes).unwrap();
        assert!(db.dedup(&[file(7)]).unwrap().is_empty());
    }

    #[test]
    fn dedup_matches_on_the_hash_prefix_only() {
        let db = Database::in_memory(DB_BATCH_SIZE).unwrap();
        let mut a = file(9);
        db.record_hashes(&[a.sha256]).unwrap();
        // Same leading 8 bytes, different tail: a tolerated collision.
        a.sha256[31] = 0xff;
        assert!(db.dedup(&[a]).unwrap().is_empty());
    }

    #[test]
    fn package_versions_upsert_keeps_one_row() {
        let db = Database::in_memory(DB_BATCH_SIZE).unwrap();
        let pkg = package("zlib", "1.2.11");
        let first = db.record_package_version(&pkg, 4).unwrap();
        let second = db.record_package_version(&pkg, 5).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(5, second.epoch);
    }

    #[test]
    fn list_existing_finds_recorded_versions() {
        let db = Database::in_memory(2).unwrap();
        for (name, version) in [("zlib", "1.2.11"), ("acl", "2.2.53"), ("sed", "4.8")] {
            db.record_package_version(&package(name, version), 4)
                .unwrap();
        }
        let mut wanted = HashMap::new();
        wanted.insert("zlib".to_string(), package("zlib", "1.2.11"));
        wanted.insert("acl".to_string(), package("acl", "9.9"));
        let existing = db.list_existing("hirsute", &wanted).unwrap();
        assert_eq!(1, existing.len());
        assert_eq!("1.2.11", existing["zlib"].version);
    }

    #[test]
    fn distro_contents_rebuild_deletes_stale_rows() {
        let db = Database::in_memory(DB_BATCH_SIZE).unwrap();
        let zlib = db
            .record_package_version(&package("zlib", "1.2.11"), 4)
            .unwrap();
        let acl = db
            .record_package_version(&package("acl", "2.2.53"), 4)
            .unwrap();

        db.update_distro_contents("hirsute", &[zlib.clone(), acl])
            .unwrap();
        assert_eq!(2, db.list_distro_contents("hirsute").unwrap().len());

        // acl disappears upstream; the rebuild drops it.
        db.update_distro_contents("hirsute", &[zlib]).unwrap();
        let contents = db.list_distro_contents("hirsute").unwrap();
        assert_eq!(1, contents.len());
        assert_eq!("zlib", contents[0].name);
    }
}
