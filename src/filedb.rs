//! Durable per-file tracking store.
//!
//! Two tables: `files` (one row per file this updater placed and is
//! responsible for) and `meta` (opaque key/value bookkeeping, e.g. the
//! cached manifest and per-layer watermarks). The error-enum-per-component
//! convention carries over from the rest of this crate even though this
//! is the one component with no closer structural model to copy.

use std::path::Path;
use thiserror::Error;

use crate::util::FILE_BUFSZ;

#[derive(Debug, Error)]
pub enum FileDbErr
{
	#[error("sqlite error: {0}")]
	Sqlite(#[from] rusqlite::Error),

	#[error("I/O error reading {path}: {source}")]
	Io { path: String, #[source] source: std::io::Error },

	#[error("file mtime for {0} is not representable as a float")]
	BadMtime(String),
}

/// A single row of the `files` table.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedFile
{
	pub path: String,
	pub crc: u32,
	pub updated: f64,
	pub layer: String,
}

/// Result of `index_files()`: the current full row set, plus which
/// paths were found changed or missing on disk. `modified`/`removed`
/// are informational only; the engine consumes `all`.
#[derive(Debug, Default)]
pub struct IndexResult
{
	pub all: Vec<TrackedFile>,
	pub modified: Vec<String>,
	pub removed: Vec<String>,
}

pub struct FileDb
{
	conn: rusqlite::Connection,
}

impl FileDb
{
	/// Open (creating if absent) the database at `db_path`, and ensure
	/// the schema exists. The database file itself is not tracked by
	/// the store it implements, same as freebsd-rustdate's own state
	/// file isn't one of the files *it* manages.
	pub fn open(db_path: &Path) -> Result<Self, FileDbErr>
	{
		let conn = rusqlite::Connection::open(db_path)?;
		conn.execute_batch(
			"CREATE TABLE IF NOT EXISTS meta (
				key TEXT NOT NULL,
				value TEXT NOT NULL
			);
			CREATE UNIQUE INDEX IF NOT EXISTS idx_meta_key ON meta(key);

			CREATE TABLE IF NOT EXISTS files (
				path TEXT NOT NULL,
				crc INTEGER NOT NULL,
				updated REAL NOT NULL,
				layer TEXT NOT NULL
			);
			CREATE UNIQUE INDEX IF NOT EXISTS idx_files_path ON files(path);
			CREATE INDEX IF NOT EXISTS idx_files_layer ON files(layer);"
		)?;
		Ok(Self { conn })
	}

	/// In-memory database, used by unit tests that don't need a
	/// filesystem-backed file.
	#[cfg(test)]
	pub(crate) fn open_memory() -> Result<Self, FileDbErr>
	{
		let conn = rusqlite::Connection::open_in_memory()?;
		conn.execute_batch(
			"CREATE TABLE meta (key TEXT NOT NULL, value TEXT NOT NULL);
			CREATE UNIQUE INDEX idx_meta_key ON meta(key);
			CREATE TABLE files (path TEXT NOT NULL, crc INTEGER NOT NULL,
				updated REAL NOT NULL, layer TEXT NOT NULL);
			CREATE UNIQUE INDEX idx_files_path ON files(path);
			CREATE INDEX idx_files_layer ON files(layer);"
		)?;
		Ok(Self { conn })
	}

	pub fn get_meta(&self, key: &str) -> Result<Option<String>, FileDbErr>
	{
		let mut stmt = self.conn.prepare_cached(
			"SELECT value FROM meta WHERE key = ?1")?;
		let mut rows = stmt.query([key])?;
		match rows.next()? {
			Some(row) => Ok(Some(row.get(0)?)),
			None => Ok(None),
		}
	}

	/// `get_meta`, falling back to a caller-supplied default when the
	/// key is absent.
	pub fn get_meta_or(&self, key: &str, default: &str)
			-> Result<String, FileDbErr>
	{
		Ok(self.get_meta(key)?.unwrap_or_else(|| default.to_string()))
	}

	pub fn set_meta(&self, key: &str, value: &str) -> Result<(), FileDbErr>
	{
		self.conn.execute(
			"INSERT INTO meta (key, value) VALUES (?1, ?2)
				ON CONFLICT(key) DO UPDATE SET value = excluded.value",
			rusqlite::params![key, value],
		)?;
		Ok(())
	}

	pub fn get_file(&self, path: &str) -> Result<Option<TrackedFile>, FileDbErr>
	{
		let mut stmt = self.conn.prepare_cached(
			"SELECT path, crc, updated, layer FROM files WHERE path = ?1")?;
		let mut rows = stmt.query([path])?;
		match rows.next()? {
			Some(row) => Ok(Some(row_to_tracked(row)?)),
			None => Ok(None),
		}
	}

	pub fn get_files_by_layer(&self, layer: &str)
			-> Result<Vec<TrackedFile>, FileDbErr>
	{
		let mut stmt = self.conn.prepare_cached(
			"SELECT path, crc, updated, layer FROM files WHERE layer = ?1
				ORDER BY path")?;
		let mut rows = stmt.query([layer])?;
		let mut out = Vec::new();
		while let Some(row) = rows.next()? {
			out.push(row_to_tracked(row)?);
		}
		Ok(out)
	}

	fn all_files(&self) -> Result<Vec<TrackedFile>, FileDbErr>
	{
		let mut stmt = self.conn.prepare_cached(
			"SELECT path, crc, updated, layer FROM files ORDER BY path")?;
		let mut rows = stmt.query([])?;
		let mut out = Vec::new();
		while let Some(row) = rows.next()? {
			out.push(row_to_tracked(row)?);
		}
		Ok(out)
	}

	/// Reconcile the `files` table against what's actually on disk
	/// under `root`: a tracked file that's missing or whose mtime moved
	/// since the last run is reported as removed/modified respectively.
	pub fn index_files(&self, root: &Path) -> Result<IndexResult, FileDbErr>
	{
		let mut result = IndexResult::default();

		for row in self.all_files()? {
			let full = root.join(&row.path);
			let meta = match std::fs::symlink_metadata(&full) {
				Ok(m) => m,
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
					result.removed.push(row.path);
					continue;
				},
				Err(e) => return Err(FileDbErr::Io { path: row.path, source: e }),
			};

			let mtime = mtime_as_f64(&meta, &row.path)?;
			if mtime == row.updated {
				result.all.push(row);
				continue;
			}

			let crc = fcrc32(&full)
				.map_err(|source| FileDbErr::Io { path: row.path.clone(), source })?;
			if crc != row.crc {
				self.conn.execute(
					"UPDATE files SET crc = ?1, updated = ?2 WHERE path = ?3",
					rusqlite::params![crc, mtime, row.path],
				)?;
				result.modified.push(row.path.clone());
				result.all.push(TrackedFile { crc, updated: mtime, ..row });
			} else {
				// Content's unchanged; still record the new mtime so we
				// don't re-hash this file again next run for free.
				self.conn.execute(
					"UPDATE files SET updated = ?1 WHERE path = ?2",
					rusqlite::params![mtime, row.path],
				)?;
				result.all.push(TrackedFile { updated: mtime, ..row });
			}
		}

		Ok(result)
	}

	pub fn track_files(&mut self, rows: &[TrackedFile]) -> Result<(), FileDbErr>
	{
		let tx = self.conn.transaction()?;
		for row in rows {
			tx.execute(
				"INSERT INTO files (path, crc, updated, layer)
					VALUES (?1, ?2, ?3, ?4)",
				rusqlite::params![row.path, row.crc, row.updated, row.layer],
			)?;
		}
		tx.commit()?;
		Ok(())
	}

	pub fn update_tracked_files(&mut self, rows: &[TrackedFile])
			-> Result<(), FileDbErr>
	{
		let tx = self.conn.transaction()?;
		for row in rows {
			let n = tx.execute(
				"UPDATE files SET crc = ?1, updated = ?2, layer = ?3
					WHERE path = ?4",
				rusqlite::params![row.crc, row.updated, row.layer, row.path],
			)?;
			if n == 0 {
				tx.execute(
					"INSERT INTO files (path, crc, updated, layer)
						VALUES (?1, ?2, ?3, ?4)",
					rusqlite::params![row.path, row.crc, row.updated, row.layer],
				)?;
			}
		}
		tx.commit()?;
		Ok(())
	}

	pub fn delete_tracked_files(&mut self, paths: &[String])
			-> Result<(), FileDbErr>
	{
		let tx = self.conn.transaction()?;
		for path in paths {
			tx.execute("DELETE FROM files WHERE path = ?1", [path])?;
		}
		tx.commit()?;
		Ok(())
	}

	pub fn clear_tracked_files(&self) -> Result<(), FileDbErr>
	{
		self.conn.execute("DELETE FROM files", [])?;
		Ok(())
	}
}

fn row_to_tracked(row: &rusqlite::Row) -> Result<TrackedFile, rusqlite::Error>
{
	Ok(TrackedFile {
		path: row.get(0)?,
		crc: row.get(1)?,
		updated: row.get(2)?,
		layer: row.get(3)?,
	})
}

fn mtime_as_f64(meta: &std::fs::Metadata, path: &str) -> Result<f64, FileDbErr>
{
	let mtime = meta.modified().map_err(|source|
		FileDbErr::Io { path: path.to_string(), source })?;
	let dur = mtime.duration_since(std::time::UNIX_EPOCH)
		.map_err(|_| FileDbErr::BadMtime(path.to_string()))?;
	Ok(dur.as_secs_f64())
}

/// CRC-32 of a file's contents, chunked 64 KiB at a time as specified.
pub(crate) fn fcrc32(path: &Path) -> Result<u32, std::io::Error>
{
	use std::io::Read;

	let mut fh = std::fs::File::open(path)?;
	let mut hasher = crc32fast::Hasher::new();
	let mut buf = vec![0u8; FILE_BUFSZ.min(64 * 1024)];
	loop {
		let n = fh.read(&mut buf)?;
		if n == 0 { break; }
		hasher.update(&buf[..n]);
	}
	Ok(hasher.finalize())
}

/// Current wall-clock mtime as the f64 seconds-since-epoch this store
/// uses for `TrackedFile::updated`, sampled after an extract lands.
pub(crate) fn file_mtime(path: &Path) -> Result<f64, std::io::Error>
{
	let meta = std::fs::symlink_metadata(path)?;
	let mtime = meta.modified()?;
	let dur = mtime.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default();
	Ok(dur.as_secs_f64())
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn row(path: &str, crc: u32, layer: &str) -> TrackedFile
	{
		TrackedFile { path: path.to_string(), crc, updated: 0.0, layer: layer.to_string() }
	}

	#[test]
	fn meta_roundtrip()
	{
		let db = FileDb::open_memory().unwrap();
		assert_eq!(db.get_meta("nope").unwrap(), None);
		db.set_meta("manifest:cached:etag", "abc123").unwrap();
		assert_eq!(db.get_meta("manifest:cached:etag").unwrap(), Some("abc123".to_string()));
		db.set_meta("manifest:cached:etag", "def456").unwrap();
		assert_eq!(db.get_meta("manifest:cached:etag").unwrap(), Some("def456".to_string()));
	}

	#[test]
	fn track_and_fetch_by_layer()
	{
		let mut db = FileDb::open_memory().unwrap();
		db.track_files(&[row("a.txt", 0xAA, "base"), row("b/c.bin", 0xBB, "base")]).unwrap();

		let got = db.get_file("a.txt").unwrap().unwrap();
		assert_eq!(got.crc, 0xAA);

		let by_layer = db.get_files_by_layer("base").unwrap();
		assert_eq!(by_layer.len(), 2);
	}

	#[test]
	fn update_tracked_files_upserts()
	{
		let mut db = FileDb::open_memory().unwrap();
		db.track_files(&[row("a.txt", 0xAA, "base")]).unwrap();
		db.update_tracked_files(&[row("a.txt", 0xCC, "base")]).unwrap();
		assert_eq!(db.get_file("a.txt").unwrap().unwrap().crc, 0xCC);

		// Updating a path that was never tracked falls back to insert.
		db.update_tracked_files(&[row("new.txt", 0x11, "extra")]).unwrap();
		assert_eq!(db.get_file("new.txt").unwrap().unwrap().crc, 0x11);
	}

	#[test]
	fn delete_and_clear()
	{
		let mut db = FileDb::open_memory().unwrap();
		db.track_files(&[row("a.txt", 1, "base"), row("b.txt", 2, "base")]).unwrap();
		db.delete_tracked_files(&["a.txt".to_string()]).unwrap();
		assert!(db.get_file("a.txt").unwrap().is_none());
		assert!(db.get_file("b.txt").unwrap().is_some());

		db.clear_tracked_files().unwrap();
		assert!(db.get_file("b.txt").unwrap().is_none());
	}

	#[test]
	fn index_files_detects_removed_and_modified()
	{
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a.txt");
		std::fs::write(&path, b"hello").unwrap();
		let crc = fcrc32(&path).unwrap();
		let mtime = file_mtime(&path).unwrap();

		let mut db = FileDb::open_memory().unwrap();
		db.track_files(&[TrackedFile { path: "a.txt".into(), crc, updated: mtime, layer: "base".into() }]).unwrap();
		db.track_files(&[TrackedFile { path: "gone.txt".into(), crc: 1, updated: 0.0, layer: "base".into() }]).unwrap();

		// Nothing changed yet: index_files should leave crc/updated untouched.
		let idx = db.index_files(dir.path()).unwrap();
		assert_eq!(idx.removed, vec!["gone.txt".to_string()]);
		assert!(idx.modified.is_empty());

		// Now touch the same content with a new mtime and the real
		// content with changed bytes.
		std::fs::write(&path, b"hello, world").unwrap();
		let idx = db.index_files(dir.path()).unwrap();
		assert_eq!(idx.modified, vec!["a.txt".to_string()]);
		let updated_row = db.get_file("a.txt").unwrap().unwrap();
		assert_ne!(updated_row.crc, crc);
	}
}
