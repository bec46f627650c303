//! SQLite implementation of the tree database.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::ContentHash;

use super::{ContentRecord, DbError, EncodedContent, TreeDb};

/// Open mode, set per operation: serving opens read-only, publishing
/// read-write, setup additionally creates the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbMode {
    ReadOnly,
    ReadWrite,
    Create,
}

impl DbMode {
    fn flags(self) -> OpenFlags {
        let base = OpenFlags::SQLITE_OPEN_NO_MUTEX;
        match self {
            DbMode::ReadOnly => base | OpenFlags::SQLITE_OPEN_READ_ONLY,
            DbMode::ReadWrite => base | OpenFlags::SQLITE_OPEN_READ_WRITE,
            DbMode::Create => {
                base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
        }
    }
}

/// Strip the `file:` DSN form down to a relative path.
///
/// The persisted configuration uses `file:rel/path.db?mode=…`; the mode
/// query is advisory there, each command opens with the mode its operation
/// needs. A bare path is accepted as-is.
pub fn dsn_path(dsn: &str) -> &str {
    let s = dsn.strip_prefix("file:").unwrap_or(dsn);
    match s.split_once('?') {
        Some((path, _)) => path,
        None => s,
    }
}

pub struct SqliteTreeDb {
    conn: Mutex<Connection>,
}

fn wrap_db_err(e: rusqlite::Error) -> DbError {
    match &e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound,
        rusqlite::Error::SqliteFailure(f, _) => match f.code {
            rusqlite::ErrorCode::ConstraintViolation => DbError::UniqueConflict,
            rusqlite::ErrorCode::CannotOpen
            | rusqlite::ErrorCode::DatabaseBusy
            | rusqlite::ErrorCode::DatabaseLocked => DbError::Connection(e),
            _ => DbError::Sqlite(e),
        },
        _ => DbError::Sqlite(e),
    }
}

fn parse_hash(s: String) -> Result<ContentHash, DbError> {
    ContentHash::from_str(&s).map_err(|_| DbError::MalformedChecksum(s))
}

impl SqliteTreeDb {
    pub fn open(path: &Path, mode: DbMode) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(path, mode.flags()).map_err(wrap_db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests and tooling.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().map_err(wrap_db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // a poisoned lock means a panic mid-statement; propagating the
        // panic is the only sound option here
        self.conn.lock().expect("tree db lock poisoned")
    }

    /// Collect every hash the named record references, primary first.
    fn referenced_hashes(conn: &Connection, name: &str) -> Result<Vec<String>, DbError> {
        let mut hashes = Vec::new();
        let primary: Option<String> = conn
            .query_row(
                "SELECT hash FROM content WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(wrap_db_err)?;
        let Some(primary) = primary else {
            return Err(DbError::NotFound);
        };
        hashes.push(primary);

        let mut stmt = conn
            .prepare("SELECT hash FROM encoded WHERE name = ?1 ORDER BY ord ASC")
            .map_err(wrap_db_err)?;
        let rows = stmt
            .query_map(params![name], |row| row.get::<_, String>(0))
            .map_err(wrap_db_err)?;
        for row in rows {
            hashes.push(row.map_err(wrap_db_err)?);
        }
        Ok(hashes)
    }

    fn enqueue_gc(conn: &Connection, hashes: &[String]) -> Result<(), DbError> {
        let mut stmt = conn
            .prepare("INSERT OR IGNORE INTO gc (hash) VALUES (?1)")
            .map_err(wrap_db_err)?;
        for hash in hashes {
            stmt.execute(params![hash]).map_err(wrap_db_err)?;
        }
        Ok(())
    }

    fn write_encodings(
        conn: &Connection,
        name: &str,
        encodings: &[EncodedContent],
    ) -> Result<(), DbError> {
        conn.execute("DELETE FROM encoded WHERE name = ?1", params![name])
            .map_err(wrap_db_err)?;
        let mut stmt = conn
            .prepare("INSERT INTO encoded (name, code, ord, hash) VALUES (?1, ?2, ?3, ?4)")
            .map_err(wrap_db_err)?;
        for (n, enc) in encodings.iter().enumerate() {
            stmt.execute(params![name, enc.code, (n + 1) as i64, enc.hash.as_str()])
                .map_err(wrap_db_err)?;
        }
        Ok(())
    }
}

impl TreeDb for SqliteTreeDb {
    fn setup(&self) -> Result<(), DbError> {
        self.lock()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS content (
                    name TEXT PRIMARY KEY,
                    hash TEXT NOT NULL,
                    contenttype TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS content_hash_index ON content (hash);

                CREATE TABLE IF NOT EXISTS encoded (
                    name TEXT NOT NULL,
                    code TEXT NOT NULL,
                    ord INTEGER NOT NULL,
                    hash TEXT NOT NULL,
                    PRIMARY KEY (name, code),
                    UNIQUE (name, ord)
                );
                CREATE INDEX IF NOT EXISTS encoded_hash_index ON encoded (hash);

                CREATE TABLE IF NOT EXISTS gc (
                    hash TEXT PRIMARY KEY
                );
                "#,
            )
            .map_err(wrap_db_err)
    }

    fn exists(&self, name: &str) -> Result<bool, DbError> {
        self.lock()
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM content WHERE name = ?1)",
                params![name],
                |row| row.get(0),
            )
            .map_err(wrap_db_err)
    }

    fn content_exists(&self, hash: &ContentHash) -> Result<bool, DbError> {
        self.lock()
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM content WHERE hash = ?1)
                    OR EXISTS (SELECT 1 FROM encoded WHERE hash = ?1)",
                params![hash.as_str()],
                |row| row.get(0),
            )
            .map_err(wrap_db_err)
    }

    fn get(&self, name: &str) -> Result<ContentRecord, DbError> {
        let conn = self.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT hash, contenttype FROM content WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(wrap_db_err)?;
        let Some((hash, content_type)) = row else {
            return Err(DbError::NotFound);
        };

        let mut stmt = conn
            .prepare("SELECT code, hash FROM encoded WHERE name = ?1 ORDER BY ord ASC")
            .map_err(wrap_db_err)?;
        let rows = stmt
            .query_map(params![name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(wrap_db_err)?;
        let mut encodings = Vec::new();
        for row in rows {
            let (code, hash) = row.map_err(wrap_db_err)?;
            encodings.push(EncodedContent {
                code,
                hash: parse_hash(hash)?,
            });
        }

        Ok(ContentRecord {
            hash: parse_hash(hash)?,
            content_type,
            encodings,
        })
    }

    fn list(&self, limit: usize, after: Option<&str>) -> Result<Vec<String>, DbError> {
        let conn = self.lock();
        let mut names = Vec::new();
        match after {
            Some(after) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT name FROM content WHERE name > ?1 ORDER BY name ASC LIMIT ?2",
                    )
                    .map_err(wrap_db_err)?;
                let rows = stmt
                    .query_map(params![after, limit as i64], |row| row.get::<_, String>(0))
                    .map_err(wrap_db_err)?;
                for row in rows {
                    names.push(row.map_err(wrap_db_err)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT name FROM content ORDER BY name ASC LIMIT ?1")
                    .map_err(wrap_db_err)?;
                let rows = stmt
                    .query_map(params![limit as i64], |row| row.get::<_, String>(0))
                    .map_err(wrap_db_err)?;
                for row in rows {
                    names.push(row.map_err(wrap_db_err)?);
                }
            }
        }
        Ok(names)
    }

    fn insert(&self, name: &str, record: &ContentRecord) -> Result<(), DbError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction().map_err(wrap_db_err)?;
        tx.execute(
            "INSERT INTO content (name, hash, contenttype) VALUES (?1, ?2, ?3)",
            params![name, record.hash.as_str(), record.content_type],
        )
        .map_err(wrap_db_err)?;
        Self::write_encodings(&tx, name, &record.encodings)?;
        tx.commit().map_err(wrap_db_err)
    }

    fn update(&self, name: &str, record: &ContentRecord) -> Result<(), DbError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction().map_err(wrap_db_err)?;
        let old = Self::referenced_hashes(&tx, name)?;
        Self::enqueue_gc(&tx, &old)?;
        tx.execute(
            "UPDATE content SET hash = ?2, contenttype = ?3 WHERE name = ?1",
            params![name, record.hash.as_str(), record.content_type],
        )
        .map_err(wrap_db_err)?;
        Self::write_encodings(&tx, name, &record.encodings)?;
        tx.commit().map_err(wrap_db_err)
    }

    fn delete(&self, name: &str) -> Result<(), DbError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction().map_err(wrap_db_err)?;
        let old = Self::referenced_hashes(&tx, name)?;
        Self::enqueue_gc(&tx, &old)?;
        tx.execute("DELETE FROM content WHERE name = ?1", params![name])
            .map_err(wrap_db_err)?;
        tx.execute("DELETE FROM encoded WHERE name = ?1", params![name])
            .map_err(wrap_db_err)?;
        tx.commit().map_err(wrap_db_err)
    }

    fn gc_candidates(&self) -> Result<Vec<ContentHash>, DbError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT hash FROM gc")
            .map_err(wrap_db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(wrap_db_err)?;
        let mut hashes = Vec::new();
        for row in rows {
            hashes.push(parse_hash(row.map_err(wrap_db_err)?)?);
        }
        Ok(hashes)
    }

    fn gc_dequeue(&self, hash: &ContentHash) -> Result<(), DbError> {
        self.lock()
            .execute("DELETE FROM gc WHERE hash = ?1", params![hash.as_str()])
            .map_err(wrap_db_err)?;
        Ok(())
    }
}
