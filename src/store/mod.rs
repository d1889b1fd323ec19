//! Transactional SQLite store of captured help texts.
//!
//! Entries are validated against the current on-disk dependency content
//! at lookup time, so a hit is correct under arbitrary file mutation.
//! Multiple processes may share a store; SQLite's transactional isolation
//! is the only locking.

mod schema;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags};

use crate::fingerprint;

pub use schema::SCHEMA;

/// A cache entry whose recorded file fingerprints all matched the
/// current on-disk content.
pub struct CachedHelp {
    pub help_text: Vec<u8>,
    pub exit_status: i32,
}

pub struct CacheStore {
    conn: Connection,
    read_only: bool,
    schema_ready: bool,
    verbose: bool,
}

impl CacheStore {
    /// Open (creating if necessary) the cache at `path`. A database we
    /// cannot write to downgrades to read-only: lookups still work and
    /// inserts become no-ops.
    pub fn open(path: &Path, verbose: bool) -> Result<Self> {
        let (conn, read_only) = match Connection::open(path) {
            // Probe with a harmless write; SQLITE_READONLY here means the
            // file opened but can't be written.
            Ok(conn) => match conn.execute_batch("PRAGMA user_version = 0;") {
                Ok(()) => (conn, false),
                Err(err) if is_read_only_error(&err) => (conn, true),
                Err(err) => {
                    return Err(err).with_context(|| format!("can't probe '{}'", path.display()))
                }
            },
            Err(_) => {
                let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                    .with_context(|| format!("can't open '{}'", path.display()))?;
                (conn, true)
            }
        };

        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )?;
        let mut schema_ready = tables > 0;
        if !read_only && !schema_ready {
            conn.execute_batch(schema::SCHEMA)?;
            schema_ready = true;
        }

        Ok(Self {
            conn,
            read_only,
            schema_ready,
            verbose,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Find the newest entry for `cmd_fingerprint` whose recorded file
    /// fingerprints still match the on-disk content. Touches the entry's
    /// `atime` on a hit when the store is writable.
    pub fn lookup(&self, cmd_fingerprint: &str) -> Result<Option<CachedHelp>> {
        if !self.schema_ready {
            return Ok(None);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, help_text, exit_status FROM command
             WHERE fingerprint = ?1 ORDER BY id DESC",
        )?;
        let candidates = stmt
            .query_map(params![cmd_fingerprint], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i32>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for (id, help_text, exit_status) in candidates {
            if self.entry_is_current(id)? {
                if !self.read_only {
                    self.conn.execute(
                        "UPDATE command SET atime = ?1 WHERE id = ?2",
                        params![Utc::now().timestamp(), id],
                    )?;
                }
                if self.verbose {
                    eprintln!("helpcache: cache hit (entry {id})");
                }
                return Ok(Some(CachedHelp {
                    help_text,
                    exit_status,
                }));
            }
        }

        if self.verbose {
            eprintln!("helpcache: cache miss");
        }
        Ok(None)
    }

    /// Whether every file recorded for the entry still carries its
    /// recorded fingerprint. Entries with no recorded files never
    /// validate; their file set was never stored.
    fn entry_is_current(&self, command_id: i64) -> Result<bool> {
        let mut stmt = self.conn.prepare(
            "SELECT file.path, file.fingerprint FROM file
             JOIN command_file ON command_file.file_id = file.id
             WHERE command_file.command_id = ?1",
        )?;
        let files = stmt
            .query_map(params![command_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if files.is_empty() {
            return Ok(false);
        }
        for (path, recorded) in files {
            let current = fingerprint::file_fingerprint(Path::new(&path), true)?;
            if current != recorded {
                if self.verbose {
                    eprintln!("helpcache: entry {command_id} is stale ('{path}' changed)");
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Record a fresh capture. Everything lands in one transaction;
    /// duplicate dependency paths and already-known file contents
    /// collapse onto existing rows. No-op when the store is read-only.
    pub fn insert(
        &mut self,
        argv: &[String],
        cmd_fingerprint: &str,
        help_text: &[u8],
        exit_status: i32,
        dep_paths: &[PathBuf],
    ) -> Result<()> {
        if self.read_only {
            return Ok(());
        }

        let now = Utc::now().timestamp();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO command (argv, fingerprint, ctime, atime, help_text, exit_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                argv.join(" "),
                cmd_fingerprint,
                now,
                now,
                help_text,
                exit_status
            ],
        )?;
        let command_id = tx.last_insert_rowid();

        for path in dep_paths {
            let file_fp = fingerprint::file_fingerprint(path, false)?;
            let path_text = path.to_string_lossy();
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO file (path, fingerprint) VALUES (?1, ?2)",
                params![&*path_text, file_fp],
            )?;
            let file_id: i64 = if inserted == 0 {
                tx.query_row(
                    "SELECT id FROM file WHERE fingerprint = ?1",
                    params![file_fp],
                    |row| row.get(0),
                )?
            } else {
                tx.last_insert_rowid()
            };
            tx.execute(
                "INSERT OR IGNORE INTO command_file (command_id, file_id) VALUES (?1, ?2)",
                params![command_id, file_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn is_read_only_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::ReadOnly,
                ..
            },
            _,
        )
    )
}
