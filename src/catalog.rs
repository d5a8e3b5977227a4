//! Catalog persistence for videos and their subtitle tracks.
//!
//! The catalog lives in a single SQLite database in WAL mode. All writes are
//! funnelled through one writer connection guarded by a mutex with a bounded
//! wait; reads open a short-lived connection per call and run inside a read
//! transaction, so a multi-query read (the admin listing) sees one snapshot
//! and never a half-applied write.
//!
//! Every operation is async and takes an [`OpContext`]. The SQLite work runs
//! on the blocking pool; if the context is cancelled or its deadline passes,
//! the running statement is interrupted and the call returns
//! [`CatalogError::Cancelled`].

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{
    Connection, InterruptHandle, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};
use serde::{Deserialize, Serialize};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, info_span, warn};

use crate::config::DEFAULT_BUSY_TIMEOUT_MS;
use crate::context::OpContext;
use crate::error::{CatalogError, CatalogResult};
use crate::resolver;
use crate::subtitle::SubtitleFormat;

/// A registered video. The media itself is never stored, only its URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: i64,
    pub original_url: String,
    pub title: String,
}

/// A subtitle track attached to a video.
///
/// `content` is `None` in the bulk admin listing, which only carries the
/// track descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtitle {
    pub id: i64,
    pub video_id: i64,
    pub language: String,
    #[serde(rename = "type")]
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoWithSubtitles {
    #[serde(flatten)]
    pub video: Video,
    pub subtitles: Vec<Subtitle>,
}

/// Input for [`CatalogStore::create_subtitle`]. `content` must already be in
/// `format`.
#[derive(Debug, Clone)]
pub struct NewSubtitle {
    pub video_id: i64,
    pub language: String,
    pub format: SubtitleFormat,
    pub content: String,
}

const MMAP_SIZE_BYTES: i64 = 256 * 1024 * 1024;
const JOURNAL_SIZE_LIMIT_BYTES: i64 = 64 * 1024 * 1024;
const WAL_AUTOCHECKPOINT_PAGES: i64 = 1_000;

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
}

/// Cloneable handle to the catalog database.
#[derive(Clone)]
pub struct CatalogStore {
    inner: Arc<Inner>,
    span: Span,
}

struct Inner {
    db_path: PathBuf,
    writer: Mutex<Connection>,
    busy_timeout: Duration,
}

impl CatalogStore {
    /// Opens (and if necessary creates) the database with the default lock
    /// timeout.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::open_with_timeout(path, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
    }

    /// Opens the database, enables WAL and makes sure the schema is current.
    /// `busy_timeout` bounds both SQLite's lock wait and the wait for the
    /// writer connection.
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating catalog directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("opening catalog DB {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"WAL")
            .context("enabling WAL mode for catalog DB")?;
        configure(&conn, busy_timeout).context("configuring catalog DB connection")?;
        ensure_schema(&mut conn).context("preparing catalog schema")?;

        Ok(Self {
            inner: Arc::new(Inner {
                db_path: path.to_path_buf(),
                writer: Mutex::new(conn),
                busy_timeout,
            }),
            span: info_span!("catalog"),
        })
    }

    /// Reports catalog events under `span` instead of the default
    /// `catalog` span. Clones made afterwards inherit it.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Looks a video up by its YouTube id. When several rows share the id the
    /// oldest registration wins.
    pub async fn find_video_by_key(
        &self,
        ctx: &OpContext,
        key: &str,
    ) -> CatalogResult<Option<Video>> {
        let key = key.to_owned();
        self.run(ctx, Access::Read, move |_, tx| {
            let video = tx
                .query_row(
                    r#"
                    SELECT id, original_url, title
                    FROM videos
                    WHERE video_key = ?1
                    ORDER BY id ASC
                    LIMIT 1
                    "#,
                    params![key],
                    row_to_video,
                )
                .optional()?;
            Ok(video)
        })
        .await
    }

    pub async fn get_video(&self, ctx: &OpContext, id: i64) -> CatalogResult<Option<Video>> {
        self.run(ctx, Access::Read, move |_, tx| {
            let video = tx
                .query_row(
                    "SELECT id, original_url, title FROM videos WHERE id = ?1",
                    params![id],
                    row_to_video,
                )
                .optional()?;
            Ok(video)
        })
        .await
    }

    /// Returns every subtitle of `video_id` with its content, oldest first.
    /// A video without subtitles yields an empty vector.
    pub async fn list_subtitles_for_video(
        &self,
        ctx: &OpContext,
        video_id: i64,
    ) -> CatalogResult<Vec<Subtitle>> {
        self.run(ctx, Access::Read, move |_, tx| {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, video_id, language, type, content
                FROM subtitles
                WHERE video_id = ?1
                ORDER BY id ASC
                "#,
            )?;
            let subtitles = stmt
                .query_map(params![video_id], row_to_subtitle)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(subtitles)
        })
        .await
    }

    /// Lists all videos, each paired with its subtitle descriptors (no
    /// content).
    ///
    /// A video whose subtitles cannot be read is logged and listed with no
    /// subtitles instead of failing the whole listing.
    pub async fn list_videos_with_subtitles(
        &self,
        ctx: &OpContext,
    ) -> CatalogResult<Vec<VideoWithSubtitles>> {
        self.run(ctx, Access::Read, move |span, tx| {
            let videos = {
                let mut stmt =
                    tx.prepare("SELECT id, original_url, title FROM videos ORDER BY id ASC")?;
                let videos = stmt
                    .query_map([], row_to_video)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                videos
            };

            let mut stmt = tx.prepare(
                r#"
                SELECT id, video_id, language, type
                FROM subtitles
                WHERE video_id = ?1
                ORDER BY id ASC
                "#,
            )?;

            let mut listing = Vec::with_capacity(videos.len());
            for video in videos {
                let subtitles = stmt
                    .query_map(params![video.id], row_to_subtitle_descriptor)
                    .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>());
                let subtitles = match subtitles {
                    Ok(subtitles) => subtitles,
                    Err(rusqlite::Error::SqliteFailure(code, msg))
                        if code.code == rusqlite::ErrorCode::OperationInterrupted =>
                    {
                        return Err(CatalogError::from_sqlite(
                            rusqlite::Error::SqliteFailure(code, msg),
                            None,
                            None,
                        ));
                    }
                    Err(err) => {
                        warn!(
                            parent: span,
                            video_id = video.id,
                            error = %err,
                            "failed to load subtitles for video"
                        );
                        Vec::new()
                    }
                };
                listing.push(VideoWithSubtitles { video, subtitles });
            }
            Ok(listing)
        })
        .await
    }

    /// Registers a video and returns its id.
    ///
    /// Fails with [`CatalogError::Conflict`] if `url` is already registered.
    pub async fn create_video(&self, ctx: &OpContext, url: &str, title: &str) -> CatalogResult<i64> {
        let url = url.to_owned();
        let title = title.to_owned();
        self.run(ctx, Access::Write, move |span, tx| {
            let key = resolver::video_key_from_url(&url);
            if key.is_none() {
                warn!(parent: span, url = %url, "video URL has no recognizable id; it will not be reachable from the player");
            }

            tx.execute(
                "INSERT INTO videos (original_url, title, video_key) VALUES (?1, ?2, ?3)",
                params![url, title, key],
            )
            .map_err(|err| CatalogError::from_sqlite(err, Some(&url), None))?;
            let id = tx.last_insert_rowid();

            info!(parent: span, video_id = id, url = %url, key = ?key, "video created");
            Ok(id)
        })
        .await
    }

    /// Deletes a video together with all of its subtitles in one transaction.
    /// Deleting an unknown id is not an error.
    pub async fn delete_video(&self, ctx: &OpContext, id: i64) -> CatalogResult<()> {
        self.run(ctx, Access::Write, move |span, tx| {
            let subtitles = tx.execute("DELETE FROM subtitles WHERE video_id = ?1", params![id])?;
            let videos = tx.execute("DELETE FROM videos WHERE id = ?1", params![id])?;
            if videos == 0 {
                debug!(parent: span, video_id = id, "delete of unknown video ignored");
            } else {
                info!(parent: span, video_id = id, subtitles, "video deleted");
            }
            Ok(())
        })
        .await
    }

    /// Stores a subtitle track and returns its id.
    ///
    /// Fails with [`CatalogError::MissingVideo`] if the parent video does not
    /// exist; nothing is written in that case.
    pub async fn create_subtitle(&self, ctx: &OpContext, subtitle: NewSubtitle) -> CatalogResult<i64> {
        self.run(ctx, Access::Write, move |span, tx| {
            let NewSubtitle {
                video_id,
                language,
                format,
                content,
            } = subtitle;

            let exists = tx
                .query_row("SELECT 1 FROM videos WHERE id = ?1", params![video_id], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Err(CatalogError::MissingVideo(video_id));
            }

            tx.execute(
                "INSERT INTO subtitles (video_id, language, type, content) VALUES (?1, ?2, ?3, ?4)",
                params![video_id, language, format.as_str(), content],
            )
            .map_err(|err| CatalogError::from_sqlite(err, None, Some(video_id)))?;
            let id = tx.last_insert_rowid();

            info!(parent: span, subtitle_id = id, video_id, language = %language, "subtitle created");
            Ok(id)
        })
        .await
    }

    /// Deletes a single subtitle. Deleting an unknown id is not an error.
    pub async fn delete_subtitle(&self, ctx: &OpContext, id: i64) -> CatalogResult<()> {
        self.run(ctx, Access::Write, move |span, tx| {
            let removed = tx.execute("DELETE FROM subtitles WHERE id = ?1", params![id])?;
            debug!(parent: span, subtitle_id = id, removed, "subtitle delete");
            Ok(())
        })
        .await
    }

    /// Runs `f` inside a transaction on the blocking pool and races it against
    /// the context. Writes use the shared writer connection, reads a fresh one.
    async fn run<T, F>(&self, ctx: &OpContext, access: Access, f: F) -> CatalogResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Span, &Transaction<'_>) -> CatalogResult<T> + Send + 'static,
    {
        if ctx.is_cancelled() {
            return Err(CatalogError::Cancelled);
        }

        let token = ctx.token().child_token();
        let slot: Arc<Mutex<Option<InterruptHandle>>> = Arc::new(Mutex::new(None));
        let inner = self.inner.clone();
        let span = self.span.clone();
        let worker_token = token.clone();
        let worker_slot = slot.clone();

        let mut job = task::spawn_blocking(move || -> CatalogResult<T> {
            match access {
                Access::Write => {
                    let mut conn = inner
                        .writer
                        .try_lock_for(inner.busy_timeout)
                        .ok_or(CatalogError::LockTimeout(inner.busy_timeout))?;
                    run_guarded(&span, &mut conn, &worker_slot, &worker_token, access, f)
                }
                Access::Read => {
                    let mut conn = inner.open_reader()?;
                    run_guarded(&span, &mut conn, &worker_slot, &worker_token, access, f)
                }
            }
        });

        tokio::select! {
            joined = &mut job => flatten(joined),
            _ = ctx.done() => {
                token.cancel();
                let interrupted = match slot.lock().as_ref() {
                    Some(handle) => {
                        handle.interrupt();
                        true
                    }
                    None => false,
                };
                if interrupted || job.is_finished() {
                    // The statement was interrupted (or already done); the
                    // worker returns promptly with the real outcome.
                    flatten(job.await)
                } else {
                    // Not started yet: the worker sees the cancelled token
                    // before touching the database.
                    debug!(parent: &self.span, "catalog call cancelled before it started");
                    Err(CatalogError::Cancelled)
                }
            }
        }
    }
}

impl Inner {
    fn open_reader(&self) -> CatalogResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        configure(&conn, self.busy_timeout)?;
        Ok(conn)
    }
}

fn run_guarded<T, F>(
    span: &Span,
    conn: &mut Connection,
    slot: &Mutex<Option<InterruptHandle>>,
    token: &CancellationToken,
    access: Access,
    f: F,
) -> CatalogResult<T>
where
    F: FnOnce(&Span, &Transaction<'_>) -> CatalogResult<T>,
{
    slot.lock().replace(conn.get_interrupt_handle());
    let result = if token.is_cancelled() {
        Err(CatalogError::Cancelled)
    } else {
        in_transaction(span, conn, access, f)
    };
    // Cleared before the writer lock is released so a late interrupt cannot
    // hit the next caller's statement.
    slot.lock().take();

    result.map_err(|err| match err {
        CatalogError::Unavailable(err) => CatalogError::from_sqlite(err, None, None),
        other => other,
    })
}

fn in_transaction<T, F>(span: &Span, conn: &mut Connection, access: Access, f: F) -> CatalogResult<T>
where
    F: FnOnce(&Span, &Transaction<'_>) -> CatalogResult<T>,
{
    let behavior = match access {
        Access::Read => TransactionBehavior::Deferred,
        Access::Write => TransactionBehavior::Immediate,
    };
    let tx = conn.transaction_with_behavior(behavior)?;
    let value = f(span, &tx)?;
    tx.commit()?;
    Ok(value)
}

fn flatten<T>(joined: Result<CatalogResult<T>, task::JoinError>) -> CatalogResult<T> {
    joined.map_err(|err| CatalogError::Worker(err.to_string()))?
}

/// Per-connection settings. WAL is a property of the database file and is
/// set once when the store opens.
fn configure(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", &"ON")?;
    conn.pragma_update(None, "synchronous", &"NORMAL")?;
    conn.pragma_update(None, "temp_store", &"MEMORY")?;
    conn.pragma_update(None, "cache_size", &-64_000)?;
    conn.pragma_update(None, "mmap_size", &MMAP_SIZE_BYTES)?;
    conn.pragma_update(None, "journal_size_limit", &JOURNAL_SIZE_LIMIT_BYTES)?;
    conn.pragma_update(None, "wal_autocheckpoint", &WAL_AUTOCHECKPOINT_PAGES)?;
    Ok(())
}

/// Creates the tables if needed and migrates databases that predate the
/// `video_key` column. Wrapped in a transaction so a failure leaves the DB
/// untouched.
fn ensure_schema(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            original_url TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            video_key TEXT
        );

        CREATE TABLE IF NOT EXISTS subtitles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            video_id INTEGER NOT NULL,
            language TEXT NOT NULL,
            type TEXT NOT NULL,
            content TEXT NOT NULL,
            FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
        );
        "#,
    )?;

    if !has_column(&tx, "videos", "video_key")? {
        tx.execute_batch("ALTER TABLE videos ADD COLUMN video_key TEXT")?;
    }
    backfill_video_keys(&tx)?;

    tx.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_videos_video_key ON videos(video_key);
        CREATE INDEX IF NOT EXISTS idx_subtitles_video_id ON subtitles(video_id);
        "#,
    )?;

    tx.commit()
}

fn has_column(tx: &Transaction<'_>, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>("name"))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}

/// Fills `video_key` for rows written before the column existed.
fn backfill_video_keys(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    let pending = {
        let mut stmt =
            tx.prepare("SELECT id, original_url FROM videos WHERE video_key IS NULL")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut update = tx.prepare("UPDATE videos SET video_key = ?1 WHERE id = ?2")?;
    for (id, url) in pending {
        if let Some(key) = resolver::video_key_from_url(&url) {
            update.execute(params![key, id])?;
        }
    }
    Ok(())
}

fn row_to_video(row: &Row<'_>) -> rusqlite::Result<Video> {
    Ok(Video {
        id: row.get("id")?,
        original_url: row.get("original_url")?,
        title: row.get("title")?,
    })
}

fn row_to_subtitle(row: &Row<'_>) -> rusqlite::Result<Subtitle> {
    Ok(Subtitle {
        content: Some(row.get("content")?),
        ..row_to_subtitle_descriptor(row)?
    })
}

fn row_to_subtitle_descriptor(row: &Row<'_>) -> rusqlite::Result<Subtitle> {
    Ok(Subtitle {
        id: row.get("id")?,
        video_id: row.get("video_id")?,
        language: row.get("language")?,
        format: row.get("type")?,
        content: None,
    })
}
