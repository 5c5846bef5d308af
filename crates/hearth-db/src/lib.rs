//! Hearth persistence layer for story metadata and auth-gate sessions.
//!
//! This crate offers an async API around SQLite (sqlx) for the story-time
//! backend: the `stories` catalog written once per successful upload and read
//! back for listings and playback, plus the `sessions` table backing the HTTP
//! daemon's bearer-token gate. Video bytes never pass through here — a story
//! row only carries the object key that addresses them in the blob store.

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///var/lib/hearth/hearth.db`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await?;

        // Run embedded migrations. The directory is resolved relative to this crate.
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    /// Exposes the underlying pool for callers that compose their own queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Commits a story row referencing an already-transferred blob object and
    /// returns the persisted record. The object key is claimed exactly once;
    /// a second insert with the same key is rejected.
    pub async fn insert_story(&self, data: NewStory<'_>) -> Result<StoryRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO stories (id, title, reader, video_object_key, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(data.title)
        .bind(data.reader.as_str())
        .bind(data.video_object_key)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                anyhow::Error::new(StoryError::DuplicateObjectKey(
                    data.video_object_key.to_owned(),
                ))
            } else {
                err.into()
            }
        })?;

        self.fetch_story(id).await?.ok_or_else(|| {
            anyhow!(
                "story inserted but missing when reloaded (key={})",
                data.video_object_key
            )
        })
    }

    /// Retrieves a story by its identifier.
    pub async fn fetch_story(&self, id: Uuid) -> Result<Option<StoryRecord>> {
        let row = sqlx::query("SELECT * FROM stories WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_story).transpose()
    }

    /// Lists all stories ordered by creation time descending. Inserted order
    /// breaks ties within the same timestamp.
    pub async fn list_stories(&self) -> Result<Vec<StoryRecord>> {
        let mut rows =
            sqlx::query("SELECT * FROM stories ORDER BY created_at DESC, rowid DESC")
                .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_story(row)?);
        }
        Ok(out)
    }

    /// Registers a new auth-gate session keyed by the SHA-256 of its bearer token.
    pub async fn insert_session(&self, data: NewSession<'_>) -> Result<SessionRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, token_hash, token_prefix, user_name,
                created_at, last_seen_at, expires_at, revoked
            ) VALUES (?, ?, ?, ?, ?, NULL, ?, 0)
            "#,
        )
        .bind(id.to_string())
        .bind(data.token_hash)
        .bind(data.token_prefix)
        .bind(data.user_name)
        .bind(now.to_rfc3339())
        .bind(data.expires_at.map(|ts| ts.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        self.fetch_session(id)
            .await?
            .ok_or_else(|| anyhow!("session inserted but missing when reloaded"))
    }

    /// Looks up a session by the hash of its bearer token.
    pub async fn find_session_by_hash(&self, token_hash: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_session).transpose()
    }

    /// Retrieves a session by its identifier.
    pub async fn fetch_session(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_session).transpose()
    }

    /// Records that a session token was just presented.
    pub async fn touch_session_usage(&self, id: Uuid, seen_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_seen_at = ? WHERE id = ?")
            .bind(seen_at.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks a session revoked; its token stops authorizing immediately.
    pub async fn revoke_session(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET revoked = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn map_story(row: SqliteRow) -> Result<StoryRecord> {
    let id: String = row.try_get("id")?;
    let reader: String = row.try_get("reader")?;

    Ok(StoryRecord {
        id: Uuid::parse_str(&id)?,
        title: row.try_get("title")?,
        reader: Reader::from_str(&reader)?,
        video_object_key: row.try_get("video_object_key")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
    })
}

fn map_session(row: SqliteRow) -> Result<SessionRecord> {
    let id: String = row.try_get("id")?;
    let revoked: i32 = row.try_get("revoked")?;

    Ok(SessionRecord {
        id: Uuid::parse_str(&id)?,
        token_hash: row.try_get("token_hash")?,
        token_prefix: row.try_get("token_prefix")?,
        user_name: row.try_get("user_name")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        last_seen_at: row
            .try_get::<Option<String>, _>("last_seen_at")?
            .map(parse_datetime)
            .transpose()?,
        expires_at: row
            .try_get::<Option<String>, _>("expires_at")?
            .map(parse_datetime)
            .transpose()?,
        revoked: revoked != 0,
    })
}

/// Errors returned by the database layer.
#[derive(Debug, Error, Clone)]
pub enum StoryError {
    #[error("object key '{0}' is already referenced by another story")]
    DuplicateObjectKey(String),
    #[error("story '{0}' not found")]
    NotFound(Uuid),
}

/// Narrator identity associated with a story. Closed set today; adding a
/// member means adding it here, in `as_str` and in `from_str`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Reader {
    Granny,
    Grandpa,
}

impl Reader {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reader::Granny => "granny",
            Reader::Grandpa => "grandpa",
        }
    }

    /// All members, for validation messages.
    pub const ALL: [Reader; 2] = [Reader::Granny, Reader::Grandpa];
}

impl FromStr for Reader {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "granny" => Ok(Reader::Granny),
            "grandpa" => Ok(Reader::Grandpa),
            other => Err(anyhow!("unknown reader: {}", other)),
        }
    }
}

/// Input payload for story creation.
#[derive(Debug, Clone)]
pub struct NewStory<'a> {
    pub title: &'a str,
    pub reader: Reader,
    pub video_object_key: &'a str,
}

/// Persisted story metadata row. The blob store owns the bytes; the two
/// systems are linked only through `video_object_key`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoryRecord {
    pub id: Uuid,
    pub title: String,
    pub reader: Reader,
    pub video_object_key: String,
    pub created_at: DateTime<Utc>,
}

/// Input payload for session provisioning.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub token_hash: &'a str,
    pub token_prefix: &'a str,
    pub user_name: &'a str,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Persisted auth-gate session row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub token_hash: String,
    pub token_prefix: String,
    pub user_name: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}
