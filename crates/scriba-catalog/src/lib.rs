// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! scriba-catalog
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use scriba_core::{Job, JobState, QualityProfile, Segment};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Underlying database failure.
    #[error("database failure")]
    Database(#[from] sqlx::Error),

    /// A write attempted a state change outside the legal transition set.
    #[error("illegal job transition: {from} -> {to}")]
    IllegalTransition {
        /// Current state.
        from: JobState,
        /// Requested state.
        to: JobState,
    },

    /// The requested row does not exist (or is owned by someone else).
    #[error("job not found")]
    JobNotFound,

    /// Signup with an email that already has an account.
    #[error("email already registered")]
    DuplicateEmail,

    /// A stored value could not be decoded back into its domain type.
    #[error("corrupt row: {detail}")]
    Corrupt {
        /// What failed to decode.
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A registered account.
#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique email address.
    pub email: String,
    /// Argon2 password hash.
    pub password_hash: String,
    /// Whether the account may authenticate.
    pub is_active: bool,
    /// Account creation time.
    pub created_at: DateTime<Utc>,
}

/// Mutable fields applied together with a state transition.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    /// Transcript artifact key (set on completion).
    pub transcript_key: Option<String>,
    /// Final segment list (set on completion).
    pub segments: Option<Vec<Segment>>,
    /// Audio duration in seconds.
    pub duration_seconds: Option<f64>,
    /// Detected language.
    pub language: Option<String>,
    /// Failure summary (set on failure).
    pub error_message: Option<String>,
}

/// Owner-scoped search filters for [`Catalog::list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    /// Case-insensitive substring over title, language, and tags.
    pub search: Option<String>,
    /// Exact state match.
    pub state: Option<JobState>,
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Handle to the relational catalog.
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY,
    email         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    is_active     INTEGER NOT NULL DEFAULT 1,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profiles (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    description TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id               TEXT PRIMARY KEY,
    owner_id         TEXT NOT NULL,
    envelope_id      TEXT NOT NULL UNIQUE,
    state            TEXT NOT NULL,
    quality_profile  TEXT NOT NULL,
    language         TEXT,
    title            TEXT,
    tags             TEXT NOT NULL DEFAULT '[]',
    audio_key        TEXT NOT NULL,
    transcript_key   TEXT,
    segments         TEXT NOT NULL DEFAULT '[]',
    duration_seconds REAL,
    error_message    TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    completed_at     TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_owner_created ON jobs(owner_id, created_at DESC);

CREATE TABLE IF NOT EXISTS usage_meters (
    user_id               TEXT NOT NULL,
    month                 TEXT NOT NULL,
    transcription_seconds REAL NOT NULL DEFAULT 0,
    updated_at            TEXT NOT NULL,
    PRIMARY KEY (user_id, month)
);
"#;

impl Catalog {
    /// Connect to `database_url` and prepare the schema.
    ///
    /// SQLite files are created on first use. In-memory databases are
    /// clamped to a single pooled connection so every caller sees the same
    /// schema.
    pub async fn connect(database_url: &str) -> Result<Self, CatalogError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(CatalogError::Database)?
            .create_if_missing(true);
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let catalog = Self { pool };
        catalog.init_schema().await?;
        Ok(catalog)
    }

    /// Create all tables if missing. Idempotent.
    pub async fn init_schema(&self) -> Result<(), CatalogError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    // -- Jobs ------------------------------------------------------------

    /// Insert a freshly submitted job row.
    pub async fn insert_job(&self, job: &Job) -> Result<(), CatalogError> {
        let segments = serde_json::to_string(&job.segments)
            .map_err(|e| CatalogError::Corrupt { detail: e.to_string() })?;
        let tags = serde_json::to_string(&job.tags)
            .map_err(|e| CatalogError::Corrupt { detail: e.to_string() })?;
        sqlx::query(
            "INSERT INTO jobs (id, owner_id, envelope_id, state, quality_profile, language, \
             title, tags, audio_key, transcript_key, segments, duration_seconds, error_message, \
             created_at, updated_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(job.owner_id.to_string())
        .bind(&job.envelope_id)
        .bind(job.state.as_str())
        .bind(job.quality_profile.as_str())
        .bind(&job.language)
        .bind(&job.title)
        .bind(tags)
        .bind(&job.audio_key)
        .bind(&job.transcript_key)
        .bind(segments)
        .bind(job.duration_seconds)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one job, constrained to its owner.
    pub async fn fetch_job(&self, id: Uuid, owner: Uuid) -> Result<Option<Job>, CatalogError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ? AND owner_id = ?")
            .bind(id.to_string())
            .bind(owner.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    /// Worker-internal lookup by row id; deliberately not owner-scoped.
    pub async fn fetch_job_unscoped(&self, id: Uuid) -> Result<Option<Job>, CatalogError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    /// Worker-internal lookup by envelope id; deliberately not owner-scoped.
    pub async fn fetch_job_by_envelope(
        &self,
        envelope_id: &str,
    ) -> Result<Option<Job>, CatalogError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE envelope_id = ?")
            .bind(envelope_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    /// Record the queue envelope id on a freshly inserted row.
    pub async fn set_envelope_id(&self, id: Uuid, envelope_id: &str) -> Result<(), CatalogError> {
        sqlx::query("UPDATE jobs SET envelope_id = ?, updated_at = ? WHERE id = ?")
            .bind(envelope_id)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// List an owner's jobs, newest first, with optional search filters.
    pub async fn list_jobs(&self, owner: Uuid, query: &JobQuery) -> Result<Vec<Job>, CatalogError> {
        let mut sql = String::from("SELECT * FROM jobs WHERE owner_id = ?");
        if query.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        if query.search.is_some() {
            sql.push_str(
                " AND (LOWER(COALESCE(title, '')) LIKE ? \
                 OR LOWER(COALESCE(language, '')) LIKE ? \
                 OR LOWER(tags) LIKE ?)",
            );
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query(&sql).bind(owner.to_string());
        if let Some(state) = query.state {
            q = q.bind(state.as_str());
        }
        if let Some(search) = &query.search {
            let needle = format!("%{}%", search.to_lowercase());
            q = q.bind(needle.clone()).bind(needle.clone()).bind(needle);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Apply a state transition together with its field patch.
    ///
    /// Rejects anything outside {Queued→Running, Running→Completed,
    /// Running→Failed, Queued→Failed}. `updated_at` is stamped always;
    /// `completed_at` exactly when the job reaches `Completed`.
    pub async fn transition(
        &self,
        id: Uuid,
        next: JobState,
        patch: JobPatch,
    ) -> Result<Job, CatalogError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(CatalogError::JobNotFound)?;
        let mut job = row_to_job(&row)?;

        if !job.state.can_transition(next) {
            return Err(CatalogError::IllegalTransition {
                from: job.state,
                to: next,
            });
        }

        let now = Utc::now();
        job.state = next;
        job.updated_at = now;
        // Non-null iff the job completed; failures carry only updated_at.
        if next == JobState::Completed {
            job.completed_at = Some(now);
        }
        if let Some(key) = patch.transcript_key {
            job.transcript_key = Some(key);
        }
        if let Some(segments) = patch.segments {
            job.segments = segments;
        }
        if let Some(duration) = patch.duration_seconds {
            job.duration_seconds = Some(duration);
        }
        if let Some(language) = patch.language {
            job.language = Some(language);
        }
        if let Some(error) = patch.error_message {
            job.error_message = Some(error);
        }

        let segments = serde_json::to_string(&job.segments)
            .map_err(|e| CatalogError::Corrupt { detail: e.to_string() })?;
        sqlx::query(
            "UPDATE jobs SET state = ?, transcript_key = ?, segments = ?, duration_seconds = ?, \
             language = ?, error_message = ?, updated_at = ?, completed_at = ? WHERE id = ?",
        )
        .bind(job.state.as_str())
        .bind(&job.transcript_key)
        .bind(segments)
        .bind(job.duration_seconds)
        .bind(&job.language)
        .bind(&job.error_message)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    // -- Users -----------------------------------------------------------

    /// Register a new account; `DuplicateEmail` when the address is taken.
    pub async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<UserRecord, CatalogError> {
        let user = UserRecord {
            id: Uuid::new_v4(),
            email: email.to_lowercase(),
            password_hash: password_hash.to_string(),
            is_active: true,
            created_at: Utc::now(),
        };
        let result = sqlx::query(
            "INSERT INTO users (id, email, password_hash, is_active, created_at) VALUES (?, ?, ?, 1, ?)",
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(CatalogError::DuplicateEmail);
            }
            Err(err) => return Err(err.into()),
        }

        // Every account starts with a default profile.
        sqlx::query(
            "INSERT INTO profiles (id, user_id, name, description, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user.id.to_string())
        .bind("Default")
        .bind(Option::<String>::None)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(user)
    }

    /// Look up an account by email (case-insensitive).
    pub async fn fetch_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserRecord>, CatalogError> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?")
            .bind(email.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    /// Look up an account by id.
    pub async fn fetch_user(&self, id: Uuid) -> Result<Option<UserRecord>, CatalogError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    // -- Usage meters ----------------------------------------------------

    /// Add `seconds` of transcribed audio to the owner's meter for `month`
    /// (format `YYYY-MM`).
    pub async fn record_usage(
        &self,
        user_id: Uuid,
        month: &str,
        seconds: f64,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            "INSERT INTO usage_meters (user_id, month, transcription_seconds, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id, month) DO UPDATE SET \
             transcription_seconds = transcription_seconds + excluded.transcription_seconds, \
             updated_at = excluded.updated_at",
        )
        .bind(user_id.to_string())
        .bind(month)
        .bind(seconds)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Seconds metered for `user_id` in `month`; 0 when absent.
    pub async fn usage_for(&self, user_id: Uuid, month: &str) -> Result<f64, CatalogError> {
        let row = sqlx::query(
            "SELECT transcription_seconds FROM usage_meters WHERE user_id = ? AND month = ?",
        )
        .bind(user_id.to_string())
        .bind(month)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|r| r.get::<f64, _>("transcription_seconds"))
            .unwrap_or(0.0))
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_uuid(value: String, column: &str) -> Result<Uuid, CatalogError> {
    Uuid::parse_str(&value).map_err(|_| CatalogError::Corrupt {
        detail: format!("{column}: {value}"),
    })
}

fn row_to_job(row: &SqliteRow) -> Result<Job, CatalogError> {
    let state: String = row.get("state");
    let profile: String = row.get("quality_profile");
    let segments_json: String = row.get("segments");
    let tags_json: String = row.get("tags");
    Ok(Job {
        id: parse_uuid(row.get("id"), "jobs.id")?,
        owner_id: parse_uuid(row.get("owner_id"), "jobs.owner_id")?,
        envelope_id: row.get("envelope_id"),
        state: state.parse::<JobState>().map_err(|e| CatalogError::Corrupt {
            detail: e.to_string(),
        })?,
        quality_profile: profile
            .parse::<QualityProfile>()
            .map_err(|e| CatalogError::Corrupt {
                detail: e.to_string(),
            })?,
        language: row.get("language"),
        title: row.get("title"),
        tags: serde_json::from_str(&tags_json).map_err(|e| CatalogError::Corrupt {
            detail: format!("jobs.tags: {e}"),
        })?,
        audio_key: row.get("audio_key"),
        transcript_key: row.get("transcript_key"),
        segments: serde_json::from_str(&segments_json).map_err(|e| CatalogError::Corrupt {
            detail: format!("jobs.segments: {e}"),
        })?,
        duration_seconds: row.get("duration_seconds"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
    })
}

fn row_to_user(row: &SqliteRow) -> Result<UserRecord, CatalogError> {
    Ok(UserRecord {
        id: parse_uuid(row.get("id"), "users.id")?,
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        is_active: row.get::<i64, _>("is_active") != 0,
        created_at: row.get("created_at"),
    })
}
