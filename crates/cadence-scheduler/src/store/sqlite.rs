//! SQLite-backed job store.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use super::JobStore;
use crate::credentials::{AccountStore, ConnectedAccount};
use crate::notify::{NotificationPreferences, Recipient, RecipientDirectory};
use crate::{
    ClaimMode, ErrorKind, PostChange, PostStatus, Provider, ScheduledPost, SchedulerError, Upload,
};

const POST_COLUMNS: &str = "id, owner_id, team_id, group_id, upload_id, thumbnail_ref, provider, \
     settings, scheduled_for, status, platform_post_id, platform_media_id, last_error, error_kind, \
     posted_at, container_id, container_created_at, attempts, updated_at";

/// Timestamps are stored as fixed-width RFC 3339 UTC text so that string
/// comparison in SQL matches chronological order.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

/// Rows that fail to decode are reported as corrupt rather than as a
/// database failure.
fn decode_error(e: rusqlite::Error) -> SchedulerError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(idx, _, cause) => {
            SchedulerError::Corrupt(format!("column {}: {}", idx, cause))
        }
        e => SchedulerError::Database(e),
    }
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("invalid timestamp {}: {}", raw, e)))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(idx, r)).transpose()
}

fn status_list(statuses: &[PostStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledPost> {
    let provider: String = row.get(6)?;
    let settings: String = row.get(7)?;
    let status: String = row.get(9)?;
    let error_kind: Option<String> = row.get(13)?;
    let attempts: i64 = row.get(17)?;

    Ok(ScheduledPost {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        team_id: row.get(2)?,
        group_id: row.get(3)?,
        upload_id: row.get(4)?,
        thumbnail_ref: row.get(5)?,
        provider: provider.parse().map_err(|e| conversion_error(6, e))?,
        settings: serde_json::from_str(&settings)
            .map_err(|e| conversion_error(7, format!("invalid settings: {}", e)))?,
        scheduled_for: parse_ts(8, row.get(8)?)?,
        status: PostStatus::parse(&status)
            .ok_or_else(|| conversion_error(9, format!("unknown status: {}", status)))?,
        platform_post_id: row.get(10)?,
        platform_media_id: row.get(11)?,
        last_error: row.get(12)?,
        error_kind: error_kind.as_deref().and_then(ErrorKind::parse),
        posted_at: parse_opt_ts(14, row.get(14)?)?,
        container_id: row.get(15)?,
        container_created_at: parse_opt_ts(16, row.get(16)?)?,
        attempts: attempts.max(0) as u32,
        updated_at: parse_ts(18, row.get(18)?)?,
    })
}

/// Job store persisted in a SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &str) -> Result<Self, SchedulerError> {
        let conn = Connection::open(path)?;

        // WAL lets readers proceed while a transition holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scheduled_posts (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                team_id TEXT NOT NULL,
                group_id TEXT,
                upload_id TEXT NOT NULL,
                thumbnail_ref TEXT,
                provider TEXT NOT NULL,
                settings TEXT NOT NULL DEFAULT '{}',
                scheduled_for TEXT NOT NULL,
                status TEXT NOT NULL,
                platform_post_id TEXT,
                platform_media_id TEXT,
                last_error TEXT,
                error_kind TEXT,
                posted_at TEXT,
                container_id TEXT,
                container_created_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_posts_due ON scheduled_posts(status, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_posts_group ON scheduled_posts(group_id);

            CREATE TABLE IF NOT EXISTS uploads (
                id TEXT PRIMARY KEY,
                bucket TEXT NOT NULL,
                path TEXT NOT NULL,
                mime_type TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS connected_accounts (
                team_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                external_account_id TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                expires_at TEXT,
                PRIMARY KEY (team_id, provider)
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                notify_success INTEGER NOT NULL DEFAULT 1,
                notify_failure INTEGER NOT NULL DEFAULT 1,
                notify_reconnect INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS group_notifications (
                group_id TEXT NOT NULL,
                generation INTEGER NOT NULL,
                notified_at TEXT NOT NULL,
                PRIMARY KEY (group_id, generation)
            );
            ",
        )?;

        info!(path = %path, "job store initialized");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, SchedulerError> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Unavailable("connection lock poisoned".to_string()))
    }

    /// Insert or replace an upload.
    pub fn upsert_upload(&self, upload: &Upload) -> Result<(), SchedulerError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO uploads (id, bucket, path, mime_type) VALUES (?1, ?2, ?3, ?4)",
            params![upload.id, upload.bucket, upload.path, upload.mime_type],
        )?;
        Ok(())
    }

    /// Insert or replace a connected platform account.
    pub fn upsert_account(&self, account: &ConnectedAccount) -> Result<(), SchedulerError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO connected_accounts
             (team_id, provider, external_account_id, access_token, refresh_token, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                account.team_id,
                account.provider.as_str(),
                account.external_account_id,
                account.access_token,
                account.refresh_token,
                account.expires_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    /// Insert or replace a notification recipient.
    pub fn upsert_recipient(&self, recipient: &Recipient) -> Result<(), SchedulerError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO users
             (id, email, notify_success, notify_failure, notify_reconnect)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                recipient.user_id,
                recipient.email,
                recipient.preferences.on_success,
                recipient.preferences.on_failure,
                recipient.preferences.on_reconnect,
            ],
        )?;
        Ok(())
    }

    fn query_posts(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ScheduledPost>, SchedulerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, post_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(decode_error)?;
        Ok(rows)
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_post(&self, post: &ScheduledPost) -> Result<(), SchedulerError> {
        let settings = serde_json::to_string(&post.settings)?;
        let result = self.conn()?.execute(
            &format!(
                "INSERT INTO scheduled_posts ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                POST_COLUMNS
            ),
            params![
                post.id,
                post.owner_id,
                post.team_id,
                post.group_id,
                post.upload_id,
                post.thumbnail_ref,
                post.provider.as_str(),
                settings,
                ts(&post.scheduled_for),
                post.status.as_str(),
                post.platform_post_id,
                post.platform_media_id,
                post.last_error,
                post.error_kind.map(|k| k.as_str()),
                post.posted_at.as_ref().map(ts),
                post.container_id,
                post.container_created_at.as_ref().map(ts),
                post.attempts as i64,
                ts(&post.updated_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(SchedulerError::PostExists(post.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_post(&self, id: &str) -> Result<Option<ScheduledPost>, SchedulerError> {
        let conn = self.conn()?;
        let post = conn
            .query_row(
                &format!("SELECT {} FROM scheduled_posts WHERE id = ?1", POST_COLUMNS),
                params![id],
                post_from_row,
            )
            .optional()
            .map_err(decode_error)?;
        Ok(post)
    }

    #[tracing::instrument(skip(self))]
    async fn due_posts(
        &self,
        now: DateTime<Utc>,
        mode: ClaimMode,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<ScheduledPost>, SchedulerError> {
        let sql = format!(
            "SELECT {} FROM scheduled_posts
             WHERE scheduled_for <= ?1
               AND status IN ({})
               AND (status != 'failed' OR attempts < ?2)
             ORDER BY scheduled_for ASC
             LIMIT ?3",
            POST_COLUMNS,
            status_list(mode.eligible())
        );
        self.query_posts(&sql, params![ts(&now), max_attempts as i64, limit as i64])
    }

    async fn processing_posts(&self, limit: usize) -> Result<Vec<ScheduledPost>, SchedulerError> {
        let sql = format!(
            "SELECT {} FROM scheduled_posts
             WHERE status = 'ig_processing'
             ORDER BY container_created_at ASC
             LIMIT ?1",
            POST_COLUMNS
        );
        self.query_posts(&sql, params![limit as i64])
    }

    async fn group_posts(&self, group_id: &str) -> Result<Vec<ScheduledPost>, SchedulerError> {
        let sql = format!(
            "SELECT {} FROM scheduled_posts WHERE group_id = ?1 ORDER BY scheduled_for ASC",
            POST_COLUMNS
        );
        self.query_posts(&sql, params![group_id])
    }

    async fn transition(
        &self,
        id: &str,
        expected: &[PostStatus],
        change: &PostChange,
    ) -> Result<u64, SchedulerError> {
        if expected.is_empty() {
            return Ok(0);
        }
        let guard = format!("id = ?1 AND status IN ({})", status_list(expected));
        let conn = self.conn()?;

        let rows = match change {
            PostChange::Claim { at, max_attempts } => conn.execute(
                &format!(
                    "UPDATE scheduled_posts
                     SET status = 'posting', attempts = attempts + 1, updated_at = ?2
                     WHERE {} AND (status != 'failed' OR attempts < ?3)",
                    guard
                ),
                params![id, ts(at), *max_attempts as i64],
            )?,
            PostChange::Posted {
                post_id,
                media_id,
                at,
            } => conn.execute(
                &format!(
                    "UPDATE scheduled_posts
                     SET status = 'posted', platform_post_id = ?2, platform_media_id = ?3,
                         posted_at = ?4, last_error = NULL, error_kind = NULL, updated_at = ?4
                     WHERE {}",
                    guard
                ),
                params![id, post_id, media_id, ts(at)],
            )?,
            PostChange::Processing {
                container_id,
                created_at,
            } => conn.execute(
                &format!(
                    "UPDATE scheduled_posts
                     SET status = 'ig_processing', container_id = ?2, container_created_at = ?3,
                         last_error = NULL, error_kind = NULL, updated_at = ?3
                     WHERE {}",
                    guard
                ),
                params![id, container_id, ts(created_at)],
            )?,
            PostChange::Failed { kind, message, at } => conn.execute(
                &format!(
                    "UPDATE scheduled_posts
                     SET status = 'failed', last_error = ?2, error_kind = ?3, updated_at = ?4
                     WHERE {}",
                    guard
                ),
                params![id, message, kind.as_str(), ts(at)],
            )?,
        };

        debug!(post_id = %id, to = %change.target(), rows, "conditional transition");
        Ok(rows as u64)
    }

    async fn claim_group_notification(
        &self,
        group_id: &str,
        generation: u64,
    ) -> Result<bool, SchedulerError> {
        let rows = self.conn()?.execute(
            "INSERT OR IGNORE INTO group_notifications (group_id, generation, notified_at)
             VALUES (?1, ?2, ?3)",
            params![group_id, generation as i64, ts(&Utc::now())],
        )?;
        Ok(rows == 1)
    }

    async fn upload(&self, id: &str) -> Result<Option<Upload>, SchedulerError> {
        let conn = self.conn()?;
        let upload = conn
            .query_row(
                "SELECT id, bucket, path, mime_type FROM uploads WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Upload {
                        id: row.get(0)?,
                        bucket: row.get(1)?,
                        path: row.get(2)?,
                        mime_type: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(upload)
    }

    async fn rebind_upload(&self, post_id: &str, upload_id: &str) -> Result<u64, SchedulerError> {
        let rows = self.conn()?.execute(
            "UPDATE scheduled_posts SET upload_id = ?2 WHERE id = ?1",
            params![post_id, upload_id],
        )?;
        Ok(rows as u64)
    }
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn connected_account(
        &self,
        team_id: &str,
        provider: Provider,
    ) -> Result<Option<ConnectedAccount>, SchedulerError> {
        let conn = self.conn()?;
        let account = conn
            .query_row(
                "SELECT external_account_id, access_token, refresh_token, expires_at
                 FROM connected_accounts WHERE team_id = ?1 AND provider = ?2",
                params![team_id, provider.as_str()],
                |row| {
                    Ok(ConnectedAccount {
                        team_id: team_id.to_string(),
                        provider,
                        external_account_id: row.get(0)?,
                        access_token: row.get(1)?,
                        refresh_token: row.get(2)?,
                        expires_at: parse_opt_ts(3, row.get(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    async fn save_tokens(
        &self,
        team_id: &str,
        provider: Provider,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError> {
        self.conn()?.execute(
            "UPDATE connected_accounts
             SET access_token = ?3, refresh_token = COALESCE(?4, refresh_token), expires_at = ?5
             WHERE team_id = ?1 AND provider = ?2",
            params![
                team_id,
                provider.as_str(),
                access_token,
                refresh_token,
                expires_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl RecipientDirectory for SqliteStore {
    async fn recipient(&self, user_id: &str) -> Result<Option<Recipient>, SchedulerError> {
        let conn = self.conn()?;
        let recipient = conn
            .query_row(
                "SELECT id, email, notify_success, notify_failure, notify_reconnect
                 FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(Recipient {
                        user_id: row.get(0)?,
                        email: row.get(1)?,
                        preferences: NotificationPreferences {
                            on_success: row.get(2)?,
                            on_failure: row.get(3)?,
                            on_reconnect: row.get(4)?,
                        },
                    })
                },
            )
            .optional()?;
        Ok(recipient)
    }
}
