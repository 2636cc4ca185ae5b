//! SQLite-backed credential storage.
//!
//! Tokens arrive here already encrypted; this layer never sees plaintext
//! token material.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::Credential;
use crate::error::Result;

/// Credential table keyed by user id.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     user_id TEXT PRIMARY KEY,
///     account_id TEXT NOT NULL,
///     refresh_token TEXT NOT NULL,   -- Encrypted
///     access_token TEXT NOT NULL,    -- Encrypted
///     expires_at TEXT NOT NULL,      -- ISO 8601 timestamp
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     active INTEGER NOT NULL
/// );
/// ```
///
/// # Thread Safety
/// Connection is wrapped in a Mutex; SQLite serialized mode handles the rest.
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Creates or opens the credential database.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("failed to open credential database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                user_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                access_token TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
            [],
        )
        .context("failed to create credentials table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates or replaces a user's credential after a completed
    /// authorization (upsert).
    ///
    /// This is the only write path that touches the refresh token. On
    /// re-authorization the row keeps its original `created_at` and the
    /// active flag is restored.
    pub fn upsert(
        &self,
        user_id: &str,
        account_id: &str,
        refresh_token_enc: &str,
        access_token_enc: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Credential> {
        let now = Utc::now();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO credentials (
                    user_id, account_id, refresh_token, access_token,
                    expires_at, created_at, updated_at, active
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1)
                ON CONFLICT(user_id) DO UPDATE SET
                    account_id = excluded.account_id,
                    refresh_token = excluded.refresh_token,
                    access_token = excluded.access_token,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at,
                    active = 1
                "#,
                params![
                    user_id,
                    account_id,
                    refresh_token_enc,
                    access_token_enc,
                    expires_at.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .context("failed to upsert credential")?;

        self.get(user_id)?
            .ok_or_else(|| anyhow!("credential missing immediately after upsert").into())
    }

    /// Retrieves a user's credential, active or not.
    pub fn get(&self, user_id: &str) -> Result<Option<Credential>> {
        let conn = self.conn.lock().unwrap();
        let cred = conn
            .query_row(
                r#"
                SELECT user_id, account_id, refresh_token, access_token,
                       expires_at, created_at, updated_at, active
                FROM credentials
                WHERE user_id = ?1
                "#,
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, bool>(7)?,
                    ))
                },
            )
            .optional()
            .context("failed to query credential")?;

        cred.map(
            |(user_id, account_id, refresh, access, expires, created, updated, active)| {
                Ok(Credential {
                    user_id,
                    account_id,
                    refresh_token_enc: refresh,
                    access_token_enc: access,
                    expires_at: parse_ts(&expires)?,
                    created_at: parse_ts(&created)?,
                    updated_at: parse_ts(&updated)?,
                    active,
                })
            },
        )
        .transpose()
    }

    /// Replaces the access token and its expiry in a single statement.
    ///
    /// The refresh token is deliberately untouched here.
    pub fn update_access_token(
        &self,
        user_id: &str,
        access_token_enc: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE credentials
                SET access_token = ?2, expires_at = ?3, updated_at = ?4
                WHERE user_id = ?1
                "#,
                params![
                    user_id,
                    access_token_enc,
                    expires_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("failed to update access token")?;

        if updated == 0 {
            return Err(anyhow!("no credential row for user during token update").into());
        }
        Ok(())
    }

    /// Clears the active flag (logical delete). The row is retained.
    ///
    /// Returns false if the user has no credential row.
    pub fn deactivate(&self, user_id: &str) -> Result<bool> {
        let updated = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE credentials SET active = 0, updated_at = ?2 WHERE user_id = ?1",
                params![user_id, Utc::now().to_rfc3339()],
            )
            .context("failed to deactivate credential")?;

        Ok(updated > 0)
    }

    /// Lists user ids with an active credential.
    ///
    /// Used at startup to resume scheduled work for linked accounts.
    pub fn list_active(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT user_id FROM credentials WHERE active = 1 ORDER BY user_id")
            .context("failed to prepare query")?;

        let users = stmt
            .query_map([], |row| row.get(0))
            .context("failed to execute query")?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context("failed to read results")?;

        Ok(users)
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .context("failed to parse stored timestamp")?
        .with_timezone(&Utc))
}
