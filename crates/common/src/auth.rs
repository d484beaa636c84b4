//! Username/password accounts and server-side sessions

use crate::db::Database;
use crate::Result;
use rusqlite::OptionalExtension;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Cookie carrying the session token
pub const SESSION_COOKIE_NAME: &str = "sessionid";

const SESSION_TTL_SECS: i64 = 60 * 60 * 12; // 12h
const HASH_SCHEME: &str = "sha256";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS auth_users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL DEFAULT '',
        password TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS auth_sessions (
        token TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES auth_users(id) ON DELETE CASCADE,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_auth_sessions_user ON auth_sessions(user_id);
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
}

/// A logged-in session; expiry is governed by the session table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub token: String,
    pub user: User,
    pub expires_at: i64,
}

/// The application's own login path
pub trait Authenticator: Send + Sync {
    /// Verify credentials and open a session. `Ok(None)` means the
    /// credentials were rejected.
    fn login(&self, username: &str, password: &str) -> Result<Option<AuthSession>>;
}

pub fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Create the account and session tables
pub fn install_schema(db: &Database) -> Result<()> {
    db.execute_batch(SCHEMA)
}

/// Session-table backed authentication
#[derive(Clone, Debug)]
pub struct SessionAuth {
    db: Database,
}

impl SessionAuth {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create_user(&self, username: &str, email: &str, password: &str) -> Result<User> {
        let hashed = hash_password(password);
        let now = now_epoch_secs();
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth_users (username, email, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![username, email, hashed, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        info!("Created user '{}'", username);
        Ok(User {
            id,
            username: username.to_string(),
            email: email.to_string(),
        })
    }

    /// Check credentials without opening a session
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        let row: Option<(i64, String, String)> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, email, password FROM auth_users WHERE username = ?1",
                rusqlite::params![username],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
        })?;

        Ok(row.and_then(|(id, email, stored)| {
            verify_password(&stored, password).then(|| User {
                id,
                username: username.to_string(),
                email,
            })
        }))
    }

    /// User owning an unexpired session
    pub fn session_user(&self, token: &str) -> Result<Option<User>> {
        let now = now_epoch_secs();
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT u.id, u.username, u.email FROM auth_sessions s \
                 JOIN auth_users u ON u.id = s.user_id \
                 WHERE s.token = ?1 AND s.expires_at > ?2",
                rusqlite::params![token, now],
                |r| {
                    Ok(User {
                        id: r.get(0)?,
                        username: r.get(1)?,
                        email: r.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Delete a session; returns whether it existed
    pub fn logout(&self, token: &str) -> Result<bool> {
        let deleted = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM auth_sessions WHERE token = ?1",
                rusqlite::params![token],
            )
        })?;
        Ok(deleted > 0)
    }

    fn open_session(&self, user: User) -> Result<AuthSession> {
        let token = hex::encode(rand::random::<[u8; 32]>());
        let now = now_epoch_secs();
        let expires_at = now + SESSION_TTL_SECS;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth_sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![token, user.id, now, expires_at],
            )
        })?;
        debug!("Opened session for '{}'", user.username);
        Ok(AuthSession {
            token,
            user,
            expires_at,
        })
    }
}

impl Authenticator for SessionAuth {
    fn login(&self, username: &str, password: &str) -> Result<Option<AuthSession>> {
        match self.authenticate(username, password)? {
            Some(user) => self.open_session(user).map(Some),
            None => Ok(None),
        }
    }
}

fn hash_password(password: &str) -> String {
    let salt = hex::encode(rand::random::<[u8; 16]>());
    format!("{}${}${}", HASH_SCHEME, salt, digest(&salt, password))
}

fn verify_password(stored: &str, password: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(HASH_SCHEME), Some(salt), Some(expected)) => {
            constant_time_eq(&digest(salt, password), expected)
        }
        _ => false,
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
