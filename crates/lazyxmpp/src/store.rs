//! Salted-hash credential store.
//!
//! A local libsql database holding one row per registered user:
//! `users(username PRIMARY KEY UNIQUE, hash, salt)`. Passwords are stored
//! as PBKDF2-HMAC-SHA512 digests (5000 rounds, 16-byte random salt, 64-byte
//! key). The database file defaults to `~/.config/LazyXMPP/users.db`.

use std::path::{Path, PathBuf};

use libsql::{params, Builder, Connection};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha512;
use thiserror::Error;
use tracing::{debug, info};

/// Salt length in bytes.
const SALT_LEN: usize = 16;
/// PBKDF2 iteration count.
const PBKDF2_ROUNDS: u32 = 5000;
/// Derived key length in bytes (SHA-512 digest size).
const DK_LEN: usize = 64;

/// Credential store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened or created
    #[error("failed to open user database: {0}")]
    Open(String),

    /// The username is already taken
    #[error("username is already registered")]
    AlreadyExists,

    /// Any other database failure
    #[error("user database query failed: {0}")]
    Query(#[from] libsql::Error),
}

/// Persistent table of (username, hash, salt) records.
#[derive(Clone, Debug)]
pub struct UserStore {
    conn: Connection,
}

impl UserStore {
    /// Open (or create) the store at the given file path. Parent
    /// directories are created as needed. Open failures are fatal to
    /// startup, so this returns an error rather than falling back.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!(
                    "failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        let conn = db.connect().map_err(|e| StoreError::Open(e.to_string()))?;

        info!(path = %path.display(), "Opened user database");
        Self::init(conn).await
    }

    /// Open an in-memory store. Used by tests and `--ephemeral` runs.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let db = Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        let conn = db.connect().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (username, hash, salt, \
             PRIMARY KEY(username), UNIQUE(username))",
            (),
        )
        .await?;
        Ok(Self { conn })
    }

    /// The default database location, `~/.config/LazyXMPP/users.db`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("LazyXMPP")
            .join("users.db")
    }

    /// Register a new user. Fails with [`StoreError::AlreadyExists`] when
    /// the username is taken; the UNIQUE constraint on the table is the
    /// authority, no pre-check is made.
    pub async fn register_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        let hash = derive_key(password, &salt);

        let result = self
            .conn
            .execute(
                "INSERT INTO users (username, hash, salt) VALUES (?1, ?2, ?3)",
                params![username, hash.to_vec(), salt.to_vec()],
            )
            .await;

        match result {
            Ok(_) => {
                debug!(username, "Registered user");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a record exists for the username.
    pub async fn is_registered(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self.lookup(username).await?.is_some())
    }

    /// Recompute the hash from the stored salt and compare digests in
    /// constant time. Returns false for unknown users.
    pub async fn verify_password(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        let (stored_hash, salt) = match self.lookup(username).await? {
            Some(record) => record,
            None => return Ok(false),
        };

        let computed = derive_key(password, &salt);
        Ok(digest_eq(&computed, &stored_hash))
    }

    async fn lookup(&self, username: &str) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT hash, salt FROM users WHERE username = ?1",
                params![username],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let hash: Vec<u8> = row.get(0)?;
                let salt: Vec<u8> = row.get(1)?;
                Ok(Some((hash, salt)))
            }
            None => Ok(None),
        }
    }
}

/// PBKDF2-HMAC-SHA512 over the password with the given salt.
fn derive_key(password: &str, salt: &[u8]) -> [u8; DK_LEN] {
    let mut dk = [0u8; DK_LEN];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut dk);
    dk
}

/// Constant-time digest comparison over the full length.
fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn is_unique_violation(error: &libsql::Error) -> bool {
    error.to_string().contains("UNIQUE constraint failed")
}
