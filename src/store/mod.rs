use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::FromRow;
use thiserror::Error;

pub mod migrate;
pub mod postgres;
pub mod sqlite;
pub mod stamps;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Canonical column set of the `users` table. `ensure_schema` rebuilds any
/// table whose columns differ from this list.
pub const CANONICAL_COLUMNS: [&str; 6] = ["id", "name", "email", "phone", "password", "stamps"];

/// One registered account. The `password` column holds an Argon2 hash.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub phone: String,
    #[serde(skip_serializing)]
    #[sqlx(rename = "password")]
    pub password_hash: String,
    #[serde(skip_serializing)]
    pub stamps: String,
}

/// Input for `AccountStore::create`. Fields arrive trimmed and validated;
/// `password_hash` is already hashed.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub password_hash: String,
}

/// A login handle resolved to the single column it addresses.
///
/// Anything containing `@` is an email (lowercased); everything else is a
/// name. Registration rejects names containing `@`, so the mapping is
/// unambiguous and the store never has to match both columns at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Name(String),
    Email(String),
}

impl Identifier {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.contains('@') {
            Identifier::Email(trimmed.to_lowercase())
        } else {
            Identifier::Name(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Identifier::Name(v) | Identifier::Email(v) => v,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Name(v) => write!(f, "name {v}"),
            Identifier::Email(v) => write!(f, "email {v}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("name already registered")]
    DuplicateName,
    #[error("email already registered")]
    DuplicateEmail,
    #[error("account not found")]
    NotFound,
    #[error("backend unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

/// Schema evolution could not complete. The pre-migration table is left
/// untouched; startup must refuse to serve store traffic.
#[derive(Debug, Error)]
#[error("schema migration failed while trying to {context}")]
pub struct MigrationFailure {
    pub context: String,
    #[source]
    pub source: sqlx::Error,
}

impl MigrationFailure {
    pub fn new(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self {
            context: context.into(),
            source,
        }
    }
}

/// The sole reader/writer of user rows, implemented once per backend engine
/// and selected at configuration time.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Bring the `users` table to the canonical shape. Idempotent; runs once
    /// at startup before any other operation.
    async fn ensure_schema(&self) -> Result<(), MigrationFailure>;

    /// Insert a new account with an empty stamp set. Duplicate checks run as
    /// a fast path; the unique indexes remain the source of truth under
    /// concurrent creates.
    async fn create(&self, new: &NewAccount) -> Result<Account, StoreError>;

    /// Look up the row addressed by the resolved identifier.
    async fn find(&self, identifier: &Identifier) -> Result<Option<Account>, StoreError>;

    /// Replace the password hash on every row the identifier matches.
    /// Returns the affected-row count, 0 when nothing matched.
    async fn reset_password(
        &self,
        identifier: &Identifier,
        new_hash: &str,
    ) -> Result<u64, StoreError>;

    /// Replace the stored stamp set wholesale.
    async fn save_stamps(&self, name: &str, stamps: &BTreeSet<u32>) -> Result<(), StoreError>;

    /// Decode the stored stamp set; malformed history reads as empty.
    async fn load_stamps(&self, name: &str) -> Result<BTreeSet<u32>, StoreError>;
}

/// Pick the backend engine from the shape of the connection URL.
pub async fn connect(database_url: &str) -> anyhow::Result<Arc<dyn AccountStore>> {
    if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
        Ok(Arc::new(PostgresStore::connect(database_url).await?))
    } else if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteStore::connect(database_url).await?))
    } else {
        anyhow::bail!("unsupported database url scheme: {database_url}")
    }
}

/// Map an insert failure to the duplicate it tripped on. A create that loses
/// the race between pre-check and insert lands here via the unique indexes.
pub(crate) fn map_insert_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            let message = db.message().to_lowercase();
            if message.contains("email") {
                return StoreError::DuplicateEmail;
            }
            if message.contains("name") {
                return StoreError::DuplicateName;
            }
            return StoreError::DuplicateEmail;
        }
    }
    StoreError::Unavailable(err)
}
