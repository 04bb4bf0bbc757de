//! Embedded single-file engine. SQLite cannot drop columns on older
//! releases, so the migrator always rebuilds through a shadow-table copy;
//! the swap happens inside one transaction so observers see either the old
//! table or the finished one.

use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use super::migrate::{copy_lists, plan, SchemaAction};
use super::{
    map_insert_error, stamps, Account, AccountStore, Identifier, MigrationFailure, NewAccount,
    StoreError,
};

const SELECT_ACCOUNT: &str = "SELECT id, name, email, phone, password, stamps FROM users";

const UNIQUE_INDEXES: [&str; 2] = [
    "CREATE UNIQUE INDEX IF NOT EXISTS users_name_uniq ON users (name)",
    "CREATE UNIQUE INDEX IF NOT EXISTS users_email_uniq ON users (email) WHERE email <> ''",
];

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            email TEXT NOT NULL DEFAULT '',
            phone TEXT NOT NULL DEFAULT '',
            password TEXT NOT NULL,
            stamps TEXT NOT NULL DEFAULT ''
        )"
    )
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        // SQLite serializes writers anyway; a single pooled connection
        // avoids busy errors under request-level races.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .context("open sqlite database")?;
        Ok(Self::new(pool))
    }

    async fn table_columns(&self) -> Result<Option<Vec<String>>, sqlx::Error> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM pragma_table_info('users') ORDER BY cid")
                .fetch_all(&self.pool)
                .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows.into_iter().map(|(name,)| name).collect()))
    }
}

async fn create_unique_indexes(tx: &mut Transaction<'_, Sqlite>) -> Result<(), MigrationFailure> {
    for statement in UNIQUE_INDEXES {
        sqlx::query(statement)
            .execute(&mut **tx)
            .await
            .map_err(|e| MigrationFailure::new("create unique indexes", e))?;
    }
    Ok(())
}

/// Rewrite rows whose `name` (or non-empty `email`) duplicates an earlier
/// row: the lowest id keeps the original spelling, later rows get `#<id>`
/// appended. Runs before the unique indexes are created, so legacy
/// loose-uniqueness data cannot fail the migration.
async fn normalize_duplicates(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
) -> Result<(), MigrationFailure> {
    let renamed = sqlx::query(&format!(
        "UPDATE {table} SET name = name || '#' || id \
         WHERE id NOT IN (SELECT MIN(id) FROM {table} GROUP BY name)"
    ))
    .execute(&mut **tx)
    .await
    .map_err(|e| MigrationFailure::new("normalize duplicate names", e))?
    .rows_affected();
    if renamed > 0 {
        warn!(rows = renamed, "renamed duplicate account names");
    }

    let renamed = sqlx::query(&format!(
        "UPDATE {table} SET email = email || '#' || id \
         WHERE email <> '' AND id NOT IN \
         (SELECT MIN(id) FROM {table} WHERE email <> '' GROUP BY email)"
    ))
    .execute(&mut **tx)
    .await
    .map_err(|e| MigrationFailure::new("normalize duplicate emails", e))?
    .rows_affected();
    if renamed > 0 {
        warn!(rows = renamed, "disambiguated duplicate account emails");
    }
    Ok(())
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn ensure_schema(&self) -> Result<(), MigrationFailure> {
        let columns = self
            .table_columns()
            .await
            .map_err(|e| MigrationFailure::new("inspect the users table", e))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MigrationFailure::new("open a migration transaction", e))?;

        match plan(columns.as_deref()) {
            SchemaAction::CreateFresh => {
                sqlx::query(&create_table_sql("users"))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| MigrationFailure::new("create the users table", e))?;
                create_unique_indexes(&mut tx).await?;
                info!("created users table");
            }
            SchemaAction::UpToDate => {
                // Shape is current; normalization and index creation are
                // no-ops on a previously migrated table.
                normalize_duplicates(&mut tx, "users").await?;
                create_unique_indexes(&mut tx).await?;
                debug!("users table already canonical");
            }
            SchemaAction::Rebuild { copy } => {
                let (columns, exprs) = copy_lists(&copy);
                sqlx::query(&create_table_sql("users_next"))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| MigrationFailure::new("create the shadow table", e))?;
                sqlx::query(&format!(
                    "INSERT INTO users_next ({columns}) SELECT {exprs} FROM users"
                ))
                .execute(&mut *tx)
                .await
                .map_err(|e| MigrationFailure::new("copy rows into the shadow table", e))?;
                normalize_duplicates(&mut tx, "users_next").await?;
                sqlx::query("DROP TABLE users")
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| MigrationFailure::new("drop the legacy table", e))?;
                sqlx::query("ALTER TABLE users_next RENAME TO users")
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| MigrationFailure::new("swap the shadow table in", e))?;
                create_unique_indexes(&mut tx).await?;
                info!("rebuilt users table to the canonical shape");
            }
        }

        tx.commit()
            .await
            .map_err(|e| MigrationFailure::new("commit the migration", e))
    }

    async fn create(&self, new: &NewAccount) -> Result<Account, StoreError> {
        if self.find(&Identifier::Name(new.name.clone())).await?.is_some() {
            return Err(StoreError::DuplicateName);
        }
        if self
            .find(&Identifier::Email(new.email.clone()))
            .await?
            .is_some()
        {
            return Err(StoreError::DuplicateEmail);
        }
        sqlx::query_as::<_, Account>(
            "INSERT INTO users (name, email, phone, password, stamps) \
             VALUES (?, ?, ?, ?, '') \
             RETURNING id, name, email, phone, password, stamps",
        )
        .bind(&new.name)
        .bind(&new.email)
        .bind(&new.phone)
        .bind(&new.password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(map_insert_error)
    }

    async fn find(&self, identifier: &Identifier) -> Result<Option<Account>, StoreError> {
        let sql = match identifier {
            Identifier::Name(_) => format!("{SELECT_ACCOUNT} WHERE name = ?"),
            Identifier::Email(_) => format!("{SELECT_ACCOUNT} WHERE email = ?"),
        };
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(identifier.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    async fn reset_password(
        &self,
        identifier: &Identifier,
        new_hash: &str,
    ) -> Result<u64, StoreError> {
        let sql = match identifier {
            Identifier::Name(_) => "UPDATE users SET password = ? WHERE name = ?",
            Identifier::Email(_) => "UPDATE users SET password = ? WHERE email = ?",
        };
        let result = sqlx::query(sql)
            .bind(new_hash)
            .bind(identifier.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn save_stamps(&self, name: &str, stamps: &BTreeSet<u32>) -> Result<(), StoreError> {
        let encoded = stamps::encode(stamps);
        let result = sqlx::query("UPDATE users SET stamps = ? WHERE name = ?")
            .bind(&encoded)
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn load_stamps(&self, name: &str) -> Result<BTreeSet<u32>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT stamps FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((raw,)) => Ok(stamps::decode_or_empty(name, &raw)),
            None => Err(StoreError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory sqlite");
        SqliteStore::new(pool)
    }

    fn account(name: &str, email: &str) -> NewAccount {
        NewAccount {
            name: name.into(),
            email: email.into(),
            phone: String::new(),
            password_hash: "argon2-hash-placeholder".into(),
        }
    }

    async fn schema_dump(store: &SqliteStore) -> Vec<(String, String)> {
        sqlx::query_as::<_, (String, String)>(
            "SELECT name, COALESCE(sql, '') FROM sqlite_master \
             WHERE tbl_name = 'users' ORDER BY name",
        )
        .fetch_all(&store.pool)
        .await
        .expect("dump schema")
    }

    #[tokio::test]
    async fn fresh_registration_starts_with_empty_stamps() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();

        let created = store.create(&account("alice", "alice@example.com")).await.unwrap();
        assert_eq!(created.stamps, "");
        assert_eq!(
            store.load_stamps("alice").await.unwrap(),
            BTreeSet::new()
        );
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_even_with_a_new_name() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();

        store.create(&account("alice", "shared@example.com")).await.unwrap();
        let err = store
            .create(&account("bob", "shared@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();

        store.create(&account("alice", "a1@example.com")).await.unwrap();
        let err = store.create(&account("alice", "a2@example.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName));
    }

    #[tokio::test]
    async fn stamps_round_trip_with_canonical_encoding() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();
        store.create(&account("cc", "cc@example.com")).await.unwrap();

        let set: BTreeSet<u32> = [3, 1, 2].into_iter().collect();
        store.save_stamps("cc", &set).await.unwrap();
        assert_eq!(store.load_stamps("cc").await.unwrap(), set);

        let (raw,): (String,) =
            sqlx::query_as("SELECT stamps FROM users WHERE name = 'cc'")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(raw, "1,2,3");

        // Saving the same set again must not change the persisted form.
        store.save_stamps("cc", &set).await.unwrap();
        let (again,): (String,) =
            sqlx::query_as("SELECT stamps FROM users WHERE name = 'cc'")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(again, raw);
    }

    #[tokio::test]
    async fn save_stamps_replaces_wholesale() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();
        store.create(&account("cc", "cc@example.com")).await.unwrap();

        store
            .save_stamps("cc", &[1, 2].into_iter().collect())
            .await
            .unwrap();
        let replacement: BTreeSet<u32> = [9].into_iter().collect();
        store.save_stamps("cc", &replacement).await.unwrap();
        assert_eq!(store.load_stamps("cc").await.unwrap(), replacement);
    }

    #[tokio::test]
    async fn save_stamps_for_unknown_user_is_not_found() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();

        let err = store
            .save_stamps("ghost", &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn malformed_persisted_stamps_read_as_empty() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();
        store.create(&account("cc", "cc@example.com")).await.unwrap();

        sqlx::query("UPDATE users SET stamps = '1,x,3' WHERE name = 'cc'")
            .execute(&store.pool)
            .await
            .unwrap();
        assert_eq!(store.load_stamps("cc").await.unwrap(), BTreeSet::new());
    }

    #[tokio::test]
    async fn reset_password_on_unknown_identifier_touches_nothing() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();
        store.create(&account("alice", "alice@example.com")).await.unwrap();

        let updated = store
            .reset_password(&Identifier::parse("nobody"), "new-hash")
            .await
            .unwrap();
        assert_eq!(updated, 0);

        let unchanged = store
            .find(&Identifier::parse("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.password_hash, "argon2-hash-placeholder");
    }

    #[tokio::test]
    async fn reset_password_by_email_updates_the_matching_row() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();
        store.create(&account("alice", "alice@example.com")).await.unwrap();

        let updated = store
            .reset_password(&Identifier::parse("alice@example.com"), "fresh-hash")
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let row = store
            .find(&Identifier::parse("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.password_hash, "fresh-hash");
    }

    #[tokio::test]
    async fn legacy_gender_age_table_is_rebuilt_without_data_loss() {
        let store = memory_store().await;
        sqlx::query(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                gender TEXT,
                age INTEGER,
                email TEXT UNIQUE,
                phone TEXT,
                password TEXT NOT NULL
            )",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO users (name, gender, age, email, phone, password) \
             VALUES ('cc', 'f', 30, 'cc@example.com', '555-0100', 'old-hash')",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        store.ensure_schema().await.unwrap();

        let columns = store.table_columns().await.unwrap().unwrap();
        assert_eq!(
            columns,
            ["id", "name", "email", "phone", "password", "stamps"]
        );

        let row = store
            .find(&Identifier::parse("cc"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.email, "cc@example.com");
        assert_eq!(row.phone, "555-0100");
        assert_eq!(row.password_hash, "old-hash");
        assert_eq!(row.stamps, "");
    }

    #[tokio::test]
    async fn ensure_schema_twice_is_a_structural_noop() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();
        store.create(&account("alice", "alice@example.com")).await.unwrap();

        let before = schema_dump(&store).await;
        store.ensure_schema().await.unwrap();
        let after = schema_dump(&store).await;
        assert_eq!(before, after);

        let still_there = store.find(&Identifier::parse("alice")).await.unwrap();
        assert!(still_there.is_some());
    }

    #[tokio::test]
    async fn duplicate_legacy_names_keep_lowest_id_spelling() {
        let store = memory_store().await;
        sqlx::query(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                gender TEXT,
                age INTEGER,
                email TEXT UNIQUE,
                phone TEXT,
                password TEXT NOT NULL
            )",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO users (name, email, phone, password) VALUES \
             ('bob', 'bob1@example.com', '', 'h1'), \
             ('bob', 'bob2@example.com', '', 'h2')",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        store.ensure_schema().await.unwrap();

        let first = store.find(&Identifier::parse("bob")).await.unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.email, "bob1@example.com");

        let renamed = store
            .find(&Identifier::parse("bob#2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.id, 2);
        assert_eq!(renamed.email, "bob2@example.com");
    }
}
