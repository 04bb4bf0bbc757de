//! External relational server. PostgreSQL could evolve columns in place,
//! but it executes the same shadow-copy plan as the embedded engine so both
//! backends land on an identical, independently verifiable shape.

use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
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
            id BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL DEFAULT '',
            phone TEXT NOT NULL DEFAULT '',
            password TEXT NOT NULL,
            stamps TEXT NOT NULL DEFAULT ''
        )"
    )
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .context("connect to postgres")?;
        Ok(Self::new(pool))
    }

    async fn table_columns(&self) -> Result<Option<Vec<String>>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = 'users' \
             ORDER BY ordinal_position",
        )
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows.into_iter().map(|(name,)| name).collect()))
    }
}

async fn create_unique_indexes(tx: &mut Transaction<'_, Postgres>) -> Result<(), MigrationFailure> {
    for statement in UNIQUE_INDEXES {
        sqlx::query(statement)
            .execute(&mut **tx)
            .await
            .map_err(|e| MigrationFailure::new("create unique indexes", e))?;
    }
    Ok(())
}

async fn normalize_duplicates(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
) -> Result<(), MigrationFailure> {
    let renamed = sqlx::query(&format!(
        "UPDATE {table} SET name = name || '#' || id::text \
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
        "UPDATE {table} SET email = email || '#' || id::text \
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

/// Advance the identity sequence past the highest copied id so the next
/// insert does not collide with a migrated row.
async fn resync_id_sequence(tx: &mut Transaction<'_, Postgres>) -> Result<(), MigrationFailure> {
    sqlx::query(
        "SELECT setval(pg_get_serial_sequence('users', 'id'), \
         COALESCE((SELECT MAX(id) FROM users), 0) + 1, false)",
    )
    .execute(&mut **tx)
    .await
    .map_err(|e| MigrationFailure::new("resync the id sequence", e))?;
    Ok(())
}

#[async_trait]
impl AccountStore for PostgresStore {
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
                resync_id_sequence(&mut tx).await?;
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
             VALUES ($1, $2, $3, $4, '') \
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
            Identifier::Name(_) => format!("{SELECT_ACCOUNT} WHERE name = $1"),
            Identifier::Email(_) => format!("{SELECT_ACCOUNT} WHERE email = $1"),
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
            Identifier::Name(_) => "UPDATE users SET password = $1 WHERE name = $2",
            Identifier::Email(_) => "UPDATE users SET password = $1 WHERE email = $2",
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
        let result = sqlx::query("UPDATE users SET stamps = $1 WHERE name = $2")
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
        let row: Option<(String,)> = sqlx::query_as("SELECT stamps FROM users WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((raw,)) => Ok(stamps::decode_or_empty(name, &raw)),
            None => Err(StoreError::NotFound),
        }
    }
}
