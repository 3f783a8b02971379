//! Database layer: pool setup, projection writes and read queries.
//!
//! Writes are keyed by stable on-chain identifiers so that replaying any
//! event leaves the tables unchanged.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::info;

use crate::errors::{IndexerError, Result};
use crate::events::{CreditRecord, ProjectRecord, VerificationRecord};
use crate::status::{ProjectStatus, VerificationStatus};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Make sure the file is created if it doesn't exist yet.
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Projection writes
// ─────────────────────────────────────────────────────────

pub struct NewProject<'a> {
    pub id: &'a str,
    pub owner: &'a str,
    pub meta_uri: &'a str,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub image_url: Option<&'a str>,
    pub block_number: i64,
    pub tx_hash: Option<&'a str>,
}

/// Create a project in `Pending` state. Returns `false` if it already exists,
/// in which case nothing is written.
pub async fn insert_project(pool: &SqlitePool, project: &NewProject<'_>) -> Result<bool> {
    let rows_affected = sqlx::query(
        r#"
        INSERT INTO projects
            (id, owner, meta_uri, name, description, image_url, status, created_block, created_tx)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(project.id)
    .bind(project.owner)
    .bind(project.meta_uri)
    .bind(project.name)
    .bind(project.description)
    .bind(project.image_url)
    .bind(ProjectStatus::Pending.as_str())
    .bind(project.block_number)
    .bind(project.tx_hash)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected == 1)
}

pub async fn project_exists(pool: &SqlitePool, id: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM projects WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Set a project's status. Returns `false` when no row changed, either
/// because the project is absent or because it already has `status`.
pub async fn update_project_status(
    pool: &SqlitePool,
    id: &str,
    status: ProjectStatus,
) -> Result<bool> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE projects
        SET    status = ?2, updated_at = strftime('%s', 'now')
        WHERE  id = ?1 AND status <> ?2
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected == 1)
}

pub struct NewVerification<'a> {
    pub id: &'a str,
    pub project_id: &'a str,
    pub verifier: &'a str,
    pub claim_cid: &'a str,
    pub block_number: i64,
    pub tx_hash: Option<&'a str>,
}

/// Create a verification in `Submitted` state. Returns `false` if it already
/// exists, in which case nothing is written.
pub async fn insert_verification(
    pool: &SqlitePool,
    verification: &NewVerification<'_>,
) -> Result<bool> {
    let rows_affected = sqlx::query(
        r#"
        INSERT INTO verifications
            (id, project_id, verifier, claim_cid, status, submitted_block, submitted_tx)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(verification.id)
    .bind(verification.project_id)
    .bind(verification.verifier)
    .bind(verification.claim_cid)
    .bind(VerificationStatus::Submitted.as_str())
    .bind(verification.block_number)
    .bind(verification.tx_hash)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected == 1)
}

pub async fn find_verification<'e, E>(executor: E, id: &str) -> Result<Option<VerificationRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, VerificationRecord>(
        r#"
        SELECT id, project_id, verifier, claim_cid, status, outcome_data,
               submitted_block, submitted_tx, created_at, updated_at
        FROM   verifications
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Move a `Submitted` verification to its final status. Returns `false` if
/// the verification is not in `Submitted` state.
pub async fn resolve_verification<'e, E>(
    executor: E,
    id: &str,
    status: VerificationStatus,
    outcome_data: &str,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows_affected = sqlx::query(
        r#"
        UPDATE verifications
        SET    status = ?2, outcome_data = ?3, updated_at = strftime('%s', 'now')
        WHERE  id = ?1 AND status = ?4
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .bind(outcome_data)
    .bind(VerificationStatus::Submitted.as_str())
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows_affected == 1)
}

pub struct NewCredit<'a> {
    pub verification_id: &'a str,
    pub project_id: &'a str,
    pub amount: &'a str,
    pub block_number: i64,
    pub tx_hash: Option<&'a str>,
}

/// Mint the impact credit for a verification.
///
/// There is no upsert here: a second credit for the same verification is a
/// [`IndexerError::DuplicateCredit`] and nothing is overwritten.
pub async fn insert_credit<'e, E>(executor: E, credit: &NewCredit<'_>) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO impact_credits (verification_id, project_id, amount, tx_hash, block_number)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(credit.verification_id)
    .bind(credit.project_id)
    .bind(credit.amount)
    .bind(credit.tx_hash)
    .bind(credit.block_number)
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
            IndexerError::DuplicateCredit(credit.verification_id.to_string()),
        ),
        Err(e) => Err(e.into()),
    }
}

// ─────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────

const PROJECT_COLUMNS: &str = "id, owner, meta_uri, name, description, image_url, status, \
                               created_block, created_tx, created_at, updated_at";

/// All projects, newest registration first.
pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<ProjectRecord>> {
    let rows = sqlx::query_as::<_, ProjectRecord>(&format!(
        "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_block DESC, created_at DESC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_project(pool: &SqlitePool, id: &str) -> Result<Option<ProjectRecord>> {
    let row = sqlx::query_as::<_, ProjectRecord>(&format!(
        "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn verifications_for_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<VerificationRecord>> {
    let rows = sqlx::query_as::<_, VerificationRecord>(
        r#"
        SELECT id, project_id, verifier, claim_cid, status, outcome_data,
               submitted_block, submitted_tx, created_at, updated_at
        FROM   verifications
        WHERE  project_id = ?1
        ORDER  BY submitted_block ASC, id ASC
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn credits_for_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<CreditRecord>> {
    let rows = sqlx::query_as::<_, CreditRecord>(
        r#"
        SELECT verification_id, project_id, amount, tx_hash, block_number, created_at
        FROM   impact_credits
        WHERE  project_id = ?1
        ORDER  BY block_number ASC, verification_id ASC
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}
