use sqlx::Row;
use sqlx::postgres::PgPoolOptions;

use vhub::application::error::AppError;
use vhub::config::DatabaseSettings;
use vhub::infra::db::PostgresRepositories;
use vhub::infra::error::InfraError;

#[derive(Debug, Clone)]
struct AppliedMigration {
    version: i64,
    description: String,
}

/// Applies embedded migrations and prints the resulting migration history.
pub async fn apply(database: &DatabaseSettings) -> Result<(), AppError> {
    let database_url = database.url.as_deref().ok_or_else(|| {
        AppError::validation(
            "database url is required (provide --database-url or set VHUB__DATABASE__URL)",
        )
    })?;

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::migration(err.to_string()))?;

    let applied = fetch_applied(&pool).await?;
    for migration in &applied {
        println!("{:>6}  {}", migration.version, migration.description);
    }
    println!("{} migrations applied", applied.len());

    Ok(())
}

async fn fetch_applied(pool: &sqlx::PgPool) -> Result<Vec<AppliedMigration>, AppError> {
    let rows = sqlx::query("SELECT version, description FROM _sqlx_migrations ORDER BY version")
        .fetch_all(pool)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    rows.into_iter()
        .map(|row| {
            Ok(AppliedMigration {
                version: row
                    .try_get("version")
                    .map_err(|err| InfraError::database(err.to_string()))?,
                description: row
                    .try_get("description")
                    .map_err(|err| InfraError::database(err.to_string()))?,
            })
        })
        .collect()
}
