use async_trait::async_trait;

use crate::application::repos::{PostsRepo, RepoError};
use crate::domain::entities::PostRecord;

use super::{PostgresRepositories, map_sqlx_error};

pub(super) const POST_COLUMNS: &str =
    "id, title, category, location, org_email, available_slots";

#[derive(sqlx::FromRow)]
pub(super) struct PostRow {
    pub id: i64,
    pub title: String,
    pub category: Option<String>,
    pub location: Option<String>,
    pub org_email: String,
    pub available_slots: i32,
}

impl From<PostRow> for PostRecord {
    fn from(row: PostRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            category: row.category,
            location: row.location,
            org_email: row.org_email,
            available_slots: row.available_slots,
        }
    }
}

#[async_trait]
impl PostsRepo for PostgresRepositories {
    async fn find_post(&self, id: i64) -> Result<Option<PostRecord>, RepoError> {
        let sql = format!("SELECT {POST_COLUMNS} FROM volunteer_posts WHERE id = $1");
        let row = sqlx::query_as::<_, PostRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(PostRecord::from))
    }

    async fn decrement_available_slots(&self, id: i64) -> Result<u64, RepoError> {
        let result = sqlx::query(
            "UPDATE volunteer_posts SET available_slots = available_slots - 1 \
             WHERE id = $1 AND available_slots > 0",
        )
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn increment_available_slots(&self, id: i64) -> Result<u64, RepoError> {
        let result = sqlx::query(
            "UPDATE volunteer_posts SET available_slots = available_slots + 1 WHERE id = $1",
        )
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn list_posts_of_org(&self, org_email: &str) -> Result<Vec<PostRecord>, RepoError> {
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM volunteer_posts \
             WHERE lower(org_email) = lower($1) ORDER BY id DESC"
        );
        let rows = sqlx::query_as::<_, PostRow>(&sql)
            .bind(org_email.trim())
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(PostRecord::from).collect())
    }
}
