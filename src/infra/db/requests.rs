use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{
    DecideRequestParams, DecisionOutcome, RepoError, RequestsRepo, WithdrawnRequest,
};
use crate::domain::entities::{NewSignupRequest, PostRecord, RequestSummary, SignupRequestRecord};
use crate::domain::identity::VolunteerIdentity;
use crate::domain::types::{Decision, RequestStatus};

use super::posts::{POST_COLUMNS, PostRow};
use super::{PostgresRepositories, map_sqlx_error};

const REQUEST_COLUMNS: &str = "id, post_id, volunteer_email, suggestion, status, requested_at";

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: i64,
    post_id: i64,
    volunteer_email: String,
    suggestion: String,
    status: RequestStatus,
    requested_at: OffsetDateTime,
}

impl TryFrom<RequestRow> for SignupRequestRecord {
    type Error = RepoError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            post_id: row.post_id,
            volunteer: parse_identity(&row.volunteer_email)?,
            suggestion: row.suggestion,
            status: row.status,
            requested_at: row.requested_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    request_id: i64,
    post_id: i64,
    post_title: String,
    org_email: String,
    category: Option<String>,
    location: Option<String>,
    status: RequestStatus,
    suggestion: String,
    requested_at: OffsetDateTime,
}

impl From<SummaryRow> for RequestSummary {
    fn from(row: SummaryRow) -> Self {
        Self {
            request_id: row.request_id,
            post_id: row.post_id,
            post_title: row.post_title,
            org_email: row.org_email,
            category: row.category,
            location: row.location,
            status: row.status,
            suggestion: row.suggestion,
            requested_at: row.requested_at,
        }
    }
}

fn parse_identity(email: &str) -> Result<VolunteerIdentity, RepoError> {
    VolunteerIdentity::parse(email).map_err(|err| RepoError::Integrity {
        message: format!("stored volunteer email `{email}` is invalid: {err}"),
    })
}

#[async_trait]
impl RequestsRepo for PostgresRepositories {
    async fn find_request(&self, id: i64) -> Result<Option<SignupRequestRecord>, RepoError> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM volunteer_requests WHERE id = $1");
        let row = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(SignupRequestRecord::try_from).transpose()
    }

    async fn insert_request(
        &self,
        params: NewSignupRequest,
    ) -> Result<SignupRequestRecord, RepoError> {
        let sql = format!(
            "INSERT INTO volunteer_requests (post_id, volunteer_email, suggestion, status, requested_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {REQUEST_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(params.post_id)
            .bind(params.volunteer.as_str())
            .bind(&params.suggestion)
            .bind(RequestStatus::Pending)
            .bind(params.requested_at)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        SignupRequestRecord::try_from(row)
    }

    async fn delete_request(&self, id: i64) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM volunteer_requests WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn withdraw_request(&self, id: i64) -> Result<Option<WithdrawnRequest>, RepoError> {
        let mut tx = self.begin().await?;

        let sql = format!(
            "DELETE FROM volunteer_requests WHERE id = $1 RETURNING {REQUEST_COLUMNS}"
        );
        let Some(row) = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
        else {
            return Ok(None);
        };
        let request = SignupRequestRecord::try_from(row)?;

        let slot_restored = if request.status == RequestStatus::Accepted {
            sqlx::query(
                "UPDATE volunteer_posts SET available_slots = available_slots + 1 WHERE id = $1",
            )
            .bind(request.post_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected()
                == 1
        } else {
            false
        };

        let org_email =
            sqlx::query_scalar::<_, String>("SELECT org_email FROM volunteer_posts WHERE id = $1")
                .bind(request.post_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(Some(WithdrawnRequest {
            request,
            org_email,
            slot_restored,
        }))
    }

    async fn decide_request(
        &self,
        params: DecideRequestParams,
    ) -> Result<DecisionOutcome, RepoError> {
        let mut tx = self.begin().await?;

        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM volunteer_requests WHERE id = $1 FOR UPDATE"
        );
        let Some(row) = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(params.request_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
        else {
            return Ok(DecisionOutcome::NotFound);
        };
        if !row.status.is_pending() {
            return Ok(DecisionOutcome::AlreadyDecided(row.status));
        }

        let post_sql =
            format!("SELECT {POST_COLUMNS} FROM volunteer_posts WHERE id = $1 FOR UPDATE");
        let Some(mut post) = sqlx::query_as::<_, PostRow>(&post_sql)
            .bind(row.post_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .map(PostRecord::from)
        else {
            return Ok(DecisionOutcome::NotFound);
        };

        if params.decision == Decision::Approve {
            if !post.has_open_slots() {
                return Ok(DecisionOutcome::NoSlots);
            }
            post.available_slots = sqlx::query_scalar::<_, i32>(
                "UPDATE volunteer_posts SET available_slots = available_slots - 1 \
                 WHERE id = $1 RETURNING available_slots",
            )
            .bind(post.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        let sql = format!(
            "UPDATE volunteer_requests SET status = $2 WHERE id = $1 RETURNING {REQUEST_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(params.request_id)
            .bind(params.decision.target_status())
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let request = SignupRequestRecord::try_from(updated)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(DecisionOutcome::Decided { request, post })
    }

    async fn list_requests_of_volunteer(
        &self,
        volunteer: &VolunteerIdentity,
    ) -> Result<Vec<RequestSummary>, RepoError> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT r.id AS request_id, r.post_id, p.title AS post_title, p.org_email, \
                    p.category, p.location, r.status, r.suggestion, r.requested_at \
             FROM volunteer_requests r \
             INNER JOIN volunteer_posts p ON p.id = r.post_id \
             WHERE r.volunteer_email = $1 \
             ORDER BY r.requested_at DESC, r.id DESC",
        )
        .bind(volunteer.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(RequestSummary::from).collect())
    }
}
