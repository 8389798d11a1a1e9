use async_trait::async_trait;

use crate::application::repos::{RepoError, VolunteersRepo};
use crate::domain::entities::VolunteerRecord;
use crate::domain::identity::VolunteerIdentity;

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct VolunteerRow {
    email: String,
    display_name: String,
}

impl TryFrom<VolunteerRow> for VolunteerRecord {
    type Error = RepoError;

    fn try_from(row: VolunteerRow) -> Result<Self, Self::Error> {
        let identity = VolunteerIdentity::parse(&row.email).map_err(|err| RepoError::Integrity {
            message: format!("stored volunteer email `{}` is invalid: {err}", row.email),
        })?;
        Ok(Self {
            identity,
            display_name: row.display_name,
        })
    }
}

#[async_trait]
impl VolunteersRepo for PostgresRepositories {
    async fn find_volunteer(
        &self,
        identity: &VolunteerIdentity,
    ) -> Result<Option<VolunteerRecord>, RepoError> {
        let row = sqlx::query_as::<_, VolunteerRow>(
            "SELECT email, display_name FROM volunteers WHERE lower(email) = $1",
        )
        .bind(identity.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(VolunteerRecord::try_from).transpose()
    }
}
