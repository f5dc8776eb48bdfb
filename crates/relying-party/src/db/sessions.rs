use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, query, query_scalar, types::Json};

use crate::session::{SessionData, SessionError, SessionStore};

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Deletes expired sessions, returning how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, SessionError> {
        let result = query("DELETE FROM sessions WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn load(&self, id: &str) -> Result<Option<SessionData>, SessionError> {
        let data = query_scalar::<_, Json<SessionData>>(
            "SELECT data FROM sessions WHERE id = $1 AND expires_at > NOW()",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(data.map(|Json(data)| data))
    }

    async fn save(
        &self,
        id: &str,
        data: &SessionData,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        query(
            r#"
            INSERT INTO sessions (id, data, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET data = EXCLUDED.data,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(id)
        .bind(Json(data))
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SessionError> {
        query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
