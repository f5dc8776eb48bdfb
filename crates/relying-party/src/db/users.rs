use async_trait::async_trait;
use sqlx::{PgPool, query, query_as};
use uuid::Uuid;

use crate::auth::{OpenIdUserData, User, UserStore, UserStoreError};

#[derive(sqlx::FromRow)]
struct UpsertedUser {
    #[sqlx(flatten)]
    user: User,
    created: bool,
}

pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn update_or_create(&self, data: &OpenIdUserData) -> Result<(User, bool), UserStoreError> {
        // xmax is zero only for rows this statement inserted
        let row = query_as::<_, UpsertedUser>(
            r#"
            INSERT INTO users (id, username, first_name, last_name, email, last_login)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (username) DO UPDATE
            SET first_name = COALESCE(EXCLUDED.first_name, users.first_name),
                last_name  = COALESCE(EXCLUDED.last_name, users.last_name),
                email      = COALESCE(EXCLUDED.email, users.email),
                last_login = EXCLUDED.last_login,
                updated_at = NOW()
            RETURNING
                id, username, first_name, last_name, email, last_login,
                created_at, updated_at,
                (xmax = 0) AS created
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&data.username)
        .bind(&data.first_name)
        .bind(&data.last_name)
        .bind(&data.email)
        .bind(data.last_login)
        .fetch_one(&self.pool)
        .await?;

        Ok((row.user, row.created))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, UserStoreError> {
        let user = query_as::<_, User>(
            r#"
            SELECT id, username, first_name, last_name, email, last_login, created_at, updated_at
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, UserStoreError> {
        let user = query_as::<_, User>(
            r#"
            SELECT id, username, first_name, last_name, email, last_login, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn record_login(&self, id: Uuid) -> Result<(), UserStoreError> {
        let result = query("UPDATE users SET last_login = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(UserStoreError::NotFound);
        }
        Ok(())
    }
}
