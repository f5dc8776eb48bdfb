use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::OpenIdUserData;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum UserStoreError {
    #[error("user not found")]
    NotFound,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Applies `data` to the user named `data.username`, creating it when
    /// missing. Attributes absent from `data` keep their stored values.
    /// The flag tells whether the user was created.
    async fn update_or_create(&self, data: &OpenIdUserData) -> Result<(User, bool), UserStoreError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, UserStoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, UserStoreError>;
    async fn record_login(&self, id: Uuid) -> Result<(), UserStoreError>;
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn update_or_create(&self, data: &OpenIdUserData) -> Result<(User, bool), UserStoreError> {
        let mut users = self.users.write().await;
        let now = Utc::now();

        if let Some(user) = users.values_mut().find(|user| user.username == data.username) {
            data.apply(user);
            user.updated_at = now;
            return Ok((user.clone(), false));
        }

        let mut user = User {
            id: Uuid::new_v4(),
            username: data.username.clone(),
            first_name: None,
            last_name: None,
            email: None,
            last_login: None,
            created_at: now,
            updated_at: now,
        };
        data.apply(&mut user);
        users.insert(user.id, user.clone());
        Ok((user, true))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, UserStoreError> {
        let users = self.users.read().await;
        Ok(users.values().find(|user| user.username == username).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, UserStoreError> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn record_login(&self, id: Uuid) -> Result<(), UserStoreError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(UserStoreError::NotFound)?;
        user.last_login = Some(Utc::now());
        Ok(())
    }
}
