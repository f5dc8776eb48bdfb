use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::{User, UserStore, UserStoreError};

/// User attributes taken from the claims of a successful OpenID login.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenIdUserData {
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub last_login: DateTime<Utc>,
}

impl OpenIdUserData {
    /// Returns `None` when the claims carry no `sub`.
    pub fn from_claims(claims: &Map<String, Value>) -> Option<Self> {
        let claim = |name: &str| match claims.get(name) {
            Some(Value::String(value)) => Some(value.clone()),
            Some(Value::Number(value)) => Some(value.to_string()),
            _ => None,
        };
        let last_of = |names: &[&str]| names.iter().rev().find_map(|name| claim(name));

        let subject = claim("sub")?;

        Some(Self {
            username: claim("upn").unwrap_or(subject),
            first_name: last_of(&["first_name", "given_name", "christian_name"]),
            last_name: last_of(&["family_name", "last_name"]),
            email: claim("email"),
            last_login: Utc::now(),
        })
    }

    pub(crate) fn apply(&self, user: &mut User) {
        if let Some(first_name) = &self.first_name {
            user.first_name = Some(first_name.clone());
        }
        if let Some(last_name) = &self.last_name {
            user.last_name = Some(last_name.clone());
        }
        if let Some(email) = &self.email {
            user.email = Some(email.clone());
        }
        user.last_login = Some(self.last_login);
    }
}

/// Application hooks around an OpenID login.
#[async_trait]
pub trait LoginHooks: Send + Sync {
    /// Normalises the username taken from the claims before it is looked up.
    fn clean_username(&self, username: String) -> String {
        username
    }

    /// Runs once for every user created by a login. The returned user is
    /// the one that gets logged in.
    async fn configure_user(&self, user: User) -> Result<User, UserStoreError> {
        Ok(user)
    }
}

/// Hooks that leave usernames and new users untouched.
#[derive(Debug, Default)]
pub struct DefaultLoginHooks;

impl LoginHooks for DefaultLoginHooks {}

/// Maps OpenID claims onto local users.
pub struct OpenIdConnectBackend {
    users: Arc<dyn UserStore>,
    create_unknown_user: bool,
    hooks: Arc<dyn LoginHooks>,
}

impl OpenIdConnectBackend {
    pub fn new(users: Arc<dyn UserStore>, create_unknown_user: bool) -> Self {
        Self {
            users,
            create_unknown_user,
            hooks: Arc::new(DefaultLoginHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LoginHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub async fn authenticate(
        &self,
        claims: &Map<String, Value>,
    ) -> Result<Option<User>, UserStoreError> {
        let Some(mut data) = OpenIdUserData::from_claims(claims) else {
            debug!("claims carry no subject");
            return Ok(None);
        };
        data.username = self.hooks.clean_username(data.username);

        if self.create_unknown_user {
            let (mut user, created) = self.users.update_or_create(&data).await?;
            if created {
                info!(user_id = %user.id, username = %user.username, "created user from OpenID login");
                user = self.hooks.configure_user(user).await?;
            }
            return Ok(Some(user));
        }

        let user = self.users.find_by_username(&data.username).await?;
        if user.is_none() {
            debug!(username = %data.username, "unknown user and user creation is disabled");
        }
        Ok(user)
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>, UserStoreError> {
        self.users.find_by_id(id).await
    }

    pub async fn record_login(&self, id: Uuid) -> Result<(), UserStoreError> {
        self.users.record_login(id).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::auth::MemoryUserStore;

    fn claims(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn missing_subject_yields_nothing() {
        assert!(OpenIdUserData::from_claims(&claims(json!({"email": "a@b.c"}))).is_none());
    }

    #[test]
    fn upn_overrides_subject() {
        let data = OpenIdUserData::from_claims(&claims(json!({
            "sub": "248289761001",
            "upn": "jane@corp.example",
        })))
        .unwrap();
        assert_eq!(data.username, "jane@corp.example");
    }

    #[test]
    fn later_name_claims_take_precedence() {
        let data = OpenIdUserData::from_claims(&claims(json!({
            "sub": "1",
            "first_name": "J",
            "given_name": "Jane",
            "family_name": "Doe",
            "last_name": "Doe-Smith",
            "email": "jane@example.com",
        })))
        .unwrap();
        assert_eq!(data.first_name.as_deref(), Some("Jane"));
        assert_eq!(data.last_name.as_deref(), Some("Doe-Smith"));
        assert_eq!(data.email.as_deref(), Some("jane@example.com"));

        let data = OpenIdUserData::from_claims(&claims(json!({
            "sub": "1",
            "given_name": "Jane",
            "christian_name": "Janet",
        })))
        .unwrap();
        assert_eq!(data.first_name.as_deref(), Some("Janet"));
        assert!(data.last_name.is_none());
    }

    #[tokio::test]
    async fn creates_then_updates_user() {
        let store = Arc::new(MemoryUserStore::new());
        let backend = OpenIdConnectBackend::new(store.clone(), true);

        let first = backend
            .authenticate(&claims(json!({"sub": "42", "given_name": "Ada", "email": "ada@example.com"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.username, "42");
        assert!(first.last_login.is_some());

        let second = backend
            .authenticate(&claims(json!({"sub": "42", "family_name": "Lovelace"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.first_name.as_deref(), Some("Ada"));
        assert_eq!(second.last_name.as_deref(), Some("Lovelace"));
        assert_eq!(second.email.as_deref(), Some("ada@example.com"));
    }

    #[tokio::test]
    async fn unknown_user_is_rejected_when_creation_is_disabled() {
        let store = Arc::new(MemoryUserStore::new());
        let backend = OpenIdConnectBackend::new(store.clone(), false);
        let login = claims(json!({"sub": "42"}));

        assert!(backend.authenticate(&login).await.unwrap().is_none());

        OpenIdConnectBackend::new(store.clone(), true)
            .authenticate(&login)
            .await
            .unwrap();
        let user = backend.authenticate(&login).await.unwrap().unwrap();
        assert_eq!(user.username, "42");
    }

    #[derive(Default)]
    struct LowercaseHooks {
        configured: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LoginHooks for LowercaseHooks {
        fn clean_username(&self, username: String) -> String {
            username.to_lowercase()
        }

        async fn configure_user(&self, mut user: User) -> Result<User, UserStoreError> {
            self.configured.lock().unwrap().push(user.username.clone());
            user.first_name.get_or_insert_with(|| "New".to_string());
            Ok(user)
        }
    }

    #[tokio::test]
    async fn hooks_clean_username_and_configure_new_users_once() {
        let hooks = Arc::new(LowercaseHooks::default());
        let backend = OpenIdConnectBackend::new(Arc::new(MemoryUserStore::new()), true)
            .with_hooks(hooks.clone());

        let created = backend
            .authenticate(&claims(json!({"sub": "1", "upn": "Jane@Corp.Example"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.username, "jane@corp.example");
        assert_eq!(created.first_name.as_deref(), Some("New"));

        let again = backend
            .authenticate(&claims(json!({"sub": "1", "upn": "JANE@corp.example"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, created.id);
        assert_eq!(*hooks.configured.lock().unwrap(), vec!["jane@corp.example"]);
    }

    #[tokio::test]
    async fn cleaned_username_is_used_for_lookup() {
        let store = Arc::new(MemoryUserStore::new());
        OpenIdConnectBackend::new(store.clone(), true)
            .authenticate(&claims(json!({"sub": "alice"})))
            .await
            .unwrap();

        let backend = OpenIdConnectBackend::new(store, false)
            .with_hooks(Arc::new(LowercaseHooks::default()));
        let user = backend
            .authenticate(&claims(json!({"sub": "ALICE"})))
            .await
            .unwrap();
        assert_eq!(user.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn record_login_requires_existing_user() {
        let backend = OpenIdConnectBackend::new(Arc::new(MemoryUserStore::new()), true);
        assert!(matches!(
            backend.record_login(Uuid::new_v4()).await,
            Err(UserStoreError::NotFound)
        ));
    }
}
