use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provider chooser returned by `GET /openid/login` when no provider was picked.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoginPageResponse {
    pub op_list: Vec<String>,
    pub dynamic: bool,
    pub next: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FormFieldError>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FormFieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DynamicProviderForm {
    pub hint: Option<String>,
}

/// Body of a failed authentication step. `callback` carries the query the OP
/// sent back, when the failure happened on the callback.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OidcErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProfileResponse {
    pub user_id: Uuid,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub last_login: Option<DateTime<Utc>>,
    pub op: Option<String>,
    pub userinfo: Option<serde_json::Value>,
}
