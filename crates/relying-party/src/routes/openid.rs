use std::borrow::Cow;

use axum::{
    Form, Json, Router,
    extract::{Path, Query, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};
use url::Url;
use utils::api::oidc::{
    DynamicProviderForm, FormFieldError, LoginPageResponse, OidcErrorResponse, ProfileResponse,
};
use uuid::Uuid;

use super::error::ErrorResponse;
use crate::{
    AppState,
    auth::User,
    oidc::{
        CallbackParams, OidcClient, OidcError,
        logout::{home_redirect, relay_end_session_response, select_post_logout_redirect_uri},
    },
    session::{Session, keys},
};

const MAX_HINT_LENGTH: usize = 250;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/openid/login", get(login_page).post(login_with_hint))
        .route("/openid/login/{op_name}", get(login_with_provider))
        .route("/openid/callback/login", get(login_callback))
        .route("/openid/logout", get(logout))
        .route("/openid/callback/logout", get(logout_callback))
        .route("/openid/me", get(profile))
}

#[derive(Debug, Deserialize)]
pub struct NextQuery {
    next: Option<String>,
}

pub async fn login_page(
    State(state): State<AppState>,
    session: Session,
    Query(query): Query<NextQuery>,
) -> Response {
    let next = remember_next(&state, &session, query.next.as_deref());
    Json(login_page_body(&state, next, Vec::new())).into_response()
}

pub async fn login_with_provider(
    State(state): State<AppState>,
    session: Session,
    Path(op_name): Path<String>,
    Query(query): Query<NextQuery>,
) -> Response {
    remember_next(&state, &session, query.next.as_deref());

    let Some(client) = state.clients().get(&op_name) else {
        return oidc_error_response(&OidcError::UnknownProvider(op_name), None);
    };

    session.insert(keys::OP, op_name);
    redirect_to_provider(&client, &session)
}

pub async fn login_with_hint(
    State(state): State<AppState>,
    session: Session,
    Query(query): Query<NextQuery>,
    Form(form): Form<DynamicProviderForm>,
) -> Response {
    let next = remember_next(&state, &session, query.next.as_deref());

    if !state.config().oidc.allow_dynamic_op {
        return Json(login_page_body(&state, next, Vec::new())).into_response();
    }

    let hint = form.hint.as_deref().map(str::trim).unwrap_or_default();
    let errors = validate_hint(hint);
    if !errors.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(login_page_body(&state, next, errors)),
        )
            .into_response();
    }

    match state.clients().dynamic_client(hint).await {
        Ok(client) => {
            session.insert(keys::OP, client.issuer());
            redirect_to_provider(&client, &session)
        }
        Err(error) => oidc_error_response(&error, None),
    }
}

pub async fn login_callback(
    State(state): State<AppState>,
    session: Session,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_callback_query(query.as_deref());

    let Some(op) = session.get_str(keys::OP) else {
        return oidc_error_response(&OidcError::MissingSessionValue(keys::OP), Some(params));
    };
    let Some(client) = state.clients().get(&op) else {
        return oidc_error_response(&OidcError::UnknownProvider(op), Some(params));
    };

    let userinfo = match client.callback(&params, &session).await {
        Ok(userinfo) => userinfo,
        Err(error) => return oidc_error_response(&error, Some(params)),
    };
    session.insert(keys::USERINFO, Value::Object(userinfo.clone()));

    match state.backend().authenticate(&userinfo).await {
        Ok(Some(user)) => {
            log_in(&state, &session, &user).await;
            let next = session.get_str(keys::NEXT).unwrap_or_else(|| "/".to_string());
            Redirect::to(&next).into_response()
        }
        Ok(None) => ErrorResponse::new(
            StatusCode::FORBIDDEN,
            "this login is not valid in this application",
        )
        .into_response(),
        Err(error) => {
            error!(?error, "failed to authenticate OpenID user");
            ErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error").into_response()
        }
    }
}

pub async fn logout(
    State(state): State<AppState>,
    session: Session,
    Query(query): Query<NextQuery>,
) -> Response {
    let public_base_url = &state.config().public_base_url;
    let requested_next = query
        .next
        .as_deref()
        .map(|next| sanitize_next(Some(next), public_base_url));

    let client = session.get_str(keys::OP).and_then(|op| {
        let client = state.clients().get(&op);
        if client.is_none() {
            warn!(%op, "session names an unknown OpenID provider; logging out locally");
        }
        client
    });

    let Some(client) = client else {
        session.flush();
        let target =
            requested_next.unwrap_or_else(|| state.config().oidc.logout_redirect_url.clone());
        return Redirect::to(&target).into_response();
    };

    let next_page = requested_next.or_else(|| session.get_str(keys::NEXT));
    let response = end_session(&client, &session, next_page.as_deref()).await;

    session.flush();
    if let Some(next_page) = next_page {
        session.insert(keys::NEXT, next_page);
    }
    response
}

pub async fn logout_callback(session: Session) -> Redirect {
    let next = session.get_str(keys::NEXT).unwrap_or_else(|| "/".to_string());
    Redirect::to(&next)
}

pub async fn profile(State(state): State<AppState>, session: Session) -> Response {
    let Some(user_id) = session
        .get_str(keys::AUTH_USER_ID)
        .and_then(|id| Uuid::parse_str(&id).ok())
    else {
        return ErrorResponse::new(StatusCode::UNAUTHORIZED, "not_authenticated").into_response();
    };

    match state.backend().get_user(user_id).await {
        Ok(Some(user)) => Json(ProfileResponse {
            user_id: user.id,
            username: user.username,
            first_name: user.first_name,
            last_name: user.last_name,
            email: user.email,
            last_login: user.last_login,
            op: session.get_str(keys::OP),
            userinfo: session.get(keys::USERINFO),
        })
        .into_response(),
        Ok(None) => {
            ErrorResponse::new(StatusCode::UNAUTHORIZED, "not_authenticated").into_response()
        }
        Err(error) => {
            error!(?error, %user_id, "failed to load user");
            ErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error").into_response()
        }
    }
}

async fn end_session(client: &OidcClient, session: &Session, next_page: Option<&str>) -> Response {
    let Some(state) = session.get_str(keys::STATE) else {
        warn!(issuer = %client.issuer(), "no authentication state in session; skipping end-session request");
        return home_redirect();
    };

    let post_logout_redirect_uri =
        select_post_logout_redirect_uri(client.post_logout_redirect_uris(), next_page);
    let id_token_hint = session.get_str(keys::ID_TOKEN_RAW);

    let result = match client
        .do_end_session_request(&state, post_logout_redirect_uri, id_token_hint.as_deref())
        .await
    {
        Ok(response) => relay_end_session_response(response).await,
        Err(error) => Err(error),
    };

    match result {
        Ok(response) => response,
        Err(error) => {
            warn!(issuer = %client.issuer(), %error, "end-session request failed");
            home_redirect()
        }
    }
}

async fn log_in(state: &AppState, session: &Session, user: &User) {
    session.cycle_id();
    session.insert(keys::AUTH_USER_ID, user.id.to_string());

    if let Err(error) = state.backend().record_login(user.id).await {
        warn!(?error, user_id = %user.id, "failed to record login");
    }

    utils::sentry::configure_user_scope(
        &user.id.to_string(),
        Some(&user.username),
        user.email.as_deref(),
    );
    info!(user_id = %user.id, username = %user.username, "user logged in");
}

fn redirect_to_provider(client: &OidcClient, session: &Session) -> Response {
    let url = client.create_authn_request(session);
    Redirect::to(url.as_str()).into_response()
}

fn remember_next(state: &AppState, session: &Session, next: Option<&str>) -> String {
    let next = sanitize_next(next, &state.config().public_base_url);
    session.insert(keys::NEXT, next.clone());
    next
}

fn login_page_body(state: &AppState, next: String, errors: Vec<FormFieldError>) -> LoginPageResponse {
    LoginPageResponse {
        op_list: state.clients().provider_names(),
        dynamic: state.config().oidc.allow_dynamic_op,
        next,
        errors,
    }
}

fn validate_hint(hint: &str) -> Vec<FormFieldError> {
    let message = if hint.is_empty() {
        "This field is required."
    } else if hint.chars().count() > MAX_HINT_LENGTH {
        "Ensure this value has at most 250 characters."
    } else {
        return Vec::new();
    };

    vec![FormFieldError {
        field: "hint".to_string(),
        message: message.to_string(),
    }]
}

fn parse_callback_query(query: Option<&str>) -> CallbackParams {
    let mut params = CallbackParams::new();
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

/// Keeps `next` when it stays on this site, otherwise falls back to `/`.
///
/// The result always fits in a `Location` header.
pub(crate) fn sanitize_next(next: Option<&str>, public_base_url: &str) -> String {
    let Some(next) = next.map(str::trim).filter(|next| !next.is_empty()) else {
        return "/".to_string();
    };

    if next.chars().any(char::is_control) {
        warn!(next, "ignoring next parameter with control characters");
        return "/".to_string();
    }

    if next.starts_with('/') && !next.starts_with("//") && !next.starts_with("/\\") {
        return next.to_string();
    }

    if let (Ok(url), Ok(base)) = (Url::parse(next), Url::parse(public_base_url)) {
        if url.origin() == base.origin() {
            return next.to_string();
        }
    }

    warn!(next, "ignoring off-site next parameter");
    "/".to_string()
}

fn oidc_error_response(error: &OidcError, callback: Option<CallbackParams>) -> Response {
    let (status, code) = classify_oidc_error(error);
    if status.is_server_error() {
        error!(%error, "OpenID request failed");
    } else {
        warn!(%error, "OpenID request rejected");
    }

    (
        status,
        Json(OidcErrorResponse {
            error: code.into_owned(),
            callback,
        }),
    )
        .into_response()
}

fn classify_oidc_error(error: &OidcError) -> (StatusCode, Cow<'_, str>) {
    match error {
        OidcError::UnknownProvider(_) => {
            (StatusCode::NOT_FOUND, Cow::Borrowed("unknown_provider"))
        }
        OidcError::MissingSessionValue(_) => {
            (StatusCode::BAD_REQUEST, Cow::Borrowed("invalid_session"))
        }
        OidcError::InvalidUrl { .. } => (StatusCode::BAD_REQUEST, Cow::Borrowed("invalid_url")),
        OidcError::Authentication { error, .. } if error == "access_denied" => {
            (StatusCode::FORBIDDEN, Cow::Borrowed("access_denied"))
        }
        OidcError::Authentication { error, .. } => {
            (StatusCode::BAD_REQUEST, Cow::Borrowed(error.as_str()))
        }
        OidcError::StateMismatch => (StatusCode::BAD_REQUEST, Cow::Borrowed("state_mismatch")),
        OidcError::MissingCode => (StatusCode::BAD_REQUEST, Cow::Borrowed("missing_code")),
        OidcError::Discovery { .. } => (StatusCode::BAD_GATEWAY, Cow::Borrowed("discovery_failed")),
        OidcError::WebFinger { .. } => (StatusCode::BAD_GATEWAY, Cow::Borrowed("webfinger_failed")),
        OidcError::Registration(_) => {
            (StatusCode::BAD_GATEWAY, Cow::Borrowed("registration_failed"))
        }
        OidcError::TokenExchange(_) => {
            (StatusCode::BAD_GATEWAY, Cow::Borrowed("token_exchange_failed"))
        }
        OidcError::MissingIdToken => (StatusCode::BAD_GATEWAY, Cow::Borrowed("missing_id_token")),
        OidcError::IdToken(_) => (StatusCode::BAD_GATEWAY, Cow::Borrowed("invalid_id_token")),
        OidcError::UserInfo(_) => (StatusCode::BAD_GATEWAY, Cow::Borrowed("userinfo_failed")),
        OidcError::EndSessionUnsupported | OidcError::Relay(_) | OidcError::Http(_) => {
            (StatusCode::BAD_GATEWAY, Cow::Borrowed("provider_error"))
        }
    }
}
