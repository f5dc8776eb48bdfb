use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{Request, StatusCode, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use tracing::warn;

use super::Session;
use crate::AppState;

/// Loads the session named by the session cookie, hands it to the handler as
/// a request extension and persists whatever the handler changed.
pub async fn session_layer(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let config = &state.config().session;
    let store = state.sessions();

    let session = match jar.get(&config.cookie_name) {
        Some(cookie) => match store.load(cookie.value()).await {
            Ok(Some(data)) => Session::loaded(cookie.value().to_string(), data),
            Ok(None) => Session::new(),
            Err(error) => {
                warn!(?error, "failed to load session");
                Session::new()
            }
        },
        None => Session::new(),
    };

    req.extensions_mut().insert(session.clone());
    let response = next.run(req).await;

    let changes = session.take_changes();
    if let Some(stale_id) = changes.stale_id.as_deref() {
        if let Err(error) = store.delete(stale_id).await {
            warn!(?error, "failed to delete stale session");
        }
    }

    let mut jar = jar;
    if let Some((id, data)) = changes.save {
        match store.save(&id, &data, Utc::now() + config.cookie_age).await {
            Ok(()) => {
                let cookie = Cookie::build((config.cookie_name.clone(), id))
                    .path("/")
                    .http_only(true)
                    .same_site(SameSite::Lax)
                    .secure(config.cookie_secure);
                jar = jar.add(cookie);
            }
            Err(error) => warn!(?error, "failed to save session"),
        }
    } else if changes.clear_cookie {
        jar = jar.remove(Cookie::build(config.cookie_name.clone()).path("/"));
    }

    (jar, response).into_response()
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Session>().cloned().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "session layer is not installed",
        ))
    }
}
