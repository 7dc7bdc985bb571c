use axum::http::{Request, header};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{Duration, Utc};
use famtask_shared::jwt::{self, JwtClaims};
use tracing::error;

use super::{AppError, AppState};
use crate::storage::models::User;
use tracing::Span;

/// How many days of inactivity before a session is considered expired.
const SESSION_IDLE_DAYS: i64 = 14;
/// How many days before mandatory re-login.
const TOKEN_TTL_DAYS: i64 = 30;

/// Authenticated actor identity, resolved by [`require_bearer`] and
/// stashed in request extensions for handlers and policy checks.
#[derive(Clone, Debug)]
pub struct AuthCtx {
    pub user_id: i32,
    pub username: String,
    pub jti: String,
}

pub async fn require_bearer(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let unauthorized = || Err(AppError::unauthorized());
    let header_val = match req.headers().get(header::AUTHORIZATION) {
        Some(v) => v,
        None => return unauthorized(),
    };
    let header_str = header_val.to_str().map_err(|_| AppError::unauthorized())?;
    let prefix = "Bearer ";
    if !header_str.starts_with(prefix) {
        return unauthorized();
    }
    let token = &header_str[prefix.len()..];

    let claims = match jwt::decode_and_verify(token, state.config.jwt_secret.as_bytes()) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error=%e, "auth: jwt decode failed");
            return unauthorized();
        }
    };

    let cutoff = Utc::now() - Duration::days(SESSION_IDLE_DAYS);
    match state
        .store
        .touch_session_with_cutoff(&claims.jti, cutoff.naive_utc())
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(
                jti = %claims.jti,
                username = %claims.sub,
                cutoff = %cutoff,
                "auth: session missing or expired (last_used_at < cutoff)"
            );
            return unauthorized();
        }
        Err(e) => {
            error!(jti = %claims.jti, error=%e, "auth: touch_session_with_cutoff failed");
            return Err(AppError::internal(e));
        }
    }

    // The user row must still exist; a deleted account invalidates its
    // tokens immediately.
    let user = match state
        .store
        .get_user(claims.uid)
        .await
        .map_err(AppError::internal)?
    {
        Some(u) => u,
        None => {
            tracing::warn!(uid = claims.uid, "auth: token for unknown user");
            return unauthorized();
        }
    };

    let auth = AuthCtx {
        user_id: user.id,
        username: user.username,
        jti: claims.jti,
    };
    Span::current().record("username", tracing::field::display(&auth.username));
    req.extensions_mut().insert(auth);
    Ok(next.run(req).await)
}

/// Mint a token for the user and record its session row.
pub async fn issue_jwt_for_user(state: &AppState, user: &User) -> Result<String, AppError> {
    let jti = uuid::Uuid::new_v4().to_string();
    let exp = (Utc::now() + Duration::days(TOKEN_TTL_DAYS)).timestamp();
    let claims = JwtClaims {
        sub: user.username.clone(),
        uid: user.id,
        jti: jti.clone(),
        exp,
    };

    state.store.create_session(&jti, user.id).await.map_err(|e| {
        error!(username = %user.username, error=%e, "login/register: create_session failed");
        AppError::internal(e)
    })?;
    let token = jwt::encode(&claims, state.config.jwt_secret.as_bytes()).map_err(|e| {
        error!(username = %user.username, error=%e, "login/register: jwt encode failed");
        AppError::internal(e)
    })?;
    Ok(token)
}
