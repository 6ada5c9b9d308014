use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{DecodingKey, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    error::AuthError,
    models::{Identity, Role},
    session::{RoleState, Session},
};

/// Claims
///
/// The payload of a hosted-backend access token. Only `sub` is used to identify the
/// visitor; `exp` and `aud` are checked on every decode.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user's id in `auth.users` and `public.profiles`.
    pub sub: Uuid,
    pub exp: usize,
    pub iat: usize,
    /// Always `"authenticated"` for signed-in users.
    pub aud: String,
}

/// Audience carried by tokens of signed-in users.
pub const AUTHENTICATED_AUDIENCE: &str = "authenticated";

/// Authenticator
///
/// The two questions the gate needs answered by the auth backend: who does this token
/// belong to, and what role does that user have.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn verify_token(&self, token: &str) -> Result<Identity, AuthError>;

    /// `Ok(None)` when the user has no profile or the profile has no role.
    async fn fetch_role(&self, identity: Identity, access_token: &str) -> Result<Option<Role>, AuthError>;
}

/// AuthState
///
/// Shared handle to the authenticator, pulled out of the application state via `FromRef`.
pub type AuthState = Arc<dyn Authenticator>;

/// SupabaseAuth
///
/// Verifies access tokens locally with the project's JWT secret and reads roles from
/// `public.profiles` through the REST gateway.
#[derive(Clone)]
pub struct SupabaseAuth {
    http: reqwest::Client,
    supabase_url: String,
    anon_key: String,
    decoding_key: DecodingKey,
}

#[derive(Deserialize)]
struct ProfileRoleRow {
    role: Option<String>,
}

impl SupabaseAuth {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            supabase_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        }
    }
}

#[async_trait]
impl Authenticator for SupabaseAuth {
    fn verify_token(&self, token: &str) -> Result<Identity, AuthError> {
        let mut validation = Validation::default();
        validation.validate_exp = true;
        validation.set_audience(&[AUTHENTICATED_AUDIENCE]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::InvalidToken("token expired".to_string()),
            _ => AuthError::InvalidToken(e.to_string()),
        })?;

        Ok(Identity {
            user_id: data.claims.sub,
        })
    }

    async fn fetch_role(&self, identity: Identity, access_token: &str) -> Result<Option<Role>, AuthError> {
        let url = format!("{}/rest/v1/profiles", self.supabase_url);
        let response = self
            .http
            .get(url)
            .query(&[
                ("select", "role".to_string()),
                ("id", format!("eq.{}", identity.user_id)),
            ])
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::RoleLookup(format!(
                "profiles lookup returned {}",
                response.status()
            )));
        }

        let rows = response
            .json::<Vec<ProfileRoleRow>>()
            .await
            .map_err(|e| AuthError::RoleLookup(e.to_string()))?;

        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.role)
            .and_then(|raw| Role::parse(&raw)))
    }
}

/// bearer_token
///
/// The token of an `Authorization: Bearer ...` header, if present.
pub fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// resolve_token
///
/// Resolves one request's credentials into a settled `Session`. Never fails: a missing
/// or invalid token is `Anonymous`, a failed role lookup is an authenticated session
/// whose role is `Failed` (which no admin check accepts).
pub async fn resolve_token(auth: &dyn Authenticator, token: Option<&str>) -> Session {
    let Some(token) = token else {
        return Session::Anonymous;
    };

    let identity = match auth.verify_token(token) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting access token, treating visitor as anonymous");
            return Session::Anonymous;
        }
    };

    let role = match auth.fetch_role(identity, token).await {
        Ok(role) => RoleState::Resolved(role),
        Err(e) => {
            tracing::warn!(user_id = %identity.user_id, error = %e, "role lookup failed");
            RoleState::Failed
        }
    };

    Session::Authenticated {
        user_id: identity.user_id,
        role,
    }
}

/// RequestSession Extractor Result
///
/// The settled session of the current request. Handlers behind the gate receive it
/// already resolved; public handlers may use it to personalise responses.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSession(pub Session);

/// RequestSession Extractor Implementation
///
/// Pulls the `Authenticator` from the application state and resolves the bearer token.
/// It never rejects: the gate, not the extractor, decides what an anonymous visitor gets.
impl<S> FromRequestParts<S> for RequestSession
where
    S: Send + Sync,
    AuthState: FromRef<S>,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        // The gate middleware may already have resolved this request.
        if let Some(resolved) = parts.extensions.get::<RequestSession>() {
            return Ok(resolved.clone());
        }
        let auth = AuthState::from_ref(state);
        let session = resolve_token(auth.as_ref(), bearer_token(parts)).await;
        Ok(RequestSession(session))
    }
}
