// Admin authentication: bearer token -> auth provider user -> profile role

use std::collections::HashMap;
use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    body::{BoxBody, EitherBody},
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage, ResponseError,
};
use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::catalog::CatalogStore;
use crate::config::AppConfig;
use crate::error::UpstreamError;

pub const ADMIN_ROLE: &str = "admin";
pub const DEV_ADMIN_ID: &str = "dev-admin";

/// Resolves a bearer token to the auth provider's user id.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` when the token is unknown or expired.
    async fn user_id(&self, token: &str) -> Result<Option<String>, UpstreamError>;
}

/// Supabase Auth: `GET <url>/auth/v1/user` with the project key.
pub struct SupabaseIdentity {
    user_url: String,
    api_key: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct SupabaseUser {
    id: String,
}

impl SupabaseIdentity {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            user_url: format!("{}/auth/v1/user", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            http,
        })
    }
}

#[async_trait]
impl IdentityProvider for SupabaseIdentity {
    async fn user_id(&self, token: &str) -> Result<Option<String>, UpstreamError> {
        let resp = self
            .http
            .get(&self.user_url)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .await?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let user: SupabaseUser = resp
                    .json()
                    .await
                    .map_err(|e| UpstreamError::Decode(e.to_string()))?;
                Ok(Some(user.id))
            }
            s => Err(UpstreamError::from_status(s.as_u16(), &self.user_url, None)),
        }
    }
}

/// Fixed token table. With an empty table every token is rejected, which
/// leaves only the development fallback.
#[derive(Default)]
pub struct StaticIdentity {
    tokens: HashMap<String, String>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, user_id: &str) -> Self {
        self.tokens.insert(token.to_string(), user_id.to_string());
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn user_id(&self, token: &str) -> Result<Option<String>, UpstreamError> {
        Ok(self.tokens.get(token).cloned())
    }
}

/// Supabase when configured, otherwise a provider that rejects every token.
pub fn identity_from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn IdentityProvider>> {
    let key = config
        .supabase_anon_key
        .as_deref()
        .or(config.supabase_service_role_key.as_deref());
    match (config.supabase_url.as_deref(), key) {
        (Some(url), Some(key)) => Ok(Arc::new(SupabaseIdentity::new(url, key)?)),
        _ => {
            tracing::warn!("SUPABASE_URL not configured; admin tokens cannot be verified");
            Ok(Arc::new(StaticIdentity::new()))
        }
    }
}

/// Caller admitted to the admin scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminIdentity {
    pub user_id: String,
    pub fallback: bool,
}

#[derive(Clone)]
pub struct AdminGate {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn CatalogStore>,
    dev_fallback: bool,
}

impl AdminGate {
    pub fn new(identity: Arc<dyn IdentityProvider>, store: Arc<dyn CatalogStore>, dev_fallback: bool) -> Self {
        Self {
            identity,
            store,
            dev_fallback,
        }
    }

    pub async fn authorize(&self, token: Option<&str>) -> Result<AdminIdentity, ApiError> {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            if self.dev_fallback {
                return Ok(AdminIdentity {
                    user_id: DEV_ADMIN_ID.to_string(),
                    fallback: true,
                });
            }
            return Err(ApiError::Unauthorized("missing bearer token".to_string()));
        };
        let user_id = match self.identity.user_id(token).await {
            Ok(Some(id)) => id,
            Ok(None) => return Err(ApiError::Unauthorized("invalid or expired token".to_string())),
            Err(e) => {
                tracing::warn!(error = %e, "auth provider unavailable");
                return Err(ApiError::Unavailable("auth provider unavailable".to_string()));
            }
        };
        match self.store.resolve_profile_role(&user_id).await? {
            Some(role) if role == ADMIN_ROLE => Ok(AdminIdentity {
                user_id,
                fallback: false,
            }),
            _ => Err(ApiError::Forbidden),
        }
    }
}

fn bearer_token(req: &ServiceRequest) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Compare secrets without short-circuiting on the first differing byte.
pub fn tokens_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware admitting only admin profiles to the wrapped scope
pub struct AdminGuard {
    gate: AdminGate,
}

impl AdminGuard {
    pub fn new(gate: AdminGate) -> Self {
        Self { gate }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AdminGuard
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type InitError = ();
    type Transform = AdminGuardMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AdminGuardMiddleware {
            service: Rc::new(service),
            gate: self.gate.clone(),
        }))
    }
}

pub struct AdminGuardMiddleware<S> {
    service: Rc<S>,
    gate: AdminGate,
}

impl<S, B> Service<ServiceRequest> for AdminGuardMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let gate = self.gate.clone();
        Box::pin(async move {
            let token = bearer_token(&req);
            match gate.authorize(token.as_deref()).await {
                Ok(admin) => {
                    if admin.fallback {
                        tracing::debug!(path = %req.path(), "admin request admitted via development fallback");
                    }
                    req.extensions_mut().insert(admin);
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                }
                Err(denied) => {
                    tracing::info!(path = %req.path(), reason = %denied, "admin request rejected");
                    let response = denied.error_response().map_into_right_body();
                    Ok(req.into_response(response))
                }
            }
        })
    }
}
