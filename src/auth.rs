use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::Config,
    error::{AppError, AppResult},
    models::Role,
};

/// Roles allowed to act on other learners' certificates for a course.
pub const STAFF: &[Role] = &[Role::Instructor, Role::Admin, Role::SuperAdmin];
pub const ADMINS: &[Role] = &[Role::Admin, Role::SuperAdmin];

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Signs an access token. Login lives outside this service; this is used by
/// tooling and tests that need a caller identity.
pub fn issue_token(config: &Config, user_id: Uuid, role: Role) -> AppResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        role,
        iat: now.timestamp(),
        exp: (now + Duration::minutes(config.access_token_ttl_minutes)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| AppError::Invariant(format!("token signing failed: {}", e)))
}

pub fn validate_token(config: &Config, token: &str) -> AppResult<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| AppError::Unauthorized(format!("invalid token: {}", e)))
}

/// The authenticated identity behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn has_any(&self, allowed: &[Role]) -> bool {
        allowed.contains(&self.role)
    }

    pub fn require(&self, allowed: &[Role]) -> AppResult<()> {
        if self.has_any(allowed) {
            Ok(())
        } else {
            Err(AppError::Forbidden("not authorized for this operation".into()))
        }
    }

    /// Owners always pass; everyone else needs one of `allowed`.
    pub fn require_owner_or(&self, owner: Uuid, allowed: &[Role]) -> AppResult<()> {
        if self.user_id == owner {
            return Ok(());
        }
        self.require(allowed)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
    Arc<Config>: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::Unauthorized("missing bearer token".into()))?;

        let config = Arc::<Config>::from_ref(state);
        let claims = validate_token(&config, bearer.token())?;
        Ok(Caller {
            user_id: claims.sub,
            role: claims.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            database_url: "postgres://unused".into(),
            db_max_connections: 1,
            port: 0,
            jwt_secret: "test-secret-test-secret".into(),
            access_token_ttl_minutes: 5,
            certificate_prefix: "CERT".into(),
            max_body_bytes: 1024,
        }
    }

    #[test]
    fn issued_token_validates() {
        let cfg = config();
        let id = Uuid::new_v4();
        let token = issue_token(&cfg, id, Role::Instructor).unwrap();
        let claims = validate_token(&cfg, &token).unwrap();
        assert_eq!(claims.sub, id);
        assert_eq!(claims.role, Role::Instructor);
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let mut other = config();
        other.jwt_secret = "another-secret-entirely".into();
        let token = issue_token(&other, Uuid::new_v4(), Role::Learner).unwrap();
        let err = validate_token(&config(), &token).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn policy_checks_roles_and_ownership() {
        let learner = Caller { user_id: Uuid::new_v4(), role: Role::Learner };
        assert!(learner.require(STAFF).is_err());
        assert!(learner.require_owner_or(learner.user_id, ADMINS).is_ok());
        assert!(matches!(
            learner.require_owner_or(Uuid::new_v4(), ADMINS),
            Err(AppError::Forbidden(_))
        ));

        let instructor = Caller { user_id: Uuid::new_v4(), role: Role::Instructor };
        assert!(instructor.require(STAFF).is_ok());
        assert!(instructor.require(ADMINS).is_err());
    }
}
