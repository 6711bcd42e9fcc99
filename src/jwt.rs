use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::Principal;
use crate::errors::AppError;
use crate::models::user::User;
use crate::store;

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: Arc<Vec<u8>>,
    pub exp_hours: i64,
}

impl JwtConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let secret = std::env::var("JWT_SECRET").map_err(|_| AppError::configuration("JWT_SECRET not set"))?;
        let exp_hours = std::env::var("JWT_EXP_HOURS")
            .map(|val| val.parse::<i64>())
            .unwrap_or(Ok(24))
            .map_err(|_| AppError::configuration("JWT_EXP_HOURS must be a valid integer"))?;

        Ok(Self {
            secret: Arc::new(secret.into_bytes()),
            exp_hours,
        })
    }

    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        issued_at + Duration::hours(self.exp_hours)
    }

    pub fn encode(&self, user_id: Uuid, session_id: Uuid, issued_at: DateTime<Utc>) -> Result<String, AppError> {
        let claims = Claims {
            sub: user_id,
            sid: session_id,
            exp: self.expires_at(issued_at).timestamp() as usize,
            iat: issued_at.timestamp() as usize,
        };

        jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(&self.secret))
            .map_err(|err| AppError::token(err.to_string()))
    }

    pub fn decode(&self, token: &str) -> Result<Claims, AppError> {
        let mut validation = Validation::default();
        validation.validate_exp = true;

        jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map(|data| data.claims)
            .map_err(|err| AppError::token(err.to_string()))
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    /// Login session; revoked on logout.
    pub sid: Uuid,
    pub exp: usize,
    pub iat: usize,
}

/// Authenticated caller.
///
/// The session must still be live and the user not deleted. The system role
/// comes from the users row, never from the token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub session_id: Uuid,
}

impl AuthUser {
    pub fn user_id(&self) -> Uuid {
        self.user.id
    }

    pub fn principal(&self) -> Principal {
        Principal::new(self.user.id).with_system_role(self.user.system_role)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::not_authenticated("Authorization header missing"))?;

        let claims = state.jwt.decode(token)?;

        if !store::sessions::is_session_active(&state.pool, claims.sid, claims.sub).await? {
            return Err(AppError::not_authenticated("session expired or revoked"));
        }

        let user = store::users::find_by_id(&state.pool, claims.sub)
            .await?
            .ok_or_else(|| AppError::not_authenticated("user no longer exists"))?;

        Ok(AuthUser {
            user,
            session_id: claims.sid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> JwtConfig {
        JwtConfig {
            secret: Arc::new(b"test-secret".to_vec()),
            exp_hours: 1,
        }
    }

    #[test]
    fn token_carries_user_and_session() {
        let cfg = config();
        let (user_id, session_id) = (Uuid::new_v4(), Uuid::new_v4());
        let token = cfg.encode(user_id, session_id, Utc::now()).unwrap();

        let claims = cfg.decode(&token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.sid, session_id);
    }

    #[test]
    fn expired_token_is_rejected() {
        let cfg = config();
        let token = cfg
            .encode(Uuid::new_v4(), Uuid::new_v4(), Utc::now() - Duration::hours(3))
            .unwrap();
        assert!(matches!(cfg.decode(&token), Err(AppError::Token(_))));
    }
}
