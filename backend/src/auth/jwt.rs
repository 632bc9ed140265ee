use jsonwebtoken::{decode, DecodingKey, TokenData as JwtTokenData, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,    // Subject (user ID)
    /// Approver groups the user belongs to
    #[serde(default)]
    pub groups: Vec<Uuid>,
    pub exp: i64,     // Expiration time
    pub iat: i64,     // Issued at
}

// Tokens are issued by the identity provider; the service only verifies them.
pub fn verify_jwt(token: &str, secret: &str) -> Result<JwtTokenData<Claims>, jsonwebtoken::errors::Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )
}

/// Issue a token the way the identity provider does, valid for 24 hours.
#[cfg(test)]
pub fn create_jwt(user_id: Uuid, groups: Vec<Uuid>, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        groups,
        exp: (now + Duration::hours(24)).timestamp(),
        iat: now.timestamp(),
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref()))
}
