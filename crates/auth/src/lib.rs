use anyhow::Result;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use domain::UserId;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: usize,
    pub exp: usize,
    pub iss: Option<String>,
    pub aud: Option<String>,
}

/// Read JWT secret from env or return a default (dev only).
fn jwt_secret() -> String {
    std::env::var("AUTH_JWT_SECRET").unwrap_or_else(|_| "pulse-dev-secret".to_string())
}

/// Create a signed JWT (HS256) for `user` with ttl seconds.
pub fn create_jwt(user: UserId, ttl_secs: usize) -> Result<String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as usize;
    let claims = Claims {
        sub: user.to_string(),
        iat: now,
        exp: now + ttl_secs,
        iss: Some("pulse".to_string()),
        aud: Some("pulse-clients".to_string()),
    };
    let header = Header::default();
    let token = encode(&header, &claims, &EncodingKey::from_secret(jwt_secret().as_bytes()))?;
    Ok(token)
}

/// Verify a JWT and return its claims if valid.
pub fn verify_jwt(token: &str) -> Result<TokenData<Claims>> {
    // Use an explicit Validation that checks expiry and accepts the audience/issuer we mint.
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.set_audience(&["pulse-clients"]);
    validation.set_issuer(&["pulse"]);
    let data = decode::<Claims>(token, &DecodingKey::from_secret(jwt_secret().as_bytes()), &validation)?;
    Ok(data)
}

/// Verify a JWT and parse its subject as a user id.
pub fn user_from_token(token: &str) -> Result<UserId> {
    let data = verify_jwt(token)?;
    data.claims
        .sub
        .parse::<UserId>()
        .map_err(|_| anyhow::anyhow!("token subject is not a user id"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_and_verify_round_trip() -> Result<()> {
        let token = create_jwt(7, 3600)?;
        assert_eq!(user_from_token(&token)?, 7);
        Ok(())
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        assert!(user_from_token("not-a-token").is_err());
    }
}
