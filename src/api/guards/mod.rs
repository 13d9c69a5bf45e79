//! Request guards. Token issuance lives outside this service; the guard
//! only validates what an external issuer signed with the shared key.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use rocket::Request;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use serde::{Deserialize, Serialize};

use crate::AppContext;
use crate::api::GuardError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Expiry, unix seconds. Checked by `jsonwebtoken`'s validation.
    pub exp: u64,
    #[serde(default)]
    pub admin: bool,
}

/// Extract the token from the `jwt` cookie or an `Authorization: Bearer`
/// header, cookie first.
fn extract_token(req: &Request<'_>) -> Result<String> {
    if let Some(cookie) = req.cookies().get("jwt") {
        return Ok(cookie.value().to_string());
    }
    if let Some(header) = req.headers().get_one("Authorization") {
        return match header.strip_prefix("Bearer ") {
            Some(token) => Ok(token.to_string()),
            None => Err(anyhow!(
                "Authorization header format is invalid, expected 'Bearer <token>'"
            )),
        };
    }
    Err(anyhow!(
        "Request carries neither a jwt cookie nor an Authorization header"
    ))
}

fn validate_token(req: &Request<'_>) -> Result<Claims> {
    let context = req
        .rocket()
        .state::<Arc<AppContext>>()
        .ok_or_else(|| anyhow!("Application context is not managed"))?;

    let token = extract_token(req)?;
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(
        &token,
        &DecodingKey::from_secret(context.config.jwt_secret()),
        &validation,
    )
    .map_err(|err| anyhow::Error::from(err).context("Failed to decode JWT token"))?;

    if !data.claims.admin {
        return Err(anyhow!("Token does not carry the admin claim"));
    }
    Ok(data.claims)
}

/// Guard for the mutating endpoints (upload, delete).
pub struct GuardAuth;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for GuardAuth {
    type Error = GuardError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match validate_token(req) {
            Ok(_) => Outcome::Success(GuardAuth),
            Err(err) => Outcome::Error((
                Status::Unauthorized,
                GuardError {
                    status: Status::Unauthorized,
                    error: err.context("Authentication error"),
                },
            )),
        }
    }
}
