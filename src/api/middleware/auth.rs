use actix_web::{dev::ServiceRequest, web, Error};
use actix_web_httpauth::extractors::bearer::{BearerAuth, Config};
use actix_web_httpauth::extractors::AuthenticationError;
use actix_web_httpauth::middleware::HttpAuthentication;
use sha2::{Digest, Sha256};
use std::future::{ready, Ready};

use crate::api::ApiState;

pub fn create_auth_middleware() -> HttpAuthentication<BearerAuth, fn(ServiceRequest, BearerAuth) -> Ready<Result<ServiceRequest, (Error, ServiceRequest)>>> {
    HttpAuthentication::bearer(validator)
}

fn validator(
    req: ServiceRequest,
    credentials: BearerAuth,
) -> Ready<Result<ServiceRequest, (Error, ServiceRequest)>> {
    let expected = req
        .app_data::<web::Data<ApiState>>()
        .and_then(|state| state.config.api_token.clone());

    match expected {
        Some(expected) if token_matches(credentials.token(), &expected) => ready(Ok(req)),
        _ => {
            tracing::warn!(path = %req.path(), "Rejected request with invalid bearer token");
            let config = Config::default().realm("einvoice");
            ready(Err((AuthenticationError::from(config).into(), req)))
        }
    }
}

// Compares digests so the check does not short-circuit on the first
// differing byte of the token.
fn token_matches(given: &str, expected: &str) -> bool {
    if given.is_empty() {
        return false;
    }
    Sha256::digest(given.as_bytes()) == Sha256::digest(expected.as_bytes())
}
